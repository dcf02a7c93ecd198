//! Token vault: symmetric encryption for stored authentication tokens.
//!
//! Cipher: ChaCha20-Poly1305 AEAD with a random 12-byte nonce per token.
//! Stored form: base64( nonce_12 || ciphertext ). The 32-byte key arrives
//! base64-encoded through `FERNET_KEY` at startup.

use anyhow::{anyhow, Context as _, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};

const NONCE_LEN: usize = 12;

pub struct TokenVault {
    cipher: ChaCha20Poly1305,
}

impl TokenVault {
    /// Build a vault from a base64-encoded 32-byte key.
    pub fn new(key_b64: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(key_b64.trim())
            .context("vault key is not valid base64")?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow!("vault key must decode to exactly 32 bytes"))?;
        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&bytes)),
        })
    }

    /// Encrypt a plaintext token into its stored form.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ct = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| anyhow!("token encryption failed"))?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ct);
        Ok(STANDARD.encode(out))
    }

    /// Decrypt a stored token back to plaintext.
    pub fn decrypt(&self, ciphertext_b64: &str) -> Result<String> {
        let data = STANDARD
            .decode(ciphertext_b64)
            .context("stored token is not valid base64")?;
        if data.len() < NONCE_LEN {
            return Err(anyhow!("stored token too short"));
        }
        let (nonce, ct) = data.split_at(NONCE_LEN);

        let pt = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| anyhow!("stored token did not decrypt under this key"))?;
        String::from_utf8(pt).context("decrypted token is not valid UTF-8")
    }

    /// Whether `s` is already in stored form: base64-decodes and decrypts
    /// under this vault's key. All failures are swallowed.
    pub fn is_encrypted(&self, s: &str) -> bool {
        self.decrypt(s).is_ok()
    }
}
