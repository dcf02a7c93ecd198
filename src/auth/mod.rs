//! Session token verification.
//!
//! Connecting applications present a JWT in the `connect`/`register`
//! handshake. Verification is synchronous; the decoded claims travel with the
//! Connection for the life of the session and are never persisted.

use anyhow::{anyhow, Result};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Decoded JWT payload for an authenticated application session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Subject application id (UUID string).
    pub sub: String,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Display name.
    pub name: String,
    /// Admin sessions are implicitly authorized for every action.
    pub is_admin: bool,
}

pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    algorithm: Algorithm,
}

impl TokenVerifier {
    /// `algorithm` is the textual form from `JWT_ALGORITHM` ("HS256", …).
    pub fn new(secret: &str, algorithm: &str) -> Result<Self> {
        let algorithm: Algorithm = algorithm
            .parse()
            .map_err(|_| anyhow!("unsupported JWT algorithm: {algorithm}"))?;
        Ok(Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            algorithm,
        })
    }

    /// Decode and verify a token, returning its claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims> {
        let mut validation = Validation::new(self.algorithm);
        // Session tokens carry iat but no exp; expiry is not enforced here.
        validation.required_spec_claims.clear();
        validation.validate_exp = false;

        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &validation)?;
        Ok(data.claims)
    }

    /// Issue a token for the given claims. The hub itself only verifies;
    /// issuing exists for provisioning tooling and tests.
    pub fn issue(&self, claims: &SessionClaims) -> Result<String> {
        Ok(jsonwebtoken::encode(
            &Header::new(self.algorithm),
            claims,
            &self.encoding,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims() -> SessionClaims {
        SessionClaims {
            sub: "9f2c4e9a-8a7b-4f0e-b0d4-2f8c1a3b5d7e".into(),
            iat: chrono::Utc::now().timestamp(),
            name: "scheduler".into(),
            is_admin: false,
        }
    }

    #[test]
    fn issues_and_verifies() {
        let verifier = TokenVerifier::new("secret", "HS256").unwrap();
        let claims = claims();
        let token = verifier.issue(&claims).unwrap();
        assert_eq!(verifier.verify(&token).unwrap(), claims);
    }

    #[test]
    fn rejects_tampered_and_cross_key_tokens() {
        let verifier = TokenVerifier::new("secret", "HS256").unwrap();
        let other = TokenVerifier::new("other-secret", "HS256").unwrap();

        let token = verifier.issue(&claims()).unwrap();
        assert!(other.verify(&token).is_err());

        let mut tampered = token.clone();
        tampered.push('x');
        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn rejects_unknown_algorithm() {
        assert!(TokenVerifier::new("secret", "HS513").is_err());
    }
}
