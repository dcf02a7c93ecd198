use std::path::PathBuf;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_TLS_KEY: &str = "certs/key.pem";
pub const DEFAULT_TLS_CERT: &str = "certs/cert.pem";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://synapse.db";
pub const DEFAULT_JWT_SECRET: &str = "secret";
pub const DEFAULT_JWT_ALGORITHM: &str = "HS256";

/// Hub configuration, resolved once at startup.
/// Priority: CLI flag > environment variable > built-in default.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    /// PEM private key path.
    pub tls_key: PathBuf,
    /// PEM certificate chain path.
    pub tls_cert: PathBuf,
    /// Repository connection string, e.g. `sqlite://synapse.db`.
    pub database_url: String,
    /// Base64-encoded 32-byte token vault key.
    pub fernet_key: String,
    pub jwt_secret: String,
    pub jwt_algorithm: String,
    /// Explicit log filter; when unset, `debug` picks between debug and info.
    pub log_level: Option<String>,
    pub debug: bool,
}

impl HubConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// EnvFilter directive for the tracing subscriber.
    pub fn log_filter(&self) -> String {
        match &self.log_level {
            Some(level) if !level.is_empty() => level.clone(),
            _ if self.debug => "debug".to_string(),
            _ => "info".to_string(),
        }
    }
}

#[cfg(test)]
impl HubConfig {
    pub(crate) fn for_tests() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            tls_key: PathBuf::from(DEFAULT_TLS_KEY),
            tls_cert: PathBuf::from(DEFAULT_TLS_CERT),
            database_url: DEFAULT_DATABASE_URL.to_string(),
            fernet_key: String::new(),
            jwt_secret: "test-secret".to_string(),
            jwt_algorithm: DEFAULT_JWT_ALGORITHM.to_string(),
            log_level: None,
            debug: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_filter_precedence() {
        let mut config = HubConfig::for_tests();
        assert_eq!(config.log_filter(), "info");

        config.debug = true;
        assert_eq!(config.log_filter(), "debug");

        config.log_level = Some("synapsed=trace".to_string());
        assert_eq!(config.log_filter(), "synapsed=trace");
    }
}
