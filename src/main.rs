use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::error;

use synapsed::{
    auth::TokenVerifier,
    config::{self, HubConfig},
    handlers,
    registry::ConnectionRegistry,
    server,
    storage::Storage,
    vault::TokenVault,
    AppContext,
};

#[derive(Parser)]
#[command(
    name = "synapsed",
    about = "Synapse — trust-brokered JSON-RPC 2.0 message hub",
    version
)]
struct Args {
    /// Bind address
    #[arg(long, env = "HOST", default_value = config::DEFAULT_HOST)]
    host: String,

    /// Bind port
    #[arg(long, env = "PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// PEM-encoded TLS private key path
    #[arg(long, env = "TLS_KEY", default_value = config::DEFAULT_TLS_KEY)]
    tls_key: PathBuf,

    /// PEM-encoded TLS certificate chain path
    #[arg(long, env = "TLS_CERT", default_value = config::DEFAULT_TLS_CERT)]
    tls_cert: PathBuf,

    /// Repository connection string
    #[arg(long, env = "DATABASE_URL", default_value = config::DEFAULT_DATABASE_URL)]
    database_url: String,

    /// Base64-encoded 32-byte token vault key
    #[arg(long, env = "FERNET_KEY")]
    fernet_key: String,

    /// JWT verification secret
    #[arg(long, env = "JWT_SECRET", default_value = config::DEFAULT_JWT_SECRET)]
    jwt_secret: String,

    /// JWT verification algorithm (HS256, HS384, HS512)
    #[arg(long, env = "JWT_ALGORITHM", default_value = config::DEFAULT_JWT_ALGORITHM)]
    jwt_algorithm: String,

    /// Log filter, e.g. "info" or "synapsed=debug"
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Shorthand for a debug-level log filter
    #[arg(long, env = "DEBUG", default_value_t = false)]
    debug: bool,
}

impl From<Args> for HubConfig {
    fn from(args: Args) -> Self {
        Self {
            host: args.host,
            port: args.port,
            tls_key: args.tls_key,
            tls_cert: args.tls_cert,
            database_url: args.database_url,
            fernet_key: args.fernet_key,
            jwt_secret: args.jwt_secret,
            jwt_algorithm: args.jwt_algorithm,
            log_level: args.log_level,
            debug: args.debug,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config: HubConfig = Args::parse().into();

    tracing_subscriber::fmt()
        .with_env_filter(config.log_filter())
        .compact()
        .init();

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("hub failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: HubConfig) -> Result<()> {
    let storage = Storage::new(&config.database_url)
        .await
        .context("repository initialization failed")?;
    let vault = TokenVault::new(&config.fernet_key).context("token vault initialization failed")?;
    let verifier = TokenVerifier::new(&config.jwt_secret, &config.jwt_algorithm)?;

    let ctx = Arc::new(AppContext {
        config: Arc::new(config),
        storage,
        vault: Arc::new(vault),
        verifier: Arc::new(verifier),
        registry: Arc::new(ConnectionRegistry::new()),
        dispatcher: Arc::new(handlers::build_registry()),
    });

    server::run(ctx).await
}
