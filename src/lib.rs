pub mod auth;
pub mod authz;
pub mod config;
pub mod dispatch;
pub mod emit;
pub mod handlers;
pub mod registry;
pub mod rpc;
pub mod server;
pub mod storage;
pub mod vault;

use std::sync::Arc;

use auth::TokenVerifier;
use config::HubConfig;
use dispatch::DispatchRegistry;
use registry::ConnectionRegistry;
use storage::Storage;
use vault::TokenVault;

/// Shared hub state handed to every session task and RPC handler.
pub struct AppContext {
    pub config: Arc<HubConfig>,
    pub storage: Storage,
    pub vault: Arc<TokenVault>,
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub dispatcher: Arc<DispatchRegistry>,
}

#[cfg(test)]
impl AppContext {
    /// Fresh context over a scratch database, for unit tests.
    pub(crate) async fn for_tests() -> Arc<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let dir = tempfile::tempdir().unwrap().keep();
        let database_url = format!("sqlite://{}", dir.join("synapse.db").display());

        Arc::new(Self {
            config: Arc::new(HubConfig::for_tests()),
            storage: Storage::new(&database_url).await.unwrap(),
            vault: Arc::new(TokenVault::new(&STANDARD.encode([42u8; 32])).unwrap()),
            verifier: Arc::new(TokenVerifier::new("test-secret", "HS256").unwrap()),
            registry: Arc::new(ConnectionRegistry::new()),
            dispatcher: Arc::new(handlers::build_registry()),
        })
    }
}
