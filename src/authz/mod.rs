//! Authorization engine: who may observe a payload.
//!
//! The repository answers "which applications", the connection registry
//! answers "which of those are live right now". Admin applications are
//! implicitly authorized for every action on every target; the target itself
//! is never an implicit recipient of its own payloads.

use std::collections::HashSet;

use crate::registry::{ConnectionRegistry, ConnectionWriter};
use crate::rpc::RpcAction;
use crate::storage::Storage;

/// Application ids permitted to observe a payload classified by `action` and
/// optionally bound to `target_id`. A null target yields the admin set alone.
pub async fn authorized_app_ids(
    storage: &Storage,
    target_id: Option<&str>,
    action: RpcAction,
) -> HashSet<String> {
    storage
        .find_authorized_applications(target_id, action, true)
        .await
        .into_iter()
        .map(|app| app.id)
        .collect()
}

/// Every live writer bound to an authorized application, deduplicated.
pub async fn authorized_writers(
    storage: &Storage,
    registry: &ConnectionRegistry,
    target_id: Option<&str>,
    action: RpcAction,
) -> Vec<ConnectionWriter> {
    let app_ids = authorized_app_ids(storage, target_id, action).await;
    registry.writers_for_ids(app_ids.iter().map(String::as_str))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionClaims;
    use crate::registry::Connection;
    use crate::storage::NewApplication;

    async fn storage() -> Storage {
        let dir = tempfile::tempdir().unwrap().keep();
        let url = format!("sqlite://{}", dir.join("synapse.db").display());
        Storage::new(&url).await.unwrap()
    }

    async fn create(storage: &Storage, name: &str, is_admin: bool) -> String {
        storage
            .create_application(NewApplication {
                name: name.to_string(),
                server_url: format!("https://{name}.example.com"),
                is_admin,
                ..Default::default()
            })
            .await
            .unwrap()
            .id
    }

    fn connect(registry: &ConnectionRegistry, app_id: &str) -> Connection {
        let connection = Connection {
            app_id: app_id.to_string(),
            writer: ConnectionWriter::new("test", tokio::io::sink()),
            claims: SessionClaims {
                sub: app_id.to_string(),
                iat: 0,
                name: app_id.to_string(),
                is_admin: false,
            },
        };
        registry.add(connection.clone()).unwrap();
        connection
    }

    #[tokio::test]
    async fn composes_permissions_with_live_writers() {
        let storage = storage().await;
        let registry = ConnectionRegistry::new();

        let sender = create(&storage, "sender", false).await;
        let target = create(&storage, "target", false).await;
        let admin = create(&storage, "admin", true).await;
        let offline = create(&storage, "offline", false).await;

        storage
            .grant_permission(&sender, &target, RpcAction::OutboundNotification)
            .await
            .unwrap();
        storage
            .grant_permission(&offline, &target, RpcAction::OutboundNotification)
            .await
            .unwrap();

        let sender_conn = connect(&registry, &sender);
        let target_conn = connect(&registry, &target);
        let admin_first = connect(&registry, &admin);
        let admin_second = connect(&registry, &admin);
        // `offline` holds a permission but no live writer

        let ids =
            authorized_app_ids(&storage, Some(&target), RpcAction::OutboundNotification).await;
        assert!(ids.contains(&sender));
        assert!(ids.contains(&admin));
        assert!(ids.contains(&offline));
        assert!(!ids.contains(&target));

        let writers = authorized_writers(
            &storage,
            &registry,
            Some(&target),
            RpcAction::OutboundNotification,
        )
        .await;
        assert_eq!(writers.len(), 3);
        assert!(writers.contains(&sender_conn.writer));
        assert!(writers.contains(&admin_first.writer));
        assert!(writers.contains(&admin_second.writer));
        assert!(!writers.contains(&target_conn.writer));
    }

    #[tokio::test]
    async fn null_target_reaches_admins_only() {
        let storage = storage().await;
        let registry = ConnectionRegistry::new();

        let app = create(&storage, "plain", false).await;
        let admin = create(&storage, "admin", true).await;
        connect(&registry, &app);
        let admin_conn = connect(&registry, &admin);

        let writers =
            authorized_writers(&storage, &registry, None, RpcAction::OutboundResponse).await;
        assert_eq!(writers, vec![admin_conn.writer]);
    }
}
