//! Applications & permissions store (SQLite via sqlx).
//!
//! Every public operation is best-effort: storage failures are logged here and
//! surfaced as `None` / empty / `false`, leaving the RPC handler to pick the
//! user-visible error code. Foreign keys are enforced so deleting an
//! application cascades to every permission it owns or is targeted by.

use anyhow::Result;
use serde_json::{json, Value};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::str::FromStr;
use tracing::{error, warn};
use uuid::Uuid;

use crate::rpc::RpcAction;

/// List queries give up after this long rather than parking a session task
/// on a wedged database file.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// ─── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApplicationRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub server_url: String,
    /// Stored in vault form: base64( nonce || ciphertext ). NULL when the
    /// application has no authentication token.
    pub auth_token: Option<String>,
    pub is_admin: bool,
    pub is_active: bool,
}

impl ApplicationRow {
    /// RPC-facing record shape. The stored token never leaves the hub.
    pub fn to_public_json(&self) -> Value {
        json!({
            "id": self.id,
            "name": self.name,
            "description": self.description,
            "server_url": self.server_url,
            "is_admin": self.is_admin,
            "is_active": self.is_active,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PermissionRow {
    pub id: String,
    pub owner_id: String,
    pub target_id: String,
    pub action: String,
    pub is_active: bool,
}

impl PermissionRow {
    pub fn to_json(&self) -> Value {
        json!({
            "id": self.id,
            "owner_id": self.owner_id,
            "target_id": self.target_id,
            "action": self.action,
            "is_active": self.is_active,
        })
    }
}

// ─── Inputs ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct NewApplication {
    pub name: String,
    pub description: Option<String>,
    pub server_url: String,
    /// Already in vault form when present.
    pub auth_token: Option<String>,
    pub is_admin: bool,
}

/// Whitelisted mutable fields. `None` means "leave unchanged".
#[derive(Debug, Clone, Default)]
pub struct ApplicationUpdate {
    pub description: Option<String>,
    pub server_url: Option<String>,
    pub auth_token: Option<String>,
    pub is_active: Option<bool>,
}

impl ApplicationUpdate {
    pub fn is_empty(&self) -> bool {
        self.description.is_none()
            && self.server_url.is_none()
            && self.auth_token.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplicationFilter {
    pub is_active: Option<bool>,
    pub is_admin: Option<bool>,
}

#[derive(Debug, Clone, Default)]
pub struct PermissionFilter {
    pub owner_id: Option<String>,
    pub target_id: Option<String>,
    pub action: Option<RpcAction>,
    pub is_active: Option<bool>,
}

// ─── Storage ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite://synapse.db`.
    pub async fn new(database_url: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .create_if_missing(true);

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        for sql in [include_str!("migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if !stmt.is_empty() {
                    sqlx::query(stmt).execute(pool).await?;
                }
            }
        }
        Ok(())
    }

    // ─── Applications ───────────────────────────────────────────────────────

    pub async fn find_application_by_id(&self, app_id: &str) -> Option<ApplicationRow> {
        let result = sqlx::query_as::<_, ApplicationRow>("SELECT * FROM applications WHERE id = ?")
            .bind(app_id)
            .fetch_optional(&self.pool)
            .await;
        match result {
            Ok(row) => row,
            Err(err) => {
                error!(app_id, err = %err, "application lookup failed");
                None
            }
        }
    }

    /// List applications matching `filter`, ordered by id. `limit <= 0` means
    /// no limit.
    pub async fn find_applications(
        &self,
        filter: &ApplicationFilter,
        skip: i64,
        limit: i64,
    ) -> Vec<ApplicationRow> {
        let mut sql = String::from("SELECT * FROM applications");
        let mut clauses: Vec<&str> = Vec::new();
        if filter.is_active.is_some() {
            clauses.push("is_active = ?");
        }
        if filter.is_admin.is_some() {
            clauses.push("is_admin = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY id LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, ApplicationRow>(&sql);
        if let Some(active) = filter.is_active {
            query = query.bind(active);
        }
        if let Some(admin) = filter.is_admin {
            query = query.bind(admin);
        }
        query = query.bind(if limit > 0 { limit } else { -1 }).bind(skip.max(0));

        match tokio::time::timeout(QUERY_TIMEOUT, query.fetch_all(&self.pool)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                error!(err = %err, "application listing failed");
                Vec::new()
            }
            Err(_) => {
                error!("application listing timed out");
                Vec::new()
            }
        }
    }

    pub async fn create_application(&self, fields: NewApplication) -> Option<ApplicationRow> {
        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO applications (id, name, description, server_url, auth_token, is_admin, is_active)
             VALUES (?, ?, ?, ?, ?, ?, 1)",
        )
        .bind(&id)
        .bind(&fields.name)
        .bind(&fields.description)
        .bind(&fields.server_url)
        .bind(&fields.auth_token)
        .bind(fields.is_admin)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            error!(err = %err, "application insert failed");
            return None;
        }
        self.find_application_by_id(&id).await
    }

    /// Apply the whitelisted updates. An empty update returns the existing
    /// record unchanged.
    pub async fn update_application(
        &self,
        app_id: &str,
        updates: ApplicationUpdate,
    ) -> Option<ApplicationRow> {
        if updates.is_empty() {
            return self.find_application_by_id(app_id).await;
        }

        let mut sets: Vec<&str> = Vec::new();
        if updates.description.is_some() {
            sets.push("description = ?");
        }
        if updates.server_url.is_some() {
            sets.push("server_url = ?");
        }
        if updates.auth_token.is_some() {
            sets.push("auth_token = ?");
        }
        if updates.is_active.is_some() {
            sets.push("is_active = ?");
        }
        let sql = format!("UPDATE applications SET {} WHERE id = ?", sets.join(", "));

        let mut query = sqlx::query(&sql);
        if let Some(description) = &updates.description {
            query = query.bind(description);
        }
        if let Some(server_url) = &updates.server_url {
            query = query.bind(server_url);
        }
        if let Some(auth_token) = &updates.auth_token {
            query = query.bind(auth_token);
        }
        if let Some(is_active) = updates.is_active {
            query = query.bind(is_active);
        }

        match query.bind(app_id).execute(&self.pool).await {
            Ok(result) if result.rows_affected() > 0 => self.find_application_by_id(app_id).await,
            Ok(_) => {
                warn!(app_id, "no application to update");
                None
            }
            Err(err) => {
                error!(app_id, err = %err, "application update failed");
                None
            }
        }
    }

    /// Delete an application. Permission rows referencing it go with it.
    pub async fn delete_application(&self, app_id: &str) -> bool {
        match sqlx::query("DELETE FROM applications WHERE id = ?")
            .bind(app_id)
            .execute(&self.pool)
            .await
        {
            Ok(result) if result.rows_affected() > 0 => true,
            Ok(_) => {
                warn!(app_id, "no application to delete");
                false
            }
            Err(err) => {
                error!(app_id, err = %err, "application delete failed");
                false
            }
        }
    }

    // ─── Permissions ────────────────────────────────────────────────────────

    pub async fn find_permission_by_id(&self, permission_id: &str) -> Option<PermissionRow> {
        let result =
            sqlx::query_as::<_, PermissionRow>("SELECT * FROM application_permissions WHERE id = ?")
                .bind(permission_id)
                .fetch_optional(&self.pool)
                .await;
        match result {
            Ok(row) => row,
            Err(err) => {
                error!(permission_id, err = %err, "permission lookup failed");
                None
            }
        }
    }

    pub async fn find_permissions(
        &self,
        filter: &PermissionFilter,
        skip: i64,
        limit: i64,
    ) -> Vec<PermissionRow> {
        let mut sql = String::from("SELECT * FROM application_permissions");
        let mut clauses: Vec<&str> = Vec::new();
        if filter.owner_id.is_some() {
            clauses.push("owner_id = ?");
        }
        if filter.target_id.is_some() {
            clauses.push("target_id = ?");
        }
        if filter.action.is_some() {
            clauses.push("action = ?");
        }
        if filter.is_active.is_some() {
            clauses.push("is_active = ?");
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY owner_id, target_id, action LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, PermissionRow>(&sql);
        if let Some(owner_id) = &filter.owner_id {
            query = query.bind(owner_id);
        }
        if let Some(target_id) = &filter.target_id {
            query = query.bind(target_id);
        }
        if let Some(action) = filter.action {
            query = query.bind(action.as_str());
        }
        if let Some(active) = filter.is_active {
            query = query.bind(active);
        }
        query = query.bind(if limit > 0 { limit } else { -1 }).bind(skip.max(0));

        match tokio::time::timeout(QUERY_TIMEOUT, query.fetch_all(&self.pool)).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                error!(err = %err, "permission listing failed");
                Vec::new()
            }
            Err(_) => {
                error!("permission listing timed out");
                Vec::new()
            }
        }
    }

    /// Create a permission edge, enforcing the relation invariants:
    /// no self-permission, no active reverse edge, both endpoints must exist,
    /// and the (owner, target, action) triple is unique.
    pub async fn grant_permission(
        &self,
        owner_id: &str,
        target_id: &str,
        action: RpcAction,
    ) -> Option<PermissionRow> {
        if owner_id == target_id {
            warn!(owner_id, action = %action, "permission grant rejected: self-permission");
            return None;
        }

        let reverse = self
            .find_permissions(
                &PermissionFilter {
                    owner_id: Some(target_id.to_string()),
                    target_id: Some(owner_id.to_string()),
                    action: Some(action),
                    is_active: Some(true),
                },
                0,
                1,
            )
            .await;
        if !reverse.is_empty() {
            warn!(
                owner_id,
                target_id,
                action = %action,
                "permission grant rejected: reverse permission exists"
            );
            return None;
        }

        if self.find_application_by_id(owner_id).await.is_none() {
            warn!(owner_id, "permission grant rejected: owner does not exist");
            return None;
        }
        if self.find_application_by_id(target_id).await.is_none() {
            warn!(target_id, "permission grant rejected: target does not exist");
            return None;
        }

        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO application_permissions (id, owner_id, target_id, action, is_active)
             VALUES (?, ?, ?, ?, 1)",
        )
        .bind(&id)
        .bind(owner_id)
        .bind(target_id)
        .bind(action.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => self.find_permission_by_id(&id).await,
            Err(err) => {
                warn!(
                    owner_id,
                    target_id,
                    action = %action,
                    err = %err,
                    "permission grant failed (duplicate or constraint violation)"
                );
                None
            }
        }
    }

    /// Remove a permission edge by its triple. Returns whether a row matched.
    pub async fn revoke_permission(
        &self,
        owner_id: &str,
        target_id: &str,
        action: RpcAction,
    ) -> bool {
        let result = sqlx::query(
            "DELETE FROM application_permissions WHERE owner_id = ? AND target_id = ? AND action = ?",
        )
        .bind(owner_id)
        .bind(target_id)
        .bind(action.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(r) if r.rows_affected() > 0 => true,
            Ok(_) => {
                warn!(owner_id, target_id, action = %action, "no permission to revoke");
                false
            }
            Err(err) => {
                error!(err = %err, "permission revoke failed");
                false
            }
        }
    }

    pub async fn revoke_permission_by_id(&self, permission_id: &str) -> bool {
        match sqlx::query("DELETE FROM application_permissions WHERE id = ?")
            .bind(permission_id)
            .execute(&self.pool)
            .await
        {
            Ok(r) if r.rows_affected() > 0 => true,
            Ok(_) => {
                warn!(permission_id, "no permission to revoke");
                false
            }
            Err(err) => {
                error!(permission_id, err = %err, "permission revoke failed");
                false
            }
        }
    }

    /// Applications authorized to observe `(target, action)`: owners of
    /// matching permissions, unioned with active admins. A null target yields
    /// the admin set alone.
    pub async fn find_authorized_applications(
        &self,
        target_id: Option<&str>,
        action: RpcAction,
        active_only: bool,
    ) -> Vec<ApplicationRow> {
        let fetch = async {
            match target_id {
                Some(target) => {
                    let mut sql = String::from(
                        "SELECT a.* FROM applications a
                         JOIN application_permissions p ON p.owner_id = a.id
                         WHERE p.target_id = ? AND p.action = ?",
                    );
                    if active_only {
                        sql.push_str(" AND p.is_active = 1");
                    }
                    sql.push_str(
                        " UNION SELECT * FROM applications WHERE is_admin = 1 AND is_active = 1",
                    );
                    sqlx::query_as::<_, ApplicationRow>(&sql)
                        .bind(target)
                        .bind(action.as_str())
                        .fetch_all(&self.pool)
                        .await
                }
                None => {
                    sqlx::query_as::<_, ApplicationRow>(
                        "SELECT * FROM applications WHERE is_admin = 1 AND is_active = 1",
                    )
                    .fetch_all(&self.pool)
                    .await
                }
            }
        };

        match tokio::time::timeout(QUERY_TIMEOUT, fetch).await {
            Ok(Ok(rows)) => rows,
            Ok(Err(err)) => {
                error!(
                    target_id = target_id.unwrap_or("<none>"),
                    action = %action,
                    err = %err,
                    "authorized application query failed"
                );
                Vec::new()
            }
            Err(_) => {
                error!(
                    target_id = target_id.unwrap_or("<none>"),
                    action = %action,
                    "authorized application query timed out"
                );
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn storage() -> Storage {
        // A pooled `sqlite::memory:` gives every connection its own database;
        // a scratch file keeps the pool coherent.
        let dir = tempfile::tempdir().unwrap().keep();
        let url = format!("sqlite://{}", dir.join("synapse.db").display());
        Storage::new(&url).await.unwrap()
    }

    async fn create(storage: &Storage, name: &str, is_admin: bool) -> ApplicationRow {
        storage
            .create_application(NewApplication {
                name: name.to_string(),
                description: Some(format!("{name} app")),
                server_url: format!("https://{name}.example.com"),
                auth_token: None,
                is_admin,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn application_crud_round_trip() {
        let storage = storage().await;
        let app = create(&storage, "alpha", false).await;
        assert!(app.is_active);
        assert!(!app.is_admin);

        let found = storage.find_application_by_id(&app.id).await.unwrap();
        assert_eq!(found.name, "alpha");

        let updated = storage
            .update_application(
                &app.id,
                ApplicationUpdate {
                    server_url: Some("https://alpha.internal".into()),
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.server_url, "https://alpha.internal");
        assert!(!updated.is_active);
        // untouched fields survive
        assert_eq!(updated.name, "alpha");

        assert!(storage.delete_application(&app.id).await);
        assert!(!storage.delete_application(&app.id).await);
        assert!(storage.find_application_by_id(&app.id).await.is_none());
    }

    #[tokio::test]
    async fn empty_update_returns_existing_record() {
        let storage = storage().await;
        let app = create(&storage, "alpha", false).await;
        let same = storage
            .update_application(&app.id, ApplicationUpdate::default())
            .await
            .unwrap();
        assert_eq!(same.id, app.id);
        assert_eq!(same.server_url, app.server_url);
    }

    #[tokio::test]
    async fn grant_rejects_self_permission() {
        let storage = storage().await;
        let app = create(&storage, "alpha", false).await;
        let granted = storage
            .grant_permission(&app.id, &app.id, RpcAction::OutboundRequest)
            .await;
        assert!(granted.is_none());
    }

    #[tokio::test]
    async fn grant_rejects_reverse_edge() {
        let storage = storage().await;
        let a = create(&storage, "alpha", false).await;
        let b = create(&storage, "beta", false).await;

        assert!(storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundRequest)
            .await
            .is_some());
        // (b, a) for the same action closes a cycle of two
        assert!(storage
            .grant_permission(&b.id, &a.id, RpcAction::OutboundRequest)
            .await
            .is_none());
        // a different action is an independent relation
        assert!(storage
            .grant_permission(&b.id, &a.id, RpcAction::OutboundNotification)
            .await
            .is_some());
    }

    #[tokio::test]
    async fn grant_rejects_duplicates_and_unknown_endpoints() {
        let storage = storage().await;
        let a = create(&storage, "alpha", false).await;
        let b = create(&storage, "beta", false).await;

        assert!(storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundResponse)
            .await
            .is_some());
        assert!(storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundResponse)
            .await
            .is_none());
        assert!(storage
            .grant_permission(
                &a.id,
                "00000000-0000-0000-0000-000000000000",
                RpcAction::OutboundResponse
            )
            .await
            .is_none());
    }

    #[tokio::test]
    async fn deleting_an_application_cascades_to_permissions() {
        let storage = storage().await;
        let a = create(&storage, "alpha", false).await;
        let b = create(&storage, "beta", false).await;

        storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundRequest)
            .await
            .unwrap();
        storage
            .grant_permission(&b.id, &a.id, RpcAction::InboundResponse)
            .await
            .unwrap();

        assert!(storage.delete_application(&a.id).await);
        let remaining = storage
            .find_permissions(&PermissionFilter::default(), 0, 0)
            .await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn authorized_applications_union_admins() {
        let storage = storage().await;
        let sender = create(&storage, "sender", false).await;
        let target = create(&storage, "target", false).await;
        let admin = create(&storage, "admin", true).await;
        let dormant = create(&storage, "dormant", true).await;
        storage
            .update_application(
                &dormant.id,
                ApplicationUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        storage
            .grant_permission(&sender.id, &target.id, RpcAction::OutboundRequest)
            .await
            .unwrap();

        let authorized: Vec<String> = storage
            .find_authorized_applications(Some(&target.id), RpcAction::OutboundRequest, true)
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();

        assert!(authorized.contains(&sender.id));
        assert!(authorized.contains(&admin.id));
        assert!(!authorized.contains(&dormant.id));
        assert!(!authorized.contains(&target.id));

        // null target: admins alone
        let authorized: Vec<String> = storage
            .find_authorized_applications(None, RpcAction::OutboundResponse, true)
            .await
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(authorized, vec![admin.id.clone()]);
    }

    #[tokio::test]
    async fn revoke_by_triple_and_by_id() {
        let storage = storage().await;
        let a = create(&storage, "alpha", false).await;
        let b = create(&storage, "beta", false).await;

        let p = storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundRequest)
            .await
            .unwrap();
        assert!(
            storage
                .revoke_permission(&a.id, &b.id, RpcAction::OutboundRequest)
                .await
        );
        assert!(
            !storage
                .revoke_permission(&a.id, &b.id, RpcAction::OutboundRequest)
                .await
        );
        assert!(storage.find_permission_by_id(&p.id).await.is_none());

        let p = storage
            .grant_permission(&a.id, &b.id, RpcAction::OutboundRequest)
            .await
            .unwrap();
        assert!(storage.revoke_permission_by_id(&p.id).await);
        assert!(!storage.revoke_permission_by_id(&p.id).await);
    }
}
