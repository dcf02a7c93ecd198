//! Application CRUD.
//!
//! Stored authentication tokens pass through the vault on the way in; the
//! record shape returned to callers never includes the token field.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

use crate::dispatch::{parse_params, CallContext, HandlerResult};
use crate::rpc::{
    RpcError, APPLICATION_CREATE_FAILED, APPLICATION_DELETE_FAILED, APPLICATION_NOT_FOUND,
    APPLICATION_UPDATE_FAILED,
};
use crate::storage::{ApplicationFilter, ApplicationUpdate, NewApplication};

/// Scheme and host are both mandatory.
fn validate_url(raw: &str) -> Result<(), String> {
    match Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => Ok(()),
        Ok(_) => Err(format!("URL has no host: {raw}")),
        Err(err) => Err(format!("Invalid URL format: {err}")),
    }
}

/// Encrypt a caller-supplied token unless it is already in vault form.
fn vault_token(cx: &CallContext, token: Option<String>, code: i32) -> Result<Option<String>, RpcError> {
    match token {
        Some(token) if !cx.app.vault.is_encrypted(&token) => cx
            .app
            .vault
            .encrypt(&token)
            .map(Some)
            .map_err(|_| RpcError::new(code, "Failed to encrypt authentication token")),
        other => Ok(other),
    }
}

#[derive(Deserialize)]
struct CreateParams {
    url: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    authentication_token: Option<String>,
    #[serde(default)]
    is_admin: bool,
}

pub async fn create(params: Value, cx: CallContext) -> HandlerResult {
    let p: CreateParams = parse_params(params)?;
    validate_url(&p.url).map_err(|detail| RpcError::new(APPLICATION_CREATE_FAILED, detail))?;
    let auth_token = vault_token(&cx, p.authentication_token, APPLICATION_CREATE_FAILED)?;

    let created = cx
        .app
        .storage
        .create_application(NewApplication {
            name: p.name.unwrap_or_default(),
            description: p.description,
            server_url: p.url,
            auth_token,
            is_admin: p.is_admin,
        })
        .await
        .ok_or_else(|| RpcError::new(APPLICATION_CREATE_FAILED, "Failed to create application"))?;

    Ok(created.to_public_json())
}

#[derive(Deserialize)]
struct IdParams {
    id: String,
}

pub async fn read(params: Value, cx: CallContext) -> HandlerResult {
    let p: IdParams = parse_params(params)?;
    cx.app
        .storage
        .find_application_by_id(&p.id)
        .await
        .map(|app| app.to_public_json())
        .ok_or_else(|| {
            RpcError::new(
                APPLICATION_NOT_FOUND,
                format!("Application '{}' not found", p.id),
            )
        })
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    skip: i64,
    #[serde(default)]
    limit: i64,
}

pub async fn list(params: Value, cx: CallContext) -> HandlerResult {
    let p: ListParams = parse_params(params)?;
    let filter = ApplicationFilter {
        is_active: p.active_only.then_some(true),
        is_admin: None,
    };
    let apps: Vec<Value> = cx
        .app
        .storage
        .find_applications(&filter, p.skip, p.limit)
        .await
        .iter()
        .map(|app| app.to_public_json())
        .collect();
    Ok(json!(apps))
}

#[derive(Deserialize)]
struct UpdateParams {
    id: String,
    #[serde(default)]
    updates: Map<String, Value>,
}

/// Only `{url, description, is_active, authentication_token}` may change;
/// unknown fields are silently dropped. An empty update reads back the
/// existing record.
pub async fn update(params: Value, cx: CallContext) -> HandlerResult {
    let p: UpdateParams = parse_params(params)?;

    let mut updates = ApplicationUpdate::default();
    for (field, value) in &p.updates {
        match (field.as_str(), value) {
            ("url", Value::String(url)) => {
                validate_url(url)
                    .map_err(|detail| RpcError::new(APPLICATION_UPDATE_FAILED, detail))?;
                updates.server_url = Some(url.clone());
            }
            ("description", Value::String(description)) => {
                updates.description = Some(description.clone());
            }
            ("is_active", Value::Bool(active)) => updates.is_active = Some(*active),
            ("authentication_token", Value::String(token)) => {
                updates.auth_token =
                    vault_token(&cx, Some(token.clone()), APPLICATION_UPDATE_FAILED)?;
            }
            ("url" | "description" | "is_active" | "authentication_token", _) => {
                return Err(RpcError::invalid_params(format!(
                    "wrong type for field '{field}'"
                )));
            }
            _ => {} // not in the whitelist
        }
    }

    cx.app
        .storage
        .update_application(&p.id, updates)
        .await
        .map(|app| app.to_public_json())
        .ok_or_else(|| RpcError::new(APPLICATION_UPDATE_FAILED, "Failed to update application"))
}

pub async fn delete(params: Value, cx: CallContext) -> HandlerResult {
    let p: IdParams = parse_params(params)?;
    if cx.app.storage.delete_application(&p.id).await {
        Ok(json!({ "success": true }))
    } else {
        Err(RpcError::new(
            APPLICATION_DELETE_FAILED,
            "Failed to delete application",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CallContext;
    use crate::registry::ConnectionWriter;
    use crate::rpc::INVALID_PARAMS;

    async fn cx() -> CallContext {
        CallContext {
            app: crate::AppContext::for_tests().await,
            writer: ConnectionWriter::new("test", tokio::io::sink()),
            claims: None,
        }
    }

    #[tokio::test]
    async fn create_requires_scheme_and_host() {
        let cx = cx().await;
        for bad in ["", "not a url", "mailto:x@example.com", "/relative/path"] {
            let err = create(json!({ "url": bad }), cx.clone()).await.unwrap_err();
            assert_eq!(err.code, APPLICATION_CREATE_FAILED, "url: {bad}");
        }

        let created = create(
            json!({ "url": "https://svc.example.com", "name": "svc" }),
            cx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(created["name"], "svc");
        assert_eq!(created["is_active"], true);
    }

    #[tokio::test]
    async fn create_encrypts_token_and_omits_it_from_output() {
        let cx = cx().await;
        let created = create(
            json!({
                "url": "https://svc.example.com",
                "authentication_token": "plain-secret"
            }),
            cx.clone(),
        )
        .await
        .unwrap();
        assert!(created.get("auth_token").is_none());
        assert!(created.get("authentication_token").is_none());

        let id = created["id"].as_str().unwrap();
        let stored = cx.app.storage.find_application_by_id(id).await.unwrap();
        let stored_token = stored.auth_token.unwrap();
        assert_ne!(stored_token, "plain-secret");
        assert_eq!(cx.app.vault.decrypt(&stored_token).unwrap(), "plain-secret");
    }

    #[tokio::test]
    async fn read_unknown_application_is_32001() {
        let cx = cx().await;
        let err = read(json!({ "id": "missing" }), cx).await.unwrap_err();
        assert_eq!(err.code, APPLICATION_NOT_FOUND);
    }

    #[tokio::test]
    async fn list_filters_inactive_applications() {
        let cx = cx().await;
        let a = create(json!({ "url": "https://a.example.com" }), cx.clone())
            .await
            .unwrap();
        let b = create(json!({ "url": "https://b.example.com" }), cx.clone())
            .await
            .unwrap();
        update(
            json!({ "id": b["id"], "updates": { "is_active": false } }),
            cx.clone(),
        )
        .await
        .unwrap();

        let all = list(json!({}), cx.clone()).await.unwrap();
        assert_eq!(all.as_array().unwrap().len(), 2);

        let active = list(json!({ "active_only": true }), cx.clone()).await.unwrap();
        let active = active.as_array().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0]["id"], a["id"]);
    }

    #[tokio::test]
    async fn update_whitelists_fields() {
        let cx = cx().await;
        let created = create(
            json!({ "url": "https://svc.example.com", "name": "svc" }),
            cx.clone(),
        )
        .await
        .unwrap();
        let id = created["id"].as_str().unwrap();

        // unknown and non-whitelisted fields are silently dropped
        let updated = update(
            json!({
                "id": id,
                "updates": {
                    "description": "fresh",
                    "name": "renamed",
                    "is_admin": true,
                    "bogus": 1
                }
            }),
            cx.clone(),
        )
        .await
        .unwrap();
        assert_eq!(updated["description"], "fresh");
        assert_eq!(updated["name"], "svc");
        assert_eq!(updated["is_admin"], false);

        // empty update returns the record unchanged
        let same = update(json!({ "id": id, "updates": {} }), cx.clone())
            .await
            .unwrap();
        assert_eq!(same, updated);

        // wrong type on a whitelisted field is a params error
        let err = update(
            json!({ "id": id, "updates": { "is_active": "yes" } }),
            cx.clone(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        // unknown id fails with the update code
        let err = update(
            json!({ "id": "missing", "updates": { "description": "x" } }),
            cx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, APPLICATION_UPDATE_FAILED);
    }

    #[tokio::test]
    async fn delete_reports_32003_when_missing() {
        let cx = cx().await;
        let created = create(json!({ "url": "https://svc.example.com" }), cx.clone())
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        assert!(delete(json!({ "id": id }), cx.clone()).await.is_ok());
        let err = delete(json!({ "id": id }), cx).await.unwrap_err();
        assert_eq!(err.code, APPLICATION_DELETE_FAILED);
    }
}
