//! Permission grant / revoke / introspection.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::{parse_params, CallContext, HandlerResult};
use crate::rpc::{
    RpcAction, RpcError, INVALID_ACTION, PERMISSION_GRANT_FAILED, PERMISSION_REVOKE_FAILED,
};
use crate::storage::PermissionFilter;

fn parse_action(raw: &str) -> Result<RpcAction, RpcError> {
    RpcAction::parse(raw)
        .ok_or_else(|| RpcError::new(INVALID_ACTION, format!("Invalid action: {raw}")))
}

#[derive(Deserialize)]
struct TripleParams {
    owner_id: String,
    target_id: String,
    action: String,
}

pub async fn grant(params: Value, cx: CallContext) -> HandlerResult {
    let p: TripleParams = parse_params(params)?;
    let action = parse_action(&p.action)?;

    cx.app
        .storage
        .grant_permission(&p.owner_id, &p.target_id, action)
        .await
        .map(|permission| permission.to_json())
        .ok_or_else(|| RpcError::new(PERMISSION_GRANT_FAILED, "Failed to grant permission"))
}

/// Revocation accepts either a `permission_id` or the full
/// (owner_id, target_id, action) triple.
#[derive(Deserialize)]
struct RevokeParams {
    #[serde(default)]
    permission_id: Option<String>,
    #[serde(default)]
    owner_id: Option<String>,
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    action: Option<String>,
}

pub async fn revoke(params: Value, cx: CallContext) -> HandlerResult {
    let p: RevokeParams = parse_params(params)?;

    let revoked = match p {
        RevokeParams {
            permission_id: Some(permission_id),
            ..
        } => cx.app.storage.revoke_permission_by_id(&permission_id).await,
        RevokeParams {
            owner_id: Some(owner_id),
            target_id: Some(target_id),
            action: Some(action),
            ..
        } => {
            let action = parse_action(&action)?;
            cx.app
                .storage
                .revoke_permission(&owner_id, &target_id, action)
                .await
        }
        _ => {
            return Err(RpcError::invalid_params(
                "expected permission_id or owner_id/target_id/action",
            ))
        }
    };

    if revoked {
        Ok(json!({ "success": true }))
    } else {
        Err(RpcError::new(
            PERMISSION_REVOKE_FAILED,
            "Failed to revoke permission",
        ))
    }
}

#[derive(Deserialize)]
struct CheckParams {
    owner_id: String,
    target_id: String,
    action: String,
    #[serde(default = "default_active_only")]
    active_only: bool,
}

fn default_active_only() -> bool {
    true
}

/// Explicit permission rows only; admin subsumption applies to fan-out, not
/// to this introspection call.
pub async fn check(params: Value, cx: CallContext) -> HandlerResult {
    let p: CheckParams = parse_params(params)?;
    let action = parse_action(&p.action)?;

    let filter = PermissionFilter {
        owner_id: Some(p.owner_id),
        target_id: Some(p.target_id),
        action: Some(action),
        is_active: p.active_only.then_some(true),
    };
    let matches = cx.app.storage.find_permissions(&filter, 0, 1).await;
    Ok(json!({ "has_permission": !matches.is_empty() }))
}

#[derive(Deserialize)]
struct OwnerParams {
    owner_id: String,
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    skip: i64,
    #[serde(default)]
    limit: i64,
}

pub async fn list_for_owner(params: Value, cx: CallContext) -> HandlerResult {
    let p: OwnerParams = parse_params(params)?;
    let filter = PermissionFilter {
        owner_id: Some(p.owner_id),
        is_active: p.active_only.then_some(true),
        ..Default::default()
    };
    let permissions: Vec<Value> = cx
        .app
        .storage
        .find_permissions(&filter, p.skip, p.limit)
        .await
        .iter()
        .map(|permission| permission.to_json())
        .collect();
    Ok(json!(permissions))
}

#[derive(Deserialize)]
struct TargetParams {
    target_id: String,
    #[serde(default)]
    active_only: bool,
    #[serde(default)]
    skip: i64,
    #[serde(default)]
    limit: i64,
}

pub async fn list_for_target(params: Value, cx: CallContext) -> HandlerResult {
    let p: TargetParams = parse_params(params)?;
    let filter = PermissionFilter {
        target_id: Some(p.target_id),
        is_active: p.active_only.then_some(true),
        ..Default::default()
    };
    let permissions: Vec<Value> = cx
        .app
        .storage
        .find_permissions(&filter, p.skip, p.limit)
        .await
        .iter()
        .map(|permission| permission.to_json())
        .collect();
    Ok(json!(permissions))
}
