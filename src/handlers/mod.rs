//! Built-in RPC handlers.
//!
//! Each module registers the methods it serves; [`build_registry`] is called
//! once at startup and the resulting table is frozen for the process
//! lifetime.

pub mod application;
pub mod connection;
pub mod permission;

use crate::dispatch::{handler, DispatchRegistry};

/// Populate the dispatch registry with every built-in method.
pub fn build_registry() -> DispatchRegistry {
    let mut registry = DispatchRegistry::new();

    // Handshake verbs. Both names resolve to the same handler.
    registry.register("connect", handler(connection::connect));
    registry.register("register", handler(connection::connect));

    registry.register("create_application", handler(application::create));
    registry.register("read_application", handler(application::read));
    registry.register("list_applications", handler(application::list));
    registry.register("update_application", handler(application::update));
    registry.register("delete_application", handler(application::delete));

    registry.register("grant_permission", handler(permission::grant));
    registry.register("revoke_permission", handler(permission::revoke));
    registry.register("check_has_permission", handler(permission::check));
    registry.register(
        "get_permissions_for_owner",
        handler(permission::list_for_owner),
    );
    registry.register(
        "get_permissions_for_target",
        handler(permission::list_for_target),
    );

    registry
}
