//! HTTP route handlers.

pub mod admin;
pub mod orders;
pub mod webhooks;

use std::sync::Arc;

use axum::Router;

use crate::server::AppState;

/// Storefront-facing routes (webhook ingest and order status).
pub fn public_routes() -> Router<Arc<AppState>> {
    Router::new()
        .merge(webhooks::routes())
        .merge(orders::routes())
}

/// Operator routes (bearer-authenticated).
pub fn admin_routes() -> Router<Arc<AppState>> {
    admin::routes()
}
