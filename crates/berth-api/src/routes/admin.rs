//! Operator routes.
//!
//! Everything here sits behind the admin bearer token. Responses may carry
//! internal detail (panel server ids, failure messages) that the public
//! order route deliberately withholds.
//!
//! ## Routes
//!
//! - `GET  /admin/nodes` - Fleet capacity view
//! - `POST /admin/nodes/{id}/allocations/reset` - Rebuild a node's allocation pool
//! - `POST /admin/orders/{id}/retry` - Force another provisioning attempt
//! - `POST /servers/{identifier}/power` - Forward a power signal to the panel

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use berth_core::{NodeId, OrderId};
use berth_provision::instance::InstanceState;
use berth_provision::order::{OrderStatus, TransitionReason};
use berth_provision::panel::PowerSignal;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// One node in the fleet capacity view.
#[derive(Debug, Serialize)]
pub struct NodeCapacityView {
    /// Fleet row id.
    pub id: NodeId,
    /// Operator-facing name.
    pub name: String,
    /// Region this node serves.
    pub region: String,
    /// The remote panel's numeric id for this node.
    pub pterodactyl_node_id: u32,
    /// Whether placement considers this node.
    pub enabled: bool,
    /// Memory available to server instances, in MB.
    pub usable_mb: u32,
    /// Memory held by live (reserved or active) instances, in MB.
    pub used_mb: u32,
    /// Memory still placeable, in MB.
    pub available_mb: u32,
    /// When the health probe last saw this node reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Fleet capacity response.
#[derive(Debug, Serialize)]
pub struct ListNodesResponse {
    /// All registered nodes, enabled or not.
    pub nodes: Vec<NodeCapacityView>,
}

/// Body for the power route.
#[derive(Debug, Deserialize)]
pub struct PowerRequest {
    /// Signal to forward.
    pub signal: PowerSignal,
}

/// Creates operator routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/admin/nodes", get(list_nodes))
        .route(
            "/admin/nodes/:id/allocations/reset",
            post(reset_node_allocations),
        )
        .route("/admin/orders/:id/retry", post(retry_order))
        .route("/servers/:identifier/power", post(send_power))
}

/// Fleet capacity view.
///
/// GET /admin/nodes
///
/// Usage is computed from live instance records, the same numbers placement
/// sees, so an operator reading this view and the placer disagree only
/// while a reservation is in flight.
pub(crate) async fn list_nodes(
    _ctx: RequestContext,
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, ApiError> {
    let nodes = state.store.list_nodes().await?;
    let instances = state.store.list_instances().await?;

    let mut used_by_node: HashMap<NodeId, u32> = HashMap::new();
    for instance in &instances {
        if instance.state != InstanceState::Lost {
            let used = used_by_node.entry(instance.node_id).or_insert(0);
            *used = used.saturating_add(instance.memory_mb);
        }
    }

    let views = nodes
        .into_iter()
        .map(|node| {
            let usable_mb = node.usable_mb();
            let used_mb = used_by_node.get(&node.id).copied().unwrap_or(0);
            NodeCapacityView {
                id: node.id,
                name: node.name,
                region: node.region,
                pterodactyl_node_id: node.pterodactyl_node_id,
                enabled: node.enabled,
                usable_mb,
                used_mb,
                available_mb: usable_mb.saturating_sub(used_mb),
                last_seen_at: node.last_seen_at,
            }
        })
        .collect();

    Ok(Json(ListNodesResponse { nodes: views }))
}

/// Rebuild one node's allocation pool.
///
/// POST /admin/nodes/{id}/allocations/reset
///
/// Refuses with 409 while the node is enabled; placement could hand out an
/// endpoint mid-rebuild.
pub(crate) async fn reset_node_allocations(
    _ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let node_id: NodeId = id.parse()?;

    let node = state
        .store
        .get_node(node_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("node not found: {node_id}")))?;

    let reset = state.directory.reset_pool(&node).await?;

    tracing::info!(
        node = %node.name,
        created = reset.created,
        deleted = reset.deleted,
        kept = reset.kept,
        skipped_assigned = reset.skipped_assigned,
        "allocation pool reset"
    );

    Ok(Json(reset))
}

/// Force another provisioning attempt for a stuck order.
///
/// POST /admin/orders/{id}/retry
///
/// Accepts orders in `ERROR` or stalled in `PAID`. The attempt runs inline
/// so the operator sees the receipt or the failure directly.
pub(crate) async fn retry_order(
    _ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let order_id: OrderId = id.parse()?;

    let order = state
        .store
        .get_order(&order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("order not found: {order_id}")))?;

    if !matches!(order.status, OrderStatus::Error | OrderStatus::Paid) {
        return Err(ApiError::conflict(format!(
            "order {order_id} is {}; retry applies to ERROR or stalled PAID orders",
            order.status
        )));
    }

    let receipt = state
        .provisioner
        .retry(order_id, TransitionReason::ManualRetry)
        .await?;

    tracing::info!(
        order_id = %receipt.order_id,
        node_id = %receipt.node_id,
        adopted = receipt.adopted,
        "manual retry succeeded"
    );

    Ok(Json(receipt))
}

/// Forward a power signal to the panel.
///
/// POST /servers/{identifier}/power
pub(crate) async fn send_power(
    _ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    Path(identifier): Path<String>,
    Json(req): Json<PowerRequest>,
) -> Result<StatusCode, ApiError> {
    state.panel.send_power(&identifier, req.signal).await?;

    tracing::info!(identifier = %identifier, signal = %req.signal, "power signal forwarded");

    Ok(StatusCode::NO_CONTENT)
}
