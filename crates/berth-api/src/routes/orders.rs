//! Order status routes.
//!
//! The storefront polls here after checkout. The response is deliberately
//! coarse: a `setup_state` the storefront can render directly, plus the
//! connection address once the server is live. Raw provisioning errors and
//! panel identifiers stay internal.
//!
//! ## Routes
//!
//! - `GET /orders/{id}` - Customer-facing setup status for one order

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;

use berth_core::OrderId;
use berth_provision::order::{Order, OrderStatus};

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::server::AppState;

/// Coarse customer-facing setup state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupState {
    /// The server is being set up; no action needed.
    InProgress,
    /// The server is live and the address is populated.
    Ready,
    /// Setup stalled and an operator is looking at it.
    Attention,
}

/// Customer-facing view of one order.
#[derive(Debug, Serialize)]
pub struct OrderStatusView {
    /// Order id, as returned by the webhook acknowledgement.
    pub order_id: OrderId,
    /// Customer-chosen server name.
    pub server_name: String,
    /// Region the server lands in.
    pub region: String,
    /// Coarse setup state for the storefront to render.
    pub setup_state: SetupState,
    /// `host:port` to connect to, once the server is live.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
}

/// Creates order status routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/orders/:id", get(get_order_status))
}

/// Maps internal order status onto the public setup state.
///
/// A retryable error still reads as in-progress: the reconciler will pick
/// the order up again, and the customer cannot act on the failure anyway.
fn setup_state(order: &Order) -> SetupState {
    match order.status {
        OrderStatus::Pending | OrderStatus::Paid | OrderStatus::Provisioning => {
            SetupState::InProgress
        }
        OrderStatus::Provisioned => SetupState::Ready,
        OrderStatus::Error => {
            if order.can_retry() {
                SetupState::InProgress
            } else {
                SetupState::Attention
            }
        }
    }
}

/// Get the setup status of one order.
///
/// GET /orders/{id}
pub(crate) async fn get_order_status(
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

    let address = if order.status == OrderStatus::Provisioned {
        state
            .store
            .find_live_instance(&order_id)
            .await?
            .and_then(|instance| instance.address())
    } else {
        None
    };

    Ok(Json(OrderStatusView {
        order_id: order.id,
        server_name: order.server_name.clone(),
        region: order.region.clone(),
        setup_state: setup_state(&order),
        address,
        created_at: order.created_at,
    }))
}

#[cfg(test)]
mod tests {
    use berth_core::PlanId;
    use berth_provision::error::{ProvisionError, ProvisionErrorKind};
    use berth_provision::order::{BillingTerm, TransitionReason};

    use super::*;

    fn paid_order() -> Order {
        let mut order = Order::new(
            "user_42",
            PlanId::new("mc-8gb"),
            "us-east",
            "my server",
            BillingTerm::Monthly,
            "sub_123",
        );
        order
            .transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)
            .unwrap();
        order
    }

    #[test]
    fn pending_and_paid_read_in_progress() {
        let order = paid_order();
        assert_eq!(setup_state(&order), SetupState::InProgress);
    }

    #[test]
    fn provisioned_reads_ready() {
        let mut order = paid_order();
        order
            .transition_to(
                OrderStatus::Provisioning,
                TransitionReason::ProvisioningStarted,
            )
            .unwrap();
        order
            .transition_to(
                OrderStatus::Provisioned,
                TransitionReason::ProvisioningSucceeded,
            )
            .unwrap();
        assert_eq!(setup_state(&order), SetupState::Ready);
    }

    #[test]
    fn retryable_error_reads_in_progress() {
        let mut order = paid_order();
        order
            .transition_to(
                OrderStatus::Provisioning,
                TransitionReason::ProvisioningStarted,
            )
            .unwrap();
        order
            .record_failure(ProvisionError::new(
                ProvisionErrorKind::RemoteCall,
                "panel timed out",
            ))
            .unwrap();
        assert_eq!(order.status, OrderStatus::Error);
        assert_eq!(setup_state(&order), SetupState::InProgress);
    }

    #[test]
    fn exhausted_error_reads_attention() {
        let mut order = paid_order();
        for _ in 0..order.max_attempts {
            order
                .transition_to(
                    OrderStatus::Provisioning,
                    TransitionReason::ProvisioningStarted,
                )
                .unwrap();
            order
                .record_failure(ProvisionError::new(
                    ProvisionErrorKind::RemoteCall,
                    "panel timed out",
                ))
                .unwrap();
        }
        assert!(!order.can_retry());
        assert_eq!(setup_state(&order), SetupState::Attention);
    }

    #[test]
    fn plan_config_error_reads_attention_immediately() {
        let mut order = paid_order();
        order
            .transition_to(
                OrderStatus::Provisioning,
                TransitionReason::ProvisioningStarted,
            )
            .unwrap();
        order
            .record_failure(ProvisionError::new(
                ProvisionErrorKind::PlanConfig,
                "plan missing egg mapping",
            ))
            .unwrap();
        assert_eq!(setup_state(&order), SetupState::Attention);
    }
}
