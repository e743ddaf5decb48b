//! Billing webhook routes.
//!
//! The billing provider delivers payment events here. Deliveries are
//! at-least-once, so the handler is idempotent: a redelivered event answers
//! 200 with `duplicate: true` and the original order, never a second order.
//!
//! ## Routes
//!
//! - `POST /webhooks/billing` - Ingest a signed billing event

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use berth_core::OrderId;
use berth_provision::intake::{IntakeOutcome, PaymentEvent};
use berth_provision::order::OrderStatus;

use crate::context::RequestContext;
use crate::error::ApiError;
use crate::metrics::record_webhook_delivery;
use crate::server::AppState;
use crate::signature;

/// Acknowledgement returned for every consumed delivery.
///
/// `order_id` and `status` are absent for ignored event types.
#[derive(Debug, Serialize)]
pub struct WebhookAck {
    /// The order the event mapped to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    /// Current status of that order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<OrderStatus>,
    /// True when this delivery was a redelivery of a known subscription.
    pub duplicate: bool,
    /// Set when the event type does not create orders.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_event_type: Option<String>,
}

/// Creates webhook routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/billing", post(ingest_billing_event))
}

/// Ingest a billing event.
///
/// POST /webhooks/billing
///
/// The signature covers the raw body, so the body is taken as bytes and
/// parsed only after verification.
pub(crate) async fn ingest_billing_event(
    ctx: RequestContext,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    signature::verify(
        state.config.webhook.signing_secret.as_deref(),
        &headers,
        &body,
        &ctx.request_id,
    )?;

    let event: PaymentEvent = serde_json::from_slice(&body).map_err(|e| {
        ApiError::unprocessable_entity("INVALID_PAYLOAD", format!("invalid billing event: {e}"))
    })?;

    tracing::info!(
        event_id = %event.event_id,
        event_type = %event.event_type,
        "billing event received"
    );

    let outcome = state.intake.ingest(event).await?;
    record_webhook_delivery(outcome.as_label());

    let ack = match outcome {
        IntakeOutcome::Accepted { order } => WebhookAck {
            order_id: Some(order.id),
            status: Some(order.status),
            duplicate: false,
            ignored_event_type: None,
        },
        IntakeOutcome::Duplicate { order } => WebhookAck {
            order_id: Some(order.id),
            status: Some(order.status),
            duplicate: true,
            ignored_event_type: None,
        },
        IntakeOutcome::Ignored { event_type } => WebhookAck {
            order_id: None,
            status: None,
            duplicate: false,
            ignored_event_type: Some(event_type),
        },
    };

    Ok(Json(ack))
}
