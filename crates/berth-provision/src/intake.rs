//! Billing webhook intake.
//!
//! Converts verified payment events into `PAID` orders, exactly once per
//! billing subscription. The subscription id is the idempotency key:
//! redelivered events find the existing order and return it unchanged, so
//! the billing provider can retry deliveries freely.
//!
//! Accepting an event dispatches the first provisioning attempt on a
//! background task. The HTTP acknowledgement must never wait on node
//! selection or panel calls; a slow panel would otherwise push the provider
//! into its redelivery backoff.
//!
//! Validation failures return an error so the HTTP layer can answer non-2xx
//! and the provider redelivers once the payload is fixed upstream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use berth_core::PlanId;

use crate::error::{Error, Result};
use crate::metrics::ProvisionMetrics;
use crate::order::{BillingTerm, Order, OrderStatus, TransitionReason};
use crate::provisioner::Provisioner;
use crate::store::{InsertOutcome, Store};

/// The billing event type that carries a completed purchase.
///
/// Renewal and lifecycle events (`invoice.payment_succeeded`,
/// `customer.subscription.updated`, ...) are acknowledged without creating
/// orders; billing state is not this component's concern.
pub const PROVISIONING_EVENT_TYPE: &str = "checkout.session.completed";

/// A payment event as delivered by the billing webhook, after signature
/// verification.
///
/// Field names follow the webhook payload. `subscription_id` doubles as the
/// intake idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PaymentEvent {
    /// Provider-assigned event id, used only for logging.
    pub event_id: String,
    /// Provider event type, e.g. `checkout.session.completed`.
    pub event_type: String,
    /// Billing subscription id. Idempotency key for order creation.
    pub subscription_id: String,
    /// Storefront account that paid.
    pub user_id: String,
    /// Purchased plan id.
    pub plan_id: PlanId,
    /// Region the customer picked at checkout.
    pub region: String,
    /// Customer-chosen server display name.
    pub server_name: String,
    /// Billing cadence. Defaults to monthly when the payload omits it.
    #[serde(default)]
    pub term: BillingTerm,
}

impl PaymentEvent {
    /// Checks that every field provisioning depends on is present.
    ///
    /// Plan existence and region capacity are deliberately not checked here;
    /// those failures belong to the provisioning attempt, which records them
    /// on the order instead of bouncing the webhook.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("subscription_id", &self.subscription_id),
            ("user_id", &self.user_id),
            ("region", &self.region),
            ("server_name", &self.server_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::InvalidEvent {
                    message: format!("{field} is empty"),
                });
            }
        }
        if self.plan_id.as_str().trim().is_empty() {
            return Err(Error::InvalidEvent {
                message: "plan_id is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// What intake did with a delivered event.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// First delivery. The order was persisted as `PAID` and a provisioning
    /// attempt was dispatched in the background.
    Accepted {
        /// The newly created order.
        order: Order,
    },
    /// Redelivery of an already-ingested subscription. No writes happened.
    Duplicate {
        /// The order created by the first delivery, in whatever state it has
        /// reached since.
        order: Order,
    },
    /// The event type does not create orders. Acknowledged and dropped.
    Ignored {
        /// The event type that was skipped.
        event_type: String,
    },
}

impl IntakeOutcome {
    /// The order this event maps to, when one exists.
    #[must_use]
    pub fn order(&self) -> Option<&Order> {
        match self {
            Self::Accepted { order } | Self::Duplicate { order } => Some(order),
            Self::Ignored { .. } => None,
        }
    }

    /// Metric label for this outcome.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Accepted { .. } => "accepted",
            Self::Duplicate { .. } => "duplicate",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// Ingests verified billing events and kicks off provisioning.
#[derive(Clone)]
pub struct OrderIntake {
    store: Arc<dyn Store>,
    provisioner: Arc<Provisioner>,
    metrics: ProvisionMetrics,
}

impl std::fmt::Debug for OrderIntake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderIntake").finish_non_exhaustive()
    }
}

impl OrderIntake {
    /// Creates an intake writing to `store` and dispatching to `provisioner`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, provisioner: Arc<Provisioner>) -> Self {
        Self {
            store,
            provisioner,
            metrics: ProvisionMetrics::new(),
        }
    }

    /// Ingests one verified payment event.
    ///
    /// Returns [`IntakeOutcome::Accepted`] on first delivery,
    /// [`IntakeOutcome::Duplicate`] on redelivery of a known subscription and
    /// [`IntakeOutcome::Ignored`] for event types that do not create orders.
    /// An `Err` means the event was rejected and must be answered non-2xx so
    /// the provider redelivers it.
    ///
    /// The provisioning attempt for an accepted order runs on a spawned task.
    /// Its outcome lands on the order record either way, so nothing here
    /// waits on it.
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, subscription = %event.subscription_id)
    )]
    pub async fn ingest(&self, event: PaymentEvent) -> Result<IntakeOutcome> {
        if event.event_type != PROVISIONING_EVENT_TYPE {
            debug!(event_id = %event.event_id, "event type does not create orders");
            self.metrics.record_intake("ignored");
            return Ok(IntakeOutcome::Ignored {
                event_type: event.event_type,
            });
        }
        event.validate()?;

        let mut order = Order::new(
            event.user_id,
            event.plan_id,
            event.region,
            event.server_name,
            event.term,
            event.subscription_id,
        );
        order.transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)?;

        match self.store.insert_order_if_absent(&order).await? {
            InsertOutcome::Inserted => {
                info!(
                    order_id = %order.id,
                    plan = %order.plan_id,
                    region = %order.region,
                    "order accepted, provisioning dispatched"
                );
                self.metrics.record_intake("accepted");
                self.metrics.record_order_transition(
                    &OrderStatus::Pending.to_string(),
                    &OrderStatus::Paid.to_string(),
                );
                self.dispatch(order.id);
                Ok(IntakeOutcome::Accepted { order })
            }
            InsertOutcome::DuplicateSubscription { existing } => {
                debug!(
                    order_id = %existing.id,
                    status = %existing.status,
                    "redelivered event, subscription already ingested"
                );
                self.metrics.record_intake("duplicate");
                Ok(IntakeOutcome::Duplicate { order: existing })
            }
        }
    }

    /// Spawns the first provisioning attempt for a freshly accepted order.
    fn dispatch(&self, order_id: berth_core::OrderId) {
        let provisioner = Arc::clone(&self.provisioner);
        tokio::spawn(async move {
            // Failures are recorded on the order and retried by the
            // reconciler; the task result itself is not consumed.
            if let Err(err) = provisioner.provision(order_id).await {
                warn!(order_id = %order_id, error = %err, "initial provisioning attempt failed");
            }
        });
    }
}
