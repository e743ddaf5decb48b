//! Customer order tracking.
//!
//! An order is the durable record of one purchase intent, capturing:
//!
//! - **Identity**: Who bought what plan, for which region, under what name
//! - **Billing linkage**: The provider subscription used as idempotency key
//! - **Placement outcome**: Node and remote server identity once created
//! - **State**: Current status, attempt count, and the last failure
//!
//! Orders are never deleted. Status transitions supersede each other and
//! the row keeps `updated_at`, `status_changed_at`, and the last transition
//! reason as its audit surface. Recovery after a crash is staleness-based:
//! an order stuck in `PAID` or `PROVISIONING` past a threshold is picked up
//! by the reconciler's stuck-order sweep, so no in-flight invocation ever
//! needs to signal cancellation explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use berth_core::{NodeId, OrderId, PlanId};

use crate::error::{Error, ProvisionError, Result};

/// Default retry cap for failed provisioning attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Order state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Created at checkout start, payment not yet confirmed.
    Pending,
    /// Billing event received, provisioning not yet started.
    Paid,
    /// A provisioning attempt is in flight.
    Provisioning,
    /// Server created and recorded (terminal success).
    Provisioned,
    /// The last attempt failed; retryable until the attempt cap.
    Error,
}

impl OrderStatus {
    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Paid),
            Self::Paid => matches!(target, Self::Provisioning),
            Self::Provisioning => matches!(target, Self::Provisioned | Self::Error),
            // Error re-enters provisioning via the reconciler's retry path.
            Self::Error => matches!(target, Self::Provisioning),
            // The drift sweep re-opens a provisioned order when its remote
            // server has vanished.
            Self::Provisioned => matches!(target, Self::Error),
        }
    }
}

impl Default for OrderStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Paid => write!(f, "PAID"),
            Self::Provisioning => write!(f, "PROVISIONING"),
            Self::Provisioned => write!(f, "PROVISIONED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Why an order changed state.
///
/// Recorded on the order at every transition; the reconciler and operators
/// read these to tell a payment-driven attempt from a sweep-driven retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    /// Billing provider confirmed payment.
    PaymentReceived,
    /// The provisioner claimed the order and started an attempt.
    ProvisioningStarted,
    /// The provisioner finished and the server is recorded.
    ProvisioningSucceeded,
    /// An attempt failed; the kind lives in `last_error`.
    ProvisioningFailed,
    /// The stuck-order sweep re-dispatched the order.
    ReconcilerRetry,
    /// The drift sweep found the remote server gone.
    RemoteVanished,
    /// The drift sweep adopted an orphaned remote server.
    OrphanAdopted,
    /// An operator forced a retry from the admin surface.
    ManualRetry,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PaymentReceived => "payment_received",
            Self::ProvisioningStarted => "provisioning_started",
            Self::ProvisioningSucceeded => "provisioning_succeeded",
            Self::ProvisioningFailed => "provisioning_failed",
            Self::ReconcilerRetry => "reconciler_retry",
            Self::RemoteVanished => "remote_vanished",
            Self::OrphanAdopted => "orphan_adopted",
            Self::ManualRetry => "manual_retry",
        };
        write!(f, "{s}")
    }
}

/// How the customer is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingTerm {
    /// Billed every month.
    Monthly,
    /// Billed every three months.
    Quarterly,
    /// Billed every twelve months.
    Annual,
}

impl Default for BillingTerm {
    fn default() -> Self {
        Self::Monthly
    }
}

impl std::fmt::Display for BillingTerm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Quarterly => write!(f, "quarterly"),
            Self::Annual => write!(f, "annual"),
        }
    }
}

/// One customer purchase and its provisioning state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Order {
    /// Unique order identifier.
    pub id: OrderId,
    /// Owning customer (external account id).
    pub user_id: String,
    /// The purchased plan.
    pub plan_id: PlanId,
    /// Requested region, e.g. `us-east`.
    pub region: String,
    /// Customer-chosen server display name.
    pub server_name: String,
    /// Billing cadence.
    pub term: BillingTerm,
    /// Current state of the order.
    pub status: OrderStatus,
    /// Billing provider subscription id; the intake idempotency key.
    pub stripe_sub_id: String,
    /// Remote server numeric id, once created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pterodactyl_server_id: Option<u64>,
    /// Remote server opaque identifier, once created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pterodactyl_server_identifier: Option<String>,
    /// Node the order was placed on, once placed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
    /// Provisioning attempts started so far.
    #[serde(default)]
    pub attempts: u32,
    /// Retry cap for this order.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// The most recent provisioning failure, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ProvisionError>,
    /// Reason for the most recent state transition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_reason: Option<TransitionReason>,
    /// When the order was created.
    pub created_at: DateTime<Utc>,
    /// When the order was last written.
    pub updated_at: DateTime<Utc>,
    /// When the status last changed. Staleness detection keys off this.
    pub status_changed_at: DateTime<Utc>,
}

const fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Order {
    /// Creates a new order in `PENDING` (checkout started).
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        plan_id: PlanId,
        region: impl Into<String>,
        server_name: impl Into<String>,
        term: BillingTerm,
        stripe_sub_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::generate(),
            user_id: user_id.into(),
            plan_id,
            region: region.into(),
            server_name: server_name.into(),
            term,
            status: OrderStatus::Pending,
            stripe_sub_id: stripe_sub_id.into(),
            pterodactyl_server_id: None,
            pterodactyl_server_identifier: None,
            node_id: None,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            last_error: None,
            last_transition_reason: None,
            created_at: now,
            updated_at: now,
            status_changed_at: now,
        }
    }

    /// The external-id tag stamped on remote servers created for this order.
    ///
    /// The drift sweep uses this tag to map remote servers back to orders,
    /// which is what makes orphan adoption possible at all.
    #[must_use]
    pub fn external_tag(&self) -> String {
        external_tag(self.id)
    }

    /// Returns true if the order is in a state no automatic process will
    /// move it out of.
    ///
    /// `PROVISIONED` is terminal for the provisioning workflow; only the
    /// drift sweep re-opens it, and only when the remote server is gone.
    /// `ERROR` is terminal once the attempt cap is reached or the failure
    /// kind is not retryable.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        match self.status {
            OrderStatus::Provisioned => true,
            OrderStatus::Error => !self.can_retry(),
            OrderStatus::Pending | OrderStatus::Paid | OrderStatus::Provisioning => false,
        }
    }

    /// Returns true if the reconciler may start another attempt.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        if self.status != OrderStatus::Error {
            return false;
        }
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.last_error
            .as_ref()
            .is_none_or(ProvisionError::is_retryable)
    }

    /// Returns true if the order has sat in `PAID` or `PROVISIONING`
    /// longer than `threshold` (an invocation died mid-flight).
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        matches!(
            self.status,
            OrderStatus::Paid | OrderStatus::Provisioning
        ) && now.signed_duration_since(self.status_changed_at) > threshold
    }

    /// Transitions to a new state.
    ///
    /// Entering `PROVISIONING` counts an attempt. Entering `PROVISIONED`
    /// clears `last_error`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(order_id = %self.id, from = %self.status, to = %target, reason = %reason)
    )]
    pub fn transition_to(&mut self, target: OrderStatus, reason: TransitionReason) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
                reason: format!("order {} rejected {reason}", self.id),
            });
        }

        let now = Utc::now();

        match target {
            OrderStatus::Provisioning => {
                self.attempts = self.attempts.saturating_add(1);
            }
            OrderStatus::Provisioned => {
                self.last_error = None;
            }
            _ => {}
        }

        self.status = target;
        self.last_transition_reason = Some(reason);
        self.status_changed_at = now;
        self.updated_at = now;
        Ok(())
    }

    /// Records a failed attempt: transition to `ERROR` with the failure
    /// attached.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is not in `PROVISIONING`.
    pub fn record_failure(&mut self, error: ProvisionError) -> Result<()> {
        self.transition_to(OrderStatus::Error, TransitionReason::ProvisioningFailed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Re-opens a `PROVISIONED` order whose remote server no longer exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the order is not in `PROVISIONED`.
    pub fn record_vanished(&mut self, error: ProvisionError) -> Result<()> {
        if self.status != OrderStatus::Provisioned {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: OrderStatus::Error.to_string(),
                reason: format!("order {} has no remote server to lose", self.id),
            });
        }
        self.transition_to(OrderStatus::Error, TransitionReason::RemoteVanished)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Attaches the remote server identity after a successful create.
    pub fn attach_remote(&mut self, server_id: u64, identifier: impl Into<String>) {
        self.pterodactyl_server_id = Some(server_id);
        self.pterodactyl_server_identifier = Some(identifier.into());
        self.updated_at = Utc::now();
    }
}

/// Formats the external-id tag for an order.
#[must_use]
pub fn external_tag(order_id: OrderId) -> String {
    format!("berth:{order_id}")
}

/// Parses an external-id tag back into an order id.
///
/// Returns `None` for tags not minted by us (manually created servers,
/// other tools sharing the panel).
#[must_use]
pub fn parse_external_tag(tag: &str) -> Option<OrderId> {
    tag.strip_prefix("berth:")?.parse().ok()
}
