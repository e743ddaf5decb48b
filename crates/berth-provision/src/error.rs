//! Error types for the provisioning domain.

use berth_core::{AllocationId, NodeId, OrderId, PlanId};

/// The result type used throughout berth-provision.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in provisioning operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An order was not found.
    #[error("order not found: {order_id}")]
    OrderNotFound {
        /// The order ID that was not found.
        order_id: OrderId,
    },

    /// A node was not found.
    #[error("node not found: {node_id}")]
    NodeNotFound {
        /// The node ID that was not found.
        node_id: NodeId,
    },

    /// A plan was not found in the catalog.
    #[error("plan not found: {plan_id}")]
    PlanNotFound {
        /// The plan ID that was not found.
        plan_id: PlanId,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// An inbound billing event failed validation.
    #[error("invalid payment event: {message}")]
    InvalidEvent {
        /// Description of the missing or malformed field.
        message: String,
    },

    /// A remote panel call failed.
    ///
    /// `outcome_unknown` is set when the failure was a timeout or transport
    /// error after the request may have reached the panel; callers must not
    /// assume the remote side effect did not happen.
    #[error("panel error: {message}")]
    Panel {
        /// Description of the panel failure.
        message: String,
        /// HTTP status, when the panel answered at all.
        status: Option<u16>,
        /// True when the request may have landed despite the failure.
        outcome_unknown: bool,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// Service configuration was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from berth-core.
    #[error("core error: {0}")]
    Core(#[from] berth_core::error::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a panel error from an HTTP status the panel returned.
    #[must_use]
    pub fn panel_status(status: u16, message: impl Into<String>) -> Self {
        Self::Panel {
            message: message.into(),
            status: Some(status),
            outcome_unknown: false,
        }
    }

    /// Creates a panel error whose remote outcome is unknown (timeout,
    /// connection reset after send).
    #[must_use]
    pub fn panel_unknown(message: impl Into<String>) -> Self {
        Self::Panel {
            message: message.into(),
            status: None,
            outcome_unknown: true,
        }
    }

    /// Creates a panel error for a request that never reached the panel
    /// (connect failure); the remote side effect is known not to exist.
    #[must_use]
    pub fn panel_transport(message: impl Into<String>) -> Self {
        Self::Panel {
            message: message.into(),
            status: None,
            outcome_unknown: false,
        }
    }
}

/// Why a provisioning attempt failed, in operator-facing taxonomy.
///
/// The kind decides retry policy: [`ProvisionErrorKind::PlanConfig`] needs an
/// operator fix and is never retried automatically; everything else is
/// retried by the reconciler until the order's attempt cap is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionErrorKind {
    /// The order references a missing or inactive plan.
    PlanConfig,
    /// No enabled node in the region has enough free memory.
    NodeCapacity,
    /// The chosen node's advertised allocation pool has no free endpoint.
    AllocationPool,
    /// The remote panel call failed (non-2xx or timeout); outcome unknown.
    RemoteCall,
    /// The remote create succeeded but local persistence failed (orphan).
    Persistence,
}

impl ProvisionErrorKind {
    /// Returns true if the reconciler should retry this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::PlanConfig)
    }
}

impl std::fmt::Display for ProvisionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlanConfig => write!(f, "PLAN_CONFIG"),
            Self::NodeCapacity => write!(f, "NODE_CAPACITY"),
            Self::AllocationPool => write!(f, "ALLOCATION_POOL"),
            Self::RemoteCall => write!(f, "REMOTE_CALL"),
            Self::Persistence => write!(f, "PERSISTENCE"),
        }
    }
}

/// A failed provisioning attempt, recorded on the order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize, thiserror::Error)]
#[error("provisioning failed ({kind}): {message}")]
pub struct ProvisionError {
    /// The taxonomy bucket this failure falls into.
    pub kind: ProvisionErrorKind,
    /// Operator-facing description. Never shown raw to customers.
    pub message: String,
    /// Allocation that was being claimed when the failure hit, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
}

impl ProvisionError {
    /// Creates a provisioning error of the given kind.
    #[must_use]
    pub fn new(kind: ProvisionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            allocation_id: None,
        }
    }

    /// Attaches the allocation involved in the failure.
    #[must_use]
    pub fn with_allocation(mut self, allocation_id: AllocationId) -> Self {
        self.allocation_id = Some(allocation_id);
        self
    }

    /// Returns true if the reconciler should retry this failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}
