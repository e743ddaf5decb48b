//! Server instance records.
//!
//! An instance row is born at capacity-reservation time, before the remote
//! server exists. That ordering is what closes the placement race: the row
//! counts against node capacity from the moment the store accepts it, so a
//! concurrent attempt sees the reduced figure instead of double-booking.
//!
//! Lifecycle: `RESERVED` (capacity held, allocation bound later, no remote
//! identity yet) -> `ACTIVE` (remote server attached) -> `LOST` (remote
//! side vanished; history retained, capacity released). A `RESERVED` row
//! whose attempt failed is deleted outright, it never carried a remote
//! identity worth keeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use berth_core::{InstanceId, NodeId, OrderId};

use crate::allocation::Allocation;
use crate::error::{Error, Result};

/// Instance state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceState {
    /// Capacity and allocation held; remote creation pending.
    Reserved,
    /// Remote server exists and is attached.
    Active,
    /// Remote server no longer exists; row kept as history.
    Lost,
}

impl InstanceState {
    /// Returns true if this state holds node capacity.
    #[must_use]
    pub const fn holds_capacity(&self) -> bool {
        matches!(self, Self::Reserved | Self::Active)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Reserved => matches!(target, Self::Active),
            Self::Active => matches!(target, Self::Lost),
            Self::Lost => false,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reserved => write!(f, "RESERVED"),
            Self::Active => write!(f, "ACTIVE"),
            Self::Lost => write!(f, "LOST"),
        }
    }
}

/// The remote panel's identity for a created server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RemoteIdentity {
    /// Numeric id (admin API surface).
    pub server_id: u64,
    /// Opaque short identifier (client API surface, power signals).
    pub identifier: String,
}

/// The realized server tied to one order, node, and allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerInstance {
    /// Unique instance identifier.
    pub id: InstanceId,
    /// The order this instance fulfills.
    pub order_id: OrderId,
    /// The node the instance lives on.
    pub node_id: NodeId,
    /// The network endpoint the server binds to, once claimed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation: Option<Allocation>,
    /// Memory footprint in MB; the number capacity accounting sums.
    pub memory_mb: u32,
    /// Remote identity, present from `ACTIVE` onwards.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteIdentity>,
    /// Current state.
    pub state: InstanceState,
    /// When the reservation was made.
    pub created_at: DateTime<Utc>,
    /// When the row was last written.
    pub updated_at: DateTime<Utc>,
}

impl ServerInstance {
    /// Creates a `RESERVED` instance holding capacity for an order.
    ///
    /// No allocation is bound yet; the claim is a separate store step so
    /// that capacity and endpoint contention fail independently.
    #[must_use]
    pub fn reserve(order_id: OrderId, node_id: NodeId, memory_mb: u32) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            order_id,
            node_id,
            allocation: None,
            memory_mb,
            remote: None,
            state: InstanceState::Reserved,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if this instance currently counts against capacity.
    #[must_use]
    pub const fn holds_capacity(&self) -> bool {
        self.state.holds_capacity()
    }

    /// Binds the claimed network endpoint.
    pub fn bind_allocation(&mut self, allocation: Allocation) {
        self.allocation = Some(allocation);
        self.updated_at = Utc::now();
    }

    /// The customer-facing `ip:port`, once an allocation is bound.
    #[must_use]
    pub fn address(&self) -> Option<String> {
        self.allocation.as_ref().map(Allocation::address)
    }

    /// Transitions to a new state.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is invalid.
    #[tracing::instrument(
        skip(self),
        fields(instance_id = %self.id, from = %self.state, to = %target)
    )]
    pub fn transition_to(&mut self, target: InstanceState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: target.to_string(),
                reason: format!("instance {}", self.id),
            });
        }

        self.state = target;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Attaches the remote identity and activates the instance.
    ///
    /// # Errors
    ///
    /// Returns an error unless the instance is `RESERVED` with an
    /// allocation bound.
    pub fn activate(&mut self, remote: RemoteIdentity) -> Result<()> {
        if self.allocation.is_none() {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: InstanceState::Active.to_string(),
                reason: format!("instance {} has no allocation bound", self.id),
            });
        }
        self.transition_to(InstanceState::Active)?;
        self.remote = Some(remote);
        Ok(())
    }
}
