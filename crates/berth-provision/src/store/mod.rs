//! Pluggable storage for orders, nodes, and server instances.
//!
//! The Store trait defines the persistence layer the provisioner and the
//! reconciler coordinate through. There is no other coordination channel:
//! no locks held across await points, no leader, no queue.
//!
//! ## Design Principles
//!
//! - **CAS semantics**: State transitions use compare-and-swap to prevent races
//! - **Capacity is derived**: Available memory is computed from live instance
//!   rows, never stored as a counter that can drift
//! - **Testability**: In-memory implementation for testing, Postgres for production

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use berth_core::{InstanceId, NodeId, OrderId};

use crate::error::{ProvisionError, Result};
use crate::instance::{InstanceState, RemoteIdentity, ServerInstance};
use crate::node::Node;
use crate::order::{Order, OrderStatus, TransitionReason};
use crate::placement::NodeCapacity;

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// Operation succeeded.
    Success,
    /// Entity not found.
    NotFound,
    /// Order status didn't match expected value.
    OrderStateMismatch {
        /// The actual status that was found.
        actual: OrderStatus,
    },
    /// Instance state didn't match expected value.
    InstanceStateMismatch {
        /// The actual state that was found.
        actual: InstanceState,
    },
    /// Not enough free memory on the node at commit time.
    CapacityExceeded {
        /// Free memory the node actually had, in MB.
        available_mb: u32,
    },
    /// The allocation is already claimed by another live instance.
    AllocationTaken,
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the entity was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Result of an idempotent order insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The order was inserted; this subscription was new.
    Inserted,
    /// An order for this billing subscription already exists.
    DuplicateSubscription {
        /// The order previously created for the subscription.
        existing: Order,
    },
}

/// Storage abstraction for provisioning state.
///
/// Implementations must provide:
/// - Durability appropriate for the deployment (in-memory for tests, Postgres for prod)
/// - CAS semantics for state transitions and capacity commits
/// - A single consistent view across orders, nodes, and instances
///
/// ## CAS Semantics
///
/// Three operations carry the correctness load:
///
/// - `cas_order_status` prevents two invocations claiming the same order
/// - `reserve_capacity` re-checks free memory and inserts the `RESERVED`
///   instance under one lock, so a snapshot that went stale between
///   selection and commit is caught here rather than oversubscribing
/// - `bind_allocation` grants each network endpoint at most once across
///   all live instances, regardless of what the panel's cached pool said
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from webhook
/// handlers and reconciler sweeps.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Order Operations ---

    /// Inserts an order unless one already exists for its billing
    /// subscription.
    ///
    /// This is the intake idempotency point: redelivered payment events
    /// find the existing order here and change nothing.
    async fn insert_order_if_absent(&self, order: &Order) -> Result<InsertOutcome>;

    /// Gets an order by id.
    ///
    /// Returns `None` if the order does not exist.
    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>>;

    /// Gets an order by its billing subscription id.
    async fn get_order_by_subscription(&self, subscription_id: &str) -> Result<Option<Order>>;

    /// Lists all orders, ordered by id ascending.
    async fn list_orders(&self) -> Result<Vec<Order>>;

    /// Lists orders in one status, ordered by id ascending.
    async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>>;

    /// Saves an order (insert or update), bypassing transition checks.
    ///
    /// This is a full replacement of the row. Production paths go through
    /// `cas_order_status`; this exists for seeding and repair tooling.
    async fn save_order(&self, order: &Order) -> Result<()>;

    /// Atomically transitions order status if the current status matches
    /// expected.
    ///
    /// Entering `PROVISIONING` counts an attempt against the order's cap.
    ///
    /// # Returns
    ///
    /// - `CasResult::Success` if the transition was applied
    /// - `CasResult::NotFound` if the order doesn't exist
    /// - `CasResult::OrderStateMismatch` if the current status doesn't match
    async fn cas_order_status(
        &self,
        order_id: &OrderId,
        expected: OrderStatus,
        target: OrderStatus,
        reason: TransitionReason,
    ) -> Result<CasResult>;

    /// Atomically moves a `PROVISIONING` order to `ERROR` with the failure
    /// attached.
    async fn record_order_failure(
        &self,
        order_id: &OrderId,
        error: &ProvisionError,
    ) -> Result<CasResult>;

    /// Atomically re-opens a `PROVISIONED` order whose remote server the
    /// drift sweep found missing, recording the loss as the last failure.
    async fn mark_order_vanished(
        &self,
        order_id: &OrderId,
        error: &ProvisionError,
    ) -> Result<CasResult>;

    // --- Node Operations ---

    /// Inserts or replaces a fleet node row.
    async fn upsert_node(&self, node: &Node) -> Result<()>;

    /// Gets a node by id.
    async fn get_node(&self, node_id: NodeId) -> Result<Option<Node>>;

    /// Lists all nodes, ordered by id ascending.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Enables or disables a node for placement.
    async fn set_node_enabled(&self, node_id: NodeId, enabled: bool) -> Result<CasResult>;

    /// Records a successful health probe observation.
    async fn record_node_seen(&self, node_id: NodeId, seen_at: DateTime<Utc>)
        -> Result<CasResult>;

    // --- Capacity Commit (CAS) ---

    /// Computes free memory per enabled node in a region.
    ///
    /// Free memory is the node's usable total minus every `RESERVED` and
    /// `ACTIVE` instance on it, so in-flight attempts are already counted
    /// before their remote server exists.
    async fn capacity_snapshot(&self, region: &str) -> Result<Vec<NodeCapacity>>;

    /// Commits a capacity reservation by inserting a `RESERVED` instance.
    ///
    /// Free memory is re-checked under the same lock that inserts the row.
    ///
    /// # Returns
    ///
    /// - `CasResult::Success` if the reservation was inserted
    /// - `CasResult::NotFound` if the node doesn't exist
    /// - `CasResult::CapacityExceeded` if the node is disabled or the
    ///   instance no longer fits; the caller should re-select
    async fn reserve_capacity(&self, instance: &ServerInstance) -> Result<CasResult>;

    /// Claims a network endpoint for a `RESERVED` instance.
    ///
    /// # Returns
    ///
    /// - `CasResult::Success` if the claim was recorded
    /// - `CasResult::NotFound` if the instance doesn't exist
    /// - `CasResult::InstanceStateMismatch` unless the instance is `RESERVED`
    /// - `CasResult::AllocationTaken` if another live instance on the node
    ///   already holds the endpoint; the caller should try the next candidate
    async fn bind_allocation(
        &self,
        instance_id: &InstanceId,
        allocation: crate::allocation::Allocation,
    ) -> Result<CasResult>;

    /// Completes provisioning in one atomic step: the instance becomes
    /// `ACTIVE` with the remote identity attached, and its order becomes
    /// `PROVISIONED` carrying the server ids and node.
    ///
    /// Splitting these two writes would open a window where the server
    /// exists but the order never says so.
    async fn finalize_instance(
        &self,
        instance_id: &InstanceId,
        remote: &RemoteIdentity,
    ) -> Result<CasResult>;

    /// Deletes a `RESERVED` instance, freeing its capacity and any claimed
    /// endpoint.
    ///
    /// Refuses to touch `ACTIVE` or `LOST` rows.
    async fn release_reservation(&self, instance_id: &InstanceId) -> Result<CasResult>;

    /// Moves an `ACTIVE` instance to `LOST`, freeing capacity while
    /// keeping the row as history.
    async fn mark_instance_lost(&self, instance_id: &InstanceId) -> Result<CasResult>;

    // --- Instance Queries ---

    /// Finds the instance currently holding capacity for an order, if any.
    ///
    /// `LOST` rows are not returned; an order has at most one live
    /// instance at a time.
    async fn find_live_instance(&self, order_id: &OrderId) -> Result<Option<ServerInstance>>;

    /// Lists all instances, ordered by id ascending.
    async fn list_instances(&self) -> Result<Vec<ServerInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_result_is_success() {
        assert!(CasResult::Success.is_success());
        assert!(!CasResult::NotFound.is_success());
        assert!(!CasResult::OrderStateMismatch {
            actual: OrderStatus::Paid
        }
        .is_success());
        assert!(!CasResult::CapacityExceeded { available_mb: 512 }.is_success());
        assert!(!CasResult::AllocationTaken.is_success());
    }

    #[test]
    fn cas_result_is_not_found() {
        assert!(CasResult::NotFound.is_not_found());
        assert!(!CasResult::Success.is_not_found());
    }
}
