//! In-memory store implementation for testing.
//!
//! This module provides [`InMemoryStore`], a simple in-memory implementation of
//! the [`Store`] trait suitable for testing and development.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Every compare-and-swap takes one write lock over the whole state, which
//! gives the same effective isolation a transactional backend provides.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use berth_core::{InstanceId, NodeId, OrderId};

use super::{CasResult, InsertOutcome, Store};
use crate::allocation::Allocation;
use crate::error::{Error, ProvisionError, Result};
use crate::instance::{InstanceState, RemoteIdentity, ServerInstance};
use crate::node::Node;
use crate::order::{Order, OrderStatus, TransitionReason};
use crate::placement::NodeCapacity;

/// All persisted state behind one lock.
#[derive(Debug, Default)]
struct StoreState {
    orders: HashMap<OrderId, Order>,
    subscriptions: HashMap<String, OrderId>,
    nodes: BTreeMap<NodeId, Node>,
    instances: HashMap<InstanceId, ServerInstance>,
}

/// In-memory store for testing.
///
/// Provides a simple, thread-safe implementation of the [`Store`] trait using
/// `RwLock` for synchronization.
///
/// ## Example
///
/// ```rust
/// use berth_provision::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<StoreState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("store lock poisoned")
}

/// Free memory on a node: usable total minus every live instance on it.
fn free_mb(state: &StoreState, node: &Node) -> u32 {
    let held: u64 = state
        .instances
        .values()
        .filter(|i| i.node_id == node.id && i.holds_capacity())
        .map(|i| u64::from(i.memory_mb))
        .sum();
    u32::try_from(u64::from(node.usable_mb()).saturating_sub(held)).unwrap_or(0)
}

fn apply_finalize(
    state: &mut StoreState,
    instance_id: &InstanceId,
    order_id: OrderId,
    node_id: NodeId,
    remote: &RemoteIdentity,
) -> Result<()> {
    if let Some(instance) = state.instances.get_mut(instance_id) {
        instance.activate(remote.clone())?;
    }
    if let Some(order) = state.orders.get_mut(&order_id) {
        order.transition_to(
            OrderStatus::Provisioned,
            TransitionReason::ProvisioningSucceeded,
        )?;
        order.attach_remote(remote.server_id, remote.identifier.clone());
        order.node_id = Some(node_id);
    }
    Ok(())
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of orders currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn order_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.orders.len()
        };
        Ok(count)
    }

    /// Returns the number of instance rows currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn instance_count(&self) -> Result<usize> {
        let count = {
            let state = self.state.read().map_err(poison_err)?;
            state.instances.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_order_if_absent(&self, order: &Order) -> Result<InsertOutcome> {
        let mut state = self.state.write().map_err(poison_err)?;

        if let Some(existing_id) = state.subscriptions.get(&order.stripe_sub_id) {
            let existing = state.orders.get(existing_id).cloned();
            drop(state);
            return existing.map_or_else(
                || Err(Error::storage("subscription index points at a missing order")),
                |existing| Ok(InsertOutcome::DuplicateSubscription { existing }),
            );
        }

        if state.orders.contains_key(&order.id) {
            drop(state);
            return Err(Error::storage(format!("order {} already exists", order.id)));
        }

        state
            .subscriptions
            .insert(order.stripe_sub_id.clone(), order.id);
        state.orders.insert(order.id, order.clone());
        drop(state);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.orders.get(order_id).cloned()
        };
        Ok(result)
    }

    async fn get_order_by_subscription(&self, subscription_id: &str) -> Result<Option<Order>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .subscriptions
                .get(subscription_id)
                .and_then(|id| state.orders.get(id))
                .cloned()
        };
        Ok(result)
    }

    async fn list_orders(&self) -> Result<Vec<Order>> {
        let mut orders = {
            let state = self.state.read().map_err(poison_err)?;
            state.orders.values().cloned().collect::<Vec<_>>()
        };
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn list_orders_by_status(&self, status: OrderStatus) -> Result<Vec<Order>> {
        let mut orders = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .orders
                .values()
                .filter(|o| o.status == status)
                .cloned()
                .collect::<Vec<_>>()
        };
        orders.sort_by_key(|o| o.id);
        Ok(orders)
    }

    async fn save_order(&self, order: &Order) -> Result<()> {
        {
            let mut state = self.state.write().map_err(poison_err)?;
            state
                .subscriptions
                .insert(order.stripe_sub_id.clone(), order.id);
            state.orders.insert(order.id, order.clone());
        }
        Ok(())
    }

    async fn cas_order_status(
        &self,
        order_id: &OrderId,
        expected: OrderStatus,
        target: OrderStatus,
        reason: TransitionReason,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(order) = state.orders.get_mut(order_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if order.status != expected {
            let actual = order.status;
            drop(state);
            return Ok(CasResult::OrderStateMismatch { actual });
        }

        let transition_result = order.transition_to(target, reason);
        drop(state);
        transition_result.map(|()| CasResult::Success)
    }

    async fn record_order_failure(
        &self,
        order_id: &OrderId,
        error: &ProvisionError,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(order) = state.orders.get_mut(order_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if order.status != OrderStatus::Provisioning {
            let actual = order.status;
            drop(state);
            return Ok(CasResult::OrderStateMismatch { actual });
        }

        let record_result = order.record_failure(error.clone());
        drop(state);
        record_result.map(|()| CasResult::Success)
    }

    async fn mark_order_vanished(
        &self,
        order_id: &OrderId,
        error: &ProvisionError,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(order) = state.orders.get_mut(order_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if order.status != OrderStatus::Provisioned {
            let actual = order.status;
            drop(state);
            return Ok(CasResult::OrderStateMismatch { actual });
        }

        let record_result = order.record_vanished(error.clone());
        drop(state);
        record_result.map(|()| CasResult::Success)
    }

    async fn upsert_node(&self, node: &Node) -> Result<()> {
        {
            let mut state = self.state.write().map_err(poison_err)?;
            state.nodes.insert(node.id, node.clone());
        }
        Ok(())
    }

    async fn get_node(&self, node_id: NodeId) -> Result<Option<Node>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.nodes.get(&node_id).cloned()
        };
        Ok(result)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state.nodes.values().cloned().collect()
        };
        Ok(result)
    }

    async fn set_node_enabled(&self, node_id: NodeId, enabled: bool) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(node) = state.nodes.get_mut(&node_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        node.enabled = enabled;
        drop(state);
        Ok(CasResult::Success)
    }

    async fn record_node_seen(
        &self,
        node_id: NodeId,
        seen_at: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(node) = state.nodes.get_mut(&node_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        node.last_seen_at = Some(seen_at);
        drop(state);
        Ok(CasResult::Success)
    }

    async fn capacity_snapshot(&self, region: &str) -> Result<Vec<NodeCapacity>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .nodes
                .values()
                .filter(|n| n.enabled && n.region == region)
                .map(|n| NodeCapacity {
                    node_id: n.id,
                    available_mb: free_mb(&state, n),
                })
                .collect()
        };
        Ok(result)
    }

    async fn reserve_capacity(&self, instance: &ServerInstance) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        if instance.state != InstanceState::Reserved {
            let actual = instance.state;
            drop(state);
            return Ok(CasResult::InstanceStateMismatch { actual });
        }

        if state.instances.contains_key(&instance.id) {
            drop(state);
            return Err(Error::storage(format!(
                "instance {} already exists",
                instance.id
            )));
        }

        // One live instance per order; the provisioner reuses an existing
        // reservation instead of stacking a second one.
        let has_live = state
            .instances
            .values()
            .any(|i| i.order_id == instance.order_id && i.holds_capacity());
        if has_live {
            drop(state);
            return Err(Error::storage(format!(
                "order {} already has a live instance",
                instance.order_id
            )));
        }

        let Some(node) = state.nodes.get(&instance.node_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if !node.enabled {
            drop(state);
            return Ok(CasResult::CapacityExceeded { available_mb: 0 });
        }

        let available_mb = free_mb(&state, node);
        if available_mb < instance.memory_mb {
            drop(state);
            return Ok(CasResult::CapacityExceeded { available_mb });
        }

        state.instances.insert(instance.id, instance.clone());
        drop(state);
        Ok(CasResult::Success)
    }

    async fn bind_allocation(
        &self,
        instance_id: &InstanceId,
        allocation: Allocation,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(instance) = state.instances.get(instance_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if instance.state != InstanceState::Reserved {
            let actual = instance.state;
            drop(state);
            return Ok(CasResult::InstanceStateMismatch { actual });
        }

        let node_id = instance.node_id;
        let taken = state.instances.values().any(|other| {
            other.id != *instance_id
                && other.node_id == node_id
                && other.holds_capacity()
                && other
                    .allocation
                    .as_ref()
                    .is_some_and(|a| a.id == allocation.id)
        });
        if taken {
            drop(state);
            return Ok(CasResult::AllocationTaken);
        }

        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.bind_allocation(Allocation {
                assigned: true,
                ..allocation
            });
        }
        drop(state);
        Ok(CasResult::Success)
    }

    async fn finalize_instance(
        &self,
        instance_id: &InstanceId,
        remote: &RemoteIdentity,
    ) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(instance) = state.instances.get(instance_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if instance.state != InstanceState::Reserved {
            let actual = instance.state;
            drop(state);
            return Ok(CasResult::InstanceStateMismatch { actual });
        }
        if instance.allocation.is_none() {
            drop(state);
            return Err(Error::InvalidStateTransition {
                from: InstanceState::Reserved.to_string(),
                to: InstanceState::Active.to_string(),
                reason: format!("instance {instance_id} has no allocation bound"),
            });
        }
        let order_id = instance.order_id;
        let node_id = instance.node_id;

        let Some(order) = state.orders.get(&order_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };
        if order.status != OrderStatus::Provisioning {
            let actual = order.status;
            drop(state);
            return Ok(CasResult::OrderStateMismatch { actual });
        }

        // Both sides validated; the two writes land under the same lock.
        let apply_result = apply_finalize(&mut state, instance_id, order_id, node_id, remote);
        drop(state);
        apply_result.map(|()| CasResult::Success)
    }

    async fn release_reservation(&self, instance_id: &InstanceId) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(instance) = state.instances.get(instance_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if instance.state != InstanceState::Reserved {
            let actual = instance.state;
            drop(state);
            return Ok(CasResult::InstanceStateMismatch { actual });
        }

        state.instances.remove(instance_id);
        drop(state);
        Ok(CasResult::Success)
    }

    async fn mark_instance_lost(&self, instance_id: &InstanceId) -> Result<CasResult> {
        let mut state = self.state.write().map_err(poison_err)?;

        let Some(instance) = state.instances.get_mut(instance_id) else {
            drop(state);
            return Ok(CasResult::NotFound);
        };

        if instance.state != InstanceState::Active {
            let actual = instance.state;
            drop(state);
            return Ok(CasResult::InstanceStateMismatch { actual });
        }

        let transition_result = instance.transition_to(InstanceState::Lost);
        drop(state);
        transition_result.map(|()| CasResult::Success)
    }

    async fn find_live_instance(&self, order_id: &OrderId) -> Result<Option<ServerInstance>> {
        let result = {
            let state = self.state.read().map_err(poison_err)?;
            state
                .instances
                .values()
                .filter(|i| i.order_id == *order_id && i.holds_capacity())
                .min_by_key(|i| i.id)
                .cloned()
        };
        Ok(result)
    }

    async fn list_instances(&self) -> Result<Vec<ServerInstance>> {
        let mut instances = {
            let state = self.state.read().map_err(poison_err)?;
            state.instances.values().cloned().collect::<Vec<_>>()
        };
        instances.sort_by_key(|i| i.id);
        Ok(instances)
    }
}
