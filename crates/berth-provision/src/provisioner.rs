//! The provisioning engine: one paid order in, one placed server out.
//!
//! An attempt runs five steps, each with its own failure stance:
//!
//! 1. **Plan lookup**. Missing or inactive plan is a permanent failure;
//!    nothing retries until an operator fixes the catalog.
//! 2. **Reservation**. Tightest-fit selection over a capacity snapshot,
//!    committed through the store's compare-and-set. Losing the commit race
//!    re-selects from a fresh snapshot; a region with no fitting node is a
//!    transient no-capacity failure.
//! 3. **Endpoint claim**. Walks the directory's free pool and claims the
//!    first endpoint the store grants. An exhausted pool releases the
//!    reservation and fails transient.
//! 4. **Remote create**. The panel call is sent exactly once. A definite
//!    rejection releases the reservation. An ambiguous failure (timeout,
//!    connection lost mid-flight) keeps it, because the server may exist.
//! 5. **Finalize**. Instance activation and the order's `PROVISIONED` flip
//!    happen in one store step. If that step fails after a successful
//!    create, the attempt reports a persistence failure and leaves the
//!    reservation in place for the reconciler.
//!
//! Every attempt starts by asking the panel for a server tagged with the
//! order's external id. A hit means an earlier ambiguous attempt landed;
//! the server is adopted instead of created again, which is what keeps
//! retries from ever duplicating a customer's server.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use berth_core::{NodeId, OrderId};

use crate::allocation::Allocation;
use crate::catalog::{GameFamily, Plan, PlanCatalog};
use crate::directory::AllocationDirectory;
use crate::error::{Error, ProvisionError, ProvisionErrorKind};
use crate::instance::{InstanceState, RemoteIdentity, ServerInstance};
use crate::metrics::ProvisionMetrics;
use crate::node::Node;
use crate::order::{Order, OrderStatus, TransitionReason};
use crate::panel::{CreateServerRequest, PanelClient, RemoteServer, ServerLimits};
use crate::placement::select_node;
use crate::store::{CasResult, Store};

/// How many times one attempt re-selects after losing a reservation commit
/// race before reporting no capacity.
const PLACEMENT_RETRIES: usize = 4;

/// Proof of a completed provisioning attempt.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ProvisionReceipt {
    /// The order that was provisioned.
    pub order_id: OrderId,
    /// The instance row realizing it.
    pub instance_id: berth_core::InstanceId,
    /// The node the server was placed on.
    pub node_id: NodeId,
    /// The customer-facing connection address.
    pub address: String,
    /// The panel's identity for the created server.
    pub remote: RemoteIdentity,
    /// True when an existing remote server was adopted instead of created.
    pub adopted: bool,
}

/// Drives paid orders to placed servers.
#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn Store>,
    panel: Arc<dyn PanelClient>,
    directory: Arc<AllocationDirectory>,
    catalog: Arc<PlanCatalog>,
    metrics: ProvisionMetrics,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner").finish_non_exhaustive()
    }
}

impl Provisioner {
    /// Creates a provisioner over the given store, panel, and catalog.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        panel: Arc<dyn PanelClient>,
        directory: Arc<AllocationDirectory>,
        catalog: Arc<PlanCatalog>,
    ) -> Self {
        Self {
            store,
            panel,
            directory,
            catalog,
            metrics: ProvisionMetrics::new(),
        }
    }

    /// Runs a provisioning attempt for a freshly paid order.
    ///
    /// Calling this on an already `PROVISIONED` order returns the existing
    /// placement without touching the panel.
    ///
    /// # Errors
    ///
    /// Returns the typed failure that was recorded on the order. The kind
    /// decides what happens next: `PLAN_CONFIG` waits for an operator,
    /// everything else is retried by the reconciler up to the order's
    /// attempt cap.
    pub async fn provision(
        &self,
        order_id: OrderId,
    ) -> Result<ProvisionReceipt, ProvisionError> {
        self.attempt(order_id, TransitionReason::ProvisioningStarted)
            .await
    }

    /// Re-runs provisioning for an order in `ERROR`.
    ///
    /// `reason` records who asked: the stuck-order sweep, the drift sweep
    /// adopting an orphan, or an operator. The attempt cap is the caller's
    /// check; an operator-driven retry may exceed it deliberately.
    pub async fn retry(
        &self,
        order_id: OrderId,
        reason: TransitionReason,
    ) -> Result<ProvisionReceipt, ProvisionError> {
        self.attempt(order_id, reason).await
    }

    #[tracing::instrument(skip(self), fields(order_id = %order_id, reason = %reason))]
    async fn attempt(
        &self,
        order_id: OrderId,
        reason: TransitionReason,
    ) -> Result<ProvisionReceipt, ProvisionError> {
        let started = Instant::now();

        let order = self.load_order(&order_id).await?;
        if order.status == OrderStatus::Provisioned {
            return self.replay_receipt(&order).await;
        }
        self.claim(&order, reason).await?;

        match self.run_claimed(&order).await {
            Ok(receipt) => {
                self.metrics.record_provision_attempt("success", "");
                self.metrics
                    .observe_provision_duration("success", started.elapsed());
                self.metrics.record_order_transition(
                    &OrderStatus::Provisioning.to_string(),
                    &OrderStatus::Provisioned.to_string(),
                );
                info!(
                    order_id = %order.id,
                    node = %receipt.node_id,
                    address = %receipt.address,
                    adopted = receipt.adopted,
                    "order provisioned"
                );
                Ok(receipt)
            }
            Err(failure) => {
                self.record_failure(&order.id, &failure).await;
                self.metrics
                    .record_provision_attempt("failure", &failure.kind.to_string());
                self.metrics
                    .observe_provision_duration("failure", started.elapsed());
                warn!(
                    order_id = %order.id,
                    kind = %failure.kind,
                    error = %failure,
                    "provisioning attempt failed"
                );
                Err(failure)
            }
        }
    }

    /// Runs the attempt body after the order has been claimed.
    ///
    /// Failures returned from here are recorded on the order by the caller;
    /// reservation cleanup happens at each failure site because only the
    /// site knows whether the remote side may hold a server.
    async fn run_claimed(&self, order: &Order) -> Result<ProvisionReceipt, ProvisionError> {
        let plan = self
            .catalog
            .get_active(&order.plan_id)
            .map_err(|err| ProvisionError::new(ProvisionErrorKind::PlanConfig, err.to_string()))?;

        if let Some(receipt) = self.adopt_existing(order, plan).await? {
            return Ok(receipt);
        }

        let instance = self.ensure_reservation(order, plan).await?;
        let node = match self.load_node(instance.node_id).await {
            Ok(node) => node,
            Err(failure) => {
                self.release_quietly(&instance.id).await;
                return Err(failure);
            }
        };

        let allocation = match self.claim_endpoint(&node, plan.game, &instance).await {
            Ok(allocation) => allocation,
            Err(failure) => {
                self.release_quietly(&instance.id).await;
                return Err(failure);
            }
        };

        let request = build_create_request(order, plan, allocation);
        let remote = match self.panel.create_server(&request).await {
            Ok(created) => RemoteIdentity {
                server_id: created.id,
                identifier: created.identifier,
            },
            Err(err) => {
                let failure =
                    remote_failure("create server", &err).with_allocation(allocation.id);
                if outcome_unknown(&err) {
                    // The server may exist. Keep the reservation so the next
                    // attempt finds it by external id instead of creating a
                    // duplicate.
                    warn!(
                        order_id = %order.id,
                        instance_id = %instance.id,
                        "create outcome unknown; reservation kept"
                    );
                } else {
                    self.release_quietly(&instance.id).await;
                }
                return Err(failure);
            }
        };

        // The pool entry just became assigned; drop the cached view.
        if let Err(err) = self.directory.invalidate(node.id) {
            warn!(node = %node.id, error = %err, "allocation cache invalidation failed");
        }

        match self.store.finalize_instance(&instance.id, &remote).await {
            Ok(CasResult::Success) => Ok(ProvisionReceipt {
                order_id: order.id,
                instance_id: instance.id,
                node_id: node.id,
                address: allocation.address(),
                remote,
                adopted: false,
            }),
            // The server exists remotely but the local flip failed; the
            // reservation stays so the drift sweep can finish the job.
            Ok(other) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!(
                    "server {} created but finalize was refused ({other:?})",
                    remote.server_id
                ),
            )),
            Err(err) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("server {} created but finalize failed: {err}", remote.server_id),
            )),
        }
    }

    /// Checks the panel for a server already tagged with this order's
    /// external id, and finishes the bookkeeping for it when one exists.
    async fn adopt_existing(
        &self,
        order: &Order,
        plan: &Plan,
    ) -> Result<Option<ProvisionReceipt>, ProvisionError> {
        let tag = order.external_tag();
        let found = self
            .panel
            .get_server_by_external_id(&tag)
            .await
            .map_err(|err| remote_failure("external id lookup", &err))?;
        let Some(server) = found else {
            return Ok(None);
        };

        info!(
            order_id = %order.id,
            server_id = server.id,
            identifier = %server.identifier,
            "remote server already exists for order; adopting"
        );
        let remote = RemoteIdentity {
            server_id: server.id,
            identifier: server.identifier.clone(),
        };

        let live = self
            .store
            .find_live_instance(&order.id)
            .await
            .map_err(|err| storage_failure("instance lookup", &err))?;
        let instance = match live {
            Some(existing) if existing.state == InstanceState::Reserved => existing,
            Some(existing) => {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!(
                        "order {} holds instance {} in {} while still provisioning",
                        order.id, existing.id, existing.state
                    ),
                ));
            }
            None => self.rebuild_reservation(order, plan, &server).await?,
        };

        let allocation = match instance.allocation {
            Some(bound) => bound,
            None => {
                let allocation = self.remote_allocation(&server).await?;
                match self.store.bind_allocation(&instance.id, allocation).await {
                    Ok(CasResult::Success) => allocation,
                    Ok(other) => {
                        return Err(ProvisionError::new(
                            ProvisionErrorKind::Persistence,
                            format!(
                                "endpoint {} of adopted server {} could not be claimed ({other:?})",
                                allocation.address(),
                                server.id
                            ),
                        ));
                    }
                    Err(err) => return Err(storage_failure("bind adopted allocation", &err)),
                }
            }
        };

        match self.store.finalize_instance(&instance.id, &remote).await {
            Ok(CasResult::Success) => Ok(Some(ProvisionReceipt {
                order_id: order.id,
                instance_id: instance.id,
                node_id: instance.node_id,
                address: allocation.address(),
                remote,
                adopted: true,
            })),
            Ok(other) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!(
                    "adopted server {} could not be finalized ({other:?})",
                    server.id
                ),
            )),
            Err(err) => Err(storage_failure("finalize adopted instance", &err)),
        }
    }

    /// Rebuilds a capacity reservation for a remote server whose local
    /// instance row was lost.
    async fn rebuild_reservation(
        &self,
        order: &Order,
        plan: &Plan,
        server: &RemoteServer,
    ) -> Result<ServerInstance, ProvisionError> {
        let Some(panel_node_id) = server.node else {
            return Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("remote server {} reports no hosting node", server.id),
            ));
        };
        let node = self
            .node_by_panel_id(panel_node_id)
            .await?
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!("no fleet row maps to panel node {panel_node_id}"),
                )
            })?;

        let instance = ServerInstance::reserve(order.id, node.id, plan.memory_mb);
        match self.store.reserve_capacity(&instance).await {
            Ok(CasResult::Success) => Ok(instance),
            Ok(CasResult::CapacityExceeded { available_mb }) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!(
                    "node {} has {available_mb} MB free, too little to account \
                     existing server {}; needs operator attention",
                    node.id, server.id
                ),
            )),
            Ok(other) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("reservation rebuild refused ({other:?})"),
            )),
            Err(err) => Err(storage_failure("rebuild reservation", &err)),
        }
    }

    /// Looks up the allocation a remote server is bound to.
    async fn remote_allocation(&self, server: &RemoteServer) -> Result<Allocation, ProvisionError> {
        let Some(allocation_id) = server.allocation_id else {
            return Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("remote server {} has no allocation bound", server.id),
            ));
        };
        let Some(panel_node_id) = server.node else {
            return Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("remote server {} reports no hosting node", server.id),
            ));
        };
        let pool = self
            .panel
            .list_allocations(panel_node_id)
            .await
            .map_err(|err| remote_failure("allocation lookup", &err))?;
        pool.into_iter()
            .find(|allocation| allocation.id == allocation_id)
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!(
                        "allocation {allocation_id} not advertised by panel node {panel_node_id}"
                    ),
                )
            })
    }

    /// Returns the order's live reservation, creating one when none exists.
    async fn ensure_reservation(
        &self,
        order: &Order,
        plan: &Plan,
    ) -> Result<ServerInstance, ProvisionError> {
        match self
            .store
            .find_live_instance(&order.id)
            .await
            .map_err(|err| storage_failure("instance lookup", &err))?
        {
            Some(existing) if existing.state == InstanceState::Reserved => {
                debug!(
                    order_id = %order.id,
                    instance_id = %existing.id,
                    "reusing reservation from an earlier attempt"
                );
                return Ok(existing);
            }
            Some(existing) => {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!(
                        "order {} holds instance {} in {} while still provisioning",
                        order.id, existing.id, existing.state
                    ),
                ));
            }
            None => {}
        }

        for _ in 0..PLACEMENT_RETRIES {
            let snapshot = self
                .store
                .capacity_snapshot(&order.region)
                .await
                .map_err(|err| storage_failure("capacity snapshot", &err))?;
            let Some(node_id) = select_node(plan.memory_mb, &snapshot) else {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::NodeCapacity,
                    format!(
                        "no enabled node in {} has {} MB free",
                        order.region, plan.memory_mb
                    ),
                ));
            };

            let instance = ServerInstance::reserve(order.id, node_id, plan.memory_mb);
            match self.store.reserve_capacity(&instance).await {
                Ok(CasResult::Success) => return Ok(instance),
                // Lost the commit race or the node went away; re-select
                // from a fresh snapshot.
                Ok(CasResult::CapacityExceeded { .. } | CasResult::NotFound) => {}
                Ok(other) => {
                    return Err(ProvisionError::new(
                        ProvisionErrorKind::Persistence,
                        format!("reservation refused ({other:?})"),
                    ));
                }
                Err(err) => return Err(storage_failure("reserve capacity", &err)),
            }
        }

        Err(ProvisionError::new(
            ProvisionErrorKind::NodeCapacity,
            format!(
                "lost the reservation race {PLACEMENT_RETRIES} times in {}",
                order.region
            ),
        ))
    }

    /// Claims a free endpoint in the plan's port band on the chosen node.
    async fn claim_endpoint(
        &self,
        node: &Node,
        game: GameFamily,
        instance: &ServerInstance,
    ) -> Result<Allocation, ProvisionError> {
        if let Some(bound) = instance.allocation {
            return Ok(bound);
        }

        let mut candidates = self
            .directory
            .free_endpoints(node, game)
            .await
            .map_err(|err| remote_failure("allocation pool read", &err))?;

        for refreshed in [false, true] {
            if refreshed {
                // Every cached candidate was contended or stale; one forced
                // re-read before declaring the pool exhausted.
                candidates = self
                    .directory
                    .refresh(node, game)
                    .await
                    .map_err(|err| remote_failure("allocation pool refresh", &err))?;
            }
            for allocation in &candidates {
                match self.store.bind_allocation(&instance.id, *allocation).await {
                    Ok(CasResult::Success) => return Ok(*allocation),
                    Ok(CasResult::AllocationTaken) => {}
                    Ok(other) => {
                        return Err(ProvisionError::new(
                            ProvisionErrorKind::Persistence,
                            format!("endpoint claim refused ({other:?})"),
                        ));
                    }
                    Err(err) => return Err(storage_failure("bind allocation", &err)),
                }
            }
        }

        Err(ProvisionError::new(
            ProvisionErrorKind::AllocationPool,
            format!("no free {game} endpoint on node {}", node.id),
        ))
    }

    /// Builds the no-op receipt for an order that is already `PROVISIONED`.
    async fn replay_receipt(&self, order: &Order) -> Result<ProvisionReceipt, ProvisionError> {
        let instance = self
            .store
            .find_live_instance(&order.id)
            .await
            .map_err(|err| storage_failure("instance lookup", &err))?
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!("order {} is PROVISIONED but has no live instance", order.id),
                )
            })?;
        let remote = instance.remote.clone().ok_or_else(|| {
            ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("instance {} is live without a remote identity", instance.id),
            )
        })?;
        let address = instance.address().ok_or_else(|| {
            ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("instance {} is live without an allocation", instance.id),
            )
        })?;

        debug!(order_id = %order.id, "order already provisioned; returning existing placement");
        Ok(ProvisionReceipt {
            order_id: order.id,
            instance_id: instance.id,
            node_id: instance.node_id,
            address,
            remote,
            adopted: false,
        })
    }

    /// Claims the order for this attempt via the status compare-and-set.
    async fn claim(
        &self,
        order: &Order,
        reason: TransitionReason,
    ) -> Result<(), ProvisionError> {
        let expected = match order.status {
            OrderStatus::Paid | OrderStatus::Error => order.status,
            other => {
                return Err(ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!("order {} is {other} and cannot start provisioning", order.id),
                ));
            }
        };

        match self
            .store
            .cas_order_status(&order.id, expected, OrderStatus::Provisioning, reason)
            .await
        {
            Ok(CasResult::Success) => {
                self.metrics.record_order_transition(
                    &expected.to_string(),
                    &OrderStatus::Provisioning.to_string(),
                );
                Ok(())
            }
            Ok(CasResult::NotFound) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("order {} disappeared before it could be claimed", order.id),
            )),
            Ok(CasResult::OrderStateMismatch { actual }) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!(
                    "order {} moved to {actual} before this attempt could claim it",
                    order.id
                ),
            )),
            Ok(other) => Err(ProvisionError::new(
                ProvisionErrorKind::Persistence,
                format!("unexpected claim result ({other:?})"),
            )),
            Err(err) => Err(storage_failure("claim order", &err)),
        }
    }

    /// Records a failed attempt on the order; best-effort.
    async fn record_failure(&self, order_id: &OrderId, failure: &ProvisionError) {
        match self.store.record_order_failure(order_id, failure).await {
            Ok(CasResult::Success) => {
                self.metrics.record_order_transition(
                    &OrderStatus::Provisioning.to_string(),
                    &OrderStatus::Error.to_string(),
                );
            }
            Ok(other) => {
                warn!(order_id = %order_id, result = ?other, "could not record provisioning failure");
            }
            Err(err) => {
                warn!(order_id = %order_id, error = %err, "failed to persist provisioning failure");
            }
        }
    }

    /// Deletes a reservation; logs instead of failing, the attempt already
    /// has an error to report.
    async fn release_quietly(&self, instance_id: &berth_core::InstanceId) {
        match self.store.release_reservation(instance_id).await {
            Ok(CasResult::Success) => {}
            Ok(other) => {
                debug!(instance_id = %instance_id, result = ?other, "reservation was not releasable");
            }
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "failed to release reservation");
            }
        }
    }

    async fn load_order(&self, order_id: &OrderId) -> Result<Order, ProvisionError> {
        self.store
            .get_order(order_id)
            .await
            .map_err(|err| storage_failure("order lookup", &err))?
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!("order {order_id} not found"),
                )
            })
    }

    async fn load_node(&self, node_id: NodeId) -> Result<Node, ProvisionError> {
        self.store
            .get_node(node_id)
            .await
            .map_err(|err| storage_failure("node lookup", &err))?
            .ok_or_else(|| {
                ProvisionError::new(
                    ProvisionErrorKind::Persistence,
                    format!("node {node_id} missing from the fleet"),
                )
            })
    }

    async fn node_by_panel_id(&self, panel_node_id: u32) -> Result<Option<Node>, ProvisionError> {
        let nodes = self
            .store
            .list_nodes()
            .await
            .map_err(|err| storage_failure("node list", &err))?;
        Ok(nodes
            .into_iter()
            .find(|node| node.pterodactyl_node_id == panel_node_id))
    }
}

fn build_create_request(order: &Order, plan: &Plan, allocation: Allocation) -> CreateServerRequest {
    CreateServerRequest {
        name: order.server_name.clone(),
        owner_user_ref: order.user_id.clone(),
        egg: plan.egg_id,
        docker_image: plan.docker_image.clone(),
        startup: plan.startup_command.clone(),
        environment: plan.environment.clone(),
        limits: ServerLimits {
            memory: plan.memory_mb,
            swap: plan.swap_mb,
            disk: plan.disk_mb,
            io: plan.io_weight,
            cpu: plan.cpu_percent,
        },
        allocation: allocation.id,
        external_id: order.external_tag(),
    }
}

fn storage_failure(context: &str, err: &Error) -> ProvisionError {
    ProvisionError::new(ProvisionErrorKind::Persistence, format!("{context}: {err}"))
}

fn remote_failure(context: &str, err: &Error) -> ProvisionError {
    ProvisionError::new(ProvisionErrorKind::RemoteCall, format!("{context}: {err}"))
}

fn outcome_unknown(err: &Error) -> bool {
    matches!(
        err,
        Error::Panel {
            outcome_unknown: true,
            ..
        }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::BillingTerm;
    use crate::panel::fake::{CreateFailure, FakePanel};
    use crate::store::memory::InMemoryStore;
    use berth_core::PlanId;
    use std::net::IpAddr;

    struct Harness {
        store: Arc<InMemoryStore>,
        panel: Arc<FakePanel>,
        provisioner: Provisioner,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(FakePanel::new());
        let directory = Arc::new(AllocationDirectory::new(
            panel.clone(),
            crate::allocation::PortBandPolicy::default(),
        ));
        let provisioner = Provisioner::new(
            store.clone() as Arc<dyn Store>,
            panel.clone(),
            directory,
            Arc::new(PlanCatalog::builtin()),
        );
        Harness {
            store,
            panel,
            provisioner,
        }
    }

    fn test_ip() -> IpAddr {
        "192.0.2.10".parse().expect("test ip")
    }

    /// Registers a fleet node backed by a matching panel node with free
    /// Java-band allocations.
    async fn add_node(
        h: &Harness,
        id: u32,
        panel_id: u32,
        region: &str,
        max_gb: u32,
        ports: &[u16],
    ) -> crate::error::Result<Node> {
        let node = Node::new(
            berth_core::NodeId::new(id),
            format!("node-{id:02}"),
            region,
            panel_id,
            test_ip(),
            max_gb,
            2,
        );
        h.store.upsert_node(&node).await?;
        h.panel.add_node(panel_id, node.name.clone(), max_gb * 1024)?;
        h.panel.seed_allocations(panel_id, test_ip(), ports)?;
        Ok(node)
    }

    async fn paid_order(h: &Harness, sub: &str, plan: &str) -> crate::error::Result<Order> {
        let mut order = Order::new(
            "user_42",
            PlanId::new(plan),
            "us-east",
            "my server",
            BillingTerm::Monthly,
            sub,
        );
        order.transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)?;
        h.store.insert_order_if_absent(&order).await?;
        Ok(order)
    }

    #[tokio::test]
    async fn provisions_paid_order_end_to_end() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565, 25566]).await?;
        let order = paid_order(&h, "sub_e2e", "mc-java-4gb").await?;

        let receipt = h
            .provisioner
            .provision(order.id)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        assert_eq!(receipt.order_id, order.id);
        assert_eq!(receipt.node_id, berth_core::NodeId::new(1));
        assert_eq!(receipt.address, "192.0.2.10:25565");
        assert!(!receipt.adopted);

        let stored = h
            .store
            .get_order(&order.id)
            .await?
            .ok_or_else(|| Error::storage("order missing"))?;
        assert_eq!(stored.status, OrderStatus::Provisioned);
        assert_eq!(stored.pterodactyl_server_id, Some(receipt.remote.server_id));
        assert_eq!(stored.node_id, Some(berth_core::NodeId::new(1)));
        assert_eq!(stored.attempts, 1);

        // 10 GB node, 2 GB headroom, 4 GB plan: 4096 MB left.
        let snapshot = h.store.capacity_snapshot("us-east").await?;
        assert_eq!(snapshot[0].available_mb, 4096);

        let created = h.panel.get_server(receipt.remote.server_id).await?;
        assert_eq!(created.external_id, Some(format!("berth:{}", order.id)));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_plan_is_a_permanent_failure() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565]).await?;
        let order = paid_order(&h, "sub_plan", "ghost-plan").await?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("missing plan must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::PlanConfig);
        assert!(!failure.is_retryable());

        let stored = h
            .store
            .get_order(&order.id)
            .await?
            .ok_or_else(|| Error::storage("order missing"))?;
        assert_eq!(stored.status, OrderStatus::Error);
        assert!(stored.is_terminal());
        assert!(!stored.can_retry());
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_region_fails_transient() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "eu-west", 10, &[25565]).await?;
        let order = paid_order(&h, "sub_cap", "mc-java-4gb").await?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("wrong region must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::NodeCapacity);
        assert!(failure.is_retryable());

        let stored = h
            .store
            .get_order(&order.id)
            .await?
            .ok_or_else(|| Error::storage("order missing"))?;
        assert_eq!(stored.status, OrderStatus::Error);
        assert!(stored.can_retry());
        assert!(h.store.list_instances().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn exhausted_pool_releases_the_reservation() -> crate::error::Result<()> {
        let h = harness();
        // Node exists but advertises no allocations at all.
        add_node(&h, 1, 7, "us-east", 10, &[]).await?;
        let order = paid_order(&h, "sub_pool", "mc-java-4gb").await?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("empty pool must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::AllocationPool);

        assert!(h.store.list_instances().await?.is_empty());
        let snapshot = h.store.capacity_snapshot("us-east").await?;
        assert_eq!(snapshot[0].available_mb, 8192, "capacity fully released");
        Ok(())
    }

    #[tokio::test]
    async fn panel_rejection_releases_and_is_retryable() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565]).await?;
        let order = paid_order(&h, "sub_rej", "mc-java-4gb").await?;
        h.panel.fail_next_create(CreateFailure::Status(500))?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("rejected create must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::RemoteCall);
        assert!(h.store.list_instances().await?.is_empty());
        assert_eq!(h.panel.server_count()?, 0);

        // A clean retry provisions normally.
        let receipt = h
            .provisioner
            .retry(order.id, TransitionReason::ReconcilerRetry)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        assert!(!receipt.adopted);
        assert_eq!(h.panel.create_calls()?, 2);
        assert_eq!(h.panel.server_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn ambiguous_create_is_adopted_on_retry() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565, 25566]).await?;
        let order = paid_order(&h, "sub_adopt", "mc-java-4gb").await?;
        h.panel.fail_next_create(CreateFailure::TimeoutAfterCreate)?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("timed-out create must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::RemoteCall);
        // The server landed remotely and the reservation was kept.
        assert_eq!(h.panel.server_count()?, 1);
        let instances = h.store.list_instances().await?;
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].state, InstanceState::Reserved);

        let receipt = h
            .provisioner
            .retry(order.id, TransitionReason::ReconcilerRetry)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        assert!(receipt.adopted);
        assert_eq!(receipt.instance_id, instances[0].id);
        // No second create happened.
        assert_eq!(h.panel.create_calls()?, 1);
        assert_eq!(h.panel.server_count()?, 1);

        let stored = h
            .store
            .get_order(&order.id)
            .await?
            .ok_or_else(|| Error::storage("order missing"))?;
        assert_eq!(stored.status, OrderStatus::Provisioned);
        Ok(())
    }

    #[tokio::test]
    async fn ambiguous_timeout_without_create_reuses_reservation() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565]).await?;
        let order = paid_order(&h, "sub_lost", "mc-java-4gb").await?;
        h.panel
            .fail_next_create(CreateFailure::TimeoutWithoutCreate)?;

        let failure = h
            .provisioner
            .provision(order.id)
            .await
            .expect_err("timed-out create must fail");
        assert_eq!(failure.kind, ProvisionErrorKind::RemoteCall);
        // Outcome was unknown, so the reservation survives.
        let instances = h.store.list_instances().await?;
        assert_eq!(instances.len(), 1);
        let reserved_id = instances[0].id;

        let receipt = h
            .provisioner
            .retry(order.id, TransitionReason::ReconcilerRetry)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        // Nothing to adopt; the same reservation carried the fresh create.
        assert!(!receipt.adopted);
        assert_eq!(receipt.instance_id, reserved_id);
        assert_eq!(h.panel.create_calls()?, 2);
        assert_eq!(h.panel.server_count()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn provisioned_order_is_a_no_op() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565, 25566]).await?;
        let order = paid_order(&h, "sub_noop", "mc-java-4gb").await?;

        let first = h
            .provisioner
            .provision(order.id)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        let second = h
            .provisioner
            .provision(order.id)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;

        assert_eq!(first.instance_id, second.instance_id);
        assert_eq!(first.address, second.address);
        assert_eq!(h.panel.create_calls()?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_attempts_create_one_server() -> crate::error::Result<()> {
        let h = harness();
        add_node(&h, 1, 7, "us-east", 10, &[25565, 25566]).await?;
        let order = paid_order(&h, "sub_race", "mc-java-4gb").await?;

        let (a, b) = tokio::join!(
            h.provisioner.provision(order.id),
            h.provisioner.provision(order.id)
        );
        // At most one attempt holds the claim; the other either loses the
        // status CAS or replays the finished placement.
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(h.panel.create_calls()?, 1);
        assert_eq!(h.panel.server_count()?, 1);

        let stored = h
            .store
            .get_order(&order.id)
            .await?
            .ok_or_else(|| Error::storage("order missing"))?;
        assert_eq!(stored.status, OrderStatus::Provisioned);
        assert_eq!(h.store.list_instances().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn packs_the_fullest_fitting_node() -> crate::error::Result<()> {
        let h = harness();
        // Node 1 has 8192 MB usable, node 2 has 6144; both fit a 4 GB plan,
        // the tighter node 2 must win.
        add_node(&h, 1, 7, "us-east", 10, &[25565]).await?;
        add_node(&h, 2, 8, "us-east", 8, &[25600]).await?;
        let order = paid_order(&h, "sub_fit", "mc-java-4gb").await?;

        let receipt = h
            .provisioner
            .provision(order.id)
            .await
            .map_err(|e| Error::storage(e.to_string()))?;
        assert_eq!(receipt.node_id, berth_core::NodeId::new(2));
        assert_eq!(receipt.address, "192.0.2.10:25600");
        Ok(())
    }
}
