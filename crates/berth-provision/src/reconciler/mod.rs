//! Periodic repair of local records against remote reality.
//!
//! Provisioning attempts are short-lived invocations that may die at any
//! await point. Instead of distributed transactions, three sweeps converge
//! local state with the panel over time:
//!
//! - **Health** ([`health`]): probe every node's panel API; disable nodes
//!   whose probe fails so placement stops choosing them, re-enable them
//!   when the probe recovers
//! - **Stuck orders** ([`stuck`]): re-dispatch orders abandoned in `PAID`
//!   or `PROVISIONING` and retry `ERROR` orders under the attempt cap
//! - **Drift** ([`drift`]): compare live instances against the panel's
//!   server list; mark vanished servers lost, adopt orphans, flag what
//!   needs an operator
//!
//! Every sweep separates a pure scan (snapshots in, findings out) from the
//! execution phase that applies them, so the decision logic tests without
//! I/O. The sweeps run in a fixed order but do not depend on each other; a
//! sweep that cannot run is recorded in the summary and the tick moves on.

pub mod drift;
pub mod health;
pub mod stuck;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::{ProvisionMetrics, time_sweep};
use crate::panel::PanelClient;
use crate::provisioner::Provisioner;
use crate::store::Store;

pub use drift::DriftFinding;
pub use health::ProbeOutcome;
pub use stuck::{StuckRepair, StuckSweep};

/// Reconciler tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ReconcilerConfig {
    /// How long an order may sit in `PAID` or `PROVISIONING` before the
    /// stuck sweep presumes its invocation dead.
    #[serde(with = "humantime_serde")]
    pub stuck_after: Duration,
    /// Pause between ticks when running as an interval loop.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stuck_after: Duration::from_secs(10 * 60),
            interval: Duration::from_secs(60),
        }
    }
}

impl ReconcilerConfig {
    /// The staleness threshold as a chrono duration for timestamp math.
    #[must_use]
    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stuck_after).unwrap_or(chrono::Duration::MAX)
    }
}

/// One failure inside a sweep.
///
/// Per-subject failures do not stop a sweep; they are collected here so a
/// tick's response shows everything that went wrong.
#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    /// Which sweep hit the failure.
    pub sweep: String,
    /// The node, order, or server the failure concerns.
    pub subject: String,
    /// Failure detail.
    pub message: String,
}

impl SweepError {
    fn new(
        sweep: impl Into<String>,
        subject: impl std::fmt::Display,
        message: impl std::fmt::Display,
    ) -> Self {
        Self {
            sweep: sweep.into(),
            subject: subject.to_string(),
            message: message.to_string(),
        }
    }
}

/// What one reconciler tick did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    /// Nodes whose panel API was probed.
    pub nodes_probed: usize,
    /// Nodes disabled this tick because their probe failed.
    pub nodes_disabled: usize,
    /// Nodes re-enabled this tick after a probe recovered.
    pub nodes_reenabled: usize,
    /// Stale or failed orders re-dispatched to the provisioner.
    pub orders_redispatched: usize,
    /// Stale `PROVISIONING` attempts recorded as failed.
    pub orders_abandoned: usize,
    /// `ERROR` orders beyond repair, observed and left alone.
    pub orders_at_cap: usize,
    /// Active instances whose remote server is present and consistent.
    pub instances_matched: usize,
    /// Active instances whose remote server is gone, now marked lost.
    pub instances_lost: usize,
    /// Orphaned remote servers re-attached to their orders.
    pub orphans_adopted: usize,
    /// Disagreements flagged for an operator.
    pub conflicts_flagged: usize,
    /// Reservations released because their order is beyond retry.
    pub reservations_released: usize,
    /// Failures that did not stop the tick.
    pub errors: Vec<SweepError>,
}

impl ReconcileSummary {
    /// Returns true if every sweep ran without failures.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs the three repair sweeps over one store and panel.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    panel: Arc<dyn PanelClient>,
    provisioner: Arc<Provisioner>,
    config: ReconcilerConfig,
    metrics: ProvisionMetrics,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a reconciler over the given store, panel, and provisioner.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        panel: Arc<dyn PanelClient>,
        provisioner: Arc<Provisioner>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            panel,
            provisioner,
            config,
            metrics: ProvisionMetrics::new(),
        }
    }

    /// The configured tick interval, for callers running the loop.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.config.interval
    }

    /// Runs one full tick: health, stuck orders, drift, in that order.
    ///
    /// Health runs first so anything the later sweeps dispatch sees fresh
    /// `enabled` flags. The tick never fails as a whole; anything a sweep
    /// could not do is reported in the summary.
    #[tracing::instrument(name = "reconcile_tick", skip(self))]
    pub async fn run(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        {
            let _guard = time_sweep("health");
            health::sweep(
                self.store.as_ref(),
                self.panel.as_ref(),
                &self.metrics,
                &mut summary,
            )
            .await;
        }
        {
            let _guard = time_sweep("stuck");
            stuck::sweep(
                self.store.as_ref(),
                &self.provisioner,
                &self.metrics,
                self.config.stuck_threshold(),
                &mut summary,
            )
            .await;
        }
        {
            let _guard = time_sweep("drift");
            drift::sweep(
                self.store.as_ref(),
                self.panel.as_ref(),
                &self.provisioner,
                &self.metrics,
                &mut summary,
            )
            .await;
        }

        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::PortBandPolicy;
    use crate::catalog::PlanCatalog;
    use crate::directory::AllocationDirectory;
    use crate::error::Result;
    use crate::node::Node;
    use crate::order::{BillingTerm, Order, OrderStatus, TransitionReason};
    use crate::panel::fake::FakePanel;
    use crate::store::memory::InMemoryStore;
    use berth_core::{NodeId, PlanId};
    use std::net::IpAddr;

    fn test_ip() -> IpAddr {
        "192.0.2.10".parse().expect("test ip")
    }

    fn reconciler_over(
        store: &Arc<InMemoryStore>,
        panel: &Arc<FakePanel>,
        config: ReconcilerConfig,
    ) -> Reconciler {
        let directory = Arc::new(AllocationDirectory::new(
            panel.clone(),
            PortBandPolicy::default(),
        ));
        let provisioner = Arc::new(Provisioner::new(
            store.clone() as Arc<dyn Store>,
            panel.clone(),
            directory,
            Arc::new(PlanCatalog::builtin()),
        ));
        Reconciler::new(
            store.clone() as Arc<dyn Store>,
            panel.clone(),
            provisioner,
            config,
        )
    }

    async fn add_node(
        store: &InMemoryStore,
        panel: &FakePanel,
        id: u32,
        panel_id: u32,
        max_gb: u32,
        ports: &[u16],
    ) -> Result<Node> {
        let node = Node::new(
            NodeId::new(id),
            format!("node-{id:02}"),
            "us-east",
            panel_id,
            test_ip(),
            max_gb,
            2,
        );
        store.upsert_node(&node).await?;
        panel.add_node(panel_id, node.name.clone(), max_gb * 1024)?;
        panel.seed_allocations(panel_id, test_ip(), ports)?;
        Ok(node)
    }

    #[test]
    fn config_defaults_and_threshold() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.stuck_after, Duration::from_secs(600));
        assert_eq!(config.interval, Duration::from_secs(60));
        assert_eq!(config.stuck_threshold(), chrono::Duration::minutes(10));
    }

    #[test]
    fn config_parses_humantime_strings() {
        let config: ReconcilerConfig =
            serde_json::from_str(r#"{"stuck_after": "5m", "interval": "30s"}"#)
                .expect("config parses");
        assert_eq!(config.stuck_after, Duration::from_secs(300));
        assert_eq!(config.interval, Duration::from_secs(30));
    }

    /// A full tick over a half-dark fleet: the health sweep disables the
    /// unreachable node first, so the stuck sweep's dispatch places the
    /// abandoned order on the one that still answers.
    #[tokio::test]
    async fn tick_routes_around_a_dark_node() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(FakePanel::new());
        // The smaller node would win tightest-fit if it stayed enabled.
        add_node(&store, &panel, 1, 7, 8, &[25565]).await?;
        add_node(&store, &panel, 2, 8, 10, &[25566]).await?;
        panel.set_unreachable(7, true)?;

        let mut order = Order::new(
            "user_42",
            PlanId::new("mc-java-4gb"),
            "us-east",
            "my server",
            BillingTerm::Monthly,
            "sub_tick",
        );
        order.transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)?;
        order.status_changed_at = chrono::Utc::now() - chrono::Duration::minutes(30);
        store.save_order(&order).await?;

        let reconciler = reconciler_over(&store, &panel, ReconcilerConfig::default());
        let summary = reconciler.run().await;

        assert_eq!(summary.nodes_probed, 2);
        assert_eq!(summary.nodes_disabled, 1);
        assert_eq!(summary.orders_redispatched, 1);
        assert!(summary.is_clean(), "errors: {:?}", summary.errors);

        let node = store.get_node(NodeId::new(1)).await?.expect("node exists");
        assert!(!node.enabled);

        let placed = store.get_order(&order.id).await?.expect("order exists");
        assert_eq!(placed.status, OrderStatus::Provisioned);
        assert_eq!(placed.node_id, Some(NodeId::new(2)));
        Ok(())
    }

    /// A second tick over a converged system changes nothing.
    #[tokio::test]
    async fn tick_is_idempotent_once_converged() -> Result<()> {
        let store = Arc::new(InMemoryStore::new());
        let panel = Arc::new(FakePanel::new());
        add_node(&store, &panel, 1, 7, 10, &[25565]).await?;

        let mut order = Order::new(
            "user_42",
            PlanId::new("mc-java-4gb"),
            "us-east",
            "my server",
            BillingTerm::Monthly,
            "sub_idem",
        );
        order.transition_to(OrderStatus::Paid, TransitionReason::PaymentReceived)?;
        order.status_changed_at = chrono::Utc::now() - chrono::Duration::minutes(30);
        store.save_order(&order).await?;

        let reconciler = reconciler_over(&store, &panel, ReconcilerConfig::default());
        let first = reconciler.run().await;
        assert_eq!(first.orders_redispatched, 1);

        let second = reconciler.run().await;
        assert_eq!(second.orders_redispatched, 0);
        assert_eq!(second.orders_abandoned, 0);
        assert_eq!(second.instances_matched, 1);
        assert_eq!(second.instances_lost, 0);
        assert_eq!(panel.create_calls()?, 1);
        Ok(())
    }
}
