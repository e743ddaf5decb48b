//! Node health sweep.
//!
//! A node's panel API answering `GET /nodes/{id}` is the liveness signal
//! for everything on it. The sweep probes every node, disables nodes
//! whose probe fails so the capacity selector stops placing onto them,
//! and re-enables nodes once the probe succeeds again.
//!
//! `last_seen_at` only moves on a successful probe; a failure leaves the
//! last good observation in place for operators reading the fleet view.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::metrics::ProvisionMetrics;
use crate::node::Node;
use crate::panel::PanelClient;
use crate::store::Store;

use super::{ReconcileSummary, SweepError};

/// What one probe result means for a node, given its current flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Probe succeeded and the node was already enabled.
    Healthy,
    /// Probe succeeded on a disabled node; re-enable it.
    Recovered,
    /// Probe failed on an enabled node; disable it.
    WentDark,
    /// Probe failed and the node is already disabled.
    StillDark,
}

/// Classifies a probe result against the node's stored flag.
#[must_use]
pub fn probe_outcome(node: &Node, probe_ok: bool) -> ProbeOutcome {
    match (probe_ok, node.enabled) {
        (true, true) => ProbeOutcome::Healthy,
        (true, false) => ProbeOutcome::Recovered,
        (false, true) => ProbeOutcome::WentDark,
        (false, false) => ProbeOutcome::StillDark,
    }
}

/// Probes every node and updates `enabled` flags and `last_seen_at`.
///
/// After the probes, free-memory gauges are refreshed from a capacity
/// snapshot of each region so dashboards track the post-probe view.
#[tracing::instrument(name = "health_sweep", skip_all)]
pub(super) async fn sweep(
    store: &dyn Store,
    panel: &dyn PanelClient,
    metrics: &ProvisionMetrics,
    summary: &mut ReconcileSummary,
) {
    let nodes = match store.list_nodes().await {
        Ok(nodes) => nodes,
        Err(err) => {
            summary
                .errors
                .push(SweepError::new("health", "list_nodes", &err));
            metrics.record_sweep("health", "failed");
            return;
        }
    };

    for node in &nodes {
        summary.nodes_probed += 1;
        let probe = panel.get_node(node.pterodactyl_node_id).await;
        let now = Utc::now();

        match probe_outcome(node, probe.is_ok()) {
            ProbeOutcome::Healthy => {
                if let Err(err) = store.record_node_seen(node.id, now).await {
                    summary.errors.push(SweepError::new("health", node.id, &err));
                }
            }
            ProbeOutcome::Recovered => {
                if let Err(err) = store.record_node_seen(node.id, now).await {
                    summary.errors.push(SweepError::new("health", node.id, &err));
                }
                match store.set_node_enabled(node.id, true).await {
                    Ok(_) => {
                        summary.nodes_reenabled += 1;
                        metrics.record_repair("health", "enable");
                        info!(node_id = %node.id, name = %node.name, "node probe recovered; re-enabled for placement");
                    }
                    Err(err) => {
                        summary.errors.push(SweepError::new("health", node.id, &err));
                    }
                }
            }
            ProbeOutcome::WentDark => match store.set_node_enabled(node.id, false).await {
                Ok(_) => {
                    summary.nodes_disabled += 1;
                    metrics.record_repair("health", "disable");
                    let reason = probe.err().map(|e| e.to_string()).unwrap_or_default();
                    warn!(node_id = %node.id, name = %node.name, %reason, "node probe failed; disabled for placement");
                }
                Err(err) => {
                    summary.errors.push(SweepError::new("health", node.id, &err));
                }
            },
            ProbeOutcome::StillDark => {
                debug!(node_id = %node.id, name = %node.name, "node still unreachable");
            }
        }
    }

    refresh_capacity_gauges(store, metrics, &nodes, summary).await;
    metrics.record_sweep("health", "ok");
}

/// Publishes per-node free-memory gauges from the post-probe snapshots.
async fn refresh_capacity_gauges(
    store: &dyn Store,
    metrics: &ProvisionMetrics,
    nodes: &[Node],
    summary: &mut ReconcileSummary,
) {
    let names: HashMap<_, _> = nodes.iter().map(|n| (n.id, n.name.as_str())).collect();
    let regions: BTreeSet<_> = nodes.iter().map(|n| n.region.as_str()).collect();

    for region in regions {
        match store.capacity_snapshot(region).await {
            Ok(snapshot) => {
                for capacity in snapshot {
                    if let Some(name) = names.get(&capacity.node_id) {
                        metrics.set_node_free_memory(name, capacity.available_mb);
                    }
                }
            }
            Err(err) => {
                summary.errors.push(SweepError::new("health", region, &err));
            }
        }
    }
}
