//! Drift sweep: local records versus the panel's server list.
//!
//! The panel is the source of truth for which servers actually exist.
//! Admins delete servers from its UI, nodes lose disks, and ambiguous
//! create calls leave servers behind that no local row points at. The
//! sweep classifies every pairing of local record and remote server:
//!
//! - **Matched**: an `ACTIVE` instance has its server; nothing to do
//! - **Missing**: the server is gone; mark the instance `LOST` and
//!   re-open the order rather than silently deleting history
//! - **Orphaned**: a server tagged for an order that holds no live
//!   instance; re-invoke the provisioner, whose external-id pre-flight
//!   adopts the server instead of creating a second one
//! - **Conflicting**: records disagree in a way no automatic repair is
//!   safe to fix; flag it and leave everything in place
//!
//! Servers without our external-id tag belong to other tools or manual
//! imports and are never touched.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use berth_core::{InstanceId, OrderId};

use crate::error::{ProvisionError, ProvisionErrorKind};
use crate::instance::{InstanceState, ServerInstance};
use crate::metrics::ProvisionMetrics;
use crate::order::{Order, OrderStatus, TransitionReason, parse_external_tag};
use crate::panel::{PanelClient, RemoteServer};
use crate::provisioner::Provisioner;
use crate::store::{CasResult, Store};

use super::{ReconcileSummary, SweepError};

/// How one local record or remote server lines up against the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriftFinding {
    /// An `ACTIVE` instance whose remote server exists and carries its tag.
    Matched {
        /// The instance.
        instance_id: InstanceId,
        /// The remote server backing it.
        server_id: u64,
    },
    /// An order's placed server no longer exists on the panel.
    Missing {
        /// The order to re-open.
        order_id: OrderId,
        /// The `ACTIVE` instance to mark lost, when one still exists.
        instance_id: Option<InstanceId>,
        /// The remote id the records pointed at.
        server_id: Option<u64>,
    },
    /// A tagged remote server whose order holds no usable placement.
    Orphaned {
        /// The order the tag names.
        order_id: OrderId,
        /// The server to adopt.
        server_id: u64,
    },
    /// Records disagree in a way the sweep will not repair on its own.
    Conflicting {
        /// The order involved, when one is known.
        order_id: Option<OrderId>,
        /// The server involved, when one is known.
        server_id: Option<u64>,
        /// What disagrees.
        detail: String,
    },
    /// A `RESERVED` instance whose order is beyond retry and has no
    /// server to adopt; its capacity hold serves nothing.
    StaleReservation {
        /// The reservation to release.
        instance_id: InstanceId,
        /// The order it belonged to.
        order_id: OrderId,
    },
    /// A remote server without our tag; not ours to manage.
    Foreign {
        /// The untagged server.
        server_id: u64,
    },
}

/// Classifies instances, orders, and remote servers against each other.
///
/// Pure over its snapshots: callers fetch, this decides, the executor
/// applies. Findings come out in a deterministic order (instances, then
/// orders, then servers, each as listed).
#[must_use]
pub fn scan(
    instances: &[ServerInstance],
    orders: &[Order],
    servers: &[RemoteServer],
) -> Vec<DriftFinding> {
    let server_by_id: HashMap<u64, &RemoteServer> = servers.iter().map(|s| (s.id, s)).collect();
    let server_by_order: HashMap<OrderId, &RemoteServer> = servers
        .iter()
        .filter_map(|s| tag_of(s).map(|order_id| (order_id, s)))
        .collect();
    let order_by_id: HashMap<OrderId, &Order> = orders.iter().map(|o| (o.id, o)).collect();
    let live_by_order: HashMap<OrderId, &ServerInstance> = instances
        .iter()
        .filter(|i| i.holds_capacity())
        .map(|i| (i.order_id, i))
        .collect();

    let mut findings = Vec::new();

    for instance in instances {
        match instance.state {
            InstanceState::Active => {
                check_active(instance, &server_by_id, &mut findings);
            }
            InstanceState::Reserved => {
                check_reserved(instance, &order_by_id, &server_by_order, &mut findings);
            }
            InstanceState::Lost => {}
        }
    }

    for order in orders {
        if order.status == OrderStatus::Provisioned && !live_by_order.contains_key(&order.id) {
            findings.push(DriftFinding::Missing {
                order_id: order.id,
                instance_id: None,
                server_id: order.pterodactyl_server_id,
            });
        }
    }

    for server in servers {
        check_server(server, &order_by_id, &live_by_order, &mut findings);
    }

    findings
}

fn tag_of(server: &RemoteServer) -> Option<OrderId> {
    server.external_id.as_deref().and_then(parse_external_tag)
}

fn check_active(
    instance: &ServerInstance,
    server_by_id: &HashMap<u64, &RemoteServer>,
    findings: &mut Vec<DriftFinding>,
) {
    let Some(remote) = instance.remote.as_ref() else {
        findings.push(DriftFinding::Conflicting {
            order_id: Some(instance.order_id),
            server_id: None,
            detail: format!("active instance {} carries no remote identity", instance.id),
        });
        return;
    };

    match server_by_id.get(&remote.server_id) {
        Some(server) if tag_of(server) == Some(instance.order_id) => {
            findings.push(DriftFinding::Matched {
                instance_id: instance.id,
                server_id: remote.server_id,
            });
        }
        Some(server) => {
            findings.push(DriftFinding::Conflicting {
                order_id: Some(instance.order_id),
                server_id: Some(server.id),
                detail: format!(
                    "server {} is tagged {:?}, not for order {}",
                    server.id, server.external_id, instance.order_id
                ),
            });
        }
        None => {
            findings.push(DriftFinding::Missing {
                order_id: instance.order_id,
                instance_id: Some(instance.id),
                server_id: Some(remote.server_id),
            });
        }
    }
}

fn check_reserved(
    instance: &ServerInstance,
    order_by_id: &HashMap<OrderId, &Order>,
    server_by_order: &HashMap<OrderId, &RemoteServer>,
    findings: &mut Vec<DriftFinding>,
) {
    let Some(order) = order_by_id.get(&instance.order_id) else {
        findings.push(DriftFinding::Conflicting {
            order_id: Some(instance.order_id),
            server_id: None,
            detail: format!(
                "reserved instance {} references an unknown order",
                instance.id
            ),
        });
        return;
    };

    // A reservation is healthy while its order can still move; the stuck
    // sweep owns getting it there.
    if order.status != OrderStatus::Error || order.can_retry() {
        return;
    }

    match server_by_order.get(&instance.order_id) {
        Some(server) => findings.push(DriftFinding::Orphaned {
            order_id: instance.order_id,
            server_id: server.id,
        }),
        None => findings.push(DriftFinding::StaleReservation {
            instance_id: instance.id,
            order_id: instance.order_id,
        }),
    }
}

fn check_server(
    server: &RemoteServer,
    order_by_id: &HashMap<OrderId, &Order>,
    live_by_order: &HashMap<OrderId, &ServerInstance>,
    findings: &mut Vec<DriftFinding>,
) {
    let Some(order_id) = tag_of(server) else {
        findings.push(DriftFinding::Foreign {
            server_id: server.id,
        });
        return;
    };

    if let Some(instance) = live_by_order.get(&order_id) {
        // The instance loop judged this pairing; the only thing left to
        // catch is a second server tagged for the same order.
        if instance
            .remote
            .as_ref()
            .is_some_and(|r| r.server_id != server.id)
        {
            findings.push(DriftFinding::Conflicting {
                order_id: Some(order_id),
                server_id: Some(server.id),
                detail: format!("second server tagged for order {order_id}"),
            });
        }
        return;
    }

    let Some(order) = order_by_id.get(&order_id) else {
        findings.push(DriftFinding::Conflicting {
            order_id: Some(order_id),
            server_id: Some(server.id),
            detail: format!("server {} tagged for an unknown order", server.id),
        });
        return;
    };

    match order.status {
        OrderStatus::Error => {
            if order
                .last_error
                .as_ref()
                .is_none_or(ProvisionError::is_retryable)
            {
                findings.push(DriftFinding::Orphaned {
                    order_id,
                    server_id: server.id,
                });
            } else {
                findings.push(DriftFinding::Conflicting {
                    order_id: Some(order_id),
                    server_id: Some(server.id),
                    detail: format!(
                        "server {} exists but order {} holds a non-retryable failure",
                        server.id, order_id
                    ),
                });
            }
        }
        // An attempt in flight adopts the server itself; a provisioned
        // order with no live instance was re-opened by the order pass.
        OrderStatus::Paid | OrderStatus::Provisioning | OrderStatus::Provisioned => {}
        OrderStatus::Pending => {
            findings.push(DriftFinding::Conflicting {
                order_id: Some(order_id),
                server_id: Some(server.id),
                detail: format!(
                    "server {} exists for order {} that never confirmed payment",
                    server.id, order_id
                ),
            });
        }
    }
}

/// Fetches the three snapshots, scans, and applies the findings.
#[tracing::instrument(name = "drift_sweep", skip_all)]
pub(super) async fn sweep(
    store: &dyn Store,
    panel: &dyn PanelClient,
    provisioner: &Provisioner,
    metrics: &ProvisionMetrics,
    summary: &mut ReconcileSummary,
) {
    let snapshots = async {
        let instances = store.list_instances().await?;
        let orders = store.list_orders().await?;
        let servers = panel.list_servers().await?;
        crate::error::Result::Ok((instances, orders, servers))
    };
    let (instances, orders, servers) = match snapshots.await {
        Ok(snapshots) => snapshots,
        Err(err) => {
            summary
                .errors
                .push(SweepError::new("drift", "snapshots", &err));
            metrics.record_sweep("drift", "failed");
            return;
        }
    };

    for finding in scan(&instances, &orders, &servers) {
        match finding {
            DriftFinding::Matched { .. } => {
                summary.instances_matched += 1;
            }
            DriftFinding::Foreign { server_id } => {
                debug!(server_id, "remote server without our tag; ignoring");
            }
            DriftFinding::Missing {
                order_id,
                instance_id,
                server_id,
            } => {
                apply_missing(store, metrics, summary, order_id, instance_id, server_id).await;
            }
            DriftFinding::Orphaned {
                order_id,
                server_id,
            } => {
                info!(%order_id, server_id, "adopting orphaned remote server");
                match provisioner
                    .retry(order_id, TransitionReason::OrphanAdopted)
                    .await
                {
                    Ok(_) => {
                        summary.orphans_adopted += 1;
                        metrics.record_repair("drift", "adopt");
                    }
                    Err(failure) => {
                        warn!(%order_id, %failure, "orphan adoption failed; recorded on the order");
                    }
                }
            }
            DriftFinding::Conflicting {
                order_id,
                server_id,
                detail,
            } => {
                warn!(?order_id, ?server_id, %detail, "drift needs an operator");
                metrics.record_repair("drift", "flag");
                summary.conflicts_flagged += 1;
            }
            DriftFinding::StaleReservation {
                instance_id,
                order_id,
            } => match store.release_reservation(&instance_id).await {
                Ok(CasResult::Success) => {
                    info!(%instance_id, %order_id, "released reservation held by an order beyond retry");
                    metrics.record_repair("drift", "release");
                    summary.reservations_released += 1;
                }
                Ok(other) => {
                    debug!(%instance_id, ?other, "reservation moved before release landed");
                }
                Err(err) => {
                    summary
                        .errors
                        .push(SweepError::new("drift", instance_id, &err));
                }
            },
        }
    }

    metrics.record_sweep("drift", "ok");
}

/// Marks the instance lost (when one remains) and re-opens the order.
async fn apply_missing(
    store: &dyn Store,
    metrics: &ProvisionMetrics,
    summary: &mut ReconcileSummary,
    order_id: OrderId,
    instance_id: Option<InstanceId>,
    server_id: Option<u64>,
) {
    if let Some(instance_id) = instance_id {
        match store.mark_instance_lost(&instance_id).await {
            Ok(CasResult::Success) => {
                summary.instances_lost += 1;
                metrics.record_repair("drift", "mark_lost");
            }
            Ok(other) => {
                debug!(%instance_id, ?other, "instance moved before it could be marked lost");
            }
            Err(err) => {
                summary
                    .errors
                    .push(SweepError::new("drift", instance_id, &err));
            }
        }
    }

    let message = match server_id {
        Some(id) => format!("remote server {id} no longer exists on the panel"),
        None => "no remote server recorded for a provisioned order".to_string(),
    };
    let loss = ProvisionError::new(ProvisionErrorKind::RemoteCall, message);
    match store.mark_order_vanished(&order_id, &loss).await {
        Ok(CasResult::Success) => {
            warn!(%order_id, ?server_id, "provisioned order lost its remote server");
            metrics.record_repair("drift", "vanish");
            metrics.record_order_transition(
                &OrderStatus::Provisioned.to_string(),
                &OrderStatus::Error.to_string(),
            );
        }
        Ok(other) => {
            debug!(%order_id, ?other, "order moved before vanish landed");
        }
        Err(err) => {
            summary.errors.push(SweepError::new("drift", order_id, &err));
        }
    }
}
