//! Stuck-order sweep.
//!
//! Orders move through `PAID` and `PROVISIONING` inside one short-lived
//! invocation. When that invocation dies (process restart, container
//! eviction, a lost spawn), the order stays put with nothing scheduled to
//! move it. The sweep finds three shapes of stuck work:
//!
//! - `ERROR` under the attempt cap: re-dispatch
//! - `PAID` past the staleness threshold: the dispatch after intake never
//!   ran; re-dispatch
//! - `PROVISIONING` past the threshold: the attempt died mid-flight;
//!   record the abandonment as a failure, then re-dispatch under the cap
//!
//! Staleness keys off `status_changed_at`, so a healthy attempt that is
//! simply slow resets its own clock with every transition it makes.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use berth_core::OrderId;

use crate::error::{ProvisionError, ProvisionErrorKind};
use crate::metrics::ProvisionMetrics;
use crate::order::{Order, OrderStatus, TransitionReason};
use crate::provisioner::Provisioner;
use crate::store::{CasResult, Store};

use super::{ReconcileSummary, SweepError};

/// Repair action for one stuck order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StuckRepair {
    /// Re-invoke the provisioner for an order that can still move.
    Redispatch {
        /// The order to re-dispatch.
        order_id: OrderId,
        /// Reason the repair was triggered.
        reason: String,
    },
    /// Record a stale `PROVISIONING` attempt as failed, then re-dispatch
    /// if the cap still allows.
    MarkAbandoned {
        /// The order whose attempt died.
        order_id: OrderId,
        /// Seconds the order sat without progress.
        stale_secs: i64,
    },
    /// In `ERROR` beyond the attempt cap or holding a non-retryable
    /// failure; counted and left for an operator.
    AtCap {
        /// The order left alone.
        order_id: OrderId,
    },
}

/// Scanner that finds orders needing a push.
#[derive(Debug, Clone, Copy)]
pub struct StuckSweep {
    /// How long an order may sit in `PAID` or `PROVISIONING` before its
    /// invocation is presumed dead.
    stuck_after: Duration,
}

impl StuckSweep {
    /// Creates a scanner with the given staleness threshold.
    #[must_use]
    pub fn new(stuck_after: Duration) -> Self {
        Self { stuck_after }
    }

    /// Scans order snapshots and returns repairs in input order.
    #[must_use]
    pub fn scan(&self, orders: &[Order], now: DateTime<Utc>) -> Vec<StuckRepair> {
        orders
            .iter()
            .filter_map(|order| self.check_order(order, now))
            .collect()
    }

    fn check_order(&self, order: &Order, now: DateTime<Utc>) -> Option<StuckRepair> {
        match order.status {
            OrderStatus::Error => {
                if order.can_retry() {
                    Some(StuckRepair::Redispatch {
                        order_id: order.id,
                        reason: "retryable_error".to_string(),
                    })
                } else {
                    Some(StuckRepair::AtCap { order_id: order.id })
                }
            }
            OrderStatus::Paid if order.is_stale(now, self.stuck_after) => {
                Some(StuckRepair::Redispatch {
                    order_id: order.id,
                    reason: format!("stale_paid_{}s", stale_secs(order, now)),
                })
            }
            OrderStatus::Provisioning if order.is_stale(now, self.stuck_after) => {
                Some(StuckRepair::MarkAbandoned {
                    order_id: order.id,
                    stale_secs: stale_secs(order, now),
                })
            }
            _ => None,
        }
    }
}

fn stale_secs(order: &Order, now: DateTime<Utc>) -> i64 {
    now.signed_duration_since(order.status_changed_at).num_seconds()
}

/// Scans all orders and applies the repairs.
///
/// Re-dispatches run serially; a failed attempt is already recorded on
/// its order by the provisioner and is not a sweep error.
#[tracing::instrument(name = "stuck_sweep", skip_all)]
pub(super) async fn sweep(
    store: &dyn Store,
    provisioner: &Provisioner,
    metrics: &ProvisionMetrics,
    stuck_after: Duration,
    summary: &mut ReconcileSummary,
) {
    let orders = match store.list_orders().await {
        Ok(orders) => orders,
        Err(err) => {
            summary
                .errors
                .push(SweepError::new("stuck", "list_orders", &err));
            metrics.record_sweep("stuck", "failed");
            return;
        }
    };

    let repairs = StuckSweep::new(stuck_after).scan(&orders, Utc::now());

    for repair in repairs {
        match repair {
            StuckRepair::Redispatch { order_id, reason } => {
                info!(%order_id, %reason, "re-dispatching stuck order");
                metrics.record_repair("stuck", "redispatch");
                summary.orders_redispatched += 1;
                // A failed attempt lands on the order as its last error;
                // the next tick decides whether the cap allows another.
                let _ = provisioner
                    .retry(order_id, TransitionReason::ReconcilerRetry)
                    .await;
            }
            StuckRepair::MarkAbandoned {
                order_id,
                stale_secs,
            } => {
                let failure = ProvisionError::new(
                    ProvisionErrorKind::RemoteCall,
                    format!("attempt abandoned after {stale_secs}s without progress"),
                );
                match store.record_order_failure(&order_id, &failure).await {
                    Ok(CasResult::Success) => {
                        warn!(%order_id, stale_secs, "stale provisioning attempt recorded as failed");
                        metrics.record_repair("stuck", "abandon");
                        metrics.record_order_transition(
                            &OrderStatus::Provisioning.to_string(),
                            &OrderStatus::Error.to_string(),
                        );
                        summary.orders_abandoned += 1;

                        // Straight into a retry when the cap allows, so
                        // recovery takes one tick instead of two.
                        if order_can_retry(store, &order_id).await {
                            metrics.record_repair("stuck", "redispatch");
                            summary.orders_redispatched += 1;
                            let _ = provisioner
                                .retry(order_id, TransitionReason::ReconcilerRetry)
                                .await;
                        }
                    }
                    Ok(other) => {
                        debug!(%order_id, ?other, "order moved before abandonment landed");
                    }
                    Err(err) => {
                        summary.errors.push(SweepError::new("stuck", order_id, &err));
                    }
                }
            }
            StuckRepair::AtCap { order_id } => {
                debug!(%order_id, "order beyond retry; waiting on an operator");
                summary.orders_at_cap += 1;
            }
        }
    }

    metrics.record_sweep("stuck", "ok");
}

async fn order_can_retry(store: &dyn Store, order_id: &OrderId) -> bool {
    match store.get_order(order_id).await {
        Ok(Some(order)) => order.can_retry(),
        _ => false,
    }
}
