//! Observability metrics for provisioning.
//!
//! This module provides Prometheus-compatible metrics for monitoring
//! the order-to-server pipeline. Metrics are designed to support:
//!
//! - **Alerting**: Failure-rate alerts on provisioning and sweep outcomes
//! - **Dashboards**: Fleet capacity and order funnel visibility
//! - **Debugging**: Correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `berth_intake_events_total` | Counter | `outcome` | Billing events by intake outcome |
//! | `berth_order_transitions_total` | Counter | `from_status`, `to_status` | Order state transitions |
//! | `berth_provision_attempts_total` | Counter | `outcome`, `error_kind` | Provisioning attempts by outcome |
//! | `berth_provision_duration_seconds` | Histogram | `outcome` | End-to-end attempt duration |
//! | `berth_reconcile_sweeps_total` | Counter | `sweep`, `status` | Sweep executions by outcome |
//! | `berth_reconcile_sweep_duration_seconds` | Histogram | `sweep` | Sweep processing time |
//! | `berth_reconcile_repairs_total` | Counter | `sweep`, `action` | Repairs applied by the sweeps |
//! | `berth_node_free_memory_mb` | Gauge | `node` | Free placeable memory per node |
//!
//! ## Integration
//!
//! Metrics are exposed via the `metrics` crate facade. To export to Prometheus:
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Billing events by intake outcome.
    pub const INTAKE_EVENTS_TOTAL: &str = "berth_intake_events_total";
    /// Counter: Order state transitions.
    pub const ORDER_TRANSITIONS_TOTAL: &str = "berth_order_transitions_total";
    /// Counter: Provisioning attempts by outcome.
    pub const PROVISION_ATTEMPTS_TOTAL: &str = "berth_provision_attempts_total";
    /// Histogram: End-to-end provisioning attempt duration in seconds.
    pub const PROVISION_DURATION_SECONDS: &str = "berth_provision_duration_seconds";
    /// Counter: Reconciler sweep executions by outcome.
    pub const RECONCILE_SWEEPS_TOTAL: &str = "berth_reconcile_sweeps_total";
    /// Histogram: Reconciler sweep processing time in seconds.
    pub const RECONCILE_SWEEP_DURATION_SECONDS: &str = "berth_reconcile_sweep_duration_seconds";
    /// Counter: Repairs applied by the reconciler sweeps.
    pub const RECONCILE_REPAIRS_TOTAL: &str = "berth_reconcile_repairs_total";
    /// Gauge: Free placeable memory per node in MB.
    pub const NODE_FREE_MEMORY_MB: &str = "berth_node_free_memory_mb";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of an operation (accepted, duplicate, provisioned, failed, ...).
    pub const OUTCOME: &str = "outcome";
    /// Previous order status (for transitions).
    pub const FROM_STATUS: &str = "from_status";
    /// Target order status (for transitions).
    pub const TO_STATUS: &str = "to_status";
    /// Failure taxonomy kind for failed attempts.
    pub const ERROR_KIND: &str = "error_kind";
    /// Sweep name (health, stuck, drift).
    pub const SWEEP: &str = "sweep";
    /// Result status (success, failure).
    pub const STATUS: &str = "status";
    /// Repair action applied by a sweep.
    pub const ACTION: &str = "action";
    /// Node name for capacity gauges.
    pub const NODE: &str = "node";
}

/// High-level interface for recording provisioning metrics.
///
/// This struct provides ergonomic methods for recording metrics
/// with proper labeling. It's designed to be cheap to clone
/// and share across tasks.
#[derive(Debug, Clone, Default)]
pub struct ProvisionMetrics {
    _private: (),
}

impl ProvisionMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one consumed billing event.
    ///
    /// Increments the `berth_intake_events_total` counter.
    pub fn record_intake(&self, outcome: &str) {
        counter!(
            names::INTAKE_EVENTS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records an order state transition.
    ///
    /// Increments the `berth_order_transitions_total` counter.
    pub fn record_order_transition(&self, from_status: &str, to_status: &str) {
        counter!(
            names::ORDER_TRANSITIONS_TOTAL,
            labels::FROM_STATUS => from_status.to_string(),
            labels::TO_STATUS => to_status.to_string(),
        )
        .increment(1);
    }

    /// Records a finished provisioning attempt.
    ///
    /// `error_kind` is empty for successful outcomes.
    pub fn record_provision_attempt(&self, outcome: &str, error_kind: &str) {
        counter!(
            names::PROVISION_ATTEMPTS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
            labels::ERROR_KIND => error_kind.to_string(),
        )
        .increment(1);
    }

    /// Records end-to-end attempt duration.
    pub fn observe_provision_duration(&self, outcome: &str, duration: Duration) {
        histogram!(
            names::PROVISION_DURATION_SECONDS,
            labels::OUTCOME => outcome.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Records a sweep execution.
    ///
    /// Increments the `berth_reconcile_sweeps_total` counter.
    pub fn record_sweep(&self, sweep: &str, status: &str) {
        counter!(
            names::RECONCILE_SWEEPS_TOTAL,
            labels::SWEEP => sweep.to_string(),
            labels::STATUS => status.to_string(),
        )
        .increment(1);
    }

    /// Records one repair a sweep applied.
    ///
    /// Increments the `berth_reconcile_repairs_total` counter.
    pub fn record_repair(&self, sweep: &str, action: &str) {
        counter!(
            names::RECONCILE_REPAIRS_TOTAL,
            labels::SWEEP => sweep.to_string(),
            labels::ACTION => action.to_string(),
        )
        .increment(1);
    }

    /// Sets the free placeable memory gauge for a node.
    pub fn set_node_free_memory(&self, node: &str, free_mb: u32) {
        gauge!(
            names::NODE_FREE_MEMORY_MB,
            labels::NODE => node.to_string(),
        )
        .set(f64::from(free_mb));
    }
}

/// RAII guard for timing operations.
///
/// Automatically records duration when dropped.
///
/// ## Example
///
/// ```rust,no_run
/// use berth_provision::metrics::TimingGuard;
///
/// {
///     let _guard = TimingGuard::new(|duration| {
///         // record duration
///     });
///
///     // Do work...
/// } // Duration recorded automatically on drop
/// ```
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Creates a new timing guard that will call `on_drop` with the elapsed duration.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }

    /// Returns the elapsed time since the guard was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(f) = self.on_drop.take() {
            f(self.start.elapsed());
        }
    }
}

/// Creates a timing guard that records one sweep's duration.
///
/// ## Example
///
/// ```rust,no_run
/// use berth_provision::metrics::time_sweep;
///
/// async fn drift_sweep() {
///     let _guard = time_sweep("drift");
///     // Classify and repair...
/// }
/// ```
#[must_use]
pub fn time_sweep(sweep: &'static str) -> TimingGuard<impl FnOnce(Duration)> {
    TimingGuard::new(move |duration| {
        histogram!(
            names::RECONCILE_SWEEP_DURATION_SECONDS,
            labels::SWEEP => sweep,
        )
        .record(duration.as_secs_f64());
    })
}
