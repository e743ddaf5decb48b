//! Observability infrastructure for Berth.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so the webhook edge,
//! the provisioner, and the reconciler service all log the same way.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `berth_provision=debug`)
///
/// # Example
///
/// ```rust
/// use berth_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for provisioning operations with standard fields.
///
/// # Example
///
/// ```rust
/// use berth_core::observability::provision_span;
///
/// let span = provision_span("provision", "01J8ZQ4X9W3R", "us-east");
/// let _guard = span.enter();
/// // ... do provisioning work
/// ```
#[must_use]
pub fn provision_span(operation: &str, order_id: &str, region: &str) -> Span {
    tracing::info_span!(
        "provision",
        op = operation,
        order_id = order_id,
        region = region,
    )
}

/// Creates a span for reconciler sweeps.
///
/// # Example
///
/// ```rust
/// use berth_core::observability::sweep_span;
///
/// let span = sweep_span("drift");
/// let _guard = span.enter();
/// // ... run the sweep
/// ```
#[must_use]
pub fn sweep_span(sweep: &str) -> Span {
    tracing::info_span!("reconcile", sweep = sweep)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_succeeds() {
        // Should not panic (uses Once internally)
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Pretty); // Second call should be no-op
    }

    #[test]
    fn test_provision_span_creates_span() {
        let span = provision_span("provision", "01ARZ3NDEKTSV4RRFFQ69G5FAV", "us-east");
        let _guard = span.enter();
        tracing::info!("test message in span");
    }

    #[test]
    fn test_sweep_span_creates_span() {
        let span = sweep_span("health");
        let _guard = span.enter();
        tracing::info!("sweep message");
    }
}
