//! # berth-api
//!
//! HTTP composition layer for the Berth game-server hosting platform.
//!
//! This crate is the public edge in front of `berth-provision`, handling:
//!
//! - **Webhook intake**: signed billing events become `PAID` orders
//! - **Order status**: a customer-safe view of provisioning progress
//! - **Fleet admin**: node capacity, pool maintenance, manual retries
//! - **Observability**: metrics, tracing, and health checks
//!
//! ## Design Principles
//!
//! This crate is a **thin composition layer** with no domain policy.
//! Placement, provisioning, and reconciliation all live in
//! `berth-provision`; handlers here validate, translate, and answer.
//!
//! ## Endpoints
//!
//! ```text
//! GET  /health                            - Health check
//! GET  /ready                             - Readiness check
//! GET  /metrics                           - Prometheus metrics
//! POST /webhooks/billing                  - Signed billing event intake
//! GET  /orders/:id                        - Customer-facing order status
//! GET  /admin/nodes                       - Fleet capacity view
//! POST /admin/nodes/:id/allocations/reset - Rebuild a node's port pool
//! POST /admin/orders/:id/retry            - Manual provisioning retry
//! POST /servers/:identifier/power         - Start/stop passthrough
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use berth_api::server::Server;
//!
//! let server = Server::builder()
//!     .port(8080)
//!     .build();
//!
//! server.serve().await?;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod signature;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::context::RequestContext;
    pub use crate::error::{ApiError, ApiResult};
    pub use crate::server::Server;
}
