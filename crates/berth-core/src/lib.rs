//! # berth-core
//!
//! Core abstractions for the Berth game-server hosting platform.
//!
//! This crate provides the foundational types used across all Berth components:
//!
//! - **Identifiers**: Strongly-typed IDs for orders, nodes, plans, and instances
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Logging initialization and span conventions
//!
//! ## Crate Boundary
//!
//! `berth-core` is the **only** crate allowed to define shared primitives.
//! Domain logic (placement, provisioning, reconciliation) lives in
//! `berth-provision`; the HTTP edge lives in `berth-api`.
//!
//! ## Example
//!
//! ```rust
//! use berth_core::prelude::*;
//!
//! // Generate a unique order ID
//! let order_id = OrderId::generate();
//!
//! // Node ids are small operator-assigned integers
//! let node = NodeId::new(3);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use berth_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{AllocationId, InstanceId, NodeId, OrderId, PlanId};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use id::{AllocationId, InstanceId, NodeId, OrderId, PlanId};
pub use observability::{LogFormat, init_logging};
