//! # berth-provision
//!
//! Order-to-server provisioning and fleet reconciliation for Berth.
//!
//! This crate is the engine that turns a paid order into a running game
//! server on a fleet of capacity-limited nodes, and keeps local records
//! consistent with the remote panel's true state over time:
//!
//! - **Placement**: tightest-fit node selection under a memory budget
//! - **Allocations**: unique network endpoint (IP:port) assignment
//! - **Intake**: exactly-once consumption of billing payment events
//! - **Provisioner**: the five-step create path with per-step recovery
//! - **Reconciler**: health, stuck-order, and drift sweeps
//!
//! ## Execution Model
//!
//! There is no long-lived scheduler thread. Every provisioning attempt is
//! one short-lived invocation (a webhook delivery or a reconciler tick)
//! that coordinates with its peers only through the [`store::Store`]
//! compare-and-set operations. Anything interrupted mid-flight is picked
//! up by the sweeps in [`reconciler`].

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod allocation;
pub mod catalog;
pub mod directory;
pub mod error;
pub mod instance;
pub mod intake;
pub mod metrics;
pub mod node;
pub mod order;
pub mod panel;
pub mod placement;
pub mod provisioner;
pub mod reconciler;
pub mod store;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use berth_provision::prelude::*;
/// ```
pub mod prelude {
    pub use crate::allocation::{Allocation, PortBand, PortBandPolicy};
    pub use crate::catalog::{GameFamily, Plan, PlanCatalog};
    pub use crate::directory::AllocationDirectory;
    pub use crate::error::{Error, ProvisionError, ProvisionErrorKind, Result};
    pub use crate::instance::{InstanceState, RemoteIdentity, ServerInstance};
    pub use crate::intake::{IntakeOutcome, OrderIntake, PaymentEvent};
    pub use crate::node::Node;
    pub use crate::order::{BillingTerm, Order, OrderStatus, TransitionReason};
    pub use crate::panel::PanelClient;
    pub use crate::placement::{NodeCapacity, select_node};
    pub use crate::provisioner::{ProvisionReceipt, Provisioner};
    pub use crate::reconciler::{ReconcileSummary, Reconciler, ReconcilerConfig};
    pub use crate::store::{CasResult, Store};
}

pub use error::{Error, Result};
