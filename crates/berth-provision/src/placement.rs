//! Placement semantics: tightest-fit node selection.
//!
//! Selection is a pure function over a capacity snapshot the store computes
//! at call time. Nothing here mutates state; the race between two
//! invocations reading the same snapshot is closed later, at reservation
//! commit, not here.
//!
//! Packing invariant:
//! - Among nodes that fit the request, the one with the SMALLEST available
//!   memory wins (fill nearly-full nodes before opening empty ones).
//! - Ties break by node id ascending, so placement is deterministic.

use serde::{Deserialize, Serialize};

use berth_core::NodeId;

/// One node's remaining capacity at snapshot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NodeCapacity {
    /// The node.
    pub node_id: NodeId,
    /// Usable memory minus everything reserved and active, in MB.
    pub available_mb: u32,
}

/// Selects the node for a resource request.
///
/// `snapshots` must already be filtered to enabled nodes in the target
/// region; the store owns that filter because it owns the health flag.
/// Returns `None` when no node fits, a user-visible no-capacity condition
/// rather than a fault.
#[must_use]
pub fn select_node(required_mb: u32, snapshots: &[NodeCapacity]) -> Option<NodeId> {
    snapshots
        .iter()
        .filter(|snap| snap.available_mb >= required_mb)
        .min_by_key(|snap| (snap.available_mb, snap.node_id))
        .map(|snap| snap.node_id)
}
