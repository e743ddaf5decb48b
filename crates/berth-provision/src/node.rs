//! Compute node fleet rows.
//!
//! Nodes are operator configuration: capacity in whole GB with a reserved
//! headroom slice the host OS and panel daemon keep for themselves. The
//! reconciler's health sweep is the only writer of `enabled`/`last_seen_at`;
//! placement reads `enabled` and never touches the row.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use berth_core::NodeId;

/// A compute host with finite memory capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Node {
    /// Operator-assigned fleet row id. Placement ties break on this.
    pub id: NodeId,
    /// Operator-facing name, e.g. `use1-node-03`.
    pub name: String,
    /// Region this node serves, e.g. `us-east`.
    pub region: String,
    /// The remote panel's numeric id for this node (wire identity).
    pub pterodactyl_node_id: u32,
    /// The public IP customers connect to. The panel may advertise
    /// allocations on internal IPs too; only this one is ever handed out.
    pub public_ip: IpAddr,
    /// Total memory in GB.
    pub max_ram_gb: u32,
    /// Memory in GB reserved for the host OS and panel daemon.
    pub reserved_headroom_gb: u32,
    /// Health flag; disabled nodes are excluded from placement.
    pub enabled: bool,
    /// When the health probe last saw this node reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl Node {
    /// Creates an enabled node row.
    #[must_use]
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        region: impl Into<String>,
        pterodactyl_node_id: u32,
        public_ip: IpAddr,
        max_ram_gb: u32,
        reserved_headroom_gb: u32,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            region: region.into(),
            pterodactyl_node_id,
            public_ip,
            max_ram_gb,
            reserved_headroom_gb,
            enabled: true,
            last_seen_at: None,
        }
    }

    /// Memory available to server instances, in MB.
    ///
    /// Headroom larger than the node's total clamps to zero rather than
    /// underflowing; such a row is operator error but must not panic.
    #[must_use]
    pub const fn usable_mb(&self) -> u32 {
        self.max_ram_gb
            .saturating_sub(self.reserved_headroom_gb)
            .saturating_mul(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_ip() -> IpAddr {
        "203.0.113.10".parse().expect("test ip")
    }

    #[test]
    fn usable_subtracts_headroom() {
        let node = Node::new(NodeId::new(1), "use1-node-01", "us-east", 10, test_ip(), 64, 8);
        assert_eq!(node.usable_mb(), 56 * 1024);
    }

    #[test]
    fn oversized_headroom_clamps_to_zero() {
        let node = Node::new(NodeId::new(2), "use1-node-02", "us-east", 11, test_ip(), 4, 8);
        assert_eq!(node.usable_mb(), 0);
    }
}
