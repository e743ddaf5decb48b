//! Network allocations and port band policy.
//!
//! An allocation is a unique (node, IP, port) triple owned by the remote
//! panel. Berth never invents allocations locally; it reads the panel's
//! advertised pool and claims entries through the store's compare-and-set,
//! which is the one piece of state that must never be granted twice.
//!
//! Port bands carve the pool by game family so, say, Bedrock's UDP range
//! never collides with Java's TCP range on a shared IP.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use berth_core::AllocationId;

use crate::catalog::GameFamily;

/// A unique network endpoint on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Allocation {
    /// The panel's numeric id for this allocation.
    pub id: AllocationId,
    /// Public IP the endpoint is served on.
    pub ip: IpAddr,
    /// Port number.
    pub port: u16,
    /// True when the panel reports the endpoint bound to a server.
    pub assigned: bool,
}

impl Allocation {
    /// The customer-facing connection address.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PortBand {
    /// First port in the band.
    pub start: u16,
    /// Last port in the band (inclusive).
    pub end: u16,
}

impl PortBand {
    /// Creates a band; `start` and `end` are both inclusive.
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Returns true if `port` falls inside the band.
    #[must_use]
    pub const fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Number of ports in the band.
    #[must_use]
    pub const fn len(&self) -> u16 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    /// Returns true if the band holds no ports (start past end).
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end < self.start
    }

    /// Returns true if two bands share any port.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Maps each game family to its operational port band.
///
/// The defaults follow the conventions customers expect to type into their
/// game clients: Minecraft Java servers live at 25565+, Bedrock at 19132+.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PortBandPolicy {
    /// Band for Minecraft Java servers.
    pub minecraft_java: PortBand,
    /// Band for Minecraft Bedrock servers.
    pub minecraft_bedrock: PortBand,
    /// Band for Valheim servers.
    pub valheim: PortBand,
    /// Band for Terraria servers.
    pub terraria: PortBand,
}

impl PortBandPolicy {
    /// Returns the band for a game family.
    #[must_use]
    pub const fn band(&self, game: GameFamily) -> PortBand {
        match game {
            GameFamily::MinecraftJava => self.minecraft_java,
            GameFamily::MinecraftBedrock => self.minecraft_bedrock,
            GameFamily::Valheim => self.valheim,
            GameFamily::Terraria => self.terraria,
        }
    }

    /// Returns true if no two family bands overlap.
    #[must_use]
    pub fn is_disjoint(&self) -> bool {
        let bands = [
            self.minecraft_java,
            self.minecraft_bedrock,
            self.valheim,
            self.terraria,
        ];
        for (i, a) in bands.iter().enumerate() {
            for b in &bands[i + 1..] {
                if a.overlaps(b) {
                    return false;
                }
            }
        }
        true
    }
}

impl Default for PortBandPolicy {
    fn default() -> Self {
        Self {
            minecraft_java: PortBand::new(25565, 25664),
            minecraft_bedrock: PortBand::new(19132, 19231),
            valheim: PortBand::new(2456, 2555),
            terraria: PortBand::new(7777, 7876),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn band_contains_endpoints() {
        let band = PortBand::new(25565, 25664);
        assert!(band.contains(25565));
        assert!(band.contains(25664));
        assert!(!band.contains(25565 - 1));
        assert!(!band.contains(25665));
        assert_eq!(band.len(), 100);
    }

    #[test]
    fn default_policy_bands_are_disjoint() {
        assert!(PortBandPolicy::default().is_disjoint());
    }

    #[test]
    fn overlap_detection() {
        let a = PortBand::new(100, 200);
        let b = PortBand::new(200, 300);
        let c = PortBand::new(301, 400);
        assert!(a.overlaps(&b));
        assert!(!b.overlaps(&c));
    }

    #[test]
    fn address_formats_ip_port() {
        let alloc = Allocation {
            id: berth_core::AllocationId::new(1),
            ip: "1.2.3.4".parse().unwrap(),
            port: 25565,
            assigned: false,
        };
        assert_eq!(alloc.address(), "1.2.3.4:25565");
    }
}
