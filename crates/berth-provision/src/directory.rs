//! Read-through directory of the panel's allocation pools.
//!
//! The panel owns the (IP, port) inventory; this directory caches each
//! node's advertised pool and answers "which free endpoints could this
//! game use here". It never claims anything. Claims are store CAS calls,
//! so a stale cache can only cost a wasted bind attempt, never a double
//! grant.
//!
//! An empty answer from a healthy pool is a real outcome, distinct from
//! a failed pool read: the first is pool exhaustion the reconciler cannot
//! fix, the second is a remote call to retry.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use berth_core::NodeId;

use crate::allocation::{Allocation, PortBandPolicy};
use crate::catalog::GameFamily;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::panel::PanelClient;

/// How long a fetched pool is served before the panel is asked again.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct CachedPool {
    fetched_at: Instant,
    allocations: Vec<Allocation>,
}

/// Outcome of rebuilding one node's allocation pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct PoolReset {
    /// Endpoints created to fill out the port bands.
    pub created: usize,
    /// Free endpoints deleted for being outside policy.
    pub deleted: usize,
    /// Endpoints already matching policy, left alone.
    pub kept: usize,
    /// Assigned endpoints outside policy the panel refuses to delete.
    pub skipped_assigned: usize,
}

/// Cached view of per-node allocation pools.
pub struct AllocationDirectory {
    panel: Arc<dyn PanelClient>,
    policy: PortBandPolicy,
    ttl: Duration,
    cache: RwLock<HashMap<NodeId, CachedPool>>,
}

impl std::fmt::Debug for AllocationDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocationDirectory")
            .field("policy", &self.policy)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("allocation cache lock poisoned")
}

impl AllocationDirectory {
    /// Creates a directory over the given panel with the default TTL.
    #[must_use]
    pub fn new(panel: Arc<dyn PanelClient>, policy: PortBandPolicy) -> Self {
        Self {
            panel,
            policy,
            ttl: DEFAULT_CACHE_TTL,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Overrides the cache TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The port band policy this directory filters with.
    #[must_use]
    pub const fn policy(&self) -> &PortBandPolicy {
        &self.policy
    }

    /// Free endpoints on `node` usable by `game`, lowest port first.
    ///
    /// Served from cache within the TTL. An empty list from a healthy
    /// pool read means exhaustion, not absence of the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be read from the panel.
    pub async fn free_endpoints(&self, node: &Node, game: GameFamily) -> Result<Vec<Allocation>> {
        let cached = {
            let cache = self.cache.read().map_err(poison_err)?;
            cache.get(&node.id).and_then(|entry| {
                (entry.fetched_at.elapsed() < self.ttl).then(|| entry.allocations.clone())
            })
        };

        let pool = match cached {
            Some(pool) => pool,
            None => self.fetch(node).await?,
        };

        Ok(self.filter_free(&pool, node, game))
    }

    /// Drops the cache and re-reads the pool, then filters like
    /// [`Self::free_endpoints`].
    ///
    /// Called when every cached candidate turned out to be claimed; the
    /// cache was stale, the panel has the current picture.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot be read from the panel.
    pub async fn refresh(&self, node: &Node, game: GameFamily) -> Result<Vec<Allocation>> {
        let pool = self.fetch(node).await?;
        Ok(self.filter_free(&pool, node, game))
    }

    /// Forgets any cached pool for a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn invalidate(&self, node_id: NodeId) -> Result<()> {
        let mut cache = self.cache.write().map_err(poison_err)?;
        cache.remove(&node_id);
        drop(cache);
        Ok(())
    }

    /// Rebuilds a node's pool to match the port band policy.
    ///
    /// Deletes free endpoints outside policy, creates every missing
    /// in-band port on the node's public IP, and leaves assigned
    /// endpoints untouched (the panel refuses to delete them anyway).
    ///
    /// # Errors
    ///
    /// Returns a precondition error if the node is still enabled; pool
    /// mutations on a node taking placements would race the provisioner.
    /// Panel failures propagate.
    pub async fn reset_pool(&self, node: &Node) -> Result<PoolReset> {
        if node.enabled {
            return Err(berth_core::error::Error::precondition_failed(format!(
                "node {} is enabled; disable it before resetting its pool",
                node.id
            ))
            .into());
        }

        let pool = self.panel.list_allocations(node.pterodactyl_node_id).await?;

        let mut reset = PoolReset {
            created: 0,
            deleted: 0,
            kept: 0,
            skipped_assigned: 0,
        };

        for alloc in &pool {
            let in_policy = alloc.ip == node.public_ip && self.in_any_band(alloc.port);
            if in_policy {
                reset.kept += 1;
            } else if alloc.assigned {
                reset.skipped_assigned += 1;
            } else {
                self.panel
                    .delete_allocation(node.pterodactyl_node_id, alloc.id)
                    .await?;
                reset.deleted += 1;
            }
        }

        let existing: HashSet<u16> = pool
            .iter()
            .filter(|a| a.ip == node.public_ip)
            .map(|a| a.port)
            .collect();

        for game in GameFamily::ALL {
            let band = self.policy.band(game);
            let missing: Vec<u16> = (band.start..=band.end)
                .filter(|port| !existing.contains(port))
                .collect();
            if !missing.is_empty() {
                self.panel
                    .create_allocations(node.pterodactyl_node_id, node.public_ip, &missing)
                    .await?;
                reset.created += missing.len();
            }
        }

        self.invalidate(node.id)?;
        Ok(reset)
    }

    async fn fetch(&self, node: &Node) -> Result<Vec<Allocation>> {
        let pool = self.panel.list_allocations(node.pterodactyl_node_id).await?;
        {
            let mut cache = self.cache.write().map_err(poison_err)?;
            cache.insert(
                node.id,
                CachedPool {
                    fetched_at: Instant::now(),
                    allocations: pool.clone(),
                },
            );
        }
        Ok(pool)
    }

    fn filter_free(&self, pool: &[Allocation], node: &Node, game: GameFamily) -> Vec<Allocation> {
        let band = self.policy.band(game);
        let mut free: Vec<Allocation> = pool
            .iter()
            .filter(|a| !a.assigned && a.ip == node.public_ip && band.contains(a.port))
            .copied()
            .collect();
        free.sort_by_key(|a| a.port);
        free
    }

    fn in_any_band(&self, port: u16) -> bool {
        GameFamily::ALL
            .iter()
            .any(|game| self.policy.band(*game).contains(port))
    }
}
