//! In-memory panel implementation for testing and development.
//!
//! This module provides [`FakePanel`], a scriptable in-memory stand-in for
//! the remote panel suitable for tests and local runs.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No persistence, single-process only
//! - **Identifiers are synthetic**: Stable within one process run
//!
//! Failure scripting covers the cases the provisioner must survive:
//! unreachable nodes, create calls that fail cleanly, and create calls
//! that time out *after* the server landed (the orphan seed).

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use ulid::Ulid;

use berth_core::AllocationId;

use crate::allocation::Allocation;
use crate::error::{Error, Result};

use super::{
    CreateServerRequest, CreatedServer, PanelClient, PanelNode, PowerSignal, RemoteServer,
};

/// How the next `create_server` call should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailure {
    /// Respond with this HTTP status; no server is created.
    Status(u16),
    /// Time out; no server is created.
    TimeoutWithoutCreate,
    /// Time out, but the server IS created remotely (outcome-unknown).
    TimeoutAfterCreate,
}

/// Internal panel state protected by a single lock.
#[derive(Debug, Default)]
struct PanelState {
    nodes: HashMap<u32, PanelNode>,
    allocations: HashMap<u32, Vec<Allocation>>,
    servers: HashMap<u64, RemoteServer>,
    unreachable: HashSet<u32>,
    create_failures: Vec<CreateFailure>,
    power_signals: Vec<(String, PowerSignal)>,
    next_server_id: u64,
    next_allocation_id: u64,
    create_calls: usize,
}

/// In-memory panel for testing.
#[derive(Debug, Default)]
pub struct FakePanel {
    state: RwLock<PanelState>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("fake panel lock poisoned")
}

impl FakePanel {
    /// Creates an empty fake panel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node on the panel.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_node(&self, remote_node_id: u32, name: impl Into<String>, memory_mb: u32) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.nodes.insert(
            remote_node_id,
            PanelNode {
                id: remote_node_id,
                name: name.into(),
                memory_mb,
            },
        );
        state.allocations.entry(remote_node_id).or_default();
        drop(state);
        Ok(())
    }

    /// Seeds unassigned allocations for one IP on a node.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn seed_allocations(&self, remote_node_id: u32, ip: IpAddr, ports: &[u16]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        for &port in ports {
            state.next_allocation_id += 1;
            let id = AllocationId::new(state.next_allocation_id);
            state
                .allocations
                .entry(remote_node_id)
                .or_default()
                .push(Allocation {
                    id,
                    ip,
                    port,
                    assigned: false,
                });
        }
        drop(state);
        Ok(())
    }

    /// Marks a node unreachable (health probes and all calls fail).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn set_unreachable(&self, remote_node_id: u32, unreachable: bool) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if unreachable {
            state.unreachable.insert(remote_node_id);
        } else {
            state.unreachable.remove(&remote_node_id);
        }
        drop(state);
        Ok(())
    }

    /// Scripts a failure for the next `create_server` call. Multiple
    /// scripted failures apply in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn fail_next_create(&self, failure: CreateFailure) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.create_failures.push(failure);
        drop(state);
        Ok(())
    }

    /// Removes a server as if it was deleted behind our back.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn vanish_server(&self, server_id: u64) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let removed = state.servers.remove(&server_id);
        if let Some(server) = removed {
            if let Some(allocation_id) = server.allocation_id {
                release_allocation(&mut state, allocation_id);
            }
        }
        drop(state);
        Ok(())
    }

    /// Suspends or unsuspends a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned or the server is unknown.
    pub fn set_suspended(&self, server_id: u64, suspended: bool) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let server = state
            .servers
            .get_mut(&server_id)
            .ok_or_else(|| Error::panel_status(404, format!("server {server_id} not found")))?;
        server.suspended = suspended;
        drop(state);
        Ok(())
    }

    /// Number of `create_server` calls observed, including failed ones.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn create_calls(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.create_calls)
    }

    /// Number of servers currently existing on the panel.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn server_count(&self) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.servers.len())
    }

    /// Power signals received so far, in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn power_signals(&self) -> Result<Vec<(String, PowerSignal)>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.power_signals.clone())
    }

    fn check_reachable(state: &PanelState, remote_node_id: u32) -> Result<()> {
        if state.unreachable.contains(&remote_node_id) {
            return Err(Error::panel_transport(format!(
                "node {remote_node_id} unreachable"
            )));
        }
        Ok(())
    }

    fn insert_server(state: &mut PanelState, request: &CreateServerRequest) -> CreatedServer {
        state.next_server_id += 1;
        let id = state.next_server_id;
        let identifier = Ulid::new().to_string()[..8].to_ascii_lowercase();

        let mut remote_node = None;
        for (node_id, pool) in &mut state.allocations {
            if let Some(alloc) = pool.iter_mut().find(|a| a.id == request.allocation) {
                alloc.assigned = true;
                remote_node = Some(*node_id);
                break;
            }
        }

        state.servers.insert(
            id,
            RemoteServer {
                id,
                identifier: identifier.clone(),
                external_id: Some(request.external_id.clone()),
                name: request.name.clone(),
                node: remote_node,
                allocation_id: Some(request.allocation),
                suspended: false,
            },
        );

        CreatedServer { id, identifier }
    }
}

fn release_allocation(state: &mut PanelState, allocation_id: AllocationId) {
    if let Some(alloc) = state
        .allocations
        .values_mut()
        .flatten()
        .find(|a| a.id == allocation_id)
    {
        alloc.assigned = false;
    }
}

#[async_trait]
impl PanelClient for FakePanel {
    async fn get_node(&self, remote_node_id: u32) -> Result<PanelNode> {
        let state = self.state.read().map_err(poison_err)?;
        Self::check_reachable(&state, remote_node_id)?;
        state
            .nodes
            .get(&remote_node_id)
            .cloned()
            .ok_or_else(|| Error::panel_status(404, format!("node {remote_node_id} not found")))
    }

    async fn list_allocations(&self, remote_node_id: u32) -> Result<Vec<Allocation>> {
        let state = self.state.read().map_err(poison_err)?;
        Self::check_reachable(&state, remote_node_id)?;
        state
            .allocations
            .get(&remote_node_id)
            .cloned()
            .ok_or_else(|| Error::panel_status(404, format!("node {remote_node_id} not found")))
    }

    async fn create_allocations(
        &self,
        remote_node_id: u32,
        ip: IpAddr,
        ports: &[u16],
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        Self::check_reachable(&state, remote_node_id)?;
        if !state.nodes.contains_key(&remote_node_id) {
            return Err(Error::panel_status(
                404,
                format!("node {remote_node_id} not found"),
            ));
        }

        let existing: HashSet<(IpAddr, u16)> = state
            .allocations
            .get(&remote_node_id)
            .map(|pool| pool.iter().map(|a| (a.ip, a.port)).collect())
            .unwrap_or_default();

        for &port in ports {
            if existing.contains(&(ip, port)) {
                return Err(Error::panel_status(
                    422,
                    format!("allocation {ip}:{port} already exists"),
                ));
            }
        }

        for &port in ports {
            state.next_allocation_id += 1;
            let id = AllocationId::new(state.next_allocation_id);
            state
                .allocations
                .entry(remote_node_id)
                .or_default()
                .push(Allocation {
                    id,
                    ip,
                    port,
                    assigned: false,
                });
        }
        drop(state);
        Ok(())
    }

    async fn delete_allocation(
        &self,
        remote_node_id: u32,
        allocation_id: AllocationId,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        Self::check_reachable(&state, remote_node_id)?;
        let pool = state
            .allocations
            .get_mut(&remote_node_id)
            .ok_or_else(|| Error::panel_status(404, format!("node {remote_node_id} not found")))?;

        let Some(index) = pool.iter().position(|a| a.id == allocation_id) else {
            return Err(Error::panel_status(
                404,
                format!("allocation {allocation_id} not found"),
            ));
        };
        if pool[index].assigned {
            return Err(Error::panel_status(
                400,
                format!("allocation {allocation_id} is assigned to a server"),
            ));
        }
        pool.remove(index);
        drop(state);
        Ok(())
    }

    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.create_calls += 1;

        if !state.create_failures.is_empty() {
            let failure = state.create_failures.remove(0);
            match failure {
                CreateFailure::Status(status) => {
                    return Err(Error::panel_status(status, "scripted create failure"));
                }
                CreateFailure::TimeoutWithoutCreate => {
                    return Err(Error::panel_unknown("scripted create timeout"));
                }
                CreateFailure::TimeoutAfterCreate => {
                    let _ = Self::insert_server(&mut state, request);
                    return Err(Error::panel_unknown("scripted create timeout"));
                }
            }
        }

        let allocation = state
            .allocations
            .values()
            .flatten()
            .find(|a| a.id == request.allocation)
            .copied();
        match allocation {
            None => {
                return Err(Error::panel_status(
                    422,
                    format!("allocation {} not found", request.allocation),
                ));
            }
            Some(alloc) if alloc.assigned => {
                return Err(Error::panel_status(
                    422,
                    format!("allocation {} already assigned", request.allocation),
                ));
            }
            Some(_) => {}
        }

        let created = Self::insert_server(&mut state, request);
        drop(state);
        Ok(created)
    }

    async fn get_server(&self, server_id: u64) -> Result<RemoteServer> {
        let state = self.state.read().map_err(poison_err)?;
        state
            .servers
            .get(&server_id)
            .cloned()
            .ok_or_else(|| Error::panel_status(404, format!("server {server_id} not found")))
    }

    async fn get_server_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RemoteServer>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .servers
            .values()
            .find(|s| s.external_id.as_deref() == Some(external_id))
            .cloned())
    }

    async fn list_servers(&self) -> Result<Vec<RemoteServer>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut servers: Vec<_> = state.servers.values().cloned().collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn send_power(&self, identifier: &str, signal: PowerSignal) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.servers.values().any(|s| s.identifier == identifier) {
            return Err(Error::panel_status(
                404,
                format!("server {identifier} not found"),
            ));
        }
        state.power_signals.push((identifier.to_string(), signal));
        drop(state);
        Ok(())
    }
}
