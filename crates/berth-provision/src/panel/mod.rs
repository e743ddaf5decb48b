//! Remote panel client seam.
//!
//! The panel (a Pterodactyl-compatible control plane) is the source of
//! truth for nodes' allocation pools and for every created server. Berth
//! talks to it through [`PanelClient`], with two implementations:
//!
//! - [`http::HttpPanelClient`]: the production client (reqwest, bearer
//!   auth, timeouts on every call)
//! - [`fake::FakePanel`]: an in-memory panel for tests and local runs,
//!   with scriptable failures
//!
//! All ids on this seam are the panel's own: node ids here are
//! `pterodactyl_node_id`, never Berth's fleet row ids.

pub mod fake;
pub mod http;

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use berth_core::AllocationId;

use crate::allocation::Allocation;
use crate::error::Result;

/// A node as the panel describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PanelNode {
    /// The panel's numeric node id.
    pub id: u32,
    /// Panel-side node name.
    pub name: String,
    /// Total memory the panel believes the node has, in MB.
    pub memory_mb: u32,
}

/// Resource limits passed at server creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ServerLimits {
    /// Memory limit in MB.
    pub memory: u32,
    /// Swap allowance in MB.
    pub swap: u32,
    /// Disk quota in MB.
    pub disk: u32,
    /// Block IO weight.
    pub io: u32,
    /// CPU share in percent of one core.
    pub cpu: u32,
}

/// Request body for `POST /servers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreateServerRequest {
    /// Customer-chosen display name.
    pub name: String,
    /// The panel-side user the server belongs to.
    pub owner_user_ref: String,
    /// Egg/template id.
    pub egg: u32,
    /// Docker image to run.
    pub docker_image: String,
    /// Startup command template.
    pub startup: String,
    /// Environment variable map.
    pub environment: BTreeMap<String, String>,
    /// Resource limits.
    pub limits: ServerLimits,
    /// The allocation the server binds to.
    pub allocation: AllocationId,
    /// Berth's tag for drift reconciliation (`berth:{order_id}`).
    pub external_id: String,
}

/// Response from `POST /servers`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CreatedServer {
    /// Numeric id (admin surface).
    pub id: u64,
    /// Opaque short identifier (client surface, power signals).
    pub identifier: String,
}

/// A server as the panel describes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RemoteServer {
    /// Numeric id.
    pub id: u64,
    /// Opaque short identifier.
    pub identifier: String,
    /// External-id tag, when one was set at creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Panel-side id of the node hosting the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<u32>,
    /// The allocation the server is bound to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocation_id: Option<AllocationId>,
    /// True when the panel has suspended the server.
    #[serde(default)]
    pub suspended: bool,
}

/// Power signal for `POST /servers/{identifier}/power`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerSignal {
    /// Start the server process.
    Start,
    /// Stop the server process gracefully.
    Stop,
}

impl std::fmt::Display for PowerSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
        }
    }
}

/// The remote panel REST contract Berth depends on.
///
/// Every method corresponds to one endpoint; implementations must carry a
/// timeout on every call so no provisioning invocation can block
/// indefinitely. A timeout is reported as outcome-unknown, not as "did not
/// happen".
#[async_trait]
pub trait PanelClient: Send + Sync {
    /// `GET /nodes/{id}`. Success doubles as the health probe.
    async fn get_node(&self, remote_node_id: u32) -> Result<PanelNode>;

    /// `GET /nodes/{id}/allocations`.
    async fn list_allocations(&self, remote_node_id: u32) -> Result<Vec<Allocation>>;

    /// `POST /nodes/{id}/allocations`: create allocations for one IP.
    async fn create_allocations(
        &self,
        remote_node_id: u32,
        ip: IpAddr,
        ports: &[u16],
    ) -> Result<()>;

    /// `DELETE /nodes/{id}/allocations/{allocId}` (maintenance only).
    async fn delete_allocation(
        &self,
        remote_node_id: u32,
        allocation_id: AllocationId,
    ) -> Result<()>;

    /// `POST /servers`.
    async fn create_server(&self, request: &CreateServerRequest) -> Result<CreatedServer>;

    /// `GET /servers/{id}`.
    async fn get_server(&self, server_id: u64) -> Result<RemoteServer>;

    /// `GET /servers/external/{external_id}`.
    ///
    /// Returns `Ok(None)` on 404; this lookup exists so retries and the
    /// drift sweep can find a server whose create "failed" ambiguously.
    async fn get_server_by_external_id(&self, external_id: &str)
        -> Result<Option<RemoteServer>>;

    /// `GET /servers`: the full server list, for the drift sweep.
    async fn list_servers(&self) -> Result<Vec<RemoteServer>>;

    /// `POST /servers/{identifier}/power`.
    async fn send_power(&self, identifier: &str, signal: PowerSignal) -> Result<()>;
}
