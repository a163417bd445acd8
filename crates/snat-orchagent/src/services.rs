//! Interfaces of the external collaborators the SNAT core drives.
//!
//! The flow/group store, tunnel naming, route/FIB/BGP services, ID pools,
//! switch liveness and topology are owned by other subsystems. The core only
//! sees these traits; [`crate::backend::memory`] provides in-memory
//! implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snat_types::{Ipv4Prefix, Label, NetworkId, RouterId, SubnetId, SwitchId, VpnId};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::flows::{FlowEntry, FlowKey, FlowOp, GroupEntry, GroupKey, ProgrammingBatch};
use crate::store::NatStore;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("Switch {0} unreachable")]
    SwitchUnreachable(SwitchId),

    #[error("RPC failed: {0}")]
    Rpc(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("ID pool {0} exhausted")]
    PoolExhausted(String),
}

/// Tunnel encapsulation used between a switch and the NAPT switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Vxlan,
    Gre,
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelType::Vxlan => write!(f, "vxlan"),
            TunnelType::Gre => write!(f, "gre"),
        }
    }
}

/// Provider type of an external network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Flat,
    Vlan,
    Vxlan,
    Gre,
}

/// VPN an external prefix is advertised and forwarded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpnBinding {
    /// Name used for label generation.
    pub name: String,
    pub vpn_id: VpnId,
    pub route_distinguisher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalNetwork {
    pub id: NetworkId,
    #[serde(default)]
    pub provider: Option<ProviderType>,
    /// Network-wide VPN.
    pub vpn: VpnBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalSubnet {
    pub id: SubnetId,
    /// Subnet-specific VPN; preferred over the network-wide one when set.
    #[serde(default)]
    pub vpn: Option<VpnBinding>,
}

/// Flow and group store of the switches.
#[async_trait]
pub trait FlowProgrammer: Send + Sync {
    /// Installs or replaces the flow with the same key.
    async fn install_flow(&self, flow: &FlowEntry) -> Result<(), ServiceError>;

    /// Removes a flow; removing an absent flow succeeds.
    async fn remove_flow(&self, key: &FlowKey) -> Result<(), ServiceError>;

    /// Installs or replaces the group with the same key.
    async fn install_group(&self, group: &GroupEntry) -> Result<(), ServiceError>;

    /// Removes a group; removing an absent group succeeds.
    async fn remove_group(&self, key: &GroupKey) -> Result<(), ServiceError>;

    /// Applies a batch in order, stopping at the first failure.
    async fn commit(&self, batch: &ProgrammingBatch) -> Result<(), ServiceError> {
        for op in batch.ops() {
            match op {
                FlowOp::InstallGroup(group) => self.install_group(group).await?,
                FlowOp::InstallFlow(flow) => self.install_flow(flow).await?,
                FlowOp::RemoveFlow(key) => self.remove_flow(key).await?,
                FlowOp::RemoveGroup(key) => self.remove_group(key).await?,
            }
        }
        Ok(())
    }
}

/// Tunnel interface naming.
pub trait TunnelResolver: Send + Sync {
    /// Name of the `kind` tunnel interface on `src` leading to `dst`.
    fn resolve_tunnel(&self, src: SwitchId, dst: SwitchId, kind: TunnelType) -> Option<String>;
}

/// Label, FIB and BGP route services.
#[async_trait]
pub trait RouteService: Send + Sync {
    async fn generate_label(&self, vpn_name: &str, prefix: &Ipv4Prefix) -> Result<Label, ServiceError>;

    async fn release_label(&self, vpn_name: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError>;

    async fn add_fib_entry(
        &self,
        rd: &str,
        prefix: &Ipv4Prefix,
        next_hop: Ipv4Addr,
        label: Label,
    ) -> Result<(), ServiceError>;

    async fn remove_fib_entry(&self, rd: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError>;

    async fn advertise(
        &self,
        rd: &str,
        prefix: &Ipv4Prefix,
        next_hop: Ipv4Addr,
        label: Label,
    ) -> Result<(), ServiceError>;

    async fn withdraw(&self, rd: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError>;
}

/// Unique id allocation. Allocation is idempotent per (pool, key).
#[async_trait]
pub trait IdPool: Send + Sync {
    /// Creates `pool` with ids `start..=end`; creating an existing pool is a
    /// no-op.
    async fn create_pool(&self, pool: &str, start: u32, end: u32) -> Result<(), ServiceError>;

    async fn allocate_unique_id(&self, pool: &str, key: &str) -> Result<u32, ServiceError>;

    async fn release_unique_id(&self, pool: &str, key: &str) -> Result<(), ServiceError>;
}

/// Switch reachability, read fresh on every call.
pub trait SwitchLiveness: Send + Sync {
    fn is_switch_up(&self, switch: SwitchId) -> bool;
}

/// Read-only view of the network topology.
pub trait TopologyService: Send + Sync {
    /// Switches hosting at least one interface of `router`.
    fn candidate_switches(&self, router: &RouterId) -> BTreeSet<SwitchId>;

    fn external_network(&self, network: &NetworkId) -> Option<ExternalNetwork>;

    fn external_subnet(&self, subnet: &SubnetId) -> Option<ExternalSubnet>;

    /// Tunnel endpoint of `switch`, used as the route next hop.
    fn switch_endpoint(&self, switch: SwitchId) -> Option<Ipv4Addr>;
}

/// Shared handles to every collaborator.
#[derive(Clone)]
pub struct NatServices {
    pub flows: Arc<dyn FlowProgrammer>,
    pub tunnels: Arc<dyn TunnelResolver>,
    pub routes: Arc<dyn RouteService>,
    pub id_pool: Arc<dyn IdPool>,
    pub liveness: Arc<dyn SwitchLiveness>,
    pub topology: Arc<dyn TopologyService>,
    pub store: Arc<dyn NatStore>,
}
