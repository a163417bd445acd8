//! Records held by the NAT state repository.

use serde::{Deserialize, Serialize};
use snat_types::{
    ExternalEndpoint, InternalAddress, Ipv4Prefix, Label, MacAddress, NetworkId, RouterId,
    SessionKey, SubnetId, SwitchId, VpnId,
};
use snat_orch_common::HasRefCount;
use std::fmt;
use std::net::Ipv4Addr;

use crate::flows::{FlowKey, GroupKey};
use crate::services::VpnBinding;

/// Internal subnet attached to a router.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InternalSubnet {
    pub id: SubnetId,
    pub prefix: Ipv4Prefix,
}

/// External IP configured on a router's gateway, tied to the external
/// subnet it was taken from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalIpConfig {
    pub ip: Ipv4Addr,
    pub subnet_id: SubnetId,
}

/// Router configuration as delivered by a create/update event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    pub id: RouterId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enable_snat: bool,
    #[serde(default)]
    pub subnets: Vec<InternalSubnet>,
    /// In configuration order; ties in least-loaded allocation go to the
    /// earliest entry.
    #[serde(default)]
    pub external_ips: Vec<ExternalIpConfig>,
    #[serde(default)]
    pub network_id: Option<NetworkId>,
    #[serde(default)]
    pub gateway_mac: Option<MacAddress>,
}

impl RouterConfig {
    pub fn new(id: impl Into<RouterId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            enable_snat: false,
            subnets: Vec::new(),
            external_ips: Vec::new(),
            network_id: None,
            gateway_mac: None,
        }
    }

    pub fn external_ip_list(&self) -> Vec<Ipv4Addr> {
        self.external_ips.iter().map(|e| e.ip).collect()
    }

    pub fn external_ip(&self, ip: Ipv4Addr) -> Option<&ExternalIpConfig> {
        self.external_ips.iter().find(|e| e.ip == ip)
    }

    /// SNAT is effective only with at least one external IP.
    pub fn snat_active(&self) -> bool {
        self.enable_snat && !self.external_ips.is_empty()
    }
}

/// Lifecycle state of a router's SNAT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterState {
    #[default]
    Disabled,
    /// SNAT enabled, no NAPT switch elected yet.
    PendingElection,
    Active,
    /// NAPT switch went down; re-election in progress.
    Migrating,
}

impl RouterState {
    /// States a router may be left in after a failed job.
    pub fn is_stable(&self) -> bool {
        !matches!(self, RouterState::Migrating)
    }
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterState::Disabled => "disabled",
            RouterState::PendingElection => "pending-election",
            RouterState::Active => "active",
            RouterState::Migrating => "migrating",
        };
        f.write_str(s)
    }
}

/// Pool-allocated identifiers of an enabled router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterSegment {
    pub segment_id: VpnId,
    pub group_id: u32,
}

/// External IP that left the router's configuration, or moved to another
/// VPN, and is still advertised in `vpn`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiringExternalIp {
    pub ip: Ipv4Addr,
    pub vpn: VpnBinding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterRecord {
    pub config: RouterConfig,
    pub state: RouterState,
    pub segment: Option<RouterSegment>,
    /// Kept until the cleanup of each entry completes, so a failed update
    /// is finished by its retry.
    #[serde(default)]
    pub retiring_ips: Vec<RetiringExternalIp>,
}

impl RouterRecord {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            state: RouterState::Disabled,
            segment: None,
            retiring_ips: Vec::new(),
        }
    }

    pub fn id(&self) -> &RouterId {
        &self.config.id
    }
}

/// Router to NAPT switch binding. `switch == None` is the unassigned
/// sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaptAssignment {
    pub router: RouterId,
    pub switch: Option<SwitchId>,
}

/// Internal address to external IP binding, with the route label of the
/// external IP once one has been generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointMapping {
    pub router: RouterId,
    pub internal: InternalAddress,
    pub external_ip: Ipv4Addr,
    pub label: Option<Label>,
}

/// Live translation of one internal (ip, port, protocol).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub router: RouterId,
    pub internal: SessionKey,
    pub external: ExternalEndpoint,
}

/// Number of internal addresses mapped onto one external IP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageCounter {
    count: u32,
}

impl UsageCounter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HasRefCount for UsageCounter {
    fn increment_ref(&mut self) -> u32 {
        self.count += 1;
        self.count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.count = self.count.checked_sub(1)?;
        Some(self.count)
    }

    fn ref_count(&self) -> u32 {
        self.count
    }
}

/// Flows and groups of a router left on a switch that was unreachable
/// when they had to go. Carries the keys, so it outlives the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCleanup {
    pub switch: SwitchId,
    pub router: RouterId,
    pub flows: Vec<FlowKey>,
    pub groups: Vec<GroupKey>,
}

impl StaleCleanup {
    pub fn new(switch: SwitchId, router: RouterId) -> Self {
        Self {
            switch,
            router,
            flows: Vec::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_flows(mut self, flows: impl IntoIterator<Item = FlowKey>) -> Self {
        for flow in flows {
            if !self.flows.contains(&flow) {
                self.flows.push(flow);
            }
        }
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = GroupKey>) -> Self {
        for group in groups {
            if !self.groups.contains(&group) {
                self.groups.push(group);
            }
        }
        self
    }

    /// Folds `other` (same switch and router) into `self`.
    pub fn merge(self, other: StaleCleanup) -> Self {
        self.with_flows(other.flows).with_groups(other.groups)
    }
}

/// What was deleted by a router purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub assignment: bool,
    pub endpoints: usize,
    pub sessions: usize,
    pub usage_counters: usize,
}
