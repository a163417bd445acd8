//! Flow and group table entries for the SNAT pipeline.

use serde::{Deserialize, Serialize};
use snat_types::{Ipv4Prefix, MacAddress, RouterId, SessionKey, SwitchId, VpnId};
use std::fmt;
use std::net::Ipv4Addr;

/// Table ids of the forwarding pipeline touched by SNAT.
pub mod tables {
    /// Generic L3 forwarding; resubmit target after translation.
    pub const L3_FIB_TABLE: u8 = 21;
    /// Per-router miss flow: group on ordinary switches, translation on the
    /// primary.
    pub const PSNAT_TABLE: u8 = 26;
    /// Primary switch: traffic tunnelled in from ordinary switches.
    pub const INTERNAL_TUNNEL_TABLE: u8 = 36;
    /// Reverse (external to internal) session flows.
    pub const INBOUND_NAPT_TABLE: u8 = 44;
    /// Forward (internal to external) session flows and the translation miss.
    pub const OUTBOUND_NAPT_TABLE: u8 = 46;
    /// Post-translation resubmit to L3_FIB.
    pub const NAPT_PFIB_TABLE: u8 = 47;
}

pub const ETH_TYPE_IPV4: u16 = 0x0800;

/// Priorities within a table; session flows beat the per-router defaults.
pub mod priority {
    pub const DEFAULT: u16 = 5;
    pub const SESSION: u16 = 10;
    pub const PFIB: u16 = 6;
}

/// Identity of an installed flow: switch, table and a stable reference
/// string derived from the router and disambiguating fields.
///
/// Install and remove are keyed by this value, so re-issuing either is
/// safe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub switch: SwitchId,
    pub table: u8,
    pub flow_ref: String,
}

impl FlowKey {
    pub fn new(switch: SwitchId, table: u8, flow_ref: impl Into<String>) -> Self {
        Self {
            switch,
            table,
            flow_ref: flow_ref.into(),
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.switch, self.table, self.flow_ref)
    }
}

/// Stable flow reference strings.
pub mod flow_ref {
    use super::*;

    pub fn psnat(router: &RouterId) -> String {
        format!("snat.psnat.{}", router)
    }

    pub fn internal_tunnel(router: &RouterId) -> String {
        format!("snat.tunnel.{}", router)
    }

    pub fn outbound_miss(router: &RouterId) -> String {
        format!("snat.outbound-miss.{}", router)
    }

    pub fn pfib_outbound(router: &RouterId, external_ip: Ipv4Addr) -> String {
        format!("snat.pfib-out.{}.{}", router, external_ip)
    }

    pub fn pfib_inbound(router: &RouterId, vpn: VpnId) -> String {
        format!("snat.pfib-in.{}.{}", router, vpn)
    }

    pub fn session_forward(router: &RouterId, session: &SessionKey) -> String {
        format!("snat.session-out.{}.{}", router, session)
    }

    pub fn session_reverse(router: &RouterId, session: &SessionKey) -> String {
        format!("snat.session-in.{}.{}", router, session)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowMatch {
    /// Router segment id or VPN id carried in packet metadata.
    Metadata(VpnId),
    TunnelId(u32),
    EthType(u16),
    IpProto(u8),
    Ipv4Source(Ipv4Prefix),
    Ipv4Destination(Ipv4Prefix),
    SourcePort(u16),
    DestinationPort(u16),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    Group(u32),
    PuntToController,
    /// Installs a copy of the matched flow into `table` for the rest of the
    /// connection; the first packet is still punted.
    Learn { table: u8, idle_timeout_secs: u16 },
    SetSourceIp(Ipv4Addr),
    SetDestinationIp(Ipv4Addr),
    SetSourcePort(u16),
    SetDestinationPort(u16),
    SetTunnelId(u32),
    SetSourceMac(MacAddress),
    Output(String),
    Resubmit(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowInstruction {
    ApplyActions(Vec<FlowAction>),
    WriteMetadata(VpnId),
    GotoTable(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub priority: u16,
    pub matches: Vec<FlowMatch>,
    pub instructions: Vec<FlowInstruction>,
    pub idle_timeout_secs: u16,
}

impl FlowEntry {
    pub fn new(key: FlowKey, priority: u16) -> Self {
        Self {
            key,
            priority,
            matches: Vec::new(),
            instructions: Vec::new(),
            idle_timeout_secs: 0,
        }
    }

    pub fn with_match(mut self, m: FlowMatch) -> Self {
        self.matches.push(m);
        self
    }

    pub fn with_instruction(mut self, instruction: FlowInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn with_idle_timeout(mut self, secs: u16) -> Self {
        self.idle_timeout_secs = secs;
        self
    }

    /// Group ids referenced by this flow's actions.
    pub fn referenced_groups(&self) -> impl Iterator<Item = u32> + '_ {
        self.actions().filter_map(|a| match a {
            FlowAction::Group(id) => Some(*id),
            _ => None,
        })
    }

    pub fn goto_table(&self) -> Option<u8> {
        self.instructions.iter().find_map(|i| match i {
            FlowInstruction::GotoTable(t) => Some(*t),
            _ => None,
        })
    }

    pub fn write_metadata(&self) -> Option<VpnId> {
        self.instructions.iter().find_map(|i| match i {
            FlowInstruction::WriteMetadata(v) => Some(*v),
            _ => None,
        })
    }

    pub fn actions(&self) -> impl Iterator<Item = &FlowAction> {
        self.instructions
            .iter()
            .filter_map(|i| match i {
                FlowInstruction::ApplyActions(actions) => Some(actions.iter()),
                _ => None,
            })
            .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupKey {
    pub switch: SwitchId,
    pub group_id: u32,
}

impl GroupKey {
    pub const fn new(switch: SwitchId, group_id: u32) -> Self {
        Self { switch, group_id }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/group-{}", self.switch, self.group_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub actions: Vec<FlowAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub key: GroupKey,
    pub buckets: Vec<Bucket>,
}

impl GroupEntry {
    /// Tunnel output port of the first bucket, if any.
    pub fn tunnel_port(&self) -> Option<&str> {
        self.buckets
            .iter()
            .flat_map(|b| b.actions.iter())
            .find_map(|a| match a {
                FlowAction::Output(port) => Some(port.as_str()),
                _ => None,
            })
    }
}

/// One mutation in a [`ProgrammingBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOp {
    InstallGroup(GroupEntry),
    InstallFlow(FlowEntry),
    RemoveFlow(FlowKey),
    RemoveGroup(GroupKey),
}

/// Ordered set of flow/group mutations applied as one unit.
///
/// Callers build batches with groups installed before the flows that use
/// them, and flows removed before their groups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgrammingBatch {
    ops: Vec<FlowOp>,
}

impl ProgrammingBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install_group(&mut self, group: GroupEntry) -> &mut Self {
        self.ops.push(FlowOp::InstallGroup(group));
        self
    }

    pub fn install_flow(&mut self, flow: FlowEntry) -> &mut Self {
        self.ops.push(FlowOp::InstallFlow(flow));
        self
    }

    pub fn remove_flow(&mut self, key: FlowKey) -> &mut Self {
        self.ops.push(FlowOp::RemoveFlow(key));
        self
    }

    pub fn remove_group(&mut self, key: GroupKey) -> &mut Self {
        self.ops.push(FlowOp::RemoveGroup(key));
        self
    }

    pub fn ops(&self) -> &[FlowOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// How the primary switch handles the first packet of an untranslated flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NaptMode {
    /// Punt to the controller, which allocates a port and installs the
    /// session flows.
    #[default]
    Controller,
    /// Punt and also learn a fast-path flow for subsequent packets.
    Learn,
}

/// External IP of a router together with the VPN its post-translation
/// traffic is forwarded in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIpTarget {
    pub ip: Ipv4Addr,
    pub vpn_id: VpnId,
}

/// Everything needed to build a router's flows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterFlowContext {
    pub router: RouterId,
    /// Router segment id, matched in metadata and carried as tunnel id.
    pub segment: VpnId,
    pub group_id: u32,
    /// Metadata written on inbound translated traffic: the associated VPN
    /// when one is attached, the router segment otherwise.
    pub inbound_vpn: VpnId,
    pub external_ips: Vec<ExternalIpTarget>,
    pub gateway_mac: Option<MacAddress>,
}

impl RouterFlowContext {
    pub fn external_vpn(&self, ip: Ipv4Addr) -> Option<VpnId> {
        self.external_ips
            .iter()
            .find(|t| t.ip == ip)
            .map(|t| t.vpn_id)
    }
}
