//! Construction of the SNAT flow and group entries.
//!
//! Pure functions of the router context; nothing here talks to a switch.
//! Every entry gets a key from [`flow_ref`], so rebuilding the same entry
//! always yields the same key.

use snat_types::{Ipv4Prefix, RouterId, SwitchId, VpnId};
use std::net::Ipv4Addr;

use super::types::{
    flow_ref, priority, tables, Bucket, FlowAction, FlowEntry, FlowInstruction, FlowKey, FlowMatch,
    GroupEntry, GroupKey, NaptMode, RouterFlowContext, ETH_TYPE_IPV4,
};
use crate::store::SessionEntry;

/// Group on an ordinary switch that tunnels the router's traffic to the
/// primary, tagging it with the router segment.
pub fn ordinary_group(switch: SwitchId, ctx: &RouterFlowContext, tunnel_port: &str) -> GroupEntry {
    GroupEntry {
        key: GroupKey::new(switch, ctx.group_id),
        buckets: vec![Bucket {
            actions: vec![
                FlowAction::SetTunnelId(ctx.segment.as_u32()),
                FlowAction::Output(tunnel_port.to_string()),
            ],
        }],
    }
}

pub fn psnat_key(switch: SwitchId, router: &RouterId) -> FlowKey {
    FlowKey::new(switch, tables::PSNAT_TABLE, flow_ref::psnat(router))
}

fn psnat_base(switch: SwitchId, ctx: &RouterFlowContext) -> FlowEntry {
    FlowEntry::new(psnat_key(switch, &ctx.router), priority::DEFAULT)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(ctx.segment))
}

/// PSNAT miss flow of an ordinary switch: send to the router group.
pub fn ordinary_psnat_flow(switch: SwitchId, ctx: &RouterFlowContext) -> FlowEntry {
    psnat_base(switch, ctx).with_instruction(FlowInstruction::ApplyActions(vec![
        FlowAction::Group(ctx.group_id),
    ]))
}

/// PSNAT miss flow of the primary: straight into outbound translation.
///
/// Shares its key with [`ordinary_psnat_flow`], so a switch promoted to
/// primary overwrites the group redirect in place.
pub fn primary_psnat_flow(switch: SwitchId, ctx: &RouterFlowContext) -> FlowEntry {
    psnat_base(switch, ctx).with_instruction(FlowInstruction::GotoTable(tables::OUTBOUND_NAPT_TABLE))
}

pub fn internal_tunnel_key(switch: SwitchId, router: &RouterId) -> FlowKey {
    FlowKey::new(switch, tables::INTERNAL_TUNNEL_TABLE, flow_ref::internal_tunnel(router))
}

/// Traffic tunnelled in from ordinary switches carries the segment as
/// tunnel id; restore it into metadata and translate.
pub fn primary_tunnel_flow(switch: SwitchId, ctx: &RouterFlowContext) -> FlowEntry {
    FlowEntry::new(internal_tunnel_key(switch, &ctx.router), priority::DEFAULT)
        .with_match(FlowMatch::TunnelId(ctx.segment.as_u32()))
        .with_instruction(FlowInstruction::WriteMetadata(ctx.segment))
        .with_instruction(FlowInstruction::GotoTable(tables::OUTBOUND_NAPT_TABLE))
}

pub fn outbound_miss_key(switch: SwitchId, router: &RouterId) -> FlowKey {
    FlowKey::new(switch, tables::OUTBOUND_NAPT_TABLE, flow_ref::outbound_miss(router))
}

/// Translation miss: punt the first packet of a new connection, and in
/// learn mode also learn a fast-path flow for the rest of it.
pub fn outbound_miss_flow(
    switch: SwitchId,
    ctx: &RouterFlowContext,
    mode: NaptMode,
    idle_timeout_secs: u16,
) -> FlowEntry {
    let actions = match mode {
        NaptMode::Controller => vec![FlowAction::PuntToController],
        NaptMode::Learn => vec![
            FlowAction::Learn {
                table: tables::OUTBOUND_NAPT_TABLE,
                idle_timeout_secs,
            },
            FlowAction::PuntToController,
        ],
    };
    FlowEntry::new(outbound_miss_key(switch, &ctx.router), priority::DEFAULT)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(ctx.segment))
        .with_instruction(FlowInstruction::ApplyActions(actions))
}

pub fn pfib_outbound_key(switch: SwitchId, router: &RouterId, external_ip: Ipv4Addr) -> FlowKey {
    FlowKey::new(
        switch,
        tables::NAPT_PFIB_TABLE,
        flow_ref::pfib_outbound(router, external_ip),
    )
}

/// Post-translation outbound: packets sourced from `external_ip` in
/// `vpn` go back to generic forwarding.
pub fn pfib_outbound_flow(
    switch: SwitchId,
    router: &RouterId,
    external_ip: Ipv4Addr,
    vpn: VpnId,
) -> FlowEntry {
    FlowEntry::new(pfib_outbound_key(switch, router, external_ip), priority::PFIB)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(vpn))
        .with_match(FlowMatch::Ipv4Source(Ipv4Prefix::host(external_ip)))
        .with_instruction(FlowInstruction::ApplyActions(vec![FlowAction::Resubmit(
            tables::L3_FIB_TABLE,
        )]))
}

pub fn pfib_inbound_key(switch: SwitchId, router: &RouterId, vpn: VpnId) -> FlowKey {
    FlowKey::new(switch, tables::NAPT_PFIB_TABLE, flow_ref::pfib_inbound(router, vpn))
}

/// Post-translation inbound: reverse-translated packets carrying
/// `inbound_vpn` go back to generic forwarding.
pub fn pfib_inbound_flow(switch: SwitchId, router: &RouterId, inbound_vpn: VpnId) -> FlowEntry {
    FlowEntry::new(pfib_inbound_key(switch, router, inbound_vpn), priority::PFIB)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(inbound_vpn))
        .with_instruction(FlowInstruction::ApplyActions(vec![FlowAction::Resubmit(
            tables::L3_FIB_TABLE,
        )]))
}

pub fn session_forward_key(switch: SwitchId, session: &SessionEntry) -> FlowKey {
    FlowKey::new(
        switch,
        tables::OUTBOUND_NAPT_TABLE,
        flow_ref::session_forward(&session.router, &session.internal),
    )
}

pub fn session_reverse_key(switch: SwitchId, session: &SessionEntry) -> FlowKey {
    FlowKey::new(
        switch,
        tables::INBOUND_NAPT_TABLE,
        flow_ref::session_reverse(&session.router, &session.internal),
    )
}

/// Internal to external: rewrite source, switch into the external VPN.
pub fn session_forward_flow(
    switch: SwitchId,
    ctx: &RouterFlowContext,
    session: &SessionEntry,
    external_vpn: VpnId,
) -> FlowEntry {
    let internal = &session.internal;
    let mut actions = vec![
        FlowAction::SetSourceIp(session.external.ip),
        FlowAction::SetSourcePort(session.external.port),
    ];
    if let Some(mac) = ctx.gateway_mac {
        actions.push(FlowAction::SetSourceMac(mac));
    }
    FlowEntry::new(session_forward_key(switch, session), priority::SESSION)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(ctx.segment))
        .with_match(FlowMatch::IpProto(internal.protocol.ip_proto()))
        .with_match(FlowMatch::Ipv4Source(Ipv4Prefix::host(internal.ip)))
        .with_match(FlowMatch::SourcePort(internal.port))
        .with_instruction(FlowInstruction::ApplyActions(actions))
        .with_instruction(FlowInstruction::WriteMetadata(external_vpn))
        .with_instruction(FlowInstruction::GotoTable(tables::NAPT_PFIB_TABLE))
}

/// External to internal: rewrite destination, switch into the inbound VPN.
pub fn session_reverse_flow(
    switch: SwitchId,
    ctx: &RouterFlowContext,
    session: &SessionEntry,
    external_vpn: VpnId,
) -> FlowEntry {
    let internal = &session.internal;
    FlowEntry::new(session_reverse_key(switch, session), priority::SESSION)
        .with_match(FlowMatch::EthType(ETH_TYPE_IPV4))
        .with_match(FlowMatch::Metadata(external_vpn))
        .with_match(FlowMatch::IpProto(internal.protocol.ip_proto()))
        .with_match(FlowMatch::Ipv4Destination(Ipv4Prefix::host(session.external.ip)))
        .with_match(FlowMatch::DestinationPort(session.external.port))
        .with_instruction(FlowInstruction::ApplyActions(vec![
            FlowAction::SetDestinationIp(internal.ip),
            FlowAction::SetDestinationPort(internal.port),
        ]))
        .with_instruction(FlowInstruction::WriteMetadata(ctx.inbound_vpn))
        .with_instruction(FlowInstruction::GotoTable(tables::NAPT_PFIB_TABLE))
}
