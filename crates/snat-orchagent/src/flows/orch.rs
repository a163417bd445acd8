//! FlowOrch: applies the SNAT flow/group state to switches.

use log::{debug, info, warn};
use snat_orch_common::TaskError;
use snat_types::{RouterId, SwitchId, VpnId};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::builder;
use super::types::{GroupKey, NaptMode, ProgrammingBatch, RouterFlowContext};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::services::{FlowProgrammer, ServiceError, TunnelResolver, TunnelType};
use crate::store::{SessionEntry, StaleCleanup};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlowOrchError {
    #[error("No tunnel from switch {src} to switch {dst}")]
    TunnelNotFound { src: SwitchId, dst: SwitchId },

    #[error("External IP {ip} is not configured on router {router}")]
    UnknownExternalIp { router: RouterId, ip: Ipv4Addr },

    #[error("Flow programming failed: {0}")]
    Programming(#[from] ServiceError),
}

pub type Result<T> = std::result::Result<T, FlowOrchError>;

impl From<FlowOrchError> for TaskError {
    fn from(err: FlowOrchError) -> Self {
        match err {
            // Tunnels come and go with the topology; try again later.
            FlowOrchError::TunnelNotFound { .. } => TaskError::southbound(err.to_string()),
            FlowOrchError::UnknownExternalIp { .. } => TaskError::invalid_config(err.to_string()),
            FlowOrchError::Programming(_) => TaskError::southbound(err.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FlowOrchConfig {
    pub primary_tunnel: TunnelType,
    pub fallback_tunnel: TunnelType,
    pub napt_mode: NaptMode,
    pub session_idle_timeout_secs: u16,
}

impl Default for FlowOrchConfig {
    fn default() -> Self {
        Self {
            primary_tunnel: TunnelType::Vxlan,
            fallback_tunnel: TunnelType::Gre,
            napt_mode: NaptMode::Controller,
            session_idle_timeout_secs: 300,
        }
    }
}

impl FlowOrchConfig {
    pub fn with_tunnels(mut self, primary: TunnelType, fallback: TunnelType) -> Self {
        self.primary_tunnel = primary;
        self.fallback_tunnel = fallback;
        self
    }

    pub fn with_napt_mode(mut self, mode: NaptMode) -> Self {
        self.napt_mode = mode;
        self
    }

    pub fn with_session_idle_timeout(mut self, secs: u16) -> Self {
        self.session_idle_timeout_secs = secs;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowOrchStats {
    pub primary_installs: u64,
    pub primary_removals: u64,
    pub ordinary_installs: u64,
    pub ordinary_removals: u64,
    pub session_installs: u64,
    pub session_removals: u64,
    pub errors: u64,
}

#[derive(Default)]
struct Counters {
    primary_installs: AtomicU64,
    primary_removals: AtomicU64,
    ordinary_installs: AtomicU64,
    ordinary_removals: AtomicU64,
    session_installs: AtomicU64,
    session_removals: AtomicU64,
    errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Builds and applies per-router flow/group state.
///
/// Failures are returned to the caller as-is; re-driving the sequence is
/// the job of the router and HA orchestrators.
pub struct FlowOrch {
    config: FlowOrchConfig,
    flows: Arc<dyn FlowProgrammer>,
    tunnels: Arc<dyn TunnelResolver>,
    counters: Counters,
}

impl FlowOrch {
    pub fn new(
        config: FlowOrchConfig,
        flows: Arc<dyn FlowProgrammer>,
        tunnels: Arc<dyn TunnelResolver>,
    ) -> Self {
        Self {
            config,
            flows,
            tunnels,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &FlowOrchConfig {
        &self.config
    }

    pub fn stats(&self) -> FlowOrchStats {
        let c = &self.counters;
        FlowOrchStats {
            primary_installs: c.primary_installs.load(Ordering::Relaxed),
            primary_removals: c.primary_removals.load(Ordering::Relaxed),
            ordinary_installs: c.ordinary_installs.load(Ordering::Relaxed),
            ordinary_removals: c.ordinary_removals.load(Ordering::Relaxed),
            session_installs: c.session_installs.load(Ordering::Relaxed),
            session_removals: c.session_removals.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    /// Tunnel interface on `src` towards `dst`, primary type first.
    pub fn resolve_tunnel(&self, src: SwitchId, dst: SwitchId) -> Result<String> {
        if let Some(port) = self.tunnels.resolve_tunnel(src, dst, self.config.primary_tunnel) {
            return Ok(port);
        }
        debug!(
            "FlowOrch: no {} tunnel {} -> {}, trying {}",
            self.config.primary_tunnel, src, dst, self.config.fallback_tunnel
        );
        self.tunnels
            .resolve_tunnel(src, dst, self.config.fallback_tunnel)
            .ok_or(FlowOrchError::TunnelNotFound { src, dst })
    }

    async fn commit(&self, batch: &ProgrammingBatch) -> Result<()> {
        self.flows.commit(batch).await.map_err(|e| {
            bump(&self.counters.errors);
            FlowOrchError::Programming(e)
        })
    }

    /// Installs the translation pipeline on the primary switch.
    pub async fn install_primary(&self, switch: SwitchId, ctx: &RouterFlowContext) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch
            .install_flow(builder::primary_psnat_flow(switch, ctx))
            .install_flow(builder::primary_tunnel_flow(switch, ctx))
            .install_flow(builder::outbound_miss_flow(
                switch,
                ctx,
                self.config.napt_mode,
                self.config.session_idle_timeout_secs,
            ));
        for target in &ctx.external_ips {
            batch.install_flow(builder::pfib_outbound_flow(
                switch,
                &ctx.router,
                target.ip,
                target.vpn_id,
            ));
        }
        batch.install_flow(builder::pfib_inbound_flow(switch, &ctx.router, ctx.inbound_vpn));

        if let Err(e) = self.commit(&batch).await {
            warn!(
                "FlowOrch: failed to install primary flows for router {} on switch {}: {}",
                ctx.router, switch, e
            );
            audit_log!(AuditRecord::new(
                AuditCategory::FlowProgramming,
                "FlowOrch",
                "install_primary"
            )
            .with_outcome(AuditOutcome::Failure)
            .with_object_id(ctx.router.to_string())
            .with_object_type("router")
            .with_details(serde_json::json!({ "switch": switch.as_u64() }))
            .with_error(e.to_string()));
            return Err(e);
        }

        bump(&self.counters.primary_installs);
        info!(
            "FlowOrch: installed primary flows for router {} on switch {} ({} ops)",
            ctx.router,
            switch,
            batch.len()
        );
        audit_log!(AuditRecord::new(
            AuditCategory::FlowProgramming,
            "FlowOrch",
            "install_primary"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(ctx.router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "switch": switch.as_u64(),
            "segment": ctx.segment.as_u32(),
            "external_ips": ctx.external_ips.iter().map(|t| t.ip.to_string()).collect::<Vec<_>>(),
            "napt_mode": format!("{:?}", self.config.napt_mode),
        })));
        Ok(())
    }

    /// Keys of every primary-role flow of the router on `switch`, session
    /// flows of `sessions` first.
    pub fn primary_cleanup(
        switch: SwitchId,
        ctx: &RouterFlowContext,
        sessions: &[SessionEntry],
    ) -> StaleCleanup {
        let mut flows = Vec::new();
        for session in sessions {
            flows.push(builder::session_forward_key(switch, session));
            flows.push(builder::session_reverse_key(switch, session));
        }
        for target in &ctx.external_ips {
            flows.push(builder::pfib_outbound_key(switch, &ctx.router, target.ip));
        }
        flows.push(builder::pfib_inbound_key(switch, &ctx.router, ctx.inbound_vpn));
        if ctx.inbound_vpn != ctx.segment {
            flows.push(builder::pfib_inbound_key(switch, &ctx.router, ctx.segment));
        }
        flows.push(builder::outbound_miss_key(switch, &ctx.router));
        flows.push(builder::internal_tunnel_key(switch, &ctx.router));
        flows.push(builder::psnat_key(switch, &ctx.router));
        StaleCleanup::new(switch, ctx.router.clone()).with_flows(flows)
    }

    /// Keys of the ordinary-role state of the router on `switch`.
    pub fn ordinary_cleanup(switch: SwitchId, ctx: &RouterFlowContext) -> StaleCleanup {
        StaleCleanup::new(switch, ctx.router.clone())
            .with_flows([builder::psnat_key(switch, &ctx.router)])
            .with_groups([GroupKey::new(switch, ctx.group_id)])
    }

    /// Removes the flows of `cleanup`, then its groups.
    pub async fn apply_cleanup(&self, cleanup: &StaleCleanup) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        for key in &cleanup.flows {
            batch.remove_flow(key.clone());
        }
        for key in &cleanup.groups {
            batch.remove_group(*key);
        }
        self.commit(&batch).await
    }

    /// Removes every primary-role flow of the router from `switch`,
    /// including the session flows of `sessions`.
    pub async fn remove_primary(
        &self,
        switch: SwitchId,
        ctx: &RouterFlowContext,
        sessions: &[SessionEntry],
    ) -> Result<()> {
        self.apply_cleanup(&Self::primary_cleanup(switch, ctx, sessions))
            .await?;
        bump(&self.counters.primary_removals);
        info!(
            "FlowOrch: removed primary flows for router {} from switch {}",
            ctx.router, switch
        );
        Ok(())
    }

    /// Points an ordinary switch at `primary`: group first, then the flow
    /// referencing it.
    pub async fn install_ordinary(
        &self,
        switch: SwitchId,
        primary: SwitchId,
        ctx: &RouterFlowContext,
    ) -> Result<()> {
        let tunnel_port = self.resolve_tunnel(switch, primary).map_err(|e| {
            bump(&self.counters.errors);
            warn!("FlowOrch: {} (router {})", e, ctx.router);
            e
        })?;

        let mut batch = ProgrammingBatch::new();
        batch
            .install_group(builder::ordinary_group(switch, ctx, &tunnel_port))
            .install_flow(builder::ordinary_psnat_flow(switch, ctx));
        self.commit(&batch).await?;

        bump(&self.counters.ordinary_installs);
        debug!(
            "FlowOrch: switch {} tunnels router {} to primary {} via {}",
            switch, ctx.router, primary, tunnel_port
        );
        Ok(())
    }

    /// Flow before group.
    pub async fn remove_ordinary(&self, switch: SwitchId, ctx: &RouterFlowContext) -> Result<()> {
        self.apply_cleanup(&Self::ordinary_cleanup(switch, ctx)).await?;
        bump(&self.counters.ordinary_removals);
        debug!(
            "FlowOrch: removed ordinary state of router {} from switch {}",
            ctx.router, switch
        );
        Ok(())
    }

    /// Drops the group a newly promoted primary kept from its ordinary role.
    /// Only valid once the primary PSNAT flow has replaced the group redirect.
    pub async fn remove_stale_group(&self, switch: SwitchId, ctx: &RouterFlowContext) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch.remove_group(GroupKey::new(switch, ctx.group_id));
        self.commit(&batch).await
    }

    /// Installs forward and reverse translation flows of one session.
    pub async fn install_session(
        &self,
        switch: SwitchId,
        ctx: &RouterFlowContext,
        session: &SessionEntry,
    ) -> Result<()> {
        let external_vpn = ctx.external_vpn(session.external.ip).ok_or_else(|| {
            FlowOrchError::UnknownExternalIp {
                router: ctx.router.clone(),
                ip: session.external.ip,
            }
        })?;

        let mut batch = ProgrammingBatch::new();
        batch
            .install_flow(builder::session_forward_flow(switch, ctx, session, external_vpn))
            .install_flow(builder::session_reverse_flow(switch, ctx, session, external_vpn));
        self.commit(&batch).await?;
        bump(&self.counters.session_installs);
        debug!(
            "FlowOrch: session {} <-> {} of router {} installed on switch {}",
            session.internal, session.external, ctx.router, switch
        );
        Ok(())
    }

    pub async fn remove_session(&self, switch: SwitchId, session: &SessionEntry) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch
            .remove_flow(builder::session_forward_key(switch, session))
            .remove_flow(builder::session_reverse_key(switch, session));
        self.commit(&batch).await?;
        bump(&self.counters.session_removals);
        Ok(())
    }

    pub async fn install_inbound_pfib(&self, switch: SwitchId, ctx: &RouterFlowContext) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch.install_flow(builder::pfib_inbound_flow(switch, &ctx.router, ctx.inbound_vpn));
        self.commit(&batch).await
    }

    pub async fn remove_inbound_pfib(
        &self,
        switch: SwitchId,
        router: &RouterId,
        vpn: VpnId,
    ) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch.remove_flow(builder::pfib_inbound_key(switch, router, vpn));
        self.commit(&batch).await
    }

    /// Removes the post-translation flow of an external IP leaving the
    /// router.
    pub async fn remove_external_ip(
        &self,
        switch: SwitchId,
        router: &RouterId,
        external_ip: Ipv4Addr,
    ) -> Result<()> {
        let mut batch = ProgrammingBatch::new();
        batch.remove_flow(builder::pfib_outbound_key(switch, router, external_ip));
        self.commit(&batch).await
    }
}
