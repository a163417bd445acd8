//! Router lifecycle orchestration logic.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use snat_orch_common::TaskError;
use snat_types::{InternalAddress, Ipv4Prefix, RouterId, SwitchId, VpnId};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::allocator::{AllocatorError, ExternalIpAllocator};
use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::{ContextError, ContextResolver, ExternalIpBinding};
use crate::flows::{FlowOrch, FlowOrchError};
use crate::ha::{NaptHaError, NaptHaOrch};
use crate::services::{IdPool, ServiceError, SwitchLiveness, TopologyService};
use crate::session::{NaptSessionManager, SessionError, SessionFilter};
use crate::store::{
    NatStore, RetiringExternalIp, RouterConfig, RouterRecord, RouterSegment, RouterState, StoreError,
};

/// Pool of per-router segment ids (the router's internal VPN).
pub const SEGMENT_POOL: &str = "snat-router-segments";
/// Pool of per-router group ids used by ordinary switches.
pub const GROUP_POOL: &str = "snat-router-groups";

const SEGMENT_RANGE: (u32, u32) = (5000, 99_999);
const GROUP_RANGE: (u32, u32) = (150_000, 174_999);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterOrchError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("No tunnel endpoint for NAPT switch {0}")]
    NoTunnelEndpoint(SwitchId),

    #[error("Id pool {pool} failed: {source}")]
    IdPool {
        pool: &'static str,
        #[source]
        source: ServiceError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Flow(#[from] FlowOrchError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    #[error(transparent)]
    Ha(#[from] NaptHaError),
}

pub type Result<T> = std::result::Result<T, RouterOrchError>;

impl From<RouterOrchError> for TaskError {
    fn from(err: RouterOrchError) -> Self {
        match err {
            RouterOrchError::RouterNotFound(_) | RouterOrchError::NoTunnelEndpoint(_) => {
                TaskError::invalid_config(err.to_string())
            }
            RouterOrchError::IdPool {
                source: ServiceError::PoolExhausted(_),
                ..
            } => TaskError::aborted(err.to_string()),
            RouterOrchError::IdPool { .. } => TaskError::southbound(err.to_string()),
            RouterOrchError::Store(e) => e.into(),
            RouterOrchError::Context(e) => e.into(),
            RouterOrchError::Flow(e) => e.into(),
            RouterOrchError::Session(e) => e.into(),
            RouterOrchError::Allocator(e) => e.into(),
            RouterOrchError::Ha(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VpnAction {
    Attach,
    Detach,
}

pub struct RouterOrch {
    store: Arc<dyn NatStore>,
    id_pool: Arc<dyn IdPool>,
    liveness: Arc<dyn SwitchLiveness>,
    topology: Arc<dyn TopologyService>,
    flow_orch: Arc<FlowOrch>,
    allocator: Arc<ExternalIpAllocator>,
    sessions: Arc<NaptSessionManager>,
    ha: Arc<NaptHaOrch>,
    resolver: Arc<ContextResolver>,
}

impl RouterOrch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn NatStore>,
        id_pool: Arc<dyn IdPool>,
        liveness: Arc<dyn SwitchLiveness>,
        topology: Arc<dyn TopologyService>,
        flow_orch: Arc<FlowOrch>,
        allocator: Arc<ExternalIpAllocator>,
        sessions: Arc<NaptSessionManager>,
        ha: Arc<NaptHaOrch>,
        resolver: Arc<ContextResolver>,
    ) -> Self {
        Self {
            store,
            id_pool,
            liveness,
            topology,
            flow_orch,
            allocator,
            sessions,
            ha,
            resolver,
        }
    }

    async fn allocate_id(&self, pool: &'static str, range: (u32, u32), router: &RouterId) -> Result<u32> {
        let pool_error = |source| RouterOrchError::IdPool { pool, source };
        self.id_pool
            .create_pool(pool, range.0, range.1)
            .await
            .map_err(pool_error)?;
        self.id_pool
            .allocate_unique_id(pool, router.as_str())
            .await
            .map_err(pool_error)
    }

    async fn allocate_segment(&self, router: &RouterId) -> Result<RouterSegment> {
        let segment_id = self.allocate_id(SEGMENT_POOL, SEGMENT_RANGE, router).await?;
        let group_id = self.allocate_id(GROUP_POOL, GROUP_RANGE, router).await?;
        Ok(RouterSegment {
            segment_id: VpnId::new(segment_id),
            group_id,
        })
    }

    async fn release_segment(&self, router: &RouterId) -> Result<()> {
        for pool in [SEGMENT_POOL, GROUP_POOL] {
            self.id_pool
                .release_unique_id(pool, router.as_str())
                .await
                .map_err(|source| RouterOrchError::IdPool { pool, source })?;
        }
        Ok(())
    }

    /// Router create or update. Returns the router's state afterwards.
    pub async fn on_router_changed(&self, config: RouterConfig) -> Result<RouterState> {
        let router = config.id.clone();
        let previous = self.store.router(&router);
        let was_enabled = previous
            .as_ref()
            .is_some_and(|r| r.state != RouterState::Disabled);

        match (previous, config.snat_active()) {
            (None, false) => {
                debug!("RouterOrch: router {} created with SNAT inactive", router);
                self.store.put_router(RouterRecord::new(config));
                Ok(RouterState::Disabled)
            }
            (Some(mut record), false) => {
                if was_enabled {
                    self.teardown(&record).await?;
                    audit_lifecycle(&router, "disable", serde_json::json!({}));
                }
                record.config = config;
                record.state = RouterState::Disabled;
                record.retiring_ips.clear();
                self.store.put_router(record);
                Ok(RouterState::Disabled)
            }
            (Some(record), true) if was_enabled => self.update(record, config).await,
            (_, true) => self.enable(config).await,
        }
    }

    async fn enable(&self, config: RouterConfig) -> Result<RouterState> {
        let router = config.id.clone();
        let segment = self.allocate_segment(&router).await?;

        let mut record = RouterRecord::new(config);
        record.segment = Some(segment);
        record.state = RouterState::PendingElection;
        let external_ips = record.config.external_ip_list();
        self.store.put_router(record);
        for ip in &external_ips {
            self.store.register_external_ip(&router, *ip);
        }
        let mappings = self.allocator.distribute_initial(&router)?;

        info!(
            "RouterOrch: SNAT enabled on router {} (segment {}, group {}, {} subnets)",
            router,
            segment.segment_id,
            segment.group_id,
            mappings.len()
        );
        audit_lifecycle(
            &router,
            "enable",
            serde_json::json!({
                "segment": segment.segment_id.as_u32(),
                "group": segment.group_id,
                "external_ips": external_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
            }),
        );
        self.elect(&router).await
    }

    /// Elects and installs a NAPT switch for `router`, keeping a live
    /// current assignment. Leaves the router in `PendingElection` when no
    /// live candidate exists.
    pub async fn elect(&self, router: &RouterId) -> Result<RouterState> {
        if let Some(current) = self.store.napt_switch(router) {
            if self.liveness.is_switch_up(current) {
                self.ha.migrate(router, None, current).await?;
                return Ok(RouterState::Active);
            }
        }

        let candidates = self.topology.candidate_switches(router);
        let exclude: BTreeSet<SwitchId> = candidates
            .iter()
            .filter(|s| !self.liveness.is_switch_up(**s))
            .copied()
            .collect();

        match self.ha.selector().select(&candidates, &exclude) {
            Some(switch) => {
                self.ha.migrate(router, None, switch).await?;
                Ok(RouterState::Active)
            }
            None => {
                self.store.set_assignment(router, None);
                self.store
                    .set_router_state(router, RouterState::PendingElection)?;
                warn!(
                    "RouterOrch: no live NAPT switch candidate for router {} ({} candidates)",
                    router,
                    candidates.len()
                );
                Ok(RouterState::PendingElection)
            }
        }
    }

    /// Removes everything an enabled router installed; the record stays.
    ///
    /// Switch cleanup is best effort: state on an unreachable switch is
    /// recorded and removed once the switch is back. Only route and store
    /// failures leave the router enabled for a retry.
    async fn teardown(&self, record: &RouterRecord) -> Result<()> {
        let router = record.id();
        let primary = self.store.napt_switch(router);

        if record.segment.is_some() {
            let ctx = self.resolver.resolve_record(record)?;
            if let Some(primary) = primary {
                self.ha.release_primary(router, primary, &ctx).await;
            }
            for switch in self.topology.candidate_switches(router) {
                if Some(switch) == primary {
                    continue;
                }
                if !self.liveness.is_switch_up(switch) {
                    debug!(
                        "RouterOrch: switch {} down, deferring ordinary cleanup of router {}",
                        switch, router
                    );
                    self.ha.defer_cleanup(FlowOrch::ordinary_cleanup(switch, &ctx));
                    continue;
                }
                if let Err(e) = self.flow_orch.remove_ordinary(switch, &ctx).await {
                    warn!(
                        "RouterOrch: ordinary cleanup of router {} on switch {} failed, deferring: {}",
                        router, switch, e
                    );
                    self.ha.defer_cleanup(FlowOrch::ordinary_cleanup(switch, &ctx));
                }
            }
        }
        // Session flows went with the primary state.
        self.sessions.drop_sessions(router).await?;

        for retiring in &record.retiring_ips {
            self.allocator
                .withdraw_external_ip(router, &retiring_binding(retiring))
                .await?;
        }
        self.allocator.release_all(router).await?;
        for ip in record.config.external_ip_list() {
            self.store.unregister_external_ip(router, ip);
        }
        for retiring in &record.retiring_ips {
            self.store.unregister_external_ip(router, retiring.ip);
        }
        self.store.remove_assignment(router);
        self.store.set_router_state(router, RouterState::Disabled)?;
        info!("RouterOrch: SNAT disabled on router {}", router);
        Ok(())
    }

    /// Applies a configuration change to an enabled router.
    ///
    /// External IPs that left the router, or moved to another external
    /// subnet, are persisted as retiring together with the new
    /// configuration and dropped from that list one by one as their cleanup
    /// completes. A retried update therefore resumes where a failed one
    /// stopped; subnet changes are derived from the live mappings.
    async fn update(&self, previous: RouterRecord, config: RouterConfig) -> Result<RouterState> {
        let router = config.id.clone();
        let old_ips = previous.config.external_ip_list();
        let new_bindings = self.resolver.external_bindings(&config)?;

        let mut retiring = previous.retiring_ips.clone();
        for old in self.resolver.external_bindings(&previous.config)? {
            let kept = new_bindings
                .iter()
                .any(|b| b.ip == old.ip && b.vpn == old.vpn);
            let entry = RetiringExternalIp {
                ip: old.ip,
                vpn: old.vpn,
            };
            if !kept && !retiring.contains(&entry) {
                retiring.push(entry);
            }
        }
        let added_ips: Vec<Ipv4Addr> = new_bindings
            .iter()
            .map(|b| b.ip)
            .filter(|ip| !old_ips.contains(ip))
            .collect();

        let record = RouterRecord {
            config,
            state: previous.state,
            segment: previous.segment,
            retiring_ips: retiring,
        };
        self.store.put_router(record.clone());
        for binding in &new_bindings {
            self.store.register_external_ip(&router, binding.ip);
        }

        let primary = self.store.napt_switch(&router);
        let mut removed_ips = Vec::new();
        let mut rebound_ips = Vec::new();
        for entry in &record.retiring_ips {
            if new_bindings.iter().any(|b| b.ip == entry.ip) {
                // Same address in another VPN: mappings and sessions stay,
                // the route moves when advertisements are refreshed below.
                self.allocator
                    .withdraw_external_ip(&router, &retiring_binding(entry))
                    .await?;
                rebound_ips.push(entry.ip);
            } else {
                self.sessions
                    .purge_sessions(&router, SessionFilter::ExternalIp(entry.ip))
                    .await?;
                if let Some(primary) = primary {
                    self.flow_orch
                        .remove_external_ip(primary, &router, entry.ip)
                        .await?;
                }
                self.allocator
                    .remove_external_ip(&router, &retiring_binding(entry))
                    .await?;
                removed_ips.push(entry.ip);
            }
            self.finish_retirement(&router, entry)?;
        }

        let configured: Vec<Ipv4Prefix> = record.config.subnets.iter().map(|s| s.prefix).collect();
        let removed_subnets: Vec<Ipv4Prefix> = self
            .store
            .endpoints(&router)
            .into_iter()
            .filter_map(|m| match m.internal {
                InternalAddress::Subnet(prefix) if !configured.contains(&prefix) => Some(prefix),
                _ => None,
            })
            .collect();
        for prefix in &removed_subnets {
            self.sessions
                .purge_sessions(&router, SessionFilter::InternalSubnet(*prefix))
                .await?;
            self.allocator
                .release(&router, &InternalAddress::from(*prefix))
                .await?;
        }
        for prefix in &configured {
            self.allocator
                .allocate(&router, InternalAddress::from(*prefix))
                .await?;
        }

        let state = match (record.state, primary) {
            (RouterState::Active, Some(primary)) => {
                self.refresh_primary(&router, primary).await?;
                RouterState::Active
            }
            (RouterState::Migrating, _) => RouterState::Migrating,
            _ => self.elect(&router).await?,
        };

        info!(
            "RouterOrch: router {} updated (+{} / -{} external IPs, {} moved, -{} subnets)",
            router,
            added_ips.len(),
            removed_ips.len(),
            rebound_ips.len(),
            removed_subnets.len()
        );
        audit_lifecycle(
            &router,
            "update",
            serde_json::json!({
                "added_ips": added_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
                "removed_ips": removed_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
                "moved_ips": rebound_ips.iter().map(|ip| ip.to_string()).collect::<Vec<_>>(),
                "removed_subnets": removed_subnets.iter().map(|p| p.to_string()).collect::<Vec<_>>(),
            }),
        );
        Ok(state)
    }

    fn finish_retirement(&self, router: &RouterId, entry: &RetiringExternalIp) -> Result<()> {
        let mut record = self
            .store
            .router(router)
            .ok_or_else(|| RouterOrchError::RouterNotFound(router.clone()))?;
        record.retiring_ips.retain(|r| r != entry);
        self.store.put_router(record);
        Ok(())
    }

    /// Reinstalls the primary state of an active router and publishes its
    /// external IPs through `primary`.
    async fn refresh_primary(&self, router: &RouterId, primary: SwitchId) -> Result<()> {
        let ctx = self.resolver.resolve(router)?;
        self.flow_orch.install_primary(primary, &ctx).await?;
        self.sessions.replay(router, primary, &ctx).await?;
        let next_hop = self
            .topology
            .switch_endpoint(primary)
            .ok_or(RouterOrchError::NoTunnelEndpoint(primary))?;
        self.allocator.refresh_advertisements(router, next_hop).await?;
        Ok(())
    }

    /// Router deletion. Returns false for unknown routers.
    pub async fn on_router_removed(&self, router: &RouterId) -> Result<bool> {
        let Some(record) = self.store.router(router) else {
            debug!("RouterOrch: removal of unknown router {}", router);
            return Ok(false);
        };
        if record.state != RouterState::Disabled {
            self.teardown(&record).await?;
        }
        if record.segment.is_some() {
            self.release_segment(router).await?;
        }
        let summary = self.store.purge_router(router);
        self.store.remove_router(router);

        info!("RouterOrch: router {} removed", router);
        audit_lifecycle(
            router,
            "remove",
            serde_json::json!({
                "endpoints": summary.endpoints,
                "sessions": summary.sessions,
                "usage_counters": summary.usage_counters,
            }),
        );
        Ok(true)
    }

    /// Brings `router` up to date after `switch` recovered: stale primary
    /// state is removed, then the switch rejoins as NAPT or ordinary
    /// switch.
    pub async fn reconcile_switch_up(&self, router: &RouterId, switch: SwitchId) -> Result<()> {
        if self.ha.retry_stale_cleanup(router, switch).await? {
            debug!(
                "RouterOrch: cleared stale state of router {} on switch {}",
                router, switch
            );
        }

        let Some(record) = self.store.router(router) else {
            return Ok(());
        };
        if record.state == RouterState::Disabled
            || !self.topology.candidate_switches(router).contains(&switch)
        {
            return Ok(());
        }

        match self.store.napt_switch(router) {
            None => {
                self.elect(router).await?;
            }
            Some(primary) if primary == switch => {
                self.ha.migrate(router, None, primary).await?;
            }
            Some(primary) => {
                let ctx = self.resolver.resolve_record(&record)?;
                self.flow_orch.install_ordinary(switch, primary, &ctx).await?;
                debug!(
                    "RouterOrch: switch {} rejoined router {} as ordinary switch",
                    switch, router
                );
            }
        }
        Ok(())
    }

    /// Attach or detach the VPN whose traffic enters the router after
    /// translation. Inbound flows move to the new VPN on an active router.
    pub async fn on_vpn_association_changed(
        &self,
        router: &RouterId,
        vpn: VpnId,
        action: VpnAction,
    ) -> Result<()> {
        let record = self
            .store
            .router(router)
            .ok_or_else(|| RouterOrchError::RouterNotFound(router.clone()))?;
        let current = self.store.vpn_association(router);

        match action {
            VpnAction::Attach => self.store.set_vpn_association(router, Some(vpn)),
            VpnAction::Detach if current == Some(vpn) => {
                self.store.set_vpn_association(router, None)
            }
            VpnAction::Detach => {
                debug!(
                    "RouterOrch: router {} not associated with VPN {}, ignoring detach",
                    router, vpn
                );
                return Ok(());
            }
        }

        let primary = self.store.napt_switch(router);
        let (Some(primary), Some(segment)) = (primary, record.segment) else {
            return Ok(());
        };
        if record.state != RouterState::Active {
            return Ok(());
        }
        let old_vpn = current.unwrap_or(segment.segment_id);
        let ctx = self.resolver.resolve(router)?;
        if ctx.inbound_vpn == old_vpn {
            return Ok(());
        }

        self.flow_orch.install_inbound_pfib(primary, &ctx).await?;
        self.flow_orch
            .remove_inbound_pfib(primary, router, old_vpn)
            .await?;
        let replayed = self.sessions.replay(router, primary, &ctx).await?;
        info!(
            "RouterOrch: router {} inbound VPN {} -> {} ({} sessions moved)",
            router, old_vpn, ctx.inbound_vpn, replayed
        );
        Ok(())
    }

    pub fn restore_stable_state(&self, router: &RouterId) -> Option<RouterState> {
        self.ha.restore_stable_state(router)
    }
}

fn retiring_binding(entry: &RetiringExternalIp) -> ExternalIpBinding {
    ExternalIpBinding {
        ip: entry.ip,
        vpn: entry.vpn.clone(),
    }
}

fn audit_lifecycle(router: &RouterId, action: &str, details: serde_json::Value) {
    audit_log!(AuditRecord::new(AuditCategory::RouterLifecycle, "RouterOrch", action)
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(details));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::bridge::RouteBridge;
    use crate::flows::builder::pfib_inbound_key;
    use crate::flows::{tables, FlowOrchConfig, GroupKey};
    use crate::ha::NaptHaConfig;
    use crate::selector::FirstAvailableSelector;
    use crate::services::{ExternalNetwork, ExternalSubnet, ProviderType, TunnelType, VpnBinding};
    use crate::session::SessionConfig;
    use crate::store::{ExternalIpConfig, InternalSubnet};
    use pretty_assertions::assert_eq;
    use snat_types::{NatProtocol, SessionKey};

    const D1: SwitchId = SwitchId::new(1);
    const D2: SwitchId = SwitchId::new(2);
    const E1: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);
    const E2: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);

    struct Fixture {
        orch: RouterOrch,
        sessions: Arc<NaptSessionManager>,
        backend: MemoryBackend,
    }

    fn fixture() -> Fixture {
        let backend = MemoryBackend::new();
        backend.topology.add_network(ExternalNetwork {
            id: "ext-net".into(),
            provider: Some(ProviderType::Flat),
            vpn: VpnBinding {
                name: "ext-vpn".to_string(),
                vpn_id: VpnId::new(500),
                route_distinguisher: "100:500".to_string(),
            },
        });
        backend
            .topology
            .set_switch_endpoint(D1, Ipv4Addr::new(192, 168, 0, 1));
        backend
            .topology
            .set_switch_endpoint(D2, Ipv4Addr::new(192, 168, 0, 2));
        backend.tunnels.add_mesh(&[D1, D2], TunnelType::Vxlan);
        backend.topology.set_candidates(&RouterId::new("r1"), [D1, D2]);

        let services = backend.services();
        let resolver = Arc::new(ContextResolver::new(
            services.store.clone(),
            services.topology.clone(),
        ));
        let flow_orch = Arc::new(FlowOrch::new(
            FlowOrchConfig::default(),
            services.flows.clone(),
            services.tunnels.clone(),
        ));
        let bridge = Arc::new(RouteBridge::new(services.routes.clone(), services.store.clone()));
        let allocator = Arc::new(ExternalIpAllocator::new(
            services.store.clone(),
            services.topology.clone(),
            bridge,
            resolver.clone(),
        ));
        let sessions = Arc::new(NaptSessionManager::new(
            SessionConfig::default(),
            services.store.clone(),
            services.id_pool.clone(),
            flow_orch.clone(),
            resolver.clone(),
        ));
        let ha = Arc::new(NaptHaOrch::new(
            NaptHaConfig::default(),
            services.store.clone(),
            services.liveness.clone(),
            services.topology.clone(),
            Arc::new(FirstAvailableSelector),
            flow_orch.clone(),
            sessions.clone(),
            allocator.clone(),
            resolver.clone(),
        ));
        let orch = RouterOrch::new(
            services.store,
            services.id_pool,
            services.liveness,
            services.topology,
            flow_orch,
            allocator,
            sessions.clone(),
            ha,
            resolver,
        );
        Fixture {
            orch,
            sessions,
            backend,
        }
    }

    fn router_config(ips: &[Ipv4Addr], subnets: &[&str]) -> RouterConfig {
        let mut config = RouterConfig::new("r1");
        config.enable_snat = true;
        config.network_id = Some("ext-net".into());
        config.external_ips = ips
            .iter()
            .map(|ip| ExternalIpConfig {
                ip: *ip,
                subnet_id: "ext-sub".into(),
            })
            .collect();
        config.subnets = subnets
            .iter()
            .enumerate()
            .map(|(i, prefix)| InternalSubnet {
                id: format!("s{}", i + 1).as_str().into(),
                prefix: prefix.parse().unwrap(),
            })
            .collect();
        config
    }

    fn r1() -> RouterId {
        RouterId::new("r1")
    }

    #[tokio::test]
    async fn test_enable_distributes_and_elects() {
        let f = fixture();
        let state = f
            .orch
            .on_router_changed(router_config(&[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]))
            .await
            .unwrap();
        assert_eq!(state, RouterState::Active);
        assert_eq!(f.backend.store.napt_switch(&r1()), Some(D1));
        assert_eq!(f.backend.store.usage(&r1(), E1), Some(1));
        assert_eq!(f.backend.store.usage(&r1(), E2), Some(1));

        let record = f.backend.store.router(&r1()).unwrap();
        let segment = record.segment.unwrap();
        assert_eq!(segment.segment_id, VpnId::new(5000));
        assert_eq!(segment.group_id, 150_000);
        assert!(f.backend.flows.group(&GroupKey::new(D2, 150_000)).is_some());
        assert_eq!(f.backend.routes.advertised_count(), 2);
    }

    #[tokio::test]
    async fn test_inactive_router_is_recorded_only() {
        let f = fixture();
        let mut config = router_config(&[E1], &["10.0.0.0/24"]);
        config.enable_snat = false;
        let state = f.orch.on_router_changed(config).await.unwrap();
        assert_eq!(state, RouterState::Disabled);
        assert_eq!(f.backend.store.napt_switch(&r1()), None);
        assert_eq!(f.backend.flows.flow_count(), 0);
    }

    #[tokio::test]
    async fn test_no_live_candidate_stays_pending() {
        let f = fixture();
        f.backend.switch_down(D1);
        f.backend.switch_down(D2);
        let state = f
            .orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        assert_eq!(state, RouterState::PendingElection);
        assert_eq!(f.backend.store.usage(&r1(), E1), Some(1));

        f.backend.switch_up(D2);
        f.orch.reconcile_switch_up(&r1(), D2).await.unwrap();
        assert_eq!(f.backend.store.napt_switch(&r1()), Some(D2));
        assert_eq!(
            f.backend.store.router(&r1()).unwrap().state,
            RouterState::Active
        );
    }

    #[tokio::test]
    async fn test_disable_tears_down() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        f.sessions
            .on_packet_in(&r1(), SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp))
            .await
            .unwrap();

        let mut config = router_config(&[E1], &["10.0.0.0/24"]);
        config.enable_snat = false;
        let state = f.orch.on_router_changed(config).await.unwrap();
        assert_eq!(state, RouterState::Disabled);
        assert_eq!(f.backend.flows.flow_count(), 0);
        assert_eq!(f.backend.flows.group_count(), 0);
        assert!(f.backend.store.sessions(&r1()).is_empty());
        assert!(f.backend.store.endpoints(&r1()).is_empty());
        assert_eq!(f.backend.store.usage(&r1(), E1), None);
        assert_eq!(f.backend.routes.advertised_count(), 0);
        assert_eq!(f.backend.routes.label_count(), 0);
    }

    #[tokio::test]
    async fn test_disable_with_unreachable_primary_defers_cleanup() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        f.sessions
            .on_packet_in(&r1(), SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp))
            .await
            .unwrap();
        f.backend.switch_down(D1);

        let mut config = router_config(&[E1], &["10.0.0.0/24"]);
        config.enable_snat = false;
        let state = f.orch.on_router_changed(config).await.unwrap();
        assert_eq!(state, RouterState::Disabled);
        assert_eq!(f.backend.store.napt_switch(&r1()), None);
        assert!(f.backend.store.sessions(&r1()).is_empty());
        assert!(f.backend.store.endpoints(&r1()).is_empty());
        assert_eq!(f.backend.store.usage(&r1(), E1), None);
        assert_eq!(f.backend.routes.advertised_count(), 0);
        assert!(f.backend.flows.groups_on(D2).is_empty());

        // Primary flows plus the session pair wait for the switch.
        let stale = f.backend.store.stale_cleanups(D1);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].flows.len(), 7);

        f.backend.switch_up(D1);
        f.orch.reconcile_switch_up(&r1(), D1).await.unwrap();
        assert!(f.backend.flows.flows_on(D1).is_empty());
        assert!(f.backend.store.stale_cleanups(D1).is_empty());
        assert_eq!(f.backend.store.napt_switch(&r1()), None);
    }

    #[tokio::test]
    async fn test_update_adds_subnet_and_ip() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        f.orch
            .on_router_changed(router_config(&[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]))
            .await
            .unwrap();

        let mapping = f
            .backend
            .store
            .endpoint(&r1(), &InternalAddress::Subnet("10.0.1.0/24".parse().unwrap()))
            .unwrap();
        assert_eq!(mapping.external_ip, E2);
        assert!(mapping.label.is_some());
        // Two outbound post-translation flows plus the inbound one.
        assert_eq!(
            f.backend
                .flows
                .flows_in_table(D1, tables::NAPT_PFIB_TABLE)
                .len(),
            3
        );
    }

    #[tokio::test]
    async fn test_update_removes_external_ip() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]))
            .await
            .unwrap();
        f.orch
            .on_router_changed(router_config(&[E2], &["10.0.0.0/24", "10.0.1.0/24"]))
            .await
            .unwrap();

        assert!(f
            .backend
            .store
            .endpoints(&r1())
            .iter()
            .all(|m| m.external_ip == E2));
        assert_eq!(f.backend.store.usage(&r1(), E1), None);
        assert_eq!(f.backend.store.usage(&r1(), E2), Some(2));
        assert_eq!(f.backend.routes.advertised("100:500", &Ipv4Prefix::host(E1)), None);
        assert_eq!(
            f.backend
                .flows
                .flows_in_table(D1, tables::NAPT_PFIB_TABLE)
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_retried_update_finishes_ip_removal() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]))
            .await
            .unwrap();

        f.backend.flows.set_reachable(D1, false);
        let config = router_config(&[E2], &["10.0.0.0/24", "10.0.1.0/24"]);
        assert!(f.orch.on_router_changed(config.clone()).await.is_err());
        let record = f.backend.store.router(&r1()).unwrap();
        assert_eq!(record.retiring_ips.len(), 1);
        assert_eq!(record.retiring_ips[0].ip, E1);

        f.backend.flows.set_reachable(D1, true);
        let state = f.orch.on_router_changed(config).await.unwrap();
        assert_eq!(state, RouterState::Active);
        assert!(f.backend.store.router(&r1()).unwrap().retiring_ips.is_empty());
        assert!(f
            .backend
            .store
            .endpoints(&r1())
            .iter()
            .all(|m| m.external_ip == E2));
        assert_eq!(f.backend.store.usage(&r1(), E1), None);
        assert_eq!(f.backend.routes.advertised("100:500", &Ipv4Prefix::host(E1)), None);
        assert!(f
            .backend
            .routes
            .advertised("100:500", &Ipv4Prefix::host(E2))
            .is_some());
        assert_eq!(
            f.backend
                .flows
                .flows_in_table(D1, tables::NAPT_PFIB_TABLE)
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_external_ip_moved_to_subnet_vpn() {
        let f = fixture();
        f.backend.topology.add_subnet(ExternalSubnet {
            id: "sub-own".into(),
            vpn: Some(VpnBinding {
                name: "own-vpn".to_string(),
                vpn_id: VpnId::new(600),
                route_distinguisher: "100:600".to_string(),
            }),
        });
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        let prefix = Ipv4Prefix::host(E1);
        assert!(f.backend.routes.advertised("100:500", &prefix).is_some());

        let mut config = router_config(&[E1], &["10.0.0.0/24"]);
        config.external_ips[0].subnet_id = "sub-own".into();
        let state = f.orch.on_router_changed(config).await.unwrap();
        assert_eq!(state, RouterState::Active);

        assert_eq!(f.backend.routes.advertised("100:500", &prefix), None);
        assert_eq!(f.backend.routes.label("ext-vpn", &prefix), None);
        let route = f.backend.routes.advertised("100:600", &prefix).unwrap();
        assert_eq!(route.next_hop, Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(f.backend.routes.label("own-vpn", &prefix), Some(route.label));

        let mapping = f
            .backend
            .store
            .endpoint(&r1(), &InternalAddress::Subnet("10.0.0.0/24".parse().unwrap()))
            .unwrap();
        assert_eq!(mapping.external_ip, E1);
        assert_eq!(mapping.label, Some(route.label));
        assert_eq!(f.backend.store.usage(&r1(), E1), Some(1));
        assert!(f.backend.store.router(&r1()).unwrap().retiring_ips.is_empty());
    }

    #[tokio::test]
    async fn test_remove_router_purges_everything() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        assert!(f.orch.on_router_removed(&r1()).await.unwrap());

        assert_eq!(f.backend.store.router(&r1()), None);
        assert_eq!(f.backend.store.assignment(&r1()), None);
        assert_eq!(f.backend.flows.flow_count(), 0);
        assert_eq!(f.backend.id_pool.allocated_count(SEGMENT_POOL), 0);
        assert_eq!(f.backend.id_pool.allocated_count(GROUP_POOL), 0);
        assert!(!f.orch.on_router_removed(&r1()).await.unwrap());
    }

    #[tokio::test]
    async fn test_vpn_association_moves_inbound_flow() {
        let f = fixture();
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        f.orch
            .on_vpn_association_changed(&r1(), VpnId::new(7000), VpnAction::Attach)
            .await
            .unwrap();

        let attached = pfib_inbound_key(D1, &r1(), VpnId::new(7000));
        let segment = pfib_inbound_key(D1, &r1(), VpnId::new(5000));
        assert!(f.backend.flows.flow(&attached).is_some());
        assert!(f.backend.flows.flow(&segment).is_none());

        f.orch
            .on_vpn_association_changed(&r1(), VpnId::new(7000), VpnAction::Detach)
            .await
            .unwrap();
        assert!(f.backend.flows.flow(&attached).is_none());
        assert!(f.backend.flows.flow(&segment).is_some());
        assert_eq!(f.backend.store.vpn_association(&r1()), None);
    }

    #[tokio::test]
    async fn test_switch_up_rejoins_as_ordinary() {
        let f = fixture();
        f.backend.switch_down(D2);
        f.orch
            .on_router_changed(router_config(&[E1], &["10.0.0.0/24"]))
            .await
            .unwrap();
        assert!(f.backend.flows.groups_on(D2).is_empty());

        f.backend.switch_up(D2);
        f.orch.reconcile_switch_up(&r1(), D2).await.unwrap();
        assert!(f.backend.flows.group(&GroupKey::new(D2, 150_000)).is_some());
    }
}
