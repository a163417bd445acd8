//! In-memory collaborators.
//!
//! Each type keeps just enough state to answer the queries tests and the
//! simulation binary need, and exposes switches for failure injection
//! (unreachable switches, failing label generation or advertisement).

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use snat_types::{Ipv4Prefix, Label, NetworkId, RouterId, SubnetId, SwitchId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::flows::{FlowEntry, FlowKey, GroupEntry, GroupKey};
use crate::services::{
    ExternalNetwork, ExternalSubnet, FlowProgrammer, IdPool, NatServices, RouteService,
    ServiceError, SwitchLiveness, TopologyService, TunnelResolver, TunnelType,
};
use crate::store::MemoryNatStore;

/// Flow/group tables of every switch.
///
/// Rejects a flow that references a group not installed on the same switch,
/// and a group removal while a flow still references it.
#[derive(Default)]
pub struct MemoryFlowProgrammer {
    flows: DashMap<FlowKey, FlowEntry>,
    groups: DashMap<GroupKey, GroupEntry>,
    unreachable: RwLock<HashSet<SwitchId>>,
    installs: AtomicU64,
}

impl MemoryFlowProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls against an unreachable switch fail with `SwitchUnreachable`.
    pub fn set_reachable(&self, switch: SwitchId, reachable: bool) {
        let mut unreachable = self.unreachable.write();
        if reachable {
            unreachable.remove(&switch);
        } else {
            unreachable.insert(switch);
        }
    }

    pub fn flow(&self, key: &FlowKey) -> Option<FlowEntry> {
        self.flows.get(key).map(|e| e.value().clone())
    }

    pub fn group(&self, key: &GroupKey) -> Option<GroupEntry> {
        self.groups.get(key).map(|e| e.value().clone())
    }

    pub fn flows_on(&self, switch: SwitchId) -> Vec<FlowEntry> {
        let mut flows: Vec<_> = self
            .flows
            .iter()
            .filter(|e| e.key().switch == switch)
            .map(|e| e.value().clone())
            .collect();
        flows.sort_by(|a, b| a.key.cmp(&b.key));
        flows
    }

    pub fn flows_in_table(&self, switch: SwitchId, table: u8) -> Vec<FlowEntry> {
        self.flows_on(switch)
            .into_iter()
            .filter(|f| f.key.table == table)
            .collect()
    }

    pub fn groups_on(&self, switch: SwitchId) -> Vec<GroupEntry> {
        let mut groups: Vec<_> = self
            .groups
            .iter()
            .filter(|e| e.key().switch == switch)
            .map(|e| e.value().clone())
            .collect();
        groups.sort_by(|a, b| a.key.cmp(&b.key));
        groups
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total successful install calls (flows and groups).
    pub fn install_count(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    fn check_reachable(&self, switch: SwitchId) -> Result<(), ServiceError> {
        if self.unreachable.read().contains(&switch) {
            Err(ServiceError::SwitchUnreachable(switch))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl FlowProgrammer for MemoryFlowProgrammer {
    async fn install_flow(&self, flow: &FlowEntry) -> Result<(), ServiceError> {
        self.check_reachable(flow.key.switch)?;
        for group_id in flow.referenced_groups() {
            let group = GroupKey::new(flow.key.switch, group_id);
            if !self.groups.contains_key(&group) {
                return Err(ServiceError::Rpc(format!(
                    "flow {} references missing group {}",
                    flow.key, group
                )));
            }
        }
        self.flows.insert(flow.key.clone(), flow.clone());
        self.installs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_flow(&self, key: &FlowKey) -> Result<(), ServiceError> {
        self.check_reachable(key.switch)?;
        self.flows.remove(key);
        Ok(())
    }

    async fn install_group(&self, group: &GroupEntry) -> Result<(), ServiceError> {
        self.check_reachable(group.key.switch)?;
        self.groups.insert(group.key, group.clone());
        self.installs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_group(&self, key: &GroupKey) -> Result<(), ServiceError> {
        self.check_reachable(key.switch)?;
        let in_use = self.flows.iter().any(|e| {
            e.key().switch == key.switch && e.value().referenced_groups().any(|g| g == key.group_id)
        });
        if in_use {
            return Err(ServiceError::Rpc(format!("group {} still referenced", key)));
        }
        self.groups.remove(key);
        Ok(())
    }
}

/// Tunnel interface names keyed by (src, dst, type).
#[derive(Default)]
pub struct MemoryTunnelResolver {
    tunnels: RwLock<HashMap<(SwitchId, SwitchId, TunnelType), String>>,
}

impl MemoryTunnelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tunnel(&self, src: SwitchId, dst: SwitchId, kind: TunnelType, name: impl Into<String>) {
        self.tunnels.write().insert((src, dst, kind), name.into());
    }

    pub fn remove_tunnel(&self, src: SwitchId, dst: SwitchId, kind: TunnelType) {
        self.tunnels.write().remove(&(src, dst, kind));
    }

    /// Adds a `kind` tunnel between every ordered pair of `switches`.
    pub fn add_mesh(&self, switches: &[SwitchId], kind: TunnelType) {
        for src in switches {
            for dst in switches {
                if src != dst {
                    self.add_tunnel(*src, *dst, kind, format!("tun-{}-{}-{}", kind, src, dst));
                }
            }
        }
    }
}

impl TunnelResolver for MemoryTunnelResolver {
    fn resolve_tunnel(&self, src: SwitchId, dst: SwitchId, kind: TunnelType) -> Option<String> {
        self.tunnels.read().get(&(src, dst, kind)).cloned()
    }
}

/// Route installed in the FIB or advertised to BGP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstalledRoute {
    pub next_hop: Ipv4Addr,
    pub label: Label,
}

type RouteKey = (String, Ipv4Prefix);

struct RouteTables {
    next_label: u32,
    labels: HashMap<RouteKey, Label>,
    fib: HashMap<RouteKey, InstalledRoute>,
    advertised: HashMap<RouteKey, InstalledRoute>,
}

impl Default for RouteTables {
    fn default() -> Self {
        Self {
            next_label: 100_000,
            labels: HashMap::new(),
            fib: HashMap::new(),
            advertised: HashMap::new(),
        }
    }
}

/// Label manager, FIB and BGP in one.
#[derive(Default)]
pub struct MemoryRouteService {
    tables: Mutex<RouteTables>,
    fail_labels: AtomicBool,
    fail_advertise: AtomicBool,
    fail_withdraw: AtomicBool,
}

impl MemoryRouteService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_labels(&self, fail: bool) {
        self.fail_labels.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_advertise(&self, fail: bool) {
        self.fail_advertise.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_withdraw(&self, fail: bool) {
        self.fail_withdraw.store(fail, Ordering::SeqCst);
    }

    pub fn label(&self, vpn_name: &str, prefix: &Ipv4Prefix) -> Option<Label> {
        self.tables
            .lock()
            .labels
            .get(&(vpn_name.to_string(), *prefix))
            .copied()
    }

    pub fn fib_entry(&self, rd: &str, prefix: &Ipv4Prefix) -> Option<InstalledRoute> {
        self.tables
            .lock()
            .fib
            .get(&(rd.to_string(), *prefix))
            .copied()
    }

    pub fn advertised(&self, rd: &str, prefix: &Ipv4Prefix) -> Option<InstalledRoute> {
        self.tables
            .lock()
            .advertised
            .get(&(rd.to_string(), *prefix))
            .copied()
    }

    pub fn advertised_count(&self) -> usize {
        self.tables.lock().advertised.len()
    }

    pub fn label_count(&self) -> usize {
        self.tables.lock().labels.len()
    }
}

#[async_trait]
impl RouteService for MemoryRouteService {
    async fn generate_label(&self, vpn_name: &str, prefix: &Ipv4Prefix) -> Result<Label, ServiceError> {
        if self.fail_labels.load(Ordering::SeqCst) {
            return Err(ServiceError::Rpc(format!(
                "label generation failed for {} in {}",
                prefix, vpn_name
            )));
        }
        let mut tables = self.tables.lock();
        let key = (vpn_name.to_string(), *prefix);
        if let Some(label) = tables.labels.get(&key) {
            return Ok(*label);
        }
        tables.next_label += 1;
        let label = Label::new(tables.next_label);
        tables.labels.insert(key, label);
        Ok(label)
    }

    async fn release_label(&self, vpn_name: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError> {
        self.tables
            .lock()
            .labels
            .remove(&(vpn_name.to_string(), *prefix));
        Ok(())
    }

    async fn add_fib_entry(
        &self,
        rd: &str,
        prefix: &Ipv4Prefix,
        next_hop: Ipv4Addr,
        label: Label,
    ) -> Result<(), ServiceError> {
        self.tables
            .lock()
            .fib
            .insert((rd.to_string(), *prefix), InstalledRoute { next_hop, label });
        Ok(())
    }

    async fn remove_fib_entry(&self, rd: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError> {
        self.tables.lock().fib.remove(&(rd.to_string(), *prefix));
        Ok(())
    }

    async fn advertise(
        &self,
        rd: &str,
        prefix: &Ipv4Prefix,
        next_hop: Ipv4Addr,
        label: Label,
    ) -> Result<(), ServiceError> {
        if self.fail_advertise.load(Ordering::SeqCst) {
            return Err(ServiceError::Rpc(format!("advertise {} failed", prefix)));
        }
        self.tables
            .lock()
            .advertised
            .insert((rd.to_string(), *prefix), InstalledRoute { next_hop, label });
        Ok(())
    }

    async fn withdraw(&self, rd: &str, prefix: &Ipv4Prefix) -> Result<(), ServiceError> {
        if self.fail_withdraw.load(Ordering::SeqCst) {
            return Err(ServiceError::Rpc(format!("withdraw {} failed", prefix)));
        }
        self.tables
            .lock()
            .advertised
            .remove(&(rd.to_string(), *prefix));
        Ok(())
    }
}

struct Pool {
    end: u64,
    next: u64,
    by_key: HashMap<String, u32>,
    free: BTreeSet<u32>,
}

/// Named id pools; released ids are reused lowest first.
#[derive(Default)]
pub struct MemoryIdPool {
    pools: Mutex<HashMap<String, Pool>>,
}

impl MemoryIdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self, pool: &str, key: &str) -> Option<u32> {
        self.pools
            .lock()
            .get(pool)
            .and_then(|p| p.by_key.get(key).copied())
    }

    pub fn allocated_count(&self, pool: &str) -> usize {
        self.pools
            .lock()
            .get(pool)
            .map(|p| p.by_key.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl IdPool for MemoryIdPool {
    async fn create_pool(&self, pool: &str, start: u32, end: u32) -> Result<(), ServiceError> {
        self.pools.lock().entry(pool.to_string()).or_insert(Pool {
            end: u64::from(end),
            next: u64::from(start),
            by_key: HashMap::new(),
            free: BTreeSet::new(),
        });
        Ok(())
    }

    async fn allocate_unique_id(&self, pool: &str, key: &str) -> Result<u32, ServiceError> {
        let mut pools = self.pools.lock();
        let state = pools
            .get_mut(pool)
            .ok_or_else(|| ServiceError::NotFound(format!("id pool {}", pool)))?;
        if let Some(id) = state.by_key.get(key) {
            return Ok(*id);
        }
        let id = match state.free.pop_first() {
            Some(id) => id,
            None if state.next <= state.end => {
                let id = state.next as u32;
                state.next += 1;
                id
            }
            None => return Err(ServiceError::PoolExhausted(pool.to_string())),
        };
        state.by_key.insert(key.to_string(), id);
        Ok(id)
    }

    async fn release_unique_id(&self, pool: &str, key: &str) -> Result<(), ServiceError> {
        let mut pools = self.pools.lock();
        if let Some(state) = pools.get_mut(pool) {
            if let Some(id) = state.by_key.remove(key) {
                state.free.insert(id);
            }
        }
        Ok(())
    }
}

/// Switches are up unless marked down.
#[derive(Default)]
pub struct MemoryLiveness {
    down: RwLock<HashSet<SwitchId>>,
}

impl MemoryLiveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, switch: SwitchId) {
        self.down.write().insert(switch);
    }

    pub fn set_up(&self, switch: SwitchId) {
        self.down.write().remove(&switch);
    }
}

impl SwitchLiveness for MemoryLiveness {
    fn is_switch_up(&self, switch: SwitchId) -> bool {
        !self.down.read().contains(&switch)
    }
}

#[derive(Default)]
struct TopologyTables {
    candidates: HashMap<RouterId, BTreeSet<SwitchId>>,
    networks: HashMap<NetworkId, ExternalNetwork>,
    subnets: HashMap<SubnetId, ExternalSubnet>,
    endpoints: HashMap<SwitchId, Ipv4Addr>,
}

#[derive(Default)]
pub struct MemoryTopology {
    tables: RwLock<TopologyTables>,
}

impl MemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_candidates(&self, router: &RouterId, switches: impl IntoIterator<Item = SwitchId>) {
        self.tables
            .write()
            .candidates
            .insert(router.clone(), switches.into_iter().collect());
    }

    pub fn add_network(&self, network: ExternalNetwork) {
        self.tables
            .write()
            .networks
            .insert(network.id.clone(), network);
    }

    pub fn add_subnet(&self, subnet: ExternalSubnet) {
        self.tables.write().subnets.insert(subnet.id.clone(), subnet);
    }

    pub fn set_switch_endpoint(&self, switch: SwitchId, endpoint: Ipv4Addr) {
        self.tables.write().endpoints.insert(switch, endpoint);
    }
}

impl TopologyService for MemoryTopology {
    fn candidate_switches(&self, router: &RouterId) -> BTreeSet<SwitchId> {
        self.tables
            .read()
            .candidates
            .get(router)
            .cloned()
            .unwrap_or_default()
    }

    fn external_network(&self, network: &NetworkId) -> Option<ExternalNetwork> {
        self.tables.read().networks.get(network).cloned()
    }

    fn external_subnet(&self, subnet: &SubnetId) -> Option<ExternalSubnet> {
        self.tables.read().subnets.get(subnet).cloned()
    }

    fn switch_endpoint(&self, switch: SwitchId) -> Option<Ipv4Addr> {
        self.tables.read().endpoints.get(&switch).copied()
    }
}

/// Every in-memory collaborator, with typed handles kept for inspection.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub flows: Arc<MemoryFlowProgrammer>,
    pub tunnels: Arc<MemoryTunnelResolver>,
    pub routes: Arc<MemoryRouteService>,
    pub id_pool: Arc<MemoryIdPool>,
    pub liveness: Arc<MemoryLiveness>,
    pub topology: Arc<MemoryTopology>,
    pub store: Arc<MemoryNatStore>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&self) -> NatServices {
        NatServices {
            flows: self.flows.clone(),
            tunnels: self.tunnels.clone(),
            routes: self.routes.clone(),
            id_pool: self.id_pool.clone(),
            liveness: self.liveness.clone(),
            topology: self.topology.clone(),
            store: self.store.clone(),
        }
    }

    /// Marks `switch` down for both liveness and flow programming.
    pub fn switch_down(&self, switch: SwitchId) {
        self.liveness.set_down(switch);
        self.flows.set_reachable(switch, false);
    }

    pub fn switch_up(&self, switch: SwitchId) {
        self.liveness.set_up(switch);
        self.flows.set_reachable(switch, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{tables, Bucket, FlowAction, FlowInstruction};
    use pretty_assertions::assert_eq;

    fn group(switch: u64, id: u32) -> GroupEntry {
        GroupEntry {
            key: GroupKey::new(SwitchId::new(switch), id),
            buckets: vec![Bucket {
                actions: vec![FlowAction::Output("tun0".to_string())],
            }],
        }
    }

    fn group_flow(switch: u64, id: u32) -> FlowEntry {
        FlowEntry::new(FlowKey::new(SwitchId::new(switch), tables::PSNAT_TABLE, "f"), 5)
            .with_instruction(FlowInstruction::ApplyActions(vec![FlowAction::Group(id)]))
    }

    #[tokio::test]
    async fn test_flow_requires_group_on_same_switch() {
        let programmer = MemoryFlowProgrammer::new();
        assert!(programmer.install_flow(&group_flow(1, 7)).await.is_err());

        programmer.install_group(&group(2, 7)).await.unwrap();
        assert!(programmer.install_flow(&group_flow(1, 7)).await.is_err());

        programmer.install_group(&group(1, 7)).await.unwrap();
        programmer.install_flow(&group_flow(1, 7)).await.unwrap();
        assert_eq!(programmer.flow_count(), 1);
    }

    #[tokio::test]
    async fn test_group_removal_blocked_while_referenced() {
        let programmer = MemoryFlowProgrammer::new();
        programmer.install_group(&group(1, 7)).await.unwrap();
        programmer.install_flow(&group_flow(1, 7)).await.unwrap();

        let key = GroupKey::new(SwitchId::new(1), 7);
        assert!(programmer.remove_group(&key).await.is_err());

        programmer.remove_flow(&group_flow(1, 7).key).await.unwrap();
        programmer.remove_group(&key).await.unwrap();
        assert_eq!(programmer.group_count(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_switch_rejects_calls() {
        let programmer = MemoryFlowProgrammer::new();
        programmer.set_reachable(SwitchId::new(1), false);
        assert_eq!(
            programmer.install_group(&group(1, 7)).await,
            Err(ServiceError::SwitchUnreachable(SwitchId::new(1)))
        );
        programmer.set_reachable(SwitchId::new(1), true);
        assert!(programmer.install_group(&group(1, 7)).await.is_ok());
    }

    #[tokio::test]
    async fn test_id_pool_is_idempotent_and_reuses() {
        let pool = MemoryIdPool::new();
        assert!(pool.allocate_unique_id("p", "a").await.is_err());

        pool.create_pool("p", 10, 11).await.unwrap();
        assert_eq!(pool.allocate_unique_id("p", "a").await, Ok(10));
        assert_eq!(pool.allocate_unique_id("p", "a").await, Ok(10));
        assert_eq!(pool.allocate_unique_id("p", "b").await, Ok(11));
        assert_eq!(
            pool.allocate_unique_id("p", "c").await,
            Err(ServiceError::PoolExhausted("p".to_string()))
        );

        pool.release_unique_id("p", "a").await.unwrap();
        assert_eq!(pool.allocate_unique_id("p", "c").await, Ok(10));
    }

    #[tokio::test]
    async fn test_label_generation_is_stable_per_prefix() {
        let routes = MemoryRouteService::new();
        let prefix = Ipv4Prefix::host(Ipv4Addr::new(172, 16, 0, 10));
        let first = routes.generate_label("ext-vpn", &prefix).await.unwrap();
        let again = routes.generate_label("ext-vpn", &prefix).await.unwrap();
        assert_eq!(first, again);

        routes.set_fail_labels(true);
        let other = Ipv4Prefix::host(Ipv4Addr::new(172, 16, 0, 11));
        assert!(routes.generate_label("ext-vpn", &other).await.is_err());
    }

    #[test]
    fn test_tunnel_mesh() {
        let tunnels = MemoryTunnelResolver::new();
        let switches = [SwitchId::new(1), SwitchId::new(2)];
        tunnels.add_mesh(&switches, TunnelType::Vxlan);
        assert_eq!(
            tunnels.resolve_tunnel(switches[0], switches[1], TunnelType::Vxlan),
            Some("tun-vxlan-1-2".to_string())
        );
        assert_eq!(tunnels.resolve_tunnel(switches[0], switches[1], TunnelType::Gre), None);
    }
}
