//! In-memory [`NatStore`].

use parking_lot::Mutex;
use snat_orch_common::{HasRefCount, SyncMap, SyncMapError};
use snat_types::{InternalAddress, Label, RouterId, SessionKey, SwitchId, VpnId};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use super::types::{
    EndpointMapping, NaptAssignment, PurgeSummary, RouterRecord, RouterState, SessionEntry,
    StaleCleanup, UsageCounter,
};
use super::{NatStore, Result, StoreError};

type UsageKey = (RouterId, Ipv4Addr);

#[derive(Default)]
struct Tables {
    routers: HashMap<RouterId, RouterRecord>,
    assignments: HashMap<RouterId, Option<SwitchId>>,
    usage: SyncMap<UsageKey, UsageCounter>,
    endpoints: BTreeMap<(RouterId, InternalAddress), EndpointMapping>,
    sessions: BTreeMap<(RouterId, SessionKey), SessionEntry>,
    vpn_associations: HashMap<RouterId, VpnId>,
    stale: BTreeMap<(SwitchId, RouterId), StaleCleanup>,
}

/// Store backed by process memory. A single lock covers all tables, so every
/// method is atomic with respect to every other.
#[derive(Default)]
pub struct MemoryNatStore {
    tables: Mutex<Tables>,
}

impl MemoryNatStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn usage_error(err: SyncMapError, router: &RouterId, ip: Ipv4Addr) -> StoreError {
        match err {
            SyncMapError::KeyNotFound => StoreError::UnknownExternalIp {
                router: router.clone(),
                ip,
            },
            SyncMapError::RefCountUnderflow => StoreError::UsageUnderflow {
                router: router.clone(),
                ip,
            },
        }
    }
}

impl NatStore for MemoryNatStore {
    fn router(&self, id: &RouterId) -> Option<RouterRecord> {
        self.tables.lock().routers.get(id).cloned()
    }

    fn put_router(&self, record: RouterRecord) {
        self.tables
            .lock()
            .routers
            .insert(record.config.id.clone(), record);
    }

    fn set_router_state(&self, id: &RouterId, state: RouterState) -> Result<RouterState> {
        let mut tables = self.tables.lock();
        let record = tables
            .routers
            .get_mut(id)
            .ok_or_else(|| StoreError::RouterNotFound(id.clone()))?;
        Ok(std::mem::replace(&mut record.state, state))
    }

    fn remove_router(&self, id: &RouterId) -> Option<RouterRecord> {
        self.tables.lock().routers.remove(id)
    }

    fn routers(&self) -> Vec<RouterRecord> {
        let tables = self.tables.lock();
        let mut routers: Vec<_> = tables.routers.values().cloned().collect();
        routers.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        routers
    }

    fn assignment(&self, router: &RouterId) -> Option<NaptAssignment> {
        self.tables
            .lock()
            .assignments
            .get(router)
            .map(|switch| NaptAssignment {
                router: router.clone(),
                switch: *switch,
            })
    }

    fn set_assignment(&self, router: &RouterId, switch: Option<SwitchId>) {
        self.tables
            .lock()
            .assignments
            .insert(router.clone(), switch);
    }

    fn remove_assignment(&self, router: &RouterId) -> Option<NaptAssignment> {
        self.tables
            .lock()
            .assignments
            .remove(router)
            .map(|switch| NaptAssignment {
                router: router.clone(),
                switch,
            })
    }

    fn assignments(&self) -> Vec<NaptAssignment> {
        let tables = self.tables.lock();
        let mut all: Vec<_> = tables
            .assignments
            .iter()
            .map(|(router, switch)| NaptAssignment {
                router: router.clone(),
                switch: *switch,
            })
            .collect();
        all.sort_by(|a, b| a.router.cmp(&b.router));
        all
    }

    fn register_external_ip(&self, router: &RouterId, ip: Ipv4Addr) {
        self.tables
            .lock()
            .usage
            .get_or_insert((router.clone(), ip), UsageCounter::new());
    }

    fn unregister_external_ip(&self, router: &RouterId, ip: Ipv4Addr) -> Option<u32> {
        self.tables
            .lock()
            .usage
            .remove(&(router.clone(), ip))
            .map(|c| c.ref_count())
    }

    fn usage(&self, router: &RouterId, ip: Ipv4Addr) -> Option<u32> {
        self.tables.lock().usage.ref_count(&(router.clone(), ip))
    }

    fn increment_least_loaded(
        &self,
        router: &RouterId,
        candidates: &[Ipv4Addr],
    ) -> Result<Ipv4Addr> {
        let mut tables = self.tables.lock();
        let keys: Vec<UsageKey> = candidates
            .iter()
            .map(|ip| (router.clone(), *ip))
            .collect();
        let (_, ip) = tables
            .usage
            .least_referenced(keys.iter())
            .cloned()
            .ok_or_else(|| StoreError::NoExternalIp(router.clone()))?;
        tables
            .usage
            .increment_ref(&(router.clone(), ip))
            .map_err(|e| Self::usage_error(e, router, ip))?;
        Ok(ip)
    }

    fn increment_usage(&self, router: &RouterId, ip: Ipv4Addr) -> Result<u32> {
        self.tables
            .lock()
            .usage
            .increment_ref(&(router.clone(), ip))
            .map_err(|e| Self::usage_error(e, router, ip))
    }

    fn decrement_usage(&self, router: &RouterId, ip: Ipv4Addr) -> Result<u32> {
        self.tables
            .lock()
            .usage
            .decrement_ref(&(router.clone(), ip))
            .map_err(|e| Self::usage_error(e, router, ip))
    }

    fn endpoint(&self, router: &RouterId, internal: &InternalAddress) -> Option<EndpointMapping> {
        self.tables
            .lock()
            .endpoints
            .get(&(router.clone(), *internal))
            .cloned()
    }

    fn put_endpoint(&self, mapping: EndpointMapping) -> Option<EndpointMapping> {
        self.tables
            .lock()
            .endpoints
            .insert((mapping.router.clone(), mapping.internal), mapping)
    }

    fn remove_endpoint(
        &self,
        router: &RouterId,
        internal: &InternalAddress,
    ) -> Option<EndpointMapping> {
        self.tables
            .lock()
            .endpoints
            .remove(&(router.clone(), *internal))
    }

    fn endpoints(&self, router: &RouterId) -> Vec<EndpointMapping> {
        self.tables
            .lock()
            .endpoints
            .values()
            .filter(|m| &m.router == router)
            .cloned()
            .collect()
    }

    fn set_external_ip_label(
        &self,
        router: &RouterId,
        external_ip: Ipv4Addr,
        label: Option<Label>,
    ) -> usize {
        let mut tables = self.tables.lock();
        let mut updated = 0;
        for mapping in tables
            .endpoints
            .values_mut()
            .filter(|m| &m.router == router && m.external_ip == external_ip)
        {
            mapping.label = label;
            updated += 1;
        }
        updated
    }

    fn session(&self, router: &RouterId, key: &SessionKey) -> Option<SessionEntry> {
        self.tables
            .lock()
            .sessions
            .get(&(router.clone(), *key))
            .cloned()
    }

    fn put_session(&self, entry: SessionEntry) -> bool {
        self.tables
            .lock()
            .sessions
            .insert((entry.router.clone(), entry.internal), entry)
            .is_none()
    }

    fn remove_session(&self, router: &RouterId, key: &SessionKey) -> Option<SessionEntry> {
        self.tables
            .lock()
            .sessions
            .remove(&(router.clone(), *key))
    }

    fn sessions(&self, router: &RouterId) -> Vec<SessionEntry> {
        self.tables
            .lock()
            .sessions
            .values()
            .filter(|s| &s.router == router)
            .cloned()
            .collect()
    }

    fn vpn_association(&self, router: &RouterId) -> Option<VpnId> {
        self.tables.lock().vpn_associations.get(router).copied()
    }

    fn set_vpn_association(&self, router: &RouterId, vpn: Option<VpnId>) {
        let mut tables = self.tables.lock();
        match vpn {
            Some(vpn) => {
                tables.vpn_associations.insert(router.clone(), vpn);
            }
            None => {
                tables.vpn_associations.remove(router);
            }
        }
    }

    fn add_stale_cleanup(&self, cleanup: StaleCleanup) {
        let mut tables = self.tables.lock();
        let key = (cleanup.switch, cleanup.router.clone());
        let merged = match tables.stale.remove(&key) {
            Some(pending) => pending.merge(cleanup),
            None => cleanup,
        };
        tables.stale.insert(key, merged);
    }

    fn stale_cleanup(&self, switch: SwitchId, router: &RouterId) -> Option<StaleCleanup> {
        self.tables
            .lock()
            .stale
            .get(&(switch, router.clone()))
            .cloned()
    }

    fn remove_stale_cleanup(&self, switch: SwitchId, router: &RouterId) -> Option<StaleCleanup> {
        self.tables.lock().stale.remove(&(switch, router.clone()))
    }

    fn stale_cleanups(&self, switch: SwitchId) -> Vec<StaleCleanup> {
        self.tables
            .lock()
            .stale
            .values()
            .filter(|c| c.switch == switch)
            .cloned()
            .collect()
    }

    fn purge_router(&self, router: &RouterId) -> PurgeSummary {
        let mut tables = self.tables.lock();
        let assignment = tables.assignments.remove(router).is_some();

        let before = tables.endpoints.len();
        tables.endpoints.retain(|(r, _), _| r != router);
        let endpoints = before - tables.endpoints.len();

        let before = tables.sessions.len();
        tables.sessions.retain(|(r, _), _| r != router);
        let sessions = before - tables.sessions.len();

        let before = tables.usage.len();
        tables.usage.retain(|(r, _), _| r != router);
        let usage_counters = before - tables.usage.len();

        tables.vpn_associations.remove(router);

        PurgeSummary {
            assignment,
            endpoints,
            sessions,
            usage_counters,
        }
    }
}
