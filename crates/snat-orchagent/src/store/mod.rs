//! NAT state repository.
//!
//! All mutable SNAT state (router records, NAPT assignments, endpoint maps,
//! usage counters, sessions, VPN associations and deferred cleanups) lives
//! behind [`NatStore`]. Components hold no state of their own, so a retried
//! job always starts from what the store says.
//!
//! Usage counters are scoped to `(router, external IP)` and only change
//! through the atomic operations `increment_least_loaded`,
//! `increment_usage` and `decrement_usage`.

mod memory;
mod types;

pub use memory::MemoryNatStore;
pub use types::{
    EndpointMapping, ExternalIpConfig, InternalSubnet, NaptAssignment, PurgeSummary,
    RetiringExternalIp, RouterConfig, RouterRecord, RouterSegment, RouterState, SessionEntry,
    StaleCleanup, UsageCounter,
};

use snat_orch_common::TaskError;
use snat_types::{InternalAddress, RouterId, SessionKey, SwitchId, VpnId};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("No usage counter for {ip} on router {router}")]
    UnknownExternalIp { router: RouterId, ip: Ipv4Addr },

    #[error("Usage counter underflow for {ip} on router {router}")]
    UsageUnderflow { router: RouterId, ip: Ipv4Addr },

    #[error("Router {0} has no registered external IP")]
    NoExternalIp(RouterId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UsageUnderflow { .. } => TaskError::internal(err.to_string()),
            _ => TaskError::invalid_config(err.to_string()),
        }
    }
}

/// Repository of SNAT state.
pub trait NatStore: Send + Sync {
    // Routers

    fn router(&self, id: &RouterId) -> Option<RouterRecord>;

    /// Inserts or replaces a router record.
    fn put_router(&self, record: RouterRecord);

    fn set_router_state(&self, id: &RouterId, state: RouterState) -> Result<RouterState>;

    fn remove_router(&self, id: &RouterId) -> Option<RouterRecord>;

    fn routers(&self) -> Vec<RouterRecord>;

    // NAPT assignments

    fn assignment(&self, router: &RouterId) -> Option<NaptAssignment>;

    fn set_assignment(&self, router: &RouterId, switch: Option<SwitchId>);

    fn remove_assignment(&self, router: &RouterId) -> Option<NaptAssignment>;

    fn assignments(&self) -> Vec<NaptAssignment>;

    /// Assigned switch of `router`, `None` when absent or unassigned.
    fn napt_switch(&self, router: &RouterId) -> Option<SwitchId> {
        self.assignment(router).and_then(|a| a.switch)
    }

    // External IP usage

    /// Creates a zero counter for `(router, ip)` unless one exists.
    fn register_external_ip(&self, router: &RouterId, ip: Ipv4Addr);

    /// Deletes the counter, returning its last value.
    fn unregister_external_ip(&self, router: &RouterId, ip: Ipv4Addr) -> Option<u32>;

    fn usage(&self, router: &RouterId, ip: Ipv4Addr) -> Option<u32>;

    /// Picks the registered IP in `candidates` with the lowest count (ties to
    /// the earliest candidate) and increments it in one step.
    fn increment_least_loaded(&self, router: &RouterId, candidates: &[Ipv4Addr])
        -> Result<Ipv4Addr>;

    fn increment_usage(&self, router: &RouterId, ip: Ipv4Addr) -> Result<u32>;

    fn decrement_usage(&self, router: &RouterId, ip: Ipv4Addr) -> Result<u32>;

    // Endpoint map

    fn endpoint(&self, router: &RouterId, internal: &InternalAddress) -> Option<EndpointMapping>;

    /// Inserts or replaces, returning the previous mapping.
    fn put_endpoint(&self, mapping: EndpointMapping) -> Option<EndpointMapping>;

    fn remove_endpoint(
        &self,
        router: &RouterId,
        internal: &InternalAddress,
    ) -> Option<EndpointMapping>;

    fn endpoints(&self, router: &RouterId) -> Vec<EndpointMapping>;

    /// Sets the label on every mapping of `router` onto `external_ip`.
    /// Returns the number of mappings updated.
    fn set_external_ip_label(
        &self,
        router: &RouterId,
        external_ip: Ipv4Addr,
        label: Option<snat_types::Label>,
    ) -> usize;

    // Sessions

    fn session(&self, router: &RouterId, key: &SessionKey) -> Option<SessionEntry>;

    /// Returns false if a session with the same key already existed.
    fn put_session(&self, entry: SessionEntry) -> bool;

    fn remove_session(&self, router: &RouterId, key: &SessionKey) -> Option<SessionEntry>;

    fn sessions(&self, router: &RouterId) -> Vec<SessionEntry>;

    // VPN association

    fn vpn_association(&self, router: &RouterId) -> Option<VpnId>;

    fn set_vpn_association(&self, router: &RouterId, vpn: Option<VpnId>);

    // Router state left on unreachable switches

    /// Records `cleanup`, merging it into a pending one for the same switch
    /// and router.
    fn add_stale_cleanup(&self, cleanup: StaleCleanup);

    fn stale_cleanup(&self, switch: SwitchId, router: &RouterId) -> Option<StaleCleanup>;

    fn remove_stale_cleanup(&self, switch: SwitchId, router: &RouterId) -> Option<StaleCleanup>;

    fn stale_cleanups(&self, switch: SwitchId) -> Vec<StaleCleanup>;

    /// Deletes every assignment, endpoint, session and usage counter of
    /// `router`. The router record itself is left in place, and so are
    /// stale cleanups: their flows are still on the switches.
    fn purge_router(&self, router: &RouterId) -> PurgeSummary;
}
