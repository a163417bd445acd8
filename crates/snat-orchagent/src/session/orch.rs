//! NaptSessionManager implementation.

use log::{debug, info, warn};
use snat_orch_common::TaskError;
use snat_types::{ExternalEndpoint, InternalAddress, Ipv4Prefix, RouterId, SessionKey, SwitchId};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::context::{ContextError, ContextResolver};
use crate::flows::{FlowOrch, FlowOrchError, RouterFlowContext};
use crate::services::{IdPool, ServiceError};
use crate::store::{EndpointMapping, NatStore, SessionEntry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Router {0} has no NAPT switch")]
    NoPrimary(RouterId),

    #[error("No external IP mapping covers {ip} on router {router}")]
    NoMapping { router: RouterId, ip: Ipv4Addr },

    #[error("Port pool {pool} failed: {source}")]
    PortPool {
        pool: String,
        #[source]
        source: ServiceError,
    },

    #[error("Allocated port {0} outside the valid range")]
    PortOutOfRange(u32),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Flow(#[from] FlowOrchError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl From<SessionError> for TaskError {
    fn from(err: SessionError) -> Self {
        match err {
            // Punts racing a failover; the next packet comes back.
            SessionError::NoPrimary(_) => TaskError::ignored(err.to_string()),
            SessionError::NoMapping { .. } => TaskError::invalid_config(err.to_string()),
            SessionError::PortPool {
                source: ServiceError::PoolExhausted(_),
                ..
            } => TaskError::aborted(err.to_string()),
            SessionError::PortPool { .. } => TaskError::southbound(err.to_string()),
            SessionError::PortOutOfRange(_) => TaskError::internal(err.to_string()),
            SessionError::Context(e) => e.into(),
            SessionError::Flow(e) => e.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub port_range_start: u16,
    pub port_range_end: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port_range_start: 49152,
            port_range_end: 65535,
        }
    }
}

impl SessionConfig {
    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }
}

/// Selects sessions to purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionFilter {
    All,
    ExternalIp(Ipv4Addr),
    InternalSubnet(Ipv4Prefix),
}

impl SessionFilter {
    fn matches(&self, session: &SessionEntry) -> bool {
        match self {
            SessionFilter::All => true,
            SessionFilter::ExternalIp(ip) => session.external.ip == *ip,
            SessionFilter::InternalSubnet(prefix) => prefix.contains(session.internal.ip),
        }
    }
}

fn port_pool(external_ip: Ipv4Addr) -> String {
    format!("snat-ports.{}", external_ip)
}

pub struct NaptSessionManager {
    config: SessionConfig,
    store: Arc<dyn NatStore>,
    id_pool: Arc<dyn IdPool>,
    flow_orch: Arc<FlowOrch>,
    resolver: Arc<ContextResolver>,
}

impl NaptSessionManager {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn NatStore>,
        id_pool: Arc<dyn IdPool>,
        flow_orch: Arc<FlowOrch>,
        resolver: Arc<ContextResolver>,
    ) -> Self {
        Self {
            config,
            store,
            id_pool,
            flow_orch,
            resolver,
        }
    }

    /// Host mapping first, then the most specific covering subnet.
    fn mapping_for(&self, router: &RouterId, ip: Ipv4Addr) -> Option<EndpointMapping> {
        if let Some(mapping) = self.store.endpoint(router, &InternalAddress::Host(ip)) {
            return Some(mapping);
        }
        self.store
            .endpoints(router)
            .into_iter()
            .filter(|m| m.internal.covers(ip))
            .max_by_key(|m| match m.internal {
                InternalAddress::Host(_) => 32,
                InternalAddress::Subnet(prefix) => prefix.prefix_len(),
            })
    }

    async fn allocate_port(&self, external_ip: Ipv4Addr, key: &SessionKey) -> Result<u16> {
        let pool = port_pool(external_ip);
        let pool_error = |source| SessionError::PortPool {
            pool: pool.clone(),
            source,
        };
        self.id_pool
            .create_pool(
                &pool,
                u32::from(self.config.port_range_start),
                u32::from(self.config.port_range_end),
            )
            .await
            .map_err(pool_error)?;
        let port = self
            .id_pool
            .allocate_unique_id(&pool, &key.to_string())
            .await
            .map_err(pool_error)?;
        u16::try_from(port).map_err(|_| SessionError::PortOutOfRange(port))
    }

    async fn release_port(&self, session: &SessionEntry) -> Result<()> {
        let pool = port_pool(session.external.ip);
        self.id_pool
            .release_unique_id(&pool, &session.internal.to_string())
            .await
            .map_err(|source| SessionError::PortPool { pool, source })
    }

    /// First packet of an internal connection. Re-punts of a known session
    /// reinstall its flows and return the existing translation.
    pub async fn on_packet_in(&self, router: &RouterId, key: SessionKey) -> Result<SessionEntry> {
        let switch = self
            .store
            .napt_switch(router)
            .ok_or_else(|| SessionError::NoPrimary(router.clone()))?;
        let ctx = self.resolver.resolve(router)?;

        if let Some(existing) = self.store.session(router, &key) {
            debug!(
                "NaptSessionManager: session {} of router {} already translated to {}",
                key, router, existing.external
            );
            self.flow_orch.install_session(switch, &ctx, &existing).await?;
            return Ok(existing);
        }

        let mapping = self
            .mapping_for(router, key.ip)
            .ok_or_else(|| SessionError::NoMapping {
                router: router.clone(),
                ip: key.ip,
            })?;
        let port = self.allocate_port(mapping.external_ip, &key).await?;
        let entry = SessionEntry {
            router: router.clone(),
            internal: key,
            external: ExternalEndpoint::new(mapping.external_ip, port),
        };
        self.store.put_session(entry.clone());
        self.flow_orch.install_session(switch, &ctx, &entry).await?;

        info!(
            "NaptSessionManager: router {} translated {} to {} on switch {}",
            router, key, entry.external, switch
        );
        audit_log!(AuditRecord::new(
            AuditCategory::SessionTranslation,
            "NaptSessionManager",
            "create_session"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "internal": key.to_string(),
            "external": entry.external.to_string(),
            "switch": switch.as_u64(),
        })));
        Ok(entry)
    }

    /// Idle timeout of a session. Returns false for unknown sessions.
    pub async fn on_session_expired(&self, router: &RouterId, key: SessionKey) -> Result<bool> {
        let Some(entry) = self.store.session(router, &key) else {
            debug!("NaptSessionManager: expired session {} of router {} unknown", key, router);
            return Ok(false);
        };
        self.remove(&entry, self.store.napt_switch(router)).await?;
        debug!("NaptSessionManager: session {} of router {} expired", key, router);
        Ok(true)
    }

    async fn remove(&self, entry: &SessionEntry, switch: Option<SwitchId>) -> Result<()> {
        if let Some(switch) = switch {
            self.flow_orch.remove_session(switch, entry).await?;
        }
        self.release_port(entry).await?;
        self.store.remove_session(&entry.router, &entry.internal);
        Ok(())
    }

    /// Removes every session of `router` selected by `filter`, flows
    /// included.
    pub async fn purge_sessions(&self, router: &RouterId, filter: SessionFilter) -> Result<usize> {
        self.purge(router, filter, self.store.napt_switch(router)).await
    }

    /// Releases the ports and records of every session of `router`,
    /// leaving flows alone. Used once the primary state was removed or
    /// deferred as a whole.
    pub async fn drop_sessions(&self, router: &RouterId) -> Result<usize> {
        self.purge(router, SessionFilter::All, None).await
    }

    async fn purge(&self, router: &RouterId, filter: SessionFilter, switch: Option<SwitchId>) -> Result<usize> {
        let sessions: Vec<SessionEntry> = self
            .store
            .sessions(router)
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();
        for session in &sessions {
            self.remove(session, switch).await?;
        }
        if !sessions.is_empty() {
            info!(
                "NaptSessionManager: purged {} sessions of router {} ({:?})",
                sessions.len(),
                router,
                filter
            );
        }
        Ok(sessions.len())
    }

    /// Installs every live session of `router` on `switch`.
    pub async fn replay(&self, router: &RouterId, switch: SwitchId, ctx: &RouterFlowContext) -> Result<usize> {
        let sessions = self.store.sessions(router);
        for session in &sessions {
            if let Err(e) = self.flow_orch.install_session(switch, ctx, session).await {
                warn!(
                    "NaptSessionManager: replay of {} for router {} on switch {} failed: {}",
                    session.internal, router, switch, e
                );
                return Err(e.into());
            }
        }
        Ok(sessions.len())
    }
}
