//! ExternalIpAllocator implementation.

use log::{debug, info, warn};
use snat_orch_common::TaskError;
use snat_types::{InternalAddress, Label, RouterId};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::audit::{AuditCategory, AuditOutcome, AuditRecord};
use crate::audit_log;
use crate::bridge::{BridgeError, RouteBridge};
use crate::context::{ContextError, ContextResolver, ExternalIpBinding};
use crate::services::TopologyService;
use crate::store::{EndpointMapping, NatStore, RouterConfig, RouterRecord, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocatorError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("Router {0} has no external IP configured")]
    NoExternalIp(RouterId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Route(#[from] BridgeError),
}

pub type Result<T> = std::result::Result<T, AllocatorError>;

impl From<AllocatorError> for TaskError {
    fn from(err: AllocatorError) -> Self {
        match err {
            AllocatorError::RouterNotFound(_) | AllocatorError::NoExternalIp(_) => {
                TaskError::invalid_config(err.to_string())
            }
            AllocatorError::Store(e) => e.into(),
            AllocatorError::Context(e) => e.into(),
            AllocatorError::Route(e) => e.into(),
        }
    }
}

/// Result of binding an internal address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub external_ip: Ipv4Addr,
    /// `None` until the external IP has been advertised, which needs an
    /// elected NAPT switch.
    pub label: Option<Label>,
}

pub struct ExternalIpAllocator {
    store: Arc<dyn NatStore>,
    topology: Arc<dyn TopologyService>,
    bridge: Arc<RouteBridge>,
    resolver: Arc<ContextResolver>,
}

impl ExternalIpAllocator {
    pub fn new(
        store: Arc<dyn NatStore>,
        topology: Arc<dyn TopologyService>,
        bridge: Arc<RouteBridge>,
        resolver: Arc<ContextResolver>,
    ) -> Self {
        Self {
            store,
            topology,
            bridge,
            resolver,
        }
    }

    fn record(&self, router: &RouterId) -> Result<RouterRecord> {
        self.store
            .router(router)
            .ok_or_else(|| AllocatorError::RouterNotFound(router.clone()))
    }

    /// Label already held by another mapping of `router` onto `ip`.
    fn existing_label(&self, router: &RouterId, ip: Ipv4Addr) -> Option<Label> {
        self.store
            .endpoints(router)
            .into_iter()
            .filter(|m| m.external_ip == ip)
            .find_map(|m| m.label)
    }

    /// Binds `internal` to the least-loaded external IP of `router`.
    ///
    /// An existing binding is returned unchanged (its advertisement is
    /// retried if it never completed).
    pub async fn allocate(&self, router: &RouterId, internal: InternalAddress) -> Result<Allocation> {
        let record = self.record(router)?;

        if let Some(existing) = self.store.endpoint(router, &internal) {
            let label = match existing.label {
                Some(label) => Some(label),
                None => self.ensure_advertised(&record.config, existing.external_ip).await?,
            };
            return Ok(Allocation {
                external_ip: existing.external_ip,
                label,
            });
        }

        let candidates = record.config.external_ip_list();
        if candidates.is_empty() {
            return Err(AllocatorError::NoExternalIp(router.clone()));
        }
        let external_ip = self.store.increment_least_loaded(router, &candidates)?;
        let label = self.existing_label(router, external_ip);
        self.store.put_endpoint(EndpointMapping {
            router: router.clone(),
            internal,
            external_ip,
            label,
        });

        info!(
            "ExternalIpAllocator: router {} mapped {} to {} (usage {})",
            router,
            internal,
            external_ip,
            self.store.usage(router, external_ip).unwrap_or(0)
        );
        audit_log!(AuditRecord::new(
            AuditCategory::ExternalIpAllocation,
            "ExternalIpAllocator",
            "allocate"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "internal": internal.to_string(),
            "external_ip": external_ip.to_string(),
            "label_reused": label.is_some(),
        })));

        let label = match label {
            Some(label) => Some(label),
            None => self.ensure_advertised(&record.config, external_ip).await?,
        };
        Ok(Allocation { external_ip, label })
    }

    /// Advertises `ip` via the router's NAPT switch. Without an assigned
    /// switch there is no next hop yet; the election advertises later.
    async fn ensure_advertised(&self, config: &RouterConfig, ip: Ipv4Addr) -> Result<Option<Label>> {
        let Some(switch) = self.store.napt_switch(&config.id) else {
            debug!(
                "ExternalIpAllocator: router {} has no NAPT switch, deferring advertisement of {}",
                config.id, ip
            );
            return Ok(None);
        };
        let Some(next_hop) = self.topology.switch_endpoint(switch) else {
            warn!(
                "ExternalIpAllocator: no tunnel endpoint for switch {}, cannot advertise {}",
                switch, ip
            );
            return Ok(None);
        };
        let Some(binding) = self.resolver.external_binding(config, ip)? else {
            return Ok(None);
        };
        let label = self
            .bridge
            .request_and_advertise(&config.id, &binding.vpn, ip, next_hop)
            .await?;
        Ok(Some(label))
    }

    /// Unbinds `internal`. The last release of an external IP withdraws
    /// its route and label first, so a failed withdraw leaves the mapping
    /// for the retry. Releasing an unknown mapping is a no-op.
    pub async fn release(&self, router: &RouterId, internal: &InternalAddress) -> Result<Option<Ipv4Addr>> {
        let Some(mapping) = self.store.endpoint(router, internal) else {
            debug!(
                "ExternalIpAllocator: no mapping for {} on router {}",
                internal, router
            );
            return Ok(None);
        };
        let ip = mapping.external_ip;
        if self.store.usage(router, ip) == Some(1) {
            let record = self.record(router)?;
            if let Some(binding) = self.resolver.external_binding(&record.config, ip)? {
                self.withdraw_external_ip(router, &binding).await?;
            }
        }

        self.store.remove_endpoint(router, internal);
        let remaining = self.store.decrement_usage(router, ip)?;
        info!(
            "ExternalIpAllocator: router {} released {} from {} (usage {})",
            router, internal, ip, remaining
        );
        Ok(Some(ip))
    }

    /// Withdraws `binding.ip` from `binding.vpn` and releases its label,
    /// clearing the label on the router's mappings. Does nothing for an IP
    /// that was never advertised: unlabelled while the router has no NAPT
    /// switch.
    pub async fn withdraw_external_ip(&self, router: &RouterId, binding: &ExternalIpBinding) -> Result<()> {
        let label = self.existing_label(router, binding.ip);
        if label.is_none() && self.store.napt_switch(router).is_none() {
            return Ok(());
        }
        self.bridge
            .withdraw(router, &binding.vpn, binding.ip, label)
            .await?;
        Ok(())
    }

    /// Releases every mapping of `router`.
    pub async fn release_all(&self, router: &RouterId) -> Result<usize> {
        let mappings = self.store.endpoints(router);
        for mapping in &mappings {
            self.release(router, &mapping.internal).await?;
        }
        Ok(mappings.len())
    }

    /// Round-robin of the router's subnets over its external IPs, wrapping
    /// when there are more subnets than IPs. Subnets already mapped keep
    /// their binding.
    pub fn distribute_initial(&self, router: &RouterId) -> Result<Vec<EndpointMapping>> {
        let record = self.record(router)?;
        let ips = record.config.external_ip_list();
        if ips.is_empty() {
            return Err(AllocatorError::NoExternalIp(router.clone()));
        }

        let mut mappings = Vec::with_capacity(record.config.subnets.len());
        for (index, subnet) in record.config.subnets.iter().enumerate() {
            let internal = InternalAddress::from(subnet.prefix);
            if let Some(existing) = self.store.endpoint(router, &internal) {
                mappings.push(existing);
                continue;
            }
            let external_ip = ips[index % ips.len()];
            self.store.increment_usage(router, external_ip)?;
            let mapping = EndpointMapping {
                router: router.clone(),
                internal,
                external_ip,
                label: self.existing_label(router, external_ip),
            };
            self.store.put_endpoint(mapping.clone());
            debug!(
                "ExternalIpAllocator: router {} subnet {} -> {}",
                router, subnet.prefix, external_ip
            );
            mappings.push(mapping);
        }

        audit_log!(AuditRecord::new(
            AuditCategory::ExternalIpAllocation,
            "ExternalIpAllocator",
            "distribute_initial"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "mappings": mappings
                .iter()
                .map(|m| format!("{} -> {}", m.internal, m.external_ip))
                .collect::<Vec<_>>(),
        })));
        Ok(mappings)
    }

    /// Retires an external IP that left the router's configuration.
    ///
    /// The router record must already carry the new configuration; every
    /// internal address bound to `removed.ip` is rebound to the remaining
    /// IPs by least-loaded allocation. The route is withdrawn before any
    /// mapping moves, so the call can be repeated after a failure.
    pub async fn remove_external_ip(
        &self,
        router: &RouterId,
        removed: &ExternalIpBinding,
    ) -> Result<Vec<Allocation>> {
        let ip = removed.ip;
        self.withdraw_external_ip(router, removed).await?;

        let affected: Vec<EndpointMapping> = self
            .store
            .endpoints(router)
            .into_iter()
            .filter(|m| m.external_ip == ip)
            .collect();
        for mapping in &affected {
            self.store.remove_endpoint(router, &mapping.internal);
            self.store.decrement_usage(router, ip)?;
        }
        self.store.unregister_external_ip(router, ip);

        let record = self.record(router)?;
        let mut reallocated = Vec::with_capacity(affected.len());
        if !affected.is_empty() && record.config.external_ips.is_empty() {
            warn!(
                "ExternalIpAllocator: router {} lost its last external IP {}, {} mappings dropped",
                router,
                ip,
                affected.len()
            );
        } else {
            for mapping in &affected {
                reallocated.push(self.allocate(router, mapping.internal).await?);
            }
        }

        info!(
            "ExternalIpAllocator: router {} removed external IP {}, {} mappings moved",
            router,
            ip,
            reallocated.len()
        );
        audit_log!(AuditRecord::new(
            AuditCategory::ExternalIpAllocation,
            "ExternalIpAllocator",
            "remove_external_ip"
        )
        .with_outcome(AuditOutcome::Success)
        .with_object_id(router.to_string())
        .with_object_type("router")
        .with_details(serde_json::json!({
            "external_ip": ip.to_string(),
            "moved_to": reallocated.iter().map(|a| a.external_ip.to_string()).collect::<Vec<_>>(),
        })));
        Ok(reallocated)
    }

    /// Publishes every in-use external IP of `router` via `next_hop`:
    /// labelled IPs are re-advertised, unlabelled ones get a label first.
    /// Returns the number of IPs advertised.
    pub async fn refresh_advertisements(&self, router: &RouterId, next_hop: Ipv4Addr) -> Result<usize> {
        let record = self.record(router)?;
        let endpoints = self.store.endpoints(router);
        let mut advertised = 0;

        for binding in self.resolver.external_bindings(&record.config)? {
            let in_use: Vec<&EndpointMapping> = endpoints
                .iter()
                .filter(|m| m.external_ip == binding.ip)
                .collect();
            if in_use.is_empty() {
                continue;
            }
            match in_use.iter().find_map(|m| m.label) {
                Some(label) => {
                    self.bridge
                        .readvertise(&binding.vpn, binding.ip, label, next_hop)
                        .await?
                }
                None => {
                    self.bridge
                        .request_and_advertise(router, &binding.vpn, binding.ip, next_hop)
                        .await?;
                }
            }
            advertised += 1;
        }
        Ok(advertised)
    }

    /// Withdraws the advertisements of `router` while keeping labels and
    /// mappings, for when no NAPT switch can serve it.
    pub async fn withdraw_advertisements(&self, router: &RouterId, remove_fib: bool) -> Result<usize> {
        let record = self.record(router)?;
        let endpoints = self.store.endpoints(router);
        let mut withdrawn = 0;
        for binding in self.resolver.external_bindings(&record.config)? {
            let labelled = endpoints
                .iter()
                .any(|m| m.external_ip == binding.ip && m.label.is_some());
            if labelled {
                self.bridge
                    .withdraw_route(&binding.vpn, binding.ip, remove_fib)
                    .await?;
                withdrawn += 1;
            }
        }
        Ok(withdrawn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::services::{ExternalNetwork, ProviderType, VpnBinding};
    use crate::store::{ExternalIpConfig, InternalSubnet};
    use pretty_assertions::assert_eq;
    use snat_types::{Ipv4Prefix, SwitchId, VpnId};

    const E1: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);
    const E2: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);
    const D1: SwitchId = SwitchId::new(1);

    fn subnet(id: &str, prefix: &str) -> InternalSubnet {
        InternalSubnet {
            id: id.into(),
            prefix: prefix.parse().unwrap(),
        }
    }

    fn setup(subnets: Vec<InternalSubnet>) -> (ExternalIpAllocator, MemoryBackend, RouterId) {
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

        let mut config = RouterConfig::new("r1");
        config.enable_snat = true;
        config.network_id = Some("ext-net".into());
        config.subnets = subnets;
        config.external_ips = [E1, E2]
            .iter()
            .map(|ip| ExternalIpConfig {
                ip: *ip,
                subnet_id: "ext-sub".into(),
            })
            .collect();
        let router = config.id.clone();
        backend.store.put_router(RouterRecord::new(config));
        backend.store.register_external_ip(&router, E1);
        backend.store.register_external_ip(&router, E2);

        let services = backend.services();
        let bridge = Arc::new(RouteBridge::new(services.routes.clone(), services.store.clone()));
        let resolver = Arc::new(ContextResolver::new(
            services.store.clone(),
            services.topology.clone(),
        ));
        let allocator =
            ExternalIpAllocator::new(services.store, services.topology, bridge, resolver);
        (allocator, backend, router)
    }

    fn host(last: u8) -> InternalAddress {
        InternalAddress::Host(Ipv4Addr::new(10, 0, 0, last))
    }

    #[tokio::test]
    async fn test_allocate_picks_least_loaded_in_order() {
        let (allocator, backend, router) = setup(vec![]);
        assert_eq!(allocator.allocate(&router, host(1)).await.unwrap().external_ip, E1);
        assert_eq!(allocator.allocate(&router, host(2)).await.unwrap().external_ip, E2);
        assert_eq!(allocator.allocate(&router, host(3)).await.unwrap().external_ip, E1);
        assert_eq!(backend.store.usage(&router, E1), Some(2));
        assert_eq!(backend.store.usage(&router, E2), Some(1));
    }

    #[tokio::test]
    async fn test_allocate_is_idempotent() {
        let (allocator, backend, router) = setup(vec![]);
        let first = allocator.allocate(&router, host(1)).await.unwrap();
        let again = allocator.allocate(&router, host(1)).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(backend.store.usage(&router, E1), Some(1));
    }

    #[tokio::test]
    async fn test_allocate_release_round_trip() {
        let (allocator, backend, router) = setup(vec![]);
        allocator.allocate(&router, host(1)).await.unwrap();
        let before = backend.store.usage(&router, E2);

        allocator.allocate(&router, host(2)).await.unwrap();
        assert_eq!(allocator.release(&router, &host(2)).await.unwrap(), Some(E2));
        assert_eq!(backend.store.usage(&router, E2), before);
        assert_eq!(backend.store.endpoint(&router, &host(2)), None);

        assert_eq!(allocator.release(&router, &host(2)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_label_reused_and_withdrawn_on_last_release() {
        let (allocator, backend, router) = setup(vec![]);
        backend.store.set_assignment(&router, Some(D1));

        let a = allocator.allocate(&router, host(1)).await.unwrap();
        allocator.allocate(&router, host(2)).await.unwrap(); // E2
        let c = allocator.allocate(&router, host(3)).await.unwrap(); // E1 again
        assert_eq!(c.external_ip, E1);
        assert_eq!(c.label, a.label);
        assert!(a.label.is_some());
        assert_eq!(backend.routes.advertised_count(), 2);

        let prefix = Ipv4Prefix::host(E1);
        allocator.release(&router, &host(1)).await.unwrap();
        assert!(backend.routes.advertised("100:500", &prefix).is_some());
        allocator.release(&router, &host(3)).await.unwrap();
        assert_eq!(backend.routes.advertised("100:500", &prefix), None);
        assert_eq!(backend.routes.label("ext-vpn", &prefix), None);
    }

    #[tokio::test]
    async fn test_no_advertisement_without_napt_switch() {
        let (allocator, backend, router) = setup(vec![]);
        let allocation = allocator.allocate(&router, host(1)).await.unwrap();
        assert_eq!(allocation.label, None);
        assert_eq!(backend.routes.advertised_count(), 0);

        backend.store.set_assignment(&router, Some(D1));
        let advertised = allocator
            .refresh_advertisements(&router, Ipv4Addr::new(192, 168, 0, 1))
            .await
            .unwrap();
        assert_eq!(advertised, 1);
        assert!(backend.store.endpoint(&router, &host(1)).unwrap().label.is_some());
    }

    #[tokio::test]
    async fn test_initial_distribution_wraps() {
        let (allocator, backend, router) = setup(vec![
            subnet("s1", "10.0.1.0/24"),
            subnet("s2", "10.0.2.0/24"),
            subnet("s3", "10.0.3.0/24"),
        ]);
        let mappings = allocator.distribute_initial(&router).unwrap();
        assert_eq!(
            mappings.iter().map(|m| m.external_ip).collect::<Vec<_>>(),
            vec![E1, E2, E1]
        );
        assert_eq!(backend.store.usage(&router, E1), Some(2));

        // Re-running keeps existing bindings.
        allocator.distribute_initial(&router).unwrap();
        assert_eq!(backend.store.usage(&router, E1), Some(2));
    }

    #[tokio::test]
    async fn test_remove_external_ip_moves_mappings() {
        let (allocator, backend, router) = setup(vec![
            subnet("s1", "10.0.1.0/24"),
            subnet("s2", "10.0.2.0/24"),
        ]);
        backend.store.set_assignment(&router, Some(D1));
        allocator.distribute_initial(&router).unwrap();
        allocator
            .refresh_advertisements(&router, Ipv4Addr::new(192, 168, 0, 1))
            .await
            .unwrap();

        let mut record = backend.store.router(&router).unwrap();
        let removed = ExternalIpBinding {
            ip: E1,
            vpn: allocator
                .resolver
                .external_binding(&record.config, E1)
                .unwrap()
                .unwrap()
                .vpn,
        };
        record.config.external_ips.retain(|e| e.ip != E1);
        backend.store.put_router(record);

        let moved = allocator.remove_external_ip(&router, &removed).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].external_ip, E2);
        assert_eq!(backend.store.usage(&router, E1), None);
        assert_eq!(backend.store.usage(&router, E2), Some(2));
        assert_eq!(
            backend.routes.advertised("100:500", &Ipv4Prefix::host(E1)),
            None
        );
    }

    #[tokio::test]
    async fn test_failed_withdraw_keeps_last_mapping() {
        let (allocator, backend, router) = setup(vec![]);
        backend.store.set_assignment(&router, Some(D1));
        let allocation = allocator.allocate(&router, host(1)).await.unwrap();
        assert!(allocation.label.is_some());

        backend.routes.set_fail_withdraw(true);
        assert!(allocator.release(&router, &host(1)).await.is_err());
        assert!(backend.store.endpoint(&router, &host(1)).is_some());
        assert_eq!(backend.store.usage(&router, E1), Some(1));

        backend.routes.set_fail_withdraw(false);
        assert_eq!(allocator.release(&router, &host(1)).await.unwrap(), Some(E1));
        assert_eq!(
            backend.routes.advertised("100:500", &Ipv4Prefix::host(E1)),
            None
        );
        assert_eq!(backend.store.usage(&router, E1), Some(0));
    }

    #[tokio::test]
    async fn test_allocate_retries_failed_advertisement() {
        let (allocator, backend, router) = setup(vec![]);
        backend.store.set_assignment(&router, Some(D1));
        backend.routes.set_fail_advertise(true);
        assert!(allocator.allocate(&router, host(1)).await.is_err());
        assert_eq!(backend.store.endpoint(&router, &host(1)).unwrap().label, None);

        backend.routes.set_fail_advertise(false);
        let allocation = allocator.allocate(&router, host(1)).await.unwrap();
        assert!(allocation.label.is_some());
        assert!(backend
            .routes
            .advertised("100:500", &Ipv4Prefix::host(E1))
            .is_some());
        assert_eq!(backend.store.usage(&router, E1), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_router() {
        let (allocator, _, _) = setup(vec![]);
        let err = allocator
            .allocate(&"missing".into(), host(1))
            .await
            .unwrap_err();
        assert_eq!(err, AllocatorError::RouterNotFound("missing".into()));
    }
}
