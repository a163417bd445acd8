//! Resolution of a router's flow context from stored state and topology.

use snat_orch_common::TaskError;
use snat_types::{NetworkId, RouterId, SubnetId};
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::flows::{ExternalIpTarget, RouterFlowContext};
use crate::services::{ExternalNetwork, TopologyService, VpnBinding};
use crate::store::{NatStore, RouterConfig, RouterRecord};

/// Configuration problems; none of them go away on retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("Router {0} not found")]
    RouterNotFound(RouterId),

    #[error("Router {0} has no segment id")]
    NoSegment(RouterId),

    #[error("Router {0} has no external network")]
    MissingExternalNetwork(RouterId),

    #[error("External network {0} not found")]
    UnknownExternalNetwork(NetworkId),

    #[error("External network {0} has no provider type")]
    MissingProviderType(NetworkId),
}

pub type Result<T> = std::result::Result<T, ContextError>;

impl From<ContextError> for TaskError {
    fn from(err: ContextError) -> Self {
        TaskError::invalid_config(err.to_string())
    }
}

/// External IP of a router with the VPN binding it is advertised in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIpBinding {
    pub ip: Ipv4Addr,
    pub vpn: VpnBinding,
}

pub struct ContextResolver {
    store: Arc<dyn NatStore>,
    topology: Arc<dyn TopologyService>,
}

impl ContextResolver {
    pub fn new(store: Arc<dyn NatStore>, topology: Arc<dyn TopologyService>) -> Self {
        Self { store, topology }
    }

    pub fn external_network(&self, config: &RouterConfig) -> Result<ExternalNetwork> {
        let network_id = config
            .network_id
            .as_ref()
            .ok_or_else(|| ContextError::MissingExternalNetwork(config.id.clone()))?;
        let network = self
            .topology
            .external_network(network_id)
            .ok_or_else(|| ContextError::UnknownExternalNetwork(network_id.clone()))?;
        if network.provider.is_none() {
            return Err(ContextError::MissingProviderType(network_id.clone()));
        }
        Ok(network)
    }

    /// A subnet with its own VPN wins over the network-wide VPN.
    pub fn vpn_for_subnet(&self, network: &ExternalNetwork, subnet: &SubnetId) -> VpnBinding {
        self.topology
            .external_subnet(subnet)
            .and_then(|s| s.vpn)
            .unwrap_or_else(|| network.vpn.clone())
    }

    /// VPN bindings of every configured external IP, in configuration order.
    pub fn external_bindings(&self, config: &RouterConfig) -> Result<Vec<ExternalIpBinding>> {
        if config.external_ips.is_empty() {
            return Ok(Vec::new());
        }
        let network = self.external_network(config)?;
        Ok(config
            .external_ips
            .iter()
            .map(|e| ExternalIpBinding {
                ip: e.ip,
                vpn: self.vpn_for_subnet(&network, &e.subnet_id),
            })
            .collect())
    }

    /// Binding of one external IP, `None` if the router does not own it.
    pub fn external_binding(
        &self,
        config: &RouterConfig,
        ip: Ipv4Addr,
    ) -> Result<Option<ExternalIpBinding>> {
        let Some(entry) = config.external_ip(ip) else {
            return Ok(None);
        };
        let network = self.external_network(config)?;
        Ok(Some(ExternalIpBinding {
            ip,
            vpn: self.vpn_for_subnet(&network, &entry.subnet_id),
        }))
    }

    pub fn resolve(&self, router: &RouterId) -> Result<RouterFlowContext> {
        let record = self
            .store
            .router(router)
            .ok_or_else(|| ContextError::RouterNotFound(router.clone()))?;
        self.resolve_record(&record)
    }

    pub fn resolve_record(&self, record: &RouterRecord) -> Result<RouterFlowContext> {
        let segment = record
            .segment
            .ok_or_else(|| ContextError::NoSegment(record.id().clone()))?;
        let external_ips = self
            .external_bindings(&record.config)?
            .into_iter()
            .map(|b| ExternalIpTarget {
                ip: b.ip,
                vpn_id: b.vpn.vpn_id,
            })
            .collect();
        let inbound_vpn = self
            .store
            .vpn_association(record.id())
            .unwrap_or(segment.segment_id);

        Ok(RouterFlowContext {
            router: record.id().clone(),
            segment: segment.segment_id,
            group_id: segment.group_id,
            inbound_vpn,
            external_ips,
            gateway_mac: record.config.gateway_mac,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryTopology;
    use crate::services::{ExternalSubnet, ProviderType};
    use crate::store::{ExternalIpConfig, MemoryNatStore, RouterSegment};
    use pretty_assertions::assert_eq;
    use snat_types::VpnId;

    fn vpn(name: &str, id: u32) -> VpnBinding {
        VpnBinding {
            name: name.to_string(),
            vpn_id: VpnId::new(id),
            route_distinguisher: format!("100:{}", id),
        }
    }

    fn setup() -> (ContextResolver, Arc<MemoryNatStore>, Arc<MemoryTopology>) {
        let store = Arc::new(MemoryNatStore::new());
        let topology = Arc::new(MemoryTopology::new());
        topology.add_network(ExternalNetwork {
            id: "ext-net".into(),
            provider: Some(ProviderType::Flat),
            vpn: vpn("ext-vpn", 500),
        });
        topology.add_subnet(ExternalSubnet {
            id: "sub-own".into(),
            vpn: Some(vpn("sub-vpn", 600)),
        });
        topology.add_subnet(ExternalSubnet {
            id: "sub-plain".into(),
            vpn: None,
        });
        let resolver = ContextResolver::new(store.clone(), topology.clone());
        (resolver, store, topology)
    }

    fn record() -> RouterRecord {
        let mut config = RouterConfig::new("r1");
        config.enable_snat = true;
        config.network_id = Some("ext-net".into());
        config.external_ips = vec![
            ExternalIpConfig {
                ip: Ipv4Addr::new(172, 16, 0, 10),
                subnet_id: "sub-plain".into(),
            },
            ExternalIpConfig {
                ip: Ipv4Addr::new(172, 16, 1, 10),
                subnet_id: "sub-own".into(),
            },
        ];
        let mut record = RouterRecord::new(config);
        record.segment = Some(RouterSegment {
            segment_id: VpnId::new(5000),
            group_id: 300,
        });
        record
    }

    #[test]
    fn test_subnet_vpn_preferred_over_network() {
        let (resolver, store, _) = setup();
        store.put_router(record());
        let ctx = resolver.resolve(&"r1".into()).unwrap();
        assert_eq!(
            ctx.external_ips,
            vec![
                ExternalIpTarget {
                    ip: Ipv4Addr::new(172, 16, 0, 10),
                    vpn_id: VpnId::new(500),
                },
                ExternalIpTarget {
                    ip: Ipv4Addr::new(172, 16, 1, 10),
                    vpn_id: VpnId::new(600),
                },
            ]
        );
        assert_eq!(ctx.inbound_vpn, VpnId::new(5000));
    }

    #[test]
    fn test_vpn_association_sets_inbound_vpn() {
        let (resolver, store, _) = setup();
        store.put_router(record());
        store.set_vpn_association(&"r1".into(), Some(VpnId::new(900)));
        let ctx = resolver.resolve(&"r1".into()).unwrap();
        assert_eq!(ctx.inbound_vpn, VpnId::new(900));
        assert_eq!(ctx.segment, VpnId::new(5000));
    }

    #[test]
    fn test_configuration_errors() {
        let (resolver, store, topology) = setup();
        assert_eq!(
            resolver.resolve(&"r1".into()),
            Err(ContextError::RouterNotFound("r1".into()))
        );

        let mut rec = record();
        rec.segment = None;
        assert_eq!(
            resolver.resolve_record(&rec),
            Err(ContextError::NoSegment("r1".into()))
        );

        let mut rec = record();
        rec.config.network_id = Some("missing".into());
        assert_eq!(
            resolver.resolve_record(&rec),
            Err(ContextError::UnknownExternalNetwork("missing".into()))
        );

        topology.add_network(ExternalNetwork {
            id: "no-provider".into(),
            provider: None,
            vpn: vpn("x", 1),
        });
        let mut rec = record();
        rec.config.network_id = Some("no-provider".into());
        store.put_router(rec.clone());
        let err = resolver.resolve_record(&rec).unwrap_err();
        assert_eq!(err, ContextError::MissingProviderType("no-provider".into()));
        assert!(!TaskError::from(err).to_status().is_retryable());
    }

    #[test]
    fn test_external_binding_of_unknown_ip() {
        let (resolver, _, _) = setup();
        let rec = record();
        assert_eq!(
            resolver
                .external_binding(&rec.config, Ipv4Addr::new(1, 1, 1, 1))
                .unwrap(),
            None
        );
        let binding = resolver
            .external_binding(&rec.config, Ipv4Addr::new(172, 16, 1, 10))
            .unwrap()
            .unwrap();
        assert_eq!(binding.vpn.name, "sub-vpn");
    }
}
