//! Collaborator backends.
//!
//! Only the in-memory backend ships here; it drives the test suite and the
//! standalone simulation mode of the daemon, seeded from a topology file.

pub mod memory;

pub use memory::{
    InstalledRoute, MemoryBackend, MemoryFlowProgrammer, MemoryIdPool, MemoryLiveness,
    MemoryRouteService, MemoryTopology, MemoryTunnelResolver,
};

use serde::Deserialize;
use snat_types::{RouterId, SwitchId};
use std::net::Ipv4Addr;
use std::path::Path;

use crate::services::{ExternalNetwork, ExternalSubnet, TunnelType};

#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    #[error("Failed to read topology file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse topology file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwitchSeed {
    pub id: SwitchId,
    pub endpoint: Ipv4Addr,
    #[serde(default)]
    pub down: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RouterSeed {
    pub id: RouterId,
    pub candidates: Vec<SwitchId>,
}

fn default_tunnel_types() -> Vec<TunnelType> {
    vec![TunnelType::Vxlan]
}

/// Static topology for the simulation backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TopologySeed {
    #[serde(default)]
    pub switches: Vec<SwitchSeed>,
    /// Tunnel types meshed between every pair of switches.
    #[serde(default = "default_tunnel_types")]
    pub tunnel_types: Vec<TunnelType>,
    #[serde(default)]
    pub routers: Vec<RouterSeed>,
    #[serde(default)]
    pub networks: Vec<ExternalNetwork>,
    #[serde(default)]
    pub subnets: Vec<ExternalSubnet>,
}

impl TopologySeed {
    pub fn load(path: &Path) -> Result<Self, SeedError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl MemoryBackend {
    /// Builds a backend populated from `seed`.
    pub fn from_seed(seed: &TopologySeed) -> Self {
        let backend = MemoryBackend::new();
        let switches: Vec<SwitchId> = seed.switches.iter().map(|s| s.id).collect();
        for switch in &seed.switches {
            backend.topology.set_switch_endpoint(switch.id, switch.endpoint);
            if switch.down {
                backend.switch_down(switch.id);
            }
        }
        for kind in &seed.tunnel_types {
            backend.tunnels.add_mesh(&switches, *kind);
        }
        for router in &seed.routers {
            backend
                .topology
                .set_candidates(&router.id, router.candidates.iter().copied());
        }
        for network in &seed.networks {
            backend.topology.add_network(network.clone());
        }
        for subnet in &seed.subnets {
            backend.topology.add_subnet(subnet.clone());
        }
        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{SwitchLiveness, TopologyService, TunnelResolver};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_seed_populates_backend() {
        let json = r#"{
            "switches": [
                {"id": 1, "endpoint": "192.168.0.1"},
                {"id": 2, "endpoint": "192.168.0.2", "down": true}
            ],
            "routers": [{"id": "r1", "candidates": [1, 2]}],
            "networks": [{
                "id": "ext-net",
                "provider": "flat",
                "vpn": {"name": "ext-vpn", "vpn_id": 500, "route_distinguisher": "100:1"}
            }]
        }"#;
        let seed: TopologySeed = serde_json::from_str(json).unwrap();
        let backend = MemoryBackend::from_seed(&seed);

        let s1 = SwitchId::new(1);
        let s2 = SwitchId::new(2);
        assert_eq!(
            backend.topology.switch_endpoint(s1),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
        assert!(backend.liveness.is_switch_up(s1));
        assert!(!backend.liveness.is_switch_up(s2));
        assert_eq!(
            backend.topology.candidate_switches(&RouterId::new("r1")).len(),
            2
        );
        assert!(backend
            .tunnels
            .resolve_tunnel(s1, s2, TunnelType::Vxlan)
            .is_some());
        assert!(backend
            .topology
            .external_network(&"ext-net".into())
            .is_some());
    }
}
