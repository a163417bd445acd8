//! End-to-end SNAT scenarios driven through the daemon and the in-memory
//! backend.

use futures::future::join_all;
use pretty_assertions::assert_eq;
use snat_orch_common::TaskStatus;
use snat_orchagent::backend::MemoryBackend;
use snat_orchagent::flows::builder::{session_forward_key, session_reverse_key};
use snat_orchagent::flows::GroupKey;
use snat_orchagent::services::{ExternalNetwork, ProviderType, TunnelType, VpnBinding};
use snat_orchagent::store::{
    ExternalIpConfig, InternalSubnet, NatStore, RouterConfig, RouterState, SessionEntry,
};
use snat_orchagent::{NatDaemon, NatEvent, SnatOrchConfig};
use snat_types::{
    ExternalEndpoint, InternalAddress, Ipv4Prefix, NatProtocol, RouterId, SessionKey, SwitchId,
    VpnId,
};
use std::net::Ipv4Addr;

const D1: SwitchId = SwitchId::new(1);
const D2: SwitchId = SwitchId::new(2);
const D3: SwitchId = SwitchId::new(3);
const E1: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);
const E2: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);
const E3: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 3);
const RD: &str = "100:500";

fn r1() -> RouterId {
    RouterId::new("r1")
}

fn fabric(switches: &[SwitchId]) -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.topology.add_network(ExternalNetwork {
        id: "ext-net".into(),
        provider: Some(ProviderType::Flat),
        vpn: VpnBinding {
            name: "ext-vpn".to_string(),
            vpn_id: VpnId::new(500),
            route_distinguisher: RD.to_string(),
        },
    });
    for switch in switches {
        backend
            .topology
            .set_switch_endpoint(*switch, Ipv4Addr::new(192, 168, 0, switch.as_u64() as u8));
    }
    backend.tunnels.add_mesh(switches, TunnelType::Vxlan);
    backend
}

fn daemon(backend: &MemoryBackend) -> NatDaemon {
    let mut config = SnatOrchConfig::default();
    config.jobs.retry_backoff_ms = 1;
    config.napt.port_range_start = 5000;
    config.napt.port_range_end = 5999;
    NatDaemon::new(config, backend.services())
}

fn router(id: &str, ips: &[Ipv4Addr], subnets: &[&str]) -> RouterConfig {
    let mut config = RouterConfig::new(id);
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
            id: format!("{}-s{}", id, i + 1).as_str().into(),
            prefix: prefix.parse().unwrap(),
        })
        .collect();
    config
}

async fn apply(daemon: &NatDaemon, event: NatEvent) {
    let outcomes = daemon.process(event).await;
    for outcome in outcomes {
        assert!(outcome.is_success(), "job failed: {:?}", outcome);
    }
}

fn stale_routers(backend: &MemoryBackend, switch: SwitchId) -> Vec<RouterId> {
    backend
        .store
        .stale_cleanups(switch)
        .into_iter()
        .map(|c| c.router)
        .collect()
}

fn disabled(config: RouterConfig) -> RouterConfig {
    RouterConfig {
        enable_snat: false,
        ..config
    }
}

fn subnet(prefix: &str) -> InternalAddress {
    InternalAddress::Subnet(prefix.parse().unwrap())
}

fn mapped_ip(backend: &MemoryBackend, prefix: &str) -> Ipv4Addr {
    backend
        .store
        .endpoint(&r1(), &subnet(prefix))
        .unwrap()
        .external_ip
}

#[tokio::test]
async fn test_round_robin_then_external_ip_removal() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);

    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        },
    )
    .await;

    let primary = backend.store.napt_switch(&r1()).unwrap();
    assert!(primary == D1 || primary == D2);
    assert_eq!(mapped_ip(&backend, "10.0.0.0/24"), E1);
    assert_eq!(mapped_ip(&backend, "10.0.1.0/24"), E2);
    assert!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)).is_some());

    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        },
    )
    .await;

    assert_eq!(mapped_ip(&backend, "10.0.0.0/24"), E2);
    assert_eq!(mapped_ip(&backend, "10.0.1.0/24"), E2);
    assert_eq!(backend.store.usage(&r1(), E1), None);
    assert_eq!(backend.store.usage(&r1(), E2), Some(2));
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)), None);
    assert_eq!(backend.routes.label("ext-vpn", &Ipv4Prefix::host(E1)), None);
    assert!(backend.routes.advertised(RD, &Ipv4Prefix::host(E2)).is_some());
}

#[tokio::test]
async fn test_failover_replays_session_when_old_primary_unreachable() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;
    assert_eq!(backend.store.napt_switch(&r1()), Some(D1));

    let key = SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp);
    apply(
        &daemon,
        NatEvent::PacketIn {
            router: r1(),
            session: key,
        },
    )
    .await;
    let session = backend.store.session(&r1(), &key).unwrap();
    assert_eq!(session.external, ExternalEndpoint::new(E1, 5000));

    backend.switch_down(D1);
    apply(&daemon, NatEvent::SwitchDown { switch: D1 }).await;

    assert_eq!(backend.store.napt_switch(&r1()), Some(D2));
    assert_eq!(
        backend.store.router(&r1()).unwrap().state,
        RouterState::Active
    );
    assert!(backend.flows.flow(&session_forward_key(D2, &session)).is_some());
    assert!(backend.flows.flow(&session_reverse_key(D2, &session)).is_some());
    assert_eq!(backend.store.sessions(&r1()), vec![session.clone()]);
    // D1 could not be cleaned and is remembered for later.
    assert_eq!(stale_routers(&backend, D1), vec![r1()]);
    assert_eq!(
        backend
            .routes
            .advertised(RD, &Ipv4Prefix::host(E1))
            .unwrap()
            .next_hop,
        Ipv4Addr::new(192, 168, 0, 2)
    );

    backend.switch_up(D1);
    apply(&daemon, NatEvent::SwitchUp { switch: D1 }).await;

    assert!(backend.store.stale_cleanups(D1).is_empty());
    assert!(backend.flows.flow(&session_forward_key(D1, &session)).is_none());
    assert_eq!(backend.flows.flows_on(D1).len(), 1);
    let group = backend.flows.groups_on(D1);
    assert_eq!(group.len(), 1);
    assert_eq!(group[0].tunnel_port(), Some("tun-vxlan-1-2"));
}

#[tokio::test]
async fn test_repeated_failover_leaves_no_duplicates() {
    let backend = fabric(&[D1, D2, D3]);
    backend.topology.set_candidates(&r1(), [D1, D2, D3]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;
    apply(
        &daemon,
        NatEvent::PacketIn {
            router: r1(),
            session: SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp),
        },
    )
    .await;

    backend.switch_down(D1);
    apply(&daemon, NatEvent::SwitchDown { switch: D1 }).await;
    let flows = backend.flows.flow_count();
    let groups = backend.flows.group_count();
    let sessions: Vec<SessionEntry> = backend.store.sessions(&r1());

    let report = daemon.ha().migrate(&r1(), Some(D1), D2).await.unwrap();
    assert_eq!(report.sessions_replayed, 1);
    assert_eq!(backend.flows.flow_count(), flows);
    assert_eq!(backend.flows.group_count(), groups);
    assert_eq!(backend.store.sessions(&r1()), sessions);
    assert!(backend
        .flows
        .group(&GroupKey::new(D3, backend.store.router(&r1()).unwrap().segment.unwrap().group_id))
        .is_some());
}

#[tokio::test]
async fn test_router_removal_deletes_scoped_state() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        },
    )
    .await;
    apply(
        &daemon,
        NatEvent::PacketIn {
            router: r1(),
            session: SessionKey::new(Ipv4Addr::new(10, 0, 1, 7), 80, NatProtocol::Udp),
        },
    )
    .await;

    apply(&daemon, NatEvent::RouterRemoved { router: r1() }).await;

    assert_eq!(backend.store.router(&r1()), None);
    assert_eq!(backend.store.assignment(&r1()), None);
    assert!(backend.store.endpoints(&r1()).is_empty());
    assert!(backend.store.sessions(&r1()).is_empty());
    assert_eq!(backend.store.usage(&r1(), E1), None);
    assert_eq!(backend.store.usage(&r1(), E2), None);
    assert_eq!(backend.flows.flow_count(), 0);
    assert_eq!(backend.flows.group_count(), 0);
    assert_eq!(backend.routes.advertised_count(), 0);
    assert_eq!(backend.routes.label_count(), 0);
}

#[tokio::test]
async fn test_last_switch_down_leaves_router_unassigned() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;

    backend.switch_down(D1);
    apply(&daemon, NatEvent::SwitchDown { switch: D1 }).await;
    assert_eq!(backend.store.assignment(&r1()).unwrap().switch, None);
    assert_eq!(
        backend.store.router(&r1()).unwrap().state,
        RouterState::PendingElection
    );
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)), None);

    backend.switch_up(D1);
    apply(&daemon, NatEvent::SwitchUp { switch: D1 }).await;
    assert_eq!(backend.store.napt_switch(&r1()), Some(D1));
    assert!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)).is_some());
}

#[tokio::test]
async fn test_unreachable_new_primary_is_not_retried() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;

    backend.switch_down(D1);
    backend.liveness.set_down(D2);
    let outcomes = daemon.process(NatEvent::SwitchDown { switch: D1 }).await;
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, TaskStatus::Failed);
    assert_eq!(outcomes[0].attempts, 1);
    assert_eq!(backend.store.napt_switch(&r1()), None);
    assert_eq!(
        backend.store.router(&r1()).unwrap().state,
        RouterState::PendingElection
    );
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)), None);
    assert_eq!(stale_routers(&backend, D1), vec![r1()]);
}

#[tokio::test]
async fn test_update_resent_after_unreachable_primary_converges() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        },
    )
    .await;

    backend.flows.set_reachable(D1, false);
    let outcomes = daemon
        .process(NatEvent::RouterChanged {
            router: router("r1", &[E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        })
        .await;
    assert_eq!(outcomes.len(), 1);
    assert!(!outcomes[0].is_success());
    assert_eq!(mapped_ip(&backend, "10.0.0.0/24"), E1);

    backend.flows.set_reachable(D1, true);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E2], &["10.0.0.0/24", "10.0.1.0/24"]),
        },
    )
    .await;

    assert_eq!(mapped_ip(&backend, "10.0.0.0/24"), E2);
    assert_eq!(mapped_ip(&backend, "10.0.1.0/24"), E2);
    assert_eq!(backend.store.usage(&r1(), E1), None);
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)), None);
    assert_eq!(backend.routes.label("ext-vpn", &Ipv4Prefix::host(E1)), None);
    assert!(backend.routes.advertised(RD, &Ipv4Prefix::host(E2)).is_some());
}

#[tokio::test]
async fn test_update_resent_after_advertise_failure_advertises() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;

    let updated = router("r1", &[E1, E2], &["10.0.0.0/24", "10.0.1.0/24"]);
    backend.routes.set_fail_advertise(true);
    let outcomes = daemon
        .process(NatEvent::RouterChanged {
            router: updated.clone(),
        })
        .await;
    assert!(!outcomes[0].is_success());
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E2)), None);
    let pending = backend.store.endpoint(&r1(), &subnet("10.0.1.0/24")).unwrap();
    assert_eq!(pending.external_ip, E2);
    assert_eq!(pending.label, None);

    backend.routes.set_fail_advertise(false);
    apply(&daemon, NatEvent::RouterChanged { router: updated }).await;

    let route = backend.routes.advertised(RD, &Ipv4Prefix::host(E2)).unwrap();
    assert_eq!(route.next_hop, Ipv4Addr::new(192, 168, 0, 1));
    assert_eq!(
        backend
            .store
            .endpoint(&r1(), &subnet("10.0.1.0/24"))
            .unwrap()
            .label,
        Some(route.label)
    );
}

#[tokio::test]
async fn test_disable_with_unreachable_primary_completes() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    let config = router("r1", &[E1], &["10.0.0.0/24"]);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: config.clone(),
        },
    )
    .await;
    assert_eq!(backend.store.napt_switch(&r1()), Some(D1));

    backend.switch_down(D1);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: disabled(config),
        },
    )
    .await;

    assert_eq!(
        backend.store.router(&r1()).unwrap().state,
        RouterState::Disabled
    );
    assert_eq!(backend.store.napt_switch(&r1()), None);
    assert!(backend.store.endpoints(&r1()).is_empty());
    assert_eq!(backend.routes.advertised(RD, &Ipv4Prefix::host(E1)), None);
    assert!(backend.flows.flows_on(D2).is_empty());
    assert_eq!(stale_routers(&backend, D1), vec![r1()]);

    // The disabled router is not re-elected when its old switch fails.
    apply(&daemon, NatEvent::SwitchDown { switch: D1 }).await;
    assert_eq!(backend.store.napt_switch(&r1()), None);
    assert!(backend.flows.flows_on(D2).is_empty());

    backend.switch_up(D1);
    apply(&daemon, NatEvent::SwitchUp { switch: D1 }).await;
    assert_eq!(backend.flows.flow_count(), 0);
    assert!(stale_routers(&backend, D1).is_empty());
    assert_eq!(
        backend.store.router(&r1()).unwrap().state,
        RouterState::Disabled
    );
}

#[tokio::test]
async fn test_removed_router_state_cleaned_when_old_primary_returns() {
    let backend = fabric(&[D1, D2]);
    backend.topology.set_candidates(&r1(), [D1, D2]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1], &["10.0.0.0/24"]),
        },
    )
    .await;
    apply(
        &daemon,
        NatEvent::PacketIn {
            router: r1(),
            session: SessionKey::new(Ipv4Addr::new(10, 0, 0, 5), 4000, NatProtocol::Tcp),
        },
    )
    .await;

    backend.switch_down(D1);
    apply(&daemon, NatEvent::SwitchDown { switch: D1 }).await;
    assert_eq!(backend.store.napt_switch(&r1()), Some(D2));
    apply(&daemon, NatEvent::RouterRemoved { router: r1() }).await;
    assert_eq!(backend.store.router(&r1()), None);
    assert_eq!(stale_routers(&backend, D1), vec![r1()]);

    backend.switch_up(D1);
    apply(&daemon, NatEvent::SwitchUp { switch: D1 }).await;
    assert!(backend.flows.flows_on(D1).is_empty());
    assert!(backend.flows.groups_on(D1).is_empty());
    assert_eq!(backend.flows.flow_count(), 0);
    assert!(stale_routers(&backend, D1).is_empty());
}

#[tokio::test]
async fn test_allocation_is_least_loaded_and_reversible() {
    let backend = fabric(&[D1]);
    backend.topology.set_candidates(&r1(), [D1]);
    let daemon = daemon(&backend);
    apply(
        &daemon,
        NatEvent::RouterChanged {
            router: router("r1", &[E1, E2, E3], &[]),
        },
    )
    .await;

    let allocator = daemon.allocator();
    let host = |last: u8| InternalAddress::Host(Ipv4Addr::new(10, 0, 0, last));
    let mut picked = Vec::new();
    for last in 1..=4 {
        picked.push(allocator.allocate(&r1(), host(last)).await.unwrap().external_ip);
    }
    assert_eq!(picked, vec![E1, E2, E3, E1]);

    assert_eq!(allocator.release(&r1(), &host(2)).await.unwrap(), Some(E2));
    assert_eq!(backend.store.usage(&r1(), E2), Some(0));
    assert_eq!(backend.store.endpoint(&r1(), &host(2)), None);
    assert_eq!(
        allocator.allocate(&r1(), host(5)).await.unwrap().external_ip,
        E2
    );
}

#[tokio::test]
async fn test_routers_converge_concurrently() {
    let switches = [D1, D2, D3];
    let backend = fabric(&switches);
    let daemon = daemon(&backend);
    backend.switch_down(D1);

    let mut receivers = Vec::new();
    for i in 1..=6u8 {
        let id = format!("r{}", i);
        backend
            .topology
            .set_candidates(&RouterId::new(id.as_str()), switches);
        receivers.extend(daemon.dispatch(NatEvent::RouterChanged {
            router: router(&id, &[Ipv4Addr::new(172, 16, i, 1)], &["10.0.0.0/24"]),
        }));
    }
    for outcome in join_all(receivers).await {
        assert!(outcome.unwrap().is_success());
    }

    for i in 1..=6 {
        let id = RouterId::new(format!("r{}", i).as_str());
        let switch = backend.store.napt_switch(&id).unwrap();
        assert_ne!(switch, D1);
        assert_eq!(
            backend.store.router(&id).unwrap().state,
            RouterState::Active
        );
    }
}
