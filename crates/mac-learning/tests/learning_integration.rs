//! End-to-end tests for the learning service
//!
//! Every test runs the full worker set (partitions, dependency tracker and
//! Mac-IP table) against the in-memory simulation, with tokio time paused
//! so aging and gate rechecks advance instantly.

use mac_learning::oper_db::{
    BridgeRoute, BridgeRouteKey, NextHop, PbbConfig, RouteOrigin, VrfEntry,
};
use mac_learning::sim::{ForwardingOp, SimEnvironment};
use mac_learning::{
    LearningConfig, LearningKey, LearningStats, MacIpKey, MacLearningService, PacketTrap,
    SnapshotQuery, TokenPoolKind,
};
use pretty_assertions::assert_eq;
use std::future::Future;
use std::net::IpAddr;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use vrouter_types::{InterfaceId, MacAddress, VrfId};

const VRF_NAME: &str = "default-domain:admin:vn1:vn1";
const WAIT: Duration = Duration::from_secs(30);
const POLL: Duration = Duration::from_millis(10);

fn mac(s: &str) -> MacAddress {
    s.parse().expect("valid MAC")
}

fn ip(s: &str) -> IpAddr {
    s.parse().expect("valid IP")
}

/// VRF 1 with VN 1 and two VM ports.
fn topology() -> SimEnvironment {
    let env = SimEnvironment::new();
    env.add_vrf(1, VRF_NAME);
    env.add_vn(1, "default-domain:admin:vn1");
    env.add_vm_interface(1, "tap1", 1, 1);
    env.add_vm_interface(2, "tap2", 1, 1);
    env
}

fn start(env: &SimEnvironment, config: LearningConfig) -> MacLearningService {
    MacLearningService::spawn(config, env.ctx()).expect("service starts")
}

fn small_config() -> LearningConfig {
    LearningConfig::default()
        .with_partitions(4)
        .with_tokens(64, 64, 64)
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !check().await {
            sleep(POLL).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

async fn stats(service: &MacLearningService) -> LearningStats {
    service.proto().stats().await.expect("stats reply")
}

fn route_key(mac: MacAddress) -> BridgeRouteKey {
    BridgeRouteKey::new(VRF_NAME, mac, None)
}

fn routed_interface(env: &SimEnvironment, mac: MacAddress) -> Option<InterfaceId> {
    env.oper_db()
        .route(&route_key(mac))
        .and_then(|route| match route.nexthop {
            NextHop::Interface { interface, .. } => Some(interface),
            _ => None,
        })
}

/// Every token leased by the workers has been returned.
fn pools_idle(service: &MacLearningService) -> bool {
    let pools = service.proto().token_pools();
    [TokenPoolKind::Add, TokenPoolKind::Resync, TokenPoolKind::Delete]
        .into_iter()
        .all(|kind| pools.get(kind).outstanding() == 0)
}

fn withdrawals(env: &SimEnvironment, key: &BridgeRouteKey) -> usize {
    env.forwarding()
        .ops()
        .iter()
        .filter(|op| matches!(op, ForwardingOp::DeleteRoute(k) if k == key))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_learned_mac_removed_with_interface() {
    let env = topology();
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
        .unwrap();
    eventually("route on tap1", || async {
        routed_interface(&env, smac) == Some(InterfaceId(1))
    })
    .await;

    let page = service
        .proto()
        .snapshot(SnapshotQuery::vrf(VrfId(1)))
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].key, LearningKey::new(VrfId(1), smac));
    assert_eq!(page.entries[0].kind, "local");

    assert!(env.oper_db().remove_interface(InterfaceId(1)));
    eventually("route withdrawn", || async {
        env.oper_db().route(&route_key(smac)).is_none()
    })
    .await;
    eventually("entry released", || async { stats(&service).await.total_entries() == 0 }).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mac_move_repoints_without_withdrawal() {
    let env = topology();
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
        .unwrap();
    eventually("route on tap1", || async {
        routed_interface(&env, smac) == Some(InterfaceId(1))
    })
    .await;

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(2), VrfId(1), smac))
        .unwrap();
    eventually("route on tap2", || async {
        routed_interface(&env, smac) == Some(InterfaceId(2))
    })
    .await;

    assert_eq!(withdrawals(&env, &route_key(smac)), 0);
    let page = service
        .proto()
        .snapshot(SnapshotQuery::vrf(VrfId(1)))
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].interface, InterfaceId(2));
    assert!(!page.entries[0].deleted);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_idle_mac_ages_out() {
    let env = topology();
    env.set_vrf_aging(1, 1);
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    let learned_at = tokio::time::Instant::now();
    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
        .unwrap();
    eventually("route installed", || async {
        env.oper_db().route(&route_key(smac)).is_some()
    })
    .await;

    eventually("route aged out", || async {
        env.oper_db().route(&route_key(smac)).is_none()
    })
    .await;
    assert!(learned_at.elapsed() >= Duration::from_secs(1));

    let stats = stats(&service).await;
    assert_eq!(stats.partitions.iter().map(|p| p.aged).sum::<u64>(), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_active_mac_is_not_aged() {
    let env = topology();
    env.set_vrf_aging(1, 1);
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
        .unwrap();
    eventually("route installed", || async {
        env.oper_db().route(&route_key(smac)).is_some()
    })
    .await;

    for _ in 0..10 {
        env.counters().bump(VrfId(1), smac, 5);
        sleep(Duration::from_millis(500)).await;
    }
    assert!(env.oper_db().route(&route_key(smac)).is_some());

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mac_ip_binding_and_unreachable() {
    let env = topology();
    env.set_vn_mac_ip_learning(1, true);
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");
    let addr = ip("1.1.1.3");
    let host = "1.1.1.3/32".parse().unwrap();
    let evpn_key = BridgeRouteKey::new(VRF_NAME, smac, Some(addr));

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac).with_src_ip(addr))
        .unwrap();
    eventually("mac-ip routes", || async {
        env.oper_db().route(&evpn_key).is_some() && env.forwarding().has_host_route(VRF_NAME, host)
    })
    .await;

    service
        .mac_ip_handle()
        .entry_unreachable(VrfId(1), addr, smac)
        .unwrap();
    eventually("mac-ip routes withdrawn", || async {
        env.oper_db().route(&evpn_key).is_none() && !env.forwarding().has_host_route(VRF_NAME, host)
    })
    .await;

    eventually("mac-ip entry released", || async {
        stats(&service).await.mac_ip.entries == 0
    })
    .await;
    assert_eq!(stats(&service).await.mac_ip.unreachable, 1);
    eventually("tokens returned", || async { pools_idle(&service) }).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_ip_moves_to_new_mac() {
    let env = topology();
    env.set_vn_mac_ip_learning(1, true);
    let service = start(&env, small_config());
    let addr = ip("1.1.1.3");
    let old_mac = mac("00:00:00:11:22:33");
    let new_mac = mac("00:00:00:44:55:66");

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), old_mac).with_src_ip(addr))
        .unwrap();
    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(2), VrfId(1), new_mac).with_src_ip(addr))
        .unwrap();

    eventually("new binding", || async {
        env.oper_db()
            .route(&BridgeRouteKey::new(VRF_NAME, new_mac, Some(addr)))
            .is_some()
    })
    .await;
    assert!(env
        .oper_db()
        .route(&BridgeRouteKey::new(VRF_NAME, old_mac, Some(addr)))
        .is_none());

    let page = service
        .proto()
        .mac_ip_snapshot(SnapshotQuery::default())
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].key, MacIpKey::new(VrfId(1), addr));
    assert_eq!(page.entries[0].mac, new_mac);
    assert_eq!(stats(&service).await.mac_ip.moves, 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_entry_per_key_under_churn() {
    let env = topology();
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    for n in 0..20 {
        let port = InterfaceId(1 + n % 2);
        service
            .proto()
            .enqueue(PacketTrap::new(port, VrfId(1), smac))
            .unwrap();
    }
    eventually("final binding on tap2", || async {
        routed_interface(&env, smac) == Some(InterfaceId(2))
    })
    .await;

    let page = service
        .proto()
        .snapshot(SnapshotQuery::default())
        .await
        .unwrap();
    let live: Vec<_> = page.entries.iter().filter(|e| !e.deleted).collect();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].key, LearningKey::new(VrfId(1), smac));

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_tokens_return_after_flush() {
    let env = topology();
    let config = small_config();
    let service = start(&env, config.clone());

    for n in 0..50u8 {
        let smac = MacAddress::new([0x02, 0, 0, 0, 0, n]);
        service
            .proto()
            .enqueue(PacketTrap::new(InterfaceId(1 + u32::from(n % 2)), VrfId(1), smac))
            .unwrap();
    }
    eventually("all learned", || async { stats(&service).await.total_entries() == 50 }).await;

    service.proto().flush_vrf(VrfId(1)).unwrap();
    eventually("all released", || async { stats(&service).await.total_entries() == 0 }).await;

    let pools = service.proto().token_pools();
    eventually("tokens returned", || async {
        pools.get(TokenPoolKind::Add).available() == config.add_tokens
            && pools.get(TokenPoolKind::Delete).available() == config.delete_tokens
    })
    .await;
    assert_eq!(pools.get(TokenPoolKind::Resync).available(), config.resync_tokens);
    assert!(env.oper_db().routes().is_empty());

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_add_throttled_by_small_pool() {
    let env = topology();
    let config = LearningConfig::default()
        .with_partitions(2)
        .with_tokens(4, 4, 4);
    let service = start(&env, config);

    for n in 0..40u8 {
        let smac = MacAddress::new([0x02, 0, 0, 0, 1, n]);
        service
            .proto()
            .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
            .unwrap();
    }
    eventually("all learned", || async { stats(&service).await.total_entries() == 40 }).await;

    let stats = stats(&service).await;
    assert_eq!(stats.partitions.iter().map(|p| p.learned).sum::<u64>(), 40);
    assert_eq!(env.oper_db().routes().len(), 40);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delete_withdraws_once() {
    let env = topology();
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
        .unwrap();
    eventually("route installed", || async {
        env.oper_db().route(&route_key(smac)).is_some()
    })
    .await;

    service.proto().flush_interface(InterfaceId(1)).unwrap();
    service.proto().flush_interface(InterfaceId(1)).unwrap();
    service.proto().flush_vrf(VrfId(1)).unwrap();
    eventually("entry released", || async { stats(&service).await.total_entries() == 0 }).await;

    assert_eq!(withdrawals(&env, &route_key(smac)), 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_vrf_delete_withdraws_and_frees_state() {
    let env = topology();
    let service = start(&env, small_config());
    let macs = [mac("00:00:00:00:00:01"), mac("00:00:00:00:00:02")];

    for smac in macs {
        service
            .proto()
            .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac))
            .unwrap();
    }
    eventually("routes installed", || async {
        macs.iter().all(|m| env.oper_db().route(&route_key(*m)).is_some())
    })
    .await;

    assert!(env.oper_db().remove_vrf(VrfId(1)));
    eventually("routes withdrawn", || async { env.oper_db().routes().is_empty() }).await;
    eventually("database state freed", || async { env.oper_db().tombstone_count() == 0 }).await;
    // Withdrawals are acknowledged even though the VRF name no longer
    // resolves, so every entry drains and every token comes back.
    eventually("entries released", || async { stats(&service).await.total_entries() == 0 }).await;
    eventually("tokens returned", || async { pools_idle(&service) }).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_snapshot_pages_in_key_order() {
    let env = topology();
    env.add_vrf(2, "default-domain:admin:vn2:vn2");
    env.add_vm_interface(3, "tap3", 2, 1);
    let service = start(&env, small_config());

    for n in 0..12u8 {
        let smac = MacAddress::new([0x02, 0, 0, 0, 0, n]);
        let (port, vrf) = if n % 3 == 0 {
            (InterfaceId(3), VrfId(2))
        } else {
            (InterfaceId(1), VrfId(1))
        };
        service
            .proto()
            .enqueue(PacketTrap::new(port, vrf, smac))
            .unwrap();
    }
    eventually("all learned", || async { stats(&service).await.total_entries() == 12 }).await;

    let mut keys = Vec::new();
    let mut query = SnapshotQuery::default().with_limit(5);
    loop {
        let page = service.proto().snapshot(query.clone()).await.unwrap();
        keys.extend(page.entries.iter().map(|e| e.key));
        match page.next {
            Some(next) => query = SnapshotQuery::default().with_limit(5).after(next),
            None => break,
        }
    }
    assert_eq!(keys.len(), 12);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys.iter().filter(|k| k.vrf_id == VrfId(2)).count(), 4);

    let vrf2 = service
        .proto()
        .snapshot(SnapshotQuery::vrf(VrfId(2)))
        .await
        .unwrap();
    assert_eq!(vrf2.entries.len(), 4);
    assert_eq!(vrf2.next, None);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mac_ip_binding_ages_out() {
    let env = topology();
    env.set_vn_mac_ip_learning(1, true);
    env.set_vrf_aging(1, 1);
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");
    let addr = ip("1.1.1.3");
    let evpn_key = BridgeRouteKey::new(VRF_NAME, smac, Some(addr));

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac).with_src_ip(addr))
        .unwrap();
    eventually("binding installed", || async {
        env.oper_db().route(&evpn_key).is_some()
    })
    .await;
    eventually("binding aged out", || async {
        env.oper_db().route(&evpn_key).is_none()
    })
    .await;
    eventually("mac-ip entry released", || async {
        stats(&service).await.mac_ip.entries == 0
    })
    .await;
    assert_eq!(stats(&service).await.mac_ip.aged, 1);
    eventually("tokens returned", || async { pools_idle(&service) }).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_mac_ip_learning_throttled_by_small_pool() {
    let env = topology();
    env.set_vn_mac_ip_learning(1, true);
    let config = LearningConfig::default()
        .with_partitions(2)
        .with_tokens(4, 4, 4);
    let service = start(&env, config);

    for n in 1..=20u8 {
        let smac = MacAddress::new([0x02, 0, 0, 0, 2, n]);
        let addr = ip(&format!("1.1.1.{n}"));
        service
            .proto()
            .enqueue(PacketTrap::new(InterfaceId(1), VrfId(1), smac).with_src_ip(addr))
            .unwrap();
    }
    eventually("all bindings learned", || async {
        stats(&service).await.mac_ip.learned == 20
    })
    .await;
    assert_eq!(stats(&service).await.mac_ip.entries, 20);
    eventually("tokens returned", || async { pools_idle(&service) }).await;

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_mac_learned_from_tunnel() {
    let env = topology();
    env.add_fabric_interface(10, "eth0");
    let service = start(&env, small_config());
    let smac = mac("00:00:00:11:22:33");
    let tunnel = |dest: &str, label: u32| NextHop::Tunnel {
        dest: ip(dest),
        label,
    };

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(10), VrfId(1), smac).with_tunnel(ip("10.1.1.2"), 42))
        .unwrap();
    eventually("tunnel route", || async {
        env.oper_db().route(&route_key(smac)).map(|r| r.nexthop) == Some(tunnel("10.1.1.2", 42))
    })
    .await;
    let page = service
        .proto()
        .snapshot(SnapshotQuery::vrf(VrfId(1)))
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].kind, "remote");

    // The remote endpoint moved; the route is repointed in place.
    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(10), VrfId(1), smac).with_tunnel(ip("10.1.1.3"), 43))
        .unwrap();
    eventually("repointed route", || async {
        env.oper_db().route(&route_key(smac)).map(|r| r.nexthop) == Some(tunnel("10.1.1.3", 43))
    })
    .await;
    assert_eq!(withdrawals(&env, &route_key(smac)), 0);

    service.proto().flush_vrf(VrfId(1)).unwrap();
    eventually("entry released", || async { stats(&service).await.total_entries() == 0 }).await;
    eventually("tokens returned", || async { pools_idle(&service) }).await;
    assert!(env.oper_db().route(&route_key(smac)).is_none());

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_pbb_mac_follows_backbone_route() {
    let env = topology();
    env.add_vrf(5, "bvrf");
    let mut ivrf = VrfEntry::new(VrfId(2), "ivrf");
    ivrf.pbb = Some(PbbConfig {
        isid: 100,
        bmac_vrf_name: "bvrf".to_string(),
    });
    env.oper_db().upsert_vrf(ivrf);
    env.add_pbb_interface(20, "pbb0");

    let bmac = mac("00:00:00:aa:bb:cc");
    let backbone = BridgeRouteKey::new("bvrf", bmac, None);
    env.oper_db().upsert_route(BridgeRoute {
        key: backbone.clone(),
        vrf_id: VrfId(5),
        origin: RouteOrigin::Evpn,
        nexthop: NextHop::Tunnel {
            dest: ip("10.0.0.9"),
            label: 9,
        },
        ethernet_tag: 0,
    });
    let service = start(&env, small_config());
    let cmac = mac("00:00:00:11:22:33");
    let ivrf_route = BridgeRouteKey::new("ivrf", cmac, None);

    service
        .proto()
        .enqueue(PacketTrap::new(InterfaceId(20), VrfId(2), cmac).with_pbb(bmac, 100))
        .unwrap();
    eventually("route through the backbone", || async {
        matches!(
            env.oper_db().route(&ivrf_route).map(|r| r.nexthop),
            Some(NextHop::Pbb { bmac: b, isid: 100, .. }) if b == bmac
        )
    })
    .await;
    let page = service
        .proto()
        .snapshot(SnapshotQuery::vrf(VrfId(2)))
        .await
        .unwrap();
    assert_eq!(page.entries.len(), 1);
    assert_eq!(page.entries[0].kind, "pbb");

    // Losing the backbone MAC takes the customer MAC with it.
    assert!(env.oper_db().remove_route(&backbone));
    eventually("customer route withdrawn", || async {
        env.oper_db().route(&ivrf_route).is_none()
    })
    .await;
    eventually("entry released", || async { stats(&service).await.total_entries() == 0 }).await;
    eventually("tokens returned", || async { pools_idle(&service) }).await;

    service.shutdown().await;
}
