#![allow(clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use ip_network::IpNetwork;
use support::{FakeDevice, TUN_NAME};
use vif::routing::MemoryRoutingTable;
use vif::{OsRoute, Router, RoutingTable as _};

fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

fn default_route() -> OsRoute {
    OsRoute {
        dest: net("0.0.0.0/0"),
        gateway: Some("10.0.0.1".parse().unwrap()),
        interface: "eth0".to_string(),
    }
}

#[tokio::test]
async fn add_then_remove_subnet() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![default_route()]));
    let mut router = Router::new(device.clone(), table);

    router
        .update_routes(&[net("192.0.2.0/24")], &[])
        .await
        .unwrap();

    assert!(device.routes_via_tun("192.0.2.1".parse().unwrap()));

    router.update_routes(&[], &[]).await.unwrap();

    assert!(!device.routes_via_tun("192.0.2.1".parse().unwrap()));
}

#[tokio::test]
async fn update_routes_is_idempotent() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![default_route()]));
    let mut router = Router::new(device.clone(), table);

    let proxied = [net("192.0.2.0/24"), net("198.51.100.0/24")];
    let excluded = [net("192.0.2.4/32")];

    router.update_routes(&proxied, &excluded).await.unwrap();
    let mutations = device.mutations();

    router.update_routes(&proxied, &excluded).await.unwrap();

    assert_eq!(
        device.mutations(),
        mutations,
        "the second identical update must not touch the device"
    );
}

#[tokio::test]
async fn never_proxy_excludes_sub_cidr() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![default_route()]));
    let mut router = Router::new(device.clone(), table.clone());

    router
        .update_routes(&[net("192.0.2.0/24")], &[net("192.0.2.4/32")])
        .await
        .unwrap();

    // The broad subnet goes via the TUN...
    assert!(device.routes_via_tun("192.0.2.1".parse().unwrap()));

    // ...while the excluded address got a more-specific route toward its
    // original next-hop.
    assert!(table.contains(&OsRoute {
        dest: net("192.0.2.4/32"),
        gateway: Some("10.0.0.1".parse().unwrap()),
        interface: "eth0".to_string(),
    }));

    // Dropping the claimed subnet removes the override again.
    router.update_routes(&[], &[net("192.0.2.4/32")]).await.unwrap();

    assert!(!table.contains(&OsRoute {
        dest: net("192.0.2.4/32"),
        gateway: Some("10.0.0.1".parse().unwrap()),
        interface: "eth0".to_string(),
    }));
}

#[tokio::test]
async fn close_removes_everything() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![default_route()]));
    let mut router = Router::new(device.clone(), table.clone());

    router
        .update_routes(&[net("192.0.2.0/24")], &[net("192.0.2.4/32")])
        .await
        .unwrap();

    router.close().await.unwrap();

    assert!(!device.routes_via_tun("192.0.2.1".parse().unwrap()));
    assert_eq!(table.routes().unwrap(), vec![default_route()]);
}

#[tokio::test]
async fn detects_conflicting_routes() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![
        default_route(),
        OsRoute {
            dest: net("192.0.2.0/26"),
            gateway: None,
            interface: "eth1".to_string(),
        },
    ]));
    let router = Router::new(device, table);

    let conflict = router
        .validate_routes(&[net("192.0.2.32/27")], &[])
        .unwrap_err();
    assert_eq!(conflict.subnet, net("192.0.2.32/27"));
    assert_eq!(conflict.existing.dest, net("192.0.2.0/26"));

    // Whitelisting the subnet resolves the conflict.
    router
        .validate_routes(&[net("192.0.2.32/27")], &[net("192.0.2.32/27")])
        .unwrap();
}

#[tokio::test]
async fn defaults_and_own_routes_are_exempt() {
    let _guard = logging::test("debug");

    let (device, _inbound, _outbound) = FakeDevice::new();
    let table = Arc::new(MemoryRoutingTable::new(vec![
        default_route(),
        // OpenVPN-style half-default routes.
        OsRoute {
            dest: net("0.0.0.0/1"),
            gateway: Some("10.8.0.1".parse().unwrap()),
            interface: "tun1".to_string(),
        },
        // A route we own ourselves.
        OsRoute {
            dest: net("192.0.2.0/24"),
            gateway: None,
            interface: TUN_NAME.to_string(),
        },
        // An identical route counts as "already present".
        OsRoute {
            dest: net("198.51.100.0/24"),
            gateway: None,
            interface: "eth1".to_string(),
        },
    ]));
    let router = Router::new(device, table);

    router
        .validate_routes(
            &[net("192.0.2.0/25"), net("198.51.100.0/24")],
            &[],
        )
        .unwrap();
}
