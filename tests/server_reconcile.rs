//! End-to-end server reconciliation against the in-memory cloud.

use cloud_reconciler::api::{AssignedPrimaryIp, ServerStatus};
use cloud_reconciler::test_support::{
    ApiCall, CallKind, FakeCloud, parse_ip, primary_ip, private_net, provider, server,
};
use cloud_reconciler::types::{IpFamily, NetworkId, PrimaryIpId, ServerId};
use cloud_reconciler::{
    ErrorKind, NetworkAttachmentConfig, PublicNetConfig, ReconcileError, Resource, ServerConfig,
};
use rstest::{fixture, rstest};

const SERVER: u64 = 1;

fn server_id() -> ServerId {
    ServerId::new(SERVER)
}

fn member(network: u64, ip: &str) -> NetworkAttachmentConfig {
    NetworkAttachmentConfig::new(NetworkId::new(network)).with_ip(parse_ip(ip))
}

/// Desired state matching the fixture: networks 5 and 9, IPv4 17 only.
fn desired() -> ServerConfig {
    ServerConfig {
        networks: vec![member(5, "10.0.0.5"), member(9, "10.0.1.2")],
        public_net: Some(PublicNetConfig {
            ipv4_enabled: true,
            ipv6_enabled: false,
            ipv4: Some(PrimaryIpId::new(17)),
            ipv6: None,
        }),
        ..ServerConfig::new("web", "cx22", "ubuntu-24.04")
    }
}

/// Running server in networks 5 and 9 holding primary IPv4 17, plus a
/// spare primary IPv4 42.
#[fixture]
fn cloud() -> FakeCloud {
    let api = FakeCloud::new();
    let mut web = server(SERVER, "web");
    web.private_net = vec![
        private_net(5, "10.0.0.5", &[]),
        private_net(9, "10.0.1.2", &[]),
    ];
    web.public_net.ipv4 = Some(AssignedPrimaryIp {
        id: PrimaryIpId::new(17),
        ip: String::from("198.51.100.17"),
    });
    api.insert_server(web);
    api.insert_primary_ip(primary_ip(42, IpFamily::Ipv4, None, false));
    api
}

#[rstest]
#[tokio::test]
async fn matching_state_needs_no_mutation(cloud: FakeCloud) {
    cloud.clear_calls();
    provider(&cloud)
        .servers()
        .update(server_id(), &desired())
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert!(cloud.mutations().is_empty(), "{:?}", cloud.mutations());
}

#[rstest]
#[tokio::test]
async fn dropping_a_network_only_detaches_it(cloud: FakeCloud) {
    cloud.clear_calls();
    let config = ServerConfig {
        networks: vec![member(5, "10.0.0.5")],
        ..desired()
    };
    provider(&cloud)
        .servers()
        .update(server_id(), &config)
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(
        cloud.mutations(),
        vec![ApiCall::DetachFromNetwork {
            server: server_id(),
            network: NetworkId::new(9),
        }]
    );
}

#[rstest]
#[tokio::test]
async fn network_changes_converge_in_one_pass(cloud: FakeCloud) {
    let config = ServerConfig {
        networks: vec![
            member(5, "10.0.0.9").with_alias_ips([parse_ip("10.0.0.90")]),
            member(12, "10.2.0.4"),
        ],
        ..desired()
    };
    let servers = provider(&cloud).servers();
    let updated = servers
        .update(server_id(), &config)
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));
    let networks: Vec<_> = updated
        .private_net
        .iter()
        .map(|net| (net.network_id.get(), net.ip))
        .collect();
    assert_eq!(networks.len(), 2);
    assert!(networks.contains(&(5, parse_ip("10.0.0.9"))));
    assert!(networks.contains(&(12, parse_ip("10.2.0.4"))));

    cloud.clear_calls();
    servers
        .update(server_id(), &config)
        .await
        .unwrap_or_else(|err| panic!("second update should succeed: {err}"));
    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test]
async fn swapping_the_primary_ip_power_cycles_the_server(cloud: FakeCloud) {
    cloud.clear_calls();
    let config = ServerConfig {
        public_net: Some(PublicNetConfig {
            ipv4: Some(PrimaryIpId::new(42)),
            ..desired().public_net()
        }),
        ..desired()
    };
    let updated = provider(&cloud)
        .servers()
        .update(server_id(), &config)
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(
        cloud.mutations(),
        vec![
            ApiCall::PowerOff(server_id()),
            ApiCall::UnassignPrimaryIp(PrimaryIpId::new(17)),
            ApiCall::AssignPrimaryIp {
                primary_ip: PrimaryIpId::new(42),
                server: server_id(),
            },
            ApiCall::PowerOn(server_id()),
        ]
    );
    assert_eq!(updated.status, ServerStatus::Running);
    assert_eq!(
        updated.public_net.ipv4.map(|assigned| assigned.id),
        Some(PrimaryIpId::new(42))
    );
    assert!(cloud.primary_ip(PrimaryIpId::new(17)).is_some());
}

#[rstest]
#[tokio::test]
async fn fatal_assignment_failure_leaves_server_running(cloud: FakeCloud) {
    cloud.fail_next_action(CallKind::AssignPrimaryIp, "ip_unavailable", "ip is reserved");
    let config = ServerConfig {
        public_net: Some(PublicNetConfig {
            ipv4: Some(PrimaryIpId::new(42)),
            ..desired().public_net()
        }),
        ..desired()
    };
    let err = provider(&cloud)
        .servers()
        .update(server_id(), &config)
        .await
        .expect_err("assignment failure must surface");

    assert!(matches!(
        err,
        ReconcileError::Action {
            operation: "assign primary ip",
            ..
        }
    ));
    assert_eq!(cloud.count(CallKind::PowerOn), 1);
    assert_eq!(
        cloud.server(server_id()).map(|stored| stored.status),
        Some(ServerStatus::Running)
    );
}

#[rstest]
#[tokio::test]
async fn disabled_family_with_explicit_ip_fails_before_power_off(cloud: FakeCloud) {
    cloud.clear_calls();
    let config = ServerConfig {
        public_net: Some(PublicNetConfig {
            ipv4_enabled: false,
            ipv4: Some(PrimaryIpId::new(42)),
            ..desired().public_net()
        }),
        ..desired()
    };
    let err = provider(&cloud)
        .servers()
        .update(server_id(), &config)
        .await
        .expect_err("config must be rejected");

    assert!(matches!(err, ReconcileError::InvalidConfig { .. }));
    assert_eq!(cloud.count(CallKind::PowerOff), 0);
    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_then_delete_round_trip(cloud: FakeCloud) {
    let servers = provider(&cloud).servers();
    let config = ServerConfig {
        networks: vec![member(5, "10.0.0.20")],
        ..ServerConfig::new("worker", "cx32", "debian-12")
    };
    let created = servers
        .create(&config)
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    assert_eq!(created.status, ServerStatus::Running);
    assert!(created.private_net_for(NetworkId::new(5)).is_some());

    servers
        .delete(created.id)
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    let state = servers
        .read(created.id)
        .await
        .unwrap_or_else(|err| panic!("read should succeed: {err}"));
    assert_eq!(state, None);

    servers
        .delete(created.id)
        .await
        .unwrap_or_else(|err| panic!("repeated delete should succeed: {err}"));
}

#[rstest]
#[tokio::test]
async fn exhausted_retries_report_the_last_error(cloud: FakeCloud) {
    for _ in 0..3 {
        cloud.fail_next(
            CallKind::DetachFromNetwork,
            cloud_reconciler::ApiError::new("locked", "server is locked"),
        );
    }
    let config = ServerConfig {
        networks: vec![member(5, "10.0.0.5")],
        ..desired()
    };
    let err = provider(&cloud)
        .servers()
        .update(server_id(), &config)
        .await
        .expect_err("retries must run out");

    assert!(err.is(ErrorKind::Locked));
    assert_eq!(cloud.count(CallKind::DetachFromNetwork), 3);
    let diagnostics = err.to_diagnostics();
    assert_eq!(diagnostics.len(), 1);
    assert!(
        diagnostics
            .first()
            .is_some_and(|diag| diag.summary.contains("detach server from network"))
    );
}
