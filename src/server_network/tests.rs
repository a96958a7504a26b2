//! Unit tests for standalone network memberships.

use rstest::{fixture, rstest};

use super::*;
use crate::api::{ApiError, ErrorKind};
use crate::test_support::{ApiCall, CallKind, FakeCloud, parse_ip, private_net, provider, server};

fn membership() -> ServerNetworkId {
    ServerNetworkId {
        server: ServerId::new(1),
        network: NetworkId::new(5),
    }
}

fn config(ip: &str, aliases: &[&str]) -> ServerNetworkConfig {
    ServerNetworkConfig {
        ip: Some(parse_ip(ip)),
        alias_ips: aliases.iter().map(|alias| parse_ip(alias)).collect(),
        ..ServerNetworkConfig::new(ServerId::new(1), NetworkId::new(5))
    }
}

/// Server 1 attached to network 5 as 10.0.0.5 with one alias.
#[fixture]
fn cloud() -> FakeCloud {
    let api = FakeCloud::new();
    let mut snapshot = server(1, "web");
    snapshot
        .private_net
        .push(private_net(5, "10.0.0.5", &["10.0.0.50"]));
    api.insert_server(snapshot);
    api.insert_server(server(2, "db"));
    api
}

#[rstest]
#[case::plain("1-5", 1, 5)]
#[case::padded(" 12-340 ", 12, 340)]
fn import_ids_split_on_the_dash(#[case] raw: &str, #[case] server_id: u64, #[case] network: u64) {
    let id = ServerNetworkReconciler::<FakeCloud>::parse_id(raw)
        .unwrap_or_else(|err| panic!("id should parse: {err}"));
    assert_eq!(id.server, ServerId::new(server_id));
    assert_eq!(id.network, NetworkId::new(network));
}

#[rstest]
#[case::no_dash("15")]
#[case::not_numeric("web-net")]
#[case::trailing_dash("1-")]
fn malformed_import_ids_are_rejected(#[case] raw: &str) {
    let err = ServerNetworkReconciler::<FakeCloud>::parse_id(raw).expect_err("id must fail");
    assert!(matches!(err, ReconcileError::InvalidImportId { .. }));
}

#[test]
fn id_renders_server_then_network() {
    assert_eq!(membership().to_string(), "1-5");
}

#[rstest]
#[tokio::test]
async fn create_attaches_and_reports_the_address(cloud: FakeCloud) {
    let desired = ServerNetworkConfig::new(ServerId::new(2), NetworkId::new(5));
    let created = provider(&cloud)
        .server_networks()
        .create(&desired)
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(created.server_id, ServerId::new(2));
    assert_eq!(created.network_id, NetworkId::new(5));
    assert!(!created.mac_address.is_empty());
}

#[rstest]
#[tokio::test]
async fn create_retries_when_the_subnet_is_busy(cloud: FakeCloud) {
    cloud.fail_next(
        CallKind::AttachToNetwork,
        ApiError::new("conflict", "network is being modified"),
    );
    let desired = ServerNetworkConfig::new(ServerId::new(2), NetworkId::new(5));
    provider(&cloud)
        .server_networks()
        .create(&desired)
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(cloud.count(CallKind::AttachToNetwork), 2);
}

#[rstest]
#[tokio::test]
async fn read_reports_gone_membership_as_none(cloud: FakeCloud) {
    let networks = provider(&cloud).server_networks();
    let missing_network = ServerNetworkId {
        network: NetworkId::new(6),
        ..membership()
    };
    let missing_server = ServerNetworkId {
        server: ServerId::new(9),
        ..membership()
    };

    for id in [missing_network, missing_server] {
        let state = networks
            .read(id)
            .await
            .unwrap_or_else(|err| panic!("read should succeed: {err}"));
        assert_eq!(state, None, "membership {id}");
    }
}

#[rstest]
#[tokio::test]
async fn alias_change_is_applied_in_place(cloud: FakeCloud) {
    cloud.clear_calls();
    let updated = provider(&cloud)
        .server_networks()
        .update(membership(), &config("10.0.0.5", &["10.0.0.51"]))
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(
        updated.alias_ips.into_iter().collect::<Vec<_>>(),
        vec![parse_ip("10.0.0.51")]
    );
    assert_eq!(cloud.count(CallKind::ChangeAliasIps), 1);
    assert_eq!(cloud.count(CallKind::DetachFromNetwork), 0);
}

#[rstest]
#[tokio::test]
async fn ip_change_detaches_then_attaches(cloud: FakeCloud) {
    cloud.clear_calls();
    let updated = provider(&cloud)
        .server_networks()
        .update(membership(), &config("10.0.0.9", &["10.0.0.50"]))
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(updated.ip, parse_ip("10.0.0.9"));
    assert_eq!(
        cloud.mutations(),
        vec![
            ApiCall::DetachFromNetwork {
                server: ServerId::new(1),
                network: NetworkId::new(5),
            },
            ApiCall::AttachToNetwork {
                server: ServerId::new(1),
                network: NetworkId::new(5),
                ip: Some(parse_ip("10.0.0.9")),
                alias_ips: vec![parse_ip("10.0.0.50")],
            },
        ]
    );
}

#[rstest]
#[tokio::test]
async fn unchanged_membership_makes_no_calls(cloud: FakeCloud) {
    cloud.clear_calls();
    provider(&cloud)
        .server_networks()
        .update(membership(), &config("10.0.0.5", &["10.0.0.50"]))
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test]
async fn membership_cannot_move_to_another_server(cloud: FakeCloud) {
    let moved = ServerNetworkConfig {
        server_id: ServerId::new(2),
        ..config("10.0.0.5", &[])
    };
    let err = provider(&cloud)
        .server_networks()
        .update(membership(), &moved)
        .await
        .expect_err("move must be rejected");

    assert!(matches!(err, ReconcileError::InvalidConfig { .. }));
}

#[rstest]
#[tokio::test]
async fn delete_tolerates_missing_server_and_membership(cloud: FakeCloud) {
    let networks = provider(&cloud).server_networks();
    networks
        .delete(membership())
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    assert!(cloud
        .server(ServerId::new(1))
        .is_some_and(|stored| stored.private_net.is_empty()));

    for id in [
        membership(),
        ServerNetworkId {
            server: ServerId::new(9),
            ..membership()
        },
    ] {
        networks
            .delete(id)
            .await
            .unwrap_or_else(|err| panic!("repeated delete of {id} should succeed: {err}"));
    }
}

#[rstest]
#[tokio::test]
async fn delete_surfaces_other_failures(cloud: FakeCloud) {
    cloud.fail_next(
        CallKind::DetachFromNetwork,
        ApiError::of_kind(ErrorKind::InvalidInput, "network is protected"),
    );
    let err = provider(&cloud)
        .server_networks()
        .delete(membership())
        .await
        .expect_err("delete must fail");

    assert!(err.is(ErrorKind::InvalidInput));
}
