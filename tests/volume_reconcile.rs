//! Volume and attachment lifecycles against the in-memory cloud.

use cloud_reconciler::test_support::{ApiCall, FakeCloud, provider, server, volume};
use cloud_reconciler::types::{ServerId, VolumeId};
use cloud_reconciler::{Resource, VolumeAttachmentConfig, VolumeConfig};
use rstest::{fixture, rstest};

/// Three servers; volume 7 starts on server 1, volume 8 is detached.
#[fixture]
fn cloud() -> FakeCloud {
    let api = FakeCloud::new();
    for id in 1..=3 {
        api.insert_server(server(id, &format!("node-{id}")));
    }
    api.insert_volume(volume(7, "data", Some(1)));
    api.insert_volume(volume(8, "scratch", None));
    api
}

/// Asserts that no attach of `id` is issued while the volume is still
/// attached to a server, replaying the recorded mutations.
fn assert_never_attached_twice(calls: &[ApiCall], id: VolumeId, initially_attached: bool) {
    let mut attached = initially_attached;
    for call in calls {
        match call {
            ApiCall::DetachVolume(detached) if *detached == id => attached = false,
            ApiCall::AttachVolume { volume, .. } if *volume == id => {
                assert!(!attached, "attach of {id} without a preceding detach: {calls:?}");
                attached = true;
            }
            _ => {}
        }
    }
}

#[rstest]
#[case::attached_moves(7, true, Some(2))]
#[case::attached_moves_again(7, true, Some(3))]
#[case::attached_detaches(7, true, None)]
#[case::attached_stays(7, true, Some(1))]
#[case::detached_attaches(8, false, Some(2))]
#[case::detached_stays(8, false, None)]
#[tokio::test]
async fn volume_updates_detach_before_attaching(
    cloud: FakeCloud,
    #[case] raw_id: u64,
    #[case] initially_attached: bool,
    #[case] target: Option<u64>,
) {
    let id = VolumeId::new(raw_id);
    let current = cloud
        .volume(id)
        .unwrap_or_else(|| panic!("volume {id} should exist"));
    let config = VolumeConfig {
        name: current.name.clone(),
        size_gb: current.size_gb,
        location: None,
        server_id: target.map(ServerId::new),
        automount: false,
        format: None,
        labels: current.labels.clone(),
        delete_protection: false,
    };
    cloud.clear_calls();

    let updated = provider(&cloud)
        .volumes()
        .update(id, &config)
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(updated.server, target.map(ServerId::new));
    assert_never_attached_twice(&cloud.mutations(), id, initially_attached);
}

#[rstest]
#[tokio::test]
async fn attachment_resource_detaches_before_attaching(cloud: FakeCloud) {
    let attachments = provider(&cloud).volume_attachments();
    cloud.clear_calls();
    for target in [2, 3, 1] {
        let config = VolumeAttachmentConfig {
            volume_id: VolumeId::new(7),
            server_id: ServerId::new(target),
            automount: true,
        };
        attachments
            .update(VolumeId::new(7), &config)
            .await
            .unwrap_or_else(|err| panic!("move to {target} should succeed: {err}"));
    }

    assert_never_attached_twice(&cloud.mutations(), VolumeId::new(7), true);
    assert_eq!(
        cloud.server(ServerId::new(1)).map(|stored| stored.volumes),
        Some(vec![VolumeId::new(7)])
    );
}

#[rstest]
#[tokio::test]
async fn full_volume_lifecycle(cloud: FakeCloud) {
    let volumes = provider(&cloud).volumes();
    let created = volumes
        .create(&VolumeConfig::attached("logs", 20, ServerId::new(3)))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));
    assert_eq!(created.server, Some(ServerId::new(3)));

    let grown = VolumeConfig {
        size_gb: 50,
        server_id: Some(ServerId::new(2)),
        ..VolumeConfig::attached("logs", 20, ServerId::new(3))
    };
    let updated = volumes
        .update(created.id, &grown)
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));
    assert_eq!(updated.size_gb, 50);
    assert_eq!(updated.server, Some(ServerId::new(2)));

    volumes
        .delete(created.id)
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    assert!(cloud.volume(created.id).is_none());
    assert!(
        cloud
            .server(ServerId::new(2))
            .is_some_and(|stored| stored.volumes.is_empty())
    );
}
