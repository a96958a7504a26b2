//! Unit tests for standalone volume attachments.

use rstest::{fixture, rstest};

use super::*;
use crate::api::{ApiError, ErrorKind};
use crate::test_support::{ApiCall, CallKind, FakeCloud, provider, server, volume};

const ATTACHED: u64 = 7;
const LOOSE: u64 = 8;

fn attachment(volume_id: u64, server_id: u64) -> VolumeAttachmentConfig {
    VolumeAttachmentConfig {
        volume_id: VolumeId::new(volume_id),
        server_id: ServerId::new(server_id),
        automount: false,
    }
}

/// Servers 1 and 2, volume 7 on server 1 and detached volume 8.
#[fixture]
fn cloud() -> FakeCloud {
    let api = FakeCloud::new();
    api.insert_server(server(1, "web-1"));
    api.insert_server(server(2, "web-2"));
    api.insert_volume(volume(ATTACHED, "data", Some(1)));
    api.insert_volume(volume(LOOSE, "scratch", None));
    api
}

#[rstest]
#[tokio::test]
async fn attaches_a_detached_volume(cloud: FakeCloud) {
    cloud.clear_calls();
    let created = provider(&cloud)
        .volume_attachments()
        .create(&attachment(LOOSE, 2))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(created.server_id, ServerId::new(2));
    assert!(created.linux_device.ends_with("_8"));
    assert_eq!(
        cloud.mutations(),
        vec![ApiCall::AttachVolume {
            volume: VolumeId::new(LOOSE),
            server: ServerId::new(2),
        }]
    );
}

#[rstest]
#[tokio::test]
async fn volume_attached_elsewhere_is_detached_first(cloud: FakeCloud) {
    cloud.clear_calls();
    provider(&cloud)
        .volume_attachments()
        .create(&attachment(ATTACHED, 2))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(
        cloud.mutations(),
        vec![
            ApiCall::DetachVolume(VolumeId::new(ATTACHED)),
            ApiCall::AttachVolume {
                volume: VolumeId::new(ATTACHED),
                server: ServerId::new(2),
            },
        ]
    );
}

#[rstest]
#[tokio::test]
async fn existing_attachment_is_left_alone(cloud: FakeCloud) {
    cloud.clear_calls();
    provider(&cloud)
        .volume_attachments()
        .create(&attachment(ATTACHED, 1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert!(cloud.mutations().is_empty());
}

#[rstest]
#[tokio::test]
async fn transient_attach_failures_are_retried(cloud: FakeCloud) {
    cloud.fail_next(
        CallKind::AttachVolume,
        ApiError::new("locked", "server is locked"),
    );
    provider(&cloud)
        .volume_attachments()
        .create(&attachment(LOOSE, 1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(cloud.count(CallKind::AttachVolume), 2);
}

#[rstest]
#[tokio::test]
async fn failed_attach_action_is_retried(cloud: FakeCloud) {
    cloud.fail_next_action(CallKind::AttachVolume, "locked", "server is locked");
    let attached = provider(&cloud)
        .volume_attachments()
        .create(&attachment(LOOSE, 1))
        .await
        .unwrap_or_else(|err| panic!("create should succeed: {err}"));

    assert_eq!(attached.server_id, ServerId::new(1));
    assert_eq!(cloud.count(CallKind::AttachVolume), 2);
}

#[rstest]
#[tokio::test]
async fn read_of_detached_volume_is_none(cloud: FakeCloud) {
    let attachments = provider(&cloud).volume_attachments();
    for id in [LOOSE, 99] {
        let state = attachments
            .read(VolumeId::new(id))
            .await
            .unwrap_or_else(|err| panic!("read should succeed: {err}"));
        assert_eq!(state, None, "volume {id}");
    }
}

#[rstest]
#[tokio::test]
async fn update_moves_the_attachment(cloud: FakeCloud) {
    let moved = provider(&cloud)
        .volume_attachments()
        .update(VolumeId::new(ATTACHED), &attachment(ATTACHED, 2))
        .await
        .unwrap_or_else(|err| panic!("update should succeed: {err}"));

    assert_eq!(moved.server_id, ServerId::new(2));
    assert!(cloud
        .server(ServerId::new(1))
        .is_some_and(|stored| stored.volumes.is_empty()));
}

#[rstest]
#[tokio::test]
async fn update_rejects_a_different_volume(cloud: FakeCloud) {
    let err = provider(&cloud)
        .volume_attachments()
        .update(VolumeId::new(ATTACHED), &attachment(LOOSE, 2))
        .await
        .expect_err("volume change must be rejected");

    assert!(matches!(err, ReconcileError::InvalidConfig { .. }));
}

#[rstest]
#[tokio::test]
async fn delete_detaches_and_tolerates_missing_volume(cloud: FakeCloud) {
    let attachments = provider(&cloud).volume_attachments();
    attachments
        .delete(VolumeId::new(ATTACHED))
        .await
        .unwrap_or_else(|err| panic!("delete should succeed: {err}"));
    assert_eq!(
        cloud.volume(VolumeId::new(ATTACHED)).and_then(|stored| stored.server),
        None
    );

    attachments
        .delete(VolumeId::new(99))
        .await
        .unwrap_or_else(|err| panic!("delete of missing volume should succeed: {err}"));
}

#[rstest]
#[tokio::test]
async fn delete_surfaces_other_failures(cloud: FakeCloud) {
    cloud.fail_next(
        CallKind::DetachVolume,
        ApiError::of_kind(ErrorKind::InvalidInput, "volume is busy"),
    );
    let err = provider(&cloud)
        .volume_attachments()
        .delete(VolumeId::new(ATTACHED))
        .await
        .expect_err("delete must fail");

    assert!(err.is(ErrorKind::InvalidInput));
}
