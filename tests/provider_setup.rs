//! Provider construction and error reporting at the orchestrator boundary.

use std::time::Duration;

use cloud_reconciler::action::ActionStatus;
use cloud_reconciler::test_support::{FakeCloud, action, server};
use cloud_reconciler::types::ServerId;
use cloud_reconciler::{
    ActionWaiter, ConfigError, Provider, ReconcileError, ReconcilerConfig, Resource, Severity,
};
use rstest::{fixture, rstest};

fn fast() -> ReconcilerConfig {
    ReconcilerConfig {
        retry_max_attempts: 2,
        retry_initial_delay_ms: 1,
        retry_max_delay_ms: 5,
        action_poll_interval_ms: 1,
        action_timeout_secs: 5,
    }
}

#[fixture]
fn config() -> ReconcilerConfig {
    fast()
}

#[rstest]
#[tokio::test]
async fn provider_uses_configured_policies(config: ReconcilerConfig) {
    let api = FakeCloud::new();
    api.insert_server(server(4, "app"));
    let provider = Provider::new(api.clone(), &config)
        .unwrap_or_else(|err| panic!("config should be accepted: {err}"));

    let state = provider
        .servers()
        .read(ServerId::new(4))
        .await
        .unwrap_or_else(|err| panic!("read should succeed: {err}"));
    assert_eq!(state.map(|stored| stored.name), Some(String::from("app")));
}

#[rstest]
#[case::no_attempts(ReconcilerConfig { retry_max_attempts: 0, ..fast() }, "retry_max_attempts")]
#[case::inverted_delays(ReconcilerConfig { retry_max_delay_ms: 0, ..fast() }, "retry_max_delay_ms")]
#[case::busy_polling(ReconcilerConfig { action_poll_interval_ms: 0, ..fast() }, "action_poll_interval_ms")]
fn provider_rejects_invalid_config(#[case] invalid: ReconcilerConfig, #[case] field: &str) {
    let err = Provider::new(FakeCloud::new(), &invalid).expect_err("config must be rejected");
    assert_eq!(
        err,
        ConfigError::Invalid {
            field: field.to_owned()
        }
    );
}

#[tokio::test]
async fn aggregated_action_failures_become_one_diagnostic_each() {
    let api = FakeCloud::new();
    let actions = [
        action(1, "attach_volume", ActionStatus::Error),
        action(2, "attach_to_network", ActionStatus::Error),
        action(3, "start_server", ActionStatus::Success),
    ];
    let waiter = ActionWaiter::new(Duration::ZERO, Duration::from_secs(1));
    let err = waiter
        .wait_for_all(&api, &actions)
        .await
        .expect_err("two actions failed");

    let diagnostics = ReconcileError::action("create server", err).to_diagnostics();
    assert_eq!(diagnostics.len(), 2);
    assert!(
        diagnostics
            .iter()
            .all(|diag| diag.severity == Severity::Error && diag.summary == "create server failed")
    );
}

#[tokio::test]
async fn gone_resources_are_reported_by_import() {
    let provider = cloud_reconciler::test_support::provider(&FakeCloud::new());
    let err = provider
        .volumes()
        .import("404")
        .await
        .expect_err("volume does not exist");

    assert!(matches!(err, ReconcileError::Gone { resource: "volume", .. }));
    assert_eq!(err.to_diagnostics().len(), 1);
}
