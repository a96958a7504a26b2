//! Waiting for asynchronous remote actions.
//!
//! Mutating calls return an [`Action`] that the provider completes in the
//! background. [`ActionWaiter`] polls until every action is terminal. It never
//! retries the triggering call; that is the job of [`crate::retry`].

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::api::{ApiError, CloudApi, ErrorKind};
use crate::types::ActionId;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

/// Status of a remote action.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// Pending or in progress.
    Running,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Error,
}

/// Failure details reported for an action that ended in error.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionFailure {
    /// Provider error code.
    pub code: String,
    /// Provider error message.
    pub message: String,
}

/// Resource an action operates on.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ActionResource {
    /// Resource identifier.
    pub id: u64,
    /// Resource type (for example `server`).
    #[serde(rename = "type")]
    pub kind: String,
}

impl fmt::Display for ActionResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}

/// In-progress remote state transition.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Action {
    /// Action identifier.
    pub id: ActionId,
    /// Command the action performs (for example `attach_volume`).
    pub command: String,
    /// Current status.
    pub status: ActionStatus,
    /// Progress in percent.
    pub progress: u8,
    /// Resources the action operates on.
    pub resources: Vec<ActionResource>,
    /// Failure details once the action ended in error.
    pub error: Option<ActionFailure>,
}

impl Action {
    /// Returns whether the action reached a terminal status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status != ActionStatus::Running
    }

    fn failure(&self) -> ActionError {
        let (code, message) = self.error.as_ref().map_or_else(
            || (String::from("unknown"), String::from("action failed")),
            |failure| (failure.code.clone(), failure.message.clone()),
        );
        ActionError::Failed {
            id: self.id,
            command: self.command.clone(),
            resources: self
                .resources
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
            code,
            message,
        }
    }
}

/// Errors raised while waiting for actions.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ActionError {
    /// The action ended in error.
    #[error("action {id} ({command}) on [{resources}] failed: {message} ({code})")]
    Failed {
        /// Action identifier.
        id: ActionId,
        /// Command the action performed.
        command: String,
        /// Resources the action operated on.
        resources: String,
        /// Provider error code.
        code: String,
        /// Provider error message.
        message: String,
    },
    /// Several actions of one wait ended in error.
    #[error("{} actions failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ActionError>),
    /// Actions were still running when the wait timed out.
    #[error("timed out waiting for actions {}", join_ids(.pending))]
    Timeout {
        /// Actions that had not finished.
        pending: Vec<ActionId>,
    },
    /// Polling an action failed.
    #[error("failed to poll action {id}: {source}")]
    Poll {
        /// Action identifier.
        id: ActionId,
        /// Error returned by the API client.
        #[source]
        source: ApiError,
    },
}

impl ActionError {
    /// Classifies the failure.
    ///
    /// Aggregated failures only carry a kind when all of them agree.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Failed { code, .. } => Some(ErrorKind::from_code(code)),
            Self::Poll { source, .. } => Some(source.kind),
            Self::Timeout { .. } => None,
            Self::Multiple(errors) => {
                let mut kinds = errors.iter().map(Self::kind);
                let first = kinds.next().flatten()?;
                kinds.all(|kind| kind == Some(first)).then_some(first)
            }
        }
    }

    /// Returns the individual failures of this error.
    #[must_use]
    pub fn failures(&self) -> Vec<&Self> {
        match self {
            Self::Multiple(errors) => errors.iter().flat_map(Self::failures).collect(),
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[ActionError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_ids(ids: &[ActionId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Polls actions until they reach a terminal status.
///
/// Waiting is cancelled by dropping the returned future, so callers impose
/// their own deadline with `tokio::time::timeout` on top of the configured
/// wait timeout.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ActionWaiter {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for ActionWaiter {
    fn default() -> Self {
        Self::new(POLL_INTERVAL, WAIT_TIMEOUT)
    }
}

impl ActionWaiter {
    /// Creates a waiter with the given poll interval and overall timeout.
    #[must_use]
    pub const fn new(poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            poll_interval,
            timeout,
        }
    }

    /// Returns the delay between polls.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the overall timeout of a wait.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Waits for a single action.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError`] when the action fails, cannot be polled, or
    /// does not finish before the timeout.
    pub async fn wait_for<C>(&self, api: &C, action: &Action) -> Result<(), ActionError>
    where
        C: CloudApi + ?Sized,
    {
        self.wait_for_all(api, std::slice::from_ref(action)).await
    }

    /// Waits for every action in `actions`.
    ///
    /// A failed action does not end the wait early: all other actions are
    /// still polled to a terminal status and every failure is reported.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::Failed`] (or [`ActionError::Poll`]) for a single
    /// failure, [`ActionError::Multiple`] when several actions failed, and
    /// [`ActionError::Timeout`] listing the actions still running at the
    /// deadline.
    pub async fn wait_for_all<C>(&self, api: &C, actions: &[Action]) -> Result<(), ActionError>
    where
        C: CloudApi + ?Sized,
    {
        // A timeout too large to represent never expires.
        let deadline = Instant::now().checked_add(self.timeout);
        let mut failures = Vec::new();
        let mut pending = Vec::new();

        for action in actions {
            match action.status {
                ActionStatus::Running => pending.push(action.id),
                ActionStatus::Success => {}
                ActionStatus::Error => failures.push(action.failure()),
            }
        }

        while !pending.is_empty() {
            if deadline.is_some_and(|limit| Instant::now() >= limit) {
                failures.push(ActionError::Timeout { pending });
                break;
            }
            sleep(self.poll_interval).await;

            let mut still_running = Vec::with_capacity(pending.len());
            for id in pending {
                let action = match api.get_action(id).await {
                    Ok(action) => action,
                    Err(source) => {
                        warn!(action_id = %id, error = %source, "failed to poll action");
                        failures.push(ActionError::Poll { id, source });
                        continue;
                    }
                };
                match action.status {
                    ActionStatus::Running => {
                        debug!(
                            action_id = %id,
                            command = %action.command,
                            progress = action.progress,
                            "action running"
                        );
                        still_running.push(id);
                    }
                    ActionStatus::Success => {
                        debug!(action_id = %id, command = %action.command, "action finished");
                    }
                    ActionStatus::Error => {
                        let failure = action.failure();
                        warn!(action_id = %id, error = %failure, "action failed");
                        failures.push(failure);
                    }
                }
            }
            pending = still_running;
        }

        collapse(failures)
    }
}

fn collapse(mut failures: Vec<ActionError>) -> Result<(), ActionError> {
    match failures.pop() {
        None => Ok(()),
        Some(only) if failures.is_empty() => Err(only),
        Some(last) => {
            failures.push(last);
            Err(ActionError::Multiple(failures))
        }
    }
}
