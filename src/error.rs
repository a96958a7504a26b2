//! Crate-wide reconciliation errors and their diagnostic form.

use std::fmt;

use thiserror::Error;

use crate::action::ActionError;
use crate::api::{ApiError, ErrorKind};
use crate::retry::AttemptError;

/// Errors raised while reconciling a resource.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ReconcileError {
    /// The desired configuration is rejected before any remote call.
    #[error("invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// Offending configuration attribute.
        field: String,
        /// Human-readable reason.
        message: String,
    },
    /// An import identifier could not be parsed.
    #[error("invalid import id {id:?}: {message}")]
    InvalidImportId {
        /// Identifier as supplied.
        id: String,
        /// Expected format.
        message: String,
    },
    /// A remote call failed.
    #[error("{operation} failed: {source}")]
    Api {
        /// Operation that issued the call.
        operation: &'static str,
        /// Error returned by the API client.
        #[source]
        source: ApiError,
    },
    /// A remote action ended in error or could not be awaited.
    #[error("{operation} failed: {source}")]
    Action {
        /// Operation that triggered the action.
        operation: &'static str,
        /// Failure reported by the waiter.
        #[source]
        source: Box<ActionError>,
    },
    /// A resource vanished while it was being reconciled.
    #[error("{resource} {id} no longer exists")]
    Gone {
        /// Resource type.
        resource: &'static str,
        /// Resource identifier.
        id: String,
    },
}

impl ReconcileError {
    /// Builds an [`ReconcileError::InvalidConfig`].
    #[must_use]
    pub fn invalid_config(field: &str, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.to_owned(),
            message: message.into(),
        }
    }

    /// Annotates an API failure with the operation that produced it.
    #[must_use]
    pub const fn api(operation: &'static str, source: ApiError) -> Self {
        Self::Api { operation, source }
    }

    /// Annotates an action failure with the operation that triggered it.
    #[must_use]
    pub fn action(operation: &'static str, source: ActionError) -> Self {
        Self::Action {
            operation,
            source: Box::new(source),
        }
    }

    /// Builds a [`ReconcileError::Gone`].
    #[must_use]
    pub fn gone(resource: &'static str, id: impl fmt::Display) -> Self {
        Self::Gone {
            resource,
            id: id.to_string(),
        }
    }

    /// Classifies the underlying remote failure, if any.
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Api { source, .. } => Some(source.kind),
            Self::Action { source, .. } => source.kind(),
            Self::Gone { .. } => Some(ErrorKind::NotFound),
            Self::InvalidConfig { .. } | Self::InvalidImportId { .. } => None,
        }
    }

    /// Returns whether the underlying failure has the given kind.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == Some(kind)
    }

    /// Converts the error into a retry decision: transient kinds are retried
    /// and everything else aborts.
    #[must_use]
    pub fn into_attempt(self) -> AttemptError<Self> {
        if self.kind().is_some_and(ErrorKind::is_transient) {
            AttemptError::Transient(self)
        } else {
            AttemptError::Abort(self)
        }
    }

    /// Converts the error into diagnostics for the orchestrator.
    ///
    /// Aggregated action failures yield one diagnostic each.
    #[must_use]
    pub fn to_diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Action { operation, source } if matches!(**source, ActionError::Multiple(_)) => {
                source
                    .failures()
                    .into_iter()
                    .map(|failure| {
                        Diagnostic::error(format!("{operation} failed"), failure.to_string())
                    })
                    .collect()
            }
            Self::Api { operation, source } => vec![Diagnostic::error(
                format!("{operation} failed"),
                source.to_string(),
            )],
            Self::Action { operation, source } => vec![Diagnostic::error(
                format!("{operation} failed"),
                source.to_string(),
            )],
            Self::InvalidConfig { field, message } => vec![Diagnostic::error(
                format!("invalid configuration for {field}"),
                message.clone(),
            )],
            Self::InvalidImportId { .. } | Self::Gone { .. } => {
                vec![Diagnostic::error(self.to_string(), String::new())]
            }
        }
    }
}

/// Severity of a [`Diagnostic`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// The operation failed.
    Error,
    /// The operation succeeded with a caveat.
    Warning,
}

/// User-facing report of a reconciliation problem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Diagnostic {
    /// Severity of the report.
    pub severity: Severity,
    /// One-line summary.
    pub summary: String,
    /// Additional detail, possibly empty.
    pub detail: String,
}

impl Diagnostic {
    /// Builds an error diagnostic.
    #[must_use]
    pub const fn error(summary: String, detail: String) -> Self {
        Self {
            severity: Severity::Error,
            summary,
            detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::types::ActionId;

    fn failed(id: u64, code: &str) -> ActionError {
        ActionError::Failed {
            id: ActionId::new(id),
            command: String::from("attach_to_network"),
            resources: String::from("server 1"),
            code: code.to_owned(),
            message: String::from("boom"),
        }
    }

    #[rstest]
    #[case("conflict", false)]
    #[case("locked", false)]
    #[case("service_error", false)]
    #[case("rate_limit_exceeded", false)]
    #[case("no_subnet_available", false)]
    #[case("not_found", true)]
    #[case("invalid_input", true)]
    #[case("forbidden", true)]
    fn api_errors_classify_for_retry(#[case] code: &str, #[case] aborts: bool) {
        let err = ReconcileError::api("attach server to network", ApiError::new(code, "boom"));
        assert_eq!(err.into_attempt().is_abort(), aborts);
    }

    #[test]
    fn invalid_config_always_aborts() {
        let err = ReconcileError::invalid_config("public_net", "ipv4 id set while disabled");
        assert!(err.kind().is_none());
        assert!(err.into_attempt().is_abort());
    }

    #[test]
    fn operation_name_prefixes_the_message() {
        let err = ReconcileError::api("power off server", ApiError::new("locked", "busy"));
        assert_eq!(err.to_string(), "power off server failed: busy (locked)");
    }

    #[test]
    fn aggregated_action_failures_expand_into_diagnostics() {
        let err = ReconcileError::action(
            "attach server to networks",
            ActionError::Multiple(vec![failed(1, "conflict"), failed(2, "locked")]),
        );

        let diagnostics = err.to_diagnostics();

        assert_eq!(diagnostics.len(), 2);
        assert!(diagnostics.iter().all(|diag| diag.severity == Severity::Error));
        assert!(
            diagnostics
                .iter()
                .all(|diag| diag.summary == "attach server to networks failed")
        );
        assert!(diagnostics.first().is_some_and(|diag| diag.detail.contains("action 1")));
    }

    #[test]
    fn action_kind_is_taken_from_the_failure_code() {
        let err = ReconcileError::action("attach volume", failed(3, "locked"));
        assert!(err.is(ErrorKind::Locked));
        assert!(!err.into_attempt().is_abort());
    }
}
