//! Error classification for calls made through the remote API client.

use std::fmt;

use serde::Deserialize;
use thiserror::Error;

/// Closed classification of remote API failures.
///
/// Adapters map the provider's error codes onto this enumeration once, so the
/// retry controller and the reconcilers never inspect raw codes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// Another operation conflicts with this one.
    Conflict,
    /// The resource is locked by an in-flight action.
    Locked,
    /// The provider reported an internal failure.
    ServiceError,
    /// The addressed resource does not exist.
    NotFound,
    /// No free IP is left in the requested subnet.
    NoSubnetAvailable,
    /// The server is already attached to the network.
    ServerAlreadyAttached,
    /// The request rate limit was exceeded.
    RateLimited,
    /// The request was rejected as malformed.
    InvalidInput,
    /// Any other failure.
    Other,
}

impl ErrorKind {
    /// Maps a provider error code onto a kind.
    #[must_use]
    pub fn from_code(code: &str) -> Self {
        match code {
            "conflict" => Self::Conflict,
            "locked" => Self::Locked,
            "service_error" | "unavailable" | "timeout" => Self::ServiceError,
            "not_found" => Self::NotFound,
            "no_subnet_available_in_ip_range" | "no_subnet_available" => Self::NoSubnetAvailable,
            "server_already_attached" => Self::ServerAlreadyAttached,
            "rate_limit_exceeded" => Self::RateLimited,
            "invalid_input" => Self::InvalidInput,
            _ => Self::Other,
        }
    }

    /// Maps an HTTP status onto a kind when the body carries no usable code.
    #[must_use]
    pub const fn from_status(status: u16) -> Self {
        match status {
            404 => Self::NotFound,
            409 => Self::Conflict,
            423 => Self::Locked,
            429 => Self::RateLimited,
            400 | 422 => Self::InvalidInput,
            500..=599 => Self::ServiceError,
            _ => Self::Other,
        }
    }

    /// Returns whether a failure of this kind is worth retrying.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Conflict
                | Self::Locked
                | Self::ServiceError
                | Self::NoSubnetAvailable
                | Self::RateLimited
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Conflict => "conflict",
            Self::Locked => "locked",
            Self::ServiceError => "service error",
            Self::NotFound => "not found",
            Self::NoSubnetAvailable => "no subnet available",
            Self::ServerAlreadyAttached => "server already attached",
            Self::RateLimited => "rate limited",
            Self::InvalidInput => "invalid input",
            Self::Other => "error",
        };
        f.write_str(text)
    }
}

/// Failure returned by the remote API client.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("{message} ({code})")]
pub struct ApiError {
    /// Classification used for retry and idempotency decisions.
    pub kind: ErrorKind,
    /// Raw provider error code.
    pub code: String,
    /// Human readable message from the provider.
    pub message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl ApiError {
    /// Builds an error from a provider code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let raw_code = code.into();
        Self {
            kind: ErrorKind::from_code(&raw_code),
            code: raw_code,
            message: message.into(),
        }
    }

    /// Builds an error of the given kind without a provider code.
    #[must_use]
    pub fn of_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.to_string().replace(' ', "_"),
            message: message.into(),
        }
    }

    /// Decodes an error response body, falling back to the HTTP status when
    /// the body is not a provider error envelope.
    #[must_use]
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
            return Self::new(envelope.error.code, envelope.error.message);
        }
        Self {
            kind: ErrorKind::from_status(status),
            code: format!("http_{status}"),
            message: String::from_utf8_lossy(body).into_owned(),
        }
    }

    /// Returns whether this error has the given classification.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("locked", ErrorKind::Locked)]
    #[case("conflict", ErrorKind::Conflict)]
    #[case("no_subnet_available_in_ip_range", ErrorKind::NoSubnetAvailable)]
    #[case("server_already_attached", ErrorKind::ServerAlreadyAttached)]
    #[case("uniqueness_error", ErrorKind::Other)]
    fn from_code_classifies_provider_codes(#[case] code: &str, #[case] expected: ErrorKind) {
        assert_eq!(ErrorKind::from_code(code), expected);
    }

    #[test]
    fn from_response_reads_error_envelope() {
        let body = br#"{"error":{"code":"locked","message":"server is locked"}}"#;
        let err = ApiError::from_response(423, body);
        assert!(err.is(ErrorKind::Locked));
        assert_eq!(err.message, "server is locked");
    }

    #[test]
    fn from_response_falls_back_to_status() {
        let err = ApiError::from_response(503, b"upstream unavailable");
        assert_eq!(err.kind, ErrorKind::ServiceError);
        assert_eq!(err.code, "http_503");
        assert!(err.kind.is_transient());
    }

    #[test]
    fn not_found_is_not_transient() {
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(!ErrorKind::ServerAlreadyAttached.is_transient());
    }
}
