//! Configuration loading via `ortho-config`.
//!
//! Only the timing knobs of the reconcilers are configurable here. Provider
//! credentials and endpoints belong to the API client adapter.

use std::ffi::OsString;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::action::ActionWaiter;
use crate::retry::{Backoff, RetryPolicy};

const BACKOFF_BASE: u32 = 2;

/// Retry and wait settings layered from defaults, `reconciler.toml`,
/// `RECONCILER_*` environment variables, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "RECONCILER",
    discovery(
        app_name = "reconciler",
        env_var = "RECONCILER_CONFIG_PATH",
        config_file_name = "reconciler.toml",
        dotfile_name = ".reconciler.toml",
        project_file_name = "reconciler.toml"
    )
)]
pub struct ReconcilerConfig {
    /// Maximum number of invocations of a retried call.
    #[ortho_config(default = 5)]
    pub retry_max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds.
    #[ortho_config(default = 1000)]
    pub retry_initial_delay_ms: u64,
    /// Upper bound for a single retry delay, in milliseconds.
    #[ortho_config(default = 60_000)]
    pub retry_max_delay_ms: u64,
    /// Delay between action status polls, in milliseconds.
    #[ortho_config(default = 500)]
    pub action_poll_interval_ms: u64,
    /// Overall limit for a single action wait, in seconds.
    #[ortho_config(default = 3600)]
    pub action_timeout_secs: u64,
}

impl ReconcilerConfig {
    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags in
    /// that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("reconciler")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that the timing values are usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require(self.retry_max_attempts > 0, "retry_max_attempts")?;
        Self::require(
            self.retry_max_delay_ms >= self.retry_initial_delay_ms,
            "retry_max_delay_ms",
        )?;
        Self::require(self.action_poll_interval_ms > 0, "action_poll_interval_ms")?;
        Self::require(self.action_timeout_secs > 0, "action_timeout_secs")?;
        Ok(())
    }

    fn require(condition: bool, field: &str) -> Result<(), ConfigError> {
        if condition {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                field: field.to_owned(),
            })
        }
    }

    /// Builds the retry policy described by this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            Backoff::Exponential {
                base: BACKOFF_BASE,
                initial: Duration::from_millis(self.retry_initial_delay_ms),
                max: Duration::from_millis(self.retry_max_delay_ms),
            },
        )
    }

    /// Builds the action waiter described by this configuration.
    #[must_use]
    pub const fn action_waiter(&self) -> ActionWaiter {
        ActionWaiter::new(
            Duration::from_millis(self.action_poll_interval_ms),
            Duration::from_secs(self.action_timeout_secs),
        )
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// A value is out of range.
    #[error("invalid configuration value for {field}")]
    Invalid {
        /// Offending field name.
        field: String,
    },
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}
