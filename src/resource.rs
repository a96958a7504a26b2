//! Lifecycle entry points shared by every reconciler.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use crate::error::ReconcileError;

/// Future returned by reconciler operations.
pub type ReconcileFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ReconcileError>> + Send + 'a>>;

/// Create, read, update, delete, and import for one resource kind.
///
/// Implementations fetch authoritative remote state before every decision
/// and return a fresh snapshot after each mutation. State persistence belongs
/// to the caller.
pub trait Resource: Send + Sync {
    /// Resource type name used in errors and logs.
    const KIND: &'static str;

    /// Stable identifier of a managed resource.
    type Id: Copy + fmt::Display + Send + Sync;

    /// Desired configuration.
    type Config: Send + Sync;

    /// Authoritative snapshot returned to the caller.
    type State: Send;

    /// Creates the resource and returns its state.
    fn create<'a>(&'a self, config: &'a Self::Config) -> ReconcileFuture<'a, Self::State>;

    /// Reads the resource; `Ok(None)` means it no longer exists.
    fn read(&self, id: Self::Id) -> ReconcileFuture<'_, Option<Self::State>>;

    /// Moves the resource towards `config` and returns its new state.
    fn update<'a>(
        &'a self,
        id: Self::Id,
        config: &'a Self::Config,
    ) -> ReconcileFuture<'a, Self::State>;

    /// Deletes the resource. Deleting a missing resource succeeds.
    fn delete(&self, id: Self::Id) -> ReconcileFuture<'_, ()>;

    /// Parses an opaque import identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidImportId`] when `raw` is malformed.
    fn parse_id(raw: &str) -> Result<Self::Id, ReconcileError>;

    /// Imports an existing resource by its opaque identifier.
    fn import<'a>(&'a self, raw: &'a str) -> ReconcileFuture<'a, Self::State> {
        Box::pin(async move {
            let id = Self::parse_id(raw)?;
            self.read(id)
                .await?
                .ok_or_else(|| ReconcileError::gone(Self::KIND, id))
        })
    }
}

/// Parses a numeric identifier, mapping failures onto
/// [`ReconcileError::InvalidImportId`].
pub(crate) fn parse_numeric_id<T>(raw: &str) -> Result<T, ReconcileError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse().map_err(|err: T::Err| ReconcileError::InvalidImportId {
        id: raw.to_owned(),
        message: format!("expected a numeric id ({err})"),
    })
}
