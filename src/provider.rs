//! Entry point wiring an API client to the reconcilers.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::action::{Action, ActionWaiter};
use crate::api::{ApiFuture, CloudApi, ErrorKind, Server, Volume};
use crate::config::{ConfigError, ReconcilerConfig};
use crate::error::ReconcileError;
use crate::retry::{AttemptError, RetryPolicy, retry};
use crate::server::ServerReconciler;
use crate::server_network::ServerNetworkReconciler;
use crate::types::{ServerId, VolumeId};
use crate::volume::VolumeReconciler;
use crate::volume_attachment::VolumeAttachmentReconciler;

/// Owns the injected API client and the retry and wait settings shared by
/// every reconciler.
#[derive(Debug)]
pub struct Provider<C> {
    ctx: Context<C>,
}

impl<C: CloudApi> Provider<C> {
    /// Builds a provider from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when `config` fails validation.
    pub fn new(api: C, config: &ReconcilerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::with_policies(
            Arc::new(api),
            config.retry_policy(),
            config.action_waiter(),
        ))
    }

    /// Builds a provider from explicit policies.
    #[must_use]
    pub const fn with_policies(api: Arc<C>, retry: RetryPolicy, waiter: ActionWaiter) -> Self {
        Self {
            ctx: Context { api, retry, waiter },
        }
    }

    /// Returns the API client.
    #[must_use]
    pub fn api(&self) -> &C {
        &self.ctx.api
    }

    /// Returns the server reconciler.
    #[must_use]
    pub fn servers(&self) -> ServerReconciler<C> {
        ServerReconciler::new(self.ctx.clone())
    }

    /// Returns the volume reconciler.
    #[must_use]
    pub fn volumes(&self) -> VolumeReconciler<C> {
        VolumeReconciler::new(self.ctx.clone())
    }

    /// Returns the server network attachment reconciler.
    #[must_use]
    pub fn server_networks(&self) -> ServerNetworkReconciler<C> {
        ServerNetworkReconciler::new(self.ctx.clone())
    }

    /// Returns the volume attachment reconciler.
    #[must_use]
    pub fn volume_attachments(&self) -> VolumeAttachmentReconciler<C> {
        VolumeAttachmentReconciler::new(self.ctx.clone())
    }
}

/// Client handle plus policies, shared by the reconcilers.
#[derive(Debug)]
pub(crate) struct Context<C> {
    api: Arc<C>,
    retry: RetryPolicy,
    waiter: ActionWaiter,
}

impl<C> Clone for Context<C> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            retry: self.retry,
            waiter: self.waiter,
        }
    }
}

impl<C: CloudApi> Context<C> {
    pub(crate) fn api(&self) -> &C {
        &self.api
    }

    pub(crate) const fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Issues a call under the retry policy. Transient kinds are retried.
    pub(crate) async fn call<'a, T, F>(
        &'a self,
        operation: &'static str,
        call: F,
    ) -> Result<T, ReconcileError>
    where
        F: Fn() -> ApiFuture<'a, T>,
    {
        self.call_classified(operation, ReconcileError::into_attempt, call)
            .await
    }

    /// Issues a call that is only retried on failures of kind `retryable`.
    pub(crate) async fn call_retrying_on<'a, T, F>(
        &'a self,
        operation: &'static str,
        retryable: ErrorKind,
        call: F,
    ) -> Result<T, ReconcileError>
    where
        F: Fn() -> ApiFuture<'a, T>,
    {
        let classify = move |err: ReconcileError| {
            if err.is(retryable) {
                AttemptError::Transient(err)
            } else {
                AttemptError::Abort(err)
            }
        };
        self.call_classified(operation, classify, call).await
    }

    async fn call_classified<'a, T, F, P>(
        &'a self,
        operation: &'static str,
        classify: P,
        call: F,
    ) -> Result<T, ReconcileError>
    where
        F: Fn() -> ApiFuture<'a, T>,
        P: Fn(ReconcileError) -> AttemptError<ReconcileError>,
    {
        let issue = &call;
        let classify = &classify;
        retry(&self.retry, move || async move {
            issue()
                .await
                .map_err(|err| classify(ReconcileError::api(operation, err)))
        })
        .await
    }

    pub(crate) async fn wait(
        &self,
        operation: &'static str,
        action: &Action,
    ) -> Result<(), ReconcileError> {
        self.waiter
            .wait_for(self.api(), action)
            .await
            .map_err(|err| ReconcileError::action(operation, err))
    }

    pub(crate) async fn wait_all(
        &self,
        operation: &'static str,
        actions: &[Action],
    ) -> Result<(), ReconcileError> {
        self.waiter
            .wait_for_all(self.api(), actions)
            .await
            .map_err(|err| ReconcileError::action(operation, err))
    }

    /// Issues a call returning an action and waits for it.
    pub(crate) async fn perform<'a, F>(
        &'a self,
        operation: &'static str,
        call: F,
    ) -> Result<(), ReconcileError>
    where
        F: Fn() -> ApiFuture<'a, Action>,
    {
        info!(operation, "applying");
        let action = self.call(operation, call).await?;
        self.wait(operation, &action).await
    }

    /// Like [`Self::perform`], but a failure of kind `tolerated` counts as
    /// success.
    pub(crate) async fn perform_tolerating<'a, F>(
        &'a self,
        operation: &'static str,
        tolerated: ErrorKind,
        call: F,
    ) -> Result<(), ReconcileError>
    where
        F: Fn() -> ApiFuture<'a, Action>,
    {
        match self.perform(operation, call).await {
            Err(err) if err.is(tolerated) => {
                debug!(operation, error = %err, "treating failure as success");
                Ok(())
            }
            other => other,
        }
    }

    pub(crate) async fn read_server(&self, id: ServerId) -> Result<Option<Server>, ReconcileError> {
        let api = self.api();
        self.call("read server", move || api.get_server(id)).await
    }

    pub(crate) async fn require_server(&self, id: ServerId) -> Result<Server, ReconcileError> {
        self.read_server(id)
            .await?
            .ok_or_else(|| ReconcileError::gone("server", id))
    }

    pub(crate) async fn read_volume(&self, id: VolumeId) -> Result<Option<Volume>, ReconcileError> {
        let api = self.api();
        self.call("read volume", move || api.get_volume(id)).await
    }

    pub(crate) async fn require_volume(&self, id: VolumeId) -> Result<Volume, ReconcileError> {
        self.read_volume(id)
            .await?
            .ok_or_else(|| ReconcileError::gone("volume", id))
    }

    /// Powers a running server off. Returns whether a later power on is owed.
    pub(crate) async fn power_off_if_running(
        &self,
        server: &Server,
    ) -> Result<bool, ReconcileError> {
        if !server.status.is_powered_on() {
            return Ok(false);
        }
        let api = self.api();
        let id = server.id;
        self.perform("power off server", move || api.power_off(id))
            .await?;
        Ok(true)
    }

    /// Powers the server back on when `powered_off` is set, even if `outcome`
    /// is an error. The error of `outcome` wins over a failed power on.
    pub(crate) async fn restore_power(
        &self,
        id: ServerId,
        powered_off: bool,
        outcome: Result<(), ReconcileError>,
    ) -> Result<(), ReconcileError> {
        if !powered_off {
            return outcome;
        }
        let api = self.api();
        let powered_on = self.perform("power on server", move || api.power_on(id)).await;
        match (outcome, powered_on) {
            (Err(err), Err(power_err)) => {
                warn!(server_id = %id, error = %power_err, "failed to power server back on");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), powered) => powered,
        }
    }
}
