//! Block volume reconciliation.
//!
//! A volume is attached to at most one server. Moving it always detaches
//! first and then attaches to the new target; there is no direct move.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::api::{
    CloudApi, CreatedVolume, ErrorKind, Volume, VolumeCreateOpts, VolumeUpdateOpts,
};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::resource::{ReconcileFuture, Resource, parse_numeric_id};
use crate::retry::retry;
use crate::types::{ServerId, VolumeId};

/// Desired configuration of a volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeConfig {
    /// Volume name.
    pub name: String,
    /// Size in gigabytes. Volumes only grow.
    pub size_gb: u32,
    /// Location; required at creation unless `server_id` is set.
    #[serde(default)]
    pub location: Option<String>,
    /// Server the volume is attached to.
    #[serde(default)]
    pub server_id: Option<ServerId>,
    /// Whether the server mounts the volume automatically.
    #[serde(default)]
    pub automount: bool,
    /// Filesystem to format the volume with, only used at creation.
    #[serde(default)]
    pub format: Option<String>,
    /// User labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Whether delete protection is enabled.
    #[serde(default)]
    pub delete_protection: bool,
}

impl VolumeConfig {
    /// Creates a configuration for a detached volume in `location`.
    #[must_use]
    pub fn new(name: impl Into<String>, size_gb: u32, location: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_gb,
            location: Some(location.into()),
            server_id: None,
            automount: false,
            format: None,
            labels: BTreeMap::new(),
            delete_protection: false,
        }
    }

    /// Creates a configuration for a volume attached to `server_id`.
    #[must_use]
    pub fn attached(name: impl Into<String>, size_gb: u32, server_id: ServerId) -> Self {
        Self {
            location: None,
            server_id: Some(server_id),
            ..Self::new(name, size_gb, String::new())
        }
    }

    /// Validates the attributes checked on every operation.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidConfig`] naming the offending
    /// attribute.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.trim().is_empty() {
            return Err(ReconcileError::invalid_config("name", "must not be empty"));
        }
        if self.size_gb == 0 {
            return Err(ReconcileError::invalid_config("size", "must be positive"));
        }
        Ok(())
    }

    /// Validates the attributes checked before creation.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidConfig`] unless exactly one of
    /// location and server is set.
    pub fn validate_create(&self) -> Result<(), ReconcileError> {
        self.validate()?;
        match (&self.location, self.server_id) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            (Some(_), Some(_)) => Err(ReconcileError::invalid_config(
                "location",
                "conflicts with server_id; the volume is created next to the server",
            )),
            (None, None) => Err(ReconcileError::invalid_config(
                "location",
                "either location or server_id is required",
            )),
        }
    }

    fn create_opts(&self) -> VolumeCreateOpts {
        VolumeCreateOpts {
            name: self.name.clone(),
            size_gb: self.size_gb,
            location: self.location.clone(),
            server: self.server_id,
            automount: self.automount,
            format: self.format.clone(),
            labels: self.labels.clone(),
        }
    }
}

/// Attaches a volume and waits for the action, retrying the pair while the
/// failure is transient.
pub(crate) async fn attach<C: CloudApi>(
    ctx: &Context<C>,
    volume_id: VolumeId,
    server_id: ServerId,
    automount: bool,
) -> Result<(), ReconcileError> {
    info!(volume_id = %volume_id, server_id = %server_id, "attaching volume");
    retry(ctx.retry_policy(), move || async move {
        attach_once(ctx, volume_id, server_id, automount)
            .await
            .map_err(ReconcileError::into_attempt)
    })
    .await
}

async fn attach_once<C: CloudApi>(
    ctx: &Context<C>,
    volume_id: VolumeId,
    server_id: ServerId,
    automount: bool,
) -> Result<(), ReconcileError> {
    let action = ctx
        .api()
        .attach_volume(volume_id, server_id, automount)
        .await
        .map_err(|err| ReconcileError::api("attach volume", err))?;
    ctx.wait("attach volume", &action).await
}

/// Detaches a volume; a missing volume counts as success.
pub(crate) async fn detach<C: CloudApi>(
    ctx: &Context<C>,
    volume_id: VolumeId,
) -> Result<(), ReconcileError> {
    let api = ctx.api();
    ctx.perform_tolerating("detach volume", ErrorKind::NotFound, move || {
        api.detach_volume(volume_id)
    })
    .await
}

/// Reconciles volumes.
#[derive(Debug)]
pub struct VolumeReconciler<C> {
    ctx: Context<C>,
}

impl<C: CloudApi> VolumeReconciler<C> {
    pub(crate) const fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn create_volume(&self, config: &VolumeConfig) -> Result<Volume, ReconcileError> {
        config.validate_create()?;
        let api = self.ctx.api();
        let opts = config.create_opts();
        let opts_ref = &opts;
        // Nothing exists remotely after a locked create, so the call is
        // repeated whole. Other failures abort.
        let created = self
            .ctx
            .call_retrying_on("create volume", ErrorKind::Locked, move || {
                api.create_volume(opts_ref)
            })
            .await?;
        let id = created.volume.id;
        info!(volume_id = %id, name = %config.name, "volume created");

        self.settle_created(config, &created).await?;
        if config.delete_protection {
            self.ctx
                .perform("change volume protection", move || {
                    api.change_volume_protection(id, true)
                })
                .await?;
        }
        self.ctx.require_volume(id).await
    }

    async fn settle_created(
        &self,
        config: &VolumeConfig,
        created: &CreatedVolume,
    ) -> Result<(), ReconcileError> {
        if let Some(action) = &created.action {
            self.ctx.wait("create volume", action).await?;
        }
        match self.ctx.wait_all("attach volume", &created.next_actions).await {
            Err(err) if err.is(ErrorKind::Locked) => {
                let Some(server_id) = config.server_id else {
                    return Err(err);
                };
                warn!(volume_id = %created.volume.id, error = %err, "attach after create was locked");
                attach(&self.ctx, created.volume.id, server_id, config.automount).await
            }
            other => other,
        }
    }

    async fn update_volume(
        &self,
        id: VolumeId,
        config: &VolumeConfig,
    ) -> Result<Volume, ReconcileError> {
        config.validate()?;
        let volume = self.ctx.require_volume(id).await?;
        if config.size_gb < volume.size_gb {
            return Err(ReconcileError::invalid_config(
                "size",
                format!(
                    "volume {id} is {} GB and cannot shrink to {} GB",
                    volume.size_gb, config.size_gb
                ),
            ));
        }

        let api = self.ctx.api();
        if volume.name != config.name || volume.labels != config.labels {
            let opts = VolumeUpdateOpts {
                name: config.name.clone(),
                labels: config.labels.clone(),
            };
            let opts_ref = &opts;
            self.ctx
                .call("update volume", move || api.update_volume(id, opts_ref))
                .await?;
        }
        if config.size_gb > volume.size_gb {
            let size_gb = config.size_gb;
            info!(volume_id = %id, from = volume.size_gb, to = size_gb, "resizing volume");
            self.ctx
                .perform("resize volume", move || api.resize_volume(id, size_gb))
                .await?;
        }

        self.update_server(id, config).await?;

        let refreshed = self.ctx.require_volume(id).await?;
        if refreshed.delete_protection != config.delete_protection {
            let delete = config.delete_protection;
            self.ctx
                .perform("change volume protection", move || {
                    api.change_volume_protection(id, delete)
                })
                .await?;
        }
        self.ctx.require_volume(id).await
    }

    async fn update_server(
        &self,
        id: VolumeId,
        config: &VolumeConfig,
    ) -> Result<(), ReconcileError> {
        let volume = self.ctx.require_volume(id).await?;
        if volume.server == config.server_id {
            return Ok(());
        }
        if volume.server.is_some() {
            detach(&self.ctx, id).await?;
        }
        if let Some(server_id) = config.server_id {
            attach(&self.ctx, id, server_id, config.automount).await?;
        }
        Ok(())
    }

    async fn delete_volume(&self, id: VolumeId) -> Result<(), ReconcileError> {
        let ctx = &self.ctx;
        retry(ctx.retry_policy(), move || async move {
            delete_once(ctx, id)
                .await
                .map_err(ReconcileError::into_attempt)
        })
        .await
    }
}

async fn delete_once<C: CloudApi>(ctx: &Context<C>, id: VolumeId) -> Result<(), ReconcileError> {
    let api = ctx.api();
    let current = api
        .get_volume(id)
        .await
        .map_err(|err| ReconcileError::api("read volume", err))?;
    let Some(volume) = current else {
        return Ok(());
    };

    if volume.server.is_some() {
        match api.detach_volume(id).await {
            Ok(action) => ctx.wait("detach volume", &action).await?,
            Err(err) if err.is(ErrorKind::NotFound) => {}
            Err(err) => return Err(ReconcileError::api("detach volume", err)),
        }
    }
    match api.delete_volume(id).await {
        Err(err) if !err.is(ErrorKind::NotFound) => Err(ReconcileError::api("delete volume", err)),
        _ => Ok(()),
    }
}

impl<C: CloudApi> Resource for VolumeReconciler<C> {
    const KIND: &'static str = "volume";

    type Id = VolumeId;
    type Config = VolumeConfig;
    type State = Volume;

    fn create<'a>(&'a self, config: &'a VolumeConfig) -> ReconcileFuture<'a, Volume> {
        Box::pin(self.create_volume(config))
    }

    fn read(&self, id: VolumeId) -> ReconcileFuture<'_, Option<Volume>> {
        Box::pin(self.ctx.read_volume(id))
    }

    fn update<'a>(&'a self, id: VolumeId, config: &'a VolumeConfig) -> ReconcileFuture<'a, Volume> {
        Box::pin(self.update_volume(id, config))
    }

    fn delete(&self, id: VolumeId) -> ReconcileFuture<'_, ()> {
        Box::pin(self.delete_volume(id))
    }

    fn parse_id(raw: &str) -> Result<VolumeId, ReconcileError> {
        parse_numeric_id(raw)
    }
}
