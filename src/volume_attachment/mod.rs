//! Standalone attachment of a volume to a server.
//!
//! The attachment is identified by its volume, since a volume is attached to
//! at most one server.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{CloudApi, Volume};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::resource::{ReconcileFuture, Resource, parse_numeric_id};
use crate::types::{ServerId, VolumeId};
use crate::volume;

/// Desired attachment of a volume.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeAttachmentConfig {
    /// Attached volume.
    pub volume_id: VolumeId,
    /// Server the volume is attached to.
    pub server_id: ServerId,
    /// Whether the server mounts the volume automatically.
    #[serde(default)]
    pub automount: bool,
}

/// Authoritative snapshot of an attachment.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeAttachment {
    /// Attached volume.
    pub volume_id: VolumeId,
    /// Server the volume is attached to.
    pub server_id: ServerId,
    /// Device path on the server.
    pub linux_device: String,
}

impl VolumeAttachment {
    fn from_volume(volume: &Volume) -> Option<Self> {
        volume.server.map(|server_id| Self {
            volume_id: volume.id,
            server_id,
            linux_device: volume.linux_device.clone(),
        })
    }
}

/// Reconciles standalone volume attachments.
#[derive(Debug)]
pub struct VolumeAttachmentReconciler<C> {
    ctx: Context<C>,
}

impl<C: CloudApi> VolumeAttachmentReconciler<C> {
    pub(crate) const fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn read_attachment(
        &self,
        id: VolumeId,
    ) -> Result<Option<VolumeAttachment>, ReconcileError> {
        let volume = self.ctx.read_volume(id).await?;
        Ok(volume.as_ref().and_then(VolumeAttachment::from_volume))
    }

    async fn ensure_attached(
        &self,
        config: &VolumeAttachmentConfig,
    ) -> Result<VolumeAttachment, ReconcileError> {
        let id = config.volume_id;
        let current = self.ctx.require_volume(id).await?;
        match current.server {
            Some(server_id) if server_id == config.server_id => {}
            attached => {
                if let Some(previous) = attached {
                    info!(volume_id = %id, server_id = %previous, "detaching from previous server");
                    volume::detach(&self.ctx, id).await?;
                }
                volume::attach(&self.ctx, id, config.server_id, config.automount).await?;
            }
        }
        let refreshed = self.ctx.require_volume(id).await?;
        VolumeAttachment::from_volume(&refreshed)
            .ok_or_else(|| ReconcileError::gone("volume attachment", id))
    }

    async fn update_attachment(
        &self,
        id: VolumeId,
        config: &VolumeAttachmentConfig,
    ) -> Result<VolumeAttachment, ReconcileError> {
        if config.volume_id != id {
            return Err(ReconcileError::invalid_config(
                "volume_id",
                format!("attachment of volume {id} cannot move to volume {}", config.volume_id),
            ));
        }
        self.ensure_attached(config).await
    }

    async fn delete_attachment(&self, id: VolumeId) -> Result<(), ReconcileError> {
        volume::detach(&self.ctx, id).await
    }
}

impl<C: CloudApi> Resource for VolumeAttachmentReconciler<C> {
    const KIND: &'static str = "volume attachment";

    type Id = VolumeId;
    type Config = VolumeAttachmentConfig;
    type State = VolumeAttachment;

    fn create<'a>(
        &'a self,
        config: &'a VolumeAttachmentConfig,
    ) -> ReconcileFuture<'a, VolumeAttachment> {
        Box::pin(self.ensure_attached(config))
    }

    fn read(&self, id: VolumeId) -> ReconcileFuture<'_, Option<VolumeAttachment>> {
        Box::pin(self.read_attachment(id))
    }

    fn update<'a>(
        &'a self,
        id: VolumeId,
        config: &'a VolumeAttachmentConfig,
    ) -> ReconcileFuture<'a, VolumeAttachment> {
        Box::pin(self.update_attachment(id, config))
    }

    fn delete(&self, id: VolumeId) -> ReconcileFuture<'_, ()> {
        Box::pin(self.delete_attachment(id))
    }

    fn parse_id(raw: &str) -> Result<VolumeId, ReconcileError> {
        parse_numeric_id(raw)
    }
}

#[cfg(test)]
mod tests;
