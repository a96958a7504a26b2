//! Server reconciliation.
//!
//! Updates run in a fixed order and re-read the server before each step:
//! name and labels, server type, backups, placement group, private networks,
//! primary IPs, and protection. Steps that the API only allows on a stopped
//! server power it off first and always try to power it back on.

mod network;
mod public_net;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{CloudApi, ErrorKind, ProtectionOpts, Server, ServerCreateOpts, ServerUpdateOpts};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::resource::{ReconcileFuture, Resource, parse_numeric_id};
use crate::types::{PlacementGroupId, ServerId};

pub use network::{AttachmentDiff, NetworkAttachmentConfig};
pub use public_net::PublicNetConfig;

pub(crate) use network::{
    apply as apply_network_diff, attach as attach_network, detach as detach_network,
};

const fn default_true() -> bool {
    true
}

/// Desired configuration of a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerConfig {
    /// Server name.
    pub name: String,
    /// Server type name (for example `cx22`).
    pub server_type: String,
    /// Image name or identifier.
    pub image: String,
    /// Location name; the provider picks one when absent.
    #[serde(default)]
    pub location: Option<String>,
    /// User labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Cloud-init user data, only used at creation.
    #[serde(default)]
    pub user_data: Option<String>,
    /// SSH keys, only used at creation.
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    /// Private network memberships.
    #[serde(default)]
    pub networks: Vec<NetworkAttachmentConfig>,
    /// Public network shape; the default shape applies when absent.
    #[serde(default)]
    pub public_net: Option<PublicNetConfig>,
    /// Placement group membership.
    #[serde(default)]
    pub placement_group: Option<PlacementGroupId>,
    /// Whether backups are enabled.
    #[serde(default)]
    pub backups: bool,
    /// Whether delete protection is enabled.
    #[serde(default)]
    pub delete_protection: bool,
    /// Whether rebuild protection is enabled.
    #[serde(default)]
    pub rebuild_protection: bool,
    /// Whether to boot the server once created.
    #[serde(default = "default_true")]
    pub start_after_create: bool,
}

impl ServerConfig {
    /// Creates a configuration with defaults for every optional attribute.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        server_type: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            server_type: server_type.into(),
            image: image.into(),
            location: None,
            labels: BTreeMap::new(),
            user_data: None,
            ssh_keys: Vec::new(),
            networks: Vec::new(),
            public_net: None,
            placement_group: None,
            backups: false,
            delete_protection: false,
            rebuild_protection: false,
            start_after_create: true,
        }
    }

    /// Returns the effective public network shape.
    #[must_use]
    pub fn public_net(&self) -> PublicNetConfig {
        self.public_net.unwrap_or_default()
    }

    /// Validates the configuration before any remote call.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidConfig`] naming the offending
    /// attribute.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        for (field, value) in [
            ("name", &self.name),
            ("server_type", &self.server_type),
            ("image", &self.image),
        ] {
            if value.trim().is_empty() {
                return Err(ReconcileError::invalid_config(field, "must not be empty"));
            }
        }

        let mut seen = BTreeSet::new();
        for config in &self.networks {
            if !seen.insert(config.network_id) {
                return Err(ReconcileError::invalid_config(
                    "networks",
                    format!("network {} is listed twice", config.network_id),
                ));
            }
            config.validate()?;
        }

        let public_net = self.public_net();
        public_net.validate()?;
        if public_net.is_private_only() && self.networks.is_empty() {
            return Err(ReconcileError::invalid_config(
                "networks",
                "a server without public addresses needs a private network",
            ));
        }
        Ok(())
    }

    fn create_opts(&self) -> ServerCreateOpts {
        let public_net = self.public_net();
        // A server without public addresses is only reachable through the
        // networks it is created in.
        let networks = if public_net.is_private_only() {
            self.networks
                .iter()
                .map(NetworkAttachmentConfig::attach_opts)
                .collect()
        } else {
            Vec::new()
        };
        ServerCreateOpts {
            name: self.name.clone(),
            server_type: self.server_type.clone(),
            image: self.image.clone(),
            location: self.location.clone(),
            labels: self.labels.clone(),
            user_data: self.user_data.clone(),
            ssh_keys: self.ssh_keys.clone(),
            public_net: public_net.create_opts(),
            networks,
            placement_group: self.placement_group,
            start_after_create: self.start_after_create,
        }
    }

    const fn protection(&self) -> ProtectionOpts {
        ProtectionOpts {
            delete: Some(self.delete_protection),
            rebuild: Some(self.rebuild_protection),
        }
    }
}

/// Reconciles servers.
#[derive(Debug)]
pub struct ServerReconciler<C> {
    ctx: Context<C>,
}

impl<C: CloudApi> ServerReconciler<C> {
    pub(crate) const fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn create_server(&self, config: &ServerConfig) -> Result<Server, ReconcileError> {
        config.validate()?;
        let api = self.ctx.api();
        let opts = config.create_opts();
        let opts_ref = &opts;
        let created = self
            .ctx
            .call("create server", move || api.create_server(opts_ref))
            .await?;
        let id = created.server.id;
        info!(server_id = %id, name = %config.name, "server created");

        let mut actions = vec![created.action];
        actions.extend(created.next_actions);
        self.ctx.wait_all("create server", &actions).await?;

        network::reconcile(&self.ctx, id, &config.networks).await?;
        if config.backups {
            self.ctx
                .perform("enable server backups", move || api.enable_backup(id))
                .await?;
        }
        if config.delete_protection || config.rebuild_protection {
            let protection = config.protection();
            self.ctx
                .perform("change server protection", move || {
                    api.change_server_protection(id, protection)
                })
                .await?;
        }
        self.ctx.require_server(id).await
    }

    async fn update_server(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<Server, ReconcileError> {
        config.validate()?;
        self.update_attributes(id, config).await?;
        self.update_server_type(id, config).await?;
        self.update_backups(id, config).await?;
        self.update_placement_group(id, config).await?;
        network::reconcile(&self.ctx, id, &config.networks).await?;
        public_net::reconcile(&self.ctx, id, &config.public_net()).await?;
        self.update_protection(id, config).await?;
        self.ctx.require_server(id).await
    }

    async fn update_attributes(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<(), ReconcileError> {
        let server = self.ctx.require_server(id).await?;
        if server.name == config.name && server.labels == config.labels {
            return Ok(());
        }
        info!(server_id = %id, "updating name and labels");
        let api = self.ctx.api();
        let opts = ServerUpdateOpts {
            name: config.name.clone(),
            labels: config.labels.clone(),
        };
        let opts_ref = &opts;
        self.ctx
            .call("update server", move || api.update_server(id, opts_ref))
            .await?;
        Ok(())
    }

    async fn update_server_type(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<(), ReconcileError> {
        let server = self.ctx.require_server(id).await?;
        if server.server_type == config.server_type {
            return Ok(());
        }
        info!(server_id = %id, from = %server.server_type, to = %config.server_type, "changing type");
        let powered_off = self.ctx.power_off_if_running(&server).await?;
        let api = self.ctx.api();
        let server_type = config.server_type.as_str();
        let outcome = self
            .ctx
            .perform("change server type", move || {
                api.change_server_type(id, server_type, false)
            })
            .await;
        self.ctx.restore_power(id, powered_off, outcome).await
    }

    async fn update_backups(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<(), ReconcileError> {
        let server = self.ctx.require_server(id).await?;
        if server.backups_enabled == config.backups {
            return Ok(());
        }
        let api = self.ctx.api();
        if config.backups {
            self.ctx
                .perform("enable server backups", move || api.enable_backup(id))
                .await
        } else {
            self.ctx
                .perform("disable server backups", move || api.disable_backup(id))
                .await
        }
    }

    async fn update_placement_group(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<(), ReconcileError> {
        let server = self.ctx.require_server(id).await?;
        if server.placement_group == config.placement_group {
            return Ok(());
        }
        let powered_off = self.ctx.power_off_if_running(&server).await?;
        let outcome = self
            .move_placement_group(id, server.placement_group, config.placement_group)
            .await;
        self.ctx.restore_power(id, powered_off, outcome).await
    }

    async fn move_placement_group(
        &self,
        id: ServerId,
        current: Option<PlacementGroupId>,
        desired: Option<PlacementGroupId>,
    ) -> Result<(), ReconcileError> {
        let api = self.ctx.api();
        if current.is_some() {
            self.ctx
                .perform_tolerating(
                    "remove server from placement group",
                    ErrorKind::NotFound,
                    move || api.remove_from_placement_group(id),
                )
                .await?;
        }
        if let Some(group) = desired {
            self.ctx
                .perform("add server to placement group", move || {
                    api.add_to_placement_group(id, group)
                })
                .await?;
        }
        Ok(())
    }

    async fn update_protection(
        &self,
        id: ServerId,
        config: &ServerConfig,
    ) -> Result<(), ReconcileError> {
        let server = self.ctx.require_server(id).await?;
        if server.delete_protection == config.delete_protection
            && server.rebuild_protection == config.rebuild_protection
        {
            return Ok(());
        }
        let api = self.ctx.api();
        let protection = config.protection();
        self.ctx
            .perform("change server protection", move || {
                api.change_server_protection(id, protection)
            })
            .await
    }

    async fn delete_server(&self, id: ServerId) -> Result<(), ReconcileError> {
        let api = self.ctx.api();
        self.ctx
            .perform_tolerating("delete server", ErrorKind::NotFound, move || {
                api.delete_server(id)
            })
            .await
    }
}

impl<C: CloudApi> Resource for ServerReconciler<C> {
    const KIND: &'static str = "server";

    type Id = ServerId;
    type Config = ServerConfig;
    type State = Server;

    fn create<'a>(&'a self, config: &'a ServerConfig) -> ReconcileFuture<'a, Server> {
        Box::pin(self.create_server(config))
    }

    fn read(&self, id: ServerId) -> ReconcileFuture<'_, Option<Server>> {
        Box::pin(self.ctx.read_server(id))
    }

    fn update<'a>(&'a self, id: ServerId, config: &'a ServerConfig) -> ReconcileFuture<'a, Server> {
        Box::pin(self.update_server(id, config))
    }

    fn delete(&self, id: ServerId) -> ReconcileFuture<'_, ()> {
        Box::pin(self.delete_server(id))
    }

    fn parse_id(raw: &str) -> Result<ServerId, ReconcileError> {
        parse_numeric_id(raw)
    }
}
