//! Standalone membership of a server in a private network.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{CloudApi, ServerPrivateNet};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::resource::{ReconcileFuture, Resource};
use crate::server::{
    AttachmentDiff, NetworkAttachmentConfig, apply_network_diff, attach_network, detach_network,
};
use crate::types::{NetworkId, ServerId};

/// Desired membership of one server in one network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerNetworkConfig {
    /// Member server.
    pub server_id: ServerId,
    /// Network joined.
    pub network_id: NetworkId,
    /// Fixed address; any address is accepted when absent.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Alias addresses routed to the server.
    #[serde(default)]
    pub alias_ips: BTreeSet<IpAddr>,
}

impl ServerNetworkConfig {
    /// Creates a membership with a provider-assigned address.
    #[must_use]
    pub const fn new(server_id: ServerId, network_id: NetworkId) -> Self {
        Self {
            server_id,
            network_id,
            ip: None,
            alias_ips: BTreeSet::new(),
        }
    }

    /// Returns the identifier of the membership.
    #[must_use]
    pub const fn id(&self) -> ServerNetworkId {
        ServerNetworkId {
            server: self.server_id,
            network: self.network_id,
        }
    }

    fn attachment(&self) -> NetworkAttachmentConfig {
        NetworkAttachmentConfig {
            network_id: self.network_id,
            ip: self.ip,
            alias_ips: self.alias_ips.clone(),
        }
    }
}

/// Identifier of a membership, rendered as `<server>-<network>`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ServerNetworkId {
    /// Member server.
    pub server: ServerId,
    /// Network joined.
    pub network: NetworkId,
}

impl fmt::Display for ServerNetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.server, self.network)
    }
}

/// Authoritative snapshot of a membership.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerNetwork {
    /// Member server.
    pub server_id: ServerId,
    /// Network joined.
    pub network_id: NetworkId,
    /// Address inside the network.
    pub ip: IpAddr,
    /// Alias addresses routed to the server.
    pub alias_ips: BTreeSet<IpAddr>,
    /// MAC address of the private interface.
    pub mac_address: String,
}

impl ServerNetwork {
    fn from_membership(server_id: ServerId, net: &ServerPrivateNet) -> Self {
        Self {
            server_id,
            network_id: net.network_id,
            ip: net.ip,
            alias_ips: net.alias_ips.clone(),
            mac_address: net.mac_address.clone(),
        }
    }
}

/// Reconciles standalone network memberships.
#[derive(Debug)]
pub struct ServerNetworkReconciler<C> {
    ctx: Context<C>,
}

impl<C: CloudApi> ServerNetworkReconciler<C> {
    pub(crate) const fn new(ctx: Context<C>) -> Self {
        Self { ctx }
    }

    async fn read_membership(
        &self,
        id: ServerNetworkId,
    ) -> Result<Option<ServerNetwork>, ReconcileError> {
        let Some(server) = self.ctx.read_server(id.server).await? else {
            return Ok(None);
        };
        Ok(server
            .private_net_for(id.network)
            .map(|net| ServerNetwork::from_membership(id.server, net)))
    }

    async fn require_membership(
        &self,
        id: ServerNetworkId,
    ) -> Result<ServerNetwork, ReconcileError> {
        self.read_membership(id)
            .await?
            .ok_or_else(|| ReconcileError::gone("server network", id))
    }

    async fn create_membership(
        &self,
        config: &ServerNetworkConfig,
    ) -> Result<ServerNetwork, ReconcileError> {
        let attachment = config.attachment();
        attachment.validate()?;
        attach_network(&self.ctx, config.server_id, &attachment).await?;
        info!(server_id = %config.server_id, network_id = %config.network_id, "network attached");
        self.require_membership(config.id()).await
    }

    async fn update_membership(
        &self,
        id: ServerNetworkId,
        config: &ServerNetworkConfig,
    ) -> Result<ServerNetwork, ReconcileError> {
        if config.id() != id {
            return Err(ReconcileError::invalid_config(
                "server_id",
                format!("membership {id} cannot move to {}", config.id()),
            ));
        }
        let attachment = config.attachment();
        attachment.validate()?;

        let server = self.ctx.require_server(id.server).await?;
        let current: Vec<ServerPrivateNet> = server
            .private_net_for(id.network)
            .cloned()
            .into_iter()
            .collect();
        let diff = AttachmentDiff::compute(&[attachment], &current);
        apply_network_diff(&self.ctx, id.server, &diff).await?;
        self.require_membership(id).await
    }

    async fn delete_membership(&self, id: ServerNetworkId) -> Result<(), ReconcileError> {
        detach_network(&self.ctx, id.server, id.network).await
    }
}

impl<C: CloudApi> Resource for ServerNetworkReconciler<C> {
    const KIND: &'static str = "server network";

    type Id = ServerNetworkId;
    type Config = ServerNetworkConfig;
    type State = ServerNetwork;

    fn create<'a>(&'a self, config: &'a ServerNetworkConfig) -> ReconcileFuture<'a, ServerNetwork> {
        Box::pin(self.create_membership(config))
    }

    fn read(&self, id: ServerNetworkId) -> ReconcileFuture<'_, Option<ServerNetwork>> {
        Box::pin(self.read_membership(id))
    }

    fn update<'a>(
        &'a self,
        id: ServerNetworkId,
        config: &'a ServerNetworkConfig,
    ) -> ReconcileFuture<'a, ServerNetwork> {
        Box::pin(self.update_membership(id, config))
    }

    fn delete(&self, id: ServerNetworkId) -> ReconcileFuture<'_, ()> {
        Box::pin(self.delete_membership(id))
    }

    fn parse_id(raw: &str) -> Result<ServerNetworkId, ReconcileError> {
        let invalid = |message: String| ReconcileError::InvalidImportId {
            id: raw.to_owned(),
            message,
        };
        let (server, network) = raw
            .trim()
            .split_once('-')
            .ok_or_else(|| invalid(String::from("expected <server id>-<network id>")))?;
        Ok(ServerNetworkId {
            server: server
                .parse()
                .map_err(|err| invalid(format!("invalid server id ({err})")))?,
            network: network
                .parse()
                .map_err(|err| invalid(format!("invalid network id ({err})")))?,
        })
    }
}

#[cfg(test)]
mod tests;
