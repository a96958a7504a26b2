//! Private network membership reconciliation for servers.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::{CloudApi, ErrorKind, NetworkAttachOpts, ServerPrivateNet};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::types::{NetworkId, ServerId};

/// Desired membership of a server in a private network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct NetworkAttachmentConfig {
    /// Network to join.
    pub network_id: NetworkId,
    /// Fixed address; any address is accepted when absent.
    #[serde(default)]
    pub ip: Option<IpAddr>,
    /// Alias addresses routed to the server.
    #[serde(default)]
    pub alias_ips: BTreeSet<IpAddr>,
}

impl NetworkAttachmentConfig {
    /// Creates a membership with a provider-assigned address and no aliases.
    #[must_use]
    pub const fn new(network_id: NetworkId) -> Self {
        Self {
            network_id,
            ip: None,
            alias_ips: BTreeSet::new(),
        }
    }

    /// Sets the fixed address.
    #[must_use]
    pub const fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Sets the alias addresses.
    #[must_use]
    pub fn with_alias_ips(mut self, alias_ips: impl IntoIterator<Item = IpAddr>) -> Self {
        self.alias_ips = alias_ips.into_iter().collect();
        self
    }

    pub(crate) fn attach_opts(&self) -> NetworkAttachOpts {
        NetworkAttachOpts {
            network_id: self.network_id,
            ip: self.ip,
            alias_ips: self.alias_ips.iter().copied().collect(),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ReconcileError> {
        match self.ip {
            Some(ip) if self.alias_ips.contains(&ip) => Err(ReconcileError::invalid_config(
                "networks",
                format!(
                    "alias ip {ip} of network {} repeats the attachment ip",
                    self.network_id
                ),
            )),
            _ => Ok(()),
        }
    }
}

/// Operations that move the current memberships to the desired ones.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AttachmentDiff {
    /// Networks to leave, including memberships whose address changes.
    pub to_detach: Vec<NetworkId>,
    /// Memberships to create, including re-attachments with a new address.
    pub to_attach: Vec<NetworkAttachmentConfig>,
    /// Memberships whose alias addresses change in place.
    pub to_modify: Vec<NetworkAttachmentConfig>,
}

impl AttachmentDiff {
    /// Compares the desired memberships against the current ones.
    #[must_use]
    pub fn compute(desired: &[NetworkAttachmentConfig], current: &[ServerPrivateNet]) -> Self {
        let wanted: BTreeMap<NetworkId, &NetworkAttachmentConfig> = desired
            .iter()
            .map(|config| (config.network_id, config))
            .collect();
        let mut diff = Self::default();

        for net in current {
            if !wanted.contains_key(&net.network_id) {
                diff.to_detach.push(net.network_id);
            }
        }

        for config in wanted.values() {
            let Some(net) = current
                .iter()
                .find(|net| net.network_id == config.network_id)
            else {
                diff.to_attach.push((*config).clone());
                continue;
            };
            if config.ip.is_some_and(|ip| ip != net.ip) {
                diff.to_detach.push(config.network_id);
                diff.to_attach.push((*config).clone());
            } else if config.alias_ips != net.alias_ips {
                diff.to_modify.push((*config).clone());
            }
        }
        diff
    }

    /// Returns whether no operation is needed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_detach.is_empty() && self.to_attach.is_empty() && self.to_modify.is_empty()
    }
}

/// Attaches a server to a network; an existing membership counts as success.
pub(crate) async fn attach<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    config: &NetworkAttachmentConfig,
) -> Result<(), ReconcileError> {
    let api = ctx.api();
    let opts = config.attach_opts();
    let opts_ref = &opts;
    ctx.perform_tolerating(
        "attach server to network",
        ErrorKind::ServerAlreadyAttached,
        move || api.attach_to_network(server_id, opts_ref),
    )
    .await
}

/// Detaches a server from a network; a missing membership counts as success.
pub(crate) async fn detach<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    network_id: NetworkId,
) -> Result<(), ReconcileError> {
    let api = ctx.api();
    ctx.perform_tolerating(
        "detach server from network",
        ErrorKind::NotFound,
        move || api.detach_from_network(server_id, network_id),
    )
    .await
}

/// Replaces the alias addresses of a membership.
async fn change_alias_ips<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    config: &NetworkAttachmentConfig,
) -> Result<(), ReconcileError> {
    let api = ctx.api();
    let network_id = config.network_id;
    let alias_ips: Vec<IpAddr> = config.alias_ips.iter().copied().collect();
    let alias_ref = alias_ips.as_slice();
    ctx.perform("change alias ips", move || {
        api.change_alias_ips(server_id, network_id, alias_ref)
    })
    .await
}

/// Reconciles the memberships of a server against `desired`.
pub(crate) async fn reconcile<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    desired: &[NetworkAttachmentConfig],
) -> Result<(), ReconcileError> {
    let server = ctx.require_server(server_id).await?;
    let diff = AttachmentDiff::compute(desired, &server.private_net);
    apply(ctx, server_id, &diff).await
}

/// Executes a diff: detaches first, then alias changes, then attaches.
pub(crate) async fn apply<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    diff: &AttachmentDiff,
) -> Result<(), ReconcileError> {
    if diff.is_empty() {
        return Ok(());
    }
    info!(
        server_id = %server_id,
        detach = diff.to_detach.len(),
        modify = diff.to_modify.len(),
        attach = diff.to_attach.len(),
        "reconciling private networks"
    );

    for network_id in &diff.to_detach {
        detach(ctx, server_id, *network_id).await?;
    }
    for config in &diff.to_modify {
        change_alias_ips(ctx, server_id, config).await?;
    }
    for config in &diff.to_attach {
        attach(ctx, server_id, config).await?;
    }
    Ok(())
}
