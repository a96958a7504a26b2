//! Primary IP reconciliation for servers.
//!
//! Primary IPs can only be assigned to or unassigned from a powered-off
//! server. The plan for both address families is computed up front; when it
//! is not empty the server is powered off, the plan is executed, and the
//! server is powered back on whether or not the plan succeeded.

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::{CloudApi, ErrorKind, PrimaryIpCreateOpts, PublicNetCreateOpts, Server};
use crate::error::ReconcileError;
use crate::provider::Context;
use crate::types::{IpFamily, PrimaryIpId, ServerId};

const FAMILIES: [IpFamily; 2] = [IpFamily::Ipv4, IpFamily::Ipv6];

/// Desired public network shape of a server.
///
/// A server without an explicit configuration gets the default: both
/// families enabled with provider-allocated addresses.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PublicNetConfig {
    /// Whether the server has a primary IPv4.
    pub ipv4_enabled: bool,
    /// Whether the server has a primary IPv6.
    pub ipv6_enabled: bool,
    /// Existing primary IPv4 to use.
    #[serde(default)]
    pub ipv4: Option<PrimaryIpId>,
    /// Existing primary IPv6 to use.
    #[serde(default)]
    pub ipv6: Option<PrimaryIpId>,
}

impl Default for PublicNetConfig {
    fn default() -> Self {
        Self {
            ipv4_enabled: true,
            ipv6_enabled: true,
            ipv4: None,
            ipv6: None,
        }
    }
}

impl PublicNetConfig {
    /// Returns whether the family is enabled.
    #[must_use]
    pub const fn enabled(&self, family: IpFamily) -> bool {
        match family {
            IpFamily::Ipv4 => self.ipv4_enabled,
            IpFamily::Ipv6 => self.ipv6_enabled,
        }
    }

    /// Returns the explicit primary IP requested for the family.
    #[must_use]
    pub const fn explicit(&self, family: IpFamily) -> Option<PrimaryIpId> {
        match family {
            IpFamily::Ipv4 => self.ipv4,
            IpFamily::Ipv6 => self.ipv6,
        }
    }

    /// Returns whether neither family is enabled.
    #[must_use]
    pub const fn is_private_only(&self) -> bool {
        !self.ipv4_enabled && !self.ipv6_enabled
    }

    /// Rejects an explicit primary IP on a disabled family.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::InvalidConfig`] naming the family.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        for family in FAMILIES {
            if let (false, Some(id)) = (self.enabled(family), self.explicit(family)) {
                return Err(ReconcileError::invalid_config(
                    "public_net",
                    format!("{family} primary ip {id} is set while {family} is disabled"),
                ));
            }
        }
        Ok(())
    }

    pub(crate) const fn create_opts(&self) -> PublicNetCreateOpts {
        PublicNetCreateOpts {
            enable_ipv4: self.ipv4_enabled,
            enable_ipv6: self.ipv6_enabled,
            ipv4: self.ipv4,
            ipv6: self.ipv6,
        }
    }
}

/// Primary IP currently assigned for one family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct AssignedIp {
    pub(crate) id: PrimaryIpId,
    pub(crate) auto_delete: bool,
}

/// One primary IP mutation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Step {
    Unassign { id: PrimaryIpId, delete: bool },
    Assign(PrimaryIpId),
    Allocate(IpFamily),
}

/// Plans the mutations for one family.
///
/// Addresses are only deleted when the provider owns them (`auto_delete`).
pub(crate) fn plan_family(
    family: IpFamily,
    config: &PublicNetConfig,
    current: Option<AssignedIp>,
) -> Vec<Step> {
    let release = |assigned: AssignedIp| Step::Unassign {
        id: assigned.id,
        delete: assigned.auto_delete,
    };
    match (config.enabled(family), config.explicit(family), current) {
        (true, Some(wanted), Some(assigned)) if assigned.id == wanted => Vec::new(),
        (true, Some(wanted), Some(assigned)) => vec![release(assigned), Step::Assign(wanted)],
        (true, Some(wanted), None) => vec![Step::Assign(wanted)],
        (true, None, None) => vec![Step::Allocate(family)],
        (false, None, Some(assigned)) => vec![release(assigned)],
        // Disabled with an explicit id is rejected by validation.
        (true, None, Some(_)) | (false, _, None) | (false, Some(_), Some(_)) => Vec::new(),
    }
}

async fn assigned_ip<C: CloudApi>(
    ctx: &Context<C>,
    server: &Server,
    family: IpFamily,
) -> Result<Option<AssignedIp>, ReconcileError> {
    let Some(assigned) = server.public_net.get(family) else {
        return Ok(None);
    };
    let api = ctx.api();
    let id = assigned.id;
    let details = ctx
        .call("read primary ip", move || api.get_primary_ip(id))
        .await?;
    Ok(Some(AssignedIp {
        id,
        auto_delete: details.is_some_and(|ip| ip.auto_delete),
    }))
}

async fn execute<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    steps: &[Step],
) -> Result<(), ReconcileError> {
    let api = ctx.api();
    for step in steps {
        match *step {
            Step::Unassign { id, delete } => {
                info!(server_id = %server_id, primary_ip = %id, delete, "releasing primary ip");
                ctx.perform_tolerating("unassign primary ip", ErrorKind::NotFound, move || {
                    api.unassign_primary_ip(id)
                })
                .await?;
                if delete {
                    match ctx
                        .call("delete primary ip", move || api.delete_primary_ip(id))
                        .await
                    {
                        Err(err) if !err.is(ErrorKind::NotFound) => return Err(err),
                        _ => {}
                    }
                }
            }
            Step::Assign(id) => {
                info!(server_id = %server_id, primary_ip = %id, "assigning primary ip");
                ctx.perform("assign primary ip", move || {
                    api.assign_primary_ip(id, server_id)
                })
                .await?;
            }
            Step::Allocate(family) => {
                info!(server_id = %server_id, %family, "allocating primary ip");
                let opts = PrimaryIpCreateOpts {
                    name: format!("primary-ip-{}", Uuid::new_v4().simple()),
                    family,
                    assignee: Some(server_id),
                    auto_delete: true,
                };
                let opts_ref = &opts;
                let created = ctx
                    .call("create primary ip", move || api.create_primary_ip(opts_ref))
                    .await?;
                if let Some(action) = &created.action {
                    ctx.wait("create primary ip", action).await?;
                }
            }
        }
    }
    Ok(())
}

/// Reconciles the primary IPs of a server.
pub(crate) async fn reconcile<C: CloudApi>(
    ctx: &Context<C>,
    server_id: ServerId,
    config: &PublicNetConfig,
) -> Result<(), ReconcileError> {
    config.validate()?;
    let server = ctx.require_server(server_id).await?;

    let mut steps = Vec::new();
    for family in FAMILIES {
        let current = assigned_ip(ctx, &server, family).await?;
        steps.extend(plan_family(family, config, current));
    }
    if steps.is_empty() {
        return Ok(());
    }

    let powered_off = ctx.power_off_if_running(&server).await?;
    let outcome = execute(ctx, server_id, &steps).await;
    ctx.restore_power(server_id, powered_off, outcome).await
}
