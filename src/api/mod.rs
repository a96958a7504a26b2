//! Operation interface consumed from the remote API client.
//!
//! The reconcilers never talk HTTP themselves. An adapter around the
//! provider's client implements [`CloudApi`] and classifies failures into
//! [`ErrorKind`] once, at the boundary.

mod error;
mod model;

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use crate::action::Action;
use crate::types::{ActionId, NetworkId, PlacementGroupId, PrimaryIpId, ServerId, VolumeId};

pub use error::{ApiError, ErrorKind};
pub use model::{
    AssignedPrimaryIp, CreatedPrimaryIp, CreatedServer, CreatedVolume, NetworkAttachOpts,
    PrimaryIp, PrimaryIpCreateOpts, ProtectionOpts, PublicNetCreateOpts, Server, ServerCreateOpts,
    ServerPrivateNet, ServerPublicNet, ServerStatus, ServerUpdateOpts, Volume, VolumeCreateOpts,
    VolumeUpdateOpts,
};

/// Future returned by API client operations.
pub type ApiFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send + 'a>>;

/// Remote calls the reconcilers depend on.
///
/// Lookups (`get_*`) resolve to `Ok(None)` when the resource does not exist.
/// Mutating calls report a missing resource as [`ErrorKind::NotFound`].
pub trait CloudApi: Send + Sync {
    /// Fetches the current status of an action.
    fn get_action(&self, id: ActionId) -> ApiFuture<'_, Action>;

    /// Fetches a server.
    fn get_server(&self, id: ServerId) -> ApiFuture<'_, Option<Server>>;

    /// Creates a server.
    fn create_server<'a>(&'a self, opts: &'a ServerCreateOpts) -> ApiFuture<'a, CreatedServer>;

    /// Updates the name and labels of a server.
    fn update_server<'a>(
        &'a self,
        id: ServerId,
        opts: &'a ServerUpdateOpts,
    ) -> ApiFuture<'a, Server>;

    /// Deletes a server.
    fn delete_server(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Powers a server on.
    fn power_on(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Powers a server off.
    fn power_off(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Changes the type of a powered-off server.
    fn change_server_type<'a>(
        &'a self,
        id: ServerId,
        server_type: &'a str,
        upgrade_disk: bool,
    ) -> ApiFuture<'a, Action>;

    /// Attaches a server to a private network.
    fn attach_to_network<'a>(
        &'a self,
        id: ServerId,
        opts: &'a NetworkAttachOpts,
    ) -> ApiFuture<'a, Action>;

    /// Detaches a server from a private network.
    fn detach_from_network(&self, id: ServerId, network_id: NetworkId) -> ApiFuture<'_, Action>;

    /// Replaces the alias IPs of a network membership.
    fn change_alias_ips<'a>(
        &'a self,
        id: ServerId,
        network_id: NetworkId,
        alias_ips: &'a [IpAddr],
    ) -> ApiFuture<'a, Action>;

    /// Adds a powered-off server to a placement group.
    fn add_to_placement_group(
        &self,
        id: ServerId,
        placement_group: PlacementGroupId,
    ) -> ApiFuture<'_, Action>;

    /// Removes a powered-off server from its placement group.
    fn remove_from_placement_group(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Enables backups for a server.
    fn enable_backup(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Disables backups for a server.
    fn disable_backup(&self, id: ServerId) -> ApiFuture<'_, Action>;

    /// Changes delete and rebuild protection of a server.
    fn change_server_protection(
        &self,
        id: ServerId,
        opts: ProtectionOpts,
    ) -> ApiFuture<'_, Action>;

    /// Fetches a primary IP.
    fn get_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, Option<PrimaryIp>>;

    /// Creates a primary IP, optionally assigning it right away.
    fn create_primary_ip<'a>(
        &'a self,
        opts: &'a PrimaryIpCreateOpts,
    ) -> ApiFuture<'a, CreatedPrimaryIp>;

    /// Assigns a primary IP to a powered-off server.
    fn assign_primary_ip(&self, id: PrimaryIpId, server: ServerId) -> ApiFuture<'_, Action>;

    /// Unassigns a primary IP from its server.
    fn unassign_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, Action>;

    /// Deletes an unassigned primary IP.
    fn delete_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, ()>;

    /// Fetches a volume.
    fn get_volume(&self, id: VolumeId) -> ApiFuture<'_, Option<Volume>>;

    /// Creates a volume.
    fn create_volume<'a>(&'a self, opts: &'a VolumeCreateOpts) -> ApiFuture<'a, CreatedVolume>;

    /// Updates the name and labels of a volume.
    fn update_volume<'a>(
        &'a self,
        id: VolumeId,
        opts: &'a VolumeUpdateOpts,
    ) -> ApiFuture<'a, Volume>;

    /// Grows a volume.
    fn resize_volume(&self, id: VolumeId, size_gb: u32) -> ApiFuture<'_, Action>;

    /// Attaches a volume to a server.
    fn attach_volume(
        &self,
        id: VolumeId,
        server: ServerId,
        automount: bool,
    ) -> ApiFuture<'_, Action>;

    /// Detaches a volume from its server.
    fn detach_volume(&self, id: VolumeId) -> ApiFuture<'_, Action>;

    /// Changes delete protection of a volume.
    fn change_volume_protection(&self, id: VolumeId, delete: bool) -> ApiFuture<'_, Action>;

    /// Deletes a detached volume.
    fn delete_volume(&self, id: VolumeId) -> ApiFuture<'_, ()>;
}
