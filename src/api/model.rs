//! Resource snapshots and request payloads exchanged with the API client.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::action::Action;
use crate::types::{IpFamily, NetworkId, PlacementGroupId, PrimaryIpId, ServerId, VolumeId};

/// Power and lifecycle status reported for a server.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// The server is being provisioned.
    Initializing,
    /// The server is booting.
    Starting,
    /// The server is running.
    Running,
    /// The server is shutting down.
    Stopping,
    /// The server is powered off.
    Off,
    /// The server is being deleted.
    Deleting,
    /// The server is being migrated.
    Migrating,
    /// The server is being rebuilt.
    Rebuilding,
    /// Status not known to this crate.
    #[serde(other)]
    Unknown,
}

impl ServerStatus {
    /// Returns whether the server is up or on its way up.
    #[must_use]
    pub const fn is_powered_on(self) -> bool {
        matches!(self, Self::Running | Self::Starting | Self::Initializing)
    }
}

/// Primary IP currently assigned to a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct AssignedPrimaryIp {
    /// Primary IP identifier.
    pub id: PrimaryIpId,
    /// Address (IPv4) or network (IPv6) in textual form.
    pub ip: String,
}

/// Public network facet of a server snapshot.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerPublicNet {
    /// Assigned IPv4 primary IP, if any.
    pub ipv4: Option<AssignedPrimaryIp>,
    /// Assigned IPv6 primary IP, if any.
    pub ipv6: Option<AssignedPrimaryIp>,
}

impl ServerPublicNet {
    /// Returns the primary IP assigned for the given family.
    #[must_use]
    pub const fn get(&self, family: IpFamily) -> Option<&AssignedPrimaryIp> {
        match family {
            IpFamily::Ipv4 => self.ipv4.as_ref(),
            IpFamily::Ipv6 => self.ipv6.as_ref(),
        }
    }
}

/// Membership of a server in a private network.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServerPrivateNet {
    /// Network the server is attached to.
    pub network_id: NetworkId,
    /// Primary address inside the network.
    pub ip: IpAddr,
    /// Additional addresses routed to the server.
    pub alias_ips: BTreeSet<IpAddr>,
    /// MAC address of the private interface.
    pub mac_address: String,
}

/// Authoritative snapshot of a server.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Server {
    /// Server identifier.
    pub id: ServerId,
    /// Server name.
    pub name: String,
    /// Current status.
    pub status: ServerStatus,
    /// Server type name (for example `cx22`).
    pub server_type: String,
    /// Image the server was created from, if still known.
    pub image: Option<String>,
    /// Location name.
    pub location: String,
    /// User labels.
    pub labels: BTreeMap<String, String>,
    /// Public network assignment.
    pub public_net: ServerPublicNet,
    /// Private network memberships.
    pub private_net: Vec<ServerPrivateNet>,
    /// Placement group membership.
    pub placement_group: Option<PlacementGroupId>,
    /// Whether backups are enabled.
    pub backups_enabled: bool,
    /// Whether delete protection is enabled.
    pub delete_protection: bool,
    /// Whether rebuild protection is enabled.
    pub rebuild_protection: bool,
    /// Volumes attached to the server.
    pub volumes: Vec<VolumeId>,
}

impl Server {
    /// Returns the membership for a network, if attached.
    #[must_use]
    pub fn private_net_for(&self, network_id: NetworkId) -> Option<&ServerPrivateNet> {
        self.private_net
            .iter()
            .find(|net| net.network_id == network_id)
    }
}

/// Authoritative snapshot of a primary IP.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct PrimaryIp {
    /// Primary IP identifier.
    pub id: PrimaryIpId,
    /// Primary IP name.
    pub name: String,
    /// Address family.
    pub family: IpFamily,
    /// Address or network in textual form.
    pub ip: String,
    /// Server the address is assigned to.
    pub assignee: Option<ServerId>,
    /// Whether the provider deletes the address together with its server.
    pub auto_delete: bool,
}

/// Authoritative snapshot of a block volume.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Volume identifier.
    pub id: VolumeId,
    /// Volume name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u32,
    /// Location name.
    pub location: String,
    /// Server the volume is attached to.
    pub server: Option<ServerId>,
    /// Device path on the attached server.
    pub linux_device: String,
    /// Filesystem the volume was formatted with, if any.
    pub format: Option<String>,
    /// User labels.
    pub labels: BTreeMap<String, String>,
    /// Whether delete protection is enabled.
    pub delete_protection: bool,
}

/// Public network options used at server creation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublicNetCreateOpts {
    /// Whether an IPv4 primary IP is wanted.
    pub enable_ipv4: bool,
    /// Whether an IPv6 primary IP is wanted.
    pub enable_ipv6: bool,
    /// Existing IPv4 primary IP to use.
    pub ipv4: Option<PrimaryIpId>,
    /// Existing IPv6 primary IP to use.
    pub ipv6: Option<PrimaryIpId>,
}

/// Request payload for creating a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerCreateOpts {
    /// Server name.
    pub name: String,
    /// Server type name.
    pub server_type: String,
    /// Image name or identifier.
    pub image: String,
    /// Location name; the provider picks one when absent.
    pub location: Option<String>,
    /// User labels.
    pub labels: BTreeMap<String, String>,
    /// Cloud-init user data.
    pub user_data: Option<String>,
    /// SSH key names or identifiers.
    pub ssh_keys: Vec<String>,
    /// Public network options.
    pub public_net: PublicNetCreateOpts,
    /// Private networks joined at creation.
    pub networks: Vec<NetworkAttachOpts>,
    /// Placement group to join at creation.
    pub placement_group: Option<PlacementGroupId>,
    /// Whether to boot the server once created.
    pub start_after_create: bool,
}

/// Result of a server creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedServer {
    /// Snapshot of the new server.
    pub server: Server,
    /// Action tracking the creation.
    pub action: Action,
    /// Follow-up actions (for example the initial power on).
    pub next_actions: Vec<Action>,
}

/// Request payload for updating mutable server attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerUpdateOpts {
    /// New name.
    pub name: String,
    /// New labels.
    pub labels: BTreeMap<String, String>,
}

/// Request payload for attaching a server to a network.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NetworkAttachOpts {
    /// Network to attach to.
    pub network_id: NetworkId,
    /// Fixed address; the provider allocates one when absent.
    pub ip: Option<IpAddr>,
    /// Alias addresses.
    pub alias_ips: Vec<IpAddr>,
}

/// Request payload for changing resource protection flags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProtectionOpts {
    /// Delete protection, unchanged when absent.
    pub delete: Option<bool>,
    /// Rebuild protection, unchanged when absent.
    pub rebuild: Option<bool>,
}

/// Request payload for creating a primary IP.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PrimaryIpCreateOpts {
    /// Primary IP name.
    pub name: String,
    /// Address family.
    pub family: IpFamily,
    /// Server to assign the address to on creation.
    pub assignee: Option<ServerId>,
    /// Whether the provider deletes the address together with its server.
    pub auto_delete: bool,
}

/// Result of a primary IP creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedPrimaryIp {
    /// Snapshot of the new primary IP.
    pub primary_ip: PrimaryIp,
    /// Action tracking the assignment, when an assignee was requested.
    pub action: Option<Action>,
}

/// Request payload for creating a volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeCreateOpts {
    /// Volume name.
    pub name: String,
    /// Size in gigabytes.
    pub size_gb: u32,
    /// Location; required when no server is given.
    pub location: Option<String>,
    /// Server to attach to after creation.
    pub server: Option<ServerId>,
    /// Whether the attached server mounts the volume automatically.
    pub automount: bool,
    /// Filesystem to format the volume with.
    pub format: Option<String>,
    /// User labels.
    pub labels: BTreeMap<String, String>,
}

/// Result of a volume creation call.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CreatedVolume {
    /// Snapshot of the new volume.
    pub volume: Volume,
    /// Action tracking the creation.
    pub action: Option<Action>,
    /// Follow-up actions (for example the attach to a server).
    pub next_actions: Vec<Action>,
}

/// Request payload for updating mutable volume attributes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeUpdateOpts {
    /// New name.
    pub name: String,
    /// New labels.
    pub labels: BTreeMap<String, String>,
}
