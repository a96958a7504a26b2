//! Test support utilities shared across unit and integration tests.
//!
//! [`FakeCloud`] is an in-memory [`CloudApi`] that enforces the provider's
//! ordering rules (powered-off servers for type, placement group and primary
//! IP changes; detached volumes for attach and delete) and records every call
//! so tests can assert on the exact plan a reconciler executed.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::env;
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::action::{Action, ActionFailure, ActionResource, ActionStatus, ActionWaiter};
use crate::api::{
    ApiError, ApiFuture, AssignedPrimaryIp, CloudApi, CreatedPrimaryIp, CreatedServer,
    CreatedVolume, ErrorKind, NetworkAttachOpts, PrimaryIp, PrimaryIpCreateOpts, ProtectionOpts,
    Server, ServerCreateOpts, ServerPrivateNet, ServerPublicNet, ServerStatus, ServerUpdateOpts,
    Volume, VolumeCreateOpts, VolumeUpdateOpts,
};
use crate::provider::Provider;
use crate::retry::RetryPolicy;
use crate::types::{
    ActionId, IpFamily, NetworkId, PlacementGroupId, PrimaryIpId, ServerId, VolumeId,
};

const FIRST_GENERATED_ID: u64 = 1000;

/// Call recorded by [`FakeCloud`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ApiCall {
    /// `get_action`.
    GetAction(ActionId),
    /// `get_server`.
    GetServer(ServerId),
    /// `create_server` with the requested name.
    CreateServer(String),
    /// `update_server`.
    UpdateServer(ServerId),
    /// `delete_server`.
    DeleteServer(ServerId),
    /// `power_on`.
    PowerOn(ServerId),
    /// `power_off`.
    PowerOff(ServerId),
    /// `change_server_type` with the new type.
    ChangeServerType(ServerId, String),
    /// `attach_to_network`.
    AttachToNetwork {
        /// Server being attached.
        server: ServerId,
        /// Target network.
        network: NetworkId,
        /// Requested fixed IP.
        ip: Option<IpAddr>,
        /// Requested alias IPs.
        alias_ips: Vec<IpAddr>,
    },
    /// `detach_from_network`.
    DetachFromNetwork {
        /// Server being detached.
        server: ServerId,
        /// Network left.
        network: NetworkId,
    },
    /// `change_alias_ips`.
    ChangeAliasIps {
        /// Server whose membership changes.
        server: ServerId,
        /// Network of the membership.
        network: NetworkId,
        /// New alias IPs.
        alias_ips: Vec<IpAddr>,
    },
    /// `add_to_placement_group`.
    AddToPlacementGroup(ServerId, PlacementGroupId),
    /// `remove_from_placement_group`.
    RemoveFromPlacementGroup(ServerId),
    /// `enable_backup`.
    EnableBackup(ServerId),
    /// `disable_backup`.
    DisableBackup(ServerId),
    /// `change_server_protection`.
    ChangeServerProtection(ServerId, ProtectionOpts),
    /// `get_primary_ip`.
    GetPrimaryIp(PrimaryIpId),
    /// `create_primary_ip`.
    CreatePrimaryIp {
        /// Requested family.
        family: IpFamily,
        /// Requested assignee.
        assignee: Option<ServerId>,
    },
    /// `assign_primary_ip`.
    AssignPrimaryIp {
        /// Address being assigned.
        primary_ip: PrimaryIpId,
        /// Receiving server.
        server: ServerId,
    },
    /// `unassign_primary_ip`.
    UnassignPrimaryIp(PrimaryIpId),
    /// `delete_primary_ip`.
    DeletePrimaryIp(PrimaryIpId),
    /// `get_volume`.
    GetVolume(VolumeId),
    /// `create_volume` with the requested name.
    CreateVolume(String),
    /// `update_volume`.
    UpdateVolume(VolumeId),
    /// `resize_volume`.
    ResizeVolume(VolumeId, u32),
    /// `attach_volume`.
    AttachVolume {
        /// Volume being attached.
        volume: VolumeId,
        /// Receiving server.
        server: ServerId,
    },
    /// `detach_volume`.
    DetachVolume(VolumeId),
    /// `change_volume_protection`.
    ChangeVolumeProtection(VolumeId, bool),
    /// `delete_volume`.
    DeleteVolume(VolumeId),
}

/// Discriminant of [`ApiCall`], used to script failures.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CallKind {
    /// `get_action`.
    GetAction,
    /// `get_server`.
    GetServer,
    /// `create_server`.
    CreateServer,
    /// `update_server`.
    UpdateServer,
    /// `delete_server`.
    DeleteServer,
    /// `power_on`.
    PowerOn,
    /// `power_off`.
    PowerOff,
    /// `change_server_type`.
    ChangeServerType,
    /// `attach_to_network`.
    AttachToNetwork,
    /// `detach_from_network`.
    DetachFromNetwork,
    /// `change_alias_ips`.
    ChangeAliasIps,
    /// `add_to_placement_group`.
    AddToPlacementGroup,
    /// `remove_from_placement_group`.
    RemoveFromPlacementGroup,
    /// `enable_backup`.
    EnableBackup,
    /// `disable_backup`.
    DisableBackup,
    /// `change_server_protection`.
    ChangeServerProtection,
    /// `get_primary_ip`.
    GetPrimaryIp,
    /// `create_primary_ip`.
    CreatePrimaryIp,
    /// `assign_primary_ip`.
    AssignPrimaryIp,
    /// `unassign_primary_ip`.
    UnassignPrimaryIp,
    /// `delete_primary_ip`.
    DeletePrimaryIp,
    /// `get_volume`.
    GetVolume,
    /// `create_volume`.
    CreateVolume,
    /// `update_volume`.
    UpdateVolume,
    /// `resize_volume`.
    ResizeVolume,
    /// `attach_volume`.
    AttachVolume,
    /// `detach_volume`.
    DetachVolume,
    /// `change_volume_protection`.
    ChangeVolumeProtection,
    /// `delete_volume`.
    DeleteVolume,
}

impl ApiCall {
    /// Returns the discriminant of this call.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        match self {
            Self::GetAction(_) => CallKind::GetAction,
            Self::GetServer(_) => CallKind::GetServer,
            Self::CreateServer(_) => CallKind::CreateServer,
            Self::UpdateServer(_) => CallKind::UpdateServer,
            Self::DeleteServer(_) => CallKind::DeleteServer,
            Self::PowerOn(_) => CallKind::PowerOn,
            Self::PowerOff(_) => CallKind::PowerOff,
            Self::ChangeServerType(..) => CallKind::ChangeServerType,
            Self::AttachToNetwork { .. } => CallKind::AttachToNetwork,
            Self::DetachFromNetwork { .. } => CallKind::DetachFromNetwork,
            Self::ChangeAliasIps { .. } => CallKind::ChangeAliasIps,
            Self::AddToPlacementGroup(..) => CallKind::AddToPlacementGroup,
            Self::RemoveFromPlacementGroup(_) => CallKind::RemoveFromPlacementGroup,
            Self::EnableBackup(_) => CallKind::EnableBackup,
            Self::DisableBackup(_) => CallKind::DisableBackup,
            Self::ChangeServerProtection(..) => CallKind::ChangeServerProtection,
            Self::GetPrimaryIp(_) => CallKind::GetPrimaryIp,
            Self::CreatePrimaryIp { .. } => CallKind::CreatePrimaryIp,
            Self::AssignPrimaryIp { .. } => CallKind::AssignPrimaryIp,
            Self::UnassignPrimaryIp(_) => CallKind::UnassignPrimaryIp,
            Self::DeletePrimaryIp(_) => CallKind::DeletePrimaryIp,
            Self::GetVolume(_) => CallKind::GetVolume,
            Self::CreateVolume(_) => CallKind::CreateVolume,
            Self::UpdateVolume(_) => CallKind::UpdateVolume,
            Self::ResizeVolume(..) => CallKind::ResizeVolume,
            Self::AttachVolume { .. } => CallKind::AttachVolume,
            Self::DetachVolume(_) => CallKind::DetachVolume,
            Self::ChangeVolumeProtection(..) => CallKind::ChangeVolumeProtection,
            Self::DeleteVolume(_) => CallKind::DeleteVolume,
        }
    }

    /// Returns whether the call changes remote state.
    #[must_use]
    pub const fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::GetAction(_) | Self::GetServer(_) | Self::GetPrimaryIp(_) | Self::GetVolume(_)
        )
    }
}

#[derive(Clone, Debug)]
struct ScriptedAction {
    action: Action,
    polls_left: u32,
}

#[derive(Debug)]
struct FakeState {
    next_id: u64,
    servers: BTreeMap<ServerId, Server>,
    primary_ips: BTreeMap<PrimaryIpId, PrimaryIp>,
    volumes: BTreeMap<VolumeId, Volume>,
    actions: BTreeMap<ActionId, ScriptedAction>,
    calls: Vec<ApiCall>,
    failures: HashMap<CallKind, VecDeque<ApiError>>,
    action_failures: HashMap<CallKind, VecDeque<ActionFailure>>,
    action_polls: u32,
}

impl Default for FakeState {
    fn default() -> Self {
        Self {
            next_id: FIRST_GENERATED_ID,
            servers: BTreeMap::new(),
            primary_ips: BTreeMap::new(),
            volumes: BTreeMap::new(),
            actions: BTreeMap::new(),
            calls: Vec::new(),
            failures: HashMap::new(),
            action_failures: HashMap::new(),
            action_polls: 0,
        }
    }
}

/// Outcome of the bookkeeping done before a mutating call takes effect.
enum Gate {
    Proceed,
    Failed(ApiError),
    ActionFails(Action),
}

impl FakeState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn record(&mut self, call: ApiCall) -> Option<ApiError> {
        let kind = call.kind();
        self.calls.push(call);
        self.failures.get_mut(&kind).and_then(VecDeque::pop_front)
    }

    fn gate(&mut self, call: ApiCall, resources: &[(&str, u64)]) -> Gate {
        let kind = call.kind();
        if let Some(err) = self.record(call) {
            return Gate::Failed(err);
        }
        let scripted = self.scripted_failure(kind);
        match scripted {
            Some(failure) => Gate::ActionFails(self.new_action(kind, resources, Some(failure))),
            None => Gate::Proceed,
        }
    }

    fn scripted_failure(&mut self, kind: CallKind) -> Option<ActionFailure> {
        self.action_failures
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
    }

    fn new_action(
        &mut self,
        kind: CallKind,
        resources: &[(&str, u64)],
        failure: Option<ActionFailure>,
    ) -> Action {
        let id = ActionId::new(self.allocate_id());
        let status = if failure.is_some() {
            ActionStatus::Error
        } else {
            ActionStatus::Success
        };
        let action = Action {
            id,
            command: command_name(kind),
            status,
            progress: 100,
            resources: resources
                .iter()
                .map(|(resource_kind, resource_id)| ActionResource {
                    id: *resource_id,
                    kind: (*resource_kind).to_owned(),
                })
                .collect(),
            error: failure,
        };
        self.actions.insert(
            id,
            ScriptedAction {
                action: action.clone(),
                polls_left: self.action_polls,
            },
        );
        if self.action_polls == 0 {
            action
        } else {
            Action {
                status: ActionStatus::Running,
                progress: 0,
                error: None,
                ..action
            }
        }
    }

    fn server_mut(&mut self, id: ServerId) -> Result<&mut Server, ApiError> {
        self.servers
            .get_mut(&id)
            .ok_or_else(|| not_found("server", id.get()))
    }

    fn stopped_server_mut(&mut self, id: ServerId) -> Result<&mut Server, ApiError> {
        let server = self.server_mut(id)?;
        if server.status == ServerStatus::Off {
            Ok(server)
        } else {
            Err(ApiError::new(
                "server_not_stopped",
                format!("server {id} must be powered off"),
            ))
        }
    }

    fn volume_mut(&mut self, id: VolumeId) -> Result<&mut Volume, ApiError> {
        self.volumes
            .get_mut(&id)
            .ok_or_else(|| not_found("volume", id.get()))
    }

    fn join_network(&mut self, id: ServerId, opts: &NetworkAttachOpts) -> Result<(), ApiError> {
        let octet = u8::try_from(self.next_id & 0x7f).unwrap_or(0).saturating_add(2);
        let stored = self.server_mut(id)?;
        if stored.private_net_for(opts.network_id).is_some() {
            return Err(ApiError::new(
                "server_already_attached",
                format!("server {id} is already attached to {}", opts.network_id),
            ));
        }
        let ip = opts
            .ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::new(10, 0, 255, octet)));
        stored.private_net.push(ServerPrivateNet {
            network_id: opts.network_id,
            ip,
            alias_ips: opts.alias_ips.iter().copied().collect(),
            mac_address: format!("86:00:00:00:ff:{octet:02x}"),
        });
        Ok(())
    }

    fn generated_ip(&self, family: IpFamily) -> String {
        let octet = u8::try_from(self.next_id & 0x7f).unwrap_or(0).saturating_add(2);
        match family {
            IpFamily::Ipv4 => format!("203.0.113.{octet}"),
            IpFamily::Ipv6 => format!("2001:db8:{octet:x}::/64"),
        }
    }

    fn assign(&mut self, ip_id: PrimaryIpId, server_id: ServerId) -> Result<(), ApiError> {
        let ip = self
            .primary_ips
            .get(&ip_id)
            .cloned()
            .ok_or_else(|| not_found("primary_ip", ip_id.get()))?;
        if ip.assignee.is_some() {
            return Err(ApiError::new(
                "primary_ip_assigned",
                format!("primary ip {ip_id} is already assigned"),
            ));
        }
        let server = self.stopped_server_mut(server_id)?;
        let slot = match ip.family {
            IpFamily::Ipv4 => &mut server.public_net.ipv4,
            IpFamily::Ipv6 => &mut server.public_net.ipv6,
        };
        if slot.is_some() {
            return Err(ApiError::new(
                "primary_ip_version_mismatch",
                format!("server {server_id} already has a primary {}", ip.family),
            ));
        }
        *slot = Some(AssignedPrimaryIp {
            id: ip.id,
            ip: ip.ip.clone(),
        });
        if let Some(stored) = self.primary_ips.get_mut(&ip_id) {
            stored.assignee = Some(server_id);
        }
        Ok(())
    }

    fn unassign(&mut self, ip_id: PrimaryIpId) -> Result<(), ApiError> {
        let ip = self
            .primary_ips
            .get(&ip_id)
            .cloned()
            .ok_or_else(|| not_found("primary_ip", ip_id.get()))?;
        let Some(server_id) = ip.assignee else {
            return Ok(());
        };
        let server = self.stopped_server_mut(server_id)?;
        match ip.family {
            IpFamily::Ipv4 => server.public_net.ipv4 = None,
            IpFamily::Ipv6 => server.public_net.ipv6 = None,
        }
        if let Some(stored) = self.primary_ips.get_mut(&ip_id) {
            stored.assignee = None;
        }
        Ok(())
    }

    fn create_primary_ip(
        &mut self,
        name: String,
        family: IpFamily,
        auto_delete: bool,
    ) -> PrimaryIp {
        let id = PrimaryIpId::new(self.allocate_id());
        let ip = PrimaryIp {
            id,
            name,
            family,
            ip: self.generated_ip(family),
            assignee: None,
            auto_delete,
        };
        self.primary_ips.insert(id, ip.clone());
        ip
    }
}

fn not_found(resource: &str, id: u64) -> ApiError {
    ApiError::new("not_found", format!("{resource} {id} not found"))
}

fn command_name(kind: CallKind) -> String {
    let name = match kind {
        CallKind::CreateServer => "create_server",
        CallKind::DeleteServer => "delete_server",
        CallKind::PowerOn => "start_server",
        CallKind::PowerOff => "stop_server",
        CallKind::ChangeServerType => "change_server_type",
        CallKind::AttachToNetwork => "attach_to_network",
        CallKind::DetachFromNetwork => "detach_from_network",
        CallKind::ChangeAliasIps => "change_alias_ips",
        CallKind::AddToPlacementGroup => "add_to_placement_group",
        CallKind::RemoveFromPlacementGroup => "remove_from_placement_group",
        CallKind::EnableBackup => "enable_backup",
        CallKind::DisableBackup => "disable_backup",
        CallKind::ChangeServerProtection | CallKind::ChangeVolumeProtection => "change_protection",
        CallKind::CreatePrimaryIp | CallKind::AssignPrimaryIp => "assign_primary_ip",
        CallKind::UnassignPrimaryIp => "unassign_primary_ip",
        CallKind::CreateVolume => "create_volume",
        CallKind::ResizeVolume => "resize_volume",
        CallKind::AttachVolume => "attach_volume",
        CallKind::DetachVolume => "detach_volume",
        _ => "unknown",
    };
    name.to_owned()
}

/// In-memory [`CloudApi`] used by tests.
#[derive(Clone, Debug, Default)]
pub struct FakeCloud {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloud {
    /// Creates an empty fake.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a server snapshot, registering its primary IPs as well.
    pub fn insert_server(&self, server: Server) {
        let mut state = self.state();
        for (family, slot) in [
            (IpFamily::Ipv4, server.public_net.ipv4.as_ref()),
            (IpFamily::Ipv6, server.public_net.ipv6.as_ref()),
        ] {
            if let Some(assigned) = slot {
                state.primary_ips.entry(assigned.id).or_insert_with(|| PrimaryIp {
                    id: assigned.id,
                    name: format!("primary-ip-{}", assigned.id),
                    family,
                    ip: assigned.ip.clone(),
                    assignee: Some(server.id),
                    auto_delete: false,
                });
            }
        }
        state.servers.insert(server.id, server);
    }

    /// Stores a primary IP snapshot, updating its assignee's public net.
    pub fn insert_primary_ip(&self, primary_ip: PrimaryIp) {
        let mut state = self.state();
        if let Some(server) = primary_ip
            .assignee
            .and_then(|id| state.servers.get_mut(&id))
        {
            let assigned = Some(AssignedPrimaryIp {
                id: primary_ip.id,
                ip: primary_ip.ip.clone(),
            });
            match primary_ip.family {
                IpFamily::Ipv4 => server.public_net.ipv4 = assigned,
                IpFamily::Ipv6 => server.public_net.ipv6 = assigned,
            }
        }
        state.primary_ips.insert(primary_ip.id, primary_ip);
    }

    /// Stores a volume snapshot.
    pub fn insert_volume(&self, volume: Volume) {
        let mut state = self.state();
        if let Some(server) = volume.server.and_then(|id| state.servers.get_mut(&id)) {
            server.volumes.push(volume.id);
        }
        state.volumes.insert(volume.id, volume);
    }

    /// Stores an action that reports `running` for `polls` polls before
    /// settling on its own status.
    pub fn insert_action(&self, action: Action, polls: u32) {
        self.state().actions.insert(
            action.id,
            ScriptedAction {
                action,
                polls_left: polls,
            },
        );
    }

    /// Makes every action created from now on report `running` for `polls`
    /// polls before finishing.
    pub fn set_action_polls(&self, polls: u32) {
        self.state().action_polls = polls;
    }

    /// Makes the next call of `kind` fail with `error`.
    pub fn fail_next(&self, kind: CallKind, error: ApiError) {
        self.state()
            .failures
            .entry(kind)
            .or_default()
            .push_back(error);
    }

    /// Makes the action returned by the next call of `kind` end in error.
    /// The call itself succeeds but has no effect.
    pub fn fail_next_action(&self, kind: CallKind, code: &str, message: &str) {
        self.state()
            .action_failures
            .entry(kind)
            .or_default()
            .push_back(ActionFailure {
                code: code.to_owned(),
                message: message.to_owned(),
            });
    }

    /// Returns the current snapshot of a server.
    #[must_use]
    pub fn server(&self, id: ServerId) -> Option<Server> {
        self.state().servers.get(&id).cloned()
    }

    /// Returns the current snapshot of a volume.
    #[must_use]
    pub fn volume(&self, id: VolumeId) -> Option<Volume> {
        self.state().volumes.get(&id).cloned()
    }

    /// Returns the current snapshot of a primary IP.
    #[must_use]
    pub fn primary_ip(&self, id: PrimaryIpId) -> Option<PrimaryIp> {
        self.state().primary_ips.get(&id).cloned()
    }

    /// Returns every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.state().calls.clone()
    }

    /// Returns the state-changing calls recorded so far.
    #[must_use]
    pub fn mutations(&self) -> Vec<ApiCall> {
        self.state()
            .calls
            .iter()
            .filter(|call| call.is_mutation())
            .cloned()
            .collect()
    }

    /// Returns how many calls of `kind` were recorded.
    #[must_use]
    pub fn count(&self, kind: CallKind) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.kind() == kind)
            .count()
    }

    /// Forgets the recorded calls.
    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    fn server_action<F>(
        &self,
        call: ApiCall,
        id: ServerId,
        apply: F,
    ) -> Result<Action, ApiError>
    where
        F: FnOnce(&mut FakeState) -> Result<(), ApiError>,
    {
        let kind = call.kind();
        let mut state = self.state();
        match state.gate(call, &[("server", id.get())]) {
            Gate::Failed(err) => Err(err),
            Gate::ActionFails(action) => Ok(action),
            Gate::Proceed => {
                apply(&mut state)?;
                Ok(state.new_action(kind, &[("server", id.get())], None))
            }
        }
    }

    fn volume_action<F>(
        &self,
        call: ApiCall,
        id: VolumeId,
        apply: F,
    ) -> Result<Action, ApiError>
    where
        F: FnOnce(&mut FakeState) -> Result<(), ApiError>,
    {
        let kind = call.kind();
        let mut state = self.state();
        match state.gate(call, &[("volume", id.get())]) {
            Gate::Failed(err) => Err(err),
            Gate::ActionFails(action) => Ok(action),
            Gate::Proceed => {
                apply(&mut state)?;
                Ok(state.new_action(kind, &[("volume", id.get())], None))
            }
        }
    }
}

/// Builds a provider around `api` that retries three times without sleeping
/// and polls actions without delay.
#[must_use]
pub fn provider(api: &FakeCloud) -> Provider<FakeCloud> {
    Provider::with_policies(
        Arc::new(api.clone()),
        RetryPolicy::immediate(3),
        ActionWaiter::new(Duration::ZERO, Duration::from_secs(5)),
    )
}

/// Builds a running server snapshot with no networks attached.
#[must_use]
pub fn server(id: u64, name: &str) -> Server {
    Server {
        id: ServerId::new(id),
        name: name.to_owned(),
        status: ServerStatus::Running,
        server_type: String::from("cx22"),
        image: Some(String::from("ubuntu-24.04")),
        location: String::from("fsn1"),
        labels: BTreeMap::new(),
        public_net: ServerPublicNet::default(),
        private_net: Vec::new(),
        placement_group: None,
        backups_enabled: false,
        delete_protection: false,
        rebuild_protection: false,
        volumes: Vec::new(),
    }
}

/// Builds a private network membership.
///
/// # Panics
///
/// Panics when `ip` is not a valid address.
#[must_use]
pub fn private_net(network: u64, ip: &str, alias_ips: &[&str]) -> ServerPrivateNet {
    ServerPrivateNet {
        network_id: NetworkId::new(network),
        ip: parse_ip(ip),
        alias_ips: alias_ips.iter().map(|alias| parse_ip(alias)).collect(),
        mac_address: format!("86:00:00:00:00:{:02x}", network & 0xff),
    }
}

/// Builds a primary IP snapshot.
#[must_use]
pub fn primary_ip(
    id: u64,
    family: IpFamily,
    assignee: Option<u64>,
    auto_delete: bool,
) -> PrimaryIp {
    PrimaryIp {
        id: PrimaryIpId::new(id),
        name: format!("primary-ip-{id}"),
        family,
        ip: match family {
            IpFamily::Ipv4 => format!("198.51.100.{}", id & 0xff),
            IpFamily::Ipv6 => format!("2001:db8:{id:x}::/64"),
        },
        assignee: assignee.map(ServerId::new),
        auto_delete,
    }
}

/// Builds a detached volume snapshot.
#[must_use]
pub fn volume(id: u64, name: &str, server: Option<u64>) -> Volume {
    Volume {
        id: VolumeId::new(id),
        name: name.to_owned(),
        size_gb: 10,
        location: String::from("fsn1"),
        server: server.map(ServerId::new),
        linux_device: format!("/dev/disk/by-id/scsi-0HC_Volume_{id}"),
        format: None,
        labels: BTreeMap::new(),
        delete_protection: false,
    }
}

/// Builds an action snapshot with the given status.
#[must_use]
pub fn action(id: u64, command: &str, status: ActionStatus) -> Action {
    let error = (status == ActionStatus::Error).then(|| ActionFailure {
        code: String::from("action_failed"),
        message: format!("{command} failed"),
    });
    Action {
        id: ActionId::new(id),
        command: command.to_owned(),
        status,
        progress: if status == ActionStatus::Running { 0 } else { 100 },
        resources: Vec::new(),
        error,
    }
}

/// Parses an address literal used in test fixtures.
///
/// # Panics
///
/// Panics when `value` is not a valid address.
#[must_use]
pub fn parse_ip(value: &str) -> IpAddr {
    value
        .parse()
        .unwrap_or_else(|err| panic!("invalid fixture address {value}: {err}"))
}

impl CloudApi for FakeCloud {
    fn get_action(&self, id: ActionId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::GetAction(id)) {
                return Err(err);
            }
            let scripted = state
                .actions
                .get_mut(&id)
                .ok_or_else(|| not_found("action", id.get()))?;
            if scripted.polls_left > 0 {
                scripted.polls_left -= 1;
                return Ok(Action {
                    status: ActionStatus::Running,
                    progress: 50,
                    error: None,
                    ..scripted.action.clone()
                });
            }
            Ok(scripted.action.clone())
        })
    }

    fn get_server(&self, id: ServerId) -> ApiFuture<'_, Option<Server>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::GetServer(id)) {
                return Err(err);
            }
            Ok(state.servers.get(&id).cloned())
        })
    }

    fn create_server<'a>(&'a self, opts: &'a ServerCreateOpts) -> ApiFuture<'a, CreatedServer> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::CreateServer(opts.name.clone())) {
                return Err(err);
            }
            let public = opts.public_net.enable_ipv4 || opts.public_net.enable_ipv6;
            if !public && opts.networks.is_empty() {
                return Err(ApiError::new(
                    "invalid_input",
                    "a server needs a public address or a private network",
                ));
            }
            let id = ServerId::new(state.allocate_id());
            let mut created = server(id.get(), &opts.name);
            created.server_type.clone_from(&opts.server_type);
            created.image = Some(opts.image.clone());
            if let Some(location) = &opts.location {
                created.location.clone_from(location);
            }
            created.labels.clone_from(&opts.labels);
            created.placement_group = opts.placement_group;
            created.status = ServerStatus::Off;
            state.servers.insert(id, created);
            for network in &opts.networks {
                state.join_network(id, network)?;
            }

            for (family, enabled, explicit) in [
                (IpFamily::Ipv4, opts.public_net.enable_ipv4, opts.public_net.ipv4),
                (IpFamily::Ipv6, opts.public_net.enable_ipv6, opts.public_net.ipv6),
            ] {
                if !enabled {
                    continue;
                }
                let ip_id = match explicit {
                    Some(ip_id) => ip_id,
                    None => state
                        .create_primary_ip(format!("server-{id}-{family}"), family, true)
                        .id,
                };
                state.assign(ip_id, id)?;
            }

            let action = state.new_action(CallKind::CreateServer, &[("server", id.get())], None);
            let mut next_actions = Vec::new();
            if opts.start_after_create {
                let failure = state.scripted_failure(CallKind::PowerOn);
                if failure.is_none() {
                    state.server_mut(id)?.status = ServerStatus::Running;
                }
                next_actions.push(state.new_action(
                    CallKind::PowerOn,
                    &[("server", id.get())],
                    failure,
                ));
            }
            let snapshot = state.server_mut(id)?.clone();
            Ok(CreatedServer {
                server: snapshot,
                action,
                next_actions,
            })
        })
    }

    fn update_server<'a>(
        &'a self,
        id: ServerId,
        opts: &'a ServerUpdateOpts,
    ) -> ApiFuture<'a, Server> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::UpdateServer(id)) {
                return Err(err);
            }
            let stored = state.server_mut(id)?;
            stored.name.clone_from(&opts.name);
            stored.labels.clone_from(&opts.labels);
            Ok(stored.clone())
        })
    }

    fn delete_server(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::DeleteServer(id), id, |state| {
                let removed = state
                    .servers
                    .remove(&id)
                    .ok_or_else(|| not_found("server", id.get()))?;
                if removed.delete_protection {
                    state.servers.insert(id, removed);
                    return Err(ApiError::new("protected", "server is delete protected"));
                }
                state.primary_ips.retain(|_, ip| {
                    !(ip.assignee == Some(id) && ip.auto_delete)
                });
                for ip in state.primary_ips.values_mut() {
                    if ip.assignee == Some(id) {
                        ip.assignee = None;
                    }
                }
                for volume in state.volumes.values_mut() {
                    if volume.server == Some(id) {
                        volume.server = None;
                    }
                }
                Ok(())
            })
        })
    }

    fn power_on(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::PowerOn(id), id, |state| {
                state.server_mut(id)?.status = ServerStatus::Running;
                Ok(())
            })
        })
    }

    fn power_off(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::PowerOff(id), id, |state| {
                state.server_mut(id)?.status = ServerStatus::Off;
                Ok(())
            })
        })
    }

    fn change_server_type<'a>(
        &'a self,
        id: ServerId,
        server_type: &'a str,
        _upgrade_disk: bool,
    ) -> ApiFuture<'a, Action> {
        Box::pin(async move {
            let call = ApiCall::ChangeServerType(id, server_type.to_owned());
            self.server_action(call, id, |state| {
                state.stopped_server_mut(id)?.server_type = server_type.to_owned();
                Ok(())
            })
        })
    }

    fn attach_to_network<'a>(
        &'a self,
        id: ServerId,
        opts: &'a NetworkAttachOpts,
    ) -> ApiFuture<'a, Action> {
        Box::pin(async move {
            let call = ApiCall::AttachToNetwork {
                server: id,
                network: opts.network_id,
                ip: opts.ip,
                alias_ips: opts.alias_ips.clone(),
            };
            self.server_action(call, id, |state| state.join_network(id, opts))
        })
    }

    fn detach_from_network(&self, id: ServerId, network_id: NetworkId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let call = ApiCall::DetachFromNetwork {
                server: id,
                network: network_id,
            };
            self.server_action(call, id, |state| {
                let stored = state.server_mut(id)?;
                let before = stored.private_net.len();
                stored.private_net.retain(|net| net.network_id != network_id);
                if stored.private_net.len() == before {
                    return Err(not_found("network attachment", network_id.get()));
                }
                Ok(())
            })
        })
    }

    fn change_alias_ips<'a>(
        &'a self,
        id: ServerId,
        network_id: NetworkId,
        alias_ips: &'a [IpAddr],
    ) -> ApiFuture<'a, Action> {
        Box::pin(async move {
            let call = ApiCall::ChangeAliasIps {
                server: id,
                network: network_id,
                alias_ips: alias_ips.to_vec(),
            };
            self.server_action(call, id, |state| {
                let stored = state.server_mut(id)?;
                let net = stored
                    .private_net
                    .iter_mut()
                    .find(|net| net.network_id == network_id)
                    .ok_or_else(|| not_found("network attachment", network_id.get()))?;
                net.alias_ips = alias_ips.iter().copied().collect();
                Ok(())
            })
        })
    }

    fn add_to_placement_group(
        &self,
        id: ServerId,
        placement_group: PlacementGroupId,
    ) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let call = ApiCall::AddToPlacementGroup(id, placement_group);
            self.server_action(call, id, |state| {
                let stored = state.stopped_server_mut(id)?;
                if stored.placement_group.is_some() {
                    return Err(ApiError::new(
                        "server_already_in_placement_group",
                        format!("server {id} is already in a placement group"),
                    ));
                }
                stored.placement_group = Some(placement_group);
                Ok(())
            })
        })
    }

    fn remove_from_placement_group(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::RemoveFromPlacementGroup(id), id, |state| {
                state.stopped_server_mut(id)?.placement_group = None;
                Ok(())
            })
        })
    }

    fn enable_backup(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::EnableBackup(id), id, |state| {
                state.server_mut(id)?.backups_enabled = true;
                Ok(())
            })
        })
    }

    fn disable_backup(&self, id: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::DisableBackup(id), id, |state| {
                state.server_mut(id)?.backups_enabled = false;
                Ok(())
            })
        })
    }

    fn change_server_protection(
        &self,
        id: ServerId,
        opts: ProtectionOpts,
    ) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.server_action(ApiCall::ChangeServerProtection(id, opts), id, |state| {
                let stored = state.server_mut(id)?;
                if let Some(delete) = opts.delete {
                    stored.delete_protection = delete;
                }
                if let Some(rebuild) = opts.rebuild {
                    stored.rebuild_protection = rebuild;
                }
                Ok(())
            })
        })
    }

    fn get_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, Option<PrimaryIp>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::GetPrimaryIp(id)) {
                return Err(err);
            }
            Ok(state.primary_ips.get(&id).cloned())
        })
    }

    fn create_primary_ip<'a>(
        &'a self,
        opts: &'a PrimaryIpCreateOpts,
    ) -> ApiFuture<'a, CreatedPrimaryIp> {
        Box::pin(async move {
            let mut state = self.state();
            let call = ApiCall::CreatePrimaryIp {
                family: opts.family,
                assignee: opts.assignee,
            };
            if let Some(err) = state.record(call) {
                return Err(err);
            }
            if let Some(server_id) = opts.assignee {
                state.stopped_server_mut(server_id)?;
            }
            let created = state.create_primary_ip(opts.name.clone(), opts.family, opts.auto_delete);
            let Some(server_id) = opts.assignee else {
                return Ok(CreatedPrimaryIp {
                    primary_ip: created,
                    action: None,
                });
            };
            state.assign(created.id, server_id)?;
            let action = state.new_action(
                CallKind::CreatePrimaryIp,
                &[("primary_ip", created.id.get()), ("server", server_id.get())],
                None,
            );
            let primary_ip = state
                .primary_ips
                .get(&created.id)
                .cloned()
                .unwrap_or(created);
            Ok(CreatedPrimaryIp {
                primary_ip,
                action: Some(action),
            })
        })
    }

    fn assign_primary_ip(&self, id: PrimaryIpId, server: ServerId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let mut state = self.state();
            let call = ApiCall::AssignPrimaryIp {
                primary_ip: id,
                server,
            };
            let resources = [("primary_ip", id.get()), ("server", server.get())];
            match state.gate(call, &resources) {
                Gate::Failed(err) => Err(err),
                Gate::ActionFails(action) => Ok(action),
                Gate::Proceed => {
                    state.assign(id, server)?;
                    Ok(state.new_action(CallKind::AssignPrimaryIp, &resources, None))
                }
            }
        })
    }

    fn unassign_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let mut state = self.state();
            let resources = [("primary_ip", id.get())];
            match state.gate(ApiCall::UnassignPrimaryIp(id), &resources) {
                Gate::Failed(err) => Err(err),
                Gate::ActionFails(action) => Ok(action),
                Gate::Proceed => {
                    state.unassign(id)?;
                    Ok(state.new_action(CallKind::UnassignPrimaryIp, &resources, None))
                }
            }
        })
    }

    fn delete_primary_ip(&self, id: PrimaryIpId) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::DeletePrimaryIp(id)) {
                return Err(err);
            }
            let ip = state
                .primary_ips
                .get(&id)
                .ok_or_else(|| not_found("primary_ip", id.get()))?;
            if ip.assignee.is_some() {
                return Err(ApiError::new(
                    "primary_ip_assigned",
                    format!("primary ip {id} is still assigned"),
                ));
            }
            state.primary_ips.remove(&id);
            Ok(())
        })
    }

    fn get_volume(&self, id: VolumeId) -> ApiFuture<'_, Option<Volume>> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::GetVolume(id)) {
                return Err(err);
            }
            Ok(state.volumes.get(&id).cloned())
        })
    }

    fn create_volume<'a>(&'a self, opts: &'a VolumeCreateOpts) -> ApiFuture<'a, CreatedVolume> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::CreateVolume(opts.name.clone())) {
                return Err(err);
            }
            if let Some(server_id) = opts.server {
                state.server_mut(server_id)?;
            }
            let id = VolumeId::new(state.allocate_id());
            let mut created = volume(id.get(), &opts.name, None);
            created.size_gb = opts.size_gb;
            created.format.clone_from(&opts.format);
            created.labels.clone_from(&opts.labels);
            if let Some(location) = &opts.location {
                created.location.clone_from(location);
            }
            state.volumes.insert(id, created);
            let action = state.new_action(CallKind::CreateVolume, &[("volume", id.get())], None);

            let mut next_actions = Vec::new();
            if let Some(server_id) = opts.server {
                let resources = [("volume", id.get()), ("server", server_id.get())];
                let scripted = state.scripted_failure(CallKind::AttachVolume);
                let attach = match scripted {
                    Some(failure) => {
                        state.new_action(CallKind::AttachVolume, &resources, Some(failure))
                    }
                    None => {
                        state.volume_mut(id)?.server = Some(server_id);
                        state.server_mut(server_id)?.volumes.push(id);
                        state.new_action(CallKind::AttachVolume, &resources, None)
                    }
                };
                next_actions.push(attach);
            }
            let snapshot = state.volume_mut(id)?.clone();
            Ok(CreatedVolume {
                volume: snapshot,
                action: Some(action),
                next_actions,
            })
        })
    }

    fn update_volume<'a>(
        &'a self,
        id: VolumeId,
        opts: &'a VolumeUpdateOpts,
    ) -> ApiFuture<'a, Volume> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::UpdateVolume(id)) {
                return Err(err);
            }
            let stored = state.volume_mut(id)?;
            stored.name.clone_from(&opts.name);
            stored.labels.clone_from(&opts.labels);
            Ok(stored.clone())
        })
    }

    fn resize_volume(&self, id: VolumeId, size_gb: u32) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.volume_action(ApiCall::ResizeVolume(id, size_gb), id, |state| {
                let stored = state.volume_mut(id)?;
                if size_gb < stored.size_gb {
                    return Err(ApiError::of_kind(
                        ErrorKind::InvalidInput,
                        "volumes cannot shrink",
                    ));
                }
                stored.size_gb = size_gb;
                Ok(())
            })
        })
    }

    fn attach_volume(
        &self,
        id: VolumeId,
        server: ServerId,
        _automount: bool,
    ) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            let call = ApiCall::AttachVolume { volume: id, server };
            self.volume_action(call, id, |state| {
                state.server_mut(server)?;
                let stored = state.volume_mut(id)?;
                if let Some(current) = stored.server {
                    return Err(ApiError::new(
                        "volume_already_attached",
                        format!("volume {id} is attached to server {current}"),
                    ));
                }
                stored.server = Some(server);
                state.server_mut(server)?.volumes.push(id);
                Ok(())
            })
        })
    }

    fn detach_volume(&self, id: VolumeId) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.volume_action(ApiCall::DetachVolume(id), id, |state| {
                let previous = state.volume_mut(id)?.server.take();
                if let Some(server) = previous.and_then(|sid| state.servers.get_mut(&sid)) {
                    server.volumes.retain(|attached| *attached != id);
                }
                Ok(())
            })
        })
    }

    fn change_volume_protection(&self, id: VolumeId, delete: bool) -> ApiFuture<'_, Action> {
        Box::pin(async move {
            self.volume_action(ApiCall::ChangeVolumeProtection(id, delete), id, |state| {
                state.volume_mut(id)?.delete_protection = delete;
                Ok(())
            })
        })
    }

    fn delete_volume(&self, id: VolumeId) -> ApiFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state();
            if let Some(err) = state.record(ApiCall::DeleteVolume(id)) {
                return Err(err);
            }
            let stored = state.volume_mut(id)?;
            if stored.server.is_some() {
                return Err(ApiError::new("volume_attached", "volume is still attached"));
            }
            if stored.delete_protection {
                return Err(ApiError::new("protected", "volume is delete protected"));
            }
            state.volumes.remove(&id);
            Ok(())
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
