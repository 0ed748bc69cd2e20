//! Resource model and the cloud provider capability trait.
//!
//! The toolkit never talks to the cloud directly; everything flows through
//! [`Provider`], which exposes the small set of describe/create/attach/tag
//! operations the drive manager, node controller, and spot watchdog need.
//! Resources carry their name tag as a plain field so callers branch on
//! typed data rather than raw tag lists.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

/// Status code reported on a spot request when the provider is about to
/// reclaim the capacity.
pub const MARKED_FOR_TERMINATION: &str = "marked-for-termination";

/// Lifecycle state of a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstanceState {
    /// Requested but not yet running.
    Pending,
    /// Running and billable.
    Running,
    /// Terminating.
    ShuttingDown,
    /// Gone for good.
    Terminated,
    /// Stop in progress.
    Stopping,
    /// Stopped but restartable.
    Stopped,
    /// A state this crate does not model explicitly.
    Other(String),
}

impl InstanceState {
    /// Parses the provider's state name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Lifecycle state of a block volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VolumeState {
    /// Being created.
    Creating,
    /// Detached and ready to attach.
    Available,
    /// Attached to an instance.
    InUse,
    /// Deletion in progress.
    Deleting,
    /// A state this crate does not model explicitly.
    Other(String),
}

impl VolumeState {
    /// Parses the provider's state name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "deleting" => Self::Deleting,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// Lifecycle state of a snapshot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotState {
    /// Copy still in progress.
    Pending,
    /// Durable and usable as a volume source.
    Completed,
    /// Provider-reported failure.
    Error,
    /// A state this crate does not model explicitly.
    Other(String),
}

impl SnapshotState {
    /// Parses the provider's state name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

/// A compute instance as the provider reports it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: String,
    /// Name tag, empty when untagged.
    pub name: String,
    /// Availability zone the instance was placed in.
    pub zone: String,
    /// Current lifecycle state.
    pub state: InstanceState,
    /// Public address, assigned asynchronously after launch.
    pub public_ip: Option<IpAddr>,
}

impl Instance {
    /// Returns `true` while the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == InstanceState::Running
    }
}

/// An attachment binding a volume to an instance at a device slot.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attachment {
    /// Instance the volume is attached to.
    pub instance_id: String,
    /// Guest device slot (for example `/dev/xvdf`).
    pub device: String,
}

/// A block volume as the provider reports it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Volume {
    /// Provider identifier.
    pub id: String,
    /// Name tag, empty when untagged.
    pub name: String,
    /// Availability zone the volume lives in.
    pub zone: String,
    /// Current lifecycle state.
    pub state: VolumeState,
    /// Capacity in GiB.
    pub size_gib: u32,
    /// Current attachment, if any.
    pub attachment: Option<Attachment>,
}

impl Volume {
    /// Returns `true` once the volume is detached and attachable.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.state == VolumeState::Available
    }
}

/// A snapshot as the provider reports it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Snapshot {
    /// Provider identifier.
    pub id: String,
    /// Name tag, empty when untagged.
    pub name: String,
    /// Volume the snapshot was taken from.
    pub volume_id: String,
    /// Current lifecycle state.
    pub state: SnapshotState,
    /// Provider timestamp in ISO-8601 form. The format is
    /// lexicographically order-preserving, so the maximum string is the
    /// newest snapshot.
    pub start_time: String,
}

impl Snapshot {
    /// Returns `true` once the provider reports the copy durable.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state == SnapshotState::Completed
    }
}

/// A spot capacity request and its fulfilment state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SpotRequest {
    /// Provider identifier for the request.
    pub id: String,
    /// Request state (`open`, `active`, `closed`, `cancelled`, `failed`).
    pub state: String,
    /// Fine-grained status code; see [`MARKED_FOR_TERMINATION`].
    pub status_code: String,
    /// Instance created to satisfy the request, once fulfilled.
    pub instance_id: Option<String>,
}

impl SpotRequest {
    /// Returns `true` when the provider has flagged the capacity for
    /// imminent reclamation.
    #[must_use]
    pub fn is_marked_for_termination(&self) -> bool {
        self.status_code == MARKED_FOR_TERMINATION
    }

    /// Returns `true` when the request can no longer yield an instance.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state.as_str(), "closed" | "cancelled" | "failed")
    }
}

/// Parameters for creating a block volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumeSpec {
    /// Availability zone to create the volume in. Must match the zone of
    /// the instance it will attach to.
    pub zone: String,
    /// Capacity in GiB; `None` inherits the snapshot's size.
    pub size_gib: Option<u32>,
    /// Snapshot to restore from; `None` creates a blank volume.
    pub snapshot_id: Option<String>,
    /// Provider volume type.
    pub volume_type: String,
}

/// Default provider volume type for data drives.
pub const DEFAULT_VOLUME_TYPE: &str = "gp2";

impl VolumeSpec {
    /// Spec for a volume restored from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot_id: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            zone: zone.into(),
            size_gib: None,
            snapshot_id: Some(snapshot_id.into()),
            volume_type: DEFAULT_VOLUME_TYPE.to_owned(),
        }
    }

    /// Spec for a blank volume of the given size.
    #[must_use]
    pub fn blank(zone: impl Into<String>, size_gib: u32) -> Self {
        Self {
            zone: zone.into(),
            size_gib: Some(size_gib),
            snapshot_id: None,
            volume_type: DEFAULT_VOLUME_TYPE.to_owned(),
        }
    }
}

/// Parameters for launching a compute instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchSpec {
    /// Machine image identifier.
    pub image_id: String,
    /// Provider instance type (for example `t2.micro`).
    pub instance_type: String,
    /// Key pair name for SSH access.
    pub key_name: String,
    /// Security group to place the instance in.
    pub security_group: String,
    /// Boot volume size override in GiB; `None` keeps the image default.
    pub boot_size_gib: Option<u32>,
}

/// Future returned by provider operations.
pub type ProviderFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Capability surface the toolkit requires from the cloud.
///
/// All lookups are by the `Name` tag convention; uniqueness is a
/// convention, not a provider guarantee, so `find_*` return every match
/// and callers classify the result. Describe operations return `None`
/// for resources the provider no longer knows, letting callers treat
/// "already gone" as success during deletion polls.
pub trait Provider {
    /// Provider specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// All non-terminated instances carrying the name tag.
    fn find_instances<'a>(&'a self, name: &'a str)
    -> ProviderFuture<'a, Vec<Instance>, Self::Error>;

    /// All volumes carrying the name tag.
    fn find_volumes<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<Volume>, Self::Error>;

    /// All snapshots owned by the caller carrying the name tag.
    fn find_snapshots<'a>(&'a self, name: &'a str)
    -> ProviderFuture<'a, Vec<Snapshot>, Self::Error>;

    /// Volumes currently attached to the given instance.
    fn volumes_attached_to<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, Self::Error>;

    /// Looks up one instance by id; `None` when unknown.
    fn describe_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error>;

    /// Looks up one volume by id; `None` when unknown.
    fn describe_volume<'a>(&'a self, id: &'a str)
    -> ProviderFuture<'a, Option<Volume>, Self::Error>;

    /// Looks up one snapshot by id; `None` when unknown.
    fn describe_snapshot<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Snapshot>, Self::Error>;

    /// Creates a volume, blank or from a snapshot.
    fn create_volume<'a>(
        &'a self,
        spec: &'a VolumeSpec,
    ) -> ProviderFuture<'a, Volume, Self::Error>;

    /// Attaches a volume to an instance at a device slot.
    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Force-detaches a volume from whatever holds it.
    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Deletes a volume. The volume must be detached.
    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Enlarges a volume to the given size.
    fn resize_volume<'a>(
        &'a self,
        volume_id: &'a str,
        size_gib: u32,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Starts a snapshot of a volume; completion is asynchronous.
    fn create_snapshot<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Snapshot, Self::Error>;

    /// Sets a tag on any resource.
    fn tag<'a>(
        &'a self,
        resource_id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error>;

    /// Launches an on-demand instance.
    fn run_instance<'a>(&'a self, spec: &'a LaunchSpec)
    -> ProviderFuture<'a, Instance, Self::Error>;

    /// Terminates an instance.
    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;

    /// Submits a spot request and returns its id.
    fn request_spot_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        price: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error>;

    /// Looks up a spot request; `None` when the provider does not know the
    /// id (which also happens transiently right after submission).
    fn describe_spot_request<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequest>, Self::Error>;

    /// Cancels a spot request.
    fn cancel_spot_request<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error>;
}
