//! Core library for the spotdrive provisioning toolkit.
//!
//! spotdrive gives disposable — possibly spot — cloud compute nodes the
//! illusion of durable storage: a named drive is realised by at most one
//! block volume while in use and by its accumulated snapshots at rest,
//! surviving the termination of the node itself. The crate exposes the
//! drive lifecycle manager, the spot reclamation watchdog, the node
//! controller that ties them together, and the provider/remote-command
//! capability traits they are written against.

pub mod config;
pub mod directory;
pub mod drive;
pub mod ec2;
pub mod node;
pub mod provider;
pub mod remote;
pub mod test_support;
pub mod watchdog;
pub mod workload;

pub use config::{ConfigError, ToolkitConfig};
pub use directory::{Directory, Identified, Lookup, LookupError};
pub use drive::{DEFAULT_DEVICE, DEFAULT_MOUNT_PATH, Drive, DriveError, UnmountOutcome};
pub use ec2::{DEFAULT_AWS_BIN, Ec2Cli, Ec2Error};
pub use node::{NodeController, NodeError, NodeRequest};
pub use provider::{
    Attachment, Instance, InstanceState, LaunchSpec, MARKED_FOR_TERMINATION, Provider,
    ProviderFuture, Snapshot, SnapshotState, SpotRequest, Volume, VolumeSpec, VolumeState,
};
pub use remote::{
    CommandOutput, CommandRunner, ProcessCommandRunner, RemoteError, RemoteShell, SshConfig,
};
pub use watchdog::{
    SPOT_POLL_INTERVAL, SpotWatchdog, WatchdogError, WatchdogOutcome, WatchdogRegistry,
};
