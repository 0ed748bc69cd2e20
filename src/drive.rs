//! Persistent drive lifecycle management.
//!
//! A drive is a name: while in use it is realised by exactly one block
//! volume, and at rest by the snapshots sharing that name tag. Nothing is
//! persisted locally; every operation reconstructs state by querying the
//! provider, which keeps the drive portable across compute nodes and
//! editable from the provider's own console.
//!
//! Two failure families are kept strictly apart. Configuration and
//! invariant violations (zone mismatch, a name resolving to nothing or to
//! several resources, a live volume where a snapshot lookup was expected)
//! fail immediately and are never retried. Provider state lag (a device
//! not yet visible after attach, a volume not yet available after detach,
//! deletion not yet confirmed) is polled indefinitely at a fixed interval
//! and is never an error.

use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::directory::{Directory, LookupError};
use crate::provider::{Instance, Provider, Snapshot, SnapshotState, Volume, VolumeSpec};
use crate::remote::{CommandRunner, RemoteError, RemoteShell};
use crate::workload;

/// Device slot the data volume always attaches at.
pub const DEFAULT_DEVICE: &str = "/dev/xvdf";

/// Mount point the data volume always mounts at.
pub const DEFAULT_MOUNT_PATH: &str = "/v1";

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// How an unmount attempt concluded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnmountOutcome {
    /// The clean unmount succeeded.
    Clean,
    /// Holders had to be killed before the mount released.
    Forced,
    /// Even the forced unmount failed; the disconnect flow continues.
    Failed,
}

/// Errors raised by drive operations.
#[derive(Debug, Error)]
pub enum DriveError<E>
where
    E: std::error::Error + 'static,
{
    /// A provider call failed.
    #[error("provider operation failed: {0}")]
    Provider(#[source] E),
    /// The remote command channel failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A name did not resolve to exactly one resource.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// The volume lives in a different availability zone than the target
    /// node; cross-zone attachment is impossible on the platform.
    #[error(
        "volume {volume_id} in {volume_zone} cannot attach to instance {instance_id} in {instance_zone}"
    )]
    ZoneMismatch {
        /// Volume that failed the check.
        volume_id: String,
        /// Zone the volume lives in.
        volume_zone: String,
        /// Instance the attach targeted.
        instance_id: String,
        /// Zone the instance lives in.
        instance_zone: String,
    },
    /// Neither a volume nor a snapshot carries the drive name; the drive
    /// has never existed and must be initialised deliberately.
    #[error("no volume or snapshot found for {name}")]
    NothingToAttach {
        /// Drive name that resolved to nothing.
        name: String,
    },
    /// A live volume carries the name, so asking for the restore source
    /// is a caller mistake.
    #[error("cannot resolve latest snapshot for {name}: volume {volume_id} is live")]
    VolumeExists {
        /// Drive name being resolved.
        name: String,
        /// The live volume.
        volume_id: String,
    },
    /// First-use initialisation was requested for a drive that already
    /// has history.
    #[error("drive {name} already has snapshot {snapshot_id}; connect instead of initialising")]
    AlreadyInitialised {
        /// Drive name being initialised.
        name: String,
        /// Newest existing snapshot.
        snapshot_id: String,
    },
    /// `mkfs` failed, which means no device was present to format.
    #[error("format failed on {device}: {stderr}")]
    FormatFailed {
        /// Device slot that was targeted.
        device: String,
        /// Stderr captured from `mkfs`.
        stderr: String,
    },
    /// The provider reported the snapshot copy failed.
    #[error("snapshot {snapshot_id} failed")]
    SnapshotFailed {
        /// Snapshot that failed.
        snapshot_id: String,
    },
    /// The node has no public address to reach it by.
    #[error("instance {instance_id} has no public address")]
    NoAddress {
        /// Instance missing an address.
        instance_id: String,
    },
    /// The volume is not attached to the node the operation targets.
    #[error("volume {volume_id} backing {name} is not attached to instance {instance_id}")]
    NotAttached {
        /// Drive name being operated on.
        name: String,
        /// Backing volume.
        volume_id: String,
        /// Instance the operation targeted.
        instance_id: String,
    },
    /// The drive must be mounted for the operation.
    #[error("drive {name} is not mounted at {mount_path}")]
    NotMounted {
        /// Drive name being operated on.
        name: String,
        /// Expected mount point.
        mount_path: String,
    },
    /// Volumes can only grow.
    #[error("cannot resize to {requested_gib} GiB: volume is already {current_gib} GiB")]
    ResizeTooSmall {
        /// Requested capacity.
        requested_gib: u32,
        /// Current capacity.
        current_gib: u32,
    },
}

/// Lifecycle manager for one named drive.
#[derive(Clone, Debug)]
pub struct Drive<P, R: CommandRunner> {
    name: String,
    provider: P,
    shell: RemoteShell<R>,
    device: String,
    mount_path: String,
    poll_interval: Duration,
    snapshot_poll_interval: Duration,
}

impl<P, R> Drive<P, R>
where
    P: Provider,
    R: CommandRunner,
{
    /// Creates a manager for the named drive.
    #[must_use]
    pub fn new(provider: P, shell: RemoteShell<R>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider,
            shell,
            device: String::from(DEFAULT_DEVICE),
            mount_path: String::from(DEFAULT_MOUNT_PATH),
            poll_interval: POLL_INTERVAL,
            snapshot_poll_interval: SNAPSHOT_POLL_INTERVAL,
        }
    }

    /// Overrides the provider-state polling interval.
    ///
    /// This is primarily used by tests to keep polling scenarios fast.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Overrides the snapshot completion polling interval.
    ///
    /// This is primarily used by tests to keep polling scenarios fast.
    #[must_use]
    pub const fn with_snapshot_poll_interval(mut self, interval: Duration) -> Self {
        self.snapshot_poll_interval = interval;
        self
    }

    /// The drive name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn directory(&self) -> Directory<'_, P> {
        Directory::new(&self.provider)
    }

    fn host(node: &Instance) -> Result<IpAddr, DriveError<P::Error>> {
        node.public_ip.ok_or_else(|| DriveError::NoAddress {
            instance_id: node.id.clone(),
        })
    }

    async fn resolve_volume(&self) -> Result<Option<Volume>, DriveError<P::Error>> {
        let lookup = self
            .directory()
            .volume(&self.name)
            .await
            .map_err(DriveError::Provider)?;
        Ok(lookup.at_most_one("volume", &self.name)?)
    }

    async fn require_volume(&self) -> Result<Volume, DriveError<P::Error>> {
        let lookup = self
            .directory()
            .volume(&self.name)
            .await
            .map_err(DriveError::Provider)?;
        Ok(lookup.require("volume", &self.name)?)
    }

    async fn newest_snapshot(&self) -> Result<Option<Snapshot>, DriveError<P::Error>> {
        self.directory()
            .latest_snapshot(&self.name)
            .await
            .map_err(DriveError::Provider)
    }

    /// Attaches (restoring from the newest snapshot when no volume
    /// exists), formats a blank device, and mounts.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Drive::attach`], [`Drive::format_disk`],
    /// and [`Drive::mount`].
    pub async fn connect(&self, node: &Instance) -> Result<(), DriveError<P::Error>> {
        self.attach(node).await?;
        self.format_disk(node)?;
        self.mount(node)
    }

    /// Realises the drive as a volume attached to the node.
    ///
    /// An existing volume is reused after a zone check; otherwise a volume
    /// is restored from the newest snapshot in the node's zone. A stale
    /// attachment left by an abnormal termination is cleared first. The
    /// call returns once the device is visible inside the guest.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::ZoneMismatch`] for a cross-zone volume,
    /// [`DriveError::NothingToAttach`] when the drive has never existed,
    /// [`DriveError::Lookup`] when the name is ambiguous, and provider or
    /// remote errors from the underlying calls.
    pub async fn attach(&self, node: &Instance) -> Result<(), DriveError<P::Error>> {
        let volume = match self.resolve_volume().await? {
            Some(volume) => {
                if volume.zone != node.zone {
                    return Err(DriveError::ZoneMismatch {
                        volume_id: volume.id,
                        volume_zone: volume.zone,
                        instance_id: node.id.clone(),
                        instance_zone: node.zone.clone(),
                    });
                }
                volume
            }
            None => self.restore_from_snapshot(node).await?,
        };

        if let Some(attachment) = &volume.attachment {
            tracing::info!(
                volume = %volume.id,
                instance = %attachment.instance_id,
                "clearing stale attachment"
            );
            self.provider
                .detach_volume(&volume.id)
                .await
                .map_err(DriveError::Provider)?;
        }

        self.wait_volume_available(&volume.id).await?;
        self.provider
            .attach_volume(&volume.id, &node.id, &self.device)
            .await
            .map_err(DriveError::Provider)?;
        self.wait_device_visible(node).await?;
        tracing::info!(
            volume = %volume.id,
            instance = %node.id,
            device = %self.device,
            "volume attached"
        );
        Ok(())
    }

    async fn restore_from_snapshot(&self, node: &Instance) -> Result<Volume, DriveError<P::Error>> {
        let snapshot = self
            .newest_snapshot()
            .await?
            .ok_or_else(|| DriveError::NothingToAttach {
                name: self.name.clone(),
            })?;
        tracing::info!(
            snapshot = %snapshot.id,
            zone = %node.zone,
            "restoring volume from snapshot"
        );
        let spec = VolumeSpec::from_snapshot(&snapshot.id, &node.zone);
        let volume = self
            .provider
            .create_volume(&spec)
            .await
            .map_err(DriveError::Provider)?;
        self.directory()
            .set_name(&volume.id, &self.name)
            .await
            .map_err(DriveError::Provider)?;
        Ok(Volume {
            name: self.name.clone(),
            ..volume
        })
    }

    async fn wait_volume_available(&self, volume_id: &str) -> Result<(), DriveError<P::Error>> {
        tracing::info!(volume = %volume_id, "waiting until volume available");
        loop {
            let current = self
                .provider
                .describe_volume(volume_id)
                .await
                .map_err(DriveError::Provider)?;
            if current.is_some_and(|volume| volume.is_available()) {
                tracing::info!(volume = %volume_id, "volume available");
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
    }

    /// The attach API acknowledges before the guest kernel sees the
    /// device; bridge the gap by polling for it.
    async fn wait_device_visible(&self, node: &Instance) -> Result<(), DriveError<P::Error>> {
        let host = Self::host(node)?;
        tracing::info!(device = %self.device, "waiting for device to appear in the guest");
        loop {
            if self
                .shell
                .probe(host, &format!("sudo ls -l {}", self.device))?
            {
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Creates a filesystem on the device unless one already exists.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::FormatFailed`] when `mkfs` fails, which
    /// distinguishes "no device present" from the skipped no-op.
    pub fn format_disk(&self, node: &Instance) -> Result<(), DriveError<P::Error>> {
        let host = Self::host(node)?;
        if self
            .shell
            .probe(host, &format!("sudo blkid {}", self.device))?
        {
            tracing::warn!(
                device = %self.device,
                "device already carries a filesystem, leaving it in place"
            );
            return Ok(());
        }
        let output = self
            .shell
            .exec(host, &format!("sudo mkfs -t ext4 {}", self.device))?;
        if !output.is_success() {
            return Err(DriveError::FormatFailed {
                device: self.device.clone(),
                stderr: output.stderr,
            });
        }
        tracing::info!(device = %self.device, "filesystem created");
        Ok(())
    }

    /// Mounts the device and hands the mount point to the operating user.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] when any mount step fails.
    pub fn mount(&self, node: &Instance) -> Result<(), DriveError<P::Error>> {
        let host = Self::host(node)?;
        self.shell
            .check(host, &format!("sudo mkdir -p {}", self.mount_path))?;
        self.shell
            .check(host, &format!("sudo mount {} {}", self.device, self.mount_path))?;
        let user = self.shell.user().to_owned();
        self.shell.check(
            host,
            &format!("sudo chown -R {user}:{user} {}", self.mount_path),
        )?;
        tracing::info!(mount = %self.mount_path, "volume mounted");
        Ok(())
    }

    /// Unmounts, falling back to killing holders when the clean path
    /// fails. A total failure is reported in the outcome, not raised, so
    /// the disconnect flow can continue.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] only when `ssh` cannot run at all.
    pub fn unmount(&self, node: &Instance) -> Result<UnmountOutcome, DriveError<P::Error>> {
        let host = Self::host(node)?;
        if self
            .shell
            .probe(host, &format!("sudo umount {}", self.mount_path))?
        {
            tracing::info!(mount = %self.mount_path, "volume unmounted cleanly");
            return Ok(UnmountOutcome::Clean);
        }
        tracing::warn!(
            mount = %self.mount_path,
            "clean unmount failed, killing holders and forcing"
        );
        let killed = self
            .shell
            .probe(host, &format!("sudo fuser -km {}", self.mount_path))?;
        if killed
            && self
                .shell
                .probe(host, &format!("sudo umount {}", self.mount_path))?
        {
            tracing::info!(mount = %self.mount_path, "volume unmounted after forcing");
            return Ok(UnmountOutcome::Forced);
        }
        tracing::warn!(
            mount = %self.mount_path,
            "forced unmount failed; continuing disconnect"
        );
        Ok(UnmountOutcome::Failed)
    }

    /// Force-detaches the backing volume and waits until the provider
    /// reports it available. Detaching an unattached volume is a no-op
    /// beyond the wait.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] when no volume carries the name.
    pub async fn detach(&self) -> Result<(), DriveError<P::Error>> {
        let volume = self.require_volume().await?;
        if let Some(attachment) = &volume.attachment {
            tracing::info!(
                volume = %volume.id,
                instance = %attachment.instance_id,
                "force-detaching volume"
            );
            self.provider
                .detach_volume(&volume.id)
                .await
                .map_err(DriveError::Provider)?;
        }
        self.wait_volume_available(&volume.id).await
    }

    /// The inverse of [`Drive::connect`]: stop a workload persisting onto
    /// the mount, unmount, detach, snapshot (unless `save` is `false`),
    /// and delete the volume.
    ///
    /// With `save = false` the volume is discarded without a snapshot —
    /// the deliberate data-loss path for scratch drives.
    ///
    /// # Errors
    ///
    /// Returns provider and remote errors from the underlying steps; a
    /// failed unmount is logged and does not stop the flow.
    pub async fn disconnect(&self, node: &Instance, save: bool) -> Result<(), DriveError<P::Error>> {
        let host = Self::host(node)?;
        let data_root = workload::docker_data_root(&self.shell, host)?;
        if data_root.is_some_and(|root| root.starts_with(&self.mount_path)) {
            workload::stop_docker(&self.shell, host)?;
        }
        self.unmount(node)?;
        self.teardown(save).await
    }

    /// Detach, optionally snapshot, and delete — the tail of a disconnect
    /// for a volume whose node is unreachable or already gone.
    ///
    /// # Errors
    ///
    /// Returns provider errors from the underlying steps.
    pub async fn teardown(&self, save: bool) -> Result<(), DriveError<P::Error>> {
        self.detach().await?;
        if save {
            self.create_snapshot().await?;
        } else {
            tracing::warn!(drive = %self.name, "discarding volume without a snapshot");
        }
        self.delete_volume().await
    }

    /// Snapshots the backing volume and blocks until the provider reports
    /// the copy durable, which can take minutes.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::SnapshotFailed`] on a provider-reported
    /// failure and [`LookupError::NotFound`] when no volume carries the
    /// name.
    pub async fn create_snapshot(&self) -> Result<Snapshot, DriveError<P::Error>> {
        let volume = self.require_volume().await?;
        let snapshot = self
            .provider
            .create_snapshot(&volume.id)
            .await
            .map_err(DriveError::Provider)?;
        self.directory()
            .set_name(&snapshot.id, &self.name)
            .await
            .map_err(DriveError::Provider)?;
        tracing::info!(
            snapshot = %snapshot.id,
            volume = %volume.id,
            "waiting for snapshot to complete; this can take minutes"
        );
        let mut polls: u32 = 0;
        loop {
            let current = self
                .provider
                .describe_snapshot(&snapshot.id)
                .await
                .map_err(DriveError::Provider)?;
            if let Some(current) = current {
                match current.state {
                    SnapshotState::Completed => {
                        tracing::info!(snapshot = %current.id, "snapshot completed");
                        return Ok(current);
                    }
                    SnapshotState::Error => {
                        return Err(DriveError::SnapshotFailed {
                            snapshot_id: current.id,
                        });
                    }
                    SnapshotState::Pending | SnapshotState::Other(_) => {}
                }
            }
            polls += 1;
            if polls % 20 == 0 {
                tracing::info!(snapshot = %snapshot.id, polls, "snapshot still in progress");
            }
            sleep(self.snapshot_poll_interval).await;
        }
    }

    /// Deletes the backing volume and blocks until the provider confirms.
    /// A volume that vanishes mid-poll was deleted — the provider's own
    /// asynchronous cleanup racing ours — and counts as success.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] when no volume carries the name.
    pub async fn delete_volume(&self) -> Result<(), DriveError<P::Error>> {
        let volume = self.require_volume().await?;
        self.provider
            .delete_volume(&volume.id)
            .await
            .map_err(DriveError::Provider)?;
        tracing::info!(volume = %volume.id, "waiting for deletion to be confirmed");
        loop {
            let current = self
                .provider
                .describe_volume(&volume.id)
                .await
                .map_err(DriveError::Provider)?;
            if current.is_none() {
                tracing::info!(volume = %volume.id, "volume deleted");
                return Ok(());
            }
            sleep(self.poll_interval).await;
        }
    }

    /// What a fresh connect would restore from: the newest snapshot, or
    /// `None` for a drive that has never been saved.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::VolumeExists`] when a live volume carries the
    /// name — the caller should have attached it instead of asking for a
    /// restore source.
    pub async fn latest_snapshot(&self) -> Result<Option<Snapshot>, DriveError<P::Error>> {
        if let Some(volume) = self.resolve_volume().await? {
            return Err(DriveError::VolumeExists {
                name: self.name.clone(),
                volume_id: volume.id,
            });
        }
        self.newest_snapshot().await
    }

    /// The explicit first-use path: creates a blank volume, attaches,
    /// formats, and mounts it. [`Drive::attach`] never creates blank
    /// volumes silently; a drive comes into existence only through this
    /// call.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::VolumeExists`] or
    /// [`DriveError::AlreadyInitialised`] when the drive already has a
    /// volume or snapshot history.
    pub async fn initialise(
        &self,
        node: &Instance,
        size_gib: u32,
    ) -> Result<(), DriveError<P::Error>> {
        if let Some(volume) = self.resolve_volume().await? {
            return Err(DriveError::VolumeExists {
                name: self.name.clone(),
                volume_id: volume.id,
            });
        }
        if let Some(snapshot) = self.newest_snapshot().await? {
            return Err(DriveError::AlreadyInitialised {
                name: self.name.clone(),
                snapshot_id: snapshot.id,
            });
        }
        tracing::info!(drive = %self.name, size_gib, "creating blank volume for first use");
        let spec = VolumeSpec::blank(&node.zone, size_gib);
        let volume = self
            .provider
            .create_volume(&spec)
            .await
            .map_err(DriveError::Provider)?;
        self.directory()
            .set_name(&volume.id, &self.name)
            .await
            .map_err(DriveError::Provider)?;
        self.connect(node).await
    }

    /// Enlarges the backing volume and grows the filesystem to match.
    /// Valid only while the volume is attached to `node` and mounted.
    ///
    /// # Errors
    ///
    /// Returns [`DriveError::NotAttached`], [`DriveError::NotMounted`], or
    /// [`DriveError::ResizeTooSmall`] when preconditions fail.
    pub async fn resize(&self, node: &Instance, size_gib: u32) -> Result<(), DriveError<P::Error>> {
        let volume = self.require_volume().await?;
        let attached_here = volume
            .attachment
            .as_ref()
            .is_some_and(|attachment| attachment.instance_id == node.id);
        if !attached_here {
            return Err(DriveError::NotAttached {
                name: self.name.clone(),
                volume_id: volume.id,
                instance_id: node.id.clone(),
            });
        }
        let host = Self::host(node)?;
        if !self
            .shell
            .probe(host, &format!("findmnt {}", self.mount_path))?
        {
            return Err(DriveError::NotMounted {
                name: self.name.clone(),
                mount_path: self.mount_path.clone(),
            });
        }
        if size_gib <= volume.size_gib {
            return Err(DriveError::ResizeTooSmall {
                requested_gib: size_gib,
                current_gib: volume.size_gib,
            });
        }

        self.provider
            .resize_volume(&volume.id, size_gib)
            .await
            .map_err(DriveError::Provider)?;
        tracing::info!(
            volume = %volume.id,
            size_gib,
            "waiting for the provider to reflect the new size"
        );
        loop {
            let current = self
                .provider
                .describe_volume(&volume.id)
                .await
                .map_err(DriveError::Provider)?;
            if current.is_some_and(|vol| vol.size_gib >= size_gib) {
                break;
            }
            sleep(self.poll_interval).await;
        }
        self.shell
            .check(host, &format!("sudo resize2fs {}", self.device))?;
        tracing::info!(volume = %volume.id, size_gib, "filesystem grown");
        Ok(())
    }
}
