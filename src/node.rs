//! Node controller: provisioning and terminating compute nodes.
//!
//! Creation provisions compute (on demand or spot), waits for the
//! instance to run, acquire an address, and accept SSH, installs the
//! container runtime, and hands the requested drive to the drive
//! manager — connecting it when it has history, initialising it on
//! confirmed first use. Spot nodes additionally get a reclamation
//! watchdog registered for their request.
//!
//! Termination is the single shutdown sequence shared by operator
//! commands and the watchdog: stop the workload, unmount, terminate the
//! instance, then snapshot, detach, and delete the drive volume. The
//! instance is terminated before the snapshot because compute bills by
//! the minute while the volume does not.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::config::{ConfigError, ToolkitConfig};
use crate::directory::{Directory, LookupError};
use crate::drive::{DEFAULT_DEVICE, DEFAULT_MOUNT_PATH, Drive, DriveError};
use crate::provider::{Instance, LaunchSpec, Provider};
use crate::remote::{CommandRunner, RemoteError, RemoteShell};
use crate::watchdog::{SpotWatchdog, WatchdogError, WatchdogRegistry};
use crate::workload;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default docker data root when no drive is attached.
const DEFAULT_DOCKER_ROOT: &str = "/var/lib";

/// Parameters for creating a node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeRequest {
    /// Name tag for the new instance; must be unused.
    pub name: String,
    /// Tier label resolved through the configuration tables.
    pub tier: String,
    /// Boot volume size override in GiB.
    pub boot_size_gib: Option<u32>,
    /// Drive to connect (or initialise on first use).
    pub drive: Option<String>,
    /// Size for a newly initialised drive, in GiB.
    pub drive_size_gib: u32,
    /// Request interruptible spot capacity instead of on-demand.
    pub spot: bool,
}

impl NodeRequest {
    /// Creates a request with the default tier and no drive.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: String::from("free"),
            boot_size_gib: None,
            drive: None,
            drive_size_gib: 10,
            spot: false,
        }
    }

    /// Sets the tier label.
    #[must_use]
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = tier.into();
        self
    }

    /// Sets the boot volume size.
    #[must_use]
    pub const fn with_boot_size(mut self, size_gib: u32) -> Self {
        self.boot_size_gib = Some(size_gib);
        self
    }

    /// Names the drive to connect.
    #[must_use]
    pub fn with_drive(mut self, drive: impl Into<String>) -> Self {
        self.drive = Some(drive.into());
        self
    }

    /// Sets the size used when the drive is initialised on first use.
    #[must_use]
    pub const fn with_drive_size(mut self, size_gib: u32) -> Self {
        self.drive_size_gib = size_gib;
        self
    }

    /// Requests spot capacity.
    #[must_use]
    pub const fn spot(mut self) -> Self {
        self.spot = true;
        self
    }
}

/// Errors raised by node operations.
#[derive(Debug, Error)]
pub enum NodeError<E>
where
    E: std::error::Error + 'static,
{
    /// A provider call failed.
    #[error("provider operation failed: {0}")]
    Provider(#[source] E),
    /// Configuration was missing or inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The remote command channel failed.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// A name did not resolve to exactly one resource.
    #[error(transparent)]
    Lookup(#[from] LookupError),
    /// A delegated drive operation failed.
    #[error("drive operation failed: {0}")]
    Drive(#[source] DriveError<E>),
    /// The watchdog registry refused the registration.
    #[error(transparent)]
    Watchdog(#[from] WatchdogError),
    /// The instance name is already taken.
    #[error("instance {name} already exists as {instance_id}")]
    AlreadyExists {
        /// Requested name.
        name: String,
        /// Instance currently holding it.
        instance_id: String,
    },
    /// The spot request reached a terminal state without an instance.
    #[error("spot request {request_id} ended in state {state} ({status_code})")]
    SpotRequestFailed {
        /// The failed request.
        request_id: String,
        /// Terminal request state.
        state: String,
        /// Fine-grained status code.
        status_code: String,
    },
    /// An operation needed the drive attached somewhere.
    #[error("drive {drive} volume {volume_id} is not attached to any instance")]
    DriveNotAttached {
        /// Drive being operated on.
        drive: String,
        /// Its backing volume.
        volume_id: String,
    },
}

/// Provisions and terminates compute nodes.
#[derive(Clone, Debug)]
pub struct NodeController<P, R: CommandRunner> {
    provider: P,
    shell: RemoteShell<R>,
    config: ToolkitConfig,
    watchdogs: Arc<WatchdogRegistry>,
    poll_interval: Duration,
}

impl<P, R> NodeController<P, R>
where
    P: Provider + Clone + Send + Sync + 'static,
    R: CommandRunner + Clone + Send + Sync + 'static,
{
    /// Creates a controller over the given provider and remote shell.
    #[must_use]
    pub fn new(provider: P, shell: RemoteShell<R>, config: ToolkitConfig) -> Self {
        Self {
            provider,
            shell,
            config,
            watchdogs: Arc::new(WatchdogRegistry::new()),
            poll_interval: POLL_INTERVAL,
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

    /// The watchdog registry supervising this controller's spot nodes.
    #[must_use]
    pub fn watchdogs(&self) -> &Arc<WatchdogRegistry> {
        &self.watchdogs
    }

    /// A drive manager sharing this controller's provider and shell.
    #[must_use]
    pub fn drive(&self, name: &str) -> Drive<P, R> {
        Drive::new(self.provider.clone(), self.shell.clone(), name)
            .with_poll_interval(self.poll_interval)
    }

    /// Creates a node, prepares its drive, and registers a watchdog for
    /// spot capacity.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::AlreadyExists`] when the name is taken, and
    /// configuration, provider, remote, or drive errors from the
    /// underlying steps.
    pub async fn create(&self, request: &NodeRequest) -> Result<Instance, NodeError<P::Error>> {
        let directory = Directory::new(&self.provider);
        let existing = directory
            .instance(&request.name)
            .await
            .map_err(NodeError::Provider)?
            .at_most_one("instance", &request.name)?;
        if let Some(instance) = existing {
            return Err(NodeError::AlreadyExists {
                name: request.name.clone(),
                instance_id: instance.id,
            });
        }

        let spec = self.config.launch_spec(&request.tier, request.boot_size_gib)?;
        let (created, spot_request_id) = if request.spot {
            let (instance, request_id) = self.create_spot(&spec).await?;
            (instance, Some(request_id))
        } else {
            let instance = self
                .provider
                .run_instance(&spec)
                .await
                .map_err(NodeError::Provider)?;
            (instance, None)
        };
        directory
            .set_name(&created.id, &request.name)
            .await
            .map_err(NodeError::Provider)?;

        tracing::info!(instance = %created.id, name = %request.name, "waiting for instance to run");
        self.wait_running(&created.id).await?;
        let (node, host) = self.wait_address(&created.id).await?;
        self.shell.wait_ready(host, self.poll_interval).await?;

        workload::install_docker(&self.shell, host)?;
        if let Some(drive_name) = &request.drive {
            self.prepare_drive(drive_name, &node, request.drive_size_gib)
                .await?;
            workload::set_docker_folder(&self.shell, host, DEFAULT_MOUNT_PATH)?;
        } else {
            workload::set_docker_folder(&self.shell, host, DEFAULT_DOCKER_ROOT)?;
        }

        if let Some(request_id) = spot_request_id {
            self.register_watchdog(&request_id, &node, &request.name)?;
        }

        tracing::info!(name = %request.name, instance = %node.id, host = %host, "node ready");
        Ok(node)
    }

    /// The shared termination sequence: stop workload → unmount → clear
    /// the name tag → terminate → snapshot → detach → delete volume.
    ///
    /// The watchdog for the node, if any, is cancelled first so it cannot
    /// race this shutdown. With `save_drive = false` the drive volume is
    /// discarded without a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LookupError::NotFound`] for an unknown name, and
    /// provider or drive errors from the underlying steps; workload stop
    /// and unmount failures are logged and do not stop the sequence.
    pub async fn terminate(&self, name: &str, save_drive: bool) -> Result<(), NodeError<P::Error>> {
        let directory = Directory::new(&self.provider);
        let instance = directory
            .instance(name)
            .await
            .map_err(NodeError::Provider)?
            .require("instance", name)?;
        self.watchdogs.cancel_for_instance(&instance.id);

        let drive_name = self.attached_drive_name(&instance.id).await?;

        if let Some(host) = instance.public_ip {
            if let Err(err) = workload::stop_docker(&self.shell, host) {
                tracing::warn!(error = %err, "could not stop workload; continuing termination");
            }
            if let Some(drive_name) = &drive_name {
                if let Err(err) = self.drive(drive_name).unmount(&instance) {
                    tracing::warn!(error = %err, "could not unmount drive; continuing termination");
                }
            }
        } else {
            tracing::warn!(
                instance = %instance.id,
                "no public address; skipping workload shutdown and unmount"
            );
        }

        // Free the name for reuse; terminated instances linger in listings.
        directory
            .set_name(&instance.id, "")
            .await
            .map_err(NodeError::Provider)?;
        self.provider
            .terminate_instance(&instance.id)
            .await
            .map_err(NodeError::Provider)?;
        tracing::info!(instance = %instance.id, name, "instance terminated");

        if let Some(drive_name) = drive_name {
            let drive = self.drive(&drive_name);
            if save_drive {
                drive.create_snapshot().await.map_err(NodeError::Drive)?;
            } else {
                tracing::warn!(drive = %drive_name, "discarding drive without a snapshot");
            }
            drive.detach().await.map_err(NodeError::Drive)?;
            drive.delete_volume().await.map_err(NodeError::Drive)?;
        }
        Ok(())
    }

    /// Connects a drive to a named, reachable instance.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for the instance name and drive errors from
    /// the connect flow.
    pub async fn connect_drive(
        &self,
        drive_name: &str,
        instance_name: &str,
    ) -> Result<(), NodeError<P::Error>> {
        let node = Directory::new(&self.provider)
            .instance(instance_name)
            .await
            .map_err(NodeError::Provider)?
            .require("instance", instance_name)?;
        self.drive(drive_name)
            .connect(&node)
            .await
            .map_err(NodeError::Drive)
    }

    /// Disconnects a drive wherever it is attached, resolving the node
    /// from the volume's own attachment. Falls back to a teardown without
    /// unmount when no reachable node holds the volume.
    ///
    /// # Errors
    ///
    /// Returns lookup errors for the drive name and drive errors from the
    /// disconnect flow.
    pub async fn disconnect_drive(
        &self,
        drive_name: &str,
        save: bool,
    ) -> Result<(), NodeError<P::Error>> {
        let volume = Directory::new(&self.provider)
            .volume(drive_name)
            .await
            .map_err(NodeError::Provider)?
            .require("volume", drive_name)?;
        let drive = self.drive(drive_name);

        let node = match &volume.attachment {
            Some(attachment) => self
                .provider
                .describe_instance(&attachment.instance_id)
                .await
                .map_err(NodeError::Provider)?,
            None => None,
        };
        match node {
            Some(node) if node.public_ip.is_some() => {
                drive.disconnect(&node, save).await.map_err(NodeError::Drive)
            }
            _ => {
                tracing::warn!(
                    drive = %drive_name,
                    "no reachable node holds the volume; tearing down without unmount"
                );
                drive.teardown(save).await.map_err(NodeError::Drive)
            }
        }
    }

    /// Enlarges a drive in place, resolving the node from the volume's
    /// attachment.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::DriveNotAttached`] for a detached volume and
    /// drive errors from the resize flow.
    pub async fn resize_drive(
        &self,
        drive_name: &str,
        size_gib: u32,
    ) -> Result<(), NodeError<P::Error>> {
        let volume = Directory::new(&self.provider)
            .volume(drive_name)
            .await
            .map_err(NodeError::Provider)?
            .require("volume", drive_name)?;
        let Some(attachment) = &volume.attachment else {
            return Err(NodeError::DriveNotAttached {
                drive: drive_name.to_owned(),
                volume_id: volume.id,
            });
        };
        let node = self
            .provider
            .describe_instance(&attachment.instance_id)
            .await
            .map_err(NodeError::Provider)?
            .ok_or_else(|| NodeError::DriveNotAttached {
                drive: drive_name.to_owned(),
                volume_id: volume.id.clone(),
            })?;
        self.drive(drive_name)
            .resize(&node, size_gib)
            .await
            .map_err(NodeError::Drive)
    }

    async fn prepare_drive(
        &self,
        name: &str,
        node: &Instance,
        size_gib: u32,
    ) -> Result<(), NodeError<P::Error>> {
        let directory = Directory::new(&self.provider);
        let volume = directory
            .volume(name)
            .await
            .map_err(NodeError::Provider)?
            .at_most_one("volume", name)?;
        let snapshot = directory
            .latest_snapshot(name)
            .await
            .map_err(NodeError::Provider)?;
        let drive = self.drive(name);
        if volume.is_some() || snapshot.is_some() {
            drive.connect(node).await.map_err(NodeError::Drive)
        } else {
            tracing::info!(drive = %name, "drive has no history; initialising on first use");
            drive
                .initialise(node, size_gib)
                .await
                .map_err(NodeError::Drive)
        }
    }

    fn register_watchdog(
        &self,
        request_id: &str,
        node: &Instance,
        name: &str,
    ) -> Result<(), NodeError<P::Error>> {
        let watchdog = SpotWatchdog::new(self.provider.clone(), request_id);
        let controller = self.clone();
        let node_name = name.to_owned();
        self.watchdogs.watch(watchdog, &node.id, move || async move {
            if let Err(err) = controller.terminate(&node_name, true).await {
                tracing::error!(
                    name = %node_name,
                    error = %err,
                    "spot-triggered termination failed"
                );
            }
        })?;
        tracing::info!(request = %request_id, instance = %node.id, "spot watchdog registered");
        Ok(())
    }

    async fn attached_drive_name(
        &self,
        instance_id: &str,
    ) -> Result<Option<String>, NodeError<P::Error>> {
        let volumes = self
            .provider
            .volumes_attached_to(instance_id)
            .await
            .map_err(NodeError::Provider)?;
        Ok(volumes
            .into_iter()
            .find(|volume| {
                volume
                    .attachment
                    .as_ref()
                    .is_some_and(|attachment| attachment.device == DEFAULT_DEVICE)
            })
            .map(|volume| volume.name)
            .filter(|name| !name.is_empty()))
    }

    async fn create_spot(
        &self,
        spec: &LaunchSpec,
    ) -> Result<(Instance, String), NodeError<P::Error>> {
        let request_id = self
            .provider
            .request_spot_instance(spec, &self.config.spot_price)
            .await
            .map_err(NodeError::Provider)?;
        tracing::info!(
            request = %request_id,
            price = %self.config.spot_price,
            "spot request submitted"
        );

        let instance_id = loop {
            let request = self
                .provider
                .describe_spot_request(&request_id)
                .await
                .map_err(NodeError::Provider)?;
            match request {
                // A freshly submitted request id is sometimes not visible
                // yet; keep polling.
                None => {}
                Some(request) if request.is_terminal() => {
                    return Err(NodeError::SpotRequestFailed {
                        request_id,
                        state: request.state,
                        status_code: request.status_code,
                    });
                }
                Some(request) => {
                    if let Some(instance_id) = request.instance_id {
                        break instance_id;
                    }
                }
            }
            sleep(self.poll_interval).await;
        };
        tracing::info!(request = %request_id, instance = %instance_id, "spot request fulfilled");

        let instance = self.wait_described(&instance_id).await?;
        Ok((instance, request_id))
    }

    async fn wait_described(&self, id: &str) -> Result<Instance, NodeError<P::Error>> {
        loop {
            if let Some(instance) = self
                .provider
                .describe_instance(id)
                .await
                .map_err(NodeError::Provider)?
            {
                return Ok(instance);
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn wait_running(&self, id: &str) -> Result<Instance, NodeError<P::Error>> {
        loop {
            let instance = self
                .provider
                .describe_instance(id)
                .await
                .map_err(NodeError::Provider)?;
            if let Some(instance) = instance {
                if instance.is_running() {
                    return Ok(instance);
                }
            }
            sleep(self.poll_interval).await;
        }
    }

    async fn wait_address(&self, id: &str) -> Result<(Instance, IpAddr), NodeError<P::Error>> {
        tracing::info!(instance = %id, "awaiting public address");
        loop {
            let instance = self
                .provider
                .describe_instance(id)
                .await
                .map_err(NodeError::Provider)?;
            if let Some(instance) = instance {
                if let Some(host) = instance.public_ip {
                    return Ok((instance, host));
                }
            }
            sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SshConfig;
    use crate::test_support::{FAKE_ZONE, FakeProvider, ScriptedRunner};
    use std::collections::HashMap;

    const FAST: Duration = Duration::from_millis(1);

    fn controller(
        provider: &FakeProvider,
        runner: &ScriptedRunner,
    ) -> NodeController<FakeProvider, ScriptedRunner> {
        let shell =
            RemoteShell::new(SshConfig::default(), runner.clone()).expect("default config is valid");
        let config = ToolkitConfig {
            instance_types: HashMap::from([(String::from("free"), String::from("t2.micro"))]),
            images: HashMap::from([(String::from("free"), String::from("ami-c51e3eb6"))]),
            spot_price: String::from("0.25"),
            ssh_user: String::from("ec2-user"),
            ssh_key_file: None,
            key_name: String::from("key"),
            security_group: String::from("default"),
            region: None,
        };
        NodeController::new(provider.clone(), shell, config).with_poll_interval(FAST)
    }

    fn position(log: &[String], needle: &str) -> usize {
        log.iter()
            .position(|entry| entry.starts_with(needle))
            .unwrap_or_else(|| panic!("no `{needle}` in {log:?}"))
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let provider = FakeProvider::new();
        provider.seed_instance("workbench", FAKE_ZONE, "203.0.113.5");
        let runner = ScriptedRunner::new();

        let err = controller(&provider, &runner)
            .create(&NodeRequest::new("workbench"))
            .await
            .expect_err("a second instance with the same name is a mistake");
        assert!(
            matches!(err, NodeError::AlreadyExists { .. }),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn create_initialises_fresh_drive_on_first_use() {
        let provider = FakeProvider::new();
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();

        let node = controller(&provider, &runner)
            .create(&NodeRequest::new("workbench").with_drive("data").with_drive_size(20))
            .await
            .expect("creation with a fresh drive succeeds");

        assert_eq!(node.name, "workbench");
        assert_eq!(provider.volumes_named("data"), 1);
        let mutations = provider.mutations();
        assert!(
            mutations
                .iter()
                .any(|entry| entry.starts_with("create-volume") && entry.ends_with("blank")),
            "first use creates a blank volume: {mutations:?}"
        );
    }

    #[tokio::test]
    async fn create_connects_drive_with_history() {
        let provider = FakeProvider::new();
        provider.seed_snapshot("data", "2024-05-01T09:00:00.000Z");
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();

        controller(&provider, &runner)
            .create(&NodeRequest::new("workbench").with_drive("data"))
            .await
            .expect("creation restores the drive from its snapshot");

        let mutations = provider.mutations();
        assert!(
            mutations
                .iter()
                .any(|entry| entry.starts_with("create-volume") && !entry.ends_with("blank")),
            "drive with history restores from snapshot: {mutations:?}"
        );
    }

    #[tokio::test]
    async fn create_spot_registers_watchdog_and_terminate_cancels_it() {
        let provider = FakeProvider::new();
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();
        let ctrl = controller(&provider, &runner);

        ctrl.create(&NodeRequest::new("spotbox").spot())
            .await
            .expect("spot creation succeeds");

        let request_id = provider
            .mutations()
            .iter()
            .find_map(|entry| {
                entry
                    .starts_with("request-spot-instances")
                    .then(|| entry.split_whitespace().last().map(str::to_owned))
                    .flatten()
            })
            .expect("a spot request was submitted");
        assert!(ctrl.watchdogs().is_watching(&request_id));

        ctrl.terminate("spotbox", false)
            .await
            .expect("termination succeeds");
        assert!(!ctrl.watchdogs().is_watching(&request_id));
    }

    #[tokio::test]
    async fn terminate_orders_terminate_snapshot_delete() {
        let provider = FakeProvider::new();
        let node = provider.seed_instance("workbench", FAKE_ZONE, "203.0.113.5");
        provider.seed_attached_volume("data", FAKE_ZONE, &node.id);
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();

        controller(&provider, &runner)
            .terminate("workbench", true)
            .await
            .expect("termination with save succeeds");

        let mutations = provider.mutations();
        let terminate = position(&mutations, "terminate-instances");
        let snapshot = position(&mutations, "create-snapshot");
        let delete = position(&mutations, "delete-volume");
        assert!(
            terminate < snapshot && snapshot < delete,
            "terminate, then snapshot, then delete: {mutations:?}"
        );
        assert_eq!(provider.volumes_named("data"), 0);
    }

    #[tokio::test]
    async fn terminate_discard_skips_snapshot() {
        let provider = FakeProvider::new();
        let node = provider.seed_instance("workbench", FAKE_ZONE, "203.0.113.5");
        provider.seed_attached_volume("data", FAKE_ZONE, &node.id);
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();

        controller(&provider, &runner)
            .terminate("workbench", false)
            .await
            .expect("termination without save succeeds");

        let mutations = provider.mutations();
        assert!(
            !mutations
                .iter()
                .any(|entry| entry.starts_with("create-snapshot")),
            "discard path must not snapshot: {mutations:?}"
        );
        assert_eq!(provider.volumes_named("data"), 0);
    }

    #[tokio::test]
    async fn disconnect_drive_tears_down_detached_volume() {
        let provider = FakeProvider::new();
        provider.seed_volume("data", FAKE_ZONE);
        let runner = ScriptedRunner::new();

        controller(&provider, &runner)
            .disconnect_drive("data", true)
            .await
            .expect("detached volume still tears down");

        let mutations = provider.mutations();
        assert!(
            mutations
                .iter()
                .any(|entry| entry.starts_with("create-snapshot")),
            "teardown with save snapshots: {mutations:?}"
        );
        assert_eq!(provider.volumes_named("data"), 0);
    }

    #[tokio::test]
    async fn resize_drive_requires_attachment() {
        let provider = FakeProvider::new();
        provider.seed_volume("data", FAKE_ZONE);
        let runner = ScriptedRunner::new();

        let err = controller(&provider, &runner)
            .resize_drive("data", 25)
            .await
            .expect_err("a detached drive cannot be resized in place");
        assert!(
            matches!(err, NodeError::DriveNotAttached { .. }),
            "unexpected error: {err}"
        );
    }
}
