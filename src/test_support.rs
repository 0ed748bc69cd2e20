//! Test support utilities shared across unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;

use crate::provider::{
    Attachment, Instance, InstanceState, LaunchSpec, Provider, ProviderFuture, Snapshot,
    SnapshotState, SpotRequest, Volume, VolumeSpec, VolumeState,
};
use crate::remote::{CommandOutput, CommandRunner, RemoteError};

/// Availability zone used for resources the fake provider creates.
pub const FAKE_ZONE: &str = "us-east-1a";

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    responses: VecDeque<CommandOutput>,
    invocations: Vec<CommandInvocation>,
    succeed_when_empty: bool,
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning
/// processes. With [`ScriptedRunner::succeed_when_empty`] set, an
/// exhausted queue yields zero exit codes, which keeps long lifecycle
/// flows from needing every incidental command scripted.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state().invocations.clone()
    }

    /// Makes an exhausted response queue produce successes instead of
    /// errors.
    pub fn succeed_when_empty(&self) {
        self.state().succeed_when_empty = true;
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        self.push_output(Some(code), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.state().responses.push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        let mut state = self.state();
        state.invocations.push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        if let Some(response) = state.responses.pop_front() {
            return Ok(response);
        }
        if state.succeed_when_empty {
            return Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        Err(RemoteError::Spawn {
            program: program.to_owned(),
            message: String::from("no scripted response available"),
        })
    }
}

/// Error type for [`FakeProvider`]; the fake itself never fails, but the
/// provider contract requires one.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake provider failure: {0}")]
pub struct FakeProviderError(pub String);

#[derive(Debug, Default)]
struct FakeCloud {
    instances: Vec<Instance>,
    volumes: Vec<Volume>,
    snapshots: Vec<Snapshot>,
    spot_requests: HashMap<String, SpotRequest>,
    spot_scripts: HashMap<String, VecDeque<Option<SpotRequest>>>,
    mutations: Vec<String>,
    counter: u32,
}

impl FakeCloud {
    fn next_id(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }
}

/// In-memory provider double simulating the slice of cloud behaviour the
/// toolkit depends on.
///
/// State transitions are immediate (attach reports `in-use` on the next
/// describe, snapshots complete instantly), which lets indefinite polling
/// loops converge on their first iteration. Every mutating call is
/// appended to a log so tests can assert ordering and absence of side
/// effects.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    cloud: Arc<Mutex<FakeCloud>>,
}

impl FakeProvider {
    /// Creates an empty fake cloud.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn cloud(&self) -> MutexGuard<'_, FakeCloud> {
        self.cloud.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// All mutating provider calls made so far, in order.
    #[must_use]
    pub fn mutations(&self) -> Vec<String> {
        self.cloud().mutations.clone()
    }

    /// Number of volumes currently carrying a name tag.
    #[must_use]
    pub fn volumes_named(&self, name: &str) -> usize {
        self.cloud()
            .volumes
            .iter()
            .filter(|volume| volume.name == name)
            .count()
    }

    /// Seeds a running instance with a public address.
    pub fn seed_instance(&self, name: &str, zone: &str, ip: &str) -> Instance {
        let mut cloud = self.cloud();
        let id = cloud.next_id();
        let instance = Instance {
            id: format!("i-{id:04}"),
            name: name.to_owned(),
            zone: zone.to_owned(),
            state: InstanceState::Running,
            public_ip: IpAddr::from_str(ip).ok(),
        };
        cloud.instances.push(instance.clone());
        instance
    }

    /// Seeds a detached, available volume.
    pub fn seed_volume(&self, name: &str, zone: &str) -> Volume {
        let mut cloud = self.cloud();
        let id = cloud.next_id();
        let volume = Volume {
            id: format!("vol-{id:04}"),
            name: name.to_owned(),
            zone: zone.to_owned(),
            state: VolumeState::Available,
            size_gib: 10,
            attachment: None,
        };
        cloud.volumes.push(volume.clone());
        volume
    }

    /// Seeds a volume already attached to an instance, as left behind by
    /// an abnormal termination.
    pub fn seed_attached_volume(&self, name: &str, zone: &str, instance_id: &str) -> Volume {
        let mut cloud = self.cloud();
        let id = cloud.next_id();
        let volume = Volume {
            id: format!("vol-{id:04}"),
            name: name.to_owned(),
            zone: zone.to_owned(),
            state: VolumeState::InUse,
            size_gib: 10,
            attachment: Some(Attachment {
                instance_id: instance_id.to_owned(),
                device: String::from("/dev/xvdf"),
            }),
        };
        cloud.volumes.push(volume.clone());
        volume
    }

    /// Seeds a completed snapshot with an explicit start time.
    pub fn seed_snapshot(&self, name: &str, start_time: &str) -> Snapshot {
        let mut cloud = self.cloud();
        let id = cloud.next_id();
        let snapshot = Snapshot {
            id: format!("snap-{id:04}"),
            name: name.to_owned(),
            volume_id: String::from("vol-origin"),
            state: SnapshotState::Completed,
            start_time: start_time.to_owned(),
        };
        cloud.snapshots.push(snapshot.clone());
        snapshot
    }

    /// Scripts describe results for a spot request id. Each describe pops
    /// one entry; an exhausted script reports the request gone.
    pub fn script_spot_status(&self, request_id: &str, status: Option<SpotRequest>) {
        self.cloud()
            .spot_scripts
            .entry(request_id.to_owned())
            .or_default()
            .push_back(status);
    }
}

impl Provider for FakeProvider {
    type Error = FakeProviderError;

    fn find_instances<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<Instance>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .instances
                .iter()
                .filter(|instance| {
                    instance.name == name && instance.state != InstanceState::Terminated
                })
                .cloned()
                .collect())
        })
    }

    fn find_volumes<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<Volume>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .volumes
                .iter()
                .filter(|volume| volume.name == name)
                .cloned()
                .collect())
        })
    }

    fn find_snapshots<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<Snapshot>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .snapshots
                .iter()
                .filter(|snapshot| snapshot.name == name)
                .cloned()
                .collect())
        })
    }

    fn volumes_attached_to<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .volumes
                .iter()
                .filter(|volume| {
                    volume
                        .attachment
                        .as_ref()
                        .is_some_and(|attachment| attachment.instance_id == instance_id)
                })
                .cloned()
                .collect())
        })
    }

    fn describe_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .instances
                .iter()
                .find(|instance| instance.id == id)
                .cloned())
        })
    }

    fn describe_volume<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Volume>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .volumes
                .iter()
                .find(|volume| volume.id == id)
                .cloned())
        })
    }

    fn describe_snapshot<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Snapshot>, Self::Error> {
        Box::pin(async move {
            Ok(self
                .cloud()
                .snapshots
                .iter()
                .find(|snapshot| snapshot.id == id)
                .cloned())
        })
    }

    fn create_volume<'a>(
        &'a self,
        spec: &'a VolumeSpec,
    ) -> ProviderFuture<'a, Volume, Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            let id = cloud.next_id();
            let volume = Volume {
                id: format!("vol-{id:04}"),
                name: String::new(),
                zone: spec.zone.clone(),
                state: VolumeState::Available,
                size_gib: spec.size_gib.unwrap_or(10),
                attachment: None,
            };
            cloud.volumes.push(volume.clone());
            let source = spec
                .snapshot_id
                .clone()
                .unwrap_or_else(|| String::from("blank"));
            cloud
                .mutations
                .push(format!("create-volume {} {source}", volume.id));
            Ok(volume)
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if let Some(volume) = cloud
                .volumes
                .iter_mut()
                .find(|volume| volume.id == volume_id)
            {
                volume.state = VolumeState::InUse;
                volume.attachment = Some(Attachment {
                    instance_id: instance_id.to_owned(),
                    device: device.to_owned(),
                });
            }
            cloud
                .mutations
                .push(format!("attach-volume {volume_id} {instance_id} {device}"));
            Ok(())
        })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if let Some(volume) = cloud
                .volumes
                .iter_mut()
                .find(|volume| volume.id == volume_id)
            {
                volume.state = VolumeState::Available;
                volume.attachment = None;
            }
            cloud.mutations.push(format!("detach-volume {volume_id}"));
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            cloud.volumes.retain(|volume| volume.id != volume_id);
            cloud.mutations.push(format!("delete-volume {volume_id}"));
            Ok(())
        })
    }

    fn resize_volume<'a>(
        &'a self,
        volume_id: &'a str,
        size_gib: u32,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if let Some(volume) = cloud
                .volumes
                .iter_mut()
                .find(|volume| volume.id == volume_id)
            {
                volume.size_gib = size_gib;
            }
            cloud
                .mutations
                .push(format!("resize-volume {volume_id} {size_gib}"));
            Ok(())
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Snapshot, Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            let id = cloud.next_id();
            let snapshot = Snapshot {
                id: format!("snap-{id:04}"),
                name: String::new(),
                volume_id: volume_id.to_owned(),
                state: SnapshotState::Completed,
                start_time: format!("2024-06-01T00:00:00.{id:06}Z"),
            };
            cloud.snapshots.push(snapshot.clone());
            cloud
                .mutations
                .push(format!("create-snapshot {volume_id} {}", snapshot.id));
            Ok(snapshot)
        })
    }

    fn tag<'a>(
        &'a self,
        resource_id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if key == "Name" {
                if let Some(volume) = cloud
                    .volumes
                    .iter_mut()
                    .find(|volume| volume.id == resource_id)
                {
                    volume.name = value.to_owned();
                }
                if let Some(snapshot) = cloud
                    .snapshots
                    .iter_mut()
                    .find(|snapshot| snapshot.id == resource_id)
                {
                    snapshot.name = value.to_owned();
                }
                if let Some(instance) = cloud
                    .instances
                    .iter_mut()
                    .find(|instance| instance.id == resource_id)
                {
                    instance.name = value.to_owned();
                }
            }
            cloud
                .mutations
                .push(format!("tag {resource_id} {key}={value}"));
            Ok(())
        })
    }

    fn run_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            let id = cloud.next_id();
            let instance = Instance {
                id: format!("i-{id:04}"),
                name: String::new(),
                zone: String::from(FAKE_ZONE),
                state: InstanceState::Running,
                public_ip: IpAddr::from_str("203.0.113.77").ok(),
            };
            cloud.instances.push(instance.clone());
            cloud
                .mutations
                .push(format!("run-instances {} {}", spec.image_id, instance.id));
            Ok(instance)
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if let Some(instance) = cloud
                .instances
                .iter_mut()
                .find(|instance| instance.id == id)
            {
                instance.state = InstanceState::Terminated;
            }
            // Non-root volumes end up detached once the instance is gone.
            for volume in &mut cloud.volumes {
                if volume
                    .attachment
                    .as_ref()
                    .is_some_and(|attachment| attachment.instance_id == id)
                {
                    volume.attachment = None;
                    volume.state = VolumeState::Available;
                }
            }
            cloud.mutations.push(format!("terminate-instances {id}"));
            Ok(())
        })
    }

    fn request_spot_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        price: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            let instance_seq = cloud.next_id();
            let instance = Instance {
                id: format!("i-{instance_seq:04}"),
                name: String::new(),
                zone: String::from(FAKE_ZONE),
                state: InstanceState::Running,
                public_ip: IpAddr::from_str("203.0.113.78").ok(),
            };
            cloud.instances.push(instance.clone());
            let request_seq = cloud.next_id();
            let request_id = format!("sir-{request_seq:04}");
            cloud.spot_requests.insert(
                request_id.clone(),
                SpotRequest {
                    id: request_id.clone(),
                    state: String::from("active"),
                    status_code: String::from("fulfilled"),
                    instance_id: Some(instance.id),
                },
            );
            cloud.mutations.push(format!(
                "request-spot-instances {} {price} {request_id}",
                spec.image_id
            ));
            Ok(request_id)
        })
    }

    fn describe_spot_request<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequest>, Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            if let Some(script) = cloud.spot_scripts.get_mut(id) {
                return Ok(script.pop_front().flatten());
            }
            Ok(cloud.spot_requests.get(id).cloned())
        })
    }

    fn cancel_spot_request<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut cloud = self.cloud();
            cloud.spot_requests.remove(id);
            cloud
                .mutations
                .push(format!("cancel-spot-instance-requests {id}"));
            Ok(())
        })
    }
}
