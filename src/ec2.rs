//! EC2 implementation of the provider capability.
//!
//! Shells out to the `aws` CLI with `--output json` through a
//! [`CommandRunner`] and parses the responses with serde. Keeping the
//! provider behind the runner means every call is scriptable in tests and
//! the crate carries no HTTP stack of its own.
//!
//! Describe and delete calls translate the CLI's `*.NotFound` failures
//! into absent resources, so deletion polls can treat "already gone" as
//! success instead of racing the provider's asynchronous cleanup.

use std::ffi::OsString;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::provider::{
    Attachment, Instance, InstanceState, LaunchSpec, Provider, ProviderFuture, Snapshot,
    SnapshotState, SpotRequest, Volume, VolumeSpec, VolumeState,
};
use crate::remote::{CommandOutput, CommandRunner, ProcessCommandRunner, RemoteError};

/// Default AWS CLI binary name.
pub const DEFAULT_AWS_BIN: &str = "aws";

/// Boot device slot used when overriding the root volume size.
const BOOT_DEVICE: &str = "/dev/xvda";

/// Errors raised by the EC2 CLI provider.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum Ec2Error {
    /// Raised when the CLI process cannot be executed at all.
    #[error(transparent)]
    Runner(#[from] RemoteError),
    /// Raised when the CLI exits non-zero for a reason other than a
    /// missing resource.
    #[error("{action} failed with status {status_text}: {stderr}")]
    CommandFailure {
        /// Provider operation being attempted.
        action: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the CLI.
        stderr: String,
    },
    /// Raised when JSON output from the CLI cannot be parsed.
    #[error("failed to parse {action} output: {message}")]
    Parse {
        /// Provider operation being attempted.
        action: String,
        /// Parser error message.
        message: String,
    },
    /// Raised when a create call returns an empty result set.
    #[error("{action} returned no resource")]
    EmptyResponse {
        /// Provider operation being attempted.
        action: String,
    },
}

/// Provider implementation driving the `aws` CLI.
#[derive(Clone, Debug)]
pub struct Ec2Cli<R: CommandRunner> {
    bin: String,
    region: Option<String>,
    runner: R,
}

impl Ec2Cli<ProcessCommandRunner> {
    /// Creates a provider wired to the real process runner.
    #[must_use]
    pub const fn with_process_runner(bin: String, region: Option<String>) -> Self {
        Self::new(bin, region, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Ec2Cli<R> {
    /// Creates a provider using the given CLI binary, region, and runner.
    #[must_use]
    pub const fn new(bin: String, region: Option<String>, runner: R) -> Self {
        Self { bin, region, runner }
    }

    fn build_args(&self, parts: &[&str]) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![OsString::from("ec2")];
        args.extend(parts.iter().map(OsString::from));
        if let Some(region) = &self.region {
            args.push(OsString::from("--region"));
            args.push(OsString::from(region));
        }
        args.push(OsString::from("--output"));
        args.push(OsString::from("json"));
        args
    }

    fn run_checked(&self, args: &[OsString], action: &str) -> Result<CommandOutput, Ec2Error> {
        let output = self.runner.run(&self.bin, args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(command_failure(action, &output))
    }

    /// Runs the CLI, mapping a `*.NotFound` failure to `None`.
    fn run_allowing_not_found(
        &self,
        args: &[OsString],
        action: &str,
    ) -> Result<Option<CommandOutput>, Ec2Error> {
        let output = self.runner.run(&self.bin, args)?;
        if output.is_success() {
            return Ok(Some(output));
        }
        if is_not_found(&output.stderr) {
            return Ok(None);
        }
        Err(command_failure(action, &output))
    }

    fn parse<T: serde::de::DeserializeOwned>(stdout: &str, action: &str) -> Result<T, Ec2Error> {
        serde_json::from_str(stdout).map_err(|err| Ec2Error::Parse {
            action: action.to_owned(),
            message: err.to_string(),
        })
    }

    fn list_volumes(&self, filters: &[String], action: &str) -> Result<Vec<Volume>, Ec2Error> {
        let mut parts = vec!["describe-volumes"];
        for filter in filters {
            parts.push("--filters");
            parts.push(filter.as_str());
        }
        let args = self.build_args(&parts);
        let output = self.run_checked(&args, action)?;
        let response: DescribeVolumesResponse = Self::parse(&output.stdout, action)?;
        Ok(response.volumes.into_iter().map(Volume::from).collect())
    }
}

fn command_failure(action: &str, output: &CommandOutput) -> Ec2Error {
    let status_text = output
        .code
        .map_or_else(|| String::from("unknown"), |code| code.to_string());
    Ec2Error::CommandFailure {
        action: action.to_owned(),
        status_text,
        stderr: output.stderr.clone(),
    }
}

/// The CLI reports missing resources with error codes such as
/// `InvalidVolume.NotFound` on stderr.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains(".NotFound")
}

fn tag_filter(name: &str) -> String {
    format!("Name=tag:Name,Values={name}")
}

impl<R: CommandRunner + Send + Sync> Provider for Ec2Cli<R> {
    type Error = Ec2Error;

    fn find_instances<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<Instance>, Self::Error> {
        Box::pin(async move {
            let action = "find instances";
            let tag = tag_filter(name);
            let args = self.build_args(&[
                "describe-instances",
                "--filters",
                &tag,
                "--filters",
                "Name=instance-state-name,Values=pending,running,stopping,stopped",
            ]);
            let output = self.run_checked(&args, action)?;
            let response: DescribeInstancesResponse = Self::parse(&output.stdout, action)?;
            Ok(response
                .reservations
                .into_iter()
                .flat_map(|reservation| reservation.instances)
                .map(Instance::from)
                .collect())
        })
    }

    fn find_volumes<'a>(&'a self, name: &'a str) -> ProviderFuture<'a, Vec<Volume>, Self::Error> {
        Box::pin(async move { self.list_volumes(&[tag_filter(name)], "find volumes") })
    }

    fn find_snapshots<'a>(
        &'a self,
        name: &'a str,
    ) -> ProviderFuture<'a, Vec<Snapshot>, Self::Error> {
        Box::pin(async move {
            let action = "find snapshots";
            let tag = tag_filter(name);
            let args = self.build_args(&[
                "describe-snapshots",
                "--owner-ids",
                "self",
                "--filters",
                &tag,
            ]);
            let output = self.run_checked(&args, action)?;
            let response: DescribeSnapshotsResponse = Self::parse(&output.stdout, action)?;
            Ok(response.snapshots.into_iter().map(Snapshot::from).collect())
        })
    }

    fn volumes_attached_to<'a>(
        &'a self,
        instance_id: &'a str,
    ) -> ProviderFuture<'a, Vec<Volume>, Self::Error> {
        Box::pin(async move {
            let filter = format!("Name=attachment.instance-id,Values={instance_id}");
            self.list_volumes(&[filter], "list attached volumes")
        })
    }

    fn describe_instance<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Instance>, Self::Error> {
        Box::pin(async move {
            let action = "describe instance";
            let args = self.build_args(&["describe-instances", "--instance-ids", id]);
            let Some(output) = self.run_allowing_not_found(&args, action)? else {
                return Ok(None);
            };
            let response: DescribeInstancesResponse = Self::parse(&output.stdout, action)?;
            Ok(response
                .reservations
                .into_iter()
                .flat_map(|reservation| reservation.instances)
                .next()
                .map(Instance::from))
        })
    }

    fn describe_volume<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Volume>, Self::Error> {
        Box::pin(async move {
            let action = "describe volume";
            let args = self.build_args(&["describe-volumes", "--volume-ids", id]);
            let Some(output) = self.run_allowing_not_found(&args, action)? else {
                return Ok(None);
            };
            let response: DescribeVolumesResponse = Self::parse(&output.stdout, action)?;
            Ok(response.volumes.into_iter().next().map(Volume::from))
        })
    }

    fn describe_snapshot<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<Snapshot>, Self::Error> {
        Box::pin(async move {
            let action = "describe snapshot";
            let args = self.build_args(&["describe-snapshots", "--snapshot-ids", id]);
            let Some(output) = self.run_allowing_not_found(&args, action)? else {
                return Ok(None);
            };
            let response: DescribeSnapshotsResponse = Self::parse(&output.stdout, action)?;
            Ok(response.snapshots.into_iter().next().map(Snapshot::from))
        })
    }

    fn create_volume<'a>(
        &'a self,
        spec: &'a VolumeSpec,
    ) -> ProviderFuture<'a, Volume, Self::Error> {
        Box::pin(async move {
            let action = "create volume";
            let token = Uuid::new_v4().to_string();
            let size_text = spec.size_gib.map(|size| size.to_string());
            let mut parts = vec![
                "create-volume",
                "--availability-zone",
                spec.zone.as_str(),
                "--volume-type",
                spec.volume_type.as_str(),
                "--client-token",
                token.as_str(),
            ];
            if let Some(snapshot_id) = &spec.snapshot_id {
                parts.push("--snapshot-id");
                parts.push(snapshot_id);
            }
            if let Some(size) = &size_text {
                parts.push("--size");
                parts.push(size);
            }
            let args = self.build_args(&parts);
            let output = self.run_checked(&args, action)?;
            let payload: VolumePayload = Self::parse(&output.stdout, action)?;
            Ok(Volume::from(payload))
        })
    }

    fn attach_volume<'a>(
        &'a self,
        volume_id: &'a str,
        instance_id: &'a str,
        device: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = self.build_args(&[
                "attach-volume",
                "--volume-id",
                volume_id,
                "--instance-id",
                instance_id,
                "--device",
                device,
            ]);
            self.run_checked(&args, "attach volume")?;
            Ok(())
        })
    }

    fn detach_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = self.build_args(&["detach-volume", "--volume-id", volume_id, "--force"]);
            self.run_checked(&args, "detach volume")?;
            Ok(())
        })
    }

    fn delete_volume<'a>(&'a self, volume_id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = self.build_args(&["delete-volume", "--volume-id", volume_id]);
            self.run_allowing_not_found(&args, "delete volume")?;
            Ok(())
        })
    }

    fn resize_volume<'a>(
        &'a self,
        volume_id: &'a str,
        size_gib: u32,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let size = size_gib.to_string();
            let args =
                self.build_args(&["modify-volume", "--volume-id", volume_id, "--size", &size]);
            self.run_checked(&args, "resize volume")?;
            Ok(())
        })
    }

    fn create_snapshot<'a>(
        &'a self,
        volume_id: &'a str,
    ) -> ProviderFuture<'a, Snapshot, Self::Error> {
        Box::pin(async move {
            let action = "create snapshot";
            let args = self.build_args(&["create-snapshot", "--volume-id", volume_id]);
            let output = self.run_checked(&args, action)?;
            let payload: SnapshotPayload = Self::parse(&output.stdout, action)?;
            Ok(Snapshot::from(payload))
        })
    }

    fn tag<'a>(
        &'a self,
        resource_id: &'a str,
        key: &'a str,
        value: &'a str,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let pair = format!("Key={key},Value={value}");
            let args = self.build_args(&["create-tags", "--resources", resource_id, "--tags", &pair]);
            self.run_checked(&args, "tag resource")?;
            Ok(())
        })
    }

    fn run_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
    ) -> ProviderFuture<'a, Instance, Self::Error> {
        Box::pin(async move {
            let action = "run instance";
            let token = Uuid::new_v4().to_string();
            let mappings = boot_mappings_json(spec, action)?;
            let mut parts = vec![
                "run-instances",
                "--image-id",
                spec.image_id.as_str(),
                "--instance-type",
                spec.instance_type.as_str(),
                "--key-name",
                spec.key_name.as_str(),
                "--security-groups",
                spec.security_group.as_str(),
                "--count",
                "1",
                "--client-token",
                token.as_str(),
            ];
            if let Some(mappings) = &mappings {
                parts.push("--block-device-mappings");
                parts.push(mappings);
            }
            let args = self.build_args(&parts);
            let output = self.run_checked(&args, action)?;
            let response: RunInstancesResponse = Self::parse(&output.stdout, action)?;
            response
                .instances
                .into_iter()
                .next()
                .map(Instance::from)
                .ok_or_else(|| Ec2Error::EmptyResponse {
                    action: action.to_owned(),
                })
        })
    }

    fn terminate_instance<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = self.build_args(&["terminate-instances", "--instance-ids", id]);
            self.run_checked(&args, "terminate instance")?;
            Ok(())
        })
    }

    fn request_spot_instance<'a>(
        &'a self,
        spec: &'a LaunchSpec,
        price: &'a str,
    ) -> ProviderFuture<'a, String, Self::Error> {
        Box::pin(async move {
            let action = "request spot instance";
            let token = Uuid::new_v4().to_string();
            let specification = launch_specification_json(spec, action)?;
            let args = self.build_args(&[
                "request-spot-instances",
                "--spot-price",
                price,
                "--launch-specification",
                &specification,
                "--client-token",
                token.as_str(),
            ]);
            let output = self.run_checked(&args, action)?;
            let response: SpotRequestsResponse = Self::parse(&output.stdout, action)?;
            response
                .spot_instance_requests
                .into_iter()
                .next()
                .map(|payload| payload.spot_instance_request_id)
                .ok_or_else(|| Ec2Error::EmptyResponse {
                    action: action.to_owned(),
                })
        })
    }

    fn describe_spot_request<'a>(
        &'a self,
        id: &'a str,
    ) -> ProviderFuture<'a, Option<SpotRequest>, Self::Error> {
        Box::pin(async move {
            let action = "describe spot request";
            let args = self.build_args(&[
                "describe-spot-instance-requests",
                "--spot-instance-request-ids",
                id,
            ]);
            let Some(output) = self.run_allowing_not_found(&args, action)? else {
                return Ok(None);
            };
            let response: SpotRequestsResponse = Self::parse(&output.stdout, action)?;
            Ok(response
                .spot_instance_requests
                .into_iter()
                .next()
                .map(SpotRequest::from))
        })
    }

    fn cancel_spot_request<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let args = self.build_args(&[
                "cancel-spot-instance-requests",
                "--spot-instance-request-ids",
                id,
            ]);
            self.run_checked(&args, "cancel spot request")?;
            Ok(())
        })
    }
}

fn launch_specification_json(spec: &LaunchSpec, action: &str) -> Result<String, Ec2Error> {
    let payload = LaunchSpecificationPayload {
        image_id: &spec.image_id,
        instance_type: &spec.instance_type,
        key_name: &spec.key_name,
        security_groups: vec![spec.security_group.clone()],
        block_device_mappings: boot_mappings(spec),
    };
    serde_json::to_string(&payload).map_err(|err| Ec2Error::Parse {
        action: action.to_owned(),
        message: err.to_string(),
    })
}

fn boot_mappings_json(spec: &LaunchSpec, action: &str) -> Result<Option<String>, Ec2Error> {
    let mappings = boot_mappings(spec);
    if mappings.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(&mappings)
        .map(Some)
        .map_err(|err| Ec2Error::Parse {
            action: action.to_owned(),
            message: err.to_string(),
        })
}

fn boot_mappings(spec: &LaunchSpec) -> Vec<BlockDeviceMappingPayload> {
    spec.boot_size_gib
        .map(|size| BlockDeviceMappingPayload {
            device_name: String::from(BOOT_DEVICE),
            ebs: EbsPayload {
                volume_size: size,
                volume_type: String::from(crate::provider::DEFAULT_VOLUME_TYPE),
            },
        })
        .into_iter()
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LaunchSpecificationPayload<'a> {
    image_id: &'a str,
    instance_type: &'a str,
    key_name: &'a str,
    security_groups: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    block_device_mappings: Vec<BlockDeviceMappingPayload>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct BlockDeviceMappingPayload {
    device_name: String,
    ebs: EbsPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct EbsPayload {
    volume_size: u32,
    volume_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TagPayload {
    key: String,
    value: String,
}

fn name_from_tags(tags: &[TagPayload]) -> String {
    tags.iter()
        .find(|tag| tag.key == "Name")
        .map(|tag| tag.value.clone())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumesResponse {
    #[serde(default)]
    volumes: Vec<VolumePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VolumePayload {
    volume_id: String,
    availability_zone: String,
    state: String,
    size: u32,
    #[serde(default)]
    attachments: Vec<AttachmentPayload>,
    #[serde(default)]
    tags: Vec<TagPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AttachmentPayload {
    instance_id: String,
    device: String,
}

impl From<VolumePayload> for Volume {
    fn from(payload: VolumePayload) -> Self {
        Self {
            id: payload.volume_id,
            name: name_from_tags(&payload.tags),
            zone: payload.availability_zone,
            state: VolumeState::parse(&payload.state),
            size_gib: payload.size,
            attachment: payload
                .attachments
                .into_iter()
                .next()
                .map(|attachment| Attachment {
                    instance_id: attachment.instance_id,
                    device: attachment.device,
                }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSnapshotsResponse {
    #[serde(default)]
    snapshots: Vec<SnapshotPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SnapshotPayload {
    snapshot_id: String,
    volume_id: String,
    state: String,
    start_time: String,
    #[serde(default)]
    tags: Vec<TagPayload>,
}

impl From<SnapshotPayload> for Snapshot {
    fn from(payload: SnapshotPayload) -> Self {
        Self {
            id: payload.snapshot_id,
            name: name_from_tags(&payload.tags),
            volume_id: payload.volume_id,
            state: SnapshotState::parse(&payload.state),
            start_time: payload.start_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstancesResponse {
    #[serde(default)]
    reservations: Vec<ReservationPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ReservationPayload {
    #[serde(default)]
    instances: Vec<InstancePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RunInstancesResponse {
    #[serde(default)]
    instances: Vec<InstancePayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstancePayload {
    instance_id: String,
    state: InstanceStatePayload,
    placement: PlacementPayload,
    public_ip_address: Option<String>,
    #[serde(default)]
    tags: Vec<TagPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InstanceStatePayload {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PlacementPayload {
    availability_zone: String,
}

impl From<InstancePayload> for Instance {
    fn from(payload: InstancePayload) -> Self {
        Self {
            id: payload.instance_id,
            name: name_from_tags(&payload.tags),
            zone: payload.placement.availability_zone,
            state: InstanceState::parse(&payload.state.name),
            public_ip: payload
                .public_ip_address
                .as_deref()
                .and_then(|ip| IpAddr::from_str(ip).ok()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestsResponse {
    #[serde(default)]
    spot_instance_requests: Vec<SpotRequestPayload>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotRequestPayload {
    spot_instance_request_id: String,
    state: String,
    status: SpotStatusPayload,
    instance_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpotStatusPayload {
    code: String,
}

impl From<SpotRequestPayload> for SpotRequest {
    fn from(payload: SpotRequestPayload) -> Self {
        Self {
            id: payload.spot_instance_request_id,
            state: payload.state,
            status_code: payload.status.code,
            instance_id: payload.instance_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;

    fn cli(runner: ScriptedRunner) -> Ec2Cli<ScriptedRunner> {
        Ec2Cli::new(String::from(DEFAULT_AWS_BIN), None, runner)
    }

    const VOLUME_JSON: &str = r#"{
        "Volumes": [{
            "VolumeId": "vol-0abc",
            "AvailabilityZone": "us-east-1a",
            "State": "in-use",
            "Size": 10,
            "Attachments": [{"InstanceId": "i-0123", "Device": "/dev/xvdf", "State": "attached"}],
            "Tags": [{"Key": "Name", "Value": "data"}]
        }]
    }"#;

    #[tokio::test]
    async fn find_volumes_parses_attachment_and_name_tag() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), VOLUME_JSON, "");
        let provider = cli(runner.clone());

        let volumes = provider.find_volumes("data").await.expect("parses");
        assert_eq!(volumes.len(), 1);
        let volume = volumes.first().expect("one volume");
        assert_eq!(volume.name, "data");
        assert_eq!(volume.state, VolumeState::InUse);
        assert_eq!(
            volume.attachment,
            Some(Attachment {
                instance_id: String::from("i-0123"),
                device: String::from("/dev/xvdf"),
            })
        );

        let rendered = runner
            .invocations()
            .first()
            .expect("one invocation")
            .command_string();
        assert!(
            rendered.contains("Name=tag:Name,Values=data"),
            "rendered: {rendered}"
        );
        assert!(rendered.contains("--output json"), "rendered: {rendered}");
    }

    #[tokio::test]
    async fn describe_volume_maps_not_found_to_none() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(254),
            "",
            "An error occurred (InvalidVolume.NotFound) when calling the DescribeVolumes operation",
        );
        let provider = cli(runner);

        let volume = provider.describe_volume("vol-gone").await.expect("absent");
        assert_eq!(volume, None);
    }

    #[tokio::test]
    async fn describe_volume_surfaces_other_failures() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(255), "", "AuthFailure: credentials expired");
        let provider = cli(runner);

        let err = provider
            .describe_volume("vol-0abc")
            .await
            .expect_err("auth failures are not absence");
        assert!(
            matches!(err, Ec2Error::CommandFailure { ref stderr, .. } if stderr.contains("AuthFailure")),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn describe_instance_flattens_reservations() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{
                "Reservations": [{
                    "Instances": [{
                        "InstanceId": "i-0123",
                        "State": {"Name": "running"},
                        "Placement": {"AvailabilityZone": "us-east-1a"},
                        "PublicIpAddress": "203.0.113.9",
                        "Tags": [{"Key": "Name", "Value": "workbench"}]
                    }]
                }]
            }"#,
            "",
        );
        let provider = cli(runner);

        let instance = provider
            .describe_instance("i-0123")
            .await
            .expect("parses")
            .expect("instance present");
        assert_eq!(instance.name, "workbench");
        assert!(instance.is_running());
        assert_eq!(
            instance.public_ip.map(|ip| ip.to_string()),
            Some(String::from("203.0.113.9"))
        );
    }

    #[tokio::test]
    async fn create_volume_passes_snapshot_and_zone() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{"VolumeId": "vol-new", "AvailabilityZone": "us-east-1b", "State": "creating", "Size": 10}"#,
            "",
        );
        let provider = cli(runner.clone());

        let spec = VolumeSpec::from_snapshot("snap-1", "us-east-1b");
        let volume = provider.create_volume(&spec).await.expect("parses");
        assert_eq!(volume.id, "vol-new");
        assert_eq!(volume.state, VolumeState::Creating);

        let rendered = runner
            .invocations()
            .first()
            .expect("one invocation")
            .command_string();
        assert!(
            rendered.contains("--snapshot-id snap-1"),
            "rendered: {rendered}"
        );
        assert!(
            rendered.contains("--availability-zone us-east-1b"),
            "rendered: {rendered}"
        );
        assert!(rendered.contains("--client-token"), "rendered: {rendered}");
    }

    #[tokio::test]
    async fn delete_volume_treats_not_found_as_success() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(254),
            "",
            "An error occurred (InvalidVolume.NotFound) when calling the DeleteVolume operation",
        );
        let provider = cli(runner);

        provider
            .delete_volume("vol-gone")
            .await
            .expect("already-gone volumes delete cleanly");
    }

    #[tokio::test]
    async fn request_spot_instance_serialises_launch_specification() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{
                "SpotInstanceRequests": [{
                    "SpotInstanceRequestId": "sir-42",
                    "State": "open",
                    "Status": {"Code": "pending-evaluation"}
                }]
            }"#,
            "",
        );
        let provider = cli(runner.clone());

        let spec = LaunchSpec {
            image_id: String::from("ami-c51e3eb6"),
            instance_type: String::from("p2.xlarge"),
            key_name: String::from("key"),
            security_group: String::from("default"),
            boot_size_gib: Some(15),
        };
        let request_id = provider
            .request_spot_instance(&spec, "0.25")
            .await
            .expect("parses");
        assert_eq!(request_id, "sir-42");

        let rendered = runner
            .invocations()
            .first()
            .expect("one invocation")
            .command_string();
        assert!(
            rendered.contains(r#""ImageId":"ami-c51e3eb6""#),
            "rendered: {rendered}"
        );
        assert!(
            rendered.contains(r#""VolumeSize":15"#),
            "rendered: {rendered}"
        );
        assert!(rendered.contains("--spot-price 0.25"), "rendered: {rendered}");
    }

    #[tokio::test]
    async fn describe_spot_request_parses_status_code() {
        let runner = ScriptedRunner::new();
        runner.push_output(
            Some(0),
            r#"{
                "SpotInstanceRequests": [{
                    "SpotInstanceRequestId": "sir-42",
                    "State": "active",
                    "Status": {"Code": "marked-for-termination"},
                    "InstanceId": "i-0123"
                }]
            }"#,
            "",
        );
        let provider = cli(runner);

        let request = provider
            .describe_spot_request("sir-42")
            .await
            .expect("parses")
            .expect("request present");
        assert!(request.is_marked_for_termination());
        assert_eq!(request.instance_id.as_deref(), Some("i-0123"));
    }
}
