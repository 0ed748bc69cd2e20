//! Container tooling helpers invoked at node and drive lifecycle points.
//!
//! These are deliberately plain command sequences: install the container
//! runtime after a node boots, point its data root at the drive's mount
//! so images and containers persist across node lifetimes, and stop
//! everything before the drive unmounts.

use std::net::IpAddr;

use serde::Deserialize;

use crate::remote::{CommandRunner, RemoteError, RemoteShell};

#[derive(Debug, Deserialize)]
struct DockerDaemonConfig {
    #[serde(rename = "data-root")]
    data_root: Option<String>,
    // Older daemons called the same setting `graph`.
    graph: Option<String>,
}

/// Reads where the docker daemon keeps images and containers.
///
/// A missing or unparsable `daemon.json` is a normal negative answer:
/// the daemon is simply not configured onto a drive.
///
/// # Errors
///
/// Returns [`RemoteError::Spawn`] when `ssh` cannot run at all.
pub fn docker_data_root<R: CommandRunner>(
    shell: &RemoteShell<R>,
    host: IpAddr,
) -> Result<Option<String>, RemoteError> {
    let output = shell.exec(host, "sudo cat /etc/docker/daemon.json")?;
    if !output.is_success() {
        return Ok(None);
    }
    let Ok(parsed) = serde_json::from_str::<DockerDaemonConfig>(&output.stdout) else {
        return Ok(None);
    };
    Ok(parsed.data_root.or(parsed.graph))
}

/// Points the docker daemon's data root at `folder` and restarts it.
///
/// # Errors
///
/// Returns [`RemoteError::CommandFailure`] when writing the configuration
/// fails; the restart itself is best-effort.
pub fn set_docker_folder<R: CommandRunner>(
    shell: &RemoteShell<R>,
    host: IpAddr,
    folder: &str,
) -> Result<(), RemoteError> {
    let payload = serde_json::json!({ "data-root": format!("{folder}/docker") }).to_string();
    let escaped = shell_escape::unix::escape(payload.into());
    shell.check(host, "sudo mkdir -p /etc/docker")?;
    shell.check(
        host,
        &format!("printf '%s' {escaped} | sudo tee /etc/docker/daemon.json > /dev/null"),
    )?;
    shell.check(host, &format!("sudo mkdir -p {folder}/docker"))?;
    let restart = shell.exec(host, "sudo service docker restart")?;
    if !restart.is_success() {
        tracing::debug!("docker restart reported failure; daemon may not be installed yet");
    }
    tracing::info!(folder, "docker data root set");
    Ok(())
}

/// Installs the container runtime and lets the operating user drive it.
///
/// # Errors
///
/// Returns [`RemoteError::CommandFailure`] when installation fails.
pub fn install_docker<R: CommandRunner>(
    shell: &RemoteShell<R>,
    host: IpAddr,
) -> Result<(), RemoteError> {
    shell.check(host, "sudo yum install -y -q docker")?;
    let user = shell.user().to_owned();
    shell.check(host, &format!("sudo usermod -aG docker {user}"))?;
    let start = shell.exec(host, "sudo service docker start")?;
    if !start.is_success() {
        tracing::debug!("docker start reported failure; it may already be running");
    }
    tracing::info!(host = %host, "docker installed");
    Ok(())
}

/// Stops every container and then the daemon, quietly; a node about to
/// terminate may have nothing running.
///
/// # Errors
///
/// Returns [`RemoteError::Spawn`] when `ssh` cannot run at all.
pub fn stop_docker<R: CommandRunner>(
    shell: &RemoteShell<R>,
    host: IpAddr,
) -> Result<(), RemoteError> {
    let containers = shell.exec(host, "docker ps -aq | xargs -r docker stop")?;
    if !containers.is_success() {
        tracing::warn!("stopping containers reported failure");
    }
    let daemon = shell.exec(host, "sudo service docker stop")?;
    if !daemon.is_success() {
        tracing::warn!("stopping the docker daemon reported failure");
    }
    tracing::info!(host = %host, "docker stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::SshConfig;
    use crate::test_support::ScriptedRunner;
    use std::net::Ipv4Addr;

    fn shell(runner: &ScriptedRunner) -> RemoteShell<ScriptedRunner> {
        RemoteShell::new(SshConfig::default(), runner.clone()).expect("default config is valid")
    }

    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5))
    }

    #[test]
    fn data_root_reads_current_key() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"data-root": "/v1/docker"}"#, "");

        let root = docker_data_root(&shell(&runner), host()).expect("probe succeeds");
        assert_eq!(root.as_deref(), Some("/v1/docker"));
    }

    #[test]
    fn data_root_reads_legacy_graph_key() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(0), r#"{"graph": "/v1/docker"}"#, "");

        let root = docker_data_root(&shell(&runner), host()).expect("probe succeeds");
        assert_eq!(root.as_deref(), Some("/v1/docker"));
    }

    #[test]
    fn data_root_missing_config_is_none() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(1), "", "cat: /etc/docker/daemon.json: No such file");

        let root = docker_data_root(&shell(&runner), host()).expect("absence is not an error");
        assert_eq!(root, None);
    }

    #[test]
    fn stop_docker_stops_containers_then_daemon() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        runner.push_success();

        stop_docker(&shell(&runner), host()).expect("both steps scripted");

        let commands: Vec<String> = runner
            .invocations()
            .iter()
            .map(crate::test_support::CommandInvocation::command_string)
            .collect();
        assert!(
            commands.first().is_some_and(|cmd| cmd.contains("docker stop")),
            "commands: {commands:?}"
        );
        assert!(
            commands
                .get(1)
                .is_some_and(|cmd| cmd.contains("service docker stop")),
            "commands: {commands:?}"
        );
    }

    #[test]
    fn set_docker_folder_writes_daemon_config() {
        let runner = ScriptedRunner::new();
        runner.succeed_when_empty();

        set_docker_folder(&shell(&runner), host(), "/v1").expect("all steps scripted");

        let rendered: Vec<String> = runner
            .invocations()
            .iter()
            .map(crate::test_support::CommandInvocation::command_string)
            .collect();
        assert!(
            rendered
                .iter()
                .any(|command| command.contains("/etc/docker/daemon.json")
                    && command.contains("/v1/docker")),
            "rendered: {rendered:?}"
        );
    }
}
