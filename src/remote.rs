//! Remote command execution over the system `ssh` client.
//!
//! The drive manager formats, mounts, and probes devices by running
//! commands on the node as the operating user. Probes are "quiet": a
//! failing probe command is a normal negative answer, not an error, so
//! callers inspect [`CommandOutput::is_success`] instead of catching
//! failures. Only the inability to run `ssh` at all is an error.

use std::ffi::OsString;
use std::net::IpAddr;
use std::process::Command;
use std::time::Duration;

use camino::Utf8PathBuf;
use thiserror::Error;
use tokio::time::sleep;

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError>;
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, RemoteError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| RemoteError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Connection settings for reaching nodes over SSH.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SshConfig {
    /// Path to the `ssh` executable.
    pub ssh_bin: String,
    /// Remote user to connect as.
    pub user: String,
    /// Private key file; `None` lets `ssh` pick its defaults.
    pub key_file: Option<Utf8PathBuf>,
    /// TCP port for SSH.
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            ssh_bin: String::from("ssh"),
            user: String::from("ec2-user"),
            key_file: None,
            port: DEFAULT_SSH_PORT,
        }
    }
}

impl SshConfig {
    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when any required field is
    /// empty.
    pub fn validate(&self) -> Result<(), RemoteError> {
        Self::require_value(&self.ssh_bin, "ssh_bin")?;
        Self::require_value(&self.user, "user")?;
        Ok(())
    }

    fn require_value(value: &str, field: &str) -> Result<(), RemoteError> {
        if value.trim().is_empty() {
            return Err(RemoteError::InvalidConfig {
                field: field.to_owned(),
            });
        }
        Ok(())
    }
}

/// Errors surfaced by the remote command channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RemoteError {
    /// Raised when configuration is missing required values.
    #[error("invalid ssh configuration: missing {field}")]
    InvalidConfig {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a command cannot be spawned.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Command that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised by checked execution when the remote command exits non-zero.
    #[error("remote command `{command}` exited with status {status_text}: {stderr}")]
    CommandFailure {
        /// Command that was executed on the node.
        command: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the remote command.
        stderr: String,
    },
}

/// Executes commands on nodes through the system `ssh` client.
#[derive(Clone, Debug)]
pub struct RemoteShell<R: CommandRunner> {
    config: SshConfig,
    runner: R,
}

impl RemoteShell<ProcessCommandRunner> {
    /// Convenience constructor that wires the real process runner.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when validation fails.
    pub fn with_process_runner(config: SshConfig) -> Result<Self, RemoteError> {
        Self::new(config, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> RemoteShell<R> {
    /// Creates a new shell using the provided runner and configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::InvalidConfig`] when configuration validation
    /// fails.
    pub fn new(config: SshConfig, runner: R) -> Result<Self, RemoteError> {
        config.validate()?;
        Ok(Self { config, runner })
    }

    /// The remote user commands run as.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.config.user
    }

    /// Runs a command and returns its output, whatever the exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when `ssh` itself cannot be started.
    pub fn exec(&self, host: IpAddr, command: &str) -> Result<CommandOutput, RemoteError> {
        let args = self.build_ssh_args(host, command);
        self.runner.run(&self.config.ssh_bin, &args)
    }

    /// Runs a command and demands a zero exit code.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::CommandFailure`] on a non-zero exit, or
    /// [`RemoteError::Spawn`] when `ssh` cannot be started.
    pub fn check(&self, host: IpAddr, command: &str) -> Result<CommandOutput, RemoteError> {
        let output = self.exec(host, command)?;
        if output.is_success() {
            return Ok(output);
        }

        let status_text = output
            .code
            .map_or_else(|| String::from("unknown"), |code| code.to_string());
        Err(RemoteError::CommandFailure {
            command: command.to_owned(),
            status_text,
            stderr: output.stderr,
        })
    }

    /// Quiet probe: runs a command and reports only whether it succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when `ssh` cannot be started; a
    /// failing probe command is `Ok(false)`, not an error.
    pub fn probe(&self, host: IpAddr, command: &str) -> Result<bool, RemoteError> {
        Ok(self.exec(host, command)?.is_success())
    }

    /// Polls until the node accepts SSH commands.
    ///
    /// The wait is indefinite; an unreachable node is expected provider
    /// lag right after launch, not a failure.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::Spawn`] when `ssh` cannot be started.
    pub async fn wait_ready(&self, host: IpAddr, poll_interval: Duration) -> Result<(), RemoteError> {
        tracing::info!(host = %host, "waiting for ssh");
        loop {
            if self.probe(host, "sudo ls")? {
                tracing::info!(host = %host, "ssh connected");
                return Ok(());
            }
            sleep(poll_interval).await;
        }
    }

    fn build_ssh_args(&self, host: IpAddr, command: &str) -> Vec<OsString> {
        let mut args = vec![
            OsString::from("-p"),
            OsString::from(self.config.port.to_string()),
            OsString::from("-o"),
            OsString::from("BatchMode=yes"),
            OsString::from("-o"),
            OsString::from("StrictHostKeyChecking=no"),
            OsString::from("-o"),
            OsString::from("UserKnownHostsFile=/dev/null"),
        ];
        if let Some(key_file) = &self.config.key_file {
            args.push(OsString::from("-i"));
            args.push(OsString::from(key_file.as_str()));
        }
        args.push(OsString::from(format!("{}@{host}", self.config.user)));
        args.push(OsString::from(command));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedRunner;
    use std::net::Ipv4Addr;

    fn shell(runner: ScriptedRunner) -> RemoteShell<ScriptedRunner> {
        let config = SshConfig {
            key_file: Some(Utf8PathBuf::from("/home/me/.aws/key.pem")),
            ..SshConfig::default()
        };
        RemoteShell::new(config, runner).expect("default config validates")
    }

    fn host() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))
    }

    #[test]
    fn config_rejects_blank_user() {
        let config = SshConfig {
            user: String::from("  "),
            ..SshConfig::default()
        };
        assert_eq!(
            config.validate(),
            Err(RemoteError::InvalidConfig {
                field: String::from("user")
            })
        );
    }

    #[test]
    fn exec_builds_batch_mode_invocation() {
        let runner = ScriptedRunner::new();
        runner.push_success();
        let sh = shell(runner.clone());

        sh.exec(host(), "sudo blkid /dev/xvdf")
            .expect("scripted response available");

        let invocations = runner.invocations();
        let rendered = invocations
            .first()
            .expect("one invocation recorded")
            .command_string();
        assert!(rendered.contains("BatchMode=yes"), "rendered: {rendered}");
        assert!(
            rendered.contains("-i /home/me/.aws/key.pem"),
            "rendered: {rendered}"
        );
        assert!(
            rendered.ends_with("ec2-user@203.0.113.9 sudo blkid /dev/xvdf"),
            "rendered: {rendered}"
        );
    }

    #[test]
    fn probe_reports_failure_as_negative_not_error() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(2);
        let sh = shell(runner);

        let visible = sh.probe(host(), "sudo ls -l /dev/xvdf");
        assert_eq!(visible, Ok(false));
    }

    #[test]
    fn check_surfaces_stderr_on_failure() {
        let runner = ScriptedRunner::new();
        runner.push_output(Some(32), "", "mount: /v1: special device does not exist");
        let sh = shell(runner);

        let err = sh
            .check(host(), "sudo mount /dev/xvdf /v1")
            .expect_err("non-zero exit must fail checked execution");
        assert!(
            matches!(
                err,
                RemoteError::CommandFailure { ref stderr, .. }
                    if stderr.contains("special device does not exist")
            ),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn wait_ready_polls_until_probe_succeeds() {
        let runner = ScriptedRunner::new();
        runner.push_exit_code(255);
        runner.push_exit_code(255);
        runner.push_success();
        let sh = shell(runner.clone());

        sh.wait_ready(host(), Duration::from_millis(1))
            .await
            .expect("third probe succeeds");
        assert_eq!(runner.invocations().len(), 3);
    }
}
