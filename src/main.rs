//! Binary entry point for the spotdrive CLI.

use std::io::{self, Write};
use std::process;

use clap::Parser;
use thiserror::Error;

use spotdrive::{
    DEFAULT_AWS_BIN, DriveError, Ec2Cli, Ec2Error, NodeController, NodeError, NodeRequest,
    RemoteError, RemoteShell, ToolkitConfig,
};

#[derive(Debug, Parser)]
#[command(
    name = "spotdrive",
    about = "Disposable cloud nodes with persistent, snapshot-backed drives",
    arg_required_else_help = true
)]
enum Cli {
    #[command(about = "Create a node, optionally connecting a drive")]
    Create {
        /// Name tag for the new node.
        name: String,
        /// Tier label from the configuration tables.
        #[arg(long, default_value = "free")]
        tier: String,
        /// Request interruptible spot capacity.
        #[arg(long)]
        spot: bool,
        /// Drive to connect (initialised on first use).
        #[arg(long)]
        drive: Option<String>,
        /// Size for a newly initialised drive, in GiB.
        #[arg(long, default_value_t = 10)]
        drive_size: u32,
        /// Boot volume size override, in GiB.
        #[arg(long)]
        boot_size: Option<u32>,
    },
    #[command(about = "Terminate a node, saving its drive as a snapshot")]
    Terminate {
        /// Name of the node to terminate.
        name: String,
        /// Discard the drive volume instead of snapshotting it.
        #[arg(long)]
        discard_drive: bool,
    },
    #[command(about = "Attach, format if new, and mount a drive on a node")]
    Connect {
        /// Drive name.
        drive: String,
        /// Node to connect it to.
        instance: String,
    },
    #[command(about = "Unmount, detach, snapshot, and delete a drive's volume")]
    Disconnect {
        /// Drive name.
        drive: String,
        /// Discard the volume without a snapshot.
        #[arg(long)]
        discard: bool,
    },
    #[command(about = "Snapshot a drive's live volume")]
    Snapshot {
        /// Drive name.
        drive: String,
    },
    #[command(about = "Grow a drive and its filesystem in place")]
    Resize {
        /// Drive name.
        drive: String,
        /// New size in GiB; must exceed the current size.
        size_gib: u32,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Node(#[from] NodeError<Ec2Error>),
    #[error("drive operation failed: {0}")]
    Drive(#[from] DriveError<Ec2Error>),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_target(false).init();
    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let config =
        ToolkitConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    let provider = Ec2Cli::with_process_runner(String::from(DEFAULT_AWS_BIN), config.region.clone());
    let shell = RemoteShell::with_process_runner(config.ssh_config())?;
    let controller = NodeController::new(provider, shell, config);

    match cli {
        Cli::Create {
            name,
            tier,
            spot,
            drive,
            drive_size,
            boot_size,
        } => {
            let mut request = NodeRequest::new(name)
                .with_tier(tier)
                .with_drive_size(drive_size);
            if let Some(drive) = drive {
                request = request.with_drive(drive);
            }
            if let Some(boot_size) = boot_size {
                request = request.with_boot_size(boot_size);
            }
            if spot {
                request = request.spot();
            }
            controller.create(&request).await?;
            Ok(())
        }
        Cli::Terminate {
            name,
            discard_drive,
        } => Ok(controller.terminate(&name, !discard_drive).await?),
        Cli::Connect { drive, instance } => Ok(controller.connect_drive(&drive, &instance).await?),
        Cli::Disconnect { drive, discard } => {
            Ok(controller.disconnect_drive(&drive, !discard).await?)
        }
        Cli::Snapshot { drive } => {
            controller.drive(&drive).create_snapshot().await?;
            Ok(())
        }
        Cli::Resize { drive, size_gib } => Ok(controller.resize_drive(&drive, size_gib).await?),
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_renders_config_errors() {
        let mut buf = Vec::new();
        let err = CliError::Config(String::from("missing spot price"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(
            rendered.contains("configuration error: missing spot price"),
            "rendered: {rendered}"
        );
    }

    #[test]
    fn cli_parses_create_with_drive_flags() {
        let cli = Cli::try_parse_from([
            "spotdrive",
            "create",
            "workbench",
            "--tier",
            "gpu",
            "--spot",
            "--drive",
            "data",
            "--drive-size",
            "20",
        ])
        .expect("arguments are valid");
        let Cli::Create {
            name,
            tier,
            spot,
            drive,
            drive_size,
            boot_size,
        } = cli
        else {
            panic!("expected the create subcommand");
        };
        assert_eq!(name, "workbench");
        assert_eq!(tier, "gpu");
        assert!(spot);
        assert_eq!(drive.as_deref(), Some("data"));
        assert_eq!(drive_size, 20);
        assert_eq!(boot_size, None);
    }
}
