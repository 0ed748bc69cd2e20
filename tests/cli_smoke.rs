//! Behavioural smoke test for the CLI entrypoint.

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;

#[test]
fn cli_help_lists_lifecycle_subcommands() {
    let mut cmd = cargo_bin_cmd!("spotdrive");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(contains("create"))
        .stdout(contains("terminate"))
        .stdout(contains("disconnect"));
}

#[test]
fn cli_without_arguments_shows_usage_and_fails() {
    let mut cmd = cargo_bin_cmd!("spotdrive");
    cmd.assert().failure().stderr(contains("Usage"));
}
