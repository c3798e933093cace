//! Basic CLI tests for the exthost command-line interface.

use assert_cmd::Command;
use predicates::prelude::*;

// Include command-specific test modules
mod commands;

/// Test that the CLI binary exists and shows help.
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("--help");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("extension hosts"))
        .stdout(predicate::str::contains("classify"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("host-runner"));
}

/// Test that the CLI shows version information.
#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("--version");

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("exthost"));
}

#[test]
fn test_verbose_flag_accepted() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("--verbose").arg("--help");

    cmd.assert().success();
}

/// Test that providing no subcommand shows an error.
#[test]
fn test_no_subcommand_shows_error() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();

    // Clap's error code for a missing required subcommand
    cmd.assert().failure().code(2);
}
