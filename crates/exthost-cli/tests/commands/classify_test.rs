//! Tests for the `classify` command.

use assert_cmd::Command;
use predicates::prelude::*;

use super::{write_manifest, MANIFEST};

#[test]
fn test_classify_requires_manifest() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("classify");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("<MANIFEST>"));
}

#[test]
fn test_classify_without_extra_hosts() {
    let (_dir, path) = write_manifest(MANIFEST);
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("classify").arg(&path);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("pub.local: local-process"))
        .stdout(predicate::str::contains("pub.web: none"));
}

#[test]
fn test_classify_with_remote_and_web_worker() {
    let (_dir, path) = write_manifest(MANIFEST);
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("classify").arg(&path).arg("--remote").arg("--web-worker");

    // Locally installed workspace extensions cannot run once a remote exists.
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("pub.local: none"))
        .stdout(predicate::str::contains("pub.web: local-web-worker"));
}

#[test]
fn test_classify_rejects_invalid_manifest() {
    let (_dir, path) = write_manifest("{ not json");
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("classify").arg(&path);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Invalid manifest"));
}

#[test]
fn test_classify_missing_file() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("classify").arg("/nonexistent/extensions.json");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read manifest"));
}
