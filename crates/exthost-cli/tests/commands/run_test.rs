//! Tests for the `run` command. These start real process hosts.

use assert_cmd::Command;
use predicates::prelude::*;

use super::{write_manifest, MANIFEST};

#[test]
fn test_run_activates_by_event() {
    let (_dir, path) = write_manifest(MANIFEST);
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("run").arg(&path).arg("--event").arg("onFoo");

    let output = cmd.assert().success().get_output().stdout.clone();
    let status: serde_json::Value = serde_json::from_slice(&output).unwrap();

    assert_eq!(status["pub.local"]["isActive"], true);
    assert_eq!(status["pub.local"]["runningLocation"], "local-process");
    assert_eq!(
        status["pub.local"]["activationTimes"]["activationEvent"],
        "onFoo"
    );
    assert_eq!(status["pub.lazy"]["isActive"], false);
    // Web-only extensions have no host without a web worker.
    assert!(status.get("pub.web").is_none());
}

#[test]
fn test_run_without_events_activates_nothing() {
    let (_dir, path) = write_manifest(MANIFEST);
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("run").arg(&path);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("\"pub.local\""))
        .stdout(predicate::str::contains("\"isActive\": true").not());
}
