//! Tests for the `host-runner` command.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_host_runner_answers_start_and_ping() {
    let input = [
        r#"{"kind":"start","request_id":1,"protocol_version":1,"host_kind":"local-process"}"#,
        r#"{"kind":"ping","request_id":2}"#,
        r#"{"kind":"shutdown","request_id":3}"#,
    ]
    .join("\n");

    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("host-runner").write_stdin(input);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(
            r#"{"kind":"ack","request_id":1,"protocol_version":1}"#,
        ))
        .stdout(predicate::str::contains(r#"{"kind":"pong","request_id":2}"#))
        .stdout(predicate::str::contains(r#"{"kind":"ack","request_id":3}"#));
}

#[test]
fn test_host_runner_rejects_unknown_kind() {
    let mut cmd = Command::cargo_bin("exthost").unwrap();
    cmd.arg("host-runner").arg("--kind").arg("mainframe");

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("unknown extension host kind"));
}
