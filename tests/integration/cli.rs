#[path = "common/mod.rs"]
mod common;

use common::Sandbox;
use predicates::prelude::*;

#[test]
fn missing_command_is_a_usage_error() {
    let sandbox = Sandbox::new();
    sandbox.webd().assert().code(2);
}

#[test]
fn unknown_command_is_a_usage_error() {
    let sandbox = Sandbox::new();
    sandbox
        .webd()
        .arg("status")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("status"));
}

#[test]
fn invalid_log_level_is_a_usage_error() {
    let sandbox = Sandbox::new();
    sandbox
        .webd()
        .args(["--log-level", "loud", "stop"])
        .assert()
        .code(2);
}

#[test]
fn out_of_range_octet_is_rejected_before_anything_happens() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox
        .webd()
        .args(["start", "--host", "999.1.1.1"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("999"));

    assert!(!sandbox.pidfile().exists());
    assert!(!sandbox.path().join("webd.pid.lock").exists());
    assert!(!sandbox.marker().exists());
}

#[test]
fn wrong_segment_count_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox
        .webd()
        .args(["start", "--host", "10.0.0"])
        .assert()
        .code(2);

    assert!(!sandbox.pidfile().exists());
}

#[test]
fn non_numeric_port_is_rejected() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    for port in ["80a", "70000"] {
        sandbox
            .webd()
            .args(["start", "--port", port])
            .assert()
            .code(2);
    }

    assert!(!sandbox.pidfile().exists());
}

#[test]
fn invalid_address_is_rejected_for_stop_too() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "host: \"1.2.3.4.5\"");

    sandbox.webd().arg("stop").assert().code(2);
}

#[test]
fn missing_config_file_is_a_failure() {
    let sandbox = Sandbox::new();

    sandbox
        .webd()
        .args(["--config", "absent.yaml", "stop"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("absent.yaml"));
}

#[test]
fn invalid_duration_is_a_failure() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox
        .webd()
        .args(["stop", "--stop-timeout", "soon"])
        .assert()
        .code(1);
}
