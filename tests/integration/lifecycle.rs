#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{Sandbox, is_process_alive, wait_for_content, wait_for_process_exit};
use predicates::prelude::*;

const IGNORE_TERM: &str = "trap \"\" TERM;";

fn start_daemon(sandbox: &Sandbox) -> u32 {
    sandbox
        .webd()
        .arg("start")
        .assert()
        .success()
        .stdout(predicate::str::contains("Starting daemon..."));
    // `start` returns only once the daemon has written the pidfile.
    let pid = sandbox
        .read_pid()
        .expect("pidfile should exist as soon as start returns");
    sandbox.wait_for_marker(1);
    pid
}

#[test]
fn start_detaches_and_launches_the_workload() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    let pid = start_daemon(&sandbox);

    assert_eq!(
        fs::read_to_string(sandbox.pidfile()).unwrap(),
        format!("{pid}\n")
    );
    assert_eq!(sandbox.wait_for_marker(1), ["app:app 0.0.0.0 8080"]);
    assert!(is_process_alive(pid));
}

#[test]
fn pidfile_names_a_live_daemon_as_soon_as_start_returns() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox.webd().arg("start").assert().success();

    let pid = sandbox.read_pid().expect("pidfile missing right after start");
    assert!(is_process_alive(pid));
}

#[test]
fn stop_right_after_start_always_finds_the_daemon() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    for _ in 0..5 {
        sandbox.webd().arg("start").assert().success();
        let pid = sandbox.read_pid().expect("pidfile missing right after start");
        sandbox.webd().arg("stop").assert().success();

        assert!(!sandbox.pidfile().exists());
        wait_for_process_exit(pid);
    }
}

#[test]
fn unopenable_output_fails_start_with_the_detachment_code() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "stdout: \"/nonexistent/dir/out.log\"");

    sandbox
        .webd()
        .arg("start")
        .assert()
        .code(6)
        .stderr(predicate::str::contains("stdout"));

    assert!(!sandbox.pidfile().exists());
    assert!(!sandbox.marker().exists());
}

#[test]
fn missing_program_fails_start_and_leaves_no_pidfile() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "program: \"webd-test-no-such-program\"");

    sandbox
        .webd()
        .arg("start")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("webd-test-no-such-program"));

    assert!(!sandbox.pidfile().exists());
}

#[test]
fn second_start_reports_already_running() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    let pid = start_daemon(&sandbox);

    sandbox
        .webd()
        .arg("start")
        .assert()
        .code(3)
        .stderr(predicate::str::contains(format!("already running with pid {pid}")));

    assert_eq!(sandbox.read_pid(), Some(pid));
    assert_eq!(sandbox.wait_for_marker(1).len(), 1);
}

#[test]
fn stop_terminates_the_daemon_and_removes_the_pidfile() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    let pid = start_daemon(&sandbox);

    sandbox
        .webd()
        .arg("stop")
        .assert()
        .success()
        .stdout(predicate::str::contains("Attempting to stop the daemon..."));

    assert!(!sandbox.pidfile().exists());
    wait_for_process_exit(pid);
}

#[test]
fn stop_without_pidfile_reports_not_running() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox
        .webd()
        .arg("stop")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Daemon not running?"));

    assert!(!sandbox.pidfile().exists());
}

#[test]
fn stop_clears_a_stale_pidfile() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    fs::write(sandbox.pidfile(), "999999").unwrap();

    sandbox.webd().arg("stop").assert().success();

    assert!(!sandbox.pidfile().exists());
}

#[test]
fn start_reclaims_a_stale_pidfile() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    fs::write(sandbox.pidfile(), "999999\n").unwrap();

    sandbox.webd().arg("start").assert().success();

    let pid = sandbox.read_pid().expect("pidfile missing right after start");
    assert_ne!(pid, 999_999);
    sandbox.wait_for_marker(1);
    assert!(is_process_alive(pid));
}

#[test]
fn start_refuses_a_stale_pidfile_when_configured() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "stale_pidfile: refuse");
    fs::write(sandbox.pidfile(), "999999\n").unwrap();

    sandbox
        .webd()
        .arg("start")
        .assert()
        .code(5)
        .stderr(predicate::str::contains("stale"));

    assert_eq!(fs::read_to_string(sandbox.pidfile()).unwrap(), "999999\n");
    assert!(!sandbox.marker().exists());
}

#[test]
fn restart_replaces_the_running_daemon() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    let first = start_daemon(&sandbox);

    sandbox
        .webd()
        .arg("restart")
        .assert()
        .success()
        .stdout(predicate::str::contains("Attempting to restart the daemon..."));

    let second = sandbox.read_pid().expect("pidfile missing right after restart");
    sandbox.wait_for_marker(2);
    assert_ne!(first, second);
    wait_for_process_exit(first);
    assert!(is_process_alive(second));
}

#[test]
fn restart_starts_a_daemon_when_none_is_running() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");

    sandbox.webd().arg("restart").assert().success();

    let pid = sandbox.read_pid().expect("pidfile missing right after restart");
    sandbox.wait_for_marker(1);
    assert!(is_process_alive(pid));
}

#[test]
fn stop_escalates_to_sigkill_when_term_is_ignored() {
    let sandbox = Sandbox::new();
    sandbox.write_config(IGNORE_TERM, "");
    let pid = start_daemon(&sandbox);

    sandbox
        .webd()
        .args(["stop", "--stop-timeout", "500ms"])
        .assert()
        .success();

    assert!(!sandbox.pidfile().exists());
    wait_for_process_exit(pid);
}

#[test]
fn stop_reports_a_timeout_under_the_fail_policy() {
    let sandbox = Sandbox::new();
    sandbox.write_config(IGNORE_TERM, "");
    let pid = start_daemon(&sandbox);

    sandbox
        .webd()
        .args(["stop", "--stop-timeout", "500ms", "--on-timeout", "fail"])
        .assert()
        .code(7)
        .stderr(predicate::str::contains("did not exit"));

    assert_eq!(sandbox.read_pid(), Some(pid));
    assert!(is_process_alive(pid));
}

#[test]
fn output_is_appended_by_default() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "stdout: \"out.log\"");
    let log = sandbox.path().join("out.log");
    fs::write(&log, "previous\n").unwrap();

    start_daemon(&sandbox);

    let content = wait_for_content(&log, "app:app");
    assert!(content.starts_with("previous\n"), "got {content:?}");
}

#[test]
fn output_is_truncated_when_overwrite_is_set() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "stdout: \"out.log\"\noverwrite_output: true");
    let log = sandbox.path().join("out.log");
    fs::write(&log, "previous\n").unwrap();

    start_daemon(&sandbox);

    let content = wait_for_content(&log, "app:app");
    assert!(!content.contains("previous"), "got {content:?}");
}

#[test]
fn workload_receives_the_configured_address() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "target: \"main:api\"\nhost: \"127.0.0.1\"\nport: 9000");

    start_daemon(&sandbox);

    assert_eq!(sandbox.wait_for_marker(1), ["main:api 127.0.0.1 9000"]);
}

#[cfg(target_os = "linux")]
#[test]
fn daemon_is_not_a_session_leader_and_runs_from_root() {
    let sandbox = Sandbox::new();
    sandbox.write_config("", "");
    let pid = start_daemon(&sandbox);

    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
    let fields: Vec<&str> = stat[stat.rfind(')').unwrap() + 1..]
        .split_whitespace()
        .collect();
    // state, ppid, pgrp, session
    let session: u32 = fields[3].parse().unwrap();
    assert_ne!(session, pid);

    let cwd = fs::read_link(format!("/proc/{pid}/cwd")).unwrap();
    assert_eq!(cwd, std::path::Path::new("/"));
}
