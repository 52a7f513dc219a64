#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid as NixPid,
};
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(50);

/// A scratch directory holding a config, the pidfile and whatever the workload writes.
///
/// Dropping it SIGKILLs whatever PID the pidfile still names so no daemon outlives a test.
pub struct Sandbox {
    dir: TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create tempdir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn pidfile(&self) -> PathBuf {
        self.path().join("webd.pid")
    }

    pub fn marker(&self) -> PathBuf {
        self.path().join("marker")
    }

    /// Writes `webd.yaml` with a shell workload that records its arguments in the marker
    /// file, then execs `sleep`. `preamble` runs first inside the same shell.
    pub fn write_config(&self, preamble: &str, extra: &str) {
        let script = format!(
            "{preamble} echo \"$0 $1 $2\"; echo \"$0 $1 $2\" >> {}; exec sleep 30",
            self.marker().display()
        );
        let config = format!(
            r#"pidfile: "webd.pid"
program: "sh"
args:
  - "-c"
  - '{script}'
  - "{{target}}"
  - "{{host}}"
  - "{{port}}"
stop_timeout: "2s"
kill_timeout: "2s"
{extra}
"#
        );
        fs::write(self.path().join("webd.yaml"), config).expect("failed to write config");
    }

    pub fn webd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("webd"));
        cmd.current_dir(self.path()).env_remove("RUST_LOG");
        cmd
    }

    pub fn read_pid(&self) -> Option<u32> {
        fs::read_to_string(self.pidfile())
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }

    /// Waits until the workload has written `lines` lines to the marker file.
    pub fn wait_for_marker(&self, lines: usize) -> Vec<String> {
        wait_for_lines(&self.marker(), lines)
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(pid) = self.read_pid()
            && let Ok(raw) = i32::try_from(pid)
        {
            let _ = kill(NixPid::from_raw(raw), Signal::SIGKILL);
        }
    }
}

pub fn wait_for_lines(path: &Path, expected: usize) -> Vec<String> {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Ok(content) = fs::read_to_string(path) {
            let lines: Vec<_> = content.lines().map(|line| line.to_string()).collect();
            if lines.len() >= expected {
                return lines;
            }
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for {expected} lines in {:?}", path);
        }

        thread::sleep(POLL);
    }
}

pub fn wait_for_content(path: &Path, needle: &str) -> String {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        if let Ok(content) = fs::read_to_string(path)
            && content.contains(needle)
        {
            return content;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for '{needle}' in {:?}", path);
        }

        thread::sleep(POLL);
    }
}

/// Live means present in the process table and neither a zombie nor dead.
pub fn is_process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system
        .process(pid)
        .is_some_and(|process| !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(POLL);
    }
    panic!("Timed out waiting for PID {pid} to exit");
}
