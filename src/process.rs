//! Liveness probes and signal delivery for the recorded daemon PID.
use std::{
    thread,
    time::{Duration, Instant, SystemTime},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::debug;

use crate::error::SignalError;

/// Result of sending a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The signal was delivered.
    Delivered,
    /// No process owns the PID.
    NoSuchProcess,
}

/// Read access to the process table plus signal delivery.
pub trait ProcessTable {
    /// PID of the calling process.
    fn current_pid(&self) -> u32;

    /// Returns whether `pid` names a live (non-zombie) process.
    fn is_alive(&self, pid: u32) -> Result<bool, SignalError>;

    /// Sends `signal` to `pid`.
    fn signal(&self, pid: u32, signal: Signal) -> Result<Delivery, SignalError>;

    /// When `pid` started, if the platform exposes it.
    fn start_time(&self, pid: u32) -> Option<SystemTime>;
}

/// [`ProcessTable`] backed by `kill(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcesses;

fn to_pid(pid: u32) -> Result<Pid, SignalError> {
    // 0 and negative values address process groups, never a single process.
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
        _ => Err(SignalError::OutOfRange(pid)),
    }
}

impl ProcessTable for SystemProcesses {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    fn is_alive(&self, pid: u32) -> Result<bool, SignalError> {
        match signal::kill(to_pid(pid)?, None) {
            Ok(()) => Ok(!is_zombie(pid)),
            Err(Errno::ESRCH) => Ok(false),
            // The process exists but belongs to another user.
            Err(Errno::EPERM) => Ok(true),
            Err(source) => Err(SignalError::Probe { pid, source }),
        }
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<Delivery, SignalError> {
        match signal::kill(to_pid(pid)?, Some(sig)) {
            Ok(()) => {
                debug!("Sent {sig} to PID {pid}");
                Ok(Delivery::Delivered)
            }
            Err(Errno::ESRCH) => Ok(Delivery::NoSuchProcess),
            Err(source) => Err(SignalError::Deliver {
                pid,
                signal: sig,
                source,
            }),
        }
    }

    fn start_time(&self, pid: u32) -> Option<SystemTime> {
        process_start_time(pid)
    }
}

/// Zombies still answer `kill(pid, 0)` until reaped, but they are not running.
#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // The state character follows the parenthesised command name, which may contain spaces.
    stat.rfind(')')
        .and_then(|end| stat[end + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Start time from `/proc/<pid>/stat` (clock ticks since boot) and `btime` in `/proc/stat`.
///
/// Resolution is limited by `btime`, which is whole seconds.
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<SystemTime> {
    use std::{fs, time::UNIX_EPOCH};

    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let fields = &stat[stat.rfind(')')? + 1..];
    // starttime is field 22; the fields after the command name start at field 3.
    let ticks: u64 = fields.split_whitespace().nth(19)?.parse().ok()?;

    let boot: u64 = fs::read_to_string("/proc/stat")
        .ok()?
        .lines()
        .find_map(|line| line.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;

    // SAFETY: sysconf has no preconditions.
    let hz = u64::try_from(unsafe { libc::sysconf(libc::_SC_CLK_TCK) }).ok()?;
    if hz == 0 {
        return None;
    }

    Some(UNIX_EPOCH + Duration::from_secs(boot) + Duration::from_millis(ticks * 1000 / hz))
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<SystemTime> {
    None
}

/// Polls until `pid` is gone or `timeout` elapses. Returns whether the process exited.
pub fn wait_for_exit<P: ProcessTable + ?Sized>(
    processes: &P,
    pid: u32,
    timeout: Duration,
    interval: Duration,
) -> Result<bool, SignalError> {
    let deadline = Instant::now() + timeout;

    loop {
        if !processes.is_alive(pid)? {
            return Ok(true);
        }
        if Instant::now() >= deadline {
            return Ok(false);
        }
        thread::sleep(interval);
    }
}
