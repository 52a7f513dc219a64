//! Constants and default values for the webd lifecycle controller.
//!
//! This module centralizes the magic numbers, paths and exit codes used throughout the
//! crate so the binary, the controller and the tests agree on them.

use std::time::Duration;

// ============================================================================
// Exit Codes
// ============================================================================

/// Process exit codes reported by the `webd` binary.
///
/// Every lifecycle failure maps to its own code so scripts driving `webd` can branch
/// without scraping stderr.
pub mod exit_code {
    /// The command completed.
    pub const SUCCESS: i32 = 0;
    /// Unclassified failure (I/O, configuration, workload launch).
    pub const FAILURE: i32 = 1;
    /// Bad command-line usage or an invalid bind address. Matches clap's own code.
    pub const USAGE: i32 = 2;
    /// `start` found a live instance.
    pub const ALREADY_RUNNING: i32 = 3;
    /// `stop` found no pidfile.
    pub const NOT_RUNNING: i32 = 4;
    /// A stale pidfile was found and the configured policy refuses to reclaim it.
    pub const STALE_STATE: i32 = 5;
    /// A step of the detachment sequence failed.
    pub const DETACHMENT: i32 = 6;
    /// The daemon did not exit within the shutdown budget.
    pub const SHUTDOWN_TIMEOUT: i32 = 7;
    /// Another lifecycle command holds the pidfile lock.
    pub const LOCK_CONTENDED: i32 = 8;
}

// ============================================================================
// Workload Defaults
// ============================================================================

/// Default application target handed to the server.
pub const DEFAULT_TARGET: &str = "app:app";

/// Default bind host.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default bind port.
pub const DEFAULT_PORT: u16 = 8080;

/// Default server program.
pub const DEFAULT_PROGRAM: &str = "uvicorn";

/// Default argument template for the server program.
pub const DEFAULT_ARGS: [&str; 5] = ["{target}", "--host", "{host}", "--port", "{port}"];

// ============================================================================
// Paths
// ============================================================================

/// Configuration file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "webd.yaml";

/// Pidfile used when running as root.
pub const SYSTEM_PIDFILE: &str = "/var/run/webd.pid";

/// Pidfile location relative to `$HOME` for unprivileged users.
pub const USER_PIDFILE: &str = ".local/share/webd/webd.pid";

/// Suffix appended to the pidfile path to form the advisory lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Null device used for every standard stream by default.
pub const DEV_NULL: &str = "/dev/null";

/// Working directory of the detached daemon.
pub const DEFAULT_WORKING_DIRECTORY: &str = "/";

/// File-creation mask installed in the detached daemon.
pub const DEFAULT_UMASK: u32 = 0o022;

// ============================================================================
// Shutdown Timing
// ============================================================================

/// How long `stop` waits for the daemon to honour SIGTERM.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `stop` waits after escalating to SIGKILL.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between liveness probes while waiting for exit.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A recorded PID whose process started this long after the pidfile was written belongs to
/// an unrelated process that reused the PID. Covers the whole-second resolution of boot time.
pub const PID_REUSE_SLACK: Duration = Duration::from_secs(2);
