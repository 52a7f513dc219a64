//! Error handling for webd.
use std::{io, path::PathBuf, time::Duration};

use nix::{errno::Errno, sys::signal::Signal};
use thiserror::Error;

use crate::{
    constants::exit_code,
    daemonize::{DetachStage, StdStream},
};

/// Errors raised while validating the bind address handed to the workload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// The host did not split into exactly four dot-separated parts.
    #[error("IP address '{host}' should be structured from 4 parts, found {parts}")]
    SegmentCount {
        /// The rejected host.
        host: String,
        /// Number of dot-separated parts found.
        parts: usize,
    },

    /// One of the parts was not an integer between 0 and 255.
    #[error("invalid IP address '{host}': octet '{octet}' is not in 0-255")]
    Octet {
        /// The rejected host.
        host: String,
        /// The offending part.
        octet: String,
    },

    /// The port was not an integer in the TCP port range.
    #[error("invalid port '{port}': must be an integer between 0 and 65535")]
    Port {
        /// The rejected port text.
        port: String,
    },
}

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the configuration file.
    #[error("Failed to read config file '{}': {source}", path.display())]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The configuration referenced an environment variable that is not set.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the variable.
        name: String,
    },

    /// A duration field could not be parsed.
    #[error("Invalid duration value: '{value}'")]
    Duration {
        /// The rejected text.
        value: String,
    },

    /// The umask field was not an octal permission mask.
    #[error("Invalid umask value: '{value}'")]
    Umask {
        /// The rejected text.
        value: String,
    },

    /// The working directory could not be determined for resolving relative paths.
    #[error("Failed to resolve the current directory: {0}")]
    CurrentDir(#[source] io::Error),
}

/// Error type for pidfile operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// Error reading the pidfile.
    #[error("Failed to read PID file '{}': {source}", path.display())]
    Read {
        /// Pidfile path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error creating or writing the pidfile.
    #[error("Failed to write PID file '{}': {source}", path.display())]
    Write {
        /// Pidfile path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error deleting the pidfile.
    #[error("Failed to remove PID file '{}': {source}", path.display())]
    Remove {
        /// Pidfile path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The pidfile appeared between the state check and its exclusive creation.
    #[error("PID file '{}' already exists", path.display())]
    Exists {
        /// Pidfile path.
        path: PathBuf,
    },

    /// The pidfile does not hold a decimal process identifier.
    #[error("PID file '{}' holds no valid PID: {contents:?}", path.display())]
    Parse {
        /// Pidfile path.
        path: PathBuf,
        /// Raw file contents.
        contents: String,
    },

    /// The advisory lock file could not be opened or locked.
    #[error("Failed to lock '{}': {source}", path.display())]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Another lifecycle command currently holds the lock.
    #[error("another webd command is operating on '{}'", path.display())]
    Contended {
        /// Lock file path.
        path: PathBuf,
    },
}

/// Errors raised while probing or signalling a process.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Probing the process with signal 0 failed for a reason other than `ESRCH`.
    #[error("Failed to probe process {pid}: {source}")]
    Probe {
        /// Target process.
        pid: u32,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// Delivering a signal failed for a reason other than `ESRCH`.
    #[error("Failed to send {signal} to process {pid}: {source}")]
    Deliver {
        /// Target process.
        pid: u32,
        /// Signal that could not be delivered.
        signal: Signal,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// The pid does not fit the platform's `pid_t`.
    #[error("PID {0} is out of range")]
    OutOfRange(u32),
}

/// Errors raised by the detachment sequence. All of them are fatal.
#[derive(Debug, Error)]
pub enum DetachError {
    /// One of the two forks failed.
    #[error("fork failed in the {stage} process: {source}")]
    Fork {
        /// Process that attempted the fork.
        stage: DetachStage,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// `setsid` failed.
    #[error("failed to become a session leader: {0}")]
    Session(#[source] Errno),

    /// Changing to the daemon's working directory failed.
    #[error("failed to change directory to '{}': {source}", path.display())]
    WorkingDirectory {
        /// Requested directory.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A redirection target could not be opened.
    #[error("failed to open {stream} target '{}': {source}", path.display())]
    OpenStream {
        /// Stream being redirected.
        stream: StdStream,
        /// Target path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Rebinding a standard descriptor failed.
    #[error("failed to rebind {stream}: {source}")]
    Redirect {
        /// Stream being redirected.
        stream: StdStream,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The pipe the daemon reports its startup through could not be set up.
    #[error("failed to create the readiness pipe: {0}")]
    ReadinessPipe(#[source] Errno),

    /// Reading the daemon's startup report failed.
    #[error("failed to read the daemon's startup report: {0}")]
    ReadReport(#[source] io::Error),

    /// The daemon went away without reporting that its pidfile was written.
    #[error("the daemon exited before recording its PID")]
    NoReport,
}

/// Errors raised when handing control to the workload.
#[derive(Debug, Error)]
pub enum WorkloadError {
    /// Replacing the process image with the server program failed.
    #[error("Failed to launch '{program}': {source}")]
    Exec {
        /// Program that could not be executed.
        program: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Defines every failure a lifecycle command can report.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// The bind host or port is malformed.
    #[error(transparent)]
    InvalidAddress(#[from] AddressError),

    /// `start` found a live daemon.
    #[error("daemon already running with pid {pid}")]
    AlreadyRunning {
        /// PID recorded in the existing pidfile.
        pid: u32,
    },

    /// `stop` found no pidfile.
    #[error("pidfile '{}' does not exist. Daemon not running?", path.display())]
    NotRunning {
        /// Pidfile path.
        path: PathBuf,
    },

    /// A stale pidfile was found and the configured policy refuses to reclaim it.
    #[error(
        "pidfile '{}' is stale (recorded pid: {pid:?}); remove it to start again",
        path.display()
    )]
    StaleState {
        /// PID recorded in the stale pidfile.
        pid: Option<u32>,
        /// Pidfile path.
        path: PathBuf,
    },

    /// The detachment sequence failed.
    #[error("failed to daemonize: {0}")]
    Detachment(#[from] DetachError),

    /// The daemon ignored termination within the shutdown budget.
    #[error("daemon (pid {pid}) did not exit within {timeout:?}")]
    ShutdownTimeout {
        /// PID that is still alive.
        pid: u32,
        /// Budget that elapsed.
        timeout: Duration,
    },

    /// Error for pidfile handling.
    #[error(transparent)]
    PidFile(#[from] PidFileError),

    /// Error probing or signalling the daemon.
    #[error(transparent)]
    Signal(#[from] SignalError),

    /// Error launching the workload.
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    /// Error loading configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The detached daemon failed after the operator's process forked it.
    #[error("{message}")]
    DaemonFailed {
        /// Exit code the daemon reported.
        code: i32,
        /// The daemon's error message.
        message: String,
    },
}

impl LifecycleError {
    /// Process exit code reported for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            LifecycleError::InvalidAddress(_) => exit_code::USAGE,
            LifecycleError::AlreadyRunning { .. } => exit_code::ALREADY_RUNNING,
            LifecycleError::NotRunning { .. } => exit_code::NOT_RUNNING,
            LifecycleError::StaleState { .. } => exit_code::STALE_STATE,
            LifecycleError::Detachment(_) => exit_code::DETACHMENT,
            LifecycleError::ShutdownTimeout { .. } => exit_code::SHUTDOWN_TIMEOUT,
            LifecycleError::PidFile(PidFileError::Contended { .. }) => {
                exit_code::LOCK_CONTENDED
            }
            LifecycleError::DaemonFailed { code, .. } => *code,
            LifecycleError::PidFile(_)
            | LifecycleError::Signal(_)
            | LifecycleError::Workload(_)
            | LifecycleError::Config(_) => exit_code::FAILURE,
        }
    }
}
