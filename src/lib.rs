//! webd runs a web-application server as a classic Unix daemon. It detaches through a
//! double fork, records the server's PID in a pidfile and uses that pidfile to answer
//! `start`, `stop` and `restart` from any later invocation.

/// Bind address validation.
pub mod address;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Shared constants.
pub mod constants;

/// Detachment from the controlling terminal.
pub mod daemonize;

/// Error handling.
pub mod error;

/// Start/stop/restart controller.
pub mod lifecycle;

/// Pidfile storage and locking.
pub mod pidfile;

/// Liveness probes and signal delivery.
pub mod process;

/// The server process launched by the daemon.
pub mod workload;

#[cfg(test)]
mod test_utils;
