//! Command-line interface for webd.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::{Config, NumberOrString, StalePolicy, TimeoutPolicy};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" | "information" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for webd.
#[derive(Parser, Debug)]
#[command(name = "webd", version, author)]
#[command(
    about = "Run a web-application server as a background daemon tracked by a pidfile",
    long_about = None
)]
pub struct Cli {
    /// Path to the configuration file (defaults to `webd.yaml` when present).
    #[arg(short, long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Host the server binds to (dotted IPv4).
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port the server binds to.
    #[arg(long, global = true)]
    pub port: Option<String>,

    /// Pidfile location.
    #[arg(long, value_name = "PATH", global = true)]
    pub pidfile: Option<PathBuf>,

    /// Graceful shutdown budget, e.g. `10s` or `500ms`.
    #[arg(long, value_name = "DURATION", global = true)]
    pub stop_timeout: Option<String>,

    /// What `stop` does once the graceful budget elapses (`kill` or `fail`).
    #[arg(long, value_name = "POLICY", global = true)]
    pub on_timeout: Option<TimeoutPolicy>,

    /// What `start` does with a stale pidfile (`reclaim` or `refuse`).
    #[arg(long, value_name = "POLICY", global = true)]
    pub stale_pidfile: Option<StalePolicy>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Applies command-line overrides on top of the loaded configuration.
    ///
    /// Paths given here are relative to the operator's directory; callers resolve them
    /// afterwards with [`Config::resolve_paths`].
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = &self.port {
            config.port = NumberOrString::Text(port.clone());
        }
        if let Some(pidfile) = &self.pidfile {
            config.pidfile = Some(pidfile.clone());
        }
        if let Some(timeout) = &self.stop_timeout {
            config.stop_timeout = timeout.clone();
        }
        if let Some(policy) = self.on_timeout {
            config.on_timeout = policy;
        }
        if let Some(policy) = self.stale_pidfile {
            config.stale_pidfile = policy;
        }
    }
}

/// Available commands for webd.
#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Start the daemon unless one is already running.
    Start {
        /// Run the server without detaching from the terminal.
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the running daemon.
    Stop,
    /// Stop the daemon if it is running, then start it again.
    Restart {
        /// Run the new server without detaching from the terminal.
        #[arg(long)]
        foreground: bool,
    },
}

/// Parses command-line arguments.
pub fn parse_args() -> Cli {
    Cli::parse()
}
