//! The server process the daemon hands control to.
use std::{os::unix::process::CommandExt, process::Command};

use tracing::info;

use crate::{address::BindAddress, error::WorkloadError};

/// Launch specification passed to the workload unopened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadDescriptor {
    target: String,
    host: String,
    port: u16,
}

impl WorkloadDescriptor {
    /// Builds a descriptor for `target` bound to a validated address.
    pub fn new(target: impl Into<String>, bind: &BindAddress) -> Self {
        Self {
            target: target.into(),
            host: bind.host().to_string(),
            port: bind.port(),
        }
    }

    /// Application the server loads (for example `app:app`).
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Host the server binds to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port the server binds to.
    pub fn port(&self) -> u16 {
        self.port
    }
}

/// Entry point of the supervised server.
pub trait Workload {
    /// Runs the workload. Under normal operation this never returns.
    fn launch(&self, descriptor: &WorkloadDescriptor) -> Result<(), WorkloadError>;
}

/// Replaces the daemon's process image with a server program.
///
/// `{target}`, `{host}` and `{port}` in the argument template are substituted from the
/// descriptor. Because the program is exec'd, the PID recorded in the pidfile is the PID
/// of the server itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandWorkload {
    program: String,
    args: Vec<String>,
}

impl CommandWorkload {
    /// Creates a workload running `program` with the argument template `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Arguments after placeholder substitution.
    pub fn render_args(&self, descriptor: &WorkloadDescriptor) -> Vec<String> {
        let port = descriptor.port().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{target}", descriptor.target())
                    .replace("{host}", descriptor.host())
                    .replace("{port}", &port)
            })
            .collect()
    }

    fn command(&self, descriptor: &WorkloadDescriptor) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(descriptor));
        cmd
    }
}

impl Workload for CommandWorkload {
    fn launch(&self, descriptor: &WorkloadDescriptor) -> Result<(), WorkloadError> {
        info!(
            "Launching '{}' for {} on {}:{}",
            self.program,
            descriptor.target(),
            descriptor.host(),
            descriptor.port()
        );
        let source = self.command(descriptor).exec();
        Err(WorkloadError::Exec {
            program: self.program.clone(),
            source,
        })
    }
}
