//! Start/stop/restart state machine over the pidfile.
//!
//! The daemon's state is never stored. It is inferred on every command from the pidfile
//! and a liveness probe of the PID it records:
//!
//! | pidfile            | process | state     |
//! |--------------------|---------|-----------|
//! | absent             | -       | `Stopped` |
//! | PID                | alive   | `Running` |
//! | PID or unparsable  | gone    | `Stale`   |
//!
//! A PID whose process started after the pidfile was written has been reused by an
//! unrelated process and also counts as `Stale`. The check needs process start times, which
//! only Linux exposes; elsewhere a reused PID still reads as `Running`.
use std::path::PathBuf;

use nix::sys::signal::Signal;
use tracing::{debug, error, info, warn};

use crate::{
    config::{Config, ShutdownPolicy, StalePolicy, TimeoutPolicy},
    constants::PID_REUSE_SLACK,
    daemonize::{
        Daemonizer, DetachSequence, Detachment, ForkDaemonizer, ReadinessNotifier,
        ReadinessReport, StreamRedirection,
    },
    error::{LifecycleError, PidFileError},
    pidfile::{FilePidStore, PidStore},
    process::{Delivery, ProcessTable, SystemProcesses, wait_for_exit},
    workload::{CommandWorkload, Workload, WorkloadDescriptor},
};

/// Whether `start` detaches before launching the workload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LaunchMode {
    /// Detach from the controlling terminal first.
    #[default]
    Background,
    /// Stay attached; useful for debugging the workload.
    Foreground,
}

/// Daemon state inferred from the pidfile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// No pidfile.
    Stopped,
    /// The recorded PID is alive.
    Running(u32),
    /// A pidfile exists but no live process owns it. `None` when it held no valid PID.
    Stale(Option<u32>),
}

/// Result of [`Lifecycle::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Seen by the operator's process: the detached daemon recorded `pid` and launched
    /// the workload.
    Launched {
        /// PID of the daemon.
        pid: u32,
    },
    /// The workload ran as `pid` and has handed control back.
    Completed {
        /// PID recorded while the workload ran.
        pid: u32,
    },
    /// A live daemon already owns the pidfile; nothing was changed.
    AlreadyRunning {
        /// PID of the live daemon.
        pid: u32,
    },
}

/// Result of [`Lifecycle::stop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The daemon exited and its pidfile was removed.
    Stopped {
        /// PID that was stopped.
        pid: u32,
        /// Whether SIGKILL was needed.
        forced: bool,
    },
    /// There was no pidfile; nothing was changed.
    NotRunning,
    /// The pidfile was stale and has been removed without signalling anything.
    Stale {
        /// PID the stale pidfile recorded, if it held one.
        pid: Option<u32>,
    },
}

/// Result of [`Lifecycle::restart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    /// How the previous instance was handled.
    pub stopped: StopOutcome,
    /// How the new instance was handled.
    pub started: StartOutcome,
}

/// Everything the controller needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    /// Whether `start` detaches.
    pub mode: LaunchMode,
    /// Stream targets for the detached daemon.
    pub streams: StreamRedirection,
    /// Launch specification handed to the workload.
    pub descriptor: WorkloadDescriptor,
    /// Rules for `stop`.
    pub shutdown: ShutdownPolicy,
    /// Rule for stale pidfiles found by `start`.
    pub stale: StalePolicy,
}

/// Lifecycle controller wired to the real system.
pub type SystemLifecycle =
    Lifecycle<FilePidStore, SystemProcesses, ForkDaemonizer, CommandWorkload>;

/// Drives start/stop/restart against one pidfile.
pub struct Lifecycle<S, P, D, W> {
    store: S,
    processes: P,
    daemonizer: D,
    workload: W,
    settings: LifecycleSettings,
}

impl SystemLifecycle {
    /// Builds a controller from configuration.
    ///
    /// The bind address is validated here, before any process or pidfile action can run.
    pub fn from_config(config: &Config, mode: LaunchMode) -> Result<Self, LifecycleError> {
        let descriptor = config.descriptor()?;
        let settings = LifecycleSettings {
            mode,
            streams: config.streams(),
            descriptor,
            shutdown: config.shutdown_policy()?,
            stale: config.stale_pidfile,
        };
        let sequence = DetachSequence::new(config.working_directory.clone(), config.umask()?);

        Ok(Lifecycle::new(
            FilePidStore::new(config.pidfile()),
            SystemProcesses,
            ForkDaemonizer::new(sequence),
            CommandWorkload::new(config.program.clone(), config.args.clone()),
            settings,
        ))
    }
}

impl<S, P, D, W> Lifecycle<S, P, D, W>
where
    S: PidStore,
    P: ProcessTable,
    D: Daemonizer,
    W: Workload,
{
    /// Assembles a controller from its collaborators.
    pub fn new(
        store: S,
        processes: P,
        daemonizer: D,
        workload: W,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            processes,
            daemonizer,
            workload,
            settings,
        }
    }

    /// Pidfile location.
    pub fn pidfile(&self) -> PathBuf {
        self.store.path().to_path_buf()
    }

    /// Infers the daemon state from the pidfile.
    pub fn state(&self) -> Result<DaemonState, LifecycleError> {
        match self.store.read() {
            Ok(None) => Ok(DaemonState::Stopped),
            Ok(Some(pid)) if self.processes.is_alive(pid)? && !self.reused(pid) => {
                Ok(DaemonState::Running(pid))
            }
            Ok(Some(pid)) => Ok(DaemonState::Stale(Some(pid))),
            Err(PidFileError::Parse { path, contents }) => {
                warn!(
                    "PID file '{}' holds {contents:?}; treating it as stale",
                    path.display()
                );
                Ok(DaemonState::Stale(None))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Detaches, records the daemon's PID and hands control to the workload.
    ///
    /// In background mode this returns twice. The operator's process gets
    /// [`StartOutcome::Launched`] once the daemon has recorded its PID and launched the
    /// workload, or the daemon's error. The daemon itself continues here and blocks for as
    /// long as the workload runs.
    pub fn start(&self) -> Result<StartOutcome, LifecycleError> {
        let lock = self.store.lock()?;

        match self.state()? {
            DaemonState::Running(pid) => {
                warn!("Daemon already running with PID {pid}");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
            DaemonState::Stale(pid) => match self.settings.stale {
                StalePolicy::Refuse => {
                    return Err(LifecycleError::StaleState {
                        pid,
                        path: self.pidfile(),
                    });
                }
                StalePolicy::Reclaim => {
                    warn!(
                        "Removing stale PID file '{}' (recorded PID {pid:?})",
                        self.store.path().display()
                    );
                    self.store.remove()?;
                }
            },
            DaemonState::Stopped => {}
        }

        let mut notifier = None;
        if self.settings.mode == LaunchMode::Background {
            match self.daemonizer.detach(&self.settings.streams)? {
                Detachment::Launched(ReadinessReport::Ready { pid }) => {
                    info!("Daemon started with PID {pid}");
                    return Ok(StartOutcome::Launched { pid });
                }
                Detachment::Launched(ReadinessReport::Failed { code, message }) => {
                    return Err(LifecycleError::DaemonFailed { code, message });
                }
                Detachment::Daemon(daemon) => notifier = Some(daemon),
            }
        }

        let pid = self.processes.current_pid();
        if let Err(err) = self.store.create(pid) {
            return Err(report_failure(notifier.as_mut(), err.into()));
        }
        drop(lock);
        info!(
            "Daemon running as PID {pid} (pidfile '{}')",
            self.store.path().display()
        );
        if let Some(notifier) = notifier.as_mut() {
            notifier.recorded(pid);
        }

        // A successful exec closes the notifier, which tells the operator's process we are up.
        let launched = self.workload.launch(&self.settings.descriptor);
        self.release(pid);
        if let Err(err) = launched {
            error!("Workload failed: {err}");
            return Err(report_failure(notifier.as_mut(), err.into()));
        }

        Ok(StartOutcome::Completed { pid })
    }

    /// Terminates the recorded daemon and removes its pidfile.
    pub fn stop(&self) -> Result<StopOutcome, LifecycleError> {
        let _lock = self.store.lock()?;

        let pid = match self.state()? {
            DaemonState::Stopped => {
                debug!("No PID file at '{}'", self.store.path().display());
                return Ok(StopOutcome::NotRunning);
            }
            DaemonState::Stale(pid) => {
                info!("PID {pid:?} is not running; clearing stale PID file");
                self.store.remove()?;
                return Ok(StopOutcome::Stale { pid });
            }
            DaemonState::Running(pid) => pid,
        };

        let forced = self.terminate(pid)?;
        self.store.remove()?;
        info!("Daemon (PID {pid}) stopped");

        Ok(StopOutcome::Stopped { pid, forced })
    }

    /// Stops the daemon if one is running, then starts a new one.
    ///
    /// The two halves take the pidfile lock separately, so another operator can start
    /// an instance in between; `start` then reports it as already running.
    pub fn restart(&self) -> Result<RestartOutcome, LifecycleError> {
        let stopped = self.stop()?;
        let started = self.start()?;
        Ok(RestartOutcome { stopped, started })
    }

    /// Sends SIGTERM and waits; escalates per policy. Returns whether SIGKILL was used.
    fn terminate(&self, pid: u32) -> Result<bool, LifecycleError> {
        let policy = &self.settings.shutdown;

        if self.processes.signal(pid, Signal::SIGTERM)? == Delivery::NoSuchProcess {
            debug!("PID {pid} exited before SIGTERM could be delivered");
            return Ok(false);
        }
        if wait_for_exit(&self.processes, pid, policy.stop_timeout, policy.poll_interval)? {
            return Ok(false);
        }

        match policy.on_timeout {
            TimeoutPolicy::Fail => Err(LifecycleError::ShutdownTimeout {
                pid,
                timeout: policy.stop_timeout,
            }),
            TimeoutPolicy::Kill => {
                warn!(
                    "PID {pid} did not exit within {:?} of SIGTERM; sending SIGKILL",
                    policy.stop_timeout
                );
                if self.processes.signal(pid, Signal::SIGKILL)? == Delivery::NoSuchProcess {
                    return Ok(true);
                }
                if wait_for_exit(&self.processes, pid, policy.kill_timeout, policy.poll_interval)?
                {
                    return Ok(true);
                }
                Err(LifecycleError::ShutdownTimeout {
                    pid,
                    timeout: policy.stop_timeout + policy.kill_timeout,
                })
            }
        }
    }

    /// Whether `pid` started after the pidfile was written, so it cannot be our daemon.
    fn reused(&self, pid: u32) -> bool {
        let (Some(started), Some(written)) =
            (self.processes.start_time(pid), self.store.written_at())
        else {
            return false;
        };
        let reused = started > written + PID_REUSE_SLACK;
        if reused {
            warn!("PID {pid} started after the PID file was written; it was reused");
        }
        reused
    }

    /// Removes the pidfile after the workload returned, if it still names `pid`.
    fn release(&self, pid: u32) {
        match self.store.read() {
            Ok(Some(recorded)) if recorded == pid => {
                if let Err(err) = self.store.remove() {
                    warn!("Failed to remove PID file after the workload exited: {err}");
                }
            }
            Ok(_) => debug!("PID file no longer names PID {pid}; leaving it"),
            Err(err) => warn!("Failed to inspect PID file after the workload exited: {err}"),
        }
    }
}

/// Forwards a daemon-side failure to the operator's process, if one is waiting.
fn report_failure<N: ReadinessNotifier>(
    notifier: Option<&mut N>,
    err: LifecycleError,
) -> LifecycleError {
    if let Some(notifier) = notifier {
        notifier.failed(err.exit_code(), &err.to_string());
    }
    err
}
