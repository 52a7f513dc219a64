//! Detaches the calling process from its controlling terminal.
//!
//! The classic double fork is modelled as three stages. The foreground process forks; its
//! child becomes a session leader (the intermediate stage), forks again and exits; the
//! grandchild is the daemon. Only the daemon changes directory, resets its umask and rebinds
//! the standard streams. Every non-terminal stage has exactly one exit point, and the
//! primitive operations sit behind [`DetachOps`] so the sequence can be driven without
//! forking.
//!
//! The foreground process does not exit on its own schedule. It waits on a pipe until the
//! daemon reports `ready <pid>` or `failed <code> <message>`, so the operator's command
//! fails whenever the daemon does.
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, Read, Write},
    os::unix::io::{AsRawFd, RawFd},
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{FcntlArg, FdFlag, fcntl},
    sys::stat::{Mode, umask},
    unistd::{ForkResult, fork, pipe, setsid},
};
use tracing::debug;

use crate::{
    constants::{DEFAULT_UMASK, DEFAULT_WORKING_DIRECTORY, DEV_NULL, exit_code},
    error::DetachError,
};

/// Process executing a step of the detachment sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachStage {
    /// The process the operator launched, still attached to the terminal.
    Foreground,
    /// First child; session leader of a new session.
    Intermediate,
    /// Second child; the detached daemon.
    Daemon,
}

impl fmt::Display for DetachStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DetachStage::Foreground => "foreground",
            DetachStage::Intermediate => "intermediate",
            DetachStage::Daemon => "daemon",
        };
        f.write_str(name)
    }
}

/// One of the three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl StdStream {
    /// Descriptor number of the stream.
    pub fn fd(self) -> RawFd {
        match self {
            StdStream::Stdin => libc::STDIN_FILENO,
            StdStream::Stdout => libc::STDOUT_FILENO,
            StdStream::Stderr => libc::STDERR_FILENO,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StdStream::Stdin => "stdin",
            StdStream::Stdout => "stdout",
            StdStream::Stderr => "stderr",
        };
        f.write_str(name)
    }
}

/// Targets the daemon's standard streams are rebound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRedirection {
    /// Opened read-only for stdin.
    pub stdin: PathBuf,
    /// Opened for writing as stdout.
    pub stdout: PathBuf,
    /// Opened for writing as stderr.
    pub stderr: PathBuf,
    /// Truncate stdout/stderr targets instead of appending to them.
    pub overwrite_output: bool,
}

impl Default for StreamRedirection {
    fn default() -> Self {
        Self {
            stdin: PathBuf::from(DEV_NULL),
            stdout: PathBuf::from(DEV_NULL),
            stderr: PathBuf::from(DEV_NULL),
            overwrite_output: false,
        }
    }
}

impl StreamRedirection {
    /// Opens all three targets. Nothing is rebound, so a failure leaves the caller's
    /// streams untouched.
    pub fn open(&self) -> Result<[(StdStream, File); 3], DetachError> {
        let open_err = |stream, path: &Path| {
            let path = path.to_path_buf();
            move |source| DetachError::OpenStream {
                stream,
                path,
                source,
            }
        };

        let stdin = File::open(&self.stdin)
            .map_err(open_err(StdStream::Stdin, &self.stdin))?;
        let stdout = self
            .output_options()
            .open(&self.stdout)
            .map_err(open_err(StdStream::Stdout, &self.stdout))?;
        let stderr = self
            .output_options()
            .open(&self.stderr)
            .map_err(open_err(StdStream::Stderr, &self.stderr))?;

        Ok([
            (StdStream::Stdin, stdin),
            (StdStream::Stdout, stdout),
            (StdStream::Stderr, stderr),
        ])
    }

    fn output_options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        options.create(true);
        if self.overwrite_output {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        options
    }
}

/// Outcome of a fork as seen by the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The caller is the parent of `child`.
    Parent {
        /// PID of the new process.
        child: u32,
    },
    /// The caller is the new process.
    Child,
}

/// Primitive process operations the detachment sequence is built from.
pub trait DetachOps {
    /// Forks the calling process.
    fn fork(&mut self) -> Result<Fork, Errno>;

    /// Starts a new session with the caller as its leader.
    fn new_session(&mut self) -> Result<(), Errno>;

    /// Changes the working directory.
    fn change_dir(&mut self, dir: &Path) -> io::Result<()>;

    /// Installs `mask` as the file-creation mask.
    fn set_umask(&mut self, mask: u32);

    /// Rebinds the standard streams to `streams`.
    fn redirect(&mut self, streams: &StreamRedirection) -> Result<(), DetachError>;
}

/// Operations performed on the real process.
#[derive(Debug, Default)]
pub struct SystemOps;

impl DetachOps for SystemOps {
    fn fork(&mut self) -> Result<Fork, Errno> {
        // Buffered output would otherwise be written once per process.
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        // SAFETY: the controller is single-threaded while detaching, so the child cannot
        // inherit a lock held by another thread.
        match unsafe { fork() }? {
            ForkResult::Parent { child } => Ok(Fork::Parent {
                child: child.as_raw().unsigned_abs(),
            }),
            ForkResult::Child => Ok(Fork::Child),
        }
    }

    fn new_session(&mut self) -> Result<(), Errno> {
        setsid().map(|_| ())
    }

    fn change_dir(&mut self, dir: &Path) -> io::Result<()> {
        std::env::set_current_dir(dir)
    }

    fn set_umask(&mut self, mask: u32) {
        let previous = umask(Mode::from_bits_truncate(mask as libc::mode_t));
        debug!("Replaced umask {:o} with {mask:o}", previous.bits());
    }

    fn redirect(&mut self, streams: &StreamRedirection) -> Result<(), DetachError> {
        let targets = streams.open()?;
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        for (stream, file) in &targets {
            if unsafe { libc::dup2(file.as_raw_fd(), stream.fd()) } < 0 {
                return Err(DetachError::Redirect {
                    stream: *stream,
                    source: io::Error::last_os_error(),
                });
            }
        }

        // The opened files close here; the duplicated standard descriptors stay open.
        Ok(())
    }
}

/// What the calling process must do once the sequence returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detached {
    /// The caller is a non-terminal stage and must exit with status 0.
    Exit {
        /// Stage the caller was in.
        stage: DetachStage,
        /// Process that carries the sequence forward.
        child: u32,
    },
    /// The caller is the daemon.
    Daemon,
}

/// The detachment sequence and the daemon environment it establishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachSequence {
    working_directory: PathBuf,
    umask: u32,
}

impl Default for DetachSequence {
    fn default() -> Self {
        Self::new(DEFAULT_WORKING_DIRECTORY, DEFAULT_UMASK)
    }
}

impl DetachSequence {
    /// Builds a sequence that leaves the daemon in `working_directory` with `umask`.
    pub fn new(working_directory: impl Into<PathBuf>, umask: u32) -> Self {
        Self {
            working_directory: working_directory.into(),
            umask,
        }
    }

    /// Drives the sequence in the calling process until it exits a stage or becomes the
    /// daemon.
    pub fn run<O: DetachOps>(
        &self,
        ops: &mut O,
        streams: &StreamRedirection,
    ) -> Result<Detached, DetachError> {
        let mut stage = DetachStage::Foreground;

        loop {
            stage = match stage {
                DetachStage::Foreground | DetachStage::Intermediate => {
                    match ops
                        .fork()
                        .map_err(|source| DetachError::Fork { stage, source })?
                    {
                        Fork::Parent { child } => {
                            return Ok(Detached::Exit { stage, child });
                        }
                        Fork::Child if stage == DetachStage::Foreground => {
                            ops.new_session().map_err(DetachError::Session)?;
                            DetachStage::Intermediate
                        }
                        Fork::Child => DetachStage::Daemon,
                    }
                }
                DetachStage::Daemon => {
                    ops.change_dir(&self.working_directory).map_err(|source| {
                        DetachError::WorkingDirectory {
                            path: self.working_directory.clone(),
                            source,
                        }
                    })?;
                    ops.set_umask(self.umask);
                    ops.redirect(streams)?;
                    return Ok(Detached::Daemon);
                }
            };
        }
    }
}

/// What the daemon told the operator's process about its startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessReport {
    /// The daemon recorded `pid` in the pidfile and handed control to the workload.
    Ready {
        /// PID of the daemon.
        pid: u32,
    },
    /// The daemon failed and exited with `code`.
    Failed {
        /// Exit code the daemon exits with.
        code: i32,
        /// Human-readable cause.
        message: String,
    },
}

/// Daemon-side end of the startup report channel.
pub trait ReadinessNotifier {
    /// The pidfile now names `pid` and the lock is released.
    fn recorded(&mut self, pid: u32);

    /// Startup failed in the daemon with `code`.
    fn failed(&mut self, code: i32, message: &str);
}

/// Result of [`Daemonizer::detach`] in the process it returns in.
#[derive(Debug)]
pub enum Detachment<N> {
    /// The caller is the daemon; `N` reports its startup back.
    Daemon(N),
    /// The caller is the operator's process; the daemon has reported.
    Launched(ReadinessReport),
}

/// Turns the calling process into a background daemon.
pub trait Daemonizer {
    /// Channel the daemon reports its startup through.
    type Notifier: ReadinessNotifier;

    /// Returns in the daemon and, once the daemon has reported, in the operator's process.
    /// Intermediate processes exit inside this call.
    fn detach(&self, streams: &StreamRedirection)
    -> Result<Detachment<Self::Notifier>, DetachError>;
}

/// Write end of the readiness pipe, held by the daemon.
///
/// The descriptor is close-on-exec. A successful `exec` of the workload therefore ends the
/// report, and the operator's process sees end-of-file after the `ready` line.
#[derive(Debug)]
pub struct ReadinessPipe {
    writer: File,
}

impl ReadinessPipe {
    fn send(&mut self, line: &str) {
        // The operator's process may be gone; the daemon carries on regardless.
        if let Err(err) = writeln!(self.writer, "{line}") {
            debug!("Failed to write startup report: {err}");
        }
    }
}

impl ReadinessNotifier for ReadinessPipe {
    fn recorded(&mut self, pid: u32) {
        self.send(&format!("ready {pid}"));
    }

    fn failed(&mut self, code: i32, message: &str) {
        self.send(&format!("failed {code} {}", message.replace('\n', " ")));
    }
}

/// Creates the readiness pipe with both ends close-on-exec.
fn readiness_pipe() -> Result<(File, File), DetachError> {
    let (reader, writer) = pipe().map_err(DetachError::ReadinessPipe)?;
    for fd in [&reader, &writer] {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
            .map_err(DetachError::ReadinessPipe)?;
    }
    Ok((File::from(reader), File::from(writer)))
}

/// Reads the daemon's report until every write end is closed.
///
/// A `failed` line wins over an earlier `ready` line: the workload launch can still fail
/// after the pidfile was recorded.
pub fn read_report<R: Read>(reader: R) -> Result<ReadinessReport, DetachError> {
    let mut ready = None;

    for line in BufReader::new(reader).lines() {
        let line = line.map_err(DetachError::ReadReport)?;
        if let Some(pid) = line.strip_prefix("ready ") {
            ready = pid.trim().parse().ok();
        } else if let Some(rest) = line.strip_prefix("failed ") {
            let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
            return Ok(ReadinessReport::Failed {
                code: code.parse().unwrap_or(exit_code::FAILURE),
                message: message.to_string(),
            });
        }
    }

    ready
        .map(|pid| ReadinessReport::Ready { pid })
        .ok_or(DetachError::NoReport)
}

/// [`Daemonizer`] that double-forks the real process.
///
/// The operator's process blocks until the daemon has written its pidfile and launched the
/// workload, or failed, so its exit status reflects the daemon's startup.
#[derive(Debug, Clone, Default)]
pub struct ForkDaemonizer {
    sequence: DetachSequence,
}

impl ForkDaemonizer {
    /// Builds a daemonizer around `sequence`.
    pub fn new(sequence: DetachSequence) -> Self {
        Self { sequence }
    }
}

impl Daemonizer for ForkDaemonizer {
    type Notifier = ReadinessPipe;

    fn detach(
        &self,
        streams: &StreamRedirection,
    ) -> Result<Detachment<ReadinessPipe>, DetachError> {
        let (reader, writer) = readiness_pipe()?;
        let origin = std::process::id();

        match self.sequence.run(&mut SystemOps, streams) {
            Ok(Detached::Exit {
                stage: DetachStage::Foreground,
                child,
            }) => {
                // Keeping a write end open here would hide the daemon's exit.
                drop(writer);
                debug!("Waiting for the daemon forked via PID {child} to report");
                read_report(reader).map(Detachment::Launched)
            }
            Ok(Detached::Exit { stage, child }) => {
                debug!("Leaving {stage} process; detachment continues in PID {child}");
                std::process::exit(exit_code::SUCCESS);
            }
            Ok(Detached::Daemon) => {
                drop(reader);
                debug!("Detached from the controlling terminal");
                Ok(Detachment::Daemon(ReadinessPipe { writer }))
            }
            Err(err) if std::process::id() == origin => Err(err),
            Err(err) => {
                let mut notifier = ReadinessPipe { writer };
                notifier.failed(exit_code::DETACHMENT, &format!("failed to daemonize: {err}"));
                std::process::exit(exit_code::DETACHMENT);
            }
        }
    }
}
