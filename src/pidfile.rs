//! Pidfile storage and the advisory lock that serialises lifecycle commands.
//!
//! The pidfile holds the decimal PID of the running daemon and nothing else (a trailing
//! newline is tolerated). Commands that read and then mutate it hold an exclusive `flock`
//! on a sibling `<pidfile>.lock` for the duration of the check-and-write sequence.
use std::{
    fs::{self, File, OpenOptions},
    io::{self, ErrorKind, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use fs2::FileExt;
use tracing::{debug, warn};

use crate::{constants::LOCK_SUFFIX, error::PidFileError};

/// Storage backing the daemon's pidfile.
pub trait PidStore {
    /// Guard returned by [`PidStore::lock`]; the lock is held until it is dropped.
    type Lock;

    /// Location reported in diagnostics.
    fn path(&self) -> &Path;

    /// Takes the exclusive lock guarding read-modify-write sequences.
    fn lock(&self) -> Result<Self::Lock, PidFileError>;

    /// Reads the recorded PID, or `None` when no pidfile exists.
    fn read(&self) -> Result<Option<u32>, PidFileError>;

    /// Records `pid` in a newly created pidfile. Fails if one already exists.
    fn create(&self, pid: u32) -> Result<(), PidFileError>;

    /// Deletes the pidfile. Returns whether there was one to delete.
    fn remove(&self) -> Result<bool, PidFileError>;

    /// When the pidfile was last written, if known.
    fn written_at(&self) -> Option<SystemTime>;
}

/// Parses pidfile contents into a PID.
fn parse_pid(path: &Path, contents: &str) -> Result<u32, PidFileError> {
    match contents.trim().parse::<u32>() {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(PidFileError::Parse {
            path: path.to_path_buf(),
            contents: contents.to_string(),
        }),
    }
}

/// Pidfile kept on the local filesystem.
#[derive(Debug, Clone)]
pub struct FilePidStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FilePidStore {
    /// Creates a store for `path`. Nothing touches the filesystem until an operation runs.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(LOCK_SUFFIX);
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
        }
    }

    /// Path of the advisory lock file.
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

/// Exclusive lock on a [`FilePidStore`]. Released on drop.
///
/// The descriptor is inherited across `fork`, so a lock taken in the foreground process is
/// still held by the detached daemon until it drops the guard. It is opened close-on-exec
/// and therefore never reaches the workload.
#[derive(Debug)]
pub struct PidLock {
    file: File,
    path: PathBuf,
}

impl Drop for PidLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!("Failed to release lock '{}': {err}", self.path.display());
        }
    }
}

impl PidStore for FilePidStore {
    type Lock = PidLock;

    fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<PidLock, PidFileError> {
        let lock_err = |source| PidFileError::Lock {
            path: self.lock_path.clone(),
            source,
        };

        self.ensure_parent().map_err(lock_err)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(&self.lock_path)
            .map_err(lock_err)?;

        if let Err(err) = file.try_lock_exclusive() {
            if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() {
                return Err(PidFileError::Contended {
                    path: self.lock_path.clone(),
                });
            }
            return Err(lock_err(err));
        }

        debug!("Acquired lock '{}'", self.lock_path.display());
        Ok(PidLock {
            file,
            path: self.lock_path.clone(),
        })
    }

    fn read(&self) -> Result<Option<u32>, PidFileError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => parse_pid(&self.path, &contents).map(Some),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PidFileError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn create(&self, pid: u32) -> Result<(), PidFileError> {
        let write_err = |source| PidFileError::Write {
            path: self.path.clone(),
            source,
        };

        self.ensure_parent().map_err(write_err)?;
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(PidFileError::Exists {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(write_err(err)),
        };

        writeln!(file, "{pid}").map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        debug!("Wrote PID {pid} to '{}'", self.path.display());
        Ok(())
    }

    fn remove(&self) -> Result<bool, PidFileError> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Removed PID file '{}'", self.path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(PidFileError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn written_at(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|meta| meta.modified()).ok()
    }
}

/// Pidfile held in memory, for embedding the controller where no filesystem state is wanted.
///
/// Contents are stored as raw text so corrupt pidfiles can be represented.
#[derive(Debug)]
pub struct MemoryPidStore {
    path: PathBuf,
    entry: Mutex<Option<(String, SystemTime)>>,
}

impl MemoryPidStore {
    /// Creates an empty store reporting `path` in diagnostics.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entry: Mutex::new(None),
        }
    }

    /// Replaces the stored contents verbatim.
    pub fn set_contents(&self, contents: Option<&str>) {
        *self.guard() = contents.map(|text| (text.to_string(), SystemTime::now()));
    }

    /// Returns the stored contents verbatim.
    pub fn contents(&self) -> Option<String> {
        self.guard().as_ref().map(|(text, _)| text.clone())
    }

    fn guard(&self) -> MutexGuard<'_, Option<(String, SystemTime)>> {
        self.entry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PidStore for MemoryPidStore {
    type Lock = ();

    fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<(), PidFileError> {
        Ok(())
    }

    fn read(&self) -> Result<Option<u32>, PidFileError> {
        self.guard()
            .as_ref()
            .map(|(contents, _)| parse_pid(&self.path, contents))
            .transpose()
    }

    fn create(&self, pid: u32) -> Result<(), PidFileError> {
        let mut guard = self.guard();
        if guard.is_some() {
            return Err(PidFileError::Exists {
                path: self.path.clone(),
            });
        }
        *guard = Some((format!("{pid}\n"), SystemTime::now()));
        Ok(())
    }

    fn remove(&self) -> Result<bool, PidFileError> {
        Ok(self.guard().take().is_some())
    }

    fn written_at(&self) -> Option<SystemTime> {
        self.guard().as_ref().map(|(_, written)| *written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_pidfile_reads_as_none() {
        let dir = tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("webd.pid"));
        assert_eq!(store.read().unwrap(), None);
        assert!(!store.remove().unwrap());
    }

    #[test]
    fn create_writes_decimal_pid_with_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/webd.pid");
        let store = FilePidStore::new(&path);

        store.create(4242).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "4242\n");
        assert_eq!(store.read().unwrap(), Some(4242));
    }

    #[test]
    fn create_refuses_to_replace_an_existing_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("webd.pid");
        fs::write(&path, "17").unwrap();
        let store = FilePidStore::new(&path);

        assert!(matches!(store.create(18), Err(PidFileError::Exists { .. })));
        assert_eq!(fs::read_to_string(&path).unwrap(), "17");
    }

    #[test]
    fn read_tolerates_surrounding_whitespace() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("webd.pid");
        fs::write(&path, "  99\n").unwrap();
        assert_eq!(FilePidStore::new(&path).read().unwrap(), Some(99));
    }

    #[test]
    fn garbage_contents_are_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("webd.pid");
        for contents in ["", "abc", "-5", "0", "12 13"] {
            fs::write(&path, contents).unwrap();
            assert!(
                matches!(
                    FilePidStore::new(&path).read(),
                    Err(PidFileError::Parse { .. })
                ),
                "{contents:?} should not parse"
            );
        }
    }

    #[test]
    fn remove_deletes_the_pidfile() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("webd.pid");
        let store = FilePidStore::new(&path);
        store.create(7).unwrap();

        assert!(store.remove().unwrap());
        assert!(!path.exists());
    }

    #[test]
    fn lock_file_sits_next_to_the_pidfile() {
        let store = FilePidStore::new("/var/run/webd.pid");
        assert_eq!(store.lock_path(), Path::new("/var/run/webd.pid.lock"));
    }

    #[test]
    fn second_lock_is_contended_until_the_first_is_dropped() {
        let dir = tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("webd.pid"));

        let held = store.lock().unwrap();
        assert!(matches!(store.lock(), Err(PidFileError::Contended { .. })));

        drop(held);
        assert!(store.lock().is_ok());
    }

    #[test]
    fn written_at_tracks_the_pidfile() {
        let dir = tempdir().unwrap();
        let store = FilePidStore::new(dir.path().join("webd.pid"));
        assert_eq!(store.written_at(), None);

        store.create(5).unwrap();
        assert!(store.written_at().is_some());

        let memory = MemoryPidStore::new("/virtual/webd.pid");
        assert_eq!(memory.written_at(), None);
        memory.create(5).unwrap();
        assert!(memory.written_at().is_some());
    }

    #[test]
    fn memory_store_mirrors_file_semantics() {
        let store = MemoryPidStore::new("/virtual/webd.pid");
        assert_eq!(store.read().unwrap(), None);

        store.create(11).unwrap();
        assert_eq!(store.contents().as_deref(), Some("11\n"));
        assert!(matches!(store.create(12), Err(PidFileError::Exists { .. })));

        store.set_contents(Some("not-a-pid"));
        assert!(matches!(store.read(), Err(PidFileError::Parse { .. })));

        assert!(store.remove().unwrap());
        assert!(!store.remove().unwrap());
    }
}
