//! # blockvault-lock
//!
//! Path-keyed reader/writer locks that span threads and processes.
//!
//! Every lock is identified by the path of the file it guards. Within a
//! process, a global registry arbitrates between threads; across processes,
//! an advisory whole-file lock on the opened descriptor does the same. The
//! advisory lock is released by the kernel when a process dies, so locks
//! never outlive their holders.
//!
//! Acquisition polls both levels non-blockingly at a fixed interval until
//! the caller's timeout elapses. A `timeout` of `None` polls forever;
//! `Some(Duration::ZERO)` makes a single attempt.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use fs2::FileExt;
use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

/// Upper bound on outstanding handles for a single path within one process.
pub const MAX_HANDLES_PER_PATH: usize = 99;

/// How long to sleep between acquisition attempts.
pub const SLEEP_INTERVAL: Duration = Duration::from_millis(99);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("timed out waiting for the lock")]
    Timeout,

    #[error("lock mode mismatch with existing holders of this path")]
    ModeMismatch,

    #[error("too many outstanding handles for this path")]
    TooManyHandles,

    #[error("handle was already released")]
    StaleHandle,

    #[error("flags must include read, write, or create access")]
    BadFlags,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

bitflags! {
    /// Open/lock flags, mirroring `open(2)` access modes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open read-only and take a shared (readers') lock.
        const RDONLY = 1;
        /// Open read-write and take an exclusive (writer's) lock.
        const RDWR = 1 << 1;
        /// Create the file if absent; implies an exclusive lock.
        const CREATE = 1 << 2;
        /// With `CREATE`, fail if the file already exists.
        const EXCL = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockKind {
    Read,
    Write,
}

/// Per-path lock record. `kind` is fixed for the record's lifetime; the
/// record is dropped from the registry once its last handle is released,
/// at which point a different kind may be used for the same path.
struct PathLock {
    path: PathBuf,
    kind: LockKind,
    state: Mutex<PathState>,
}

#[derive(Default)]
struct PathState {
    /// Outstanding handles plus in-flight acquisitions.
    refs: usize,
    /// Registered handles not yet released; capped at
    /// [`MAX_HANDLES_PER_PATH`], with slots reused as handles go away.
    handles: usize,
    writer_held: bool,
    readers: usize,
}

static REGISTRY: Lazy<Mutex<HashMap<PathBuf, Arc<PathLock>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// An acquired lock on a path. The underlying file stays open (and the OS
/// advisory lock held) until the handle is released or dropped.
pub struct LockHandle {
    record: Arc<PathLock>,
    kind: LockKind,
    file: Option<File>,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.record.path)
            .field("kind", &self.kind)
            .finish()
    }
}

impl LockHandle {
    /// The locked, open file. All I/O on the guarded file should go through
    /// this descriptor while the lock is held.
    pub fn file(&self) -> &File {
        self.file.as_ref().expect("handle still holds its file")
    }

    /// Path this handle locks.
    pub fn path(&self) -> &Path {
        &self.record.path
    }

    fn release_inner(&mut self) -> Result<()> {
        let file = self.file.take().ok_or(LockError::StaleHandle)?;
        // Closing the descriptor releases the advisory lock with it.
        drop(file);

        let mut registry = REGISTRY.lock().expect("lock registry poisoned");
        let mut state = self.record.state.lock().expect("path lock poisoned");
        match self.kind {
            LockKind::Write => state.writer_held = false,
            LockKind::Read => state.readers -= 1,
        }
        state.handles -= 1;
        state.refs -= 1;
        if state.refs == 0 {
            drop(state);
            registry.remove(&self.record.path);
        }
        Ok(())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.release_inner() {
                debug!(path = %self.record.path.display(), error = %e, "release on drop failed");
            }
        }
    }
}

/// Opens `path` with the access given by `flags` and locks it, both against
/// other threads of this process and against other processes. Readers
/// compose; a writer excludes everyone. `perm` is the file mode used when
/// `CREATE` actually creates the file.
///
/// Re-entering from the same process yields a new handle provided the mode
/// agrees with the handles already outstanding; mixing readers and writers
/// of one path inside one process is refused with [`LockError::ModeMismatch`].
pub fn acquire(
    path: &Path,
    flags: OpenFlags,
    timeout: Option<Duration>,
    perm: u32,
) -> Result<LockHandle> {
    let kind = if flags.contains(OpenFlags::RDONLY) {
        LockKind::Read
    } else if flags.intersects(OpenFlags::RDWR | OpenFlags::CREATE) {
        LockKind::Write
    } else {
        return Err(LockError::BadFlags);
    };

    // Find or insert the record for this path and reserve a reference,
    // all under the registry mutex.
    let record = {
        let mut registry = REGISTRY.lock().expect("lock registry poisoned");
        let record = registry
            .entry(path.to_path_buf())
            .or_insert_with(|| {
                Arc::new(PathLock {
                    path: path.to_path_buf(),
                    kind,
                    state: Mutex::new(PathState::default()),
                })
            })
            .clone();
        let mut state = record.state.lock().expect("path lock poisoned");
        if state.handles == MAX_HANDLES_PER_PATH {
            return Err(LockError::TooManyHandles);
        }
        if record.kind != kind {
            return Err(LockError::ModeMismatch);
        }
        state.refs += 1;
        drop(state);
        record
    };

    let mut options = OpenOptions::new();
    options.read(true);
    if kind == LockKind::Write {
        options.write(true);
        if flags.contains(OpenFlags::CREATE) {
            options.create(true).mode(perm);
            if flags.contains(OpenFlags::EXCL) {
                options.create_new(true);
            }
        }
    }
    let file = match options.open(path) {
        Ok(file) => file,
        Err(e) => {
            unref(&record);
            return Err(e.into());
        }
    };

    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if try_thread_lock(&record, kind) {
            match try_os_lock(&file, kind) {
                Ok(()) => break,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    // Another process holds the file; give local threads a
                    // chance while we wait for it.
                    undo_thread_lock(&record, kind);
                }
                Err(e) => {
                    undo_thread_lock(&record, kind);
                    unref(&record);
                    return Err(e.into());
                }
            }
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                unref(&record);
                return Err(LockError::Timeout);
            }
        }
        thread::sleep(SLEEP_INTERVAL);
    }

    {
        let mut state = record.state.lock().expect("path lock poisoned");
        state.handles += 1;
    }
    debug!(path = %path.display(), ?kind, "lock acquired");
    Ok(LockHandle {
        record,
        kind,
        file: Some(file),
    })
}

/// Releases a handle obtained from [`acquire`]. Dropping the handle has the
/// same effect; the explicit form surfaces errors.
pub fn release(mut handle: LockHandle) -> Result<()> {
    handle.release_inner()
}

fn try_thread_lock(record: &PathLock, kind: LockKind) -> bool {
    let mut state = record.state.lock().expect("path lock poisoned");
    match kind {
        LockKind::Write => {
            if state.writer_held || state.readers > 0 {
                false
            } else {
                state.writer_held = true;
                true
            }
        }
        LockKind::Read => {
            if state.writer_held {
                false
            } else {
                state.readers += 1;
                true
            }
        }
    }
}

fn undo_thread_lock(record: &PathLock, kind: LockKind) {
    let mut state = record.state.lock().expect("path lock poisoned");
    match kind {
        LockKind::Write => state.writer_held = false,
        LockKind::Read => state.readers -= 1,
    }
}

// Called via the trait so the std 1.89 inherent `File::try_lock*` methods,
// which have a different error type, cannot shadow it.
fn try_os_lock(file: &File, kind: LockKind) -> io::Result<()> {
    match kind {
        LockKind::Write => FileExt::try_lock_exclusive(file),
        LockKind::Read => FileExt::try_lock_shared(file),
    }
}

/// Drops an acquisition reservation that never became a handle, removing
/// the record once nobody else holds it.
fn unref(record: &PathLock) {
    let mut registry = REGISTRY.lock().expect("lock registry poisoned");
    let mut state = record.state.lock().expect("path lock poisoned");
    state.refs -= 1;
    if state.refs == 0 {
        drop(state);
        registry.remove(&record.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn readers_compose() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "shared");

        let a = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap();
        let b = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap();
        let c = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap();

        release(a).unwrap();
        release(b).unwrap();
        release(c).unwrap();
    }

    #[test]
    fn reader_cannot_request_writer() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "mismatch");

        let reader = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap();
        let err = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap_err();
        assert!(matches!(err, LockError::ModeMismatch));
        release(reader).unwrap();

        // With all readers gone the record is gone too, so a writer works.
        let writer = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap();
        release(writer).unwrap();
    }

    #[test]
    fn handle_cap_applies_to_outstanding_handles() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "capped");

        let mut handles = Vec::new();
        for _ in 0..MAX_HANDLES_PER_PATH {
            handles.push(acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap());
        }
        let err = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap_err();
        assert!(matches!(err, LockError::TooManyHandles));

        // Releasing a handle frees its slot for the next acquisition.
        release(handles.pop().unwrap()).unwrap();
        handles.push(acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap());
        let err = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap_err();
        assert!(matches!(err, LockError::TooManyHandles));

        for handle in handles {
            release(handle).unwrap();
        }
        let again = acquire(&path, OpenFlags::RDONLY, Some(Duration::ZERO), 0).unwrap();
        release(again).unwrap();
    }

    #[test]
    fn writer_excludes_writer() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "excl");

        let first = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap();
        let err = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap_err();
        assert!(matches!(err, LockError::Timeout));
        release(first).unwrap();

        let second = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap();
        release(second).unwrap();
    }

    #[test]
    fn writer_acquires_after_release_from_other_thread() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "handoff");

        let held = acquire(&path, OpenFlags::RDWR, Some(Duration::ZERO), 0).unwrap();
        let path_clone = path.clone();
        let waiter = thread::spawn(move || {
            acquire(
                &path_clone,
                OpenFlags::RDWR,
                Some(Duration::from_secs(10)),
                0,
            )
        });
        thread::sleep(Duration::from_millis(20));
        release(held).unwrap();

        let handle = waiter.join().unwrap().unwrap();
        release(handle).unwrap();
    }

    #[test]
    fn create_excl_fails_on_existing() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "existing");

        let err = acquire(
            &path,
            OpenFlags::CREATE | OpenFlags::EXCL | OpenFlags::RDWR,
            Some(Duration::ZERO),
            0o600,
        )
        .unwrap_err();
        match err {
            LockError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::AlreadyExists),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[test]
    fn create_makes_the_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fresh");

        let handle = acquire(
            &path,
            OpenFlags::CREATE | OpenFlags::RDWR,
            Some(Duration::ZERO),
            0o600,
        )
        .unwrap();
        assert!(path.exists());
        release(handle).unwrap();
    }

    #[test]
    fn missing_flags_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = touch(&dir, "flags");
        let err = acquire(&path, OpenFlags::EXCL, Some(Duration::ZERO), 0).unwrap_err();
        assert!(matches!(err, LockError::BadFlags));
    }
}
