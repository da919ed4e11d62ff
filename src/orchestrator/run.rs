use std::fs::File;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures_util::future::{BoxFuture, FutureExt, Shared};

// ---------------------------------------------------------------------------
// SingleFlight: one in-flight computation, shared by every caller
// ---------------------------------------------------------------------------

/// What a single-flight slot currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flight<T> {
    Empty,
    InFlight,
    Done(T),
}

/// A single slot holding at most one computation. The first caller starts it;
/// every later caller gets the same shared future, before or after it
/// completes. The slot is never cleared.
pub struct SingleFlight<T: Clone> {
    slot: Mutex<Option<Shared<BoxFuture<'static, T>>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the existing flight, or start `make()` if the slot is empty.
    /// The flag is true for the caller that started it.
    pub fn join_or_start<F, Fut>(&self, make: F) -> (Shared<BoxFuture<'static, T>>, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = slot.as_ref() {
            return (existing.clone(), false);
        }
        let shared = make().boxed().shared();
        *slot = Some(shared.clone());
        (shared, true)
    }

    pub fn status(&self) -> Flight<T> {
        let slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        match slot.as_ref() {
            None => Flight::Empty,
            Some(shared) => match shared.peek() {
                Some(value) => Flight::Done(value.clone()),
                None => Flight::InFlight,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// InstanceLock: one orchestrating process per state directory
// ---------------------------------------------------------------------------

const LOCK_FILE: &str = "instance.lock";

/// Exclusive, non-blocking OS lock on `<state>/instance.lock`, released when
/// dropped or when the process dies. The holder writes its pid into the file.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// `Ok(None)` when another process holds the lock.
    pub fn try_acquire(state_dir: &Path) -> std::io::Result<Option<Self>> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);
        let Some(mut file) = Self::lock(&path)? else {
            return Ok(None);
        };
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(Some(Self { _file: file, path }))
    }

    /// Pid written by the current or last lock holder. Only meaningful while
    /// the lock is held; `None` while a new holder is still writing it.
    pub fn holder(state_dir: &Path) -> Option<u32> {
        std::fs::read_to_string(state_dir.join(LOCK_FILE))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(unix)]
    fn lock(path: &Path) -> std::io::Result<Option<File>> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        // SAFETY: fd is valid for the lifetime of file
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(file));
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }

    #[cfg(windows)]
    fn lock(path: &Path) -> std::io::Result<Option<File>> {
        use std::os::windows::fs::OpenOptionsExt;

        const ERROR_SHARING_VIOLATION: i32 = 32;
        const FILE_SHARE_READ: u32 = 0x1;
        // Readers may look up the holder pid; a second writer fails while we
        // hold the handle.
        match std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .share_mode(FILE_SHARE_READ)
            .open(path)
        {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.raw_os_error() == Some(ERROR_SHARING_VIOLATION) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
