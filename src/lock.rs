/// Exclusive, named locks backed by `flock(2)` on a file per identity.
///
/// The backing file is deleted on release when nobody else took the lock, so
/// a contender can end up holding a descriptor for a file that no longer
/// exists at the path. Every acquisition therefore checks that the locked
/// descriptor and the path still name the same inode, and starts over if not.
use crate::signals::{Router, SignalKind, SignalTarget};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Errors that can occur while taking a lock.
#[derive(Debug)]
pub enum LockError {
    /// The lock file or its directory could not be created or opened.
    Unavailable { path: PathBuf, source: io::Error },
    /// A termination signal arrived while blocked on a contended lock.
    Interrupted {
        identity: String,
        signal: SignalKind,
    },
}

impl LockError {
    fn unavailable(path: &Path, source: io::Error) -> Self {
        LockError::Unavailable {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Status to exit with: 128 + N when interrupted by signal N.
    pub fn exit_code(&self) -> i32 {
        match self {
            LockError::Unavailable { .. } => 1,
            LockError::Interrupted { signal, .. } => signal.exit_code(),
        }
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Unavailable { path, source } => {
                write!(f, "cannot open lock file {}: {source}", path.display())
            }
            LockError::Interrupted { identity, signal } => {
                write!(f, "interrupted by {signal} while waiting for lock {identity}")
            }
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Unavailable { source, .. } => Some(source),
            LockError::Interrupted { .. } => None,
        }
    }
}

/// What `release` did with the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Nobody was waiting; the file is gone.
    Deleted,
    /// Another process holds (or recreated) the lock; the file stays.
    Kept,
    /// This handle was already released.
    AlreadyReleased,
}

/// A held lock. Released exactly once, either by [`LockHandle::release`] or
/// on drop.
#[derive(Debug)]
pub struct LockHandle {
    identity: String,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.file.is_some()
    }

    /// Release the lock, deleting the backing file if no other process
    /// takes the lock in the meantime.
    ///
    /// After unlocking, a non-blocking re-lock probes for contenders: if it
    /// succeeds nobody grabbed the lock, so the file is removed while still
    /// held. The final unlock always runs.
    pub fn release(&mut self) -> Release {
        let Some(file) = self.file.take() else {
            return Release::AlreadyReleased;
        };

        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(identity = %self.identity, error = %e, "failed to unlock");
        }

        let outcome = match file.try_lock_exclusive() {
            Ok(()) => match same_file(&file, &self.path) {
                Ok(true) => match std::fs::remove_file(&self.path) {
                    Ok(()) => Release::Deleted,
                    Err(e) => {
                        tracing::warn!(
                            path = %self.path.display(),
                            error = %e,
                            "failed to remove lock file"
                        );
                        Release::Kept
                    }
                },
                _ => Release::Kept,
            },
            Err(_) => {
                tracing::debug!(identity = %self.identity, "lock taken by a waiter, keeping file");
                Release::Kept
            }
        };

        if let Err(e) = FileExt::unlock(&file) {
            tracing::warn!(identity = %self.identity, error = %e, "failed final unlock");
        }
        tracing::info!(identity = %self.identity, outcome = ?outcome, "lock released");
        outcome
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Take the exclusive lock for `identity` at `path`, blocking while another
/// process holds it.
///
/// The blocking wait is registered with `router` as the active signal target,
/// so a termination signal (including one already pending) aborts it with
/// [`LockError::Interrupted`].
pub async fn acquire(
    router: &Arc<Router>,
    identity: &str,
    path: &Path,
) -> Result<LockHandle, LockError> {
    acquire_with(router, identity, path, |_| {}).await
}

/// [`acquire`] with a hook that runs between opening the file and locking it.
async fn acquire_with<F>(
    router: &Arc<Router>,
    identity: &str,
    path: &Path,
    mut before_lock: F,
) -> Result<LockHandle, LockError>
where
    F: FnMut(&Path),
{
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| LockError::unavailable(dir, e))?;
    }

    loop {
        let file = open_lock_file(path).map_err(|e| LockError::unavailable(path, e))?;
        before_lock(path);

        let file = match file.try_lock_exclusive() {
            Ok(()) => file,
            Err(e) if is_contended(&e) => {
                match read_holder(path) {
                    Some(holder) => {
                        tracing::info!(identity, holder, "waiting for lock held by another process")
                    }
                    None => tracing::info!(identity, "waiting for lock"),
                }
                wait_for_lock(router, identity, path, file).await?
            }
            Err(e) => return Err(LockError::unavailable(path, e)),
        };

        match same_file(&file, path) {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(identity, path = %path.display(), "lock file replaced while locking, retrying");
                continue;
            }
            Err(e) => return Err(LockError::unavailable(path, e)),
        }

        if let Err(e) = advertise_holder(&file) {
            tracing::warn!(path = %path.display(), error = %e, "failed to write holder pid");
        }
        tracing::info!(identity, path = %path.display(), "lock acquired");

        return Ok(LockHandle {
            identity: identity.to_string(),
            path: path.to_path_buf(),
            file: Some(file),
        });
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Whether `file` is still the file found at `path`.
fn same_file(file: &File, path: &Path) -> io::Result<bool> {
    let held = file.metadata()?;
    match std::fs::metadata(path) {
        Ok(on_disk) => Ok(held.dev() == on_disk.dev() && held.ino() == on_disk.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Pid advertised by the current holder, if any. Diagnostic only.
pub fn read_holder(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn advertise_holder(file: &File) -> io::Result<()> {
    file.set_len(0)?;
    let mut writer = file;
    writer.seek(SeekFrom::Start(0))?;
    writeln!(writer, "{}", std::process::id())?;
    writer.flush()
}

/// Signal target standing in for a job while blocked on a contended lock.
struct LockWait {
    identity: String,
    interrupted_by: Mutex<Option<SignalKind>>,
    notify: Notify,
}

impl LockWait {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            interrupted_by: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    async fn interrupted(&self) -> SignalKind {
        loop {
            let current = *self.interrupted_by.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(kind) = current {
                return kind;
            }
            self.notify.notified().await;
        }
    }
}

impl SignalTarget for LockWait {
    fn describe(&self) -> String {
        format!("lock wait for {}", self.identity)
    }

    fn deliver(&self, kind: SignalKind) -> io::Result<()> {
        if !kind.is_termination() {
            tracing::debug!(signal = %kind, "ignoring signal while waiting for lock");
            return Ok(());
        }
        let mut slot = self.interrupted_by.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(kind);
        }
        self.notify.notify_one();
        Ok(())
    }
}

async fn wait_for_lock(
    router: &Arc<Router>,
    identity: &str,
    path: &Path,
    file: File,
) -> Result<File, LockError> {
    let waiter = Arc::new(LockWait::new(identity));
    router.register(waiter.clone());

    // flock(2) can't be cancelled; if interrupted, the thread keeps waiting
    // and drops (unlocks) the file as soon as it gets it.
    let mut blocking = tokio::task::spawn_blocking(move || file.lock_exclusive().map(|()| file));

    let outcome = tokio::select! {
        joined = &mut blocking => {
            let locked = match joined {
                Ok(result) => result,
                Err(e) => Err(io::Error::other(e)),
            };
            locked.map_err(|e| LockError::unavailable(path, e))
        }
        signal = waiter.interrupted() => Err(LockError::Interrupted {
            identity: identity.to_string(),
            signal,
        }),
    };

    router.deregister();
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn wait_until_registered(router: &Router) {
        for _ in 0..200 {
            if router.has_target() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no signal target registered");
    }

    #[tokio::test]
    async fn test_acquire_writes_pid_and_release_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror-x.lock");
        let router = Arc::new(Router::new());

        let mut handle = acquire(&router, "mirror-x", &path).await.unwrap();
        assert!(handle.is_locked());
        assert_eq!(handle.identity(), "mirror-x");
        assert_eq!(read_holder(&path), Some(std::process::id()));

        assert_eq!(handle.release(), Release::Deleted);
        assert!(!path.exists());
        assert!(!handle.is_locked());
        assert_eq!(handle.release(), Release::AlreadyReleased);

        // A fresh acquisition recreates the file
        let mut again = acquire(&router, "mirror-x", &path).await.unwrap();
        assert!(path.exists());
        assert_eq!(again.release(), Release::Deleted);
    }

    #[tokio::test]
    async fn test_acquire_creates_lock_dir() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/run/job.lock");
        let router = Arc::new(Router::new());

        let handle = acquire(&router, "job", &path).await.unwrap();
        assert!(path.exists());
        drop(handle);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_acquire_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let router = Arc::new(Router::new());

        let err = acquire(&router, "job", &blocker.join("job.lock"))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Unavailable { .. }));
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("cannot open lock file"));
    }

    #[tokio::test]
    async fn test_second_contender_waits_for_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mirror-x.lock");
        let router = Arc::new(Router::new());

        let mut first = acquire(&router, "mirror-x", &path).await.unwrap();

        let contender_router = Arc::new(Router::new());
        let contender_path = path.clone();
        let mut second = tokio::spawn(async move {
            acquire(&contender_router, "mirror-x", &contender_path).await
        });

        // Still blocked while the first holder keeps the lock
        let early = tokio::time::timeout(Duration::from_millis(300), &mut second).await;
        assert!(early.is_err(), "second contender must block");

        first.release();
        let mut second = second.await.unwrap().unwrap();
        assert!(second.is_locked());
        // Whoever holds the lock has a file at the path with its pid
        assert!(path.exists());
        assert_eq!(read_holder(&path), Some(std::process::id()));
        second.release();
    }

    #[tokio::test]
    async fn test_release_keeps_file_when_waiter_holds_it() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("held.lock");
        let router = Arc::new(Router::new());

        let mut handle = acquire(&router, "held", &path).await.unwrap();

        // A second descriptor blocked on the lock, as a waiting process would be
        let other = open_lock_file(&path).unwrap();
        let waiter = std::thread::spawn(move || {
            other.lock_exclusive().unwrap();
            other
        });
        std::thread::sleep(Duration::from_millis(100));

        let outcome = handle.release();
        let other = waiter.join().unwrap();
        match outcome {
            // Waiter won the race for the lock: it holds the live file
            Release::Kept => {
                assert!(path.exists());
                assert!(same_file(&other, &path).unwrap());
                FileExt::unlock(&other).unwrap();
            }
            // Probe won: the waiter holds a deleted inode, which the identity
            // check rejects, and the next acquisition recreates the file
            Release::Deleted => {
                assert!(!path.exists());
                assert!(!same_file(&other, &path).unwrap());
                FileExt::unlock(&other).unwrap();

                let mut again = acquire(&router, "held", &path).await.unwrap();
                assert!(path.exists());
                assert!(same_file(again.file.as_ref().unwrap(), &path).unwrap());
                assert_eq!(read_holder(&path), Some(std::process::id()));
                assert_eq!(again.release(), Release::Deleted);
            }
            Release::AlreadyReleased => panic!("lock released twice"),
        }
    }

    #[tokio::test]
    async fn test_stale_lock_race_is_retried() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("race.lock");
        let router = Arc::new(Router::new());

        let mut calls = 0;
        let mut handle = acquire_with(&router, "race", &path, |p| {
            calls += 1;
            if calls == 1 {
                // Another releaser deletes the file and a newcomer recreates it
                std::fs::remove_file(p).unwrap();
                std::fs::write(p, "").unwrap();
            }
        })
        .await
        .unwrap();

        assert_eq!(calls, 2, "mismatch must trigger exactly one retry");
        let held = handle.file.as_ref().unwrap();
        assert!(same_file(held, &path).unwrap());
        assert_eq!(read_holder(&path), Some(std::process::id()));
        handle.release();
    }

    #[test]
    fn test_same_file_detects_replacement() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.lock");
        let file = open_lock_file(&path).unwrap();
        assert!(same_file(&file, &path).unwrap());

        std::fs::remove_file(&path).unwrap();
        assert!(!same_file(&file, &path).unwrap());

        std::fs::write(&path, "").unwrap();
        assert!(!same_file(&file, &path).unwrap());
    }

    #[tokio::test]
    async fn test_wait_interrupted_by_termination_signal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.lock");
        let holder_router = Arc::new(Router::new());
        let mut holder = acquire(&holder_router, "busy", &path).await.unwrap();

        let router = Arc::new(Router::new());
        let waiter_router = Arc::clone(&router);
        let waiter_path = path.clone();
        let waiter =
            tokio::spawn(async move { acquire(&waiter_router, "busy", &waiter_path).await });

        wait_until_registered(&router).await;
        router.on_signal_received(SignalKind::Terminate);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            LockError::Interrupted {
                signal: SignalKind::Terminate,
                ..
            }
        ));
        assert_eq!(err.exit_code(), 143);
        assert!(router.handled().contains(SignalKind::Terminate));
        assert!(!router.has_target());

        // Let the abandoned flock thread finish
        holder.release();
    }

    #[tokio::test]
    async fn test_pending_signal_aborts_wait_immediately() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.lock");
        let holder_router = Arc::new(Router::new());
        let mut holder = acquire(&holder_router, "busy", &path).await.unwrap();

        let router = Arc::new(Router::new());
        router.on_signal_received(SignalKind::Interrupt);

        let err = acquire(&router, "busy", &path).await.unwrap_err();
        assert_eq!(err.exit_code(), 130);
        assert!(router.pending().is_empty());
        assert!(router.handled().contains(SignalKind::Interrupt));

        holder.release();
    }

    #[tokio::test]
    async fn test_stop_and_continue_do_not_abort_wait() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("busy.lock");
        let holder_router = Arc::new(Router::new());
        let mut holder = acquire(&holder_router, "busy", &path).await.unwrap();

        let router = Arc::new(Router::new());
        let waiter_router = Arc::clone(&router);
        let waiter_path = path.clone();
        let waiter =
            tokio::spawn(async move { acquire(&waiter_router, "busy", &waiter_path).await });

        wait_until_registered(&router).await;
        router.on_signal_received(SignalKind::TerminalStop);
        router.on_signal_received(SignalKind::Continue);
        holder.release();

        let mut handle = waiter.await.unwrap().unwrap();
        assert!(handle.is_locked());
        assert!(router.handled().contains(SignalKind::Continue));
        handle.release();
    }
}
