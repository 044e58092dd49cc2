//! Process-wide locks held while a composition script runs.
//!
//! - [`KillLock`]: the termination handler takes it before exiting, so an
//!   interrupt waits until the running script has finished.
//! - [`ReloadLock`]: the module watcher takes the write side before it drops
//!   cached script modules; a run holds the read side, so no module is
//!   reloaded underneath a script.
//!
//! [`ResourceLocks::acquire`] takes both and releases them on drop.

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{ComposeError, ComposeResult};

/// Guards against forceful termination mid-run.
#[derive(Debug, Clone, Default)]
pub struct KillLock(Arc<Mutex<()>>);

impl KillLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no script is running, then hold the lock.
    pub fn hold(&self) -> ComposeResult<MutexGuard<'_, ()>> {
        self.0
            .lock()
            .map_err(|_| ComposeError::LockPoisoned("kill lock"))
    }

    /// Take the lock only if no script is running.
    pub fn try_hold(&self) -> Option<MutexGuard<'_, ()>> {
        self.0.try_lock().ok()
    }
}

/// Guards against hot-reloading script modules mid-run.
#[derive(Debug, Clone, Default)]
pub struct ReloadLock(Arc<RwLock<()>>);

impl ReloadLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Held by a run for its whole duration.
    pub fn read(&self) -> ComposeResult<RwLockReadGuard<'_, ()>> {
        self.0
            .read()
            .map_err(|_| ComposeError::LockPoisoned("reload lock"))
    }

    /// Held by the watcher while it invalidates modules.
    pub fn write(&self) -> ComposeResult<RwLockWriteGuard<'_, ()>> {
        self.0
            .write()
            .map_err(|_| ComposeError::LockPoisoned("reload lock"))
    }

    /// Take the write side only if no run holds the read side.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.0.try_write().ok()
    }
}

/// Both resource locks, shared with the termination handler and the watcher.
#[derive(Debug, Clone, Default)]
pub struct ResourceLocks {
    kill: KillLock,
    reload: ReloadLock,
}

/// Proof that both locks are held; dropping it releases them.
#[must_use = "the locks are released as soon as the guard is dropped"]
pub struct ResourceGuard<'a> {
    _kill: MutexGuard<'a, ()>,
    _reload: RwLockReadGuard<'a, ()>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the shared kill lock.
    pub fn kill_lock(&self) -> KillLock {
        self.kill.clone()
    }

    /// A handle on the shared reload lock.
    pub fn reload_lock(&self) -> ReloadLock {
        self.reload.clone()
    }

    /// Take the kill lock, then the reload lock.
    pub fn acquire(&self) -> ComposeResult<ResourceGuard<'_>> {
        let kill = self.kill.hold()?;
        let reload = self.reload.read()?;
        Ok(ResourceGuard {
            _kill: kill,
            _reload: reload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_guard_blocks_reload_until_dropped() {
        let locks = ResourceLocks::new();
        let reload = locks.reload_lock();
        let reloaded = Arc::new(AtomicBool::new(false));

        let guard = locks.acquire().unwrap();

        let flag = reloaded.clone();
        let (started_tx, started_rx) = mpsc::channel();
        let watcher = thread::spawn(move || {
            started_tx.send(()).unwrap();
            let _w = reload.write().unwrap();
            flag.store(true, Ordering::SeqCst);
        });

        started_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(!reloaded.load(Ordering::SeqCst));

        drop(guard);
        watcher.join().unwrap();
        assert!(reloaded.load(Ordering::SeqCst));
    }

    #[test]
    fn test_kill_lock_waits_for_run() {
        let locks = ResourceLocks::new();
        let kill = locks.kill_lock();

        let guard = locks.acquire().unwrap();
        assert!(kill.try_hold().is_none());
        assert!(locks.reload_lock().try_write().is_none());
        drop(guard);
        assert!(kill.try_hold().is_some());
        assert!(locks.reload_lock().try_write().is_some());
    }

    #[test]
    fn test_locks_released_on_error_path() {
        let locks = ResourceLocks::new();
        let run = || -> ComposeResult<()> {
            let _guard = locks.acquire()?;
            Err(ComposeError::TemplateNotFound("probe".into()))
        };
        assert!(run().is_err());
        assert!(locks.acquire().is_ok());
    }
}
