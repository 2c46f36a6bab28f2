use parking_lot::Mutex;
use tokio::sync::Notify;

/// The process-wide single-writer lock over the shared database file.
///
/// Non-reentrant and non-blocking: `try_lock` never waits. A processor
/// that fails to acquire parks itself in its worker's busy set and is
/// woken through [`DbWriteLock::released`] when the holder unlocks.
/// Composed into the server, never a global.
pub struct DbWriteLock {
    owner: Mutex<Option<u32>>,
    released: Notify,
}

impl DbWriteLock {
    pub fn new() -> Self {
        DbWriteLock {
            owner: Mutex::new(None),
            released: Notify::new(),
        }
    }

    /// Acquires for `pid` when free. Re-acquiring while holding fails.
    pub fn try_lock(&self, pid: u32) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_none() {
            *owner = Some(pid);
            true
        } else {
            false
        }
    }

    /// Releases only when `pid` is the current holder; wakes all parked
    /// waiters.
    pub fn unlock(&self, pid: u32) -> bool {
        let mut owner = self.owner.lock();
        if *owner == Some(pid) {
            *owner = None;
            drop(owner);
            self.released.notify_waiters();
            true
        } else {
            false
        }
    }

    pub fn holder(&self) -> Option<u32> {
        *self.owner.lock()
    }

    pub fn holds(&self, pid: u32) -> bool {
        self.holder() == Some(pid)
    }

    pub fn is_locked(&self) -> bool {
        self.holder().is_some()
    }

    /// Resolves at the next unlock. Callers re-check lock state after
    /// waking; the busy deadline bounds any missed notification.
    pub async fn released(&self) {
        self.released.notified().await;
    }
}

impl Default for DbWriteLock {
    fn default() -> Self {
        DbWriteLock::new()
    }
}
