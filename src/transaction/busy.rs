use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Parking record for a processor that cannot execute right now: either
/// the write lock is held elsewhere, the engine reported busy, or the
/// statement is a `sleep(N)` call.
///
/// Readiness: the deadline has passed, or the context is not sleepable
/// and the write lock has become available. `deadline = None` means wait
/// forever (busy timeout 0 surfaces immediately and never parks).
pub struct BusyContext {
    deadline: Option<Instant>,
    sleepable: bool,
    on_write_lock: AtomicBool,
    canceled: AtomicBool,
    cancel_notify: Notify,
}

impl BusyContext {
    /// A busy wait bounded by the configured busy timeout.
    /// `timeout = None` waits on the write lock release forever.
    pub fn busy(timeout: Option<Duration>, on_write_lock: bool) -> Self {
        BusyContext {
            deadline: timeout.map(|t| Instant::now() + t),
            sleepable: false,
            on_write_lock: AtomicBool::new(on_write_lock),
            canceled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    /// A `sleep(N)` park: ready only when the deadline passes.
    pub fn sleep(duration: Duration) -> Self {
        BusyContext {
            deadline: Some(Instant::now() + duration),
            sleepable: true,
            on_write_lock: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_sleepable(&self) -> bool {
        self.sleepable
    }

    pub fn is_on_write_lock(&self) -> bool {
        self.on_write_lock.load(Ordering::Acquire)
    }

    pub fn set_on_write_lock(&self, on: bool) {
        self.on_write_lock.store(on, Ordering::Release);
    }

    pub fn is_timeout(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
        self.cancel_notify.notify_waiters();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Resolves when `cancel` is called; immediately when already
    /// canceled.
    pub async fn canceled(&self) {
        if self.is_canceled() {
            return;
        }
        let notified = self.cancel_notify.notified();
        if self.is_canceled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_readiness() {
        let ctx = BusyContext::sleep(Duration::from_millis(0));
        assert!(ctx.is_sleepable());
        assert!(ctx.is_timeout());
        let ctx = BusyContext::sleep(Duration::from_secs(3600));
        assert!(!ctx.is_timeout());
    }

    #[test]
    fn test_busy_without_deadline_never_times_out() {
        let ctx = BusyContext::busy(None, true);
        assert!(!ctx.is_timeout());
        assert!(ctx.is_on_write_lock());
    }

    #[tokio::test]
    async fn test_cancel_resolves_waiters() {
        let ctx = BusyContext::busy(None, false);
        ctx.cancel();
        assert!(ctx.is_canceled());
        // Resolves immediately once canceled.
        ctx.canceled().await;
    }
}
