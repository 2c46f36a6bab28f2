//! Shared per-processor state: the lifecycle tag and snapshot read by
//! SHOW PROCESSLIST, the cancel/stop controls reachable from other
//! connections, and the per-worker statement metrics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::transaction::BusyContext;

/// Processor lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateTag {
    New,
    Auth,
    Sleep,
    SleepInTx,
    Read,
    Write,
    Busy,
    Stopped,
    Closed,
}

impl StateTag {
    pub fn text(&self) -> &'static str {
        match self {
            StateTag::New => "new",
            StateTag::Auth => "auth",
            StateTag::Sleep => "sleep",
            StateTag::SleepInTx => "sleep_in_tx",
            StateTag::Read => "read",
            StateTag::Write => "write",
            StateTag::Busy => "busy",
            StateTag::Stopped => "stopped",
            StateTag::Closed => "closed",
        }
    }
}

/// A copy of one processor's state, as rendered by SHOW PROCESSLIST.
#[derive(Debug, Clone)]
pub struct ProcessorState {
    pub id: u32,
    pub user: Option<String>,
    pub host: String,
    pub database: String,
    pub state: StateTag,
    pub state_seconds: u64,
    pub sql: Option<String>,
}

struct StateInner {
    tag: StateTag,
    since: Instant,
    user: Option<String>,
    database: String,
    sql: Option<String>,
}

/// The handle other connections (KILL, cancel requests, the worker's idle
/// sweep) use to observe and control a processor.
pub struct ProcessorShared {
    id: u32,
    name: String,
    host: String,
    state: Mutex<StateInner>,
    busy: Mutex<Option<Arc<BusyContext>>>,
    interrupt: Mutex<Option<rusqlite::InterruptHandle>>,
    stopped: AtomicBool,
    stop_notify: Notify,
}

impl ProcessorShared {
    pub fn new(id: u32, name: String, host: String) -> Self {
        ProcessorShared {
            id,
            name,
            host,
            state: Mutex::new(StateInner {
                tag: StateTag::New,
                since: Instant::now(),
                user: None,
                database: String::new(),
                sql: None,
            }),
            busy: Mutex::new(None),
            interrupt: Mutex::new(None),
            stopped: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn set_state(&self, tag: StateTag) {
        let mut inner = self.state.lock();
        if inner.tag != tag {
            inner.tag = tag;
            inner.since = Instant::now();
        }
    }

    pub fn set_user(&self, user: &str) {
        self.state.lock().user = Some(user.to_string());
    }

    pub fn set_database(&self, database: &str) {
        self.state.lock().database = database.to_string();
    }

    pub fn set_sql(&self, sql: Option<&str>) {
        self.state.lock().sql = sql.map(str::to_string);
    }

    pub fn user(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    pub fn snapshot(&self) -> ProcessorState {
        let inner = self.state.lock();
        ProcessorState {
            id: self.id,
            user: inner.user.clone(),
            host: self.host.clone(),
            database: inner.database.clone(),
            state: inner.tag,
            state_seconds: inner.since.elapsed().as_secs(),
            sql: inner.sql.clone(),
        }
    }

    pub fn enter_busy(&self, ctx: Arc<BusyContext>) {
        *self.busy.lock() = Some(ctx);
        self.set_state(StateTag::Busy);
    }

    pub fn leave_busy(&self) {
        *self.busy.lock() = None;
    }

    pub fn set_interrupt(&self, handle: rusqlite::InterruptHandle) {
        *self.interrupt.lock() = Some(handle);
    }

    /// Cancels the in-flight query; a whole-connection cancel also stops
    /// the processor.
    pub fn cancel(&self, query_only: bool) {
        if let Some(busy) = self.busy.lock().as_ref() {
            busy.cancel();
        }
        if let Some(interrupt) = self.interrupt.lock().as_ref() {
            interrupt.interrupt();
        }
        if !query_only {
            self.stop();
        }
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.set_state(StateTag::Stopped);
        self.stop_notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Resolves when the processor is asked to stop.
    pub async fn stopped(&self) {
        if self.is_stopped() {
            return;
        }
        let notified = self.stop_notify.notified();
        if self.is_stopped() {
            return;
        }
        notified.await;
    }
}

/// Per-worker statement counters, imprecise by design.
#[derive(Default)]
pub struct SqlMetric {
    pub select_stmts: AtomicU64,
    pub insert_stmts: AtomicU64,
    pub update_stmts: AtomicU64,
    pub delete_stmts: AtomicU64,
    pub total_stmts: AtomicU64,
    pub slow_stmts: AtomicU64,
}

impl SqlMetric {
    pub fn record(&self, command: &str) {
        match command {
            "SELECT" => self.select_stmts.fetch_add(1, Ordering::Relaxed),
            "INSERT" => self.insert_stmts.fetch_add(1, Ordering::Relaxed),
            "UPDATE" => self.update_stmts.fetch_add(1, Ordering::Relaxed),
            "DELETE" => self.delete_stmts.fetch_add(1, Ordering::Relaxed),
            _ => 0,
        };
        self.total_stmts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slow(&self) {
        self.slow_stmts.fetch_add(1, Ordering::Relaxed);
    }
}
