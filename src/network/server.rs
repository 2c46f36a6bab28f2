//! The server: accept loop, worker fan-out, and the shared resources
//! every processor reaches through [`ServerCore`] (meta database, the
//! process-wide write lock, the scalar function registry).

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use super::protocol::{write_frame, Packet};
use super::state::{ProcessorShared, ProcessorState};
use super::worker::{self, Intake, WorkerHandle};
use crate::config::ServerConfig;
use crate::core::{ServerError, User};
use crate::meta::MetaDb;
use crate::transaction::DbWriteLock;

pub const SERVER_VERSION: &str = concat!("rsqlited ", env!("CARGO_PKG_VERSION"));

/// Shared server state. Workers and processors hold an `Arc` of this;
/// the worker list is installed once at startup, which breaks the
/// server/worker ownership cycle.
pub struct ServerCore {
    pub config: ServerConfig,
    pub meta: MetaDb,
    pub write_lock: DbWriteLock,
    start_time: SystemTime,
    started: tokio::time::Instant,
    next_id: AtomicU32,
    workers: OnceLock<Vec<WorkerHandle>>,
}

impl ServerCore {
    pub fn next_processor_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        self.workers.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn start_time_epoch(&self) -> i64 {
        self.start_time
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.workers()
            .iter()
            .map(|w| w.shared.processor_count())
            .sum()
    }

    /// Resolves a processor id across all workers.
    pub fn find_processor(&self, pid: u32) -> Option<Arc<ProcessorShared>> {
        self.workers().iter().find_map(|w| w.shared.find(pid))
    }

    /// Processor snapshots visible to `viewer`: a super-admin sees all,
    /// other users see their own connections.
    pub fn processor_states(&self, viewer: &User) -> Vec<ProcessorState> {
        let mut states: Vec<ProcessorState> = self
            .workers()
            .iter()
            .flat_map(|w| w.shared.states())
            .filter(|s| viewer.is_sa() || s.user.as_deref() == Some(viewer.user.as_str()))
            .collect();
        states.sort_by_key(|s| s.id);
        states
    }

    /// Aggregated statement metrics for SHOW STATUS, in the order
    /// (select, insert, update, delete, total, slow).
    pub fn metric_totals(&self) -> [u64; 6] {
        let mut totals = [0u64; 6];
        for w in self.workers() {
            let m = &w.shared.metric;
            totals[0] += m.select_stmts.load(Ordering::Relaxed);
            totals[1] += m.insert_stmts.load(Ordering::Relaxed);
            totals[2] += m.update_stmts.load(Ordering::Relaxed);
            totals[3] += m.delete_stmts.load(Ordering::Relaxed);
            totals[4] += m.total_stmts.load(Ordering::Relaxed);
            totals[5] += m.slow_stmts.load(Ordering::Relaxed);
        }
        totals
    }

    /// Registers the session functions into a fresh engine connection.
    pub fn register_functions(
        &self,
        conn: &Connection,
        user: &str,
        host: &str,
        database: &str,
    ) -> rusqlite::Result<()> {
        let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

        for name in ["version", "server_version"] {
            conn.create_scalar_function(name, 0, flags, move |_| {
                Ok(SERVER_VERSION.to_string())
            })?;
        }

        let start_epoch = self.start_time_epoch();
        for name in ["start_time", "pg_postmaster_start_time"] {
            conn.create_scalar_function(name, 0, flags, move |_| Ok(start_epoch))?;
        }

        let user_at_host = format!("{user}@{host}");
        conn.create_scalar_function("user", 0, flags, move |_| Ok(user_at_host.clone()))?;
        let current = user.to_string();
        conn.create_scalar_function("current_user", 0, flags, move |_| Ok(current.clone()))?;

        for name in ["database", "current_database"] {
            let db = database.to_string();
            conn.create_scalar_function(name, 0, flags, move |_| Ok(db.clone()))?;
        }

        // The actual delay runs on the processor before execution; the
        // engine-side function only completes the expression.
        conn.create_scalar_function("sleep", 1, FunctionFlags::SQLITE_UTF8, |_| Ok(0i64))?;
        Ok(())
    }
}

pub struct Server {
    core: Arc<ServerCore>,
    next_worker: AtomicUsize,
}

impl Server {
    /// Opens the meta database and spawns the worker threads.
    pub fn new(config: ServerConfig) -> Result<Server, ServerError> {
        config.validate()?;
        let meta = MetaDb::open(std::path::Path::new(&config.data_dir))?;
        let core = Arc::new(ServerCore {
            config,
            meta,
            write_lock: DbWriteLock::new(),
            start_time: SystemTime::now(),
            started: tokio::time::Instant::now(),
            next_id: AtomicU32::new(1),
            workers: OnceLock::new(),
        });

        let workers: Vec<WorkerHandle> = (0..core.config.worker_count)
            .map(|id| worker::spawn(Arc::clone(&core), id))
            .collect();
        core.workers
            .set(workers)
            .map_err(|_| ServerError::Internal("workers already installed".to_string()))?;

        Ok(Server {
            core,
            next_worker: AtomicUsize::new(0),
        })
    }

    pub fn core(&self) -> Arc<ServerCore> {
        Arc::clone(&self.core)
    }

    /// Binds the listen socket.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = format!("{}:{}", self.core.config.host, self.core.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(
            version = SERVER_VERSION,
            addr = %listener.local_addr()?,
            workers = self.core.config.worker_count,
            data_dir = %self.core.config.data_dir,
            "server ready"
        );
        Ok(listener)
    }

    /// Accept loop; runs until the listener errors or the task is
    /// dropped.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => self.dispatch(stream, addr),
                Err(e) => {
                    error!(error = %e, "accept failed");
                    return Err(ServerError::Io(e));
                }
            }
        }
    }

    /// Round-robin offer; walks the ring once before rejecting. The
    /// stream moves to the chosen worker's runtime as a std socket.
    fn dispatch(&self, stream: TcpStream, addr: std::net::SocketAddr) {
        let stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to detach accepted socket");
                return;
            }
        };
        let workers = self.core.workers();
        let n = workers.len();
        let first = self.next_worker.fetch_add(1, Ordering::Relaxed) % n;
        let mut intake = Intake { stream, addr };
        for i in 0..n {
            match workers[(first + i) % n].offer(intake) {
                Ok(()) => return,
                Err(back) => intake = back,
            }
        }
        warn!(peer = %addr, "all worker intakes full");
        tokio::spawn(async move {
            if let Ok(mut stream) = TcpStream::from_std(intake.stream) {
                let payload = Packet::error("FATAL", "08004", "Too many connections");
                let _ = write_frame(&mut stream, 0, &payload).await;
            }
        });
    }

    /// Stops every processor; the accept loop is stopped by dropping the
    /// `serve` future.
    pub fn stop(&self) {
        for w in self.core.workers() {
            w.shared.stop_all();
        }
    }
}
