//! Worker: one thread owning an intake queue and a bounded set of
//! processors. Each worker runs its own single-threaded runtime;
//! processors are local tasks on it, so a processor is only ever touched
//! by its worker's thread. The accept loop offers connections to a
//! worker; the worker either spawns a processor or rejects over capacity,
//! and its registry backs SHOW PROCESSLIST and KILL.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use super::processor::Processor;
use super::protocol::{write_frame, Packet};
use super::server::ServerCore;
use super::state::{ProcessorShared, ProcessorState, SqlMetric};

pub(crate) struct Intake {
    pub stream: std::net::TcpStream,
    pub addr: SocketAddr,
}

/// State shared between a worker thread and the rest of the server.
pub struct WorkerShared {
    pub name: String,
    procs: Mutex<HashMap<u32, Arc<ProcessorShared>>>,
    pub metric: SqlMetric,
}

impl WorkerShared {
    pub fn processor_count(&self) -> usize {
        self.procs.lock().len()
    }

    pub fn find(&self, pid: u32) -> Option<Arc<ProcessorShared>> {
        self.procs.lock().get(&pid).cloned()
    }

    /// Snapshots of this worker's processors.
    pub fn states(&self) -> Vec<ProcessorState> {
        self.procs.lock().values().map(|p| p.snapshot()).collect()
    }

    pub fn stop_all(&self) {
        for p in self.procs.lock().values() {
            p.stop();
        }
    }
}

/// Cheap handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    pub id: usize,
    intake: mpsc::Sender<Intake>,
    pub shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    /// Hands a fresh connection to this worker. Fails when the intake
    /// queue is full.
    pub(crate) fn offer(&self, intake: Intake) -> Result<(), Intake> {
        self.intake.try_send(intake).map_err(|e| match e {
            mpsc::error::TrySendError::Full(i) | mpsc::error::TrySendError::Closed(i) => i,
        })
    }
}

/// Spawns a worker thread and returns its handle.
pub fn spawn(core: Arc<ServerCore>, id: usize) -> WorkerHandle {
    let name = format!("worker-{id}");
    let (tx, rx) = mpsc::channel(core.config.max_conns);
    let shared = Arc::new(WorkerShared {
        name: name.clone(),
        procs: Mutex::new(HashMap::new()),
        metric: SqlMetric::default(),
    });
    let thread_shared = Arc::clone(&shared);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || worker_main(core, rx, thread_shared))
        .expect("spawn worker thread");
    WorkerHandle {
        id,
        intake: tx,
        shared,
    }
}

fn worker_main(core: Arc<ServerCore>, intake: mpsc::Receiver<Intake>, shared: Arc<WorkerShared>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(worker = %shared.name, error = %e, "worker runtime failed");
            return;
        }
    };
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, run(core, intake, shared));
}

async fn run(
    core: Arc<ServerCore>,
    mut intake: mpsc::Receiver<Intake>,
    shared: Arc<WorkerShared>,
) {
    // io_ratio bounds how many queued intakes one wake drains, so a burst
    // of connects cannot starve running processors of the thread.
    let batch = core.config.worker_io_ratio as usize;
    while let Some(first) = intake.recv().await {
        handle_intake(&core, &shared, first);
        let mut drained = 1;
        while drained < batch {
            match intake.try_recv() {
                Ok(next) => {
                    handle_intake(&core, &shared, next);
                    drained += 1;
                }
                Err(_) => break,
            }
        }
    }
    // Intake closed (server shut down): keep the runtime alive until the
    // remaining processors finish.
    debug!(worker = %shared.name, "intake closed, draining processors");
    while shared.processor_count() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn handle_intake(core: &Arc<ServerCore>, shared: &Arc<WorkerShared>, intake: Intake) {
    let stream = match TcpStream::from_std(intake.stream) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(worker = %shared.name, error = %e, "failed to adopt connection");
            return;
        }
    };

    if shared.processor_count() >= core.config.max_conns {
        warn!(worker = %shared.name, peer = %intake.addr, "too many connections");
        tokio::task::spawn_local(reject_too_many(stream));
        return;
    }

    let id = core.next_processor_id();
    let name = format!("{}-proc-{id}", shared.name);
    let host = intake.addr.ip().to_string();
    let proc_shared = Arc::new(ProcessorShared::new(id, name, host));
    shared.procs.lock().insert(id, Arc::clone(&proc_shared));

    let core = Arc::clone(core);
    let worker = Arc::clone(shared);
    tokio::task::spawn_local(async move {
        debug!(processor = %proc_shared.name(), peer = %intake.addr, "connect");
        let processor = Processor::new(
            Arc::clone(&core),
            Arc::clone(&worker),
            Arc::clone(&proc_shared),
            stream,
        );
        processor.run().await;
        worker.procs.lock().remove(&proc_shared.id());
        debug!(processor = %proc_shared.name(), "close");
    });
}

async fn reject_too_many(mut stream: TcpStream) {
    let payload = Packet::error("FATAL", "08004", "Too many connections");
    let _ = write_frame(&mut stream, 0, &payload).await;
}
