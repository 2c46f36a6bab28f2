//! The per-connection protocol handler: authentication, command decode,
//! statement execution, result streaming and cancellation.
//!
//! A processor is owned by exactly one worker for its whole life and runs
//! as a single task on that worker's thread. It never blocks the worker
//! on contention: waiting for the write lock, an engine busy condition or
//! a `sleep(N)` call parks the task on a busy context that the next
//! wakeup (lock release, deadline, cancel) resumes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::auth::{self, AuthMethod};
use super::protocol::{
    self, command, parse_frame, write_frame, HandshakeInit, LoginRequest, Packet, PacketReader,
};
use super::server::{ServerCore, SERVER_VERSION};
use super::state::{ProcessorShared, StateTag};
use super::worker::WorkerShared;
use crate::core::{ServerError, User};
use crate::parser::{meta_sql, Show, SqlParser, Statement, StatementKind, TxKind};
use crate::transaction::{BusyContext, SavepointStack, Transaction};

enum EngineOutcome {
    Rows(u64),
    Affected(u64),
}

struct Prepared {
    statement: Statement,
}

/// Outbound frame queue with small-buffer merging. Frames are gathered
/// here during execution and flushed in bounded batches.
struct WriteQueue {
    queue: VecDeque<BytesMut>,
    seq: u8,
    pushed: u64,
    max_write_buffer: usize,
    max_write_queue: usize,
    max_write_times: usize,
}

impl WriteQueue {
    fn new(max_write_buffer: usize, max_write_queue: usize, max_write_times: usize) -> Self {
        WriteQueue {
            queue: VecDeque::new(),
            seq: 1,
            pushed: 0,
            max_write_buffer,
            max_write_queue,
            max_write_times,
        }
    }

    /// Response sequence numbers continue from the request's.
    fn start_response(&mut self, request_seq: u8) {
        self.seq = request_seq.wrapping_add(1);
    }

    fn push(&mut self, payload: &[u8]) {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        self.pushed += 1;
        let len = payload.len() as u32;
        // Merge small frames into the tail buffer to reduce syscalls.
        let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, seq];
        if let Some(last) = self.queue.back_mut() {
            if last.len() + 4 + payload.len() <= self.max_write_buffer {
                last.extend_from_slice(&header);
                last.extend_from_slice(payload);
                return;
            }
        }
        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(payload);
        self.queue.push_back(buf);
    }

    fn pushed(&self) -> u64 {
        self.pushed
    }

    fn should_flush(&self) -> bool {
        match self.queue.front() {
            Some(front) => {
                front.len() >= self.max_write_buffer || self.queue.len() >= self.max_write_queue
            }
            None => false,
        }
    }

    async fn flush(&mut self, stream: &mut TcpStream) -> Result<(), ServerError> {
        let mut writes = 0usize;
        while let Some(buf) = self.queue.pop_front() {
            stream.write_all(&buf).await?;
            writes += 1;
            if writes >= self.max_write_times {
                // Bound the time one flush holds the worker thread.
                stream.flush().await?;
                tokio::task::yield_now().await;
                writes = 0;
            }
        }
        stream.flush().await?;
        Ok(())
    }
}

pub struct Processor {
    core: Arc<ServerCore>,
    worker: Arc<WorkerShared>,
    shared: Arc<ProcessorShared>,
    stream: TcpStream,
    read_buf: BytesMut,
    out: WriteQueue,

    conn: Option<Connection>,
    user: Option<User>,
    database: String,
    meta_alias: Option<String>,

    tx: Option<Transaction>,
    savepoints: SavepointStack,
    session_read_only: bool,
    next_tx_read_only: Option<bool>,

    prepared: HashMap<u32, Prepared>,
    next_stmt_id: u32,
}

impl Processor {
    pub fn new(
        core: Arc<ServerCore>,
        worker: Arc<WorkerShared>,
        shared: Arc<ProcessorShared>,
        stream: TcpStream,
    ) -> Processor {
        let config = &core.config;
        let out = WriteQueue::new(
            config.processor_max_write_buffer,
            config.processor_max_write_queue,
            config.processor_max_write_times,
        );
        let read_buf = BytesMut::with_capacity(config.processor_init_read_buffer);
        Processor {
            core,
            worker,
            shared,
            stream,
            read_buf,
            out,
            conn: None,
            user: None,
            database: String::new(),
            meta_alias: None,
            tx: None,
            savepoints: SavepointStack::new(),
            session_read_only: false,
            next_tx_read_only: None,
            prepared: HashMap::new(),
            next_stmt_id: 1,
        }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.lifecycle().await {
            match e {
                ServerError::Network(_) | ServerError::Io(_) => {
                    debug!(processor = %self.shared.name(), error = %e, "connection error")
                }
                _ => warn!(processor = %self.shared.name(), error = %e, "processor failed"),
            }
        }
        self.close().await;
    }

    async fn lifecycle(&mut self) -> Result<(), ServerError> {
        self.shared.set_state(StateTag::Auth);

        let host = self.shared.host().to_string();
        if !self.core.meta.is_host_allowed(&host)? {
            trace!(host = %host, "host not allowed");
            let payload =
                Packet::error("FATAL", "28000", &format!("Host '{host}' is not allowed"));
            write_frame(&mut self.stream, 0, &payload).await?;
            return Ok(());
        }

        let seed = auth::new_seed();
        let handshake = HandshakeInit {
            seq: 0,
            protocol_version: protocol::PROTOCOL_VERSION,
            server_version: SERVER_VERSION.to_string(),
            session_id: self.shared.id(),
            seed,
        };
        write_frame(&mut self.stream, 0, &handshake.encode()).await?;

        let auth_timeout = self.core.config.auth_timeout();
        let (seq, payload) = match self.read_frame(auth_timeout, "Authentication timeout").await
        {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e @ ServerError::Timeout(_)) => {
                let payload = Packet::error("FATAL", e.sqlstate(), &e.to_string());
                write_frame(&mut self.stream, 0, &payload).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match LoginRequest::decode(payload)? {
            LoginRequest::Cancel {
                session_id,
                query_only,
            } => {
                // Out-of-band cancel: resolve the target processor across
                // all workers; the allow list already screened the peer.
                if let Some(target) = self.core.find_processor(session_id) {
                    debug!(session = session_id, query_only, "cancel request");
                    target.cancel(query_only);
                }
                Ok(())
            }
            LoginRequest::Login {
                database,
                user,
                sign,
                ..
            } => {
                self.authenticate(seq, &host, &database, &user, &sign, &seed)
                    .await?;
                if self.user.is_none() {
                    return Ok(());
                }
                self.command_loop().await
            }
        }
    }

    async fn authenticate(
        &mut self,
        seq: u8,
        host: &str,
        database: &str,
        user: &str,
        sign: &[u8],
        seed: &[u8],
    ) -> Result<(), ServerError> {
        self.out.start_response(seq);
        let found = self
            .core
            .meta
            .select_user(host, user, crate::parser::DEFAULT_PROTOCOL)?;
        let account = found.filter(|u| {
            AuthMethod::parse(&u.protocol, &u.auth_method)
                .map(|method| method.verify(u.password.as_deref(), seed, sign))
                .unwrap_or(false)
        });
        let Some(account) = account else {
            trace!(user, host, "authentication failed");
            self.send_error_packet(
                "FATAL",
                "28000",
                &format!("Access denied for user '{user}'@'{host}'"),
            )
            .await?;
            return Ok(());
        };

        if database.is_empty() {
            self.send_error_packet("FATAL", "3D000", "No database selected")
                .await?;
            return Ok(());
        }
        if !account.is_sa() && !self.core.meta.has_db_access(host, &account.user, database)? {
            self.send_error_packet(
                "FATAL",
                "42501",
                &format!("Access denied to database '{database}'"),
            )
            .await?;
            return Ok(());
        }
        let catalog = self.core.meta.select_catalog(database)?;
        let file = self
            .core
            .meta
            .db_file(database, catalog.as_ref().and_then(|c| c.dir.as_deref()));
        if !account.is_sa() && !file.is_file() {
            self.send_error_packet("FATAL", "3D000", &format!("Unknown database '{database}'"))
                .await?;
            return Ok(());
        }

        let conn = Connection::open(&file)?;
        conn.pragma_update(None, "journal_mode", "wal")?;
        self.core
            .register_functions(&conn, &account.user, host, database)?;
        self.shared.set_interrupt(conn.get_interrupt_handle());
        self.shared.set_user(&account.user);
        self.shared.set_database(database);
        debug!(
            processor = %self.shared.name(),
            user = %account.user,
            database,
            "authenticated"
        );

        self.conn = Some(conn);
        self.user = Some(account);
        self.database = database.to_string();
        self.out.push(&Packet::ok(0, ""));
        self.flush().await?;
        Ok(())
    }

    async fn command_loop(&mut self) -> Result<(), ServerError> {
        loop {
            if self.shared.is_stopped() {
                return Ok(());
            }
            let (timeout, timeout_message) = if self.tx.is_some() {
                self.shared.set_state(StateTag::SleepInTx);
                (
                    self.core.config.sleep_in_tx_timeout(),
                    "Sleep in transaction timeout",
                )
            } else {
                self.shared.set_state(StateTag::Sleep);
                (self.core.config.sleep_timeout(), "Sleep timeout")
            };

            let (seq, payload) = match self.read_frame(timeout, timeout_message).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(ServerError::Timeout(message)) => {
                    self.out.start_response(0);
                    self.out.push(&Packet::error("FATAL", "53400", &message));
                    self.flush().await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            self.shared.set_state(StateTag::Read);
            let mut reader = PacketReader::new(payload);
            let code = reader.get_u8()?;
            self.out.start_response(seq);
            match code {
                command::COM_QUIT => return Ok(()),
                command::COM_PING => {
                    self.out.push(&Packet::ok(0, ""));
                }
                command::COM_QUERY => {
                    let sql = reader.rest_utf8()?;
                    self.handle_query(&sql).await?;
                }
                command::COM_STMT_PREPARE => {
                    let sql = reader.rest_utf8()?;
                    if let Err(e) = self.handle_prepare(&sql).await {
                        if !e.recoverable() {
                            return Err(e);
                        }
                        self.send_error(&e).await?;
                    }
                }
                command::COM_STMT_EXECUTE => {
                    if let Err(e) = self.handle_execute(&mut reader).await {
                        if !e.recoverable() {
                            return Err(e);
                        }
                        self.send_error(&e).await?;
                    }
                }
                command::COM_STMT_CLOSE => {
                    let stmt_id = reader.get_u32()?;
                    self.prepared.remove(&stmt_id);
                    self.out.push(&Packet::ok(0, ""));
                }
                other => {
                    let e = ServerError::Protocol(format!("unknown command 0x{other:02x}"));
                    self.send_error(&e).await?;
                    return Err(e);
                }
            }
            self.flush().await?;
        }
    }

    /// Splits the query text and executes each statement in order. A
    /// recoverable failure is reported and the remaining statements in
    /// the same frame proceed; a parse error drops the failed tail.
    async fn handle_query(&mut self, sql: &str) -> Result<(), ServerError> {
        let before = self.out.pushed();
        let mut parser = SqlParser::new(sql);
        loop {
            let item = match parser.next() {
                Some(item) => item,
                None => break,
            };
            match item {
                Err(e) => {
                    self.send_error(&ServerError::Parse(e)).await?;
                    break;
                }
                Ok(stmt) => match self.execute_statement(&stmt, false, &[]).await {
                    Ok(()) => {
                        let _ = parser.remove();
                    }
                    Err(e) if e.recoverable() => {
                        self.send_error(&e).await?;
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        // A frame with no statements at all still gets a response.
        if self.out.pushed() == before {
            self.out.push(&Packet::ok(0, ""));
        }
        Ok(())
    }

    async fn handle_prepare(&mut self, sql: &str) -> Result<(), ServerError> {
        let mut parser = SqlParser::new(sql);
        let statement = match parser.next() {
            Some(item) => item?,
            None => return Err(ServerError::Parse(crate::parser::ParseError::new(
                0,
                "empty prepare",
            ))),
        };
        if parser.next().is_some() {
            return Err(ServerError::Protocol(
                "prepared text must contain a single statement".to_string(),
            ));
        }
        if statement.is_meta() || statement.is_local() {
            return Err(ServerError::Internal(format!(
                "{} is not supported in the prepared protocol",
                statement.command()
            )));
        }
        self.check_permission(&statement)?;

        let (columns, params) = {
            let conn = self.connection()?;
            let engine_stmt = conn.prepare(&statement.executable_sql())?;
            (
                engine_stmt.column_count() as u16,
                engine_stmt.parameter_count() as u16,
            )
        };
        let stmt_id = self.next_stmt_id;
        self.next_stmt_id += 1;
        self.prepared.insert(stmt_id, Prepared { statement });
        self.out.push(&Packet::prepare_ok(stmt_id, columns, params));
        Ok(())
    }

    async fn handle_execute(&mut self, reader: &mut PacketReader) -> Result<(), ServerError> {
        let stmt_id = reader.get_u32()?;
        let count = reader.get_u16()? as usize;
        let mut params = Vec::with_capacity(count);
        for _ in 0..count {
            let null = reader.get_u8()? == 1;
            if null {
                params.push(None);
            } else {
                params.push(Some(reader.get_utf8s()?));
            }
        }
        let statement = self
            .prepared
            .get(&stmt_id)
            .map(|p| p.statement.clone())
            .ok_or_else(|| {
                ServerError::Internal(format!("unknown prepared statement {stmt_id}"))
            })?;
        self.execute_statement(&statement, true, &params).await
    }

    async fn execute_statement(
        &mut self,
        stmt: &Statement,
        prepared: bool,
        params: &[Option<String>],
    ) -> Result<(), ServerError> {
        if stmt.is_empty() {
            self.out.push(&Packet::ok(0, ""));
            return Ok(());
        }
        trace!(processor = %self.shared.name(), sql = stmt.sql(), "execute");
        self.shared.set_sql(Some(stmt.sql()));
        self.worker.metric.record(stmt.command());
        let long_query = self.core.config.long_query_ms;
        let started = Instant::now();

        let result = self.execute_inner(stmt, prepared, params).await;

        if long_query > 0 && started.elapsed() >= Duration::from_millis(long_query) {
            self.worker.metric.record_slow();
        }
        self.shared.set_sql(None);
        result
    }

    async fn execute_inner(
        &mut self,
        stmt: &Statement,
        prepared: bool,
        params: &[Option<String>],
    ) -> Result<(), ServerError> {
        if stmt.is_local() {
            return self.execute_local(stmt).await;
        }
        if let Some(tx_kind) = stmt.tx_kind() {
            let tx_kind = tx_kind.clone();
            return self.execute_tx(stmt, &tx_kind).await;
        }

        self.check_permission(stmt)?;
        self.check_read_only(stmt)?;
        let writable = !stmt.is_query() && !self.in_read_only_tx();

        if writable && !self.core.write_lock.holds(self.shared.id()) {
            self.acquire_write_lock().await?;
        }

        if let StatementKind::Select {
            sleep_seconds: Some(n),
            ..
        } = stmt.kind()
        {
            self.sleep_statement(*n).await?;
        }

        // Prepared writing statements in auto-commit run inside an
        // implicit transaction for ACID.
        if prepared && writable && self.tx.is_none() {
            self.run_batch("begin immediate").await?;
            self.tx = Some(Transaction::implicit());
            trace!(processor = %self.shared.name(), "begin implicit transaction");
        }

        let result = if stmt.is_meta() {
            self.execute_meta(stmt).await
        } else {
            self.execute_engine(stmt, params).await
        };

        if let Some(tx) = self.tx.as_mut() {
            tx.set_first_command(stmt.command());
        }
        let completion = self.complete(result.is_ok()).await;
        result.and(completion)
    }

    /// Post-statement bookkeeping: implicit commit/rollback and, back in
    /// auto-commit, write-lock release and meta detach.
    async fn complete(&mut self, success: bool) -> Result<(), ServerError> {
        if self.tx.as_ref().is_some_and(|tx| tx.is_implicit()) {
            self.tx = None;
            if success {
                if let Err(e) = self.run_batch("commit").await {
                    warn!(processor = %self.shared.name(), error = %e, "implicit commit failed");
                    if let Err(rb) = self.run_batch("rollback").await {
                        return Err(ServerError::Fatal(format!(
                            "implicit rollback failed: {rb}"
                        )));
                    }
                    self.finish_autocommit();
                    return Err(ServerError::ImplicitCommit(e.to_string()));
                }
                trace!(processor = %self.shared.name(), "commit implicit transaction");
            } else if let Err(rb) = self.run_batch("rollback").await {
                return Err(ServerError::Fatal(format!("implicit rollback failed: {rb}")));
            }
        }
        if self.tx.is_none() {
            self.finish_autocommit();
        }
        Ok(())
    }

    /// Transaction completion: release the write lock and detach the
    /// meta schema. Unlocking wakes every busy parker.
    fn finish_autocommit(&mut self) {
        self.core.write_lock.unlock(self.shared.id());
        if let (Some(conn), Some(alias)) = (&self.conn, &self.meta_alias) {
            if let Err(e) = self.core.meta.detach_from(conn, alias) {
                warn!(processor = %self.shared.name(), error = %e, "meta detach failed");
            }
        }
        self.meta_alias = None;
    }

    async fn execute_tx(&mut self, stmt: &Statement, kind: &TxKind) -> Result<(), ServerError> {
        match kind {
            TxKind::Begin { mode, .. } => {
                let mut opened = false;
                if self.tx.is_none() {
                    let mut mode = *mode;
                    if mode.read_only.is_none() {
                        mode.read_only = self.next_tx_read_only.take();
                    }
                    self.tx = Some(Transaction::new(mode));
                    self.savepoints.clear();
                    self.savepoints.push_begin();
                    opened = true;
                }
                self.run_tx_open(stmt, opened).await
            }
            TxKind::Savepoint { name } => {
                let mut opened = false;
                if self.tx.is_none() {
                    self.tx = Some(Transaction::new(Default::default()));
                    self.savepoints.clear();
                    self.savepoints.push_savepoint(name);
                    opened = true;
                }
                let result = self.run_tx_open(stmt, opened).await;
                if result.is_ok() && !opened {
                    self.savepoints.push_savepoint(name);
                }
                result
            }
            TxKind::Commit | TxKind::End | TxKind::Rollback { savepoint: None } => {
                self.run_batch(&stmt.executable_sql()).await?;
                self.tx = None;
                self.savepoints.clear();
                self.finish_autocommit();
                trace!(processor = %self.shared.name(), "transaction finished");
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
            TxKind::Rollback {
                savepoint: Some(_),
            } => {
                // Rollback to a savepoint keeps the transaction open and
                // the stack untouched.
                self.run_batch(&stmt.executable_sql()).await?;
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
            TxKind::Release { name } => {
                self.run_batch(&stmt.executable_sql()).await?;
                if self.savepoints.release(name) {
                    self.tx = None;
                    self.finish_autocommit();
                    trace!(processor = %self.shared.name(), "transaction finished");
                }
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
        }
    }

    /// Shared open path for BEGIN and a transaction-opening SAVEPOINT:
    /// the new transaction state decides writability before the lock is
    /// taken, so `BEGIN READ ONLY` never contends.
    async fn run_tx_open(&mut self, stmt: &Statement, opened: bool) -> Result<(), ServerError> {
        let writable = !self.in_read_only_tx();
        let result = async {
            if writable && !self.core.write_lock.holds(self.shared.id()) {
                self.acquire_write_lock().await?;
            }
            self.run_batch(&stmt.executable_sql()).await
        }
        .await;
        match result {
            Ok(()) => {
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
            Err(e) => {
                if opened {
                    self.tx = None;
                    self.savepoints.clear();
                    self.finish_autocommit();
                }
                Err(e)
            }
        }
    }

    async fn execute_local(&mut self, stmt: &Statement) -> Result<(), ServerError> {
        match stmt.kind() {
            StatementKind::SetTransaction {
                session_scope,
                mode,
            } => {
                if *session_scope {
                    if let Some(read_only) = mode.read_only {
                        self.session_read_only = read_only;
                    }
                } else if let Some(tx) = self.tx.as_mut() {
                    if let Some(read_only) = mode.read_only {
                        tx.set_read_only(read_only);
                    }
                } else {
                    self.next_tx_read_only = mode.read_only;
                }
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
            StatementKind::Kill {
                query_only,
                processor_id,
            } => {
                let user = self.current_user()?.clone();
                let target = self.core.find_processor(*processor_id).ok_or_else(|| {
                    ServerError::Internal(format!("Unknown processor id {processor_id}"))
                })?;
                if !user.is_sa() && target.user().as_deref() != Some(user.user.as_str()) {
                    return Err(ServerError::PermissionDenied(
                        "only a superuser may kill other users' connections".to_string(),
                    ));
                }
                debug!(pid = processor_id, query_only, "kill");
                target.cancel(*query_only);
                self.out.push(&Packet::ok(0, ""));
                Ok(())
            }
            StatementKind::Show(Show::Processlist { full }) => {
                let viewer = self.current_user()?.clone();
                let states = self.core.processor_states(&viewer);
                let columns = ["Id", "User", "Host", "db", "Command", "Time", "State", "Info"];
                let rows: Vec<Vec<Option<String>>> = states
                    .into_iter()
                    .map(|s| {
                        let info = s.sql.map(|sql| {
                            if *full || sql.chars().count() <= 100 {
                                sql
                            } else {
                                sql.chars().take(100).collect()
                            }
                        });
                        vec![
                            Some(s.id.to_string()),
                            s.user,
                            Some(s.host),
                            Some(s.database),
                            Some(s.state.text().to_string()),
                            Some(s.state_seconds.to_string()),
                            Some(s.state.text().to_string()),
                            info,
                        ]
                    })
                    .collect();
                self.send_rows(&columns, rows).await
            }
            StatementKind::Show(Show::Status) => {
                let [selects, inserts, updates, deletes, total, slow] =
                    self.core.metric_totals();
                let rows: Vec<Vec<Option<String>>> = [
                    ("server_version", SERVER_VERSION.to_string()),
                    ("uptime_seconds", self.core.uptime_seconds().to_string()),
                    ("threads", self.core.config.worker_count.to_string()),
                    ("connections", self.core.connection_count().to_string()),
                    ("select_stmts", selects.to_string()),
                    ("insert_stmts", inserts.to_string()),
                    ("update_stmts", updates.to_string()),
                    ("delete_stmts", deletes.to_string()),
                    ("total_stmts", total.to_string()),
                    ("slow_stmts", slow.to_string()),
                ]
                .into_iter()
                .map(|(name, value)| vec![Some(name.to_string()), Some(value)])
                .collect();
                self.send_rows(&["Variable_name", "Value"], rows).await
            }
            _ => Err(ServerError::Internal(format!(
                "{} is not a local statement",
                stmt.command()
            ))),
        }
    }

    async fn execute_meta(&mut self, stmt: &Statement) -> Result<(), ServerError> {
        match stmt.kind() {
            StatementKind::CreateDatabase { .. } => {
                if !self.create_db_file(stmt)? {
                    self.out.push(&Packet::ok(0, ""));
                    return Ok(());
                }
            }
            StatementKind::DropDatabase { db, quiet } => {
                if !self.delete_db_files(db, *quiet)? {
                    self.out.push(&Packet::ok(0, ""));
                    return Ok(());
                }
            }
            _ => {}
        }

        let alias = self.attach_meta()?;
        let resolved = self.resolve_meta_statement(stmt)?;
        let sql = meta_sql(&resolved, &alias)?;
        let outcome = self.run_query(&sql, &[]).await?;
        match outcome {
            EngineOutcome::Affected(n) => self.out.push(&Packet::ok(n, "")),
            EngineOutcome::Rows(_) => {}
        }
        if matches!(
            stmt.kind(),
            StatementKind::CreateUser(_)
                | StatementKind::AlterUser(_)
                | StatementKind::DropUser { .. }
        ) {
            self.core.meta.flush_hosts();
        }
        Ok(())
    }

    /// Creates the database file for CREATE DATABASE. Returns false when
    /// the statement completes without touching the registry: an `IF NOT
    /// EXISTS` against an existing catalog row, or the recoverable state
    /// where the file exists but no catalog row does.
    fn create_db_file(&self, stmt: &Statement) -> Result<bool, ServerError> {
        let StatementKind::CreateDatabase { db, dir, quiet } = stmt.kind() else {
            return Err(ServerError::Internal("not a CREATE DATABASE".to_string()));
        };
        if self.core.meta.select_catalog(db)?.is_some() {
            if *quiet {
                return Ok(false);
            }
            return Err(ServerError::UniqueViolation(format!(
                "Database '{db}' already exists"
            )));
        }
        let file = self.core.meta.db_file(db, dir.as_deref());
        let occupied = file.is_file() && file.metadata().map(|m| m.len() > 0).unwrap_or(true);
        if occupied {
            if *quiet {
                warn!(
                    db = %db,
                    file = %file.display(),
                    "database file exists without a catalog row, skipping create"
                );
                return Ok(false);
            }
            return Err(ServerError::UniqueViolation(
                "Database file already exists".to_string(),
            ));
        }
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ServerError::File(format!("Can't create data directory: {e}")))?;
        }
        if !file.exists() {
            std::fs::File::create(&file)
                .map_err(|e| ServerError::File(format!("Can't create database file: {e}")))?;
        }
        Ok(true)
    }

    /// Deletes the database file and its WAL/SHM/journal siblings for
    /// DROP DATABASE. Returns false when a quiet drop has nothing to do.
    fn delete_db_files(&self, db: &str, quiet: bool) -> Result<bool, ServerError> {
        let Some(catalog) = self.core.meta.select_catalog(db)? else {
            if quiet {
                return Ok(false);
            }
            return Err(ServerError::Internal(format!(
                "Database catalog of '{db}' not exists"
            )));
        };
        if db.eq_ignore_ascii_case(&self.database) {
            return Err(ServerError::File(format!(
                "Can't delete current database file of '{db}'"
            )));
        }
        let file = self.core.meta.db_file(db, catalog.dir.as_deref());
        if file.is_file() {
            std::fs::remove_file(&file)
                .map_err(|e| ServerError::File(format!("Can't delete database file: {e}")))?;
        } else if !quiet {
            return Err(ServerError::Internal(format!(
                "Database file of '{}' not exists",
                file.display()
            )));
        }
        for ext in ["-wal", "-shm", "-journal"] {
            let mut sibling = file.clone().into_os_string();
            sibling.push(ext);
            let sibling = std::path::PathBuf::from(sibling);
            if sibling.is_file() {
                std::fs::remove_file(&sibling).map_err(|e| {
                    ServerError::File(format!("Can't delete database log file: {e}"))
                })?;
            }
        }
        Ok(true)
    }

    /// Pre-renders statement adjustments that need session state: stored
    /// password derivation and CURRENT_USER resolution.
    fn resolve_meta_statement(&self, stmt: &Statement) -> Result<Statement, ServerError> {
        let kind = match stmt.kind() {
            StatementKind::CreateUser(cu) if cu.password.is_some() => {
                let method = AuthMethod::parse(&cu.protocol, &cu.auth_method)
                    .map_err(|e| ServerError::Internal(e.to_string()))?;
                let mut cu = cu.clone();
                cu.password = method
                    .gen_store_password(&cu.user, cu.password.as_deref().unwrap_or_default());
                StatementKind::CreateUser(cu)
            }
            StatementKind::AlterUser(au) if au.password.is_some() => {
                let method_name = match &au.auth_method {
                    Some(m) => m.clone(),
                    None => self
                        .core
                        .meta
                        .select_user_exact(&au.host, &au.user, &au.protocol)?
                        .map(|u| u.auth_method)
                        .unwrap_or_else(|| crate::parser::DEFAULT_AUTH_METHOD.to_string()),
                };
                let method = AuthMethod::parse(&au.protocol, &method_name)
                    .map_err(|e| ServerError::Internal(e.to_string()))?;
                let mut au = au.clone();
                au.password = method
                    .gen_store_password(&au.user, au.password.as_deref().unwrap_or_default());
                StatementKind::AlterUser(au)
            }
            StatementKind::Show(Show::Grants {
                current_user: true, ..
            }) => {
                let user = self.current_user()?;
                StatementKind::Show(Show::Grants {
                    host: user.host.clone(),
                    user: Some(user.user.clone()),
                    current_user: false,
                })
            }
            _ => return Ok(stmt.clone()),
        };
        Ok(Statement::new(
            stmt.sql().to_string(),
            stmt.command().to_string(),
            false,
            kind,
        ))
    }

    async fn execute_engine(
        &mut self,
        stmt: &Statement,
        params: &[Option<String>],
    ) -> Result<(), ServerError> {
        let sql = stmt.executable_sql();
        match self.run_query(&sql, params).await? {
            EngineOutcome::Affected(n) => {
                self.out.push(&Packet::ok(n, ""));
                Ok(())
            }
            EngineOutcome::Rows(_) => Ok(()),
        }
    }

    /// Runs one engine statement with busy re-parking. A busy error
    /// re-parks only while nothing has been streamed yet.
    async fn run_query(
        &mut self,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<EngineOutcome, ServerError> {
        let busy_timeout_ms = self.core.config.busy_timeout_ms;
        let min_wait = self.core.config.busy_min_wait();
        let mut busy_ctx: Option<Arc<BusyContext>> = None;
        let result = loop {
            let before = self.out.pushed();
            let attempt = {
                let Processor {
                    conn, out, stream, ..
                } = self;
                let conn = conn
                    .as_ref()
                    .ok_or_else(|| ServerError::Internal("no engine connection".to_string()))?;
                Self::try_query(conn, out, stream, sql, params).await
            };
            match attempt {
                Err(ServerError::Busy(message))
                    if busy_timeout_ms > 0 && self.out.pushed() == before =>
                {
                    let ctx = match &busy_ctx {
                        Some(ctx) => Arc::clone(ctx),
                        None => {
                            let ctx = Arc::new(BusyContext::busy(
                                self.core.config.busy_deadline(),
                                false,
                            ));
                            self.shared.enter_busy(Arc::clone(&ctx));
                            busy_ctx = Some(Arc::clone(&ctx));
                            ctx
                        }
                    };
                    if ctx.is_canceled() {
                        break Err(ServerError::Canceled);
                    }
                    if ctx.is_timeout() {
                        break Err(ServerError::Busy(message));
                    }
                    tokio::select! {
                        _ = ctx.canceled() => {}
                        _ = deadline_wait(ctx.deadline()) => {}
                        _ = tokio::time::sleep(min_wait) => {}
                    }
                }
                other => break other,
            }
        };
        if busy_ctx.is_some() {
            self.shared.leave_busy();
            self.shared.set_state(StateTag::Read);
        }
        result
    }

    async fn try_query(
        conn: &Connection,
        out: &mut WriteQueue,
        stream: &mut TcpStream,
        sql: &str,
        params: &[Option<String>],
    ) -> Result<EngineOutcome, ServerError> {
        let mut engine_stmt = conn.prepare(sql)?;
        let columns = engine_stmt.column_count();
        if columns == 0 {
            let affected = engine_stmt.execute(rusqlite::params_from_iter(params.iter()))?;
            return Ok(EngineOutcome::Affected(affected as u64));
        }

        let names: Vec<String> = engine_stmt
            .column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        out.push(&Packet::result_header(columns as u64));
        for name in &names {
            out.push(&Packet::column(name));
        }
        out.push(&Packet::eof());

        let mut rows = engine_stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut count = 0u64;
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(columns);
            for i in 0..columns {
                values.push(value_text(row.get_ref(i)?));
            }
            out.push(&Packet::data_row(&values));
            if out.should_flush() {
                out.flush(stream).await?;
            }
            count += 1;
        }
        out.push(&Packet::eof());
        Ok(EngineOutcome::Rows(count))
    }

    /// Engine side-effect statement (begin/commit/rollback/savepoint)
    /// with busy re-parking.
    async fn run_batch(&mut self, sql: &str) -> Result<(), ServerError> {
        let busy_timeout_ms = self.core.config.busy_timeout_ms;
        let min_wait = self.core.config.busy_min_wait();
        let mut busy_ctx: Option<Arc<BusyContext>> = None;
        let result = loop {
            let attempt = self
                .connection()?
                .execute_batch(sql)
                .map_err(ServerError::from);
            match attempt {
                Err(ServerError::Busy(message)) if busy_timeout_ms > 0 => {
                    let ctx = match &busy_ctx {
                        Some(ctx) => Arc::clone(ctx),
                        None => {
                            let ctx = Arc::new(BusyContext::busy(
                                self.core.config.busy_deadline(),
                                false,
                            ));
                            self.shared.enter_busy(Arc::clone(&ctx));
                            busy_ctx = Some(Arc::clone(&ctx));
                            ctx
                        }
                    };
                    if ctx.is_canceled() {
                        break Err(ServerError::Canceled);
                    }
                    if ctx.is_timeout() {
                        break Err(ServerError::Busy(message));
                    }
                    tokio::select! {
                        _ = ctx.canceled() => {}
                        _ = deadline_wait(ctx.deadline()) => {}
                        _ = tokio::time::sleep(min_wait) => {}
                    }
                }
                other => break other,
            }
        };
        if busy_ctx.is_some() {
            self.shared.leave_busy();
            self.shared.set_state(StateTag::Read);
        }
        result
    }

    /// Acquires the process-wide write lock, parking on contention until
    /// a lock release, the busy deadline, or cancellation.
    async fn acquire_write_lock(&mut self) -> Result<(), ServerError> {
        let id = self.shared.id();
        if self.core.write_lock.try_lock(id) {
            return Ok(());
        }
        if self.core.config.busy_timeout_ms == 0 {
            return Err(ServerError::Busy("database write lock is held".to_string()));
        }
        trace!(processor = %self.shared.name(), "parked on write lock");
        let ctx = Arc::new(BusyContext::busy(self.core.config.busy_deadline(), true));
        self.shared.enter_busy(Arc::clone(&ctx));
        let min_wait = self.core.config.busy_min_wait();
        let result = loop {
            if self.core.write_lock.try_lock(id) {
                break Ok(());
            }
            if ctx.is_canceled() {
                break Err(ServerError::Canceled);
            }
            if ctx.is_timeout() {
                break Err(ServerError::Busy("write lock wait timed out".to_string()));
            }
            tokio::select! {
                _ = ctx.canceled() => {}
                _ = deadline_wait(ctx.deadline()) => {}
                _ = self.core.write_lock.released() => {}
                _ = tokio::time::sleep(min_wait) => {}
            }
        };
        self.shared.leave_busy();
        self.shared.set_state(StateTag::Read);
        if result.is_ok() {
            trace!(processor = %self.shared.name(), "write lock acquired");
        }
        result
    }

    /// The recognized `SELECT [expr,] SLEEP(n)` form parks the processor
    /// as sleepable and cancelable before the row is produced.
    async fn sleep_statement(&mut self, seconds: u64) -> Result<(), ServerError> {
        let ctx = Arc::new(BusyContext::sleep(Duration::from_secs(seconds)));
        self.shared.enter_busy(Arc::clone(&ctx));
        let result = tokio::select! {
            _ = ctx.canceled() => Err(ServerError::Canceled),
            _ = deadline_wait(ctx.deadline()) => Ok(()),
        };
        self.shared.leave_busy();
        self.shared.set_state(StateTag::Read);
        result
    }

    fn check_permission(&self, stmt: &Statement) -> Result<(), ServerError> {
        let user = self.current_user()?;
        if user.is_sa() {
            return Ok(());
        }
        if stmt.needs_sa() {
            return Err(ServerError::PermissionDenied(format!(
                "superuser required for {}",
                stmt.command()
            )));
        }
        let host = self.shared.host().to_string();
        match stmt.kind() {
            StatementKind::Attach { db_name, .. } => {
                let target = std::path::Path::new(db_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| db_name.clone());
                if self.core.meta.has_db_access(&host, &user.user, &target)? {
                    Ok(())
                } else {
                    Err(ServerError::PermissionDenied(format!(
                        "no access to database '{target}'"
                    )))
                }
            }
            _ => {
                if self
                    .core
                    .meta
                    .has_db_access(&host, &user.user, &self.database)?
                {
                    Ok(())
                } else {
                    Err(ServerError::PermissionDenied(format!(
                        "no access to database '{}'",
                        self.database
                    )))
                }
            }
        }
    }

    fn check_read_only(&self, stmt: &Statement) -> Result<(), ServerError> {
        if self.in_read_only_tx() && !stmt.is_query() && !stmt.is_transaction() {
            return Err(ServerError::ReadOnlyViolation);
        }
        Ok(())
    }

    fn in_read_only_tx(&self) -> bool {
        match &self.tx {
            Some(tx) => tx.is_read_only(self.session_read_only),
            None => self.session_read_only,
        }
    }

    fn attach_meta(&mut self) -> Result<String, ServerError> {
        if let Some(alias) = &self.meta_alias {
            return Ok(alias.clone());
        }
        let conn = self.connection()?;
        let alias = self.core.meta.attach_to(conn)?;
        trace!(processor = %self.shared.name(), alias, "meta attached");
        self.meta_alias = Some(alias.clone());
        Ok(alias)
    }

    fn connection(&self) -> Result<&Connection, ServerError> {
        self.conn
            .as_ref()
            .ok_or_else(|| ServerError::Internal("no engine connection".to_string()))
    }

    fn current_user(&self) -> Result<&User, ServerError> {
        self.user
            .as_ref()
            .ok_or_else(|| ServerError::Internal("not authenticated".to_string()))
    }

    async fn send_rows(
        &mut self,
        columns: &[&str],
        rows: Vec<Vec<Option<String>>>,
    ) -> Result<(), ServerError> {
        self.out.push(&Packet::result_header(columns.len() as u64));
        for name in columns {
            self.out.push(&Packet::column(name));
        }
        self.out.push(&Packet::eof());
        for row in rows {
            self.out.push(&Packet::data_row(&row));
            if self.out.should_flush() {
                let Processor { out, stream, .. } = self;
                out.flush(stream).await?;
            }
        }
        self.out.push(&Packet::eof());
        Ok(())
    }

    async fn send_error(&mut self, e: &ServerError) -> Result<(), ServerError> {
        let severity = match e {
            ServerError::ImplicitCommit(_) => "WARNING",
            _ if e.recoverable() => "ERROR",
            _ => "FATAL",
        };
        self.send_error_packet(severity, e.sqlstate(), &e.to_string())
            .await
    }

    async fn send_error_packet(
        &mut self,
        severity: &str,
        sqlstate: &str,
        message: &str,
    ) -> Result<(), ServerError> {
        self.out.push(&Packet::error(severity, sqlstate, message));
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), ServerError> {
        let Processor { out, stream, .. } = self;
        out.flush(stream).await
    }

    /// Reads one frame, observing the per-state timeout and stop
    /// requests. Returns `None` at end of stream or when stopped.
    async fn read_frame(
        &mut self,
        timeout: Option<Duration>,
        timeout_message: &str,
    ) -> Result<Option<(u8, Bytes)>, ServerError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = parse_frame(&mut self.read_buf) {
                self.shrink_read_buf();
                return Ok(Some(frame));
            }
            self.grow_read_buf();
            let Processor {
                stream,
                read_buf,
                shared,
                ..
            } = self;
            let n = tokio::select! {
                r = stream.read_buf(read_buf) => r?,
                _ = shared.stopped() => return Ok(None),
                _ = deadline_wait(deadline) => {
                    return Err(ServerError::Timeout(timeout_message.to_string()));
                }
            };
            if n == 0 {
                return Ok(None);
            }
        }
    }

    /// Geometric growth from `init_read_buffer`; the implicit cap is the
    /// frame length field.
    fn grow_read_buf(&mut self) {
        let init = self.core.config.processor_init_read_buffer;
        let free = self.read_buf.capacity().saturating_sub(self.read_buf.len());
        if free < 64 {
            let additional = self.read_buf.capacity().max(init);
            self.read_buf.reserve(additional);
        }
    }

    /// Shrinks an oversized, fully drained read buffer back to its
    /// initial size.
    fn shrink_read_buf(&mut self) {
        let config = &self.core.config;
        if self.read_buf.is_empty()
            && self.read_buf.capacity() > config.processor_max_read_buffer
        {
            self.read_buf = BytesMut::with_capacity(config.processor_init_read_buffer);
        }
    }

    /// Ordered teardown: drain writes, release the write lock, detach
    /// schemas, close the engine connection, shut the channel down.
    async fn close(&mut self) {
        self.shared.set_state(StateTag::Stopped);
        let _ = self.flush().await;
        self.core.write_lock.unlock(self.shared.id());
        if let (Some(conn), Some(alias)) = (&self.conn, &self.meta_alias) {
            let _ = self.core.meta.detach_from(conn, alias);
        }
        self.meta_alias = None;
        self.prepared.clear();
        self.conn = None;
        let _ = self.stream.shutdown().await;
        self.shared.set_state(StateTag::Closed);
    }
}

async fn deadline_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn value_text(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(t) => Some(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Some(String::from_utf8_lossy(b).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_queue_merges_small_frames() {
        let mut out = WriteQueue::new(4096, 1024, 1024);
        out.start_response(0);
        out.push(&Packet::ok(0, ""));
        out.push(&Packet::eof());
        // Both frames fit one merge buffer.
        assert_eq!(out.queue.len(), 1);
        assert_eq!(out.pushed(), 2);
    }

    #[test]
    fn test_write_queue_splits_large_frames() {
        let mut out = WriteQueue::new(64, 1024, 1024);
        out.start_response(0);
        let big = vec![0u8; 80];
        out.push(&big);
        out.push(&big);
        assert_eq!(out.queue.len(), 2);
    }

    #[test]
    fn test_write_queue_sequence_numbers() {
        let mut out = WriteQueue::new(8, 1024, 1024);
        out.start_response(3);
        out.push(&[1, 2, 3]);
        out.push(&[4]);
        assert_eq!(out.queue[0][3], 4);
        assert_eq!(out.queue[1][3], 5);
    }

    #[test]
    fn test_should_flush_on_queue_bound() {
        let mut out = WriteQueue::new(8, 2, 1024);
        out.start_response(0);
        out.push(&[0u8; 16]);
        assert!(out.should_flush());
        let mut out = WriteQueue::new(1024, 2, 1024);
        out.start_response(0);
        out.push(&[0u8; 1500]);
        out.push(&[0u8; 1500]);
        assert!(out.should_flush());
    }

    #[test]
    fn test_value_text() {
        assert_eq!(value_text(ValueRef::Null), None);
        assert_eq!(value_text(ValueRef::Integer(7)), Some("7".to_string()));
        assert_eq!(
            value_text(ValueRef::Text(b"abc")),
            Some("abc".to_string())
        );
    }
}
