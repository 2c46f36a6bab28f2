//! End-to-end server tests: handshake, authentication, query round
//! trips, write-lock contention and cancellation, against a real server
//! on an ephemeral port with a throwaway data directory.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

use rsqlited::network::auth::AuthMethod;
use rsqlited::network::protocol::{
    self, command, read_frame, status, write_frame, HandshakeInit, LoginRequest, Packet,
    PacketReader,
};
use rsqlited::{MetaDb, Server, ServerConfig};

const PASSWORD: &str = "secret";

struct TestServer {
    _dir: tempfile::TempDir,
    _server: Arc<Server>,
    addr: std::net::SocketAddr,
}

async fn start_server(tune: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    MetaDb::init(dir.path(), "root", PASSWORD).unwrap();

    let mut config = ServerConfig {
        data_dir: dir.path().to_string_lossy().to_string(),
        port: 0,
        worker_count: 2,
        ..ServerConfig::default()
    };
    tune(&mut config);

    let server = Arc::new(Server::new(config).unwrap());
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = serve.serve(listener).await;
    });
    TestServer {
        _dir: dir,
        _server: server,
        addr,
    }
}

#[derive(Debug)]
enum QueryResult {
    Affected(u64),
    Rows(Vec<Vec<Option<String>>>),
}

#[derive(Debug)]
struct QueryError {
    sqlstate: String,
    message: String,
}

#[derive(Debug)]
struct TestClient {
    stream: TcpStream,
    session_id: u32,
}

impl TestClient {
    async fn connect(
        addr: std::net::SocketAddr,
        database: &str,
        user: &str,
        password: &str,
    ) -> Result<TestClient, QueryError> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let (_, payload) = read_frame(&mut stream).await.unwrap();
        let handshake = HandshakeInit::decode(payload).unwrap();
        assert_eq!(handshake.protocol_version, protocol::PROTOCOL_VERSION);

        let method = AuthMethod::Md5;
        let stored = method.gen_store_password(user, password).unwrap();
        let sign = method.sign(&stored, &handshake.seed);
        let login = LoginRequest::encode_login(database, user, &sign);
        write_frame(&mut stream, 1, &login).await.unwrap();

        let (_, payload) = read_frame(&mut stream).await.unwrap();
        let mut reader = PacketReader::new(payload);
        match reader.get_u8().unwrap() {
            status::OK => Ok(TestClient {
                stream,
                session_id: handshake.session_id,
            }),
            status::ERROR => Err(read_error(&mut reader)),
            other => panic!("unexpected login response 0x{other:02x}"),
        }
    }

    /// Sends an out-of-band cancel request for another session.
    async fn cancel(addr: std::net::SocketAddr, session_id: u32, query_only: bool) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = read_frame(&mut stream).await.unwrap();
        let payload = LoginRequest::encode_cancel(session_id, query_only);
        write_frame(&mut stream, 1, &payload).await.unwrap();
    }

    async fn query(&mut self, sql: &str) -> Result<QueryResult, QueryError> {
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(command::COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        write_frame(&mut self.stream, 0, &payload).await.unwrap();
        self.read_result().await
    }

    /// Prepares a statement, returning its id.
    async fn prepare(&mut self, sql: &str) -> Result<u32, QueryError> {
        let mut payload = Vec::with_capacity(1 + sql.len());
        payload.push(command::COM_STMT_PREPARE);
        payload.extend_from_slice(sql.as_bytes());
        write_frame(&mut self.stream, 0, &payload).await.unwrap();
        let (_, payload) = read_frame(&mut self.stream).await.unwrap();
        let mut reader = PacketReader::new(payload);
        match reader.get_u8().unwrap() {
            status::OK => Ok(reader.get_u32().unwrap()),
            status::ERROR => Err(read_error(&mut reader)),
            other => panic!("unexpected prepare response 0x{other:02x}"),
        }
    }

    async fn execute(
        &mut self,
        stmt_id: u32,
        params: &[Option<&str>],
    ) -> Result<QueryResult, QueryError> {
        let mut p = Packet::new();
        p.put_u8(command::COM_STMT_EXECUTE)
            .put_u32(stmt_id)
            .put_u16(params.len() as u16);
        for param in params {
            match param {
                Some(value) => {
                    p.put_u8(0);
                    p.put_utf8s(value);
                }
                None => {
                    p.put_u8(1);
                }
            }
        }
        write_frame(&mut self.stream, 0, &p.into_payload())
            .await
            .unwrap();
        self.read_result().await
    }

    async fn read_result(&mut self) -> Result<QueryResult, QueryError> {
        let (_, payload) = read_frame(&mut self.stream).await.unwrap();
        let mut reader = PacketReader::new(payload);
        match reader.get_u8().unwrap() {
            status::OK => Ok(QueryResult::Affected(reader.get_lenenc_int().unwrap())),
            status::ERROR => Err(read_error(&mut reader)),
            first => {
                // Result set: the first byte starts the column count.
                let columns = if first < 251 {
                    first as usize
                } else {
                    panic!("wide column counts not used in tests")
                };
                for _ in 0..columns {
                    read_frame(&mut self.stream).await.unwrap();
                }
                let (_, eof) = read_frame(&mut self.stream).await.unwrap();
                assert_eq!(eof[0], status::EOF);

                let mut rows = Vec::new();
                loop {
                    let (_, payload) = read_frame(&mut self.stream).await.unwrap();
                    if payload.len() == 1 && payload[0] == status::EOF {
                        break;
                    }
                    let mut reader = PacketReader::new(payload);
                    let mut row = Vec::with_capacity(columns);
                    for _ in 0..columns {
                        if reader.get_u8().unwrap() == 1 {
                            row.push(None);
                        } else {
                            row.push(Some(reader.get_utf8s().unwrap()));
                        }
                    }
                    rows.push(row);
                }
                Ok(QueryResult::Rows(rows))
            }
        }
    }
}

fn read_error(reader: &mut PacketReader) -> QueryError {
    let _severity = reader.get_utf8s().unwrap();
    let sqlstate = String::from_utf8(reader.get_bytes(5).unwrap().to_vec()).unwrap();
    let message = reader.get_utf8s().unwrap();
    QueryError { sqlstate, message }
}

fn single_value(result: QueryResult) -> String {
    match result {
        QueryResult::Rows(rows) => rows[0][0].clone().expect("non-null value"),
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auth_and_query_round_trip() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();

    assert_eq!(single_value(root.query("select 1 + 1").await.unwrap()), "2");
    assert_eq!(
        single_value(root.query("select current_user()").await.unwrap()),
        "root"
    );
    assert_eq!(
        single_value(root.query("select database()").await.unwrap()),
        "main"
    );

    root.query("create table t(a integer)").await.unwrap();
    match root.query("insert into t(a) values(1), (2)").await.unwrap() {
        QueryResult::Affected(n) => assert_eq!(n, 2),
        other => panic!("expected affected count, got {other:?}"),
    }
    assert_eq!(
        single_value(root.query("select count(*) from t").await.unwrap()),
        "2"
    );

    // INSERT ... RETURNING streams the produced rows.
    match root
        .query("insert into t(a) values(7) returning a")
        .await
        .unwrap()
    {
        QueryResult::Rows(rows) => assert_eq!(rows[0][0].as_deref(), Some("7")),
        other => panic!("expected returning rows, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bad_password_rejected() {
    let ts = start_server(|_| {}).await;
    let err = TestClient::connect(ts.addr, "main", "root", "wrong")
        .await
        .expect_err("bad password must fail");
    assert_eq!(err.sqlstate, "28000");
    assert!(err.message.contains("Access denied"), "{}", err.message);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_user_and_grant_lifecycle() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();

    root.query("create database appdb").await.unwrap();
    root.query("create user 'app'@'%' identified by 'app-pw'")
        .await
        .unwrap();

    // Not yet granted: login to appdb is denied.
    let err = TestClient::connect(ts.addr, "appdb", "app", "app-pw")
        .await
        .expect_err("ungranted login must fail");
    assert_eq!(err.sqlstate, "42501");

    root.query("grant all on database appdb to 'app'@'%'")
        .await
        .unwrap();
    let mut app = TestClient::connect(ts.addr, "appdb", "app", "app-pw")
        .await
        .unwrap();
    app.query("create table items(id integer)").await.unwrap();
    app.query("insert into items(id) values(1)").await.unwrap();

    // Plain users cannot run meta statements.
    let err = app
        .query("create database sneaky")
        .await
        .expect_err("non-sa create database must fail");
    assert_eq!(err.sqlstate, "42501");

    root.query("revoke all on database appdb from 'app'@'%'")
        .await
        .unwrap();
    let err = TestClient::connect(ts.addr, "appdb", "app", "app-pw")
        .await
        .expect_err("revoked login must fail");
    assert_eq!(err.sqlstate, "42501");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_parse_error_reports_and_connection_survives() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    let err = root
        .query("select 'unterminated")
        .await
        .expect_err("parse error expected");
    assert_eq!(err.sqlstate, "42601");
    assert_eq!(single_value(root.query("select 1").await.unwrap()), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_only_transaction_rejects_writes() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    root.query("create table t(a integer)").await.unwrap();
    root.query("begin read only").await.unwrap();
    let err = root
        .query("insert into t(a) values(1)")
        .await
        .expect_err("write in read-only tx must fail");
    assert_eq!(err.sqlstate, "25006");
    // Reads still work, and the transaction closes normally.
    assert_eq!(
        single_value(root.query("select count(*) from t").await.unwrap()),
        "0"
    );
    root.query("commit").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_parker_resumes_on_commit() {
    let ts = start_server(|_| {}).await;
    let mut a = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    a.query("create table t(a integer)").await.unwrap();
    a.query("insert into t(a) values(1)").await.unwrap();

    a.query("begin immediate").await.unwrap();
    a.query("update t set a = 10").await.unwrap();

    let mut b = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    let writer = tokio::spawn(async move {
        let result = b.query("update t set a = 20").await;
        (b, result)
    });

    // B parks on the write lock while A's transaction is open.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!writer.is_finished());
    a.query("commit").await.unwrap();

    let (mut b, result) = writer.await.unwrap();
    match result.unwrap() {
        QueryResult::Affected(n) => assert_eq!(n, 1),
        other => panic!("expected affected count, got {other:?}"),
    }
    assert_eq!(
        single_value(b.query("select a from t").await.unwrap()),
        "20"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_busy_surfaces_at_deadline() {
    let ts = start_server(|c| c.busy_timeout_ms = 500).await;
    let mut a = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    a.query("create table t(a integer)").await.unwrap();
    a.query("begin immediate").await.unwrap();

    let mut b = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    let started = Instant::now();
    let err = b
        .query("update t set a = 1")
        .await
        .expect_err("busy must surface after the timeout");
    let waited = started.elapsed();
    assert_eq!(err.sqlstate, "55P03");
    assert!(waited >= Duration::from_millis(400), "waited {waited:?}");
    assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    a.query("rollback").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_resumes_sleeping_query() {
    let ts = start_server(|_| {}).await;
    let a = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    let session_id = a.session_id;
    let addr = ts.addr;

    let sleeper = tokio::spawn(async move {
        let mut a = a;
        let result = a.query("select sleep(10)").await;
        (a, result)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    TestClient::cancel(addr, session_id, true).await;
    let (mut a, result) = sleeper.await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    let err = result.expect_err("canceled query must fail");
    assert_eq!(err.sqlstate, "57014");

    // The connection stays usable after a query-only cancel.
    assert_eq!(single_value(a.query("select 1").await.unwrap()), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kill_query_from_other_connection() {
    let ts = start_server(|_| {}).await;
    let a = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    let session_id = a.session_id;

    let sleeper = tokio::spawn(async move {
        let mut a = a;
        let result = a.query("select sleep(10)").await;
        (a, result)
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut b = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    b.query(&format!("kill query {session_id}")).await.unwrap();

    let (mut a, result) = sleeper.await.unwrap();
    let err = result.expect_err("killed query must fail");
    assert_eq!(err.sqlstate, "57014");
    assert_eq!(single_value(a.query("select 1").await.unwrap()), "1");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_show_statements_over_the_wire() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    root.query("create database showdb").await.unwrap();
    root.query("create table t(a integer)").await.unwrap();

    match root.query("show databases").await.unwrap() {
        QueryResult::Rows(rows) => {
            assert!(rows.iter().any(|r| r[0].as_deref() == Some("showdb")));
        }
        other => panic!("expected rows, got {other:?}"),
    }
    match root.query("show tables").await.unwrap() {
        QueryResult::Rows(rows) => {
            assert!(rows.iter().any(|r| r[0].as_deref() == Some("t")));
        }
        other => panic!("expected rows, got {other:?}"),
    }
    match root.query("show users").await.unwrap() {
        QueryResult::Rows(rows) => {
            assert!(rows.iter().any(|r| r[1].as_deref() == Some("root")));
        }
        other => panic!("expected rows, got {other:?}"),
    }
    match root.query("show processlist").await.unwrap() {
        QueryResult::Rows(rows) => assert!(!rows.is_empty()),
        other => panic!("expected rows, got {other:?}"),
    }
    match root.query("show status").await.unwrap() {
        QueryResult::Rows(rows) => {
            assert!(rows.iter().any(|r| r[0].as_deref() == Some("total_stmts")));
        }
        other => panic!("expected rows, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_savepoints_and_rollback() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    root.query("create table t(a integer)").await.unwrap();

    root.query("begin").await.unwrap();
    root.query("insert into t(a) values(1)").await.unwrap();
    root.query("savepoint s1").await.unwrap();
    root.query("insert into t(a) values(2)").await.unwrap();
    root.query("rollback to s1").await.unwrap();
    root.query("commit").await.unwrap();

    assert_eq!(
        single_value(root.query("select count(*) from t").await.unwrap()),
        "1"
    );
    // Back in auto-commit: another writer proceeds immediately.
    let mut other = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    other.query("insert into t(a) values(3)").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_prepared_statement_implicit_transaction() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    root.query("create table t(a integer primary key)")
        .await
        .unwrap();

    let stmt = root.prepare("insert into t(a) values(?)").await.unwrap();
    match root.execute(stmt, &[Some("5")]).await.unwrap() {
        QueryResult::Affected(n) => assert_eq!(n, 1),
        other => panic!("expected affected count, got {other:?}"),
    }
    // The implicit transaction committed: another connection sees the row
    // and the writer is back in auto-commit.
    let mut other = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    assert_eq!(
        single_value(other.query("select count(*) from t").await.unwrap()),
        "1"
    );
    other.query("insert into t(a) values(6)").await.unwrap();

    // A failing execute rolls the implicit transaction back and leaves
    // the connection usable.
    let err = root
        .execute(stmt, &[Some("5")])
        .await
        .expect_err("duplicate key must fail");
    assert_eq!(err.sqlstate, "23505");
    assert_eq!(
        single_value(root.query("select count(*) from t").await.unwrap()),
        "2"
    );
    match root.execute(stmt, &[Some("9")]).await.unwrap() {
        QueryResult::Affected(n) => assert_eq!(n, 1),
        other => panic!("expected affected count, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_multi_statement_frame_continues_after_error() {
    let ts = start_server(|_| {}).await;
    let mut root = TestClient::connect(ts.addr, "main", "root", PASSWORD)
        .await
        .unwrap();
    root.query("create table t(a integer)").await.unwrap();

    // The failing statement is reported; the following one still runs.
    let mut payload = Vec::new();
    payload.push(command::COM_QUERY);
    payload.extend_from_slice(b"insert into missing(a) values(1); insert into t(a) values(1)");
    write_frame(&mut root.stream, 0, &payload).await.unwrap();
    let first = root.read_result().await;
    assert!(first.is_err());
    match root.read_result().await.unwrap() {
        QueryResult::Affected(n) => assert_eq!(n, 1),
        other => panic!("expected affected count, got {other:?}"),
    }
    assert_eq!(
        single_value(root.query("select count(*) from t").await.unwrap()),
        "1"
    );
}
