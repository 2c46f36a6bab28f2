//! The statement model: a tagged sum of every command family the server
//! recognizes, plus the behavioral predicates the processor consults.

use std::fmt;

/// SQLite transaction behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxBehavior {
    Deferred,
    Immediate,
    Exclusive,
}

/// ANSI isolation levels accepted in a transaction mode list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction characteristics: `read_only = None` means unspecified and
/// inherits the session setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionMode {
    pub read_only: Option<bool>,
    pub isolation: IsolationLevel,
}

impl Default for TransactionMode {
    fn default() -> Self {
        TransactionMode {
            read_only: None,
            isolation: IsolationLevel::Serializable,
        }
    }
}

/// BEGIN/COMMIT/END/ROLLBACK/SAVEPOINT/RELEASE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxKind {
    Begin {
        behavior: TxBehavior,
        mode: TransactionMode,
    },
    Commit,
    End,
    Rollback {
        savepoint: Option<String>,
    },
    Savepoint {
        name: String,
    },
    Release {
        name: String,
    },
}

impl TxKind {
    pub fn is_begin(&self) -> bool {
        matches!(self, TxKind::Begin { .. })
    }

    /// COMMIT and END are synonyms.
    pub fn is_commit(&self) -> bool {
        matches!(self, TxKind::Commit | TxKind::End)
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, TxKind::Rollback { .. })
    }

    pub fn is_savepoint(&self) -> bool {
        matches!(self, TxKind::Savepoint { .. })
    }

    pub fn is_release(&self) -> bool {
        matches!(self, TxKind::Release { .. })
    }

    pub fn savepoint_name(&self) -> Option<&str> {
        match self {
            TxKind::Rollback { savepoint } => savepoint.as_deref(),
            TxKind::Savepoint { name } | TxKind::Release { name } => Some(name),
            _ => None,
        }
    }
}

/// `CREATE USER 'user'@'host' ...` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUser {
    pub user: String,
    pub host: String,
    pub sa: bool,
    pub password: Option<String>,
    pub protocol: String,
    pub auth_method: String,
}

/// `ALTER USER` arguments; only the attributes that were written are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlterUser {
    pub user: String,
    pub host: String,
    pub protocol: String,
    pub sa: Option<bool>,
    pub password: Option<String>,
    pub auth_method: Option<String>,
}

/// One `'user'@'host' [IDENTIFIED WITH protocol]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRef {
    pub host: String,
    pub user: String,
    pub protocol: String,
}

/// GRANT/REVOKE arguments. Order of appearance is preserved; duplicates are
/// dropped on insert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GrantArgs {
    pub privileges: Vec<String>,
    pub databases: Vec<String>,
    pub grantees: Vec<(String, String)>,
}

impl GrantArgs {
    pub fn has_privilege(&self, name: &str) -> bool {
        self.privileges.iter().any(|p| p == name)
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.databases.iter().any(|d| d == name)
    }

    pub fn has_grantee(&self, host: &str, user: &str) -> bool {
        self.grantees.iter().any(|(h, u)| h == host && u == user)
    }
}

/// The SHOW family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Show {
    Columns {
        schema: Option<String>,
        table: String,
    },
    CreateIndex {
        schema: Option<String>,
        index: String,
    },
    CreateTable {
        schema: Option<String>,
        table: String,
    },
    Databases {
        all: bool,
    },
    Grants {
        host: String,
        user: Option<String>,
        current_user: bool,
    },
    Indexes {
        schema: Option<String>,
        name: Option<String>,
        index_columns: bool,
        extended: bool,
        pattern: Option<String>,
    },
    Processlist {
        full: bool,
    },
    Status,
    Tables {
        schema: Option<String>,
        pattern: Option<String>,
    },
    Users {
        pattern: Option<String>,
    },
}

impl Show {
    pub fn command(&self) -> &'static str {
        match self {
            Show::Columns { .. } => "SHOW COLUMNS",
            Show::CreateIndex { .. } => "SHOW CREATE INDEX",
            Show::CreateTable { .. } => "SHOW CREATE TABLE",
            Show::Databases { .. } => "SHOW DATABASES",
            Show::Grants { .. } => "SHOW GRANTS",
            Show::Indexes { .. } => "SHOW INDEXES",
            Show::Processlist { .. } => "SHOW PROCESSLIST",
            Show::Status => "SHOW STATUS",
            Show::Tables { .. } => "SHOW TABLES",
            Show::Users { .. } => "SHOW USERS",
        }
    }
}

/// Every recognized statement shape. Unrecognized commands are `Generic`
/// and pass through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Empty,
    Generic,
    Select {
        for_update: bool,
        sleep_seconds: Option<u64>,
    },
    Insert {
        schema: Option<String>,
        table: String,
        select_sql: Option<String>,
        returning_columns: Option<String>,
    },
    Truncate {
        schema: Option<String>,
        table: String,
    },
    Tx(TxKind),
    SetTransaction {
        session_scope: bool,
        mode: TransactionMode,
    },
    Pragma {
        schema: Option<String>,
        name: String,
        value: Option<String>,
    },
    Attach {
        db_name: String,
        schema_name: String,
    },
    Detach {
        schema_name: String,
    },
    CreateDatabase {
        db: String,
        dir: Option<String>,
        quiet: bool,
    },
    DropDatabase {
        db: String,
        quiet: bool,
    },
    CreateUser(CreateUser),
    AlterUser(AlterUser),
    DropUser {
        users: Vec<UserRef>,
    },
    Grant(GrantArgs),
    Revoke(GrantArgs),
    Show(Show),
    Kill {
        query_only: bool,
        processor_id: u32,
    },
}

/// An immutable parsed statement: the original text slice, the uppercase
/// canonical command tag, and the recognized shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    sql: String,
    command: String,
    comment: bool,
    kind: StatementKind,
}

impl Statement {
    pub(crate) fn new(sql: String, command: String, comment: bool, kind: StatementKind) -> Self {
        Statement {
            sql,
            command,
            comment,
            kind,
        }
    }

    pub(crate) fn empty(sql: String, comment: bool) -> Self {
        Statement::new(sql, String::new(), comment, StatementKind::Empty)
    }

    /// The statement text as it appeared in the input. For
    /// `SELECT ... FOR UPDATE` this is the text up to (excluding) the
    /// `FOR UPDATE` terminator.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Uppercase canonical command tag; empty for empty statements.
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn kind(&self) -> &StatementKind {
        &self.kind
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, StatementKind::Empty)
    }

    pub fn is_comment(&self) -> bool {
        self.comment
    }

    /// Queries stream a result set; a PRAGMA is a query only in its
    /// value-less form.
    pub fn is_query(&self) -> bool {
        match &self.kind {
            StatementKind::Select { .. }
            | StatementKind::Show(_)
            | StatementKind::Attach { .. }
            | StatementKind::Detach { .. } => true,
            StatementKind::Pragma { value, .. } => value.is_none(),
            _ => false,
        }
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self.kind, StatementKind::Tx(_))
    }

    pub fn tx_kind(&self) -> Option<&TxKind> {
        match &self.kind {
            StatementKind::Tx(tx) => Some(tx),
            _ => None,
        }
    }

    /// True for statements whose effect lives in the meta database.
    pub fn is_meta(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::CreateUser(_)
                | StatementKind::AlterUser(_)
                | StatementKind::DropUser { .. }
                | StatementKind::Grant(_)
                | StatementKind::Revoke(_)
                | StatementKind::CreateDatabase { .. }
                | StatementKind::DropDatabase { .. }
                | StatementKind::Show(
                    Show::Databases { .. } | Show::Grants { .. } | Show::Users { .. }
                )
        )
    }

    /// True for statements the processor answers from its own state.
    pub fn is_local(&self) -> bool {
        matches!(
            self.kind,
            StatementKind::Kill { .. }
                | StatementKind::SetTransaction { .. }
                | StatementKind::Show(Show::Processlist { .. } | Show::Status)
        )
    }

    /// Statements that require the super-admin flag.
    pub fn needs_sa(&self) -> bool {
        match &self.kind {
            StatementKind::CreateUser(_)
            | StatementKind::AlterUser(_)
            | StatementKind::DropUser { .. }
            | StatementKind::Grant(_)
            | StatementKind::Revoke(_)
            | StatementKind::CreateDatabase { .. }
            | StatementKind::DropDatabase { .. } => true,
            StatementKind::Show(Show::Databases { all }) => *all,
            StatementKind::Show(Show::Grants { current_user, .. }) => !current_user,
            StatementKind::Show(Show::Users { .. }) => true,
            _ => false,
        }
    }

    /// The SQL handed to the engine. Differs from `sql()` where the server
    /// rewrites on the wire: deferred BEGIN upgrades to IMMEDIATE (a
    /// deferred transaction could never recover from a later busy
    /// condition), TRUNCATE renders as DELETE, SHOW renders as catalog
    /// queries.
    pub fn executable_sql(&self) -> String {
        match &self.kind {
            StatementKind::Tx(TxKind::Begin { behavior, mode }) => {
                let read_only = mode.read_only == Some(true);
                match behavior {
                    TxBehavior::Deferred if read_only => "begin".to_string(),
                    TxBehavior::Deferred | TxBehavior::Immediate => "begin immediate".to_string(),
                    TxBehavior::Exclusive => "begin exclusive".to_string(),
                }
            }
            StatementKind::Truncate { schema, table } => match schema {
                Some(schema) => format!(
                    "delete from {}.{}",
                    quote_ident(schema),
                    quote_ident(table)
                ),
                None => format!("delete from {}", quote_ident(table)),
            },
            StatementKind::Show(show) => show_engine_sql(show),
            _ => self.sql.clone(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql)
    }
}

/// Double-quotes an identifier, doubling embedded quotes.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quotes a literal, doubling embedded quotes.
pub(crate) fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Engine-side renderings of the SHOW variants that read sqlite catalogs.
/// Meta-backed SHOW variants render in `meta_sql` instead.
fn show_engine_sql(show: &Show) -> String {
    match show {
        Show::Columns { schema, table } => match schema {
            Some(schema) => format!(
                "pragma {}.table_info({})",
                quote_ident(schema),
                quote_literal(table)
            ),
            None => format!("pragma table_info({})", quote_literal(table)),
        },
        Show::CreateTable { schema, table } => format!(
            "select name, sql from {}sqlite_master where type = 'table' and name = {}",
            master_prefix(schema),
            quote_literal(table)
        ),
        Show::CreateIndex { schema, index } => format!(
            "select name, sql from {}sqlite_master where type = 'index' and name = {}",
            master_prefix(schema),
            quote_literal(index)
        ),
        Show::Indexes {
            schema,
            name,
            index_columns,
            extended,
            pattern,
        } => {
            if *index_columns {
                let pragma = if *extended { "index_xinfo" } else { "index_info" };
                let index = name.as_deref().unwrap_or_default();
                match schema {
                    Some(schema) => format!(
                        "pragma {}.{}({})",
                        quote_ident(schema),
                        pragma,
                        quote_literal(index)
                    ),
                    None => format!("pragma {}({})", pragma, quote_literal(index)),
                }
            } else {
                let mut sql = format!(
                    "select name, tbl_name, sql from {}sqlite_master where type = 'index'",
                    master_prefix(schema)
                );
                if let Some(table) = name {
                    sql.push_str(&format!(" and tbl_name = {}", quote_literal(table)));
                }
                if let Some(pattern) = pattern {
                    sql.push_str(&format!(" and name like {}", quote_literal(pattern)));
                }
                sql.push_str(" order by name");
                sql
            }
        }
        Show::Tables { schema, pattern } => {
            let mut sql = format!(
                "select name from {}sqlite_master where type = 'table'",
                master_prefix(schema)
            );
            if let Some(pattern) = pattern {
                sql.push_str(&format!(" and name like {}", quote_literal(pattern)));
            }
            sql.push_str(" order by name");
            sql
        }
        // Meta- and processor-backed variants never reach the engine
        // through this path.
        _ => String::new(),
    }
}

fn master_prefix(schema: &Option<String>) -> String {
    match schema {
        Some(schema) => format!("{}.", quote_ident(schema)),
        None => String::new(),
    }
}
