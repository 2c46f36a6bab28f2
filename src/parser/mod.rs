//! Incremental, comment-aware SQL statement splitter and dialect
//! recognizer.
//!
//! `SqlParser` walks the input once and yields a lazy sequence of
//! [`Statement`]s. A statement's text runs from the first byte after the
//! previous top-level `;` (leading whitespace and comments included) to
//! the next top-level `;` or end of input; the separator itself belongs to
//! no statement. The first keyword selects a per-command recognizer;
//! anything unrecognized passes through opaque with its command tag set to
//! the uppercased first word.

mod common;
mod ddl;
mod dml;
mod meta;
mod queries;
mod statement;
mod transaction;

pub use self::meta::{meta_sql, DEFAULT_AUTH_METHOD, DEFAULT_PROTOCOL};
pub use self::statement::{
    AlterUser, CreateUser, GrantArgs, IsolationLevel, Show, Statement, StatementKind,
    TransactionMode, TxBehavior, TxKind, UserRef,
};

use self::common::Cursor;
use thiserror::Error;

/// A malformed-input error carrying the byte position of the offending
/// token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("SQL parse error at byte {position}: {message}")]
pub struct ParseError {
    position: usize,
    message: String,
}

impl ParseError {
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        ParseError {
            position,
            message: message.into(),
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Lazy, forward-only statement sequence over a SQL text.
pub struct SqlParser<'a> {
    cur: Cursor<'a>,
    open: bool,
    finished: bool,
    pending: Option<Result<Statement, ParseError>>,
    produced: bool,
}

impl<'a> SqlParser<'a> {
    pub fn new(input: &'a str) -> Self {
        SqlParser {
            cur: Cursor::new(input),
            open: true,
            finished: false,
            pending: None,
            produced: false,
        }
    }

    /// A closed parser yields no more statements.
    pub fn close(&mut self) {
        self.open = false;
        self.pending = None;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// True when another statement (or a parse error) will be yielded.
    pub fn has_next(&mut self) -> bool {
        if !self.open {
            return false;
        }
        if self.pending.is_none() && !self.finished {
            match self.advance() {
                Ok(Some(stmt)) => self.pending = Some(Ok(stmt)),
                Ok(None) => {}
                Err(e) => {
                    self.finished = true;
                    self.pending = Some(Err(e));
                }
            }
        }
        self.pending.is_some()
    }

    /// Acknowledges the most recently yielded statement. Fails when no
    /// statement is outstanding.
    pub fn remove(&mut self) -> Result<(), ParseError> {
        if self.produced {
            self.produced = false;
            Ok(())
        } else {
            Err(ParseError::new(self.cur.pos(), "no statement produced"))
        }
    }

    fn advance(&mut self) -> Result<Option<Statement>, ParseError> {
        if !self.open || self.finished {
            return Ok(None);
        }
        let start = self.cur.pos();
        let ig = self.cur.skip_ignorable()?;
        match self.cur.peek() {
            None => {
                self.finished = true;
                if self.cur.pos() > start {
                    let sql = self.cur.input()[start..].to_string();
                    Ok(Some(Statement::empty(sql, ig.comment)))
                } else {
                    Ok(None)
                }
            }
            Some(b';') => {
                // A `;`-terminated empty statement is plain empty even when
                // comments preceded it; only the unterminated trailing
                // segment reports comment-only input.
                let sql = self.cur.input()[start..self.cur.pos()].to_string();
                self.cur.bump();
                Ok(Some(Statement::empty(sql, false)))
            }
            Some(_) => {
                let (kind, command, end_override) = self.dispatch()?;
                let end = end_override.unwrap_or(self.cur.pos());
                let sql = self.cur.input()[start..end].to_string();
                if self.cur.peek() == Some(b';') {
                    self.cur.bump();
                }
                Ok(Some(Statement::new(sql, command, false, kind)))
            }
        }
    }

    /// Peeks the first keyword and runs the matching recognizer. Leaves
    /// the cursor at the statement's top-level `;` or at end of input.
    fn dispatch(&mut self) -> Result<(StatementKind, String, Option<usize>), ParseError> {
        let cur = &mut self.cur;
        let word = cur.read_word();
        let lower = word.to_ascii_lowercase();
        let plain = |kind: StatementKind, command: &str| -> (StatementKind, String, Option<usize>) {
            (kind, command.to_string(), None)
        };

        Ok(match lower.as_str() {
            "select" => {
                let (kind, end_override) = queries::select(cur)?;
                (kind, "SELECT".to_string(), end_override)
            }
            "insert" => plain(dml::insert(cur)?, "INSERT"),
            "update" | "delete" => {
                cur.skip_to_statement_end()?;
                plain(StatementKind::Generic, &lower.to_ascii_uppercase())
            }
            "truncate" => plain(dml::truncate(cur)?, "DELETE"),
            "begin" | "start" => plain(transaction::begin(cur)?, "BEGIN"),
            "commit" => plain(transaction::commit(cur, TxKind::Commit)?, "COMMIT"),
            "end" => plain(transaction::commit(cur, TxKind::End)?, "END"),
            "rollback" => plain(transaction::rollback(cur)?, "ROLLBACK"),
            "savepoint" => plain(transaction::savepoint(cur)?, "SAVEPOINT"),
            "release" => plain(transaction::release(cur)?, "RELEASE"),
            "set" => match transaction::set(cur)? {
                Some(kind) => plain(kind, "SET TRANSACTION"),
                None => {
                    cur.skip_to_statement_end()?;
                    plain(StatementKind::Generic, "SET")
                }
            },
            "pragma" => plain(ddl::pragma(cur)?, "PRAGMA"),
            "attach" => plain(ddl::attach(cur)?, "ATTACH"),
            "detach" => plain(ddl::detach(cur)?, "DETACH"),
            "kill" => plain(ddl::kill(cur)?, "KILL"),
            "create" => match cur.take_keyword(&["database", "schema", "user"])? {
                Some("user") => plain(meta::create_user(cur)?, "CREATE USER"),
                Some(_) => plain(meta::create_database(cur)?, "CREATE DATABASE"),
                None => {
                    cur.skip_to_statement_end()?;
                    plain(StatementKind::Generic, "CREATE")
                }
            },
            "drop" => match cur.take_keyword(&["database", "schema", "user"])? {
                Some("user") => plain(meta::drop_user(cur)?, "DROP USER"),
                Some(_) => plain(meta::drop_database(cur)?, "DROP DATABASE"),
                None => {
                    cur.skip_to_statement_end()?;
                    plain(StatementKind::Generic, "DROP")
                }
            },
            "alter" => match cur.take_keyword(&["user"])? {
                Some(_) => plain(meta::alter_user(cur)?, "ALTER USER"),
                None => {
                    cur.skip_to_statement_end()?;
                    plain(StatementKind::Generic, "ALTER")
                }
            },
            "grant" => plain(meta::grant(cur, false)?, "GRANT"),
            "revoke" => plain(meta::grant(cur, true)?, "REVOKE"),
            "show" => match queries::show(cur)? {
                Some(kind) => {
                    let command = match &kind {
                        StatementKind::Show(show) => show.command().to_string(),
                        _ => unreachable!(),
                    };
                    (kind, command, None)
                }
                None => {
                    cur.skip_to_statement_end()?;
                    plain(StatementKind::Generic, "SHOW")
                }
            },
            _ => {
                cur.skip_to_statement_end()?;
                plain(StatementKind::Generic, &word.to_ascii_uppercase())
            }
        })
    }
}

impl<'a> Iterator for SqlParser<'a> {
    type Item = Result<Statement, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.open {
            return None;
        }
        if let Some(pending) = self.pending.take() {
            if pending.is_ok() {
                self.produced = true;
            }
            return Some(pending);
        }
        match self.advance() {
            Ok(Some(stmt)) => {
                self.produced = true;
                Some(Ok(stmt))
            }
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
