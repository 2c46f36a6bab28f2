//! Per-connection transaction state and the process-wide write-lock
//! coordinator.

mod busy;
mod write_lock;

pub use self::busy::BusyContext;
pub use self::write_lock::DbWriteLock;

use crate::parser::TransactionMode;

/// A live transaction on one connection. Created on BEGIN/SAVEPOINT or,
/// implicitly, around a prepared writing statement in auto-commit mode.
#[derive(Debug, Clone)]
pub struct Transaction {
    mode: TransactionMode,
    implicit: bool,
    first_command: Option<String>,
}

impl Transaction {
    pub fn new(mode: TransactionMode) -> Self {
        Transaction {
            mode,
            implicit: false,
            first_command: None,
        }
    }

    pub fn implicit() -> Self {
        Transaction {
            mode: TransactionMode::default(),
            implicit: true,
            first_command: None,
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn mode(&self) -> &TransactionMode {
        &self.mode
    }

    /// Unspecified read-only inherits the session setting.
    pub fn is_read_only(&self, session_read_only: bool) -> bool {
        self.mode.read_only.unwrap_or(session_read_only)
    }

    /// `SET TRANSACTION READ ONLY|WRITE` inside an open transaction.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.mode.read_only = Some(read_only);
    }

    pub fn first_command(&self) -> Option<&str> {
        self.first_command.as_deref()
    }

    /// Records the first statement executed inside this transaction.
    /// Later statements do not overwrite it.
    pub fn set_first_command(&mut self, command: &str) {
        if self.first_command.is_none() {
            self.first_command = Some(command.to_string());
        }
    }
}

/// One entry of the savepoint stack; top is the innermost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxPoint {
    Begin,
    Savepoint(String),
}

/// The per-connection savepoint stack. BEGIN sits at the bottom; RELEASE
/// pops through the named savepoint but never past a BEGIN.
#[derive(Debug, Default)]
pub struct SavepointStack {
    points: Vec<TxPoint>,
}

impl SavepointStack {
    pub fn new() -> Self {
        SavepointStack { points: Vec::new() }
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn push_begin(&mut self) {
        self.points.push(TxPoint::Begin);
    }

    pub fn push_savepoint(&mut self, name: &str) {
        self.points.push(TxPoint::Savepoint(name.to_string()));
    }

    /// Pops savepoints up to and including `name`. Returns true when the
    /// stack is empty afterwards, i.e. auto-commit is restored.
    pub fn release(&mut self, name: &str) -> bool {
        let mut auto_commit = self.points.is_empty();
        while let Some(top) = self.points.last() {
            match top {
                TxPoint::Begin => break,
                TxPoint::Savepoint(sp) => {
                    let matched = sp.eq_ignore_ascii_case(name);
                    self.points.pop();
                    if matched {
                        auto_commit = self.points.is_empty();
                        break;
                    }
                }
            }
        }
        auto_commit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_pops_through_named_savepoint() {
        let mut stack = SavepointStack::new();
        stack.push_savepoint("a");
        stack.push_savepoint("b");
        stack.push_savepoint("c");
        // Releasing "b" drops "c" and "b"; "a" keeps the transaction open.
        assert!(!stack.release("b"));
        assert!(!stack.is_empty());
        assert!(stack.release("a"));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_release_stops_at_begin() {
        let mut stack = SavepointStack::new();
        stack.push_begin();
        stack.push_savepoint("a");
        assert!(!stack.release("a"));
        // The BEGIN entry survives an unmatched release.
        assert!(!stack.release("missing"));
        assert!(!stack.is_empty());
    }

    #[test]
    fn test_release_names_are_case_insensitive() {
        let mut stack = SavepointStack::new();
        stack.push_savepoint("Sp1");
        assert!(stack.release("SP1"));
    }

    #[test]
    fn test_implicit_transaction_flags() {
        let tx = Transaction::implicit();
        assert!(tx.is_implicit());
        let mut tx = Transaction::new(TransactionMode::default());
        assert!(!tx.is_implicit());
        assert!(!tx.is_read_only(false));
        assert!(tx.is_read_only(true));
        tx.set_first_command("INSERT");
        tx.set_first_command("SELECT");
        assert_eq!(tx.first_command(), Some("INSERT"));
    }
}
