//! Recognizers for transaction control statements and `SET TRANSACTION`.

use super::common::Cursor;
use super::statement::{IsolationLevel, StatementKind, TransactionMode, TxBehavior, TxKind};
use super::ParseError;

/// `BEGIN|START [DEFERRED|IMMEDIATE|EXCLUSIVE] [TRANSACTION|WORK]
/// [<tx-mode-list>]`. Default behavior is DEFERRED.
pub(super) fn begin(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let behavior = match cur.take_keyword(&["deferred", "immediate", "exclusive"])? {
        Some("deferred") | None => TxBehavior::Deferred,
        Some("immediate") => TxBehavior::Immediate,
        _ => TxBehavior::Exclusive,
    };
    cur.take_keyword(&["transaction", "work"])?;
    let mode = if at_mode_item(cur)? {
        tx_mode_list(cur)?
    } else {
        TransactionMode::default()
    };
    cur.expect_statement_end()?;
    Ok(StatementKind::Tx(TxKind::Begin { behavior, mode }))
}

/// `COMMIT|END [TRANSACTION|WORK]`.
pub(super) fn commit(cur: &mut Cursor<'_>, kind: TxKind) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["transaction", "work"])?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Tx(kind))
}

/// `ROLLBACK [TRANSACTION|WORK] [TO [SAVEPOINT] name]`.
pub(super) fn rollback(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["transaction", "work"])?;
    let savepoint = if cur.take_keyword(&["to"])?.is_some() {
        cur.take_keyword(&["savepoint"])?;
        Some(cur.separated_token()?)
    } else {
        None
    };
    cur.expect_statement_end()?;
    Ok(StatementKind::Tx(TxKind::Rollback { savepoint }))
}

/// `SAVEPOINT name`.
pub(super) fn savepoint(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let name = cur.separated_token()?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Tx(TxKind::Savepoint { name }))
}

/// `RELEASE [SAVEPOINT] name`.
pub(super) fn release(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["savepoint"])?;
    let name = cur.separated_token()?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Tx(TxKind::Release { name }))
}

/// `SET TRANSACTION <tx-mode-list>` and
/// `SET SESSION CHARACTERISTICS AS TRANSACTION <tx-mode-list>`.
/// Returns `None` for any other SET form, which passes through opaque.
pub(super) fn set(cur: &mut Cursor<'_>) -> Result<Option<StatementKind>, ParseError> {
    if cur.take_keyword(&["transaction"])?.is_some() {
        let mode = tx_mode_list(cur)?;
        cur.expect_statement_end()?;
        return Ok(Some(StatementKind::SetTransaction {
            session_scope: false,
            mode,
        }));
    }
    if cur.take_keyword(&["session"])?.is_some() {
        for kw in ["characteristics", "as", "transaction"] {
            cur.skip_ignorable()?;
            cur.expect_keyword(kw)?;
        }
        let mode = tx_mode_list(cur)?;
        cur.expect_statement_end()?;
        return Ok(Some(StatementKind::SetTransaction {
            session_scope: true,
            mode,
        }));
    }
    Ok(None)
}

fn at_mode_item(cur: &mut Cursor<'_>) -> Result<bool, ParseError> {
    let save = cur.pos();
    cur.skip_ignorable()?;
    let word = cur.peek_word();
    let hit = word.eq_ignore_ascii_case("read") || word.eq_ignore_ascii_case("isolation");
    cur.set_pos(save);
    Ok(hit)
}

/// Comma-separated list of `READ ONLY | READ WRITE | ISOLATION LEVEL ...`.
fn tx_mode_list(cur: &mut Cursor<'_>) -> Result<TransactionMode, ParseError> {
    let mut mode = TransactionMode::default();
    loop {
        match cur.take_keyword(&["read", "isolation"])? {
            Some("read") => {
                cur.skip_ignorable()?;
                let at = cur.pos();
                let word = cur.read_word();
                if word.eq_ignore_ascii_case("only") {
                    mode.read_only = Some(true);
                } else if word.eq_ignore_ascii_case("write") {
                    mode.read_only = Some(false);
                } else {
                    return Err(cur.error_at(at, "expected ONLY or WRITE"));
                }
            }
            Some(_) => {
                cur.skip_ignorable()?;
                cur.expect_keyword("level")?;
                mode.isolation = isolation_level(cur)?;
            }
            None => return Err(cur.error("expected transaction mode")),
        }
        if !cur.take_comma()? {
            break;
        }
    }
    Ok(mode)
}

fn isolation_level(cur: &mut Cursor<'_>) -> Result<IsolationLevel, ParseError> {
    cur.skip_ignorable()?;
    let at = cur.pos();
    let word = cur.read_word();
    if word.eq_ignore_ascii_case("serializable") {
        return Ok(IsolationLevel::Serializable);
    }
    if word.eq_ignore_ascii_case("repeatable") {
        cur.skip_ignorable()?;
        cur.expect_keyword("read")?;
        return Ok(IsolationLevel::RepeatableRead);
    }
    if word.eq_ignore_ascii_case("read") {
        cur.skip_ignorable()?;
        let at2 = cur.pos();
        let word2 = cur.read_word();
        if word2.eq_ignore_ascii_case("uncommitted") {
            return Ok(IsolationLevel::ReadUncommitted);
        }
        if word2.eq_ignore_ascii_case("committed") {
            return Ok(IsolationLevel::ReadCommitted);
        }
        return Err(cur.error_at(at2, "expected UNCOMMITTED or COMMITTED"));
    }
    Err(cur.error_at(at, "unknown isolation level"))
}
