//! Recognizers for ATTACH, DETACH, PRAGMA and KILL.

use super::common::{is_ident_start, qualified_name, Cursor};
use super::statement::StatementKind;
use super::ParseError;

/// `ATTACH [DATABASE] <path> AS <schema>`.
pub(super) fn attach(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["database"])?;
    let db_name = cur.separated_token()?;
    cur.skip_ignorable()?;
    cur.expect_keyword("as")?;
    let schema_name = cur.separated_token()?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Attach {
        db_name,
        schema_name,
    })
}

/// `DETACH [DATABASE] <schema>`.
pub(super) fn detach(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["database"])?;
    let schema_name = cur.separated_token()?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Detach { schema_name })
}

/// `PRAGMA [schema .] name [= <value> | ( <value> )]`. A value-less PRAGMA
/// is a query.
pub(super) fn pragma(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let (schema, name) = qualified_name(cur)?;
    cur.skip_ignorable()?;
    let value = match cur.peek() {
        Some(b'=') => {
            cur.bump();
            cur.skip_ignorable()?;
            Some(pragma_value(cur)?)
        }
        Some(b'(') => {
            cur.bump();
            cur.skip_ignorable()?;
            let value = pragma_value(cur)?;
            cur.skip_ignorable()?;
            cur.expect_byte(b')', ")")?;
            Some(value)
        }
        _ => None,
    };
    cur.expect_statement_end()?;
    Ok(StatementKind::Pragma {
        schema,
        name,
        value,
    })
}

/// A pragma value: signed decimal (fractions like `.0`, `-.0` included),
/// `0x` hex, a bare word, or a single-quoted string. The numeric text is
/// preserved verbatim.
fn pragma_value(cur: &mut Cursor<'_>) -> Result<String, ParseError> {
    match cur.peek() {
        Some(b'\'') => cur.read_quoted(b'\''),
        Some(b) if is_ident_start(b) => Ok(cur.read_word().to_string()),
        Some(b'+' | b'-' | b'.') | Some(b'0'..=b'9') => pragma_number(cur),
        _ => Err(cur.error("expected pragma value")),
    }
}

fn pragma_number(cur: &mut Cursor<'_>) -> Result<String, ParseError> {
    let start = cur.pos();
    if matches!(cur.peek(), Some(b'+' | b'-')) {
        cur.bump();
    }
    if cur.peek() == Some(b'0') && matches!(cur.peek_at(1), Some(b'x' | b'X')) {
        cur.bump();
        cur.bump();
        let digits_start = cur.pos();
        while matches!(cur.peek(), Some(b) if b.is_ascii_hexdigit()) {
            cur.bump();
        }
        if cur.pos() == digits_start {
            return Err(cur.error_at(start, "malformed hex literal"));
        }
        return Ok(cur.input()[start..cur.pos()].to_string());
    }
    let mut saw_digit = false;
    while matches!(cur.peek(), Some(b) if b.is_ascii_digit()) {
        cur.bump();
        saw_digit = true;
    }
    if cur.peek() == Some(b'.') {
        cur.bump();
        while matches!(cur.peek(), Some(b) if b.is_ascii_digit()) {
            cur.bump();
            saw_digit = true;
        }
    }
    if !saw_digit {
        return Err(cur.error_at(start, "malformed number"));
    }
    if cur.peek() == Some(b'.') {
        return Err(cur.error("malformed number: double decimal point"));
    }
    Ok(cur.input()[start..cur.pos()].to_string())
}

/// `KILL [CONNECTION|QUERY] <integer>`.
pub(super) fn kill(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let query_only = matches!(
        cur.take_keyword(&["connection", "query"])?,
        Some("query")
    );
    cur.skip_ignorable()?;
    let at = cur.pos();
    let id = cur.read_integer()?;
    if id < 0 || id > u32::MAX as i64 {
        return Err(cur.error_at(at, "processor id out of range"));
    }
    cur.expect_statement_end()?;
    Ok(StatementKind::Kill {
        query_only,
        processor_id: id as u32,
    })
}
