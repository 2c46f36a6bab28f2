//! Recognizers for INSERT and TRUNCATE. UPDATE and DELETE carry no
//! structured arguments and are scanned as opaque bodies by the dispatcher.

use super::common::{is_ident_start, qualified_name, Cursor};
use super::statement::StatementKind;
use super::ParseError;

/// `INSERT [INTO] [schema .] table ...` with three sub-shapes: plain
/// values, `INSERT ... SELECT`, and either one followed by
/// `RETURNING <columns>`. The RETURNING columns are preserved verbatim,
/// trailing whitespace and embedded comments included.
pub(super) fn insert(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["into"])?;
    let (schema, table) = qualified_name(cur)?;

    let mut select_start: Option<usize> = None;
    let mut select_end: Option<usize> = None;
    let mut returning_columns: Option<String> = None;
    loop {
        match cur.peek() {
            None | Some(b';') => break,
            Some(b'\'') => cur.skip_quoted(b'\'')?,
            Some(b'"') => cur.skip_quoted(b'"')?,
            Some(b'-') if cur.peek_at(1) == Some(b'-') => {
                cur.skip_ignorable()?;
            }
            Some(b'/') if cur.peek_at(1) == Some(b'*') => {
                cur.skip_ignorable()?;
            }
            Some(b) if is_ident_start(b) => {
                let word_start = cur.pos();
                let word = cur.read_word();
                if select_start.is_none() && word.eq_ignore_ascii_case("select") {
                    select_start = Some(word_start);
                } else if word.eq_ignore_ascii_case("returning") {
                    select_end = Some(word_start);
                    cur.skip_ignorable()?;
                    let columns_start = cur.pos();
                    cur.skip_to_statement_end()?;
                    returning_columns =
                        Some(cur.input()[columns_start..cur.pos()].to_string());
                    break;
                }
            }
            _ => {
                cur.bump();
            }
        }
    }

    let select_sql = select_start.map(|start| {
        let end = select_end.unwrap_or(cur.pos());
        cur.input()[start..end].to_string()
    });
    Ok(StatementKind::Insert {
        schema,
        table,
        select_sql,
        returning_columns,
    })
}

/// `TRUNCATE [TABLE] [schema .] table`, emitted as command DELETE.
pub(super) fn truncate(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    cur.take_keyword(&["table"])?;
    let (schema, table) = qualified_name(cur)?;
    cur.expect_statement_end()?;
    Ok(StatementKind::Truncate { schema, table })
}
