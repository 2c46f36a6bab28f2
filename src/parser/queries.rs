//! Recognizers for SELECT and the SHOW family.

use super::common::{is_ident_start, qualified_name, Cursor};
use super::statement::{Show, StatementKind};
use super::ParseError;

/// Scans a SELECT body. Two special shapes are recognized at top level:
///
/// - `... FOR UPDATE` terminates the statement; the emitted SQL excludes
///   the terminator (the second element of the return value is the byte
///   where the statement text ends).
/// - `[expr ,] SLEEP(number)` as the trailing select item; any other sleep
///   position is rejected.
pub(super) fn select(
    cur: &mut Cursor<'_>,
) -> Result<(StatementKind, Option<usize>), ParseError> {
    let mut for_update = false;
    let mut sleep_seconds = None;
    let mut end_override = None;

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
                if word.eq_ignore_ascii_case("for") {
                    let save = cur.pos();
                    cur.skip_ignorable()?;
                    if cur.read_word().eq_ignore_ascii_case("update") {
                        cur.skip_ignorable()?;
                        if !matches!(cur.peek(), None | Some(b';')) {
                            return Err(cur.error("unexpected token after FOR UPDATE"));
                        }
                        for_update = true;
                        end_override = Some(word_start);
                        break;
                    }
                    cur.set_pos(save);
                } else if word.eq_ignore_ascii_case("sleep") {
                    let save = cur.pos();
                    cur.skip_ignorable()?;
                    if cur.peek() == Some(b'(') {
                        cur.bump();
                        cur.skip_ignorable()?;
                        let n = cur.read_integer()?;
                        cur.skip_ignorable()?;
                        cur.expect_byte(b')', ")")?;
                        cur.skip_ignorable()?;
                        if !matches!(cur.peek(), None | Some(b';')) {
                            return Err(
                                cur.error("sleep() must be the trailing select item")
                            );
                        }
                        sleep_seconds = Some(n as u64);
                        break;
                    }
                    cur.set_pos(save);
                }
            }
            _ => {
                cur.bump();
            }
        }
    }

    Ok((
        StatementKind::Select {
            for_update,
            sleep_seconds,
        },
        end_override,
    ))
}

/// Dispatches the SHOW family. Returns `None` for an unrecognized SHOW
/// form, which then passes through as an opaque statement.
pub(super) fn show(cur: &mut Cursor<'_>) -> Result<Option<StatementKind>, ParseError> {
    let save = cur.pos();
    cur.skip_ignorable()?;
    let word = cur.read_word().to_ascii_lowercase();
    let show = match word.as_str() {
        "databases" => Show::Databases { all: false },
        "all" => {
            cur.skip_ignorable()?;
            cur.expect_keyword("databases")?;
            Show::Databases { all: true }
        }
        "columns" | "fields" => show_columns(cur)?,
        "create" => show_create(cur)?,
        "grants" => show_grants(cur)?,
        "indexes" | "index" => show_indexes(cur)?,
        "processlist" => Show::Processlist { full: false },
        "full" => {
            cur.skip_ignorable()?;
            cur.expect_keyword("processlist")?;
            Show::Processlist { full: true }
        }
        "status" => Show::Status,
        "tables" => show_tables(cur)?,
        "users" => show_users(cur)?,
        _ => {
            cur.set_pos(save);
            return Ok(None);
        }
    };
    cur.expect_statement_end()?;
    Ok(Some(StatementKind::Show(show)))
}

/// `COLUMNS|FIELDS {FROM|IN} [schema .] table [{FROM|IN} schema]`.
fn show_columns(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    if cur.take_keyword(&["from", "in"])?.is_none() {
        cur.skip_ignorable()?;
        return Err(cur.error("expected FROM or IN"));
    }
    let (mut schema, table) = qualified_name(cur)?;
    if cur.take_keyword(&["from", "in"])?.is_some() {
        schema = Some(cur.separated_token()?);
    }
    Ok(Show::Columns { schema, table })
}

/// `CREATE INDEX|TABLE [schema .] name [{FROM|IN} schema]`. A trailing
/// FROM/IN schema overrides the qualified prefix.
fn show_create(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    cur.skip_ignorable()?;
    let at = cur.pos();
    let word = cur.read_word().to_ascii_lowercase();
    let table_form = match word.as_str() {
        "table" => true,
        "index" => false,
        _ => return Err(cur.error_at(at, "expected TABLE or INDEX")),
    };
    let (prefix, name) = qualified_name(cur)?;
    let schema = if cur.take_keyword(&["from", "in"])?.is_some() {
        Some(cur.separated_token()?)
    } else {
        prefix
    };
    Ok(if table_form {
        Show::CreateTable {
            schema,
            table: name,
        }
    } else {
        Show::CreateIndex {
            schema,
            index: name,
        }
    })
}

/// `GRANTS [FOR (user[@host] | CURRENT_USER [()])]`. Without a host the
/// reference canonicalizes to `%`; without FOR it means the current user.
fn show_grants(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    if cur.take_keyword(&["for"])?.is_none() {
        return Ok(Show::Grants {
            host: "%".to_string(),
            user: None,
            current_user: true,
        });
    }
    if cur.take_keyword(&["current_user"])?.is_some() {
        let save = cur.pos();
        cur.skip_ignorable()?;
        if cur.peek() == Some(b'(') {
            cur.bump();
            cur.skip_ignorable()?;
            cur.expect_byte(b')', ")")?;
        } else {
            cur.set_pos(save);
        }
        return Ok(Show::Grants {
            host: "%".to_string(),
            user: None,
            current_user: true,
        });
    }
    let user = cur.separated_token()?;
    let save = cur.pos();
    cur.skip_ignorable()?;
    let host = if cur.peek() == Some(b'@') {
        cur.bump();
        cur.skip_ignorable()?;
        cur.read_token()?
    } else {
        cur.set_pos(save);
        "%".to_string()
    };
    Ok(Show::Grants {
        host,
        user: Some(user),
        current_user: false,
    })
}

/// `INDEXES [EXTENDED] [COLUMNS] [{FROM|IN} [schema .] target]
/// [{FROM|IN} schema] [WHERE 'pattern']`.
fn show_indexes(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    let extended = cur.take_keyword(&["extended"])?.is_some();
    let index_columns = cur.take_keyword(&["columns"])?.is_some();
    let mut schema = None;
    let mut name = None;
    if cur.take_keyword(&["from", "in"])?.is_some() {
        let (prefix, target) = qualified_name(cur)?;
        schema = prefix;
        name = Some(target);
        if cur.take_keyword(&["from", "in"])?.is_some() {
            schema = Some(cur.separated_token()?);
        }
    }
    let pattern = if cur.take_keyword(&["where"])?.is_some() {
        Some(cur.separated_token()?)
    } else {
        None
    };
    Ok(Show::Indexes {
        schema,
        name,
        index_columns,
        extended,
        pattern,
    })
}

/// `TABLES [FROM schema] [LIKE 'pattern']`.
fn show_tables(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    let schema = if cur.take_keyword(&["from"])?.is_some() {
        Some(cur.separated_token()?)
    } else {
        None
    };
    let pattern = if cur.take_keyword(&["like"])?.is_some() {
        Some(cur.separated_token()?)
    } else {
        None
    };
    Ok(Show::Tables { schema, pattern })
}

/// `USERS [WHERE 'pattern']`.
fn show_users(cur: &mut Cursor<'_>) -> Result<Show, ParseError> {
    let pattern = if cur.take_keyword(&["where"])?.is_some() {
        Some(cur.separated_token()?)
    } else {
        None
    };
    Ok(Show::Users { pattern })
}
