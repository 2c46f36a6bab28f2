//! Recognizers for the meta-DDL family (users, databases, grants) and the
//! rendering of each meta statement into SQL against the attached meta
//! schema alias. Every rendered string must re-parse as the single
//! expected command; a failed re-parse reports the original statement text
//! so the alias never leaks to the client.

use super::common::Cursor;
use super::statement::{
    AlterUser, CreateUser, GrantArgs, Show, Statement, StatementKind, UserRef,
};
use super::{ParseError, SqlParser};
use crate::core::Privilege;

pub const DEFAULT_PROTOCOL: &str = "pg";
pub const DEFAULT_AUTH_METHOD: &str = "md5";

const AUTH_METHODS: &[&str] = &["md5", "password", "trust"];

/// `'user'@'host'` with whitespace or comments allowed around the `@`.
fn user_at_host(cur: &mut Cursor<'_>) -> Result<(String, String), ParseError> {
    let user = cur.separated_token()?;
    cur.skip_ignorable()?;
    if cur.peek() != Some(b'@') {
        return Err(cur.error("expected '@' between user and host"));
    }
    cur.bump();
    cur.skip_ignorable()?;
    let host = cur.read_token()?;
    Ok((user, host))
}

#[derive(Default)]
struct UserOptions {
    sa: Option<bool>,
    password: Option<String>,
    protocol: Option<String>,
    auth_method: Option<String>,
}

/// The option tail shared by CREATE USER and ALTER USER:
/// `[WITH] (SUPERUSER|NOSUPERUSER | IDENTIFIED BY pw |
/// IDENTIFIED WITH protocol [method])*`. Repeated options are last-wins;
/// a second explicit auth method is an error.
fn user_options(cur: &mut Cursor<'_>) -> Result<UserOptions, ParseError> {
    let mut opts = UserOptions::default();
    loop {
        cur.skip_ignorable()?;
        if matches!(cur.peek(), None | Some(b';')) {
            break;
        }
        let at = cur.pos();
        let word = cur.read_word().to_ascii_lowercase();
        match word.as_str() {
            "with" => {}
            "superuser" => opts.sa = Some(true),
            "nosuperuser" => opts.sa = Some(false),
            "identified" => match cur.take_keyword(&["by", "with"])? {
                Some("by") => {
                    opts.password = Some(cur.separated_token()?);
                }
                Some(_) => {
                    cur.skip_ignorable()?;
                    let proto_at = cur.pos();
                    let proto = cur.read_word();
                    if proto.is_empty() {
                        return Err(cur.error_at(proto_at, "expected auth protocol"));
                    }
                    if !proto.eq_ignore_ascii_case(DEFAULT_PROTOCOL) {
                        return Err(cur.error_at(
                            proto_at,
                            format!("unknown auth protocol '{proto}'"),
                        ));
                    }
                    opts.protocol = Some(proto.to_ascii_lowercase());
                    let save = cur.pos();
                    cur.skip_ignorable()?;
                    let method_at = cur.pos();
                    let method = cur.read_word();
                    let known = AUTH_METHODS
                        .iter()
                        .find(|m| method.eq_ignore_ascii_case(m));
                    match known {
                        Some(m) => {
                            if opts.auth_method.is_some() {
                                return Err(cur
                                    .error_at(method_at, "auth method already specified"));
                            }
                            opts.auth_method = Some((*m).to_string());
                        }
                        None => cur.set_pos(save),
                    }
                }
                None => return Err(cur.error("expected BY or WITH after IDENTIFIED")),
            },
            "" => return Err(cur.error_at(at, "expected user option keyword")),
            _ => {
                return Err(cur.error_at(at, format!("unknown user option '{word}'")));
            }
        }
    }
    Ok(opts)
}

/// `CREATE USER 'user'@'host' [WITH] <options>*`. Default protocol `pg`,
/// default auth method `md5`; methods other than `trust` require a
/// password.
pub(super) fn create_user(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let (user, host) = user_at_host(cur)?;
    let end_pos = cur.pos();
    let opts = user_options(cur)?;
    let auth_method = opts
        .auth_method
        .unwrap_or_else(|| DEFAULT_AUTH_METHOD.to_string());
    if auth_method != "trust" && opts.password.is_none() {
        return Err(cur.error_at(
            end_pos,
            format!("no password given for auth method '{auth_method}'"),
        ));
    }
    Ok(StatementKind::CreateUser(CreateUser {
        user,
        host,
        sa: opts.sa.unwrap_or(false),
        password: opts.password,
        protocol: opts
            .protocol
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        auth_method,
    }))
}

/// `ALTER USER 'user'@'host' <options>*`; only the written attributes are
/// carried, and at least one must be.
pub(super) fn alter_user(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let (user, host) = user_at_host(cur)?;
    let end_pos = cur.pos();
    let opts = user_options(cur)?;
    if opts.sa.is_none() && opts.password.is_none() && opts.auth_method.is_none() {
        return Err(cur.error_at(end_pos, "nothing to alter"));
    }
    Ok(StatementKind::AlterUser(AlterUser {
        user,
        host,
        protocol: opts
            .protocol
            .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string()),
        sa: opts.sa,
        password: opts.password,
        auth_method: opts.auth_method,
    }))
}

/// `DROP USER 'user'@'host' [IDENTIFIED WITH protocol] [, ...]`.
pub(super) fn drop_user(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let mut users = Vec::new();
    loop {
        let (user, host) = user_at_host(cur)?;
        let protocol = if cur.take_keyword(&["identified"])?.is_some() {
            cur.skip_ignorable()?;
            cur.expect_keyword("with")?;
            cur.skip_ignorable()?;
            let at = cur.pos();
            let proto = cur.read_word();
            if !proto.eq_ignore_ascii_case(DEFAULT_PROTOCOL) {
                return Err(cur.error_at(at, format!("unknown auth protocol '{proto}'")));
            }
            proto.to_ascii_lowercase()
        } else {
            DEFAULT_PROTOCOL.to_string()
        };
        users.push(UserRef {
            host,
            user,
            protocol,
        });
        if !cur.take_comma()? {
            break;
        }
    }
    cur.expect_statement_end()?;
    Ok(StatementKind::DropUser { users })
}

/// `CREATE {DATABASE|SCHEMA} [IF NOT EXISTS] name
/// [{LOCATION|DIRECTORY} 'path']`. The database name is lowercased.
pub(super) fn create_database(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let (quiet, db) = database_name(cur, true)?;
    let dir = if cur.take_keyword(&["location", "directory"])?.is_some() {
        cur.skip_ignorable()?;
        match cur.peek() {
            Some(q @ (b'\'' | b'"')) => Some(cur.read_quoted(q)?),
            _ => return Err(cur.error("expected quoted directory path")),
        }
    } else {
        None
    };
    cur.expect_statement_end()?;
    Ok(StatementKind::CreateDatabase { db, dir, quiet })
}

/// `DROP {DATABASE|SCHEMA} [IF EXISTS] name`.
pub(super) fn drop_database(cur: &mut Cursor<'_>) -> Result<StatementKind, ParseError> {
    let (quiet, db) = database_name(cur, false)?;
    cur.expect_statement_end()?;
    Ok(StatementKind::DropDatabase { db, quiet })
}

fn database_name(cur: &mut Cursor<'_>, create: bool) -> Result<(bool, String), ParseError> {
    let ig = cur.skip_ignorable()?;
    if !ig.skipped && matches!(cur.peek(), Some(b'\'' | b'"')) {
        return Err(cur.error("missing separator before quoted token"));
    }
    let mut quiet = false;
    let name = if cur.peek_word().eq_ignore_ascii_case("if") {
        cur.read_word();
        cur.skip_ignorable()?;
        if create {
            cur.expect_keyword("not")?;
            cur.skip_ignorable()?;
        }
        cur.expect_keyword("exists")?;
        quiet = true;
        cur.separated_token()?
    } else {
        cur.read_token()?
    };
    Ok((quiet, name.to_ascii_lowercase()))
}

/// `GRANT <priv-list> ON [DATABASE|SCHEMA] <db-list> TO <user-list>` or the
/// mirrored REVOKE ... FROM. A trailing comma before the ON/TO/FROM
/// keyword is rejected.
pub(super) fn grant(cur: &mut Cursor<'_>, revoke: bool) -> Result<StatementKind, ParseError> {
    let terminator = if revoke { "from" } else { "to" };
    let mut args = GrantArgs::default();

    // Privilege list; `ALL [PRIVILEGES]` canonicalizes to `all`.
    loop {
        cur.skip_ignorable()?;
        let at = cur.pos();
        let word = cur.read_word();
        let privilege = Privilege::parse(word)
            .ok_or_else(|| cur.error_at(at, format!("unknown privilege '{word}'")))?;
        if privilege == Privilege::All {
            cur.take_keyword(&["privileges"])?;
        }
        let name = privilege.name().to_string();
        if !args.has_privilege(&name) {
            args.privileges.push(name);
        }
        if !cur.take_comma()? {
            break;
        }
    }
    cur.skip_ignorable()?;
    cur.expect_keyword("on")?;

    // Database list.
    cur.take_keyword(&["database", "schema"])?;
    loop {
        let db = cur.separated_token()?.to_ascii_lowercase();
        if !args.has_database(&db) {
            args.databases.push(db);
        }
        if !cur.take_comma()? {
            break;
        }
        let save = cur.pos();
        cur.skip_ignorable()?;
        let trailing = cur.peek_word().eq_ignore_ascii_case(terminator);
        cur.set_pos(save);
        if trailing {
            return Err(cur.error("trailing comma in database list"));
        }
    }
    cur.skip_ignorable()?;
    cur.expect_keyword(terminator)?;

    // Grantee list.
    loop {
        let (user, host) = user_at_host(cur)?;
        if !args.has_grantee(&host, &user) {
            args.grantees.push((host, user));
        }
        if !cur.take_comma()? {
            break;
        }
    }
    cur.expect_statement_end()?;
    Ok(if revoke {
        StatementKind::Revoke(args)
    } else {
        StatementKind::Grant(args)
    })
}

/// Renders a meta statement into SQL against the attached meta schema
/// alias. Fails for non-meta statements and when the rendered SQL does not
/// re-parse as the single expected command.
pub fn meta_sql(stmt: &Statement, alias: &str) -> Result<String, ParseError> {
    match stmt.kind() {
        StatementKind::CreateUser(cu) => {
            let password = match &cu.password {
                Some(p) => format!("'{p}'"),
                None => "NULL".to_string(),
            };
            let sql = format!(
                "insert into '{}'.user(host, user, password, protocol, auth_method, sa)\
                 values('{}', '{}', {}, '{}', '{}', {})",
                alias,
                cu.host,
                cu.user,
                password,
                cu.protocol,
                cu.auth_method,
                i32::from(cu.sa)
            );
            checked(stmt, sql, "INSERT")
        }
        StatementKind::AlterUser(au) => {
            let mut sets = Vec::new();
            if let Some(password) = &au.password {
                sets.push(format!("password = '{password}'"));
            }
            if let Some(method) = &au.auth_method {
                sets.push(format!("auth_method = '{method}'"));
            }
            if let Some(sa) = au.sa {
                sets.push(format!("sa = {}", i32::from(sa)));
            }
            let sql = format!(
                "update '{}'.user set {} where host = '{}' and user = '{}' and protocol = '{}'",
                alias,
                sets.join(", "),
                au.host,
                au.user,
                au.protocol
            );
            checked(stmt, sql, "UPDATE")
        }
        StatementKind::DropUser { users } => {
            let mut sql = format!("delete from '{alias}'.user where ");
            for (i, u) in users.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" or ");
                }
                sql.push_str(&format!(
                    "(host = '{}' and user = '{}' and protocol = '{}')",
                    u.host, u.user, u.protocol
                ));
            }
            checked(stmt, sql, "DELETE")
        }
        StatementKind::Grant(args) => {
            if args.privileges.is_empty() {
                return Err(render_error(stmt));
            }
            if args.grantees.is_empty() {
                return Err(render_error(stmt));
            }
            let mut sql = format!("replace into '{alias}'.db(host, user, db)values");
            let mut first = true;
            for (host, user) in &args.grantees {
                for granted in &args.privileges {
                    if !first {
                        sql.push(',');
                    }
                    first = false;
                    sql.push_str(&format!("('{host}','{user}','{granted}')"));
                }
            }
            checked(stmt, sql, "REPLACE")
        }
        StatementKind::Revoke(args) => {
            if args.privileges.is_empty() || args.grantees.is_empty() {
                return Err(render_error(stmt));
            }
            let mut sql = format!("delete from '{alias}'.db where ");
            let mut first = true;
            for (host, user) in &args.grantees {
                for granted in &args.privileges {
                    if !first {
                        sql.push_str(" or ");
                    }
                    first = false;
                    sql.push_str(&format!(
                        "(host = '{host}' and user = '{user}' and db = '{granted}')"
                    ));
                }
            }
            checked(stmt, sql, "DELETE")
        }
        StatementKind::CreateDatabase { db, dir, .. } => {
            let sql = match dir {
                Some(dir) => format!(
                    "insert into '{alias}'.catalog(db, dir)values('{db}', '{dir}')"
                ),
                None => format!("insert into '{alias}'.catalog(db, dir)values('{db}', NULL)"),
            };
            checked(stmt, sql, "INSERT")
        }
        StatementKind::DropDatabase { db, .. } => {
            let sql = format!("delete from '{alias}'.catalog where db = '{db}'");
            checked(stmt, sql, "DELETE")
        }
        StatementKind::Show(Show::Databases { all }) => {
            let sql = if *all {
                format!("select db, dir from '{alias}'.catalog order by db")
            } else {
                format!("select db from '{alias}'.catalog order by db")
            };
            checked(stmt, sql, "SELECT")
        }
        StatementKind::Show(Show::Grants { host, user, .. }) => {
            let user = user.as_deref().ok_or_else(|| render_error(stmt))?;
            let sql = format!(
                "select host, user, db from '{alias}'.db where host = '{host}' and user = '{user}'"
            );
            checked(stmt, sql, "SELECT")
        }
        StatementKind::Show(Show::Users { pattern }) => {
            let mut sql = format!(
                "select host, user, protocol, auth_method, sa from '{alias}'.user"
            );
            if let Some(pattern) = pattern {
                sql.push_str(&format!(" where user like '{pattern}'"));
            }
            sql.push_str(" order by host, user");
            checked(stmt, sql, "SELECT")
        }
        _ => Err(ParseError::new(0, "not a meta statement")),
    }
}

/// The rendered SQL must parse back as exactly one statement of the
/// expected command.
fn checked(stmt: &Statement, sql: String, expect: &str) -> Result<String, ParseError> {
    let mut parser = SqlParser::new(&sql);
    match parser.next() {
        Some(Ok(parsed)) if parsed.command() == expect => {
            if parser.next().is_none() {
                return Ok(sql);
            }
        }
        _ => {}
    }
    Err(render_error(stmt))
}

fn render_error(stmt: &Statement) -> ParseError {
    ParseError::new(0, stmt.sql().to_string())
}
