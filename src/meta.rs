//! The meta database: a private registry of users, grants and catalogs
//! kept in its own file next to the user databases.
//!
//! Meta-affecting statements are rendered into SQL against a schema alias
//! attached to the executing processor's engine connection, so their
//! effects commit and roll back with the surrounding transaction. The
//! lookups here (authentication, allow list, privileges) go through a
//! dedicated connection instead.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::core::{Catalog, ServerError, User};
use crate::network::auth::AuthMethod;
use crate::parser::{DEFAULT_AUTH_METHOD, DEFAULT_PROTOCOL};

/// File name of the meta database inside the data directory.
pub const META_DB_NAME: &str = "rsqlited.meta";

pub struct MetaDb {
    data_dir: PathBuf,
    file: PathBuf,
    conn: Mutex<Connection>,
    hosts: RwLock<Option<Vec<String>>>,
    attach_seq: AtomicU32,
}

impl MetaDb {
    /// Opens an initialized meta database. Fails when `initdb` has not
    /// been run in this data directory.
    pub fn open(data_dir: &Path) -> Result<MetaDb, ServerError> {
        let file = data_dir.join(META_DB_NAME);
        if !file.is_file() {
            return Err(ServerError::Internal(format!(
                "meta database not found in '{}', run initdb first",
                data_dir.display()
            )));
        }
        let conn = Self::connect(&file)?;
        Ok(MetaDb {
            data_dir: data_dir.to_path_buf(),
            file,
            conn: Mutex::new(conn),
            hosts: RwLock::new(None),
            attach_seq: AtomicU32::new(0),
        })
    }

    /// Bootstraps the meta database and the super-admin account.
    pub fn init(
        data_dir: &Path,
        superuser: &str,
        password: &str,
    ) -> Result<MetaDb, ServerError> {
        std::fs::create_dir_all(data_dir)?;
        let file = data_dir.join(META_DB_NAME);
        if file.is_file() {
            return Err(ServerError::Internal(format!(
                "meta database already initialized in '{}'",
                data_dir.display()
            )));
        }
        let conn = Self::connect(&file)?;
        conn.execute_batch(
            "create table if not exists user(\
                 host varchar(60) not null,\
                 user varchar(32) not null,\
                 password varchar(256),\
                 protocol varchar(20) not null,\
                 auth_method varchar(20) not null,\
                 sa integer not null default 0,\
                 primary key(host, user, protocol));\
             create table if not exists db(\
                 host varchar(60) not null,\
                 user varchar(32) not null,\
                 db varchar(64) not null,\
                 primary key(host, user, db));\
             create table if not exists catalog(\
                 db varchar(64) not null,\
                 dir varchar(256),\
                 primary key(db));",
        )
        .map_err(ServerError::from)?;

        let method = AuthMethod::parse(DEFAULT_PROTOCOL, DEFAULT_AUTH_METHOD)?;
        let stored = method.gen_store_password(superuser, password);
        conn.execute(
            "insert into user(host, user, password, protocol, auth_method, sa)\
             values(?1, ?2, ?3, ?4, ?5, 1)",
            params!["%", superuser, stored, DEFAULT_PROTOCOL, DEFAULT_AUTH_METHOD],
        )
        .map_err(ServerError::from)?;
        debug!(superuser, dir = %data_dir.display(), "meta database initialized");

        Ok(MetaDb {
            data_dir: data_dir.to_path_buf(),
            file,
            conn: Mutex::new(conn),
            hosts: RwLock::new(None),
            attach_seq: AtomicU32::new(0),
        })
    }

    fn connect(file: &Path) -> Result<Connection, ServerError> {
        let conn = Connection::open(file).map_err(ServerError::from)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .map_err(ServerError::from)?;
        conn.pragma_update(None, "journal_mode", "wal")
            .map_err(ServerError::from)?;
        Ok(conn)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Attaches the meta database to an engine connection under a fresh
    /// deterministic alias (`meta_<n>`), returning the alias.
    pub fn attach_to(&self, conn: &Connection) -> Result<String, ServerError> {
        let n = self.attach_seq.fetch_add(1, Ordering::Relaxed);
        let alias = format!("meta_{n}");
        let path = self.file.to_string_lossy().replace('\'', "''");
        conn.execute_batch(&format!("attach database '{path}' as '{alias}'"))
            .map_err(ServerError::from)?;
        Ok(alias)
    }

    pub fn detach_from(&self, conn: &Connection, alias: &str) -> Result<(), ServerError> {
        conn.execute_batch(&format!("detach database '{alias}'"))
            .map_err(ServerError::from)?;
        Ok(())
    }

    /// Looks up a user row for authentication. An exact host row wins
    /// over the `%` wildcard.
    pub fn select_user(
        &self,
        host: &str,
        user: &str,
        protocol: &str,
    ) -> Result<Option<User>, ServerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "select host, user, password, protocol, auth_method, sa from user \
             where user = ?1 and protocol = ?2 and (host = ?3 or host = '%') \
             order by case host when ?3 then 0 else 1 end limit 1",
            params![user, protocol, host],
            |row| {
                Ok(User {
                    host: row.get(0)?,
                    user: row.get(1)?,
                    password: row.get(2)?,
                    protocol: row.get(3)?,
                    auth_method: row.get(4)?,
                    sa: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(ServerError::from)
    }

    /// Looks up a user row by its exact identity key, wildcard host
    /// included.
    pub fn select_user_exact(
        &self,
        host: &str,
        user: &str,
        protocol: &str,
    ) -> Result<Option<User>, ServerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "select host, user, password, protocol, auth_method, sa from user \
             where host = ?1 and user = ?2 and protocol = ?3",
            params![host, user, protocol],
            |row| {
                Ok(User {
                    host: row.get(0)?,
                    user: row.get(1)?,
                    password: row.get(2)?,
                    protocol: row.get(3)?,
                    auth_method: row.get(4)?,
                    sa: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(ServerError::from)
    }

    /// Host allow-listing against the cached set of user hosts.
    pub fn is_host_allowed(&self, host: &str) -> Result<bool, ServerError> {
        if let Some(hosts) = self.hosts.read().as_ref() {
            return Ok(host_in(hosts, host));
        }
        let hosts = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("select distinct host from user")
                .map_err(ServerError::from)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(ServerError::from)?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(ServerError::from)?
        };
        let allowed = host_in(&hosts, host);
        *self.hosts.write() = Some(hosts);
        Ok(allowed)
    }

    /// Invalidates the allow-list cache after a user meta statement.
    pub fn flush_hosts(&self) {
        *self.hosts.write() = None;
    }

    pub fn select_catalog(&self, db: &str) -> Result<Option<Catalog>, ServerError> {
        let conn = self.conn.lock();
        conn.query_row(
            "select db, dir from catalog where db = ?1",
            params![db],
            |row| {
                Ok(Catalog {
                    db: row.get(0)?,
                    dir: row.get(1)?,
                })
            },
        )
        .optional()
        .map_err(ServerError::from)
    }

    /// True when a grant row gives `user@host` access to `db`. A row with
    /// the value `all` is the wildcard grant.
    pub fn has_db_access(&self, host: &str, user: &str, db: &str) -> Result<bool, ServerError> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "select count(*) from db \
                 where user = ?1 and (host = ?2 or host = '%') and (db = ?3 or db = 'all')",
                params![user, host, db],
                |row| row.get(0),
            )
            .map_err(ServerError::from)?;
        Ok(n > 0)
    }

    /// Resolves the file of a logical database, honoring a catalog data
    /// directory override.
    pub fn db_file(&self, db: &str, dir: Option<&str>) -> PathBuf {
        match dir {
            Some(dir) => Path::new(dir).join(db),
            None => self.data_dir.join(db),
        }
    }
}

fn host_in(hosts: &[String], host: &str) -> bool {
    hosts
        .iter()
        .any(|h| h == "%" || h.eq_ignore_ascii_case(host))
}
