use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use atelier_error::AtelierError;

const DB_FILE: &str = "atelier.db";

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../migrations/0001_init.sql"),
}];

/// One SQLite connection per project instance. The connection is taken out of
/// the slot on shutdown so later calls fail instead of touching a closed
/// database.
pub struct Database {
    conn: Mutex<Option<Connection>>,
}

impl Database {
    pub fn open(data_dir: &Path) -> Result<Self, AtelierError> {
        let path = data_dir.join(DB_FILE);
        let mut conn = Connection::open(&path).map_err(db_err)?;
        configure_connection(&conn)?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, AtelierError> {
        let mut conn = Connection::open_in_memory().map_err(db_err)?;
        configure_connection(&conn)?;
        apply_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    pub fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, rusqlite::Error>,
    ) -> Result<R, AtelierError> {
        let guard = self.conn.lock().expect("db lock poisoned");
        let conn = guard.as_ref().ok_or_else(|| AtelierError::Database {
            message: "connection closed".to_string(),
        })?;
        f(conn).map_err(db_err)
    }

    /// Drops the underlying connection. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.conn.lock().expect("db lock poisoned").take();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.lock().expect("db lock poisoned").is_none()
    }
}

fn configure_connection(conn: &Connection) -> Result<(), AtelierError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(db_err)
}

fn apply_migrations(conn: &mut Connection) -> Result<(), AtelierError> {
    let mut version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(db_err)?;

    for migration in MIGRATIONS {
        if migration.version <= version {
            continue;
        }
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute_batch(migration.sql).map_err(db_err)?;
        tx.pragma_update(None, "user_version", migration.version)
            .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        version = migration.version;
    }

    Ok(())
}

fn db_err(err: rusqlite::Error) -> AtelierError {
    AtelierError::Database {
        message: err.to_string(),
    }
}
