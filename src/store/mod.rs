//! Replicated Store
//!
//! SQLite database of one data node. A `meta` table holds the version
//! counter; every committed write bumps it by one inside the same
//! transaction and yields the `ReplicaLogEntry` that replays it elsewhere.

use std::path::{Path, PathBuf};

use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, Transaction};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::replication::{ReplicaLogEntry, SqlStatement, SqlValue, Version};

const META_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO meta (key, value) VALUES ('version', 0);
"#;

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

/// Result of a local commit
#[derive(Debug, Clone)]
pub struct Committed {
    /// Entry to hand to the replication mailbox
    pub entry: ReplicaLogEntry,
    /// Rowid of the last insert in the transaction
    pub last_insert_rowid: i64,
}

/// Persistent store of one data node
pub struct Store {
    /// Database file
    path: PathBuf,
    /// Application schema, re-applied after every reopen
    schema: String,
    /// Connection; its mutex is the node-wide write lock
    conn: Mutex<Connection>,
}

impl Store {
    /// Create or open the store at `path` and apply `schema`
    pub fn open(path: impl AsRef<Path>, schema: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = open_connection(&path, schema)?;
        let store = Self {
            path,
            schema: schema.to_string(),
            conn: Mutex::new(conn),
        };

        tracing::info!("Opened store {}", store.path.display());
        Ok(store)
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the node-wide lock. Reads take it too; a held guard means no
    /// transaction can start, so the file on disk is a consistent snapshot.
    pub async fn lock(&self) -> StoreGuard<'_> {
        StoreGuard {
            conn: self.conn.lock().await,
            path: &self.path,
        }
    }

    /// Current version counter
    pub async fn version(&self) -> Result<Version> {
        self.lock().await.version()
    }

    /// Replay an entry received from the primary
    pub async fn replay(&self, entry: &ReplicaLogEntry) -> Result<()> {
        self.lock().await.replay(entry)
    }

    /// Replace the database with the file at `incoming` and reopen it.
    ///
    /// Returns the version of the restored snapshot. A snapshot that is not
    /// a readable store is rejected before anything is replaced; the current
    /// database stays open and untouched.
    pub async fn restore_from(&self, incoming: &Path) -> Result<Version> {
        let version = inspect_snapshot(incoming)
            .map_err(|e| Error::Bootstrap(format!("rejected snapshot {}: {}", incoming.display(), e)))?;

        let mut guard = self.conn.lock().await;

        // Close the current handle before the file underneath it is replaced
        let old = std::mem::replace(&mut *guard, Connection::open_in_memory()?);
        if let Err((old, e)) = old.close() {
            *guard = old;
            return Err(Error::Store(format!("Failed to close store for restore: {}", e)));
        }

        let swapped = std::fs::rename(incoming, &self.path)
            .map_err(Error::from)
            .and_then(|_| open_connection(&self.path, &self.schema));
        match swapped {
            Ok(conn) => *guard = conn,
            Err(e) => {
                // Whatever file is at the path now is the best remaining state
                match open_connection(&self.path, &self.schema) {
                    Ok(conn) => *guard = conn,
                    Err(reopen) => tracing::error!("Store {} left closed: {}", self.path.display(), reopen),
                }
                return Err(Error::Bootstrap(format!("restore failed: {}; store must be reopened", e)));
            }
        }

        let restored = read_version(&guard)?;
        if restored != version {
            return Err(Error::Bootstrap(format!(
                "snapshot changed during restore: v{} became v{}",
                version, restored
            )));
        }
        tracing::info!("Restored store {} at version {}", self.path.display(), version);
        Ok(version)
    }
}

/// Exclusive access to the store
pub struct StoreGuard<'a> {
    conn: MutexGuard<'a, Connection>,
    path: &'a Path,
}

impl StoreGuard<'_> {
    /// Current version counter
    pub fn version(&self) -> Result<Version> {
        read_version(&self.conn)
    }

    /// Connection for reads
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// File to stream for a bootstrap transfer
    pub fn snapshot_path(&self) -> &Path {
        self.path
    }

    /// Execute `statements` as the next version.
    ///
    /// On error nothing is written and the version is unchanged.
    pub fn commit(&mut self, statements: Vec<SqlStatement>) -> Result<Committed> {
        let tx = self.conn.transaction()?;
        let version = read_version(&tx)? + 1;

        execute_all(&tx, &statements)?;
        let last_insert_rowid = tx.last_insert_rowid();
        write_version(&tx, version)?;
        tx.commit()?;

        tracing::debug!("Committed v{} ({} statements)", version, statements.len());
        Ok(Committed {
            entry: ReplicaLogEntry { version, statements },
            last_insert_rowid,
        })
    }

    /// Execute a replicated entry and adopt its version
    pub fn replay(&mut self, entry: &ReplicaLogEntry) -> Result<()> {
        let tx = self.conn.transaction()?;
        execute_all(&tx, &entry.statements)?;
        write_version(&tx, entry.version)?;
        tx.commit()?;
        Ok(())
    }
}

fn open_connection(path: &Path, schema: &str) -> Result<Connection> {
    let conn = Connection::open(path)?;

    // Rollback journal: with no open transaction the file alone is complete
    let mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("delete") {
        return Err(Error::Store(format!("unexpected journal mode {}", mode)));
    }

    conn.execute_batch(META_SCHEMA)?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

/// Version of a snapshot file, opened read-only so nothing is created
fn inspect_snapshot(path: &Path) -> Result<Version> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    read_version(&conn)
}

fn execute_all(tx: &Transaction<'_>, statements: &[SqlStatement]) -> Result<()> {
    for statement in statements {
        tx.execute(&statement.sql, params_from_iter(statement.params.iter()))?;
    }
    Ok(())
}

fn read_version(conn: &Connection) -> Result<Version> {
    let value: i64 = conn.query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| row.get(0))?;
    Ok(value as Version)
}

fn write_version(conn: &Connection, version: Version) -> Result<()> {
    conn.execute(
        "UPDATE meta SET value = ?1 WHERE key = 'version'",
        params![version as i64],
    )?;
    Ok(())
}
