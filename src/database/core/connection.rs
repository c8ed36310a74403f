//! Database connection management
//!
//! This module provides the connection wrapper used by every storekeep component,
//! plus the bounded pool of read-only connections handed out by a `StoreHandle`.

use crate::config::StoreConfig;
use crate::error::{LifecycleError, StoreError};
use parking_lot::{Condvar, Mutex};
use rusqlite::{Connection, OpenFlags};
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// How long a connection waits on a locked database before giving up
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Core database connection wrapper
///
/// `DatabaseConn` owns a single read-write SQLite connection and remembers the
/// file it was opened from. Tuning pragmas are not applied on open; the
/// lifecycle applies them from the `StoreConfig` once migrations are done.
pub struct DatabaseConn {
    pub conn: Connection,
    path: PathBuf,
}

/// Outcome of `PRAGMA wal_checkpoint`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// Whether the checkpoint was blocked by a reader or writer
    pub busy: bool,
    /// Frames in the WAL file (-1 when not in WAL mode)
    pub log_frames: i64,
    /// Frames moved back into the database file
    pub checkpointed_frames: i64,
}

impl CheckpointResult {
    /// True when every WAL frame made it into the main file
    pub fn is_complete(&self) -> bool {
        !self.busy && self.log_frames <= self.checkpointed_frames
    }
}

impl DatabaseConn {
    /// Open (or create) a database file for reading and writing
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(DatabaseConn {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Path of the underlying database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply WAL, foreign-key and cache settings from the configuration
    pub fn apply_config(&self, config: &StoreConfig) -> rusqlite::Result<()> {
        let requested = if config.enable_wal() { "WAL" } else { "DELETE" };
        let mode: String = self.conn.query_row(
            &format!("PRAGMA journal_mode={}", requested),
            [],
            |row| row.get(0),
        )?;
        if !mode.eq_ignore_ascii_case(requested) {
            warn!(
                "journal mode {} requested but store reports {}",
                requested, mode
            );
        }

        if config.enable_wal() {
            // NORMAL is durable across application crashes in WAL mode
            self.conn.execute("PRAGMA synchronous=NORMAL", [])?;
        }

        let fk = if config.enable_foreign_keys() { "ON" } else { "OFF" };
        self.conn
            .execute(&format!("PRAGMA foreign_keys={}", fk), [])?;

        // negative cache_size is interpreted as KiB
        self.conn.execute(
            &format!("PRAGMA cache_size=-{}", config.cache_size_kib()),
            [],
        )?;

        self.conn.execute("PRAGMA temp_store=MEMORY", [])?;

        debug!(
            journal_mode = %mode,
            foreign_keys = fk,
            cache_kib = config.cache_size_kib(),
            "applied store pragmas"
        );
        Ok(())
    }

    /// Current journal mode (`wal`, `delete`, `memory`, ...)
    pub fn journal_mode(&self) -> rusqlite::Result<String> {
        self.conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
    }

    /// Whether foreign key enforcement is active on this connection
    pub fn foreign_keys_enabled(&self) -> rusqlite::Result<bool> {
        let on: i64 = self
            .conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        Ok(on != 0)
    }

    /// Begin an unchecked transaction
    ///
    /// Used for migration steps so DDL and the `user_version` stamp commit together.
    pub fn transaction(&self) -> rusqlite::Result<rusqlite::Transaction<'_>> {
        self.conn.unchecked_transaction()
    }

    /// Move WAL content back into the main database file
    pub fn checkpoint(&self) -> rusqlite::Result<CheckpointResult> {
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok(CheckpointResult {
                    busy: row.get::<_, i64>(0)? != 0,
                    log_frames: row.get(1)?,
                    checkpointed_frames: row.get(2)?,
                })
            })
    }

    /// Check if a table exists in the database
    pub fn table_exists(&self, table_name: &str) -> rusqlite::Result<bool> {
        table_exists(&self.conn, table_name)
    }

    /// Get the row count for a table
    pub fn table_count(&self, table_name: &str) -> rusqlite::Result<u64> {
        let query = format!("SELECT COUNT(*) FROM {}", quote_ident(table_name));
        self.conn.query_row(&query, [], |row| row.get(0))
    }

    /// Close the connection, reporting any error from SQLite
    pub fn close(self) -> rusqlite::Result<()> {
        self.conn.close().map_err(|(_, e)| e)
    }
}

/// Quote an identifier for use in SQL text
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Check if a table exists
pub fn table_exists(conn: &Connection, table_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
        [table_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Check if an index exists
pub fn index_exists(conn: &Connection, index_name: &str) -> rusqlite::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name=?1",
        [index_name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Column names of a table, in declaration order
pub fn table_columns(conn: &Connection, table_name: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table_name)))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

/// Names of all user tables (SQLite internal tables excluded)
pub fn user_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(tables)
}

// =============================================================================
// Reader pool
// =============================================================================

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
    closed: bool,
}

/// Bounded pool of read-only connections
///
/// At most `capacity` connections exist at once; callers block until one is
/// returned when all are checked out. Connections are opened lazily.
pub struct ReaderPool {
    path: PathBuf,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// A read-only connection checked out of a [`ReaderPool`]
///
/// Returned to the pool on drop.
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    conn: ManuallyDrop<Connection>,
}

impl<'a> PooledReader<'a> {
    fn new(pool: &'a ReaderPool, conn: Connection) -> Self {
        PooledReader {
            pool,
            conn: ManuallyDrop::new(conn),
        }
    }
}

impl Deref for PooledReader<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        // SAFETY: `conn` is taken exactly once, here, and never touched again
        let conn = unsafe { ManuallyDrop::take(&mut self.conn) };
        self.pool.release(conn);
    }
}

impl ReaderPool {
    pub fn new(path: &Path, capacity: usize) -> Self {
        ReaderPool {
            path: path.to_path_buf(),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of connections currently open (idle or checked out)
    pub fn open_count(&self) -> usize {
        self.state.lock().open
    }

    /// Check out a connection, blocking while the pool is exhausted
    pub fn acquire(&self) -> Result<PooledReader<'_>, StoreError> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(LifecycleError::HandleClosed.into());
            }
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledReader::new(self, conn));
            }
            if state.open < self.capacity {
                state.open += 1;
                drop(state);
                return match self.open_reader() {
                    Ok(conn) => Ok(PooledReader::new(self, conn)),
                    Err(e) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(e.into())
                    }
                };
            }
            self.available.wait(&mut state);
        }
    }

    /// Close every idle connection and refuse further checkouts
    ///
    /// Connections still checked out are closed when they are returned.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        let idle = std::mem::take(&mut state.idle);
        state.open -= idle.len();
        drop(state);
        drop(idle);
        self.available.notify_all();
    }

    fn open_reader(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_NO_MUTEX
                | OpenFlags::SQLITE_OPEN_URI,
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(path = %self.path.display(), "opened pooled reader");
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        if state.closed {
            state.open -= 1;
            drop(state);
            drop(conn);
        } else {
            state.idle.push(conn);
            drop(state);
        }
        self.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn temp_db() -> (tempfile::TempDir, DatabaseConn) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[test]
    fn test_open_and_table_helpers() {
        let (_dir, db) = temp_db();
        db.conn
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT); CREATE INDEX idx_t_name ON t(name);")
            .unwrap();

        assert!(db.table_exists("t").unwrap());
        assert!(!db.table_exists("missing").unwrap());
        assert!(index_exists(&db.conn, "idx_t_name").unwrap());
        assert_eq!(table_columns(&db.conn, "t").unwrap(), vec!["id", "name"]);
        assert_eq!(user_tables(&db.conn).unwrap(), vec!["t"]);
        assert_eq!(db.table_count("t").unwrap(), 0);
    }

    #[test]
    fn test_apply_config() {
        let (_dir, db) = temp_db();
        let config = StoreConfig::builder()
            .enable_wal(true)
            .enable_foreign_keys(true)
            .cache_size_bytes(2 * 1024 * 1024)
            .build()
            .unwrap();
        db.apply_config(&config).unwrap();

        assert_eq!(db.journal_mode().unwrap(), "wal");
        assert!(db.foreign_keys_enabled().unwrap());
        let cache: i64 = db
            .conn
            .query_row("PRAGMA cache_size", [], |row| row.get(0))
            .unwrap();
        assert_eq!(cache, -2048);
    }

    #[test]
    fn test_apply_config_without_wal() {
        let (_dir, db) = temp_db();
        let config = StoreConfig::builder()
            .enable_wal(false)
            .enable_foreign_keys(false)
            .build()
            .unwrap();
        db.apply_config(&config).unwrap();

        assert_eq!(db.journal_mode().unwrap(), "delete");
        assert!(!db.foreign_keys_enabled().unwrap());
    }

    #[test]
    fn test_checkpoint_in_wal_mode() {
        let (_dir, db) = temp_db();
        db.apply_config(&StoreConfig::default()).unwrap();
        db.conn
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1);")
            .unwrap();

        let result = db.checkpoint().unwrap();
        assert!(result.is_complete());
    }

    #[test]
    fn test_reader_pool_is_bounded() {
        let (dir, db) = temp_db();
        db.apply_config(&StoreConfig::default()).unwrap();
        db.conn
            .execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY); INSERT INTO t VALUES (1), (2);")
            .unwrap();

        let pool = Arc::new(ReaderPool::new(&dir.path().join("test.db"), 2));
        let mut workers = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            workers.push(thread::spawn(move || {
                let reader = pool.acquire().unwrap();
                assert!(pool.open_count() <= 2);
                let count: i64 = reader
                    .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
                    .unwrap();
                count
            }));
        }
        for worker in workers {
            assert_eq!(worker.join().unwrap(), 2);
        }
        assert!(pool.open_count() <= pool.capacity());
    }

    #[test]
    fn test_reader_pool_close() {
        let (dir, _db) = temp_db();
        let pool = ReaderPool::new(&dir.path().join("test.db"), 1);
        {
            let _reader = pool.acquire().unwrap();
        }
        assert_eq!(pool.open_count(), 1);

        pool.close();
        assert_eq!(pool.open_count(), 0);
        assert!(matches!(
            pool.acquire(),
            Err(StoreError::Lifecycle(LifecycleError::HandleClosed))
        ));
    }

    #[test]
    fn test_reader_returned_on_drop() {
        let (dir, _db) = temp_db();
        let pool = ReaderPool::new(&dir.path().join("test.db"), 2);
        for _ in 0..3 {
            let reader = pool.acquire().unwrap();
            reader.execute_batch("SELECT 1").unwrap();
        }
        assert_eq!(pool.open_count(), 1);

        // a reader checked out across close is dropped when it comes back
        let reader = pool.acquire().unwrap();
        pool.close();
        assert_eq!(pool.open_count(), 1);
        drop(reader);
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_readers_cannot_write() {
        let (dir, db) = temp_db();
        db.conn.execute_batch("CREATE TABLE t (id INTEGER)").unwrap();
        let pool = ReaderPool::new(&dir.path().join("test.db"), 1);
        let reader = pool.acquire().unwrap();
        assert!(reader.execute("INSERT INTO t VALUES (1)", []).is_err());
    }
}
