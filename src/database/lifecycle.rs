//! Store lifecycle facade
//!
//! `StoreLifecycle` owns the one open store of a data directory. It is built
//! once by the process entry point and shared (usually behind an `Arc`);
//! every caller that opens with the same configuration gets the same
//! [`StoreHandle`].
//!
//! State machine:
//!
//! ```text
//! Uninitialized --open--> Open --close--> Closed --open--> Open
//!                          |  ^
//!                          +--+ restore (close, replace file, reopen)
//! ```

use crate::config::StoreConfig;
use crate::database::backup::{backup_conn, BackupPolicy, BackupRestoreManager};
use crate::database::core::{
    user_tables, DatabaseConn, ReaderPool, SchemaCatalog, SchemaManager,
};
use crate::database::migration::MigrationEngine;
use crate::error::{LifecycleError, RestoreError, StoreError, StoreResult};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Open,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Open => "open",
            LifecycleState::Closed => "closed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`StoreLifecycle::set_config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigChange {
    /// A store is open; the config takes effect on the next open
    Deferred,
    /// No store is open; the config is used by the next `open_configured`
    Recorded,
}

/// Store file sizes around a [`StoreLifecycle::cleanup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub size_before: u64,
    pub size_after: u64,
}

impl CleanupReport {
    pub fn reclaimed(&self) -> u64 {
        self.size_before.saturating_sub(self.size_after)
    }
}

// =============================================================================
// Store handle
// =============================================================================

/// An open store
///
/// Writes go through the single writer connection; reads may use the bounded
/// reader pool. After the owning lifecycle closes the store every accessor
/// fails with [`LifecycleError::HandleClosed`].
pub struct StoreHandle {
    path: PathBuf,
    config: StoreConfig,
    schema_version: AtomicU32,
    closed: AtomicBool,
    writer: Mutex<Option<DatabaseConn>>,
    readers: ReaderPool,
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("path", &self.path)
            .field("config", &self.config)
            .field("schema_version", &self.schema_version())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StoreHandle {
    fn new(db: DatabaseConn, config: StoreConfig, schema_version: u32) -> Self {
        let path = db.path().to_path_buf();
        let readers = ReaderPool::new(&path, config.max_pool_size());
        StoreHandle {
            path,
            config,
            schema_version: AtomicU32::new(schema_version),
            closed: AtomicBool::new(false),
            writer: Mutex::new(Some(db)),
            readers,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `f` on the writer connection
    pub fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        self.with_db(|db| Ok(f(&db.conn)?))
    }

    /// Run `f` on a pooled read-only connection, waiting for one if needed
    pub fn with_reader<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        if self.is_closed() {
            return Err(LifecycleError::HandleClosed.into());
        }
        let reader = self.readers.acquire()?;
        Ok(f(&*reader)?)
    }

    pub(crate) fn with_db<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&DatabaseConn) -> StoreResult<T>,
    {
        let guard = self.writer.lock();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(LifecycleError::HandleClosed.into()),
        }
    }

    pub(crate) fn set_schema_version(&self, version: u32) {
        self.schema_version.store(version, Ordering::Release);
    }

    /// Close readers and the writer; idempotent
    fn shutdown(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::Release);
        self.readers.close();
        let writer = self.writer.lock().take();
        if let Some(db) = writer {
            if let Err(e) = db.checkpoint() {
                warn!(path = %self.path.display(), "checkpoint on close failed: {}", e);
            }
            db.close()?;
            info!(path = %self.path.display(), "store closed");
        }
        Ok(())
    }
}

// =============================================================================
// Lifecycle
// =============================================================================

struct Inner {
    state: LifecycleState,
    handle: Option<Arc<StoreHandle>>,
    config: Option<StoreConfig>,
}

/// Owner of the single open store of a data directory
pub struct StoreLifecycle {
    data_dir: PathBuf,
    catalog: SchemaCatalog,
    engine: MigrationEngine,
    backups: BackupRestoreManager,
    inner: RwLock<Inner>,
}

impl StoreLifecycle {
    /// Lifecycle over `data_dir`; snapshots go to `{data_dir}/backups`
    pub fn new(data_dir: impl Into<PathBuf>, catalog: SchemaCatalog, engine: MigrationEngine) -> Self {
        let data_dir = data_dir.into();
        let policy = BackupPolicy {
            backup_dir: data_dir.join("backups"),
            ..BackupPolicy::default()
        };
        StoreLifecycle {
            data_dir,
            catalog,
            engine,
            backups: BackupRestoreManager::new(policy),
            inner: RwLock::new(Inner {
                state: LifecycleState::Uninitialized,
                handle: None,
                config: None,
            }),
        }
    }

    pub fn with_backup_policy(mut self, policy: BackupPolicy) -> Self {
        self.backups = BackupRestoreManager::new(policy);
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn catalog(&self) -> &SchemaCatalog {
        &self.catalog
    }

    pub fn engine(&self) -> &MigrationEngine {
        &self.engine
    }

    pub fn backups(&self) -> &BackupRestoreManager {
        &self.backups
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.read().state
    }

    /// The open handle, if any
    pub fn handle(&self) -> Option<Arc<StoreHandle>> {
        self.inner.read().handle.clone()
    }

    /// The most recently recorded configuration
    pub fn config(&self) -> Option<StoreConfig> {
        self.inner.read().config.clone()
    }

    /// File a configuration maps to inside the data directory
    pub fn database_path(&self, config: &StoreConfig) -> PathBuf {
        self.data_dir.join(config.database_name())
    }

    /// Open the store, or return the already open handle
    pub fn open(&self, config: StoreConfig) -> StoreResult<Arc<StoreHandle>> {
        {
            let inner = self.inner.read();
            if let Some(handle) = &inner.handle {
                return Self::reuse(handle, &config);
            }
        }

        let mut inner = self.inner.write();
        // another caller may have opened it while we waited
        if let Some(handle) = &inner.handle {
            return Self::reuse(handle, &config);
        }

        let handle = Arc::new(self.open_store(&config)?);
        inner.handle = Some(Arc::clone(&handle));
        inner.config = Some(config);
        inner.state = LifecycleState::Open;
        Ok(handle)
    }

    /// Open with the configuration recorded by `set_config` or a previous `open`
    pub fn open_configured(&self) -> StoreResult<Arc<StoreHandle>> {
        let config = self.config().ok_or(LifecycleError::NoConfig)?;
        self.open(config)
    }

    /// Close the open store; its handle becomes unusable
    pub fn close(&self) -> StoreResult<()> {
        let mut inner = self.inner.write();
        let handle = inner
            .handle
            .take()
            .ok_or_else(|| not_open("close", inner.state))?;
        inner.state = LifecycleState::Closed;
        handle.shutdown()
    }

    /// Record a configuration for the next open
    pub fn set_config(&self, config: StoreConfig) -> ConfigChange {
        let mut inner = self.inner.write();
        inner.config = Some(config);
        if inner.state == LifecycleState::Open {
            info!("store is open; new configuration applies on next open");
            ConfigChange::Deferred
        } else {
            ConfigChange::Recorded
        }
    }

    /// Checkpoint, vacuum and optimize the open store
    pub fn cleanup(&self) -> StoreResult<CleanupReport> {
        // the read lock keeps close/restore out while maintenance runs
        let inner = self.inner.read();
        let handle = inner
            .handle
            .as_ref()
            .ok_or_else(|| not_open("cleanup", inner.state))?;

        handle.with_db(|db| {
            let size_before = store_size(db.path());
            db.checkpoint()?;
            db.conn.execute_batch("VACUUM")?;
            db.conn.execute_batch("PRAGMA optimize")?;
            db.checkpoint()?;
            let report = CleanupReport {
                size_before,
                size_after: store_size(db.path()),
            };
            info!(
                size_before = report.size_before,
                size_after = report.size_after,
                "store cleanup complete"
            );
            Ok(report)
        })
    }

    /// Replace the open store's contents with `source` and reopen it
    ///
    /// `handle` must be the currently open handle and its file is the one
    /// replaced. A recorded config is used for the reopen only when it names
    /// the same file. The source is checked before anything is closed, so an
    /// invalid or incompatible source leaves the store open and untouched; if
    /// the restored file then fails to open, the previous contents are put
    /// back and reopened.
    pub fn restore(&self, handle: &StoreHandle, source: &Path) -> StoreResult<Arc<StoreHandle>> {
        let mut inner = self.inner.write();
        let current = inner
            .handle
            .clone()
            .ok_or_else(|| not_open("restore", inner.state))?;
        if !std::ptr::eq(Arc::as_ptr(&current), handle) {
            return Err(LifecycleError::StaleHandle.into());
        }

        let previous = current.config().clone();
        let config = match &inner.config {
            Some(recorded) if recorded.database_name() == previous.database_name() => {
                recorded.clone()
            }
            _ => previous.clone(),
        };
        self.check_restorable(source, &config)?;

        let target = current.path().to_path_buf();
        let rollback_dir = tempfile::Builder::new()
            .prefix(".restore")
            .tempdir_in(&self.data_dir)
            .map_err(|source| RestoreError::Io {
                path: self.data_dir.clone(),
                source,
            })?;
        let rollback = rollback_dir.path().join(previous.database_name());
        current.with_db(|db| Ok(backup_conn(db, &rollback)?))?;

        inner.handle = None;
        inner.state = LifecycleState::Closed;
        current.shutdown()?;
        drop(current);

        if let Err(e) = BackupRestoreManager::restore_file(&target, source) {
            error!("restore failed, reopening previous store: {}", e);
            self.reopen(&mut inner, &previous);
            return Err(e.into());
        }

        match self.open_store(&config) {
            Ok(reopened) => {
                let reopened = Arc::new(reopened);
                inner.handle = Some(Arc::clone(&reopened));
                inner.state = LifecycleState::Open;
                info!(source = %source.display(), "store restored");
                Ok(reopened)
            }
            Err(e) => {
                error!("restored store failed to open, putting back previous contents: {}", e);
                match BackupRestoreManager::restore_file(&target, &rollback) {
                    Ok(()) => self.reopen(&mut inner, &previous),
                    Err(rollback_err) => {
                        error!("failed to put back previous store: {}", rollback_err)
                    }
                }
                Err(e)
            }
        }
    }

    /// Reject sources the configured store could not open
    fn check_restorable(&self, source: &Path, config: &StoreConfig) -> StoreResult<()> {
        let version = BackupRestoreManager::store_file_version(source)?;
        let incompatible = |reason: String| RestoreError::Incompatible {
            path: source.to_path_buf(),
            reason,
        };

        if version == 0 {
            return Err(incompatible("source has no schema version".to_string()).into());
        }
        let target = config.schema_version();
        if version > target {
            return Err(incompatible(format!(
                "source is at v{}, newer than the configured v{}",
                version, target
            ))
            .into());
        }
        if version < target && !self.engine.tolerates_missing_steps() {
            let missing = ((version + 1)..=target).find(|v| self.engine.step(*v).is_none());
            if let Some(missing) = missing {
                return Err(incompatible(format!(
                    "no migration step registered for v{}",
                    missing
                ))
                .into());
            }
        }
        Ok(())
    }

    /// Open `config` into `inner` after a failed restore
    fn reopen(&self, inner: &mut Inner, config: &StoreConfig) {
        match self.open_store(config) {
            Ok(reopened) => {
                inner.handle = Some(Arc::new(reopened));
                inner.state = LifecycleState::Open;
            }
            Err(e) => error!("failed to reopen previous store: {}", e),
        }
    }

    fn reuse(handle: &Arc<StoreHandle>, config: &StoreConfig) -> StoreResult<Arc<StoreHandle>> {
        if handle.config() == config {
            Ok(Arc::clone(handle))
        } else {
            Err(LifecycleError::AlreadyOpen.into())
        }
    }

    /// Open the file, bring its schema to the configured version, apply pragmas
    fn open_store(&self, config: &StoreConfig) -> StoreResult<StoreHandle> {
        let path = self.database_path(config);
        let open_err = |reason: String| LifecycleError::Open {
            path: path.clone(),
            reason,
        };

        fs::create_dir_all(&self.data_dir).map_err(|e| open_err(e.to_string()))?;
        let db = DatabaseConn::open(&path).map_err(|e| open_err(e.to_string()))?;

        let target = config.schema_version();
        let current = SchemaManager::new(&db.conn).schema_version()?;

        if current == 0 {
            if !user_tables(&db.conn)?.is_empty() {
                return Err(LifecycleError::Unversioned { path }.into());
            }
            if target != self.catalog.version() {
                return Err(LifecycleError::CatalogMismatch {
                    catalog_version: self.catalog.version(),
                    requested: target,
                }
                .into());
            }
            let tx = db.transaction()?;
            SchemaManager::new(&tx).initialize(&self.catalog)?;
            tx.commit()?;
            info!(version = target, path = %path.display(), "initialized new store");
        } else if current < target {
            let policy = self.backups.policy();
            if policy.before_migrate {
                let snapshot = self.backups.snapshot_conn(&db)?;
                info!(path = %snapshot.path.display(), "snapshot taken before migration");
                let removed = self
                    .backups
                    .prune(config.database_name(), policy.retention)?;
                if !removed.is_empty() {
                    debug!("pruned {} old snapshot(s)", removed.len());
                }
            }
            self.engine
                .migrate_conn(&db, current, target, config.enable_foreign_keys())?;
        } else if current > target {
            warn!(
                database_version = current,
                required_version = target,
                "refusing to open a newer store"
            );
            return Err(LifecycleError::Downgrade {
                database_version: current,
                required_version: target,
            }
            .into());
        }

        if target == self.catalog.version() {
            let missing = SchemaManager::new(&db.conn).verify(&self.catalog)?;
            if !missing.is_empty() {
                return Err(LifecycleError::SchemaDrift { missing }.into());
            }
        }

        db.apply_config(config)?;
        info!(
            path = %path.display(),
            version = target,
            pool = config.max_pool_size(),
            "store opened"
        );
        Ok(StoreHandle::new(db, config.clone(), target))
    }
}

fn not_open(operation: &'static str, state: LifecycleState) -> StoreError {
    LifecycleError::NotOpen {
        operation,
        state: state.as_str(),
    }
    .into()
}

/// Size of the main file plus its WAL
fn store_size(path: &Path) -> u64 {
    let mut wal = path.as_os_str().to_os_string();
    wal.push("-wal");
    [path.to_path_buf(), PathBuf::from(wal)]
        .iter()
        .filter_map(|p| fs::metadata(p).ok())
        .map(|m| m.len())
        .sum()
}
