//! Error types for storekeep
//!
//! Every public operation returns one of a closed set of error kinds:
//!
//! - [`ValidationError`]: a configuration, catalog, or migration registration was rejected
//! - [`MigrationError`]: a migration step failed; carries the failing version and operation
//! - [`BackupError`] / [`RestoreError`]: file-level copy failures or malformed store files
//! - [`LifecycleError`]: an operation was invoked in the wrong lifecycle state
//!
//! [`StoreError`] unifies them for callers that only need to propagate.

use std::path::PathBuf;

/// Result alias used across the engine
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Migration(#[from] MigrationError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// SQLite failure outside of a migration step (pragmas, maintenance, queries)
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("database name cannot be empty")]
    EmptyDatabaseName,

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("invalid schema catalog: {0}")]
    Catalog(String),

    #[error("migration step for version {version} is already registered")]
    DuplicateStep { version: u32 },

    #[error("migration steps must target version 2 or above, got {version}")]
    InvalidStepVersion { version: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("invalid migration range: v{from} -> v{to} (target must be newer)")]
    InvalidRange { from: u32, to: u32 },

    #[error("store is at v{actual}, migration was planned from v{expected}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("no migration step registered for version {version}")]
    MissingStep { version: u32 },

    #[error("migration to v{version} failed at `{operation}`: {source}")]
    Operation {
        version: u32,
        operation: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("migration to v{version} failed at `{operation}`: column already exists")]
    ColumnExists { version: u32, operation: String },

    #[error("migration to v{version} failed at `{operation}`: table does not exist")]
    TableMissing { version: u32, operation: String },

    #[error("migration to v{version} left {count} foreign key violation(s)")]
    ForeignKeyViolation { version: u32, count: usize },
}

impl MigrationError {
    /// Version whose step failed, if the failure happened inside a step
    pub fn version(&self) -> Option<u32> {
        match self {
            MigrationError::InvalidRange { .. } | MigrationError::VersionMismatch { .. } => None,
            MigrationError::MissingStep { version }
            | MigrationError::Operation { version, .. }
            | MigrationError::ColumnExists { version, .. }
            | MigrationError::TableMissing { version, .. }
            | MigrationError::ForeignKeyViolation { version, .. } => Some(*version),
        }
    }

    /// Description of the operation that failed, if any
    pub fn operation(&self) -> Option<&str> {
        match self {
            MigrationError::Operation { operation, .. }
            | MigrationError::ColumnExists { operation, .. }
            | MigrationError::TableMissing { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("store file does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("backup of an in-memory store is not possible")]
    InMemory,

    #[error("WAL checkpoint incomplete ({remaining} frame(s) left); quiesce writers and retry")]
    Checkpoint { remaining: i64 },

    #[error("failed to write backup {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error during backup: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    #[error("restore source does not exist: {0}")]
    SourceMissing(PathBuf),

    #[error("restore source is not a valid store file ({path}): {reason}")]
    Malformed { path: PathBuf, reason: String },

    #[error("restore source {path} cannot be opened by this store: {reason}")]
    Incompatible { path: PathBuf, reason: String },

    #[error("failed to restore from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("operation `{operation}` requires an open store (state: {state})")]
    NotOpen {
        operation: &'static str,
        state: &'static str,
    },

    #[error("store is already open with a different configuration; close it first")]
    AlreadyOpen,

    #[error("store handle has been closed")]
    HandleClosed,

    #[error("handle does not belong to the currently open store")]
    StaleHandle,

    #[error("no configuration recorded; call open(config) or set_config first")]
    NoConfig,

    #[error("failed to open store at {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("store version v{database_version} is newer than the supported v{required_version}")]
    Downgrade {
        database_version: u32,
        required_version: u32,
    },

    #[error("store at {path} has tables but no schema version")]
    Unversioned { path: PathBuf },

    #[error("fresh stores are created at catalog v{catalog_version}, config asks for v{requested}")]
    CatalogMismatch { catalog_version: u32, requested: u32 },

    #[error("store schema does not match the catalog; missing: {}", .missing.join(", "))]
    SchemaDrift { missing: Vec<String> },
}
