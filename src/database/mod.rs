//! Database module
//!
//! This module provides the store engine, organized into:
//!
//! - **core**: SQLite connections, the reader pool, schema catalog and status checks
//! - **migration**: ordered, versioned migration steps
//! - **backup**: atomic file-level backup, snapshot and restore
//! - **lifecycle**: the facade that owns the single open store
//! - **catalog**: the built-in schema and its migrations
//!
//! # Architecture
//!
//! ```text
//! database/
//! ├── core/           # Foundation
//! │   ├── connection  # DatabaseConn wrapper, ReaderPool
//! │   └── schema      # TableSpec/SchemaCatalog, SchemaManager
//! │
//! ├── migration/      # MigrationEngine, MigrationStep, MigrationOp
//! ├── backup          # BackupRestoreManager
//! ├── lifecycle       # StoreLifecycle, StoreHandle
//! └── catalog         # built-in catalog (v4) and steps 2..=4
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use storekeep::config::StoreConfig;
//! use storekeep::database::{builtin_catalog, builtin_migrations, StoreLifecycle};
//!
//! let lifecycle = StoreLifecycle::new("~/.storekeep", builtin_catalog()?, builtin_migrations()?);
//! let config = StoreConfig::builder().schema_version(4).build()?;
//!
//! let store = lifecycle.open(config)?;
//! let rows: i64 = store.with_reader(|conn| {
//!     conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))
//! })?;
//!
//! lifecycle.backups().snapshot(&store)?;
//! lifecycle.close()?;
//! ```

pub mod backup;
pub mod catalog;
pub mod core;
pub mod lifecycle;
pub mod migration;

pub use backup::{BackupInfo, BackupPolicy, BackupRestoreManager};
pub use catalog::{
    builtin_base_catalog, builtin_catalog, builtin_migrations, BUILTIN_SCHEMA_VERSION,
};
pub use core::{
    ColumnSpec, ColumnType, DatabaseConn, IndexSpec, SchemaCatalog, SchemaManager, SchemaStatus,
    TableSpec,
};
pub use lifecycle::{CleanupReport, ConfigChange, LifecycleState, StoreHandle, StoreLifecycle};
pub use migration::{MigrationEngine, MigrationOp, MigrationReport, MigrationStep};
