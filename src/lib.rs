#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Storekeep - a versioned SQLite store engine
//!
//! Storekeep manages the lifecycle of one embedded SQLite store: it creates the
//! store from a declarative schema catalog, upgrades it through ordered
//! migration steps, takes atomic backups, restores from them, and hands out a
//! single shared handle with a bounded pool of read-only connections.
//!
//! # Feature Flags
//!
//! | Feature | Description | Key Dependencies |
//! |---------|-------------|------------------|
//! | (none)  | The engine library | `rusqlite`, `parking_lot`, `tempfile` |
//! | `cli`   | The `storekeep` binary (default) | `clap`, `tabled`, `tracing-subscriber` |
//!
//! ```toml
//! # library only
//! storekeep = { version = "0.1", default-features = false }
//! ```
//!
//! # Architecture
//!
//! - **[`database`]**: the engine
//!   - `core`: connections, reader pool, schema catalog and status checks
//!   - `migration`: versioned migration steps
//!   - `backup`: backup, snapshot, restore
//!   - `lifecycle`: the single-store facade
//!   - `catalog`: the built-in schema
//! - **[`config`]**: store configuration and the settings file
//! - **[`error`]**: typed errors
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use storekeep::{MigrationEngine, MigrationStep, SchemaCatalog, StoreConfig, StoreLifecycle};
//! use storekeep::database::{ColumnSpec, TableSpec};
//!
//! let people = TableSpec::new("people")
//!     .column(ColumnSpec::integer("id").not_null())
//!     .column(ColumnSpec::text("name"))
//!     .column(ColumnSpec::integer("age").default_value(0))
//!     .primary_key(&["id"]);
//! let catalog = SchemaCatalog::new(2, vec![people])?;
//!
//! let engine = MigrationEngine::new().with_step(
//!     MigrationStep::new(2).add_column("people", ColumnSpec::integer("age").default_value(0)),
//! )?;
//!
//! let lifecycle = StoreLifecycle::new("/var/lib/app", catalog, engine);
//! let store = lifecycle.open(StoreConfig::builder().schema_version(2).build()?)?;
//! store.with_conn(|conn| conn.execute("INSERT INTO people (id, name) VALUES (1, 'a')", []))?;
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod utils;

pub use config::{
    format_size, get_store_info, ConfigBuilder, StoreConfig, StoreInfo, StorekeepSettings,
    TableInfo,
};
pub use database::{
    BackupInfo, BackupPolicy, BackupRestoreManager, CleanupReport, ConfigChange, LifecycleState,
    MigrationEngine, MigrationReport, MigrationStep, SchemaCatalog, SchemaStatus, StoreHandle,
    StoreLifecycle,
};
pub use error::{
    BackupError, LifecycleError, MigrationError, RestoreError, StoreError, StoreResult,
    ValidationError,
};
pub use utils::OutputFormat;
