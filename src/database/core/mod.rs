//! Core database infrastructure
//!
//! This module provides the foundational database components used throughout storekeep:
//! - `DatabaseConn`: SQLite connection wrapper with config-driven tuning
//! - `ReaderPool`: bounded pool of read-only connections
//! - `SchemaCatalog` and friends: static description of one schema version
//! - `SchemaManager`: schema initialization, version stamping and status checks

mod connection;
mod schema;

pub use connection::{
    index_exists, quote_ident, table_columns, table_exists, user_tables, CheckpointResult,
    DatabaseConn, PooledReader, ReaderPool,
};
pub use schema::{
    sql_literal, ColumnSpec, ColumnType, IndexSpec, SchemaCatalog, SchemaManager, SchemaStatus,
    TableSpec,
};
