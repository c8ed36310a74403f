//! Structural operations a migration step is made of

use crate::database::core::{
    quote_ident, table_columns, table_exists, ColumnSpec, IndexSpec, TableSpec,
};
use crate::error::{MigrationError, ValidationError};
use rusqlite::Connection;
use std::fmt;
use tracing::debug;

/// One schema change inside a migration step
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationOp {
    /// Create a table together with its indexes
    CreateTable(TableSpec),

    /// Drop a table if it exists
    DropTable(String),

    /// Append a column to an existing table
    AddColumn { table: String, column: ColumnSpec },

    /// Create an index; existing indexes of the same name are left alone
    CreateIndex(IndexSpec),

    /// Replace a table by `spec`, copying the columns both shapes share
    RebuildTable { table: String, spec: TableSpec },

    /// Raw SQL, for data fixes that have no structural equivalent
    Execute(String),
}

impl MigrationOp {
    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MigrationOp::CreateTable(spec) | MigrationOp::RebuildTable { spec, .. } => {
                spec.validate()
            }
            MigrationOp::AddColumn { table, column } => {
                if table.trim().is_empty() || column.name.trim().is_empty() {
                    return Err(ValidationError::Catalog(
                        "add column needs a table and a column name".to_string(),
                    ));
                }
                column.validate(table)?;
                if !column.nullable && column.default.is_none() {
                    return Err(ValidationError::Catalog(format!(
                        "column {}.{} is NOT NULL without a default and cannot be added",
                        table, column.name
                    )));
                }
                Ok(())
            }
            MigrationOp::CreateIndex(index) => {
                if index.columns.is_empty() {
                    return Err(ValidationError::Catalog(format!(
                        "index {} has no columns",
                        index.name
                    )));
                }
                Ok(())
            }
            MigrationOp::DropTable(table) => {
                if table.trim().is_empty() {
                    return Err(ValidationError::Catalog(
                        "drop table needs a table name".to_string(),
                    ));
                }
                Ok(())
            }
            MigrationOp::Execute(sql) => {
                if sql.trim().is_empty() {
                    return Err(ValidationError::Catalog(
                        "execute needs a SQL statement".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Apply the operation on `conn`, which must be inside the step's transaction
    pub(crate) fn apply(&self, conn: &Connection, version: u32) -> Result<(), MigrationError> {
        let fail = |source: rusqlite::Error| MigrationError::Operation {
            version,
            operation: self.to_string(),
            source,
        };

        match self {
            MigrationOp::CreateTable(spec) => {
                conn.execute(&spec.create_sql(), []).map_err(fail)?;
                for index in &spec.indexes {
                    conn.execute(&index.create_sql(), []).map_err(fail)?;
                }
            }
            MigrationOp::DropTable(table) => {
                conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])
                    .map_err(fail)?;
            }
            MigrationOp::AddColumn { table, column } => {
                if !table_exists(conn, table).map_err(fail)? {
                    return Err(MigrationError::TableMissing {
                        version,
                        operation: self.to_string(),
                    });
                }
                if table_columns(conn, table)
                    .map_err(fail)?
                    .iter()
                    .any(|c| c == &column.name)
                {
                    return Err(MigrationError::ColumnExists {
                        version,
                        operation: self.to_string(),
                    });
                }
                conn.execute(
                    &format!(
                        "ALTER TABLE {} ADD COLUMN {}",
                        quote_ident(table),
                        column.definition()
                    ),
                    [],
                )
                .map_err(fail)?;
            }
            MigrationOp::CreateIndex(index) => {
                conn.execute(&index.create_sql(), []).map_err(fail)?;
            }
            MigrationOp::RebuildTable { table, spec } => {
                if !table_exists(conn, table).map_err(fail)? {
                    return Err(MigrationError::TableMissing {
                        version,
                        operation: self.to_string(),
                    });
                }
                // the final rename must leave other tables' references untouched
                conn.execute_batch("PRAGMA legacy_alter_table=ON")
                    .map_err(fail)?;
                let rebuilt = rebuild_table(conn, table, spec, version);
                let reset = conn.execute_batch("PRAGMA legacy_alter_table=OFF");
                rebuilt.map_err(fail)?;
                reset.map_err(fail)?;
            }
            MigrationOp::Execute(sql) => {
                conn.execute_batch(sql).map_err(fail)?;
            }
        }

        debug!(version, operation = %self, "applied migration operation");
        Ok(())
    }
}

/// Create the new shape under a transient name, copy shared columns, drop the
/// old table, rename the new one into place, recreate indexes
///
/// The old table is never renamed, so references held by other tables keep
/// pointing at `table`.
fn rebuild_table(
    conn: &Connection,
    table: &str,
    spec: &TableSpec,
    version: u32,
) -> rusqlite::Result<()> {
    let transient = format!("_{}_rebuild_v{}", spec.name, version);

    conn.execute(&spec.create_sql_named(&transient), [])?;

    let old_columns = table_columns(conn, table)?;
    let shared: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| old_columns.contains(&c.name))
        .map(|c| quote_ident(&c.name))
        .collect();
    if !shared.is_empty() {
        let columns = shared.join(", ");
        conn.execute(
            &format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                quote_ident(&transient),
                columns,
                columns,
                quote_ident(table)
            ),
            [],
        )?;
    }

    conn.execute(&format!("DROP TABLE {}", quote_ident(table)), [])?;
    conn.execute(
        &format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&transient),
            quote_ident(&spec.name)
        ),
        [],
    )?;
    for index in &spec.indexes {
        conn.execute(&index.create_sql(), [])?;
    }
    Ok(())
}

impl fmt::Display for MigrationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationOp::CreateTable(spec) => write!(f, "create table {}", spec.name),
            MigrationOp::DropTable(table) => write!(f, "drop table {}", table),
            MigrationOp::AddColumn { table, column } => {
                write!(f, "add column {}.{}", table, column.name)
            }
            MigrationOp::CreateIndex(index) => {
                write!(f, "create index {} on {}", index.name, index.table)
            }
            MigrationOp::RebuildTable { table, .. } => write!(f, "rebuild table {}", table),
            MigrationOp::Execute(sql) => {
                let first = sql.lines().next().unwrap_or_default().trim();
                if first.len() > 60 {
                    let cut = first
                        .char_indices()
                        .map(|(i, _)| i)
                        .take_while(|i| *i <= 60)
                        .last()
                        .unwrap_or(0);
                    write!(f, "execute `{}...`", &first[..cut])
                } else {
                    write!(f, "execute `{}`", first)
                }
            }
        }
    }
}
