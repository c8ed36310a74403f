//! Database schema management
//!
//! This module provides the static description of a store's schema (tables,
//! columns, indexes) for one schema version, and the `SchemaManager` that
//! creates, inspects and version-stamps a store against that description.
//!
//! The persisted schema version lives in `PRAGMA user_version`.

use super::connection::{index_exists, quote_ident, table_columns, table_exists, user_tables};
use crate::error::ValidationError;
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;

/// Semantic type of a column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql())
    }
}

/// A column definition
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub default: Option<Value>,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        ColumnSpec {
            name: name.into(),
            column_type,
            nullable: true,
            default: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Real)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Blob)
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Reject columns that cannot be written as SQL
    pub fn validate(&self, table: &str) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::Catalog(format!(
                "table {} has a column with no name",
                table
            )));
        }
        if let Some(Value::Real(f)) = &self.default {
            if !f.is_finite() {
                return Err(ValidationError::Catalog(format!(
                    "column {}.{} has a non-finite default {}",
                    table, self.name, f
                )));
            }
        }
        Ok(())
    }

    /// Column definition as used inside `CREATE TABLE` / `ADD COLUMN`
    pub fn definition(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.column_type.sql());
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&sql_literal(default));
        }
        sql
    }
}

/// An index over one or more columns of a table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    /// Index named `idx_{table}_{columns}`
    pub fn new(table: impl Into<String>, columns: &[&str]) -> Self {
        let table = table.into();
        let name = format!("idx_{}_{}", table, columns.join("_"));
        IndexSpec {
            name,
            table,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// `CREATE INDEX IF NOT EXISTS` statement
    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
            columns.join(", ")
        )
    }
}

/// A table definition
#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub name: String,
    pub columns: Vec<ColumnSpec>,
    pub primary_key: Vec<String>,
    pub indexes: Vec<IndexSpec>,
}

impl TableSpec {
    pub fn new(name: impl Into<String>) -> Self {
        TableSpec {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            indexes: Vec::new(),
        }
    }

    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Add an index on this table's columns
    pub fn index(mut self, columns: &[&str]) -> Self {
        self.indexes.push(IndexSpec::new(self.name.clone(), columns));
        self
    }

    /// Add a fully specified index
    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_spec(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check the table's internal invariants
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::Catalog(msg));

        if self.name.trim().is_empty() {
            return invalid("table name cannot be empty".to_string());
        }
        if self.columns.is_empty() {
            return invalid(format!("table {} has no columns", self.name));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            column.validate(&self.name)?;
            if !seen.insert(column.name.as_str()) {
                return invalid(format!(
                    "table {} declares column {} twice",
                    self.name, column.name
                ));
            }
        }

        if self.primary_key.is_empty() {
            return invalid(format!("table {} has no primary key", self.name));
        }
        for key in &self.primary_key {
            if !self.has_column(key) {
                return invalid(format!(
                    "primary key column {} is not a column of table {}",
                    key, self.name
                ));
            }
        }

        for index in &self.indexes {
            if index.table != self.name {
                return invalid(format!(
                    "index {} belongs to table {}, not {}",
                    index.name, index.table, self.name
                ));
            }
            if index.columns.is_empty() {
                return invalid(format!("index {} has no columns", index.name));
            }
            for column in &index.columns {
                if !self.has_column(column) {
                    return invalid(format!(
                        "index {} targets unknown column {}.{}",
                        index.name, self.name, column
                    ));
                }
            }
        }

        Ok(())
    }

    /// `CREATE TABLE` statement (indexes not included)
    pub fn create_sql(&self) -> String {
        self.create_sql_named(&self.name)
    }

    /// `CREATE TABLE` statement for this shape under another table name
    pub(crate) fn create_sql_named(&self, name: &str) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(|c| c.definition()).collect();
        let keys: Vec<String> = self.primary_key.iter().map(|k| quote_ident(k)).collect();
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(name),
            parts.join(",\n    ")
        )
    }
}

/// The full schema for one schema version
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaCatalog {
    version: u32,
    tables: Vec<TableSpec>,
}

impl SchemaCatalog {
    pub fn new(version: u32, tables: Vec<TableSpec>) -> Result<Self, ValidationError> {
        if version == 0 {
            return Err(ValidationError::NotPositive {
                field: "catalog version",
            });
        }

        let mut table_names = HashSet::new();
        let mut index_names = HashSet::new();
        for table in &tables {
            table.validate()?;
            if !table_names.insert(table.name.as_str()) {
                return Err(ValidationError::Catalog(format!(
                    "table {} is declared twice",
                    table.name
                )));
            }
            for index in &table.indexes {
                if !index_names.insert(index.name.as_str()) {
                    return Err(ValidationError::Catalog(format!(
                        "index {} is declared twice",
                        index.name
                    )));
                }
            }
        }

        Ok(SchemaCatalog { version, tables })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn indexes(&self) -> impl Iterator<Item = &IndexSpec> {
        self.tables.iter().flat_map(|t| t.indexes.iter())
    }
}

/// Render a value as a SQL literal for `DEFAULT` clauses
pub fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format!("{:?}", f),
        Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
        Value::Blob(bytes) => {
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            format!("X'{}'", hex)
        }
    }
}

// =============================================================================
// Schema manager
// =============================================================================

/// Schema manager for a store connection
///
/// Handles schema initialization, version stamping, and status checks.
pub struct SchemaManager<'a> {
    conn: &'a Connection,
}

impl<'a> SchemaManager<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Create every table and index of the catalog and stamp its version
    pub fn initialize(&self, catalog: &SchemaCatalog) -> rusqlite::Result<()> {
        for table in catalog.tables() {
            self.conn.execute(&table.create_sql(), [])?;
            for index in &table.indexes {
                self.conn.execute(&index.create_sql(), [])?;
            }
        }
        self.set_schema_version(catalog.version())
    }

    /// Persisted schema version (0 for a fresh store)
    pub fn schema_version(&self) -> rusqlite::Result<u32> {
        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(u32::try_from(version).unwrap_or(0))
    }

    pub fn set_schema_version(&self, version: u32) -> rusqlite::Result<()> {
        self.conn
            .execute_batch(&format!("PRAGMA user_version = {}", version))
    }

    /// Compare the store against `catalog`, targeting version `target`
    ///
    /// Integrity is only verified when the target is the catalog's own version,
    /// since the catalog does not describe older shapes.
    pub fn check_status(
        &self,
        catalog: &SchemaCatalog,
        target: u32,
    ) -> rusqlite::Result<SchemaStatus> {
        let current = self.schema_version()?;

        if current == 0 {
            return if user_tables(self.conn)?.is_empty() {
                Ok(SchemaStatus::NotInitialized)
            } else {
                Ok(SchemaStatus::Unversioned)
            };
        }

        if current == target {
            if target != catalog.version() {
                return Ok(SchemaStatus::Current);
            }
            let missing = self.verify(catalog)?;
            if missing.is_empty() {
                Ok(SchemaStatus::Current)
            } else {
                Ok(SchemaStatus::Corrupted { missing })
            }
        } else if current < target {
            Ok(SchemaStatus::NeedsMigration {
                from: current,
                to: target,
            })
        } else {
            Ok(SchemaStatus::Incompatible {
                database_version: current,
                required_version: target,
            })
        }
    }

    /// List catalog objects missing from the store
    pub fn verify(&self, catalog: &SchemaCatalog) -> rusqlite::Result<Vec<String>> {
        let mut missing = Vec::new();

        for table in catalog.tables() {
            if !table_exists(self.conn, &table.name)? {
                missing.push(format!("table {}", table.name));
                continue;
            }
            let columns = table_columns(self.conn, &table.name)?;
            for column in &table.columns {
                if !columns.contains(&column.name) {
                    missing.push(format!("column {}.{}", table.name, column.name));
                }
            }
            for index in &table.indexes {
                if !index_exists(self.conn, &index.name)? {
                    missing.push(format!("index {}", index.name));
                }
            }
        }

        Ok(missing)
    }
}

/// Status of the store schema relative to a target version
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SchemaStatus {
    /// Store is empty and unversioned
    NotInitialized,

    /// Store has tables but `user_version` was never stamped
    Unversioned,

    /// Schema version matches and every catalog object exists
    Current,

    /// Schema needs migration from an older version
    NeedsMigration { from: u32, to: u32 },

    /// Store is from a newer version (downgrade refused)
    Incompatible {
        database_version: u32,
        required_version: u32,
    },

    /// Version matches but catalog objects are missing
    Corrupted { missing: Vec<String> },
}

impl fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaStatus::NotInitialized => write!(f, "not initialized"),
            SchemaStatus::Unversioned => write!(f, "unversioned"),
            SchemaStatus::Current => write!(f, "current"),
            SchemaStatus::NeedsMigration { from, to } => {
                write!(f, "needs migration (v{} -> v{})", from, to)
            }
            SchemaStatus::Incompatible {
                database_version,
                required_version,
            } => write!(
                f,
                "incompatible (store v{}, supported v{})",
                database_version, required_version
            ),
            SchemaStatus::Corrupted { missing } => {
                write!(f, "corrupted (missing {})", missing.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people_table() -> TableSpec {
        TableSpec::new("people")
            .column(ColumnSpec::integer("id").not_null())
            .column(ColumnSpec::text("name").not_null())
            .column(ColumnSpec::integer("age").default_value(0))
            .primary_key(&["id"])
            .index(&["name"])
    }

    fn create_test_catalog() -> SchemaCatalog {
        SchemaCatalog::new(
            2,
            vec![
                people_table(),
                TableSpec::new("tags")
                    .column(ColumnSpec::integer("person_id").not_null())
                    .column(ColumnSpec::text("tag").not_null())
                    .primary_key(&["person_id", "tag"])
                    .with_index(IndexSpec::new("tags", &["tag"]).unique().named("uq_tag")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_column_definition() {
        assert_eq!(
            ColumnSpec::integer("age").not_null().default_value(0).definition(),
            "\"age\" INTEGER NOT NULL DEFAULT 0"
        );
        assert_eq!(
            ColumnSpec::text("note").default_value("it's".to_string()).definition(),
            "\"note\" TEXT DEFAULT 'it''s'"
        );
        assert_eq!(ColumnSpec::blob("data").definition(), "\"data\" BLOB");
    }

    #[test]
    fn test_sql_literal() {
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&Value::Real(1.5)), "1.5");
        assert_eq!(sql_literal(&Value::Blob(vec![0xde, 0xad])), "X'dead'");
    }

    #[test]
    fn test_index_sql() {
        let index = IndexSpec::new("people", &["name", "age"]).unique();
        assert_eq!(index.name, "idx_people_name_age");
        assert_eq!(
            index.create_sql(),
            "CREATE UNIQUE INDEX IF NOT EXISTS \"idx_people_name_age\" ON \"people\" (\"name\", \"age\")"
        );
    }

    #[test]
    fn test_catalog_validation() {
        // primary key must be a column
        let bad = TableSpec::new("t")
            .column(ColumnSpec::integer("id"))
            .primary_key(&["missing"]);
        assert!(matches!(
            SchemaCatalog::new(1, vec![bad]),
            Err(ValidationError::Catalog(_))
        ));

        // index columns must exist
        let bad = TableSpec::new("t")
            .column(ColumnSpec::integer("id"))
            .primary_key(&["id"])
            .index(&["nope"]);
        assert!(SchemaCatalog::new(1, vec![bad]).is_err());

        // duplicate table names
        assert!(SchemaCatalog::new(1, vec![people_table(), people_table()]).is_err());

        // duplicate columns
        let bad = TableSpec::new("t")
            .column(ColumnSpec::integer("id"))
            .column(ColumnSpec::text("id"))
            .primary_key(&["id"]);
        assert!(SchemaCatalog::new(1, vec![bad]).is_err());

        // index attached to the wrong table
        let bad = TableSpec::new("t")
            .column(ColumnSpec::integer("id"))
            .primary_key(&["id"])
            .with_index(IndexSpec::new("other", &["id"]));
        assert!(SchemaCatalog::new(1, vec![bad]).is_err());

        // version 0
        assert!(SchemaCatalog::new(0, vec![people_table()]).is_err());
    }

    #[test]
    fn test_non_finite_default_rejected() {
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let bad = TableSpec::new("t")
                .column(ColumnSpec::integer("id"))
                .column(ColumnSpec::real("score").default_value(value))
                .primary_key(&["id"]);
            assert!(matches!(
                SchemaCatalog::new(1, vec![bad]),
                Err(ValidationError::Catalog(_))
            ));
        }

        let ok = ColumnSpec::real("score").default_value(0.5);
        assert!(ok.validate("t").is_ok());
    }

    #[test]
    fn test_schema_not_initialized() {
        let conn = Connection::open_in_memory().unwrap();
        let catalog = create_test_catalog();
        let manager = SchemaManager::new(&conn);

        assert_eq!(
            manager.check_status(&catalog, 2).unwrap(),
            SchemaStatus::NotInitialized
        );
    }

    #[test]
    fn test_schema_initialize() {
        let conn = Connection::open_in_memory().unwrap();
        let catalog = create_test_catalog();
        let manager = SchemaManager::new(&conn);

        manager.initialize(&catalog).unwrap();

        assert_eq!(manager.schema_version().unwrap(), 2);
        assert_eq!(
            manager.check_status(&catalog, 2).unwrap(),
            SchemaStatus::Current
        );
        assert!(manager.verify(&catalog).unwrap().is_empty());
    }

    #[test]
    fn test_schema_status_versions() {
        let conn = Connection::open_in_memory().unwrap();
        let catalog = create_test_catalog();
        let manager = SchemaManager::new(&conn);
        manager.initialize(&catalog).unwrap();

        assert_eq!(
            manager.check_status(&catalog, 3).unwrap(),
            SchemaStatus::NeedsMigration { from: 2, to: 3 }
        );
        assert_eq!(
            manager.check_status(&catalog, 1).unwrap(),
            SchemaStatus::Incompatible {
                database_version: 2,
                required_version: 1
            }
        );
    }

    #[test]
    fn test_schema_unversioned() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE legacy (id INTEGER)").unwrap();
        let manager = SchemaManager::new(&conn);

        assert_eq!(
            manager.check_status(&create_test_catalog(), 2).unwrap(),
            SchemaStatus::Unversioned
        );
    }

    #[test]
    fn test_schema_corrupted() {
        let conn = Connection::open_in_memory().unwrap();
        let catalog = create_test_catalog();
        let manager = SchemaManager::new(&conn);
        manager.initialize(&catalog).unwrap();

        conn.execute_batch("DROP INDEX uq_tag").unwrap();
        assert_eq!(
            manager.check_status(&catalog, 2).unwrap(),
            SchemaStatus::Corrupted {
                missing: vec!["index uq_tag".to_string()]
            }
        );
    }

    #[test]
    fn test_initialized_defaults_apply() {
        let conn = Connection::open_in_memory().unwrap();
        SchemaManager::new(&conn)
            .initialize(&create_test_catalog())
            .unwrap();

        conn.execute("INSERT INTO people (id, name) VALUES (1, 'a')", [])
            .unwrap();
        let age: i64 = conn
            .query_row("SELECT age FROM people WHERE id = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(age, 0);
    }
}
