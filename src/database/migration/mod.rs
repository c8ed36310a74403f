//! Ordered, versioned schema migrations
//!
//! Each registered `MigrationStep` upgrades the store from `version - 1` to
//! `version`. Steps run in ascending order, one transaction per step, and the
//! transaction also stamps `PRAGMA user_version`, so a failing step leaves the
//! store at the last version that completed.

mod ops;

pub use ops::MigrationOp;

use crate::database::core::{ColumnSpec, DatabaseConn, IndexSpec, SchemaManager, TableSpec};
use crate::database::lifecycle::StoreHandle;
use crate::error::{MigrationError, StoreResult, ValidationError};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Ordered operations that move the store to `version`
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStep {
    version: u32,
    ops: Vec<MigrationOp>,
}

impl MigrationStep {
    pub fn new(version: u32) -> Self {
        MigrationStep {
            version,
            ops: Vec::new(),
        }
    }

    /// Declare that `version` changes nothing structurally
    pub fn noop(version: u32) -> Self {
        Self::new(version)
    }

    pub fn op(mut self, op: MigrationOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn create_table(self, spec: TableSpec) -> Self {
        self.op(MigrationOp::CreateTable(spec))
    }

    pub fn drop_table(self, table: impl Into<String>) -> Self {
        self.op(MigrationOp::DropTable(table.into()))
    }

    pub fn add_column(self, table: impl Into<String>, column: ColumnSpec) -> Self {
        self.op(MigrationOp::AddColumn {
            table: table.into(),
            column,
        })
    }

    pub fn create_index(self, index: IndexSpec) -> Self {
        self.op(MigrationOp::CreateIndex(index))
    }

    pub fn rebuild_table(self, table: impl Into<String>, spec: TableSpec) -> Self {
        self.op(MigrationOp::RebuildTable {
            table: table.into(),
            spec,
        })
    }

    pub fn execute(self, sql: impl Into<String>) -> Self {
        self.op(MigrationOp::Execute(sql.into()))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn ops(&self) -> &[MigrationOp] {
        &self.ops
    }

    pub fn is_noop(&self) -> bool {
        self.ops.is_empty()
    }
}

/// What a `migrate` call did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    /// Versions whose registered step ran (explicit no-ops included)
    pub applied: Vec<u32>,
    /// Versions with no registered step, passed over as no-ops
    pub skipped: Vec<u32>,
}

/// Registry of migration steps
#[derive(Debug, Clone, Default)]
pub struct MigrationEngine {
    steps: BTreeMap<u32, MigrationStep>,
    tolerate_missing: bool,
}

impl MigrationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the step for its version
    pub fn register(&mut self, step: MigrationStep) -> Result<&mut Self, ValidationError> {
        if step.version < 2 {
            return Err(ValidationError::InvalidStepVersion {
                version: step.version,
            });
        }
        if self.steps.contains_key(&step.version) {
            return Err(ValidationError::DuplicateStep {
                version: step.version,
            });
        }
        for op in &step.ops {
            op.validate()?;
        }
        self.steps.insert(step.version, step);
        Ok(self)
    }

    /// Builder form of [`MigrationEngine::register`]
    pub fn with_step(mut self, step: MigrationStep) -> Result<Self, ValidationError> {
        self.register(step)?;
        Ok(self)
    }

    /// Treat versions with no registered step as no-ops instead of failing
    pub fn tolerate_missing_steps(mut self) -> Self {
        self.tolerate_missing = true;
        self
    }

    pub fn tolerates_missing_steps(&self) -> bool {
        self.tolerate_missing
    }

    pub fn step(&self, version: u32) -> Option<&MigrationStep> {
        self.steps.get(&version)
    }

    /// Highest version with a registered step
    pub fn latest_version(&self) -> Option<u32> {
        self.steps.keys().next_back().copied()
    }

    /// Upgrade the store behind `handle` from `old_version` to `new_version`
    ///
    /// The writer connection is held for the whole run, so no other write can
    /// interleave with the steps.
    pub fn migrate(
        &self,
        handle: &StoreHandle,
        old_version: u32,
        new_version: u32,
    ) -> StoreResult<MigrationReport> {
        let enforce_fk = handle.config().enable_foreign_keys();
        handle.with_db(|db| {
            let result = self.migrate_conn(db, old_version, new_version, enforce_fk);
            // keep the handle in step with whatever got committed
            if let Ok(version) = SchemaManager::new(&db.conn).schema_version() {
                handle.set_schema_version(version);
            }
            Ok(result?)
        })
    }

    pub(crate) fn migrate_conn(
        &self,
        db: &DatabaseConn,
        old_version: u32,
        new_version: u32,
        enforce_fk: bool,
    ) -> Result<MigrationReport, MigrationError> {
        if new_version <= old_version {
            return Err(MigrationError::InvalidRange {
                from: old_version,
                to: new_version,
            });
        }

        let begin = |source| MigrationError::Operation {
            version: old_version + 1,
            operation: "prepare migration".to_string(),
            source,
        };

        let actual = SchemaManager::new(&db.conn).schema_version().map_err(begin)?;
        if actual != old_version {
            return Err(MigrationError::VersionMismatch {
                expected: old_version,
                actual,
            });
        }

        // refuse before touching anything
        if !self.tolerate_missing {
            if let Some(version) =
                (old_version + 1..=new_version).find(|v| !self.steps.contains_key(v))
            {
                return Err(MigrationError::MissingStep { version });
            }
        }

        let fk_was_on = db.foreign_keys_enabled().map_err(begin)?;
        if fk_was_on {
            db.conn.execute_batch("PRAGMA foreign_keys=OFF").map_err(begin)?;
        }

        info!(
            from = old_version,
            to = new_version,
            path = %db.path().display(),
            "migrating store"
        );

        let mut report = MigrationReport {
            from: old_version,
            to: new_version,
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        let mut outcome = Ok(());
        for version in old_version + 1..=new_version {
            let step = self.steps.get(&version);
            if step.is_none() {
                warn!(version, "no migration step registered; treating as no-op");
            }
            outcome = apply_step(db, version, step, enforce_fk);
            if outcome.is_err() {
                break;
            }
            match step {
                Some(_) => report.applied.push(version),
                None => report.skipped.push(version),
            }
        }

        if fk_was_on {
            let restored = db.conn.execute_batch("PRAGMA foreign_keys=ON");
            if outcome.is_ok() {
                restored.map_err(|source| MigrationError::Operation {
                    version: new_version,
                    operation: "restore foreign keys".to_string(),
                    source,
                })?;
            }
        }

        outcome?;
        info!(
            from = old_version,
            to = new_version,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "migration complete"
        );
        Ok(report)
    }
}

fn apply_step(
    db: &DatabaseConn,
    version: u32,
    step: Option<&MigrationStep>,
    enforce_fk: bool,
) -> Result<(), MigrationError> {
    let fail = |operation: &str| {
        let operation = operation.to_string();
        move |source| MigrationError::Operation {
            version,
            operation,
            source,
        }
    };

    let tx = db.transaction().map_err(fail("begin transaction"))?;
    for op in step.map(|s| s.ops()).unwrap_or_default() {
        op.apply(&tx, version)?;
    }

    if enforce_fk {
        let violations = foreign_key_violations(&tx).map_err(fail("foreign key check"))?;
        if violations > 0 {
            return Err(MigrationError::ForeignKeyViolation {
                version,
                count: violations,
            });
        }
    }

    SchemaManager::new(&tx)
        .set_schema_version(version)
        .map_err(fail("stamp schema version"))?;
    tx.commit().map_err(fail("commit"))?;

    info!(version, "applied migration step");
    Ok(())
}

fn foreign_key_violations(conn: &rusqlite::Connection) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let mut rows = stmt.query([])?;
    let mut count = 0;
    while rows.next()?.is_some() {
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::core::{table_columns, table_exists};

    fn base_store() -> (tempfile::TempDir, DatabaseConn) {
        let dir = tempfile::tempdir().unwrap();
        let db = DatabaseConn::open(&dir.path().join("store.db")).unwrap();
        db.conn
            .execute_batch(
                "CREATE TABLE T (id INTEGER NOT NULL, name TEXT, PRIMARY KEY (id));
                 INSERT INTO T VALUES (1, 'a');
                 PRAGMA user_version = 1;",
            )
            .unwrap();
        (dir, db)
    }

    fn version(db: &DatabaseConn) -> u32 {
        SchemaManager::new(&db.conn).schema_version().unwrap()
    }

    fn add_age() -> MigrationStep {
        MigrationStep::new(2).add_column("T", ColumnSpec::integer("age").default_value(0))
    }

    fn add_email_index() -> MigrationStep {
        MigrationStep::new(3)
            .add_column("T", ColumnSpec::text("email"))
            .create_index(IndexSpec::new("T", &["email"]))
    }

    #[test]
    fn test_add_column_with_default() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new().with_step(add_age()).unwrap();

        let report = engine.migrate_conn(&db, 1, 2, false).unwrap();
        assert_eq!(report.applied, vec![2]);
        assert!(report.skipped.is_empty());
        assert_eq!(version(&db), 2);

        let row: (i64, String, i64) = db
            .conn
            .query_row("SELECT id, name, age FROM T", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .unwrap();
        assert_eq!(row, (1, "a".to_string(), 0));
    }

    #[test]
    fn test_migration_composes() {
        let engine = MigrationEngine::new()
            .with_step(add_age())
            .unwrap()
            .with_step(add_email_index())
            .unwrap();

        let (_a, stepwise) = base_store();
        engine.migrate_conn(&stepwise, 1, 2, false).unwrap();
        engine.migrate_conn(&stepwise, 2, 3, false).unwrap();

        let (_b, direct) = base_store();
        engine.migrate_conn(&direct, 1, 3, false).unwrap();

        assert_eq!(version(&stepwise), version(&direct));
        assert_eq!(
            table_columns(&stepwise.conn, "T").unwrap(),
            table_columns(&direct.conn, "T").unwrap()
        );
        let schema = |db: &DatabaseConn| -> Vec<String> {
            db.conn
                .prepare("SELECT sql FROM sqlite_master WHERE sql IS NOT NULL ORDER BY name")
                .unwrap()
                .query_map([], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap()
        };
        assert_eq!(schema(&stepwise), schema(&direct));
    }

    #[test]
    fn test_rebuild_preserves_primary_keys() {
        let (_dir, db) = base_store();
        db.conn
            .execute_batch("INSERT INTO T VALUES (7, 'g'), (42, 'z');")
            .unwrap();

        let spec = TableSpec::new("T")
            .column(ColumnSpec::integer("id").not_null())
            .column(ColumnSpec::text("name"))
            .column(ColumnSpec::text("path"))
            .primary_key(&["id"]);
        let engine = MigrationEngine::new()
            .with_step(MigrationStep::new(2).rebuild_table("T", spec))
            .unwrap();
        engine.migrate_conn(&db, 1, 2, true).unwrap();

        let ids: Vec<i64> = db
            .conn
            .prepare("SELECT id FROM T ORDER BY id")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        assert_eq!(ids, vec![1, 7, 42]);
    }

    #[test]
    fn test_failed_step_rolls_back_to_last_clean_version() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new()
            .with_step(add_age())
            .unwrap()
            .with_step(
                MigrationStep::new(3)
                    .create_table(
                        TableSpec::new("extra")
                            .column(ColumnSpec::integer("id"))
                            .primary_key(&["id"]),
                    )
                    // fails: already added in v2
                    .add_column("T", ColumnSpec::integer("age")),
            )
            .unwrap();

        let err = engine.migrate_conn(&db, 1, 3, false).unwrap_err();
        assert_eq!(err.version(), Some(3));
        assert_eq!(err.operation(), Some("add column T.age"));
        assert!(matches!(err, MigrationError::ColumnExists { .. }));

        assert_eq!(version(&db), 2);
        assert!(!table_exists(&db.conn, "extra").unwrap());
        assert!(table_columns(&db.conn, "T")
            .unwrap()
            .contains(&"age".to_string()));
    }

    #[test]
    fn test_missing_step_is_fatal_by_default() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new().with_step(add_email_index()).unwrap();

        let err = engine.migrate_conn(&db, 1, 3, false).unwrap_err();
        assert!(matches!(err, MigrationError::MissingStep { version: 2 }));
        // nothing applied
        assert_eq!(version(&db), 1);
    }

    #[test]
    fn test_missing_step_tolerated() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new()
            .with_step(add_email_index())
            .unwrap()
            .tolerate_missing_steps();

        let report = engine.migrate_conn(&db, 1, 3, false).unwrap();
        assert_eq!(report.skipped, vec![2]);
        assert_eq!(report.applied, vec![3]);
        assert_eq!(version(&db), 3);
    }

    #[test]
    fn test_explicit_noop_step() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new()
            .with_step(MigrationStep::noop(2))
            .unwrap()
            .with_step(add_email_index())
            .unwrap();

        let report = engine.migrate_conn(&db, 1, 3, false).unwrap();
        assert_eq!(report.applied, vec![2, 3]);
        assert!(engine.step(2).unwrap().is_noop());
    }

    #[test]
    fn test_invalid_range_and_version_mismatch() {
        let (_dir, db) = base_store();
        let engine = MigrationEngine::new().with_step(add_age()).unwrap();

        assert!(matches!(
            engine.migrate_conn(&db, 2, 2, false),
            Err(MigrationError::InvalidRange { from: 2, to: 2 })
        ));
        assert!(matches!(
            engine.migrate_conn(&db, 3, 2, false),
            Err(MigrationError::InvalidRange { .. })
        ));
        assert!(matches!(
            engine.migrate_conn(&db, 2, 3, false),
            Err(MigrationError::VersionMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_register_rejects_bad_steps() {
        let mut engine = MigrationEngine::new();
        engine.register(add_age()).unwrap();

        assert_eq!(
            engine.register(add_age()).unwrap_err(),
            ValidationError::DuplicateStep { version: 2 }
        );
        assert_eq!(
            engine.register(MigrationStep::noop(1)).unwrap_err(),
            ValidationError::InvalidStepVersion { version: 1 }
        );
        assert_eq!(
            engine.register(MigrationStep::noop(0)).unwrap_err(),
            ValidationError::InvalidStepVersion { version: 0 }
        );
        assert_eq!(engine.latest_version(), Some(2));
    }

    #[test]
    fn test_foreign_key_violation_fails_step() {
        let (_dir, db) = base_store();
        db.conn.execute_batch("PRAGMA foreign_keys=ON").unwrap();
        let engine = MigrationEngine::new()
            .with_step(MigrationStep::new(2).execute(
                "CREATE TABLE child (id INTEGER PRIMARY KEY, t_id INTEGER REFERENCES T(id));
                 INSERT INTO child VALUES (1, 999);",
            ))
            .unwrap();

        let err = engine.migrate_conn(&db, 1, 2, true).unwrap_err();
        assert!(matches!(
            err,
            MigrationError::ForeignKeyViolation {
                version: 2,
                count: 1
            }
        ));
        assert_eq!(version(&db), 1);
        assert!(!table_exists(&db.conn, "child").unwrap());
        // enforcement restored after the run
        assert!(db.foreign_keys_enabled().unwrap());
    }
}
