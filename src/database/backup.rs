//! Atomic file-level backup and restore of a store
//!
//! Backups are byte copies of the main database file taken after a WAL
//! checkpoint. Every copy goes through a temp file in the destination
//! directory and is renamed into place, so a destination path either holds a
//! complete file or is left as it was.

use crate::database::core::DatabaseConn;
use crate::database::lifecycle::StoreHandle;
use crate::error::{BackupError, RestoreError, StoreResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

/// Magic string at the start of every SQLite database file
const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Size of the SQLite file header
const HEADER_LEN: usize = 100;

/// Offset of the big-endian `user_version` field in the header
const USER_VERSION_OFFSET: usize = 60;

const SNAPSHOT_TIME_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";

/// Where and how many snapshot backups are kept
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupPolicy {
    pub backup_dir: PathBuf,
    /// Number of snapshots kept by `prune`
    pub retention: usize,
    /// Take a snapshot before migrating an existing store
    pub before_migrate: bool,
}

impl Default for BackupPolicy {
    fn default() -> Self {
        BackupPolicy {
            backup_dir: PathBuf::from("backups"),
            retention: crate::config::DEFAULT_BACKUP_RETENTION,
            before_migrate: true,
        }
    }
}

/// A backup file on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupInfo {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created: DateTime<Utc>,
}

/// Backup, snapshot and restore operations for one backup policy
#[derive(Debug, Clone, Default)]
pub struct BackupRestoreManager {
    policy: BackupPolicy,
}

impl BackupRestoreManager {
    pub fn new(policy: BackupPolicy) -> Self {
        BackupRestoreManager { policy }
    }

    pub fn policy(&self) -> &BackupPolicy {
        &self.policy
    }

    /// Copy the store behind `handle` to `dest`
    ///
    /// The writer connection is held while the WAL is checkpointed and the
    /// file is copied, so no write lands between the two.
    pub fn backup(&self, handle: &StoreHandle, dest: &Path) -> StoreResult<BackupInfo> {
        handle.with_db(|db| Ok(backup_conn(db, dest)?))
    }

    /// Write a timestamped backup into the policy's backup directory
    pub fn snapshot(&self, handle: &StoreHandle) -> StoreResult<BackupInfo> {
        handle.with_db(|db| Ok(self.snapshot_conn(db)?))
    }

    pub(crate) fn snapshot_conn(&self, db: &DatabaseConn) -> Result<BackupInfo, BackupError> {
        let stem = store_stem(db.path());
        let name = format!(
            "{}_backup_{}.db",
            stem,
            Utc::now().format(SNAPSHOT_TIME_FORMAT)
        );
        backup_conn(db, &self.policy.backup_dir.join(name))
    }

    /// Snapshot backups of `database_name`, newest first
    pub fn list_backups(&self, database_name: &str) -> Result<Vec<BackupInfo>, BackupError> {
        let dir = &self.policy.backup_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let prefix = format!("{}_backup_", store_stem(Path::new(database_name)));
        let io_err = |source| BackupError::Io {
            path: dir.clone(),
            source,
        };

        let mut backups = Vec::new();
        for entry in fs::read_dir(dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let Some(stamp) = file_name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".db"))
            else {
                continue;
            };
            let Ok(created) = NaiveDateTime::parse_from_str(stamp, SNAPSHOT_TIME_FORMAT) else {
                debug!(file = %file_name, "skipping file with unparseable backup timestamp");
                continue;
            };
            let metadata = entry.metadata().map_err(io_err)?;
            backups.push(BackupInfo {
                path: entry.path(),
                size_bytes: metadata.len(),
                created: created.and_utc(),
            });
        }

        backups.sort_by(|a, b| b.created.cmp(&a.created).then(b.path.cmp(&a.path)));
        Ok(backups)
    }

    /// Delete all but the `keep` newest snapshots; returns the removed paths
    pub fn prune(&self, database_name: &str, keep: usize) -> Result<Vec<PathBuf>, BackupError> {
        let mut removed = Vec::new();
        for backup in self.list_backups(database_name)?.into_iter().skip(keep) {
            fs::remove_file(&backup.path).map_err(|source| BackupError::Io {
                path: backup.path.clone(),
                source,
            })?;
            info!(path = %backup.path.display(), "removed old backup");
            removed.push(backup.path);
        }
        Ok(removed)
    }

    /// Check that `path` looks like a SQLite database file
    pub fn validate_store_file(path: &Path) -> Result<(), RestoreError> {
        read_header(path).map(|_| ())
    }

    /// Schema version recorded in the header of the store file at `path`
    ///
    /// Reads the `user_version` field without opening the file as a database.
    pub fn store_file_version(path: &Path) -> Result<u32, RestoreError> {
        let header = read_header(path)?;
        Ok(u32::from_be_bytes([
            header[USER_VERSION_OFFSET],
            header[USER_VERSION_OFFSET + 1],
            header[USER_VERSION_OFFSET + 2],
            header[USER_VERSION_OFFSET + 3],
        ]))
    }

    /// Replace the file at `db_path` with a copy of `source`
    ///
    /// The store must not be open. Nothing at `db_path` changes unless the
    /// copy completed; leftover `-wal`/`-shm` files are set aside while the
    /// new file is moved in and put back if that fails.
    pub fn restore_file(db_path: &Path, source: &Path) -> Result<(), RestoreError> {
        Self::validate_store_file(source)?;

        let dir = parent_dir(db_path);
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| RestoreError::Io { path, source }
        };
        fs::create_dir_all(&dir).map_err(io_err(dir.as_path()))?;

        let temp = copy_to_temp(source, &dir).map_err(io_err(source))?;

        let mut set_aside = Vec::new();
        for suffix in ["-wal", "-shm"] {
            let stale = sidecar_path(db_path, suffix);
            let aside = sidecar_path(db_path, &format!("{}.restore-old", suffix));
            match fs::rename(&stale, &aside) {
                Ok(()) => set_aside.push((stale, aside)),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    put_back(&set_aside);
                    return Err(io_err(stale.as_path())(e));
                }
            }
        }

        if let Err(e) = temp.persist(db_path) {
            put_back(&set_aside);
            return Err(io_err(db_path)(e.error));
        }

        for (_, aside) in &set_aside {
            match fs::remove_file(aside) {
                Ok(()) => debug!(path = %aside.display(), "removed stale sidecar file"),
                Err(e) => warn!(path = %aside.display(), "failed to remove stale sidecar file: {}", e),
            }
        }

        info!(
            source = %source.display(),
            target = %db_path.display(),
            "restored store file"
        );
        Ok(())
    }
}

fn read_header(path: &Path) -> Result<[u8; HEADER_LEN], RestoreError> {
    if !path.is_file() {
        return Err(RestoreError::SourceMissing(path.to_path_buf()));
    }
    let malformed = |reason: String| RestoreError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let mut header = [0u8; HEADER_LEN];
    let mut file = File::open(path).map_err(|source| RestoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(malformed(format!(
                "file is shorter than the {} byte header",
                HEADER_LEN
            )));
        }
        Err(source) => {
            return Err(RestoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    if &header[..SQLITE_MAGIC.len()] != SQLITE_MAGIC {
        return Err(malformed("missing SQLite header magic".to_string()));
    }

    // stored big-endian; 1 stands for 65536
    let raw = u16::from_be_bytes([header[16], header[17]]);
    let page_size: u32 = if raw == 1 { 65536 } else { u32::from(raw) };
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(malformed(format!("invalid page size {}", page_size)));
    }

    Ok(header)
}

/// Move set-aside sidecar files back to their original names
fn put_back(set_aside: &[(PathBuf, PathBuf)]) {
    for (original, aside) in set_aside {
        if let Err(e) = fs::rename(aside, original) {
            error!(path = %original.display(), "failed to put back sidecar file: {}", e);
        }
    }
}

/// Checkpoint and copy the store file behind `db` to `dest`
pub(crate) fn backup_conn(db: &DatabaseConn, dest: &Path) -> Result<BackupInfo, BackupError> {
    let source = db.path();
    if source.as_os_str().is_empty() || source == Path::new(":memory:") {
        return Err(BackupError::InMemory);
    }
    if !source.is_file() {
        return Err(BackupError::SourceMissing(source.to_path_buf()));
    }

    let checkpoint = db.checkpoint()?;
    if !checkpoint.is_complete() {
        warn!(
            busy = checkpoint.busy,
            log_frames = checkpoint.log_frames,
            checkpointed = checkpoint.checkpointed_frames,
            "checkpoint did not complete"
        );
        return Err(BackupError::Checkpoint {
            remaining: (checkpoint.log_frames - checkpoint.checkpointed_frames).max(1),
        });
    }

    let dir = parent_dir(dest);
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| BackupError::Io { path, source }
    };
    fs::create_dir_all(&dir).map_err(io_err(dir.as_path()))?;

    let temp = copy_to_temp(source, &dir).map_err(io_err(dest))?;
    let file = temp.persist(dest).map_err(|e| io_err(dest)(e.error))?;
    let size_bytes = file.metadata().map_err(io_err(dest))?.len();

    info!(
        source = %source.display(),
        dest = %dest.display(),
        size_bytes,
        "backup written"
    );
    Ok(BackupInfo {
        path: dest.to_path_buf(),
        size_bytes,
        created: Utc::now(),
    })
}

/// Copy `source` into a synced temp file inside `dir`
fn copy_to_temp(source: &Path, dir: &Path) -> io::Result<NamedTempFile> {
    let mut temp = NamedTempFile::new_in(dir)?;
    let mut input = File::open(source)?;
    io::copy(&mut input, temp.as_file_mut())?;
    temp.as_file().sync_all()?;
    Ok(temp)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

fn sidecar_path(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn store_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "store".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn populated_store(dir: &Path) -> DatabaseConn {
        let db = DatabaseConn::open(&dir.join("store.db")).unwrap();
        db.apply_config(&StoreConfig::default()).unwrap();
        db.conn
            .execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO t VALUES (1, 'a'), (2, 'b');",
            )
            .unwrap();
        db
    }

    fn manager(dir: &Path) -> BackupRestoreManager {
        BackupRestoreManager::new(BackupPolicy {
            backup_dir: dir.join("backups"),
            retention: 2,
            before_migrate: true,
        })
    }

    #[test]
    fn test_backup_includes_wal_content() {
        let dir = tempfile::tempdir().unwrap();
        let db = populated_store(dir.path());

        // parent directory does not exist yet
        let dest = dir.path().join("nested/deeper/copy.db");
        let info = backup_conn(&db, &dest).unwrap();
        assert_eq!(info.path, dest);
        assert!(info.size_bytes >= HEADER_LEN as u64);

        BackupRestoreManager::validate_store_file(&dest).unwrap();
        let copy = rusqlite::Connection::open(&dest).unwrap();
        let count: i64 = copy
            .query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_backup_of_in_memory_store() {
        let db = DatabaseConn::open(Path::new(":memory:")).unwrap();
        assert!(matches!(
            backup_conn(&db, Path::new("/tmp/never.db")),
            Err(BackupError::InMemory)
        ));
    }

    #[test]
    fn test_validate_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.db");
        assert!(matches!(
            BackupRestoreManager::validate_store_file(&missing),
            Err(RestoreError::SourceMissing(_))
        ));

        let short = dir.path().join("short.db");
        fs::write(&short, b"SQLite format 3\0").unwrap();
        assert!(matches!(
            BackupRestoreManager::validate_store_file(&short),
            Err(RestoreError::Malformed { .. })
        ));

        let garbage = dir.path().join("garbage.db");
        fs::write(&garbage, vec![7u8; 4096]).unwrap();
        assert!(matches!(
            BackupRestoreManager::validate_store_file(&garbage),
            Err(RestoreError::Malformed { .. })
        ));

        let mut bad_page = SQLITE_MAGIC.to_vec();
        bad_page.resize(HEADER_LEN, 0);
        bad_page[16] = 0x03; // 768
        let bad_page_path = dir.path().join("bad_page.db");
        fs::write(&bad_page_path, &bad_page).unwrap();
        assert!(matches!(
            BackupRestoreManager::validate_store_file(&bad_page_path),
            Err(RestoreError::Malformed { .. })
        ));

        let db = populated_store(dir.path());
        db.checkpoint().unwrap();
        BackupRestoreManager::validate_store_file(db.path()).unwrap();
    }

    #[test]
    fn test_restore_file_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let db = populated_store(dir.path());
        let backup = dir.path().join("backup.db");
        backup_conn(&db, &backup).unwrap();
        db.close().unwrap();

        let target = dir.path().join("restored/target.db");
        fs::create_dir_all(target.parent().unwrap()).unwrap();
        fs::write(sidecar_path(&target, "-wal"), b"stale").unwrap();

        BackupRestoreManager::restore_file(&target, &backup).unwrap();
        assert!(!sidecar_path(&target, "-wal").exists());

        let conn = rusqlite::Connection::open(&target).unwrap();
        let name: String = conn
            .query_row("SELECT name FROM t WHERE id = 2", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "b");
    }

    #[test]
    fn test_restore_from_malformed_source_leaves_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target.db");
        fs::write(&target, b"original").unwrap();
        let bogus = dir.path().join("bogus.db");
        fs::write(&bogus, vec![0u8; 200]).unwrap();

        assert!(BackupRestoreManager::restore_file(&target, &bogus).is_err());
        assert!(BackupRestoreManager::restore_file(&target, &dir.path().join("nope.db")).is_err());
        assert_eq!(fs::read(&target).unwrap(), b"original");
    }

    #[test]
    fn test_failed_replace_puts_sidecars_back() {
        let dir = tempfile::tempdir().unwrap();
        let db = populated_store(dir.path());
        let backup = dir.path().join("backup.db");
        backup_conn(&db, &backup).unwrap();
        db.close().unwrap();

        // a directory in the target's place makes the final rename fail
        let target = dir.path().join("busy.db");
        fs::create_dir_all(target.join("inner")).unwrap();
        fs::write(sidecar_path(&target, "-wal"), b"frames").unwrap();

        assert!(matches!(
            BackupRestoreManager::restore_file(&target, &backup),
            Err(RestoreError::Io { .. })
        ));
        assert_eq!(fs::read(sidecar_path(&target, "-wal")).unwrap(), b"frames");
        assert!(!sidecar_path(&target, "-wal.restore-old").exists());
    }

    #[test]
    fn test_store_file_version() {
        let dir = tempfile::tempdir().unwrap();
        let db = populated_store(dir.path());
        db.conn.execute_batch("PRAGMA user_version = 7").unwrap();
        let backup = dir.path().join("backup.db");
        backup_conn(&db, &backup).unwrap();

        assert_eq!(BackupRestoreManager::store_file_version(&backup).unwrap(), 7);
        assert!(matches!(
            BackupRestoreManager::store_file_version(&dir.path().join("nope.db")),
            Err(RestoreError::SourceMissing(_))
        ));
    }

    #[test]
    fn test_snapshot_list_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let db = populated_store(dir.path());
        let manager = manager(dir.path());

        assert!(manager.list_backups("store.db").unwrap().is_empty());

        let mut taken = Vec::new();
        for _ in 0..4 {
            taken.push(manager.snapshot_conn(&db).unwrap().path);
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        // unrelated files are ignored
        fs::write(dir.path().join("backups/notes.txt"), b"x").unwrap();

        let listed = manager.list_backups("store.db").unwrap();
        assert_eq!(listed.len(), 4);
        assert_eq!(listed[0].path, taken[3]);
        assert!(listed.windows(2).all(|w| w[0].created >= w[1].created));

        let removed = manager.prune("store.db", 2).unwrap();
        assert_eq!(removed, vec![taken[1].clone(), taken[0].clone()]);
        let remaining: Vec<PathBuf> = manager
            .list_backups("store.db")
            .unwrap()
            .into_iter()
            .map(|b| b.path)
            .collect();
        assert_eq!(remaining, vec![taken[3].clone(), taken[2].clone()]);
    }
}
