use crate::database::backup::BackupPolicy;
use crate::database::core::{user_tables, SchemaCatalog, SchemaManager, SchemaStatus};
use crate::error::ValidationError;
use anyhow::{anyhow, Result};
use config::Config;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// =============================================================================
// Store configuration
// =============================================================================

pub const DEFAULT_DATABASE_NAME: &str = "storekeep.db";
pub const DEFAULT_SCHEMA_VERSION: u32 = 1;
pub const DEFAULT_MAX_POOL_SIZE: usize = 5;
pub const DEFAULT_CACHE_SIZE_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_BACKUP_RETENTION: usize = 3;

/// Storage tuning parameters for one open store
///
/// Immutable once built. Changing any value means closing the store and
/// opening it again with a new `StoreConfig`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreConfig {
    database_name: String,
    schema_version: u32,
    max_pool_size: usize,
    enable_wal: bool,
    enable_foreign_keys: bool,
    cache_size_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            schema_version: DEFAULT_SCHEMA_VERSION,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            enable_wal: true,
            enable_foreign_keys: true,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
        }
    }
}

impl StoreConfig {
    /// Validating factory
    pub fn new(
        database_name: impl Into<String>,
        schema_version: u32,
        max_pool_size: usize,
        enable_wal: bool,
        enable_foreign_keys: bool,
        cache_size_bytes: u64,
    ) -> Result<Self, ValidationError> {
        let config = StoreConfig {
            database_name: database_name.into(),
            schema_version,
            max_pool_size,
            enable_wal,
            enable_foreign_keys,
            cache_size_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.database_name.trim().is_empty() {
            return Err(ValidationError::EmptyDatabaseName);
        }
        if self.schema_version == 0 {
            return Err(ValidationError::NotPositive {
                field: "schema_version",
            });
        }
        if self.max_pool_size == 0 {
            return Err(ValidationError::NotPositive {
                field: "max_pool_size",
            });
        }
        if self.cache_size_bytes == 0 {
            return Err(ValidationError::NotPositive {
                field: "cache_size_bytes",
            });
        }
        Ok(())
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    pub fn enable_wal(&self) -> bool {
        self.enable_wal
    }

    pub fn enable_foreign_keys(&self) -> bool {
        self.enable_foreign_keys
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_bytes
    }

    /// Cache size rounded up to whole KiB, as `PRAGMA cache_size` expects
    pub fn cache_size_kib(&self) -> u64 {
        self.cache_size_bytes.div_ceil(1024).max(1)
    }
}

/// Accumulates field assignments for a [`StoreConfig`]
///
/// Setters are independent and may be called in any order; nothing is
/// checked until [`ConfigBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: StoreConfig,
}

impl ConfigBuilder {
    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.config.database_name = name.into();
        self
    }

    pub fn schema_version(mut self, version: u32) -> Self {
        self.config.schema_version = version;
        self
    }

    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    pub fn enable_wal(mut self, enable: bool) -> Self {
        self.config.enable_wal = enable;
        self
    }

    pub fn enable_foreign_keys(mut self, enable: bool) -> Self {
        self.config.enable_foreign_keys = enable;
        self
    }

    pub fn cache_size_bytes(mut self, bytes: u64) -> Self {
        self.config.cache_size_bytes = bytes;
        self
    }

    pub fn build(self) -> Result<StoreConfig, ValidationError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// =============================================================================
// Settings file / environment
// =============================================================================

/// Settings loaded from the storekeep configuration file and environment
#[derive(Debug, Clone, Serialize)]
pub struct StorekeepSettings {
    /// Directory holding the store file
    pub data_dir: String,

    /// File name of the store inside `data_dir`
    pub database_name: String,

    pub max_pool_size: usize,
    pub enable_wal: bool,
    pub enable_foreign_keys: bool,
    pub cache_size_bytes: u64,

    /// Directory for snapshot backups
    pub backup_dir: String,

    /// Number of snapshots kept by pruning
    pub backup_retention: usize,

    /// Take a snapshot before applying migrations
    pub backup_before_migrate: bool,
}

const EMPTY_CONFIG: &str = r#"### storekeep configuration file

### directory holding the store
# data_dir = "~/.storekeep"

### store file name and tuning
# database_name = "storekeep.db"
# max_pool_size = 5
# enable_wal = true
# enable_foreign_keys = true
# cache_size_bytes = 10485760       # 10 MiB

### snapshot backups
# backup_dir = "~/.storekeep/backups"
# backup_retention = 3
# backup_before_migrate = true
"#;

impl Default for StorekeepSettings {
    fn default() -> Self {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| ".".to_string());

        Self {
            data_dir: format!("{}/.storekeep", home_dir),
            database_name: DEFAULT_DATABASE_NAME.to_string(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            enable_wal: true,
            enable_foreign_keys: true,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            backup_dir: format!("{}/.storekeep/backups", home_dir),
            backup_retention: DEFAULT_BACKUP_RETENTION,
            backup_before_migrate: true,
        }
    }
}

impl StorekeepSettings {
    /// Load settings from a file (default `$HOME/.storekeep/storekeep.toml`) and
    /// `STOREKEEP_*` environment variables
    pub fn new(path: &Option<String>) -> Result<StorekeepSettings> {
        // pick up STOREKEEP_* overrides from a local .env, if present
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();

        let home_dir = dirs::home_dir()
            .ok_or_else(|| anyhow!("Could not find home directory"))?
            .to_str()
            .ok_or_else(|| anyhow!("Could not convert home directory path to string"))?
            .to_owned();
        let storekeep_dir = format!("{}/.storekeep", home_dir);

        match path {
            Some(p) => {
                if Path::new(p).exists() {
                    builder = builder.add_source(config::File::with_name(p));
                } else {
                    std::fs::write(p, EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file: {}", e))?;
                }
            }
            None => {
                std::fs::create_dir_all(&storekeep_dir)
                    .map_err(|e| anyhow!("Unable to create storekeep directory: {}", e))?;
                let p = format!("{}/storekeep.toml", storekeep_dir);
                if Path::new(&p).exists() {
                    builder = builder.add_source(config::File::with_name(&p));
                } else {
                    std::fs::write(&p, EMPTY_CONFIG)
                        .map_err(|e| anyhow!("Unable to create config file {}: {}", p, e))?;
                }
            }
        }

        // E.g., `STOREKEEP_DATA_DIR=/tmp/store storekeep status`
        builder = builder.add_source(config::Environment::with_prefix("STOREKEEP"));

        let settings = builder
            .build()
            .map_err(|e| anyhow!("Failed to build configuration: {}", e))?;

        let values = settings
            .try_deserialize::<HashMap<String, String>>()
            .map_err(|e| anyhow!("Failed to deserialize configuration: {}", e))?;

        Self::from_values(&values, &storekeep_dir)
    }

    fn from_values(values: &HashMap<String, String>, default_dir: &str) -> Result<Self> {
        let data_dir = values
            .get("data_dir")
            .map(|p| expand_home(p))
            .unwrap_or_else(|| default_dir.to_string());
        let backup_dir = values
            .get("backup_dir")
            .map(|p| expand_home(p))
            .unwrap_or_else(|| format!("{}/backups", data_dir.trim_end_matches('/')));

        Ok(StorekeepSettings {
            database_name: values
                .get("database_name")
                .cloned()
                .unwrap_or_else(|| DEFAULT_DATABASE_NAME.to_string()),
            max_pool_size: parse_setting(values, "max_pool_size", DEFAULT_MAX_POOL_SIZE)?,
            enable_wal: parse_setting(values, "enable_wal", true)?,
            enable_foreign_keys: parse_setting(values, "enable_foreign_keys", true)?,
            cache_size_bytes: parse_setting(values, "cache_size_bytes", DEFAULT_CACHE_SIZE_BYTES)?,
            backup_retention: parse_setting(values, "backup_retention", DEFAULT_BACKUP_RETENTION)?,
            backup_before_migrate: parse_setting(values, "backup_before_migrate", true)?,
            data_dir,
            backup_dir,
        })
    }

    /// Path to the store file
    pub fn sqlite_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.database_name)
    }

    /// Build a validated [`StoreConfig`] targeting `schema_version`
    pub fn store_config(&self, schema_version: u32) -> Result<StoreConfig, ValidationError> {
        StoreConfig::builder()
            .database_name(self.database_name.clone())
            .schema_version(schema_version)
            .max_pool_size(self.max_pool_size)
            .enable_wal(self.enable_wal)
            .enable_foreign_keys(self.enable_foreign_keys)
            .cache_size_bytes(self.cache_size_bytes)
            .build()
    }

    /// Snapshot backup policy derived from these settings
    pub fn backup_policy(&self) -> BackupPolicy {
        BackupPolicy {
            backup_dir: PathBuf::from(&self.backup_dir),
            retention: self.backup_retention,
            before_migrate: self.backup_before_migrate,
        }
    }

    /// Display configuration summary
    pub fn summary(&self) -> String {
        [
            format!("Data Directory:     {}", self.data_dir),
            format!("Store Path:         {}", self.sqlite_path().display()),
            format!("Pool Size:          {}", self.max_pool_size),
            format!("WAL:                {}", self.enable_wal),
            format!("Foreign Keys:       {}", self.enable_foreign_keys),
            format!("Cache Size:         {}", format_size(self.cache_size_bytes)),
            format!("Backup Directory:   {}", self.backup_dir),
            format!("Backup Retention:   {}", self.backup_retention),
            format!("Backup On Migrate:  {}", self.backup_before_migrate),
        ]
        .join("\n")
    }

    /// Get the config file path
    pub fn config_file_path() -> String {
        let home_dir = dirs::home_dir()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|| "~".to_string());
        format!("{}/.storekeep/storekeep.toml", home_dir)
    }
}

fn parse_setting<T: FromStr>(values: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match values.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid value '{}' for {}: {}", raw, key, e)),
        None => Ok(default),
    }
}

fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).to_string_lossy().to_string(),
        _ => path.to_string(),
    }
}

// =============================================================================
// Store info (used by status and config commands)
// =============================================================================

/// Row count of one table
#[derive(Debug, Serialize, Clone)]
pub struct TableInfo {
    pub name: String,
    pub rows: u64,
}

/// Information about the store file on disk
#[derive(Debug, Serialize, Clone)]
pub struct StoreInfo {
    pub path: String,
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    pub catalog_version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SchemaStatus>,
    pub tables: Vec<TableInfo>,
}

/// Inspect the store file without modifying it
///
/// The file is opened read-only, so no migration or initialization happens.
pub fn get_store_info(settings: &StorekeepSettings, catalog: &SchemaCatalog) -> StoreInfo {
    let path = settings.sqlite_path();
    let exists = path.exists();
    let size_bytes = if exists {
        std::fs::metadata(&path).ok().map(|m| m.len())
    } else {
        None
    };

    let mut info = StoreInfo {
        path: path.to_string_lossy().to_string(),
        exists,
        size_bytes,
        schema_version: None,
        catalog_version: catalog.version(),
        status: None,
        tables: Vec::new(),
    };

    if !exists {
        return info;
    }

    let conn = match Connection::open_with_flags(&path, OpenFlags::SQLITE_OPEN_READ_ONLY) {
        Ok(conn) => conn,
        Err(_) => return info,
    };
    let manager = SchemaManager::new(&conn);
    info.schema_version = manager.schema_version().ok();
    info.status = manager.check_status(catalog, catalog.version()).ok();

    if let Ok(tables) = user_tables(&conn) {
        for name in tables {
            let query = format!(
                "SELECT COUNT(*) FROM {}",
                crate::database::core::quote_ident(&name)
            );
            if let Ok(rows) = conn.query_row(&query, [], |row| row.get::<_, u64>(0)) {
                info.tables.push(TableInfo { name, rows });
            }
        }
    }

    info
}

/// Format bytes as human-readable size
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::default();
        assert_eq!(config.database_name(), "storekeep.db");
        assert_eq!(config.schema_version(), 1);
        assert_eq!(config.max_pool_size(), 5);
        assert!(config.enable_wal());
        assert!(config.enable_foreign_keys());
        assert_eq!(config.cache_size_bytes(), 10 * 1024 * 1024);
    }

    #[test]
    fn test_builder_setters_in_any_order() {
        let a = StoreConfig::builder()
            .cache_size_bytes(4096)
            .schema_version(3)
            .database_name("app.db")
            .build()
            .unwrap();
        let b = StoreConfig::builder()
            .database_name("app.db")
            .schema_version(3)
            .cache_size_bytes(4096)
            .build()
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.cache_size_kib(), 4);
    }

    #[test]
    fn test_builder_rejects_invalid_fields() {
        assert_eq!(
            StoreConfig::builder().database_name("  ").build(),
            Err(ValidationError::EmptyDatabaseName)
        );
        assert_eq!(
            StoreConfig::builder().schema_version(0).build(),
            Err(ValidationError::NotPositive {
                field: "schema_version"
            })
        );
        assert_eq!(
            StoreConfig::builder().max_pool_size(0).build(),
            Err(ValidationError::NotPositive {
                field: "max_pool_size"
            })
        );
        assert_eq!(
            StoreConfig::builder().cache_size_bytes(0).build(),
            Err(ValidationError::NotPositive {
                field: "cache_size_bytes"
            })
        );
    }

    #[test]
    fn test_built_configs_are_always_positive() {
        for version in 0..4u32 {
            for pool in 0..4usize {
                for cache in [0u64, 1, 1023, 1024, 1 << 20] {
                    if let Ok(config) = StoreConfig::new("db", version, pool, true, true, cache) {
                        assert!(config.schema_version() > 0);
                        assert!(config.max_pool_size() > 0);
                        assert!(config.cache_size_bytes() > 0);
                        assert!(config.cache_size_kib() >= 1);
                    }
                }
            }
        }
    }

    #[test]
    fn test_settings_from_values() {
        let mut values = HashMap::new();
        values.insert("data_dir".to_string(), "/test/dir/".to_string());
        values.insert("max_pool_size".to_string(), "8".to_string());
        values.insert("enable_wal".to_string(), "false".to_string());

        let settings = StorekeepSettings::from_values(&values, "/default").unwrap();
        assert_eq!(settings.sqlite_path(), PathBuf::from("/test/dir/storekeep.db"));
        assert_eq!(settings.backup_dir, "/test/dir/backups");
        assert_eq!(settings.max_pool_size, 8);
        assert!(!settings.enable_wal);
        assert!(settings.enable_foreign_keys);
        assert_eq!(settings.backup_retention, DEFAULT_BACKUP_RETENTION);

        let config = settings.store_config(4).unwrap();
        assert_eq!(config.schema_version(), 4);
        assert_eq!(config.max_pool_size(), 8);
        assert!(!config.enable_wal());
    }

    #[test]
    fn test_settings_reject_bad_values() {
        let mut values = HashMap::new();
        values.insert("max_pool_size".to_string(), "many".to_string());
        assert!(StorekeepSettings::from_values(&values, "/default").is_err());

        let mut values = HashMap::new();
        values.insert("max_pool_size".to_string(), "0".to_string());
        let settings = StorekeepSettings::from_values(&values, "/default").unwrap();
        assert!(settings.store_config(1).is_err());
    }

    #[test]
    fn test_store_info_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorekeepSettings {
            data_dir: dir.path().to_string_lossy().to_string(),
            ..StorekeepSettings::default()
        };
        let catalog = crate::database::catalog::builtin_catalog().unwrap();
        let info = get_store_info(&settings, &catalog);
        assert!(!info.exists);
        assert!(info.status.is_none());
        assert_eq!(info.catalog_version, catalog.version());
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.00 KB");
        assert_eq!(format_size(1536), "1.50 KB");
        assert_eq!(format_size(1048576), "1.00 MB");
        assert_eq!(format_size(1073741824), "1.00 GB");
    }
}
