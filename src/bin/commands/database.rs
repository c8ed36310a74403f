use super::print_json;
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use storekeep::database::BUILTIN_SCHEMA_VERSION;
use storekeep::{
    format_size, get_store_info, OutputFormat, StoreError, StoreHandle, StoreInfo,
    StoreLifecycle, StorekeepSettings,
};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Args)]
pub struct BackupArgs {
    /// Destination path for the backup
    #[clap(value_name = "DEST")]
    pub destination: PathBuf,
}

#[derive(Args)]
pub struct PruneArgs {
    /// Number of snapshots to keep (defaults to the configured retention)
    #[clap(long, short)]
    pub keep: Option<usize>,
}

#[derive(Args)]
pub struct RestoreArgs {
    /// Backup file to restore from
    #[clap(value_name = "SOURCE")]
    pub source: PathBuf,
}

#[derive(Tabled)]
struct TableRow {
    table: String,
    rows: u64,
}

#[derive(Tabled)]
struct BackupRow {
    file: String,
    size: String,
    created: String,
}

fn fail(context: &str, e: impl std::fmt::Display) -> ! {
    eprintln!("ERROR: {}: {}", context, e);
    std::process::exit(1);
}

fn open_store(settings: &StorekeepSettings, lifecycle: &StoreLifecycle) -> Arc<StoreHandle> {
    let config = match settings.store_config(BUILTIN_SCHEMA_VERSION) {
        Ok(config) => config,
        Err(e) => fail("invalid store configuration", e),
    };
    match lifecycle.open(config) {
        Ok(handle) => handle,
        Err(e) => fail("failed to open store", e),
    }
}

fn close_store(lifecycle: &StoreLifecycle) {
    if let Err(e) = lifecycle.close() {
        eprintln!("Warning: failed to close store cleanly: {}", e);
    }
}

pub fn run_status(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    output_format: OutputFormat,
) {
    let info = get_store_info(settings, lifecycle.catalog());
    if print_json(&info, output_format) {
        return;
    }
    print_status_table(&info);
}

fn print_status_table(info: &StoreInfo) {
    println!("Storekeep Store Status");
    println!("======================\n");

    println!("  Path:           {}", info.path);
    println!(
        "  Status:         {}",
        if info.exists { "exists" } else { "not created" }
    );
    if let Some(size) = info.size_bytes {
        println!("  Size:           {}", format_size(size));
    }
    match info.schema_version {
        Some(version) => println!(
            "  Schema:         v{} (built-in v{})",
            version, info.catalog_version
        ),
        None => println!("  Schema:         - (built-in v{})", info.catalog_version),
    }
    if let Some(status) = &info.status {
        println!("  Check:          {}", status);
    }

    if !info.tables.is_empty() {
        println!();
        let rows: Vec<TableRow> = info
            .tables
            .iter()
            .map(|t| TableRow {
                table: t.name.clone(),
                rows: t.rows,
            })
            .collect();
        println!("{}", Table::new(rows).with(Style::rounded()));
    }

    eprintln!();
    eprintln!("Commands:");
    eprintln!("  storekeep migrate              Create or upgrade the store");
    eprintln!("  storekeep backup <dest>        Back up the store to a file");
    eprintln!("  storekeep restore <source>     Replace the store with a backup");
}

#[derive(Serialize)]
struct MigrateResult {
    path: String,
    from_version: Option<u32>,
    schema_version: u32,
}

pub fn run_migrate(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    output_format: OutputFormat,
) {
    let before = get_store_info(settings, lifecycle.catalog()).schema_version;

    eprintln!("Opening store...");
    let handle = open_store(settings, lifecycle);
    let result = MigrateResult {
        path: handle.path().to_string_lossy().to_string(),
        from_version: before.filter(|v| *v > 0),
        schema_version: handle.schema_version(),
    };
    close_store(lifecycle);

    if print_json(&result, output_format) {
        return;
    }
    match result.from_version {
        None => println!(
            "✓ Created store at v{}: {}",
            result.schema_version, result.path
        ),
        Some(from) if from < result.schema_version => println!(
            "✓ Migrated store from v{} to v{}: {}",
            from, result.schema_version, result.path
        ),
        Some(_) => println!(
            "✓ Store is up to date (v{}): {}",
            result.schema_version, result.path
        ),
    }
}

pub fn run_backup(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    args: BackupArgs,
    output_format: OutputFormat,
) {
    if !settings.sqlite_path().exists() {
        fail(
            "store file does not exist",
            settings.sqlite_path().display(),
        );
    }
    let handle = open_store(settings, lifecycle);

    eprintln!("Backing up store...");
    let result = lifecycle.backups().backup(&handle, &args.destination);
    close_store(lifecycle);

    let info = match result {
        Ok(info) => info,
        Err(e) => fail("failed to back up store", e),
    };
    if print_json(&info, output_format) {
        return;
    }
    println!("✓ Backup completed successfully");
    println!(
        "  - {} ({})",
        info.path.display(),
        format_size(info.size_bytes)
    );
}

pub fn run_snapshot(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    output_format: OutputFormat,
) {
    let handle = open_store(settings, lifecycle);
    let result = lifecycle.backups().snapshot(&handle);
    close_store(lifecycle);

    let info = match result {
        Ok(info) => info,
        Err(e) => fail("failed to take snapshot", e),
    };
    if print_json(&info, output_format) {
        return;
    }
    println!("✓ Snapshot written");
    println!(
        "  - {} ({})",
        info.path.display(),
        format_size(info.size_bytes)
    );
}

pub fn run_backups(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    output_format: OutputFormat,
) {
    let backups = match lifecycle.backups().list_backups(&settings.database_name) {
        Ok(backups) => backups,
        Err(e) => fail("failed to list backups", e),
    };
    if print_json(&backups, output_format) {
        return;
    }
    if backups.is_empty() {
        println!(
            "No snapshots in {}",
            lifecycle.backups().policy().backup_dir.display()
        );
        return;
    }

    let rows: Vec<BackupRow> = backups
        .iter()
        .map(|b| BackupRow {
            file: b.path.to_string_lossy().to_string(),
            size: format_size(b.size_bytes),
            created: b.created.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        })
        .collect();
    println!("{}", Table::new(rows).with(Style::rounded()));
}

#[derive(Serialize)]
struct PruneResult {
    kept: usize,
    removed: Vec<String>,
}

pub fn run_prune(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    args: PruneArgs,
    output_format: OutputFormat,
) {
    let keep = args.keep.unwrap_or(settings.backup_retention);
    let removed = match lifecycle.backups().prune(&settings.database_name, keep) {
        Ok(removed) => removed,
        Err(e) => fail("failed to prune backups", e),
    };
    let result = PruneResult {
        kept: keep,
        removed: removed
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect(),
    };
    if print_json(&result, output_format) {
        return;
    }
    println!(
        "✓ Removed {} snapshot(s), keeping the newest {}",
        result.removed.len(),
        keep
    );
    for path in &result.removed {
        println!("  - {}", path);
    }
}

#[derive(Serialize)]
struct RestoreResult {
    source: String,
    path: String,
    schema_version: u32,
}

pub fn run_restore(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    args: RestoreArgs,
    output_format: OutputFormat,
) {
    let handle = open_store(settings, lifecycle);

    eprintln!("Restoring store from {}...", args.source.display());
    let restored = match lifecycle.restore(&handle, &args.source) {
        Ok(restored) => restored,
        Err(e @ StoreError::Restore(_)) => {
            close_store(lifecycle);
            fail("restore rejected, store left unchanged", e)
        }
        Err(e) => fail("failed to restore store", e),
    };
    let result = RestoreResult {
        source: args.source.to_string_lossy().to_string(),
        path: restored.path().to_string_lossy().to_string(),
        schema_version: restored.schema_version(),
    };
    close_store(lifecycle);

    if print_json(&result, output_format) {
        return;
    }
    println!("✓ Restore completed successfully");
    println!("  - {} (v{})", result.path, result.schema_version);
}

pub fn run_cleanup(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    output_format: OutputFormat,
) {
    let _handle = open_store(settings, lifecycle);
    let result = lifecycle.cleanup();
    close_store(lifecycle);

    let report = match result {
        Ok(report) => report,
        Err(e) => fail("cleanup failed", e),
    };
    if print_json(&report, output_format) {
        return;
    }
    println!("✓ Cleanup completed");
    println!(
        "  {} -> {} ({} reclaimed)",
        format_size(report.size_before),
        format_size(report.size_after),
        format_size(report.reclaimed())
    );
}
