use clap::{Parser, Subcommand};
use storekeep::database::{builtin_catalog, builtin_migrations};
use storekeep::{OutputFormat, StoreLifecycle, StorekeepSettings};
use tracing::Level;

mod commands;

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Cli {
    /// configuration file path, by default $HOME/.storekeep/storekeep.toml is used
    #[clap(short, long)]
    config: Option<String>,

    /// Print debug information
    #[clap(long)]
    debug: bool,

    /// Output format: table, json, json-pretty
    #[clap(long, short = 'f', global = true, default_value = "table")]
    format: OutputFormat,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show store status (path, size, schema version, tables)
    Status,

    /// Open the store, creating or migrating it to the built-in schema
    Migrate,

    /// Back up the store to a destination file
    Backup(commands::database::BackupArgs),

    /// Write a timestamped backup into the backup directory
    Snapshot,

    /// List snapshot backups, newest first
    Backups,

    /// Delete old snapshot backups
    Prune(commands::database::PruneArgs),

    /// Replace the store with a backup file
    Restore(commands::database::RestoreArgs),

    /// Checkpoint, vacuum and optimize the store
    Cleanup,

    /// Show the effective configuration
    Config(commands::config::ConfigArgs),
}

fn main() {
    let cli = Cli::parse();

    if cli.debug {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_max_level(Level::DEBUG)
            .init();
    }

    let settings = match StorekeepSettings::new(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            std::process::exit(1);
        }
    };

    let (catalog, engine) = match (builtin_catalog(), builtin_migrations()) {
        (Ok(catalog), Ok(engine)) => (catalog, engine),
        (Err(e), _) | (_, Err(e)) => {
            eprintln!("ERROR: invalid built-in schema: {}", e);
            std::process::exit(1);
        }
    };
    let lifecycle = StoreLifecycle::new(&settings.data_dir, catalog, engine)
        .with_backup_policy(settings.backup_policy());

    let format = cli.format;
    match cli.command {
        Commands::Status => commands::database::run_status(&settings, &lifecycle, format),
        Commands::Migrate => commands::database::run_migrate(&settings, &lifecycle, format),
        Commands::Backup(args) => {
            commands::database::run_backup(&settings, &lifecycle, args, format)
        }
        Commands::Snapshot => commands::database::run_snapshot(&settings, &lifecycle, format),
        Commands::Backups => commands::database::run_backups(&settings, &lifecycle, format),
        Commands::Prune(args) => commands::database::run_prune(&settings, &lifecycle, args, format),
        Commands::Restore(args) => {
            commands::database::run_restore(&settings, &lifecycle, args, format)
        }
        Commands::Cleanup => commands::database::run_cleanup(&settings, &lifecycle, format),
        Commands::Config(args) => commands::config::run(&settings, &lifecycle, args, format),
    }
}
