use super::print_json;
use clap::Args;
use serde::Serialize;
use storekeep::database::BUILTIN_SCHEMA_VERSION;
use storekeep::{
    get_store_info, OutputFormat, StoreConfig, StoreInfo, StoreLifecycle, StorekeepSettings,
};

/// Arguments for the Config command
#[derive(Args)]
pub struct ConfigArgs {
    /// Also show the built-in schema (tables and columns)
    #[clap(short, long)]
    pub verbose: bool,
}

#[derive(Debug, Serialize)]
struct ConfigInfo {
    config_file: String,
    settings: StorekeepSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    store_config: Option<StoreConfig>,
    store: StoreInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<Vec<SchemaTable>>,
}

#[derive(Debug, Serialize)]
struct SchemaTable {
    name: String,
    columns: Vec<String>,
    indexes: Vec<String>,
}

pub fn run(
    settings: &StorekeepSettings,
    lifecycle: &StoreLifecycle,
    args: ConfigArgs,
    output_format: OutputFormat,
) {
    let ConfigArgs { verbose } = args;

    let store_config = match settings.store_config(BUILTIN_SCHEMA_VERSION) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Warning: settings do not form a valid store configuration: {}", e);
            None
        }
    };

    let schema = verbose.then(|| {
        lifecycle
            .catalog()
            .tables()
            .iter()
            .map(|t| SchemaTable {
                name: t.name.clone(),
                columns: t
                    .columns
                    .iter()
                    .map(|c| c.definition())
                    .collect(),
                indexes: t.indexes.iter().map(|i| i.name.clone()).collect(),
            })
            .collect::<Vec<_>>()
    });

    let info = ConfigInfo {
        config_file: StorekeepSettings::config_file_path(),
        settings: settings.clone(),
        store_config,
        store: get_store_info(settings, lifecycle.catalog()),
        schema,
    };

    if print_json(&info, output_format) {
        return;
    }

    println!("Configuration:");
    println!("  Config file:        {}", info.config_file);
    for line in settings.summary().lines() {
        println!("  {}", line);
    }
    println!();
    println!("Store:");
    println!(
        "  Schema:             {}",
        match info.store.schema_version {
            Some(v) => format!("v{} (built-in v{})", v, info.store.catalog_version),
            None => format!("not created (built-in v{})", info.store.catalog_version),
        }
    );
    if let Some(config) = &info.store_config {
        println!("  Cache (KiB):        {}", config.cache_size_kib());
    }

    if let Some(schema) = &info.schema {
        println!();
        println!("Built-in schema:");
        for table in schema {
            println!("  {}", table.name);
            for column in &table.columns {
                println!("    {}", column);
            }
            for index in &table.indexes {
                println!("    index {}", index);
            }
        }
    }
}
