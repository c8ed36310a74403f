//! Built-in schema shipped with the `storekeep` binary
//!
//! Version 1 is the base layout of the download store. Versions 2 to 4 are
//! reached through the registered migration steps; `builtin_catalog()`
//! describes the result.

use crate::database::core::{ColumnSpec, SchemaCatalog, TableSpec};
use crate::database::migration::{MigrationEngine, MigrationStep};
use crate::error::ValidationError;

/// Schema version of [`builtin_catalog`]
pub const BUILTIN_SCHEMA_VERSION: u32 = 4;

/// Gallery metadata columns shared by downloads, history and favorites
fn gallery_table(name: &str) -> TableSpec {
    TableSpec::new(name)
        .column(ColumnSpec::integer("gid").not_null())
        .column(ColumnSpec::text("token"))
        .column(ColumnSpec::text("title"))
        .column(ColumnSpec::text("title_jpn"))
        .column(ColumnSpec::text("thumb"))
        .column(ColumnSpec::integer("category").not_null())
        .column(ColumnSpec::text("posted"))
        .column(ColumnSpec::text("uploader"))
        .column(ColumnSpec::real("rating").not_null())
        .column(ColumnSpec::text("simple_language"))
}

fn download_info_base() -> TableSpec {
    gallery_table("download_info")
        .column(ColumnSpec::integer("state").not_null())
        .column(ColumnSpec::integer("legacy").not_null())
        .column(ColumnSpec::integer("time").not_null())
        .column(ColumnSpec::text("label"))
        .column(ColumnSpec::integer("position").not_null())
        .column(ColumnSpec::integer("speed").not_null())
        .column(ColumnSpec::integer("read").not_null())
        .column(ColumnSpec::integer("total").not_null())
        .column(ColumnSpec::integer("finished").not_null())
        .column(ColumnSpec::integer("started").not_null())
        .column(ColumnSpec::integer("invalid").not_null())
        .column(ColumnSpec::text("favorite_name"))
        .column(ColumnSpec::integer("favorite_slot").not_null())
        .primary_key(&["gid"])
        .index(&["time"])
        .index(&["state"])
        .index(&["label"])
}

/// `download_info` as rebuilt at v3
fn download_info() -> TableSpec {
    download_info_base()
        .column(ColumnSpec::text("archive_url"))
        .column(ColumnSpec::text("download_path"))
        .index(&["archive_url"])
}

fn history() -> TableSpec {
    gallery_table("history")
        .column(ColumnSpec::integer("time").not_null())
        .column(ColumnSpec::integer("mode").not_null())
        .primary_key(&["gid"])
        .index(&["time"])
        .index(&["mode"])
}

fn local_favorites() -> TableSpec {
    gallery_table("local_favorites")
        .column(ColumnSpec::integer("time").not_null())
        .column(ColumnSpec::text("favorite_name"))
        .primary_key(&["gid"])
        .index(&["time"])
}

fn quick_search() -> TableSpec {
    TableSpec::new("quick_search")
        .column(ColumnSpec::integer("id").not_null())
        .column(ColumnSpec::text("name").not_null())
        .column(ColumnSpec::integer("mode").not_null())
        .column(ColumnSpec::integer("category").not_null())
        .column(ColumnSpec::text("keyword"))
        .column(ColumnSpec::text("advance_search"))
        .column(ColumnSpec::integer("min_rating").not_null())
        .column(ColumnSpec::integer("max_rating").not_null())
        .column(ColumnSpec::integer("page_from").not_null())
        .column(ColumnSpec::integer("page_to").not_null())
        .primary_key(&["id"])
}

fn filter() -> TableSpec {
    TableSpec::new("filter")
        .column(ColumnSpec::integer("id").not_null())
        .column(ColumnSpec::integer("mode").not_null())
        .column(ColumnSpec::text("text").not_null())
        .column(ColumnSpec::integer("enable").not_null().default_value(1))
        .primary_key(&["id"])
}

fn black_list() -> TableSpec {
    TableSpec::new("black_list")
        .column(ColumnSpec::integer("id").not_null())
        .column(ColumnSpec::text("bad_guy").not_null())
        .primary_key(&["id"])
}

fn download_statistics() -> TableSpec {
    TableSpec::new("download_statistics")
        .column(ColumnSpec::integer("gid").not_null())
        .column(
            ColumnSpec::integer("download_count")
                .not_null()
                .default_value(0),
        )
        .column(ColumnSpec::integer("last_download_time"))
        .column(ColumnSpec::integer("average_speed").default_value(0))
        .column(ColumnSpec::integer("total_size").default_value(0))
        .primary_key(&["gid"])
        .index(&["download_count"])
}

/// The v1 layout, as created by the first release
pub fn builtin_base_catalog() -> Result<SchemaCatalog, ValidationError> {
    SchemaCatalog::new(
        1,
        vec![
            download_info_base(),
            history(),
            local_favorites(),
            quick_search(),
            filter(),
            black_list(),
        ],
    )
}

/// The current layout
pub fn builtin_catalog() -> Result<SchemaCatalog, ValidationError> {
    SchemaCatalog::new(
        BUILTIN_SCHEMA_VERSION,
        vec![
            download_info(),
            history(),
            local_favorites(),
            quick_search(),
            filter(),
            black_list(),
            download_statistics(),
        ],
    )
}

/// Steps from v1 to [`BUILTIN_SCHEMA_VERSION`]
pub fn builtin_migrations() -> Result<MigrationEngine, ValidationError> {
    let archive_index = download_info()
        .indexes
        .into_iter()
        .find(|i| i.columns == ["archive_url"])
        .ok_or_else(|| ValidationError::Catalog("archive_url index missing".to_string()))?;

    MigrationEngine::new()
        .with_step(
            MigrationStep::new(2)
                .add_column("download_info", ColumnSpec::text("archive_url"))
                .create_index(archive_index),
        )?
        .with_step(MigrationStep::new(3).rebuild_table("download_info", download_info()))?
        .with_step(MigrationStep::new(4).create_table(download_statistics()))
}
