pub mod config;
pub mod database;

use serde::Serialize;
use storekeep::OutputFormat;

/// Print `value` as JSON when a JSON format was requested
///
/// Returns false for table output so the caller prints its own rendering.
pub(crate) fn print_json<T: Serialize>(value: &T, output_format: OutputFormat) -> bool {
    match output_format.render_json(value) {
        Some(Ok(json)) => {
            println!("{}", json);
            true
        }
        Some(Err(e)) => {
            eprintln!("ERROR: failed to serialize output: {}", e);
            true
        }
        None => false,
    }
}
