//! Structured status records.
//!
//! Each record is a single JSON object written to stdout with the shape
//! `{"message": ..., "data": ...}` so downstream collectors can parse the
//! stream line by line. Pretty printing trades that property for human
//! readability during local runs.

use serde_json::json;

/// Emit one structured record to stdout.
pub fn emit(message: &str, data: serde_json::Value, pretty: bool) {
    let record = json!({"message": message, "data": data});
    let rendered = if pretty {
        serde_json::to_string_pretty(&record)
    } else {
        serde_json::to_string(&record)
    };
    match rendered {
        Ok(line) => println!("{line}"),
        Err(error) => tracing::error!("Failed to render log record: {error}"),
    }
}
