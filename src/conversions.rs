//! Parsers for Kubernetes resource quantity strings.
//!
//! Memory and CPU quantities use different unit grammars and must stay in
//! separate parsers: for memory the `m` suffix is decimal mega (1000^2),
//! while for CPU `m` is milli. Kubernetes' occasional millibyte usage is
//! undefined here and parses as megabytes.

use tracing::warn;

const MEMORY_SCALES: &[(&str, i64)] = &[
    ("ki", 1024),
    ("k", 1000),
    ("mi", 1024 * 1024),
    ("m", 1000 * 1000),
    ("gi", 1024 * 1024 * 1024),
    ("g", 1000 * 1000 * 1000),
];

/// Convert a Kubernetes memory resource string into a bytes integer.
///
/// For example, "50k", "2Gi", ... will be converted into its representative
/// bytes and returned as an integer. Empty values return 0, as do values
/// that fail to parse, which are logged as a diagnostic instead of raising.
pub fn to_bytes(size: &str) -> i64 {
    let size = size.trim();
    if size.is_empty() {
        return 0;
    }

    let digits_end = size
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(size.len());
    let (value, units) = size.split_at(digits_end);

    if units.is_empty() {
        return match value.parse::<i64>() {
            Ok(v) => v,
            Err(error) => {
                warn!("Unknown size identifier \"{size}\" ({error})");
                0
            }
        };
    }

    let scale = MEMORY_SCALES
        .iter()
        .find(|(suffix, _)| units.eq_ignore_ascii_case(suffix))
        .map(|(_, scale)| *scale);
    match (value.parse::<f64>(), scale) {
        (Ok(v), Some(scale)) => (v * scale as f64) as i64,
        _ => {
            warn!("Unknown size identifier \"{size}\"");
            0
        }
    }
}

/// Convert a Kubernetes CPU resource string into a float value.
///
/// For example, "1", "1.2", "400m", ... will be converted into its
/// representative vCPU float value. Empty or unparseable values return 0.
pub fn to_cpus(size: &str) -> f64 {
    let size = size.trim();
    if size.is_empty() {
        return 0.0;
    }

    if let Ok(value) = size.parse::<f64>() {
        return value;
    }

    // Handles the milliCPU unit case.
    if let Some(Ok(millis)) = size.strip_suffix('m').map(str::parse::<f64>) {
        return millis / 1000.0;
    }

    warn!("Unknown cpu identifier \"{size}\"");
    0.0
}

/// Format a byte count with the largest binary unit that divides it evenly.
pub fn format_bytes(value: i64) -> String {
    const UNITS: &[(&str, i64)] = &[
        ("Gi", 1024 * 1024 * 1024),
        ("Mi", 1024 * 1024),
        ("Ki", 1024),
    ];
    for (suffix, scale) in UNITS {
        if value != 0 && value % scale == 0 {
            return format!("{}{}", value / scale, suffix);
        }
    }
    value.to_string()
}

/// Format a vCPU value as whole cores or milliCPUs.
pub fn format_cpus(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}m", (value * 1000.0).round() as i64)
    }
}
