//! Human-readable formatting of sizes, durations, and transfer rates.
use std::time::Duration;

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
const RATE_UNITS: [&str; 4] = ["B/s", "KB/s", "MB/s", "GB/s"];

fn scale(mut value: f64, units: usize) -> (f64, usize) {
    let mut index = 0;
    while value >= 1024.0 && index < units - 1 {
        value /= 1024.0;
        index += 1;
    }
    (value, index)
}

/// Formats a byte count with binary (1024) steps, e.g. `3.73 GB`.
pub fn bytes(n: u64) -> String {
    let (value, index) = scale(n as f64, SIZE_UNITS.len());
    if index == 0 {
        format!("{:.0} {}", value, SIZE_UNITS[index])
    } else {
        format!("{:.2} {}", value, SIZE_UNITS[index])
    }
}

/// Formats a throughput in bytes per second.
pub fn rate(bytes_per_sec: f64) -> String {
    let (value, index) = scale(bytes_per_sec.max(0.0), RATE_UNITS.len());
    format!("{:.2} {}", value, RATE_UNITS[index])
}

/// Formats a remaining-time estimate. Zero renders as `--`.
pub fn duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs == 0 {
        "--".to_string()
    } else if secs < 60 {
        format!("{secs}s")
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}
