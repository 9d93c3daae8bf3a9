//! Human-readable renderings of durations and timestamps.

use chrono::DateTime;

/// Formats a number of seconds as `"1h 2m 3s"`, `"2m 3s"` or `"3s"`.
///
/// Leading zero units are dropped. Zero and negative values render as `"0s"`.
pub fn format_time(seconds: i64) -> String {
    if seconds <= 0 {
        return "0s".to_string();
    }
    let secs = seconds % 60;
    let total_minutes = seconds / 60;
    let hours = total_minutes / 60;
    let minutes = total_minutes % 60;

    if hours > 0 {
        format!("{hours}h {minutes}m {secs}s")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

/// Formats epoch seconds as `YYYY-MM-DD HH:MM:SS` in UTC.
pub fn format_timestamp(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}
