//! Formatting helpers for CLI output.

/// Formats a millisecond count for humans (e.g. "250 ms", "1.5 s").
#[allow(clippy::cast_precision_loss)]
pub fn format_millis(ms: u64) -> String {
    const SECOND: u64 = 1000;
    const MINUTE: u64 = 60 * SECOND;

    if ms >= MINUTE {
        format!("{:.1} min", ms as f64 / MINUTE as f64)
    } else if ms >= SECOND {
        format!("{:.1} s", ms as f64 / SECOND as f64)
    } else {
        format!("{ms} ms")
    }
}

/// Renders a rule switch.
pub const fn on_off(enabled: bool) -> &'static str {
    if enabled { "on" } else { "off" }
}
