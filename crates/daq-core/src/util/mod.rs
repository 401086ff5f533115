//! Small shared helpers: byte formatting, counter statistics, log muting.

mod counter;
mod logtoken;

pub use counter::CounterStats;
pub use logtoken::LogToken;

/// Formats a byte count (or rate) as a 3+3 digit value with a base-1024
/// prefix, e.g. `format_bytes(3_200_000.0, "B/s")` -> "3.052 MB/s".
pub fn format_bytes(value: f64, suffix: &str) -> String {
    const PREFIXES: [&str; 6] = ["", "k", "M", "G", "T", "P"];
    if !value.is_finite() || value <= 0.0 {
        return format!("0 {}", suffix);
    }
    let mut idx = (value.log2() / 10.0).floor() as usize;
    if idx >= PREFIXES.len() {
        idx = PREFIXES.len() - 1;
    }
    let scaled = value / f64::powi(1024.0, idx as i32);
    let digits = if scaled >= 100.0 {
        1
    } else if scaled >= 10.0 {
        2
    } else {
        3
    };
    format!("{:.*} {}{}", digits, scaled, PREFIXES[idx], suffix)
}
