//! Human-readable labels for dashboard readouts.

const UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

const MIB: f64 = 1024.0 * 1024.0;

fn scale(mut value: f64) -> (f64, &'static str) {
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    (value, UNITS[unit])
}

/// Formats a byte count with binary units, e.g. `"1.50 KB"`.
pub fn data_size(bytes: f64) -> String {
    if bytes <= 0.0 {
        return "0 B".to_string();
    }
    let (value, unit) = scale(bytes);
    format!("{value:.2} {unit}")
}

/// Formats a byte rate with binary units, e.g. `"2.00 MB/s"`.
pub fn data_rate(bytes_per_second: f64) -> String {
    if bytes_per_second <= 0.0 {
        return "0 B/s".to_string();
    }
    let (value, unit) = scale(bytes_per_second);
    format!("{value:.2} {unit}/s")
}

/// Rounds to the nearest whole unit the way timing readouts display it.
pub fn whole(value: f64) -> i64 {
    value.round() as i64
}

pub fn millis(average: f64, max: f64) -> String {
    format!("{} ms - max: {} ms", whole(average), whole(max))
}

pub fn millis_share(average: f64, max: f64, share: i64) -> String {
    format!("{} ms - max: {} ms | {share}%", whole(average), whole(max))
}

pub fn ratio(value: f64, max: f64) -> String {
    format!("{value:.2} - max: {max:.2}")
}

/// Percentage of `part` in `total`, rounded; 0 when `total` is 0.
pub fn share(part: f64, total: f64) -> i64 {
    if total > 0.0 {
        whole(100.0 * part / total)
    } else {
        0
    }
}

/// Truncated percentage of `part` in `total`; 0 when `total` is 0.
pub fn percent_floor(part: f64, total: f64) -> i64 {
    if total > 0.0 {
        (100.0 * part / total) as i64
    } else {
        0
    }
}

/// Inputs to the payload fullness label, all percentages of the maximum
/// payload size.
#[derive(Debug, Clone, Copy)]
pub struct Fullness {
    pub average_pct: f64,
    pub current_pct: i64,
    pub payload_size: u64,
    pub max_payload_size: u64,
    pub min_pct: i64,
    pub max_pct: i64,
}

pub fn fullness(f: &Fullness) -> String {
    format!(
        "{:06.2}% - C: {:03}% ({:06} / {} bytes) - min: {:03}% - max: {:03}%",
        f.average_pct, f.current_pct, f.payload_size, f.max_payload_size, f.min_pct, f.max_pct
    )
}

/// Payload fullness rebuilt from chart history, when no live payload size is
/// known.
pub fn fullness_summary(average_pct: f64, min_pct: f64, max_pct: f64) -> String {
    format!(
        "MA: {average_pct:.2}% - min: {}% - max: {}%",
        whole(min_pct),
        whole(max_pct)
    )
}

pub fn cache_fullness(used_bytes: u64, capacity_bytes: u64, pct: i64) -> String {
    format!(
        "{:.2} / {:.2} MB | {pct}%",
        used_bytes as f64 / MIB,
        capacity_bytes as f64 / MIB
    )
}

pub fn fraction(part: u64, total: u64, pct: i64) -> String {
    format!("{part} / {total} | {pct}%")
}
