use chrono::{DateTime, Utc};

/// Binary units, largest first; shared by parsing and printing.
const UNITS: [(char, &str, u64); 4] = [
    ('T', "TiB", 1 << 40),
    ('G', "GiB", 1 << 30),
    ('M', "MiB", 1 << 20),
    ('K', "KiB", 1 << 10),
];

/// Volume size given on the command line, e.g. `64K`, `1.5M`, `2g`.
pub(crate) fn parse_size(raw: &str) -> Result<u64, String> {
    let text = raw.trim();
    let (number, scale) = match text.chars().last().map(|c| c.to_ascii_uppercase()) {
        Some(suffix) if suffix.is_ascii_alphabetic() => {
            let scale = UNITS
                .iter()
                .find(|(c, _, _)| *c == suffix)
                .map(|(_, _, scale)| *scale)
                .ok_or_else(|| format!("unknown size suffix in '{raw}'"))?;
            (&text[..text.len() - 1], scale)
        }
        Some(_) => (text, 1),
        None => return Err("size must not be empty".to_string()),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid size '{raw}'"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid size '{raw}'"));
    }
    Ok((value * scale as f64).round() as u64)
}

pub(crate) fn format_bytes(bytes: u64) -> String {
    UNITS
        .iter()
        .find(|(_, _, scale)| bytes >= *scale)
        .map(|(_, name, scale)| format!("{:.2} {name}", bytes as f64 / *scale as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}

pub(crate) fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

pub(crate) fn format_opt_time(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "-".to_string(), format_time)
}
