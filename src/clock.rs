//! Conversion between elapsed seconds and the `H:M:S` seek offsets handed to the encoder.

/// Parses an `H:M:S` location into its three components.
///
/// Anything with fewer than three `:`-separated parts yields all zeroes, and a
/// component that is not a number counts as zero.
pub fn parse_location(location: &str) -> (u64, u64, u64) {
    let parts: Vec<&str> = location.split(':').collect();
    if parts.len() < 3 {
        return (0, 0, 0);
    }

    let field = |s: &str| s.trim().parse::<u64>().unwrap_or(0);
    (field(parts[0]), field(parts[1]), field(parts[2]))
}

/// Total number of seconds described by an `H:M:S` location.
///
/// A location too large to count in seconds yields zero, the same as no seek.
pub fn location_seconds(location: &str) -> u64 {
    let (h, m, s) = parse_location(location);
    h.checked_mul(60)
        .and_then(|v| v.checked_add(m))
        .and_then(|v| v.checked_mul(60))
        .and_then(|v| v.checked_add(s))
        .unwrap_or(0)
}

/// Formats seconds as `H:M:S` without zero padding, e.g. `3725` -> `1:2:5`.
pub fn format_location(seconds: u64) -> String {
    let h = seconds / 3600;
    let m = (seconds / 60) % 60;
    let s = seconds % 60;
    format!("{}:{}:{}", h, m, s)
}
