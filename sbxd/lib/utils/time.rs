use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a duration string like `300ms`, `90s`, `15m`, `1h30m`.
///
/// Accepts the unit suffixes `ns`, `us`, `ms`, `s`, `m`, `h` with an optional
/// decimal fraction per segment, matching the duration syntax the
/// configuration file has always used. Returns `None` for anything malformed.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: f64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];
        let unit_len = if rest.starts_with("ns") || rest.starts_with("us") || rest.starts_with("ms")
        {
            2
        } else if rest.starts_with('s') || rest.starts_with('m') || rest.starts_with('h') {
            1
        } else {
            return None;
        };
        let nanos = match &rest[..unit_len] {
            "ns" => value,
            "us" => value * 1_000.0,
            "ms" => value * 1_000_000.0,
            "s" => value * 1_000_000_000.0,
            "m" => value * 60.0 * 1_000_000_000.0,
            "h" => value * 3_600.0 * 1_000_000_000.0,
            _ => return None,
        };
        total += Duration::from_nanos(nanos as u64);
        rest = &rest[unit_len..];
    }
    Some(total)
}

/// Renders an age the way the sandbox listing has always shown it:
/// `0s` below a second, then whole seconds, minutes, hours, days.
pub fn format_age(age: Duration) -> String {
    if age < Duration::from_secs(1) {
        return "0s".to_string();
    }
    let secs = age.as_secs();
    if secs < 60 {
        return format!("{}s", secs);
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m", mins);
    }
    let hrs = mins / 60;
    if hrs < 24 {
        return format!("{}h", hrs);
    }
    format!("{}d", hrs / 24)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_single_units() {
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_duration_compound_and_fractional() {
        assert_eq!(parse_duration("1h30m"), Some(Duration::from_secs(5400)));
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("10"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("10x"), None);
    }

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(Duration::from_millis(200)), "0s");
        assert_eq!(format_age(Duration::from_secs(45)), "45s");
        assert_eq!(format_age(Duration::from_secs(12 * 60)), "12m");
        assert_eq!(format_age(Duration::from_secs(3 * 3600)), "3h");
        assert_eq!(format_age(Duration::from_secs(50 * 3600)), "2d");
    }
}
