//! Resource quantity parsing for control-plane payloads.
//!
//! CPU is normalized to millicores, memory to bytes. Malformed input yields 0
//! rather than an error: metrics are best-effort and must not fail a tick.

const BINARY_SUFFIXES: [(&str, u32); 6] = [
    ("Ki", 1),
    ("Mi", 2),
    ("Gi", 3),
    ("Ti", 4),
    ("Pi", 5),
    ("Ei", 6),
];

const DECIMAL_SUFFIXES: [(&str, u32); 7] = [
    ("k", 1),
    ("K", 1),
    ("M", 2),
    ("G", 3),
    ("T", 4),
    ("P", 5),
    ("E", 6),
];

/// `250m` → 250, `1` → 1000, `0.5` → 500, `1500000n` → 2 (rounded), `750u` → 1.
pub fn parse_cpu_millicores(raw: &str) -> u64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }

    // (number, multiplier, divisor) so that nano and micro values divide exactly
    let (number, multiplier, divisor) = if let Some(n) = raw.strip_suffix('n') {
        (n, 1.0, 1e6)
    } else if let Some(u) = raw.strip_suffix('u') {
        (u, 1.0, 1e3)
    } else if let Some(m) = raw.strip_suffix('m') {
        (m, 1.0, 1.0)
    } else {
        (raw, 1000.0, 1.0)
    };

    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => {
            (value * multiplier / divisor).round() as u64
        }
        _ => 0,
    }
}

/// `512Mi` → 536870912, `1G` → 1000000000, `2048` → 2048.
pub fn parse_memory_bytes(raw: &str) -> u64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0;
    }

    for (suffix, power) in BINARY_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return scale(number, 1024f64.powi(power as i32));
        }
    }
    for (suffix, power) in DECIMAL_SUFFIXES {
        if let Some(number) = raw.strip_suffix(suffix) {
            return scale(number, 1000f64.powi(power as i32));
        }
    }
    scale(raw, 1.0)
}

fn scale(number: &str, factor: f64) -> u64 {
    match number.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => (value * factor).round() as u64,
        _ => 0,
    }
}

const BYTE_UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

/// Human-readable binary size with one decimal (`512.0 MiB`).
pub fn format_bytes(bytes: u64) -> String {
    let (value, unit) = scaled_bytes(bytes);
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", BYTE_UNITS[unit])
    }
}

/// Value and unit index used by `format_bytes`.
pub fn scaled_bytes(bytes: u64) -> (f64, usize) {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    (value, unit)
}

/// Share of `used` in `total` as a percentage, 0 when the total is unknown.
pub fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_units() {
        assert_eq!(parse_cpu_millicores("250m"), 250);
        assert_eq!(parse_cpu_millicores("1"), 1000);
        assert_eq!(parse_cpu_millicores("0.5"), 500);
        assert_eq!(parse_cpu_millicores("2"), 2000);
        assert_eq!(parse_cpu_millicores("125000000n"), 125);
        assert_eq!(parse_cpu_millicores("1500000n"), 2);
        assert_eq!(parse_cpu_millicores("3000u"), 3);
    }

    #[test]
    fn cpu_garbage_is_zero() {
        assert_eq!(parse_cpu_millicores(""), 0);
        assert_eq!(parse_cpu_millicores("lots"), 0);
        assert_eq!(parse_cpu_millicores("-1"), 0);
    }

    #[test]
    fn memory_units() {
        assert_eq!(parse_memory_bytes("512Mi"), 512 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1Gi"), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("64Ki"), 64 * 1024);
        assert_eq!(parse_memory_bytes("1Ti"), 1024u64.pow(4));
        assert_eq!(parse_memory_bytes("1G"), 1_000_000_000);
        assert_eq!(parse_memory_bytes("128M"), 128_000_000);
        assert_eq!(parse_memory_bytes("10k"), 10_000);
        assert_eq!(parse_memory_bytes("2048"), 2048);
        assert_eq!(parse_memory_bytes("1.5Gi"), 1_610_612_736);
        assert_eq!(parse_memory_bytes("Mi"), 0);
    }

    #[test]
    fn format_bytes_examples() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(512 * 1024 * 1024), "512.0 MiB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.0 GiB");
    }

    #[test]
    fn format_bytes_is_monotonic() {
        let mut samples: Vec<u64> = Vec::new();
        let mut n: u64 = 1;
        while n < u64::MAX / 3 {
            samples.extend([n - 1, n, n + 1, n * 2 - 1]);
            n *= 3;
        }
        samples.sort_unstable();

        let mut previous = (0usize, 0.0f64);
        for bytes in samples {
            let (value, unit) = scaled_bytes(bytes);
            let rendered: f64 = format_bytes(bytes)
                .split(' ')
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap();
            assert!((value - rendered).abs() <= 0.051);
            assert!(
                unit > previous.0 || (unit == previous.0 && rendered >= previous.1),
                "format_bytes went backwards at {bytes}"
            );
            previous = (unit, rendered);
        }
    }

    #[test]
    fn percent_handles_zero_total() {
        assert_eq!(percent(5, 0), 0.0);
        assert_eq!(percent(50, 200), 25.0);
    }
}
