//! Human-readable byte counts.

const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

pub const KIB: u64 = 1024;
pub const MIB: u64 = 1024 * KIB;
pub const GIB: u64 = 1024 * MIB;

/// Format a byte count with binary multiples.
///
/// Counts below one kilobyte print exactly (`1023B`); larger ones are rounded
/// to a whole number of the largest fitting unit (`1 KB`, `5 GB`).
pub fn human_size(bytes: u64) -> String {
    if bytes < KIB {
        return format!("{bytes}B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    // 1023.6 KB prints as 1 MB, not 1024 KB
    if value.round() >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.0} {}", UNITS[unit])
}

/// Format a transfer rate the way progress lines show it.
pub fn human_rate(bytes_per_sec: u64) -> String {
    format!("{:.2} MB/s", bytes_per_sec as f64 / MIB as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn boundaries() {
        assert_eq!(human_size(0), "0B");
        assert_eq!(human_size(1023), "1023B");
        assert_eq!(human_size(1024), "1 KB");
        assert_eq!(human_size(MIB - 1), "1 MB");
        assert_eq!(human_size(MIB), "1 MB");
        assert_eq!(human_size(GIB - 1), "1 GB");
        assert_eq!(human_size(GIB), "1 GB");
        assert_eq!(human_size(1024 * GIB - 1), "1 TB");
        assert_eq!(human_size(MIB - KIB / 2 - 1), "1023 KB");
        assert_eq!(human_size(5_000_000_000), "5 GB");
        assert_eq!(human_size(3 * 1024 * GIB), "3 TB");
    }

    #[test]
    fn petabytes_stay_in_terabytes() {
        assert_eq!(human_size(2048 * 1024 * GIB), "2048 TB");
    }

    #[test]
    fn rate_uses_two_decimals() {
        assert_eq!(human_rate(0), "0.00 MB/s");
        assert_eq!(human_rate(MIB + MIB / 2), "1.50 MB/s");
    }

    proptest! {
        #[test]
        fn small_counts_print_exactly(n in 0u64..1024) {
            prop_assert_eq!(human_size(n), format!("{n}B"));
        }

        #[test]
        fn large_counts_carry_a_spaced_unit(n in 1024u64..u64::MAX) {
            let rendered = human_size(n);
            let (number, unit) = rendered.split_once(' ').expect("spaced unit");
            prop_assert!(UNITS[1..].contains(&unit));
            let number = number.parse::<u64>().expect("whole number");
            prop_assert!(number < 1024 || unit == "TB", "{}", rendered);
        }
    }
}
