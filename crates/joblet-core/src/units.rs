//! Storage unit parsing and display.

use std::str::FromStr;

use bytesize::ByteSize;

/// Represents a storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorageUnit {
    /// The unit is in bytes.
    #[default]
    Bytes,
    /// The unit is in kilobytes (10^3 bytes).
    Kilobytes,
    /// The unit is in megabytes (10^6 bytes).
    Megabytes,
    /// The unit is in gigabytes (10^9 bytes).
    Gigabytes,
    /// The unit is in terabytes (10^12 bytes).
    Terabytes,
    /// The unit is in kibibytes (2^10 bytes).
    Kibibytes,
    /// The unit is in mebibytes (2^20 bytes).
    Mebibytes,
    /// The unit is in gibibytes (2^30 bytes).
    Gibibytes,
    /// The unit is in tebibytes (2^40 bytes).
    Tebibytes,
}

impl StorageUnit {
    /// Gets the number of bytes in one of this unit.
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Bytes => 1,
            Self::Kilobytes => 1000,
            Self::Megabytes => 1000 * 1000,
            Self::Gigabytes => 1000 * 1000 * 1000,
            Self::Terabytes => 1000 * 1000 * 1000 * 1000,
            Self::Kibibytes => 1 << 10,
            Self::Mebibytes => 1 << 20,
            Self::Gibibytes => 1 << 30,
            Self::Tebibytes => 1 << 40,
        }
    }
}

impl FromStr for StorageUnit {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "B" => Ok(Self::Bytes),
            "KB" | "K" => Ok(Self::Kilobytes),
            "MB" | "M" => Ok(Self::Megabytes),
            "GB" | "G" => Ok(Self::Gigabytes),
            "TB" | "T" => Ok(Self::Terabytes),
            "KiB" | "Ki" => Ok(Self::Kibibytes),
            "MiB" | "Mi" => Ok(Self::Mebibytes),
            "GiB" | "Gi" => Ok(Self::Gibibytes),
            "TiB" | "Ti" => Ok(Self::Tebibytes),
            _ => Err(()),
        }
    }
}

/// Converts a size string (e.g. `512MiB`, `2G`, `1048576`) into a number of
/// bytes.
///
/// The numeric part may be fractional (`1.5GiB`); the result is truncated
/// to whole bytes. Returns `None` for strings that are not a number
/// followed by a recognised unit.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }

    let unit: StorageUnit = unit.trim().parse().ok()?;
    Some((value * unit.bytes() as f64) as u64)
}

/// Formats a byte count for human display (e.g. `512.0 MiB`).
pub fn display_size(bytes: u64) -> String {
    ByteSize::b(bytes).display().iec().to_string()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_plain_byte_counts() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("1048576"), Some(1 << 20));
    }

    #[test]
    fn parses_decimal_and_binary_units() {
        assert_eq!(parse_size("2K"), Some(2000));
        assert_eq!(parse_size("2KiB"), Some(2048));
        assert_eq!(parse_size("512MiB"), Some(512 << 20));
        assert_eq!(parse_size("1.5GiB"), Some(3 << 29));
        assert_eq!(parse_size(" 100 MB "), Some(100_000_000));
    }

    #[test]
    fn rejects_malformed_sizes() {
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("MiB"), None);
        assert_eq!(parse_size("12QB"), None);
        assert_eq!(parse_size("-1"), None);
    }
}
