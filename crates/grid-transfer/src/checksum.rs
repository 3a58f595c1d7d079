//! Checksum comparison helpers.
//!
//! Different storages render the same digest differently: upper vs. lower
//! case, and ADLER32 values with or without leading zero padding. Equality
//! is therefore decided on a normalized form.

/// Normalize a checksum string: trim whitespace, drop an optional `0x`
/// prefix, strip leading zeros and lowercase the rest.
fn normalize(value: &str) -> String {
    let trimmed = value.trim();
    let trimmed = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let stripped = trimmed.trim_start_matches('0');
    if stripped.is_empty() {
        // all zeros normalizes to a single zero
        "0".to_string()
    } else {
        stripped.to_ascii_lowercase()
    }
}

/// Compare two checksum strings ignoring case and leading zeros.
pub fn checksums_equal(a: &str, b: &str) -> bool {
    normalize(a) == normalize(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive() {
        assert!(checksums_equal("1A2B3C4D", "1a2b3c4d"));
        assert!(checksums_equal("DEADBEEF", "deadbeef"));
    }

    #[test]
    fn test_leading_zeros_ignored() {
        assert!(checksums_equal("0007a23b", "7a23b"));
        assert!(checksums_equal("00000000", "0"));
        assert!(checksums_equal("0x1a2b", "1a2b"));
    }

    #[test]
    fn test_mismatch() {
        assert!(!checksums_equal("7a23b", "7a23c"));
        assert!(!checksums_equal("1a2b", "1a2b0"));
        assert!(!checksums_equal("abc", ""));
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert!(checksums_equal(" 7a23b ", "7a23b"));
    }
}
