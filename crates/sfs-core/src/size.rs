//! Byte-size option parsing.
//!
//! Numeric size and offset options accept a decimal value with an optional
//! single-letter binary-magnitude suffix: `K` = 2^10, `M` = 2^20, `G` = 2^30,
//! `T` = 2^40, and `B` = 1. Suffixes are case-insensitive.

use sfs_error::{Result, SliceError};

/// Parse a byte-size value such as `4096`, `64K`, `2m`, or `1G`.
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(SliceError::InvalidArgument(
            "empty size value".into(),
        ));
    }

    let (digits, multiplier) = match trimmed.as_bytes()[trimmed.len() - 1] {
        b'k' | b'K' => (&trimmed[..trimmed.len() - 1], 1_u64 << 10),
        b'm' | b'M' => (&trimmed[..trimmed.len() - 1], 1_u64 << 20),
        b'g' | b'G' => (&trimmed[..trimmed.len() - 1], 1_u64 << 30),
        b't' | b'T' => (&trimmed[..trimmed.len() - 1], 1_u64 << 40),
        b'b' | b'B' => (&trimmed[..trimmed.len() - 1], 1),
        _ => (trimmed, 1),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| SliceError::InvalidArgument(format!("invalid size value [{trimmed}]")))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| SliceError::InvalidArgument(format!("size value [{trimmed}] overflows")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_decimal() {
        assert_eq!(parse_byte_size("0").unwrap(), 0);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size(" 512 ").unwrap(), 512);
    }

    #[test]
    fn magnitude_suffixes() {
        assert_eq!(parse_byte_size("1B").unwrap(), 1);
        assert_eq!(parse_byte_size("2K").unwrap(), 2048);
        assert_eq!(parse_byte_size("2k").unwrap(), 2048);
        assert_eq!(parse_byte_size("3M").unwrap(), 3 << 20);
        assert_eq!(parse_byte_size("1G").unwrap(), 1 << 30);
        assert_eq!(parse_byte_size("1T").unwrap(), 1 << 40);
    }

    #[test]
    fn rejects_garbage() {
        for bad in ["", "K", "12Q", "4,096", "-1", "1.5M", "0x10"] {
            assert!(
                matches!(parse_byte_size(bad), Err(SliceError::InvalidArgument(_))),
                "expected rejection of [{bad}]"
            );
        }
    }

    #[test]
    fn rejects_overflow() {
        assert!(parse_byte_size("18446744073709551615").is_ok());
        assert!(parse_byte_size("18446744073709551616").is_err());
        assert!(parse_byte_size("18014398509481984K").is_err());
    }
}
