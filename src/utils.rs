//! Miscellaneous functions used by different modules of the explorer.

// -----------------------------------------------------------------------------------------------
// Hex formatting

/// Formats bytes as space-separated uppercase hexadecimal pairs (e.g. `0F 0B`).
pub fn hex_bytes(bytes: &[u8]) -> String {
    bytes.iter().enumerate().fold(
        String::with_capacity(bytes.len() * 3),
        |mut s, (i, b)| {
            if i != 0 {
                s.push(' ');
            }
            s.push_str(&format!("{:02X}", b));
            s
        },
    )
}

/// Parses space-separated hexadecimal pairs, as produced by [`hex_bytes`].
pub fn parse_hex_bytes(s: &str) -> Option<Vec<u8>> {
    s.split_whitespace()
        .map(|b| match b.len() {
            1 | 2 => u8::from_str_radix(b, 16).ok(),
            _ => None,
        })
        .collect()
}

// -----------------------------------------------------------------------------------------------
// Misc functions

/// Returns `true` if bit `n` of `value` is set.
#[inline]
pub fn bit(value: u32, n: u32) -> bool {
    (value >> n) & 1 == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utils_hex_bytes() {
        assert_eq!(hex_bytes(&[]), "");
        assert_eq!(hex_bytes(&[0x0f, 0x0b]), "0F 0B");
        assert_eq!(hex_bytes(&[0xe9, 0, 0, 0, 0]), "E9 00 00 00 00");
    }

    #[test]
    fn utils_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("0F 0B"), Some(vec![0x0f, 0x0b]));
        assert_eq!(parse_hex_bytes("  cc  "), Some(vec![0xcc]));
        assert_eq!(parse_hex_bytes("0F0B"), None);
        assert_eq!(parse_hex_bytes("GG"), None);
        assert_eq!(parse_hex_bytes(""), Some(vec![]));
    }

    #[test]
    fn utils_bits() {
        assert!(bit(1 << 20, 20));
        assert!(!bit(1 << 20, 19));
    }
}
