//! Variable-length integer codec.
//!
//! The fp5 format stores field references and record identifiers as
//! big-endian, self-delimiting unsigned integers. The first byte selects
//! the length class:
//!
//! ```text
//! first byte   total bytes   value range
//! 00..7F       1             0x00..0x7F
//! 80..BF       2             0x80..0x407F
//! C0..DF       3             0x4080..0x20407F
//! E0..EF       4             0x204080..0x1020407F
//! F0..F7       5             0x10204080..0x81020407F
//! ```
//!
//! Each class encodes the value *offset* from the class base, so encoded
//! length is strictly monotonic in the value and every value has exactly
//! one shortest representation.

/// Largest encodable value (`0xF7 FF FF FF FF`).
pub const MAX_VLI: u64 = 0x08_1020_407F;

/// Number of bytes a VLI occupies, derived from its first byte.
///
/// Returns `None` for bytes outside every length class (`0xF8..0xFF`).
pub fn len_from_first_byte(b: u8) -> Option<usize> {
    match b {
        0x00..=0x7F => Some(1),
        0x80..=0xBF => Some(2),
        0xC0..=0xDF => Some(3),
        0xE0..=0xEF => Some(4),
        0xF0..=0xF7 => Some(5),
        _ => None,
    }
}

/// Decode a VLI occupying the whole of `src`.
///
/// `subtract_64` applies the `-0x40` bias of the single-byte short
/// field-reference token form (so that byte `0x40` maps to reference 0).
pub fn decode(src: &[u8], subtract_64: bool) -> Option<u64> {
    let len = len_from_first_byte(*src.first()?)?;
    if src.len() != len {
        return None;
    }

    match len {
        1 => {
            let v = src[0] as u64;
            if subtract_64 {
                v.checked_sub(0x40)
            } else {
                Some(v)
            }
        }
        2 => Some(0x80 + ((src[0] - 0x80) as u64) * 0x100 + src[1] as u64),
        3 => Some(
            0x4080
                + ((src[0] - 0xC0) as u64) * 0x1_0000
                + (src[1] as u64) * 0x100
                + src[2] as u64,
        ),
        4 => Some(
            0x20_4080
                + ((src[0] - 0xE0) as u64) * 0x100_0000
                + (src[1] as u64) * 0x1_0000
                + (src[2] as u64) * 0x100
                + src[3] as u64,
        ),
        5 => Some(
            0x1020_4080
                + ((src[0] - 0xF0) as u64) * 0x1_0000_0000
                + (src[1] as u64) * 0x100_0000
                + (src[2] as u64) * 0x1_0000
                + (src[3] as u64) * 0x100
                + src[4] as u64,
        ),
        _ => unreachable!(),
    }
}

/// Encode a value as its shortest VLI representation.
///
/// Fails for values above [`MAX_VLI`].
pub fn encode(value: u64) -> Option<Vec<u8>> {
    match value {
        0x00..=0x7F => Some(vec![value as u8]),
        0x80..=0x407F => {
            let v = (value - 0x80) as u16 | 0x8000;
            Some(v.to_be_bytes().to_vec())
        }
        0x4080..=0x20_407F => {
            let v = (value - 0x4080) as u32 | 0xC0_0000;
            Some(v.to_be_bytes()[1..].to_vec())
        }
        0x20_4080..=0x1020_407F => {
            let v = (value - 0x20_4080) as u32 | 0xE000_0000;
            Some(v.to_be_bytes().to_vec())
        }
        0x1020_4080..=MAX_VLI => {
            let v = (value - 0x1020_4080) | 0xF0_0000_0000;
            Some(v.to_be_bytes()[3..].to_vec())
        }
        _ => None,
    }
}

/// Plain big-endian unsigned read of up to eight bytes (order numbers,
/// modification ids). Longer inputs keep the low 64 bits.
pub fn be_uint(src: &[u8]) -> u64 {
    src.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}

/// Split a combined reference into its primary field reference and the
/// trailing sub-reference bytes (repetition counter), if any.
///
/// The primary length is determined by the first byte's class; anything
/// after it is the sub-reference. Returns `None` when the first byte is
/// outside every class.
pub fn split(src: &[u8]) -> Option<(&[u8], Option<&[u8]>)> {
    let len = len_from_first_byte(*src.first()?)?;
    if len > src.len() {
        return None;
    }
    if len < src.len() {
        Some((&src[..len], Some(&src[len..])))
    } else {
        Some((src, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    // ── Boundary Fixtures ─────────────────────────────────────────

    #[test]
    fn test_decode_class_boundaries() {
        assert_eq!(decode(&[0x00], false), Some(0));
        assert_eq!(decode(&[0x7F], false), Some(127));
        assert_eq!(decode(&[0x80, 0x00], false), Some(128));
        assert_eq!(decode(&[0xBF, 0xFF], false), Some(16511));
        assert_eq!(decode(&[0xC0, 0x00, 0x00], false), Some(16512));
        assert_eq!(decode(&[0xE0, 0x00, 0x00, 0x00], false), Some(2_113_664));
        assert_eq!(
            decode(&[0xF0, 0x00, 0x00, 0x00, 0x00], false),
            Some(270_549_120)
        );
    }

    #[test]
    fn test_decode_subtract_64() {
        assert_eq!(decode(&[0x40], true), Some(0));
        assert_eq!(decode(&[0x41], true), Some(1));
        assert_eq!(decode(&[0x7F], true), Some(0x3F));
        // Underflow: bytes below 0x40 have no short-form meaning.
        assert_eq!(decode(&[0x3F], true), None);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        assert_eq!(decode(&[], false), None);
        assert_eq!(decode(&[0x80], false), None);
        assert_eq!(decode(&[0x00, 0x00], false), None);
        assert_eq!(decode(&[0xC0, 0x00], false), None);
        assert_eq!(decode(&[0xF8], false), None);
        assert_eq!(decode(&[0xFF, 0xFF], false), None);
    }

    #[test]
    fn test_encode_boundaries() {
        assert_eq!(encode(0), Some(vec![0x00]));
        assert_eq!(encode(0x7F), Some(vec![0x7F]));
        assert_eq!(encode(0x80), Some(vec![0x80, 0x00]));
        assert_eq!(encode(0x407F), Some(vec![0xBF, 0xFF]));
        assert_eq!(encode(0x4080), Some(vec![0xC0, 0x00, 0x00]));
        assert_eq!(encode(0x20_407F), Some(vec![0xDF, 0xFF, 0xFF]));
        assert_eq!(encode(0x20_4080), Some(vec![0xE0, 0x00, 0x00, 0x00]));
        assert_eq!(encode(0x1020_407F), Some(vec![0xEF, 0xFF, 0xFF, 0xFF]));
        assert_eq!(
            encode(0x1020_4080),
            Some(vec![0xF0, 0x00, 0x00, 0x00, 0x00])
        );
        assert_eq!(encode(MAX_VLI), Some(vec![0xF7, 0xFF, 0xFF, 0xFF, 0xFF]));
        assert_eq!(encode(MAX_VLI + 1), None);
        assert_eq!(encode(u64::MAX), None);
    }

    #[test]
    fn test_split_combined_reference() {
        // Two single-byte VLIs: field ref 5, sub ref 2.
        assert_eq!(split(&[0x05, 0x02]), Some((&[0x05][..], Some(&[0x02][..]))));
        // A lone reference has no sub-reference.
        assert_eq!(split(&[0x05]), Some((&[0x05][..], None)));
        // Two-byte primary followed by one-byte sub.
        assert_eq!(
            split(&[0x80, 0x10, 0x03]),
            Some((&[0x80, 0x10][..], Some(&[0x03][..])))
        );
        // Truncated primary.
        assert_eq!(split(&[0x80]), None);
        assert_eq!(split(&[]), None);
        assert_eq!(split(&[0xFC]), None);
    }

    // ── Round-trip Law ────────────────────────────────────────────

    proptest! {
        #[test]
        fn prop_roundtrip(n in 0u64..=MAX_VLI) {
            let bytes = encode(n).expect("value in encodable range");
            prop_assert_eq!(decode(&bytes, false), Some(n));
            prop_assert_eq!(len_from_first_byte(bytes[0]), Some(bytes.len()));
        }

        #[test]
        fn prop_length_monotonic(a in 0u64..=MAX_VLI, b in 0u64..=MAX_VLI) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let lo_len = encode(lo).unwrap().len();
            let hi_len = encode(hi).unwrap().len();
            prop_assert!(lo_len <= hi_len);
        }
    }
}
