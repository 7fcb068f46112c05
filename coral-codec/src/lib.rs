//! RESP wire primitives shared by the client- and shard-side codecs.

pub mod buffer;
pub mod command;
pub mod lines;

pub use buffer::{CodecError, RespCursor};

/// Parses a RESP length prefix.
///
/// Accepts exactly `-1` (the nil marker) or a non-negative decimal integer; anything
/// else is a protocol violation.
///
/// # Errors
///
/// Returns `CodecError::InvalidResp` for empty input, stray signs, or non-digit bytes.
pub fn parse_len(bytes: &[u8]) -> Result<i64, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::InvalidResp);
    }
    if bytes == b"-1" {
        return Ok(-1);
    }

    let mut value: i64 = 0;
    for byte in bytes {
        if !byte.is_ascii_digit() {
            return Err(CodecError::InvalidResp);
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add(i64::from(byte - b'0')))
            .ok_or(CodecError::InvalidResp)?;
    }
    Ok(value)
}

/// Folds ASCII uppercase bytes to lowercase in place.
///
/// Command names arrive in arbitrary case; folding in place avoids a copy on the
/// hot parse path.
pub fn fold_ascii_lower(bytes: &mut [u8]) {
    for byte in bytes {
        if byte.is_ascii_uppercase() {
            *byte ^= 0x20;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{fold_ascii_lower, parse_len, CodecError};
    use googletest::prelude::*;
    use rstest::rstest;

    #[rstest]
    #[case(b"0".as_slice(), 0)]
    #[case(b"7".as_slice(), 7)]
    #[case(b"16384".as_slice(), 16384)]
    #[case(b"-1".as_slice(), -1)]
    fn parse_len_accepts_nil_and_decimals(#[case] input: &[u8], #[case] expect: i64) {
        assert_that!(parse_len(input), eq(Ok(expect)));
    }

    #[rstest]
    #[case(b"".as_slice())]
    #[case(b"-2".as_slice())]
    #[case(b"-12".as_slice())]
    #[case(b"+1".as_slice())]
    #[case(b"1a".as_slice())]
    #[case(b" 1".as_slice())]
    fn parse_len_rejects_everything_else(#[case] input: &[u8]) {
        assert_that!(parse_len(input), eq(Err(CodecError::InvalidResp)));
    }

    #[rstest]
    fn fold_lowers_only_ascii_uppercase() {
        let mut name = b"MgEt\x01".to_vec();
        fold_ascii_lower(&mut name);
        assert_that!(&name, eq(&b"mget\x01".to_vec()));
    }
}
