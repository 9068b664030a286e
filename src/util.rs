//! Shared low-level codecs: bounds-checked little-endian reads, the
//! variable-width integer-list codec used for index position lists, and the
//! glob pattern translation used by the query `like` operator.

use crate::error::{GraphError, Result};

pub fn read_u16_le(buf: &[u8], offset: usize) -> Result<u16> {
    let slice = buf
        .get(offset..offset + 2)
        .ok_or_else(|| GraphError::Corruption(format!("invalid u16 at offset {offset}")))?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub fn read_u32_le(buf: &[u8], offset: usize) -> Result<u32> {
    let slice = buf
        .get(offset..offset + 4)
        .ok_or_else(|| GraphError::Corruption(format!("invalid u32 at offset {offset}")))?;
    let bytes: [u8; 4] = slice.try_into().expect("slice length checked");
    Ok(u32::from_le_bytes(bytes))
}

pub fn read_u64_le(buf: &[u8], offset: usize) -> Result<u64> {
    let slice = buf
        .get(offset..offset + 8)
        .ok_or_else(|| GraphError::Corruption(format!("invalid u64 at offset {offset}")))?;
    let bytes: [u8; 8] = slice.try_into().expect("slice length checked");
    Ok(u64::from_le_bytes(bytes))
}

pub fn read_i64_le(buf: &[u8], offset: usize) -> Result<i64> {
    Ok(read_u64_le(buf, offset)? as i64)
}

/// Packs a list of unsigned integers using the smallest fixed width that can
/// hold `max`. Layout: `[width u8][values little-endian, width bytes each]`.
pub fn pack_list(values: &[u64], max: u64) -> Vec<u8> {
    let width: u8 = if max <= u64::from(u8::MAX) {
        1
    } else if max <= u64::from(u16::MAX) {
        2
    } else if max <= u64::from(u32::MAX) {
        4
    } else {
        8
    };

    let mut buf = Vec::with_capacity(1 + values.len() * width as usize);
    buf.push(width);
    for &v in values {
        buf.extend_from_slice(&v.to_le_bytes()[..width as usize]);
    }
    buf
}

/// Inverse of [`pack_list`].
pub fn unpack_list(buf: &[u8]) -> Result<Vec<u64>> {
    let Some((&width, rest)) = buf.split_first() else {
        return Ok(Vec::new());
    };
    if !matches!(width, 1 | 2 | 4 | 8) {
        return Err(GraphError::Corruption(format!(
            "invalid packed list width {width}"
        )));
    }
    let width = width as usize;
    if rest.len() % width != 0 {
        return Err(GraphError::Corruption(
            "packed list length is not a multiple of its width".into(),
        ));
    }

    let mut values = Vec::with_capacity(rest.len() / width);
    for chunk in rest.chunks_exact(width) {
        let mut bytes = [0u8; 8];
        bytes[..width].copy_from_slice(chunk);
        values.push(u64::from_le_bytes(bytes));
    }
    Ok(values)
}

/// Translates a glob pattern (`*`, `?`, `[...]`) into an anchored regular
/// expression string.
pub fn glob_to_regex(glob: &str) -> String {
    let mut regex = String::with_capacity(glob.len() + 8);
    regex.push('^');

    let mut chars = glob.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '[' => {
                regex.push('[');
                if chars.peek() == Some(&'!') {
                    chars.next();
                    regex.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        break;
                    }
                    if inner == '\\' {
                        regex.push('\\');
                    }
                    regex.push(inner);
                }
                regex.push(']');
            }
            '.' | '+' | '(' | ')' | '|' | '^' | '$' | '{' | '}' | '\\' | ']' => {
                regex.push('\\');
                regex.push(c);
            }
            other => regex.push(other),
        }
    }

    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pack_list_round_trip_widths() {
        for max in [7u64, 300, 70_000, 5_000_000_000] {
            let values = vec![0, 1, max / 2, max];
            let packed = pack_list(&values, max);
            assert_eq!(unpack_list(&packed).expect("unpack"), values);
        }
    }

    #[test]
    fn unpack_rejects_bad_width() {
        assert!(unpack_list(&[3, 1, 2, 3]).is_err());
    }

    #[test]
    fn glob_translation_calibration() {
        let cases = [
            ("*.song", "title.song", true),
            ("*.song", "title.songx", false),
            ("a?c", "abc", true),
            ("a?c", "ac", false),
            ("n[ao]de", "node", true),
            ("n[ao]de", "nude", false),
            ("lit(eral)", "lit(eral)", true),
        ];
        for (glob, input, expect) in cases {
            let re = regex::Regex::new(&glob_to_regex(glob)).expect("compile");
            assert_eq!(re.is_match(input), expect, "glob {glob} against {input}");
        }
    }

    proptest! {
        #[test]
        fn pack_list_round_trip(values in proptest::collection::vec(0u64..100_000, 0..64)) {
            let max = values.iter().copied().max().unwrap_or(0);
            let packed = pack_list(&values, max);
            prop_assert_eq!(unpack_list(&packed).expect("unpack"), values);
        }
    }
}
