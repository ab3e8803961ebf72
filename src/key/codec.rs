//! Encodes composite keys to byte strings such that byte-lex order matches
//! tuple-lex order, and derives the start/end sentinels backends use for
//! range scans.
//!
//! Field encodings:
//! - **id**: written as its raw 16 bytes.
//! - **int**: big-endian 8 bytes with the sign bit flipped, so negative
//!   values sort before positive ones.
//! - **str**: each literal `0x00` byte is escaped as `0x00 0xFF`, and the
//!   whole field is terminated by an unescaped `0x00 0x00`. Since the
//!   terminator is strictly less than any escaped-or-plain content byte,
//!   `encode("a") < encode("ab")`.
//!
//! Every backend stores the encoded bytes in its primary index; this keeps
//! the ordering contract in one place instead of depending on each
//! backend's native collation.

use super::{FieldSpec, FieldValue, Key, KeySpec};
use crate::error::{StorageError, StorageResult};

const INT_SIGN_FLIP: u64 = 0x8000_0000_0000_0000;
const STR_ESCAPE: u8 = 0x00;
const STR_ESCAPED_LITERAL: u8 = 0xFF;
const STR_TERMINATOR: u8 = 0x00;

/// Encodes `key` as a prefix of `spec`: `key` may be shorter than `spec`
/// (used by [`range_start`]/[`range_end`] to encode a partial tuple) but
/// never longer, and every present field's type must match. Full-arity
/// validation for stored keys is [`super::validate`]'s job, called before
/// this by `put`/`get`/`delete` paths.
pub fn encode(key: &[FieldValue], spec: &KeySpec) -> StorageResult<Vec<u8>> {
    if key.len() > spec.0.len() {
        return Err(StorageError::bad_key(format!(
            "key has {} fields, spec only has {}",
            key.len(),
            spec.0.len()
        )));
    }
    let mut out = Vec::new();
    for (value, field_spec) in key.iter().zip(spec.0.iter()) {
        encode_field(value, *field_spec, &mut out)?;
    }
    Ok(out)
}

fn encode_field(value: &FieldValue, spec: FieldSpec, out: &mut Vec<u8>) -> StorageResult<()> {
    match (value, spec) {
        (FieldValue::Id(bytes), FieldSpec::Id) => {
            out.extend_from_slice(bytes);
            Ok(())
        }
        (FieldValue::Int(n), FieldSpec::Int) => {
            let flipped = (*n as u64) ^ INT_SIGN_FLIP;
            out.extend_from_slice(&flipped.to_be_bytes());
            Ok(())
        }
        (FieldValue::Str(s), FieldSpec::Str) => {
            for b in s.as_bytes() {
                if *b == STR_ESCAPE {
                    out.push(STR_ESCAPE);
                    out.push(STR_ESCAPED_LITERAL);
                } else {
                    out.push(*b);
                }
            }
            out.push(STR_ESCAPE);
            out.push(STR_TERMINATOR);
            Ok(())
        }
        (v, s) => Err(StorageError::bad_key(format!(
            "field {v:?} does not match spec field {s:?}"
        ))),
    }
}

/// Decodes `bytes` according to `spec`. Inverse of [`encode`]. Fails with
/// [`StorageError::BadKey`] on truncated or malformed input.
pub fn decode(bytes: &[u8], spec: &KeySpec) -> StorageResult<Key> {
    let mut pos = 0;
    let mut key = Vec::with_capacity(spec.0.len());
    for field_spec in &spec.0 {
        let (value, consumed) = decode_field(&bytes[pos..], *field_spec)?;
        key.push(value);
        pos += consumed;
    }
    if pos != bytes.len() {
        return Err(StorageError::bad_key(
            "trailing bytes after decoding all spec fields",
        ));
    }
    Ok(key)
}

fn decode_field(bytes: &[u8], spec: FieldSpec) -> StorageResult<(FieldValue, usize)> {
    match spec {
        FieldSpec::Id => {
            if bytes.len() < 16 {
                return Err(StorageError::bad_key("truncated id field"));
            }
            let mut id = [0u8; 16];
            id.copy_from_slice(&bytes[..16]);
            Ok((FieldValue::Id(id), 16))
        }
        FieldSpec::Int => {
            if bytes.len() < 8 {
                return Err(StorageError::bad_key("truncated int field"));
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&bytes[..8]);
            let flipped = u64::from_be_bytes(buf);
            let n = (flipped ^ INT_SIGN_FLIP) as i64;
            Ok((FieldValue::Int(n), 8))
        }
        FieldSpec::Str => {
            let mut raw = Vec::new();
            let mut i = 0;
            loop {
                if i >= bytes.len() {
                    return Err(StorageError::bad_key("unterminated string field"));
                }
                if bytes[i] == STR_ESCAPE {
                    if i + 1 >= bytes.len() {
                        return Err(StorageError::bad_key("truncated string escape"));
                    }
                    match bytes[i + 1] {
                        STR_ESCAPED_LITERAL => {
                            raw.push(STR_ESCAPE);
                            i += 2;
                        }
                        STR_TERMINATOR => {
                            i += 2;
                            let s = String::from_utf8(raw)
                                .map_err(|e| StorageError::bad_key(format!("invalid utf8: {e}")))?;
                            return Ok((FieldValue::Str(s), i));
                        }
                        other => {
                            return Err(StorageError::bad_key(format!(
                                "invalid string escape byte {other:#x}"
                            )));
                        }
                    }
                } else {
                    raw.push(bytes[i]);
                    i += 1;
                }
            }
        }
    }
}

/// The least byte string whose decode conforms to `spec` and is
/// `>= prefix`. An empty tuple means "minus infinity" and yields the empty
/// string, which is `<=` every valid encoding.
pub fn range_start(prefix: &[FieldValue], spec: &KeySpec) -> StorageResult<Vec<u8>> {
    if prefix.is_empty() {
        return Ok(Vec::new());
    }
    encode(prefix, spec)
}

/// The inclusive upper bound for `prefix`: every key equal to `prefix`
/// encodes to exactly this value, and no valid encoding is both greater
/// than this and conforms to `spec` with this same full tuple. An empty
/// tuple means "plus infinity", represented as `None` since no finite byte
/// string dominates every possible (unboundedly long) string-valued key --
/// backends that need an upper bound for an unbounded range simply omit
/// the upper filter instead of comparing against a materialized sentinel.
pub fn range_end(prefix: &[FieldValue], spec: &KeySpec) -> StorageResult<Option<Vec<u8>>> {
    if prefix.is_empty() {
        return Ok(None);
    }
    Ok(Some(encode(prefix, spec)?))
}

/// Derives a half-open (exclusive) upper bound from an inclusive one, for
/// backends whose native range primitive is `[start, end)` rather than
/// `[start, end]` (spec.md §9's open question: the codec owns both
/// endpoints so each backend picks the one it needs). Appending any single
/// byte to a complete encoding yields a string that is strictly greater
/// than it and collides with no valid encoding of any other key, because
/// every field encoding is self-terminating (fixed width, or an explicit
/// string terminator).
pub fn exclusive_end(inclusive_end: &[u8]) -> Vec<u8> {
    let mut v = inclusive_end.to_vec();
    v.push(0xFF);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::FieldSpec as FS;

    fn spec(fields: &[FS]) -> KeySpec {
        KeySpec::new(fields.to_vec())
    }

    #[test]
    fn round_trips_each_field_type() {
        let s = spec(&[FS::Id, FS::Int, FS::Str]);
        let key = vec![
            FieldValue::Id([7u8; 16]),
            FieldValue::Int(-42),
            FieldValue::Str("hello".to_string()),
        ];
        let encoded = encode(&key, &s).unwrap();
        let decoded = decode(&encoded, &s).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn string_with_embedded_nul_round_trips() {
        let s = spec(&[FS::Str]);
        let key = vec![FieldValue::Str("a\0b".to_string())];
        let encoded = encode(&key, &s).unwrap();
        let decoded = decode(&encoded, &s).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn shorter_string_sorts_before_its_own_prefix_extension() {
        let s = spec(&[FS::Str]);
        let a = encode(&[FieldValue::Str("a".to_string())], &s).unwrap();
        let ab = encode(&[FieldValue::Str("ab".to_string())], &s).unwrap();
        assert!(a < ab);
    }

    #[test]
    fn negative_integers_sort_before_positive() {
        let s = spec(&[FS::Int]);
        let neg = encode(&[FieldValue::Int(-1)], &s).unwrap();
        let pos = encode(&[FieldValue::Int(1)], &s).unwrap();
        assert!(neg < pos);
    }

    #[test]
    fn composite_order_is_field_major() {
        // ("a", 2), ("a", 10), ("b", 1) must sort in that order: the int
        // component sorts numerically, not lexically.
        let s = spec(&[FS::Str, FS::Int]);
        let a2 = encode(&[FieldValue::Str("a".into()), FieldValue::Int(2)], &s).unwrap();
        let a10 = encode(&[FieldValue::Str("a".into()), FieldValue::Int(10)], &s).unwrap();
        let b1 = encode(&[FieldValue::Str("b".into()), FieldValue::Int(1)], &s).unwrap();
        let mut v = vec![b1.clone(), a10.clone(), a2.clone()];
        v.sort();
        assert_eq!(v, vec![a2, a10, b1]);
    }

    #[test]
    fn range_start_of_empty_tuple_is_empty_string() {
        let s = spec(&[FS::Int]);
        assert_eq!(range_start(&[], &s).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn range_end_of_empty_tuple_is_unbounded() {
        let s = spec(&[FS::Int]);
        assert_eq!(range_end(&[], &s).unwrap(), None);
    }

    #[test]
    fn too_many_fields_is_bad_key() {
        let s = spec(&[FS::Int]);
        let err = encode(&[FieldValue::Int(1), FieldValue::Int(2)], &s).unwrap_err();
        assert!(matches!(err, StorageError::BadKey(_)));
    }

    #[test]
    fn shorter_prefix_encodes_without_error() {
        let s = spec(&[FS::Str, FS::Int]);
        encode(&[FieldValue::Str("a".into())], &s).unwrap();
    }

    #[test]
    fn bad_field_type_is_bad_key() {
        let s = spec(&[FS::Int]);
        let err = encode(&[FieldValue::Str("x".into())], &s).unwrap_err();
        assert!(matches!(err, StorageError::BadKey(_)));
    }

    #[test]
    fn malformed_bytes_fail_decode() {
        let s = spec(&[FS::Str]);
        // missing terminator
        let err = decode(b"abc", &s).unwrap_err();
        assert!(matches!(err, StorageError::BadKey(_)));
    }
}
