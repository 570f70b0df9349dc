//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding:
//! - Map keys sorted by encoded byte comparison, no duplicates
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - No floats and no tags
//!
//! Every byte string that is hashed or signed goes through here, so the
//! same value always yields identical bytes (and identical CIDs).

use ciborium::value::Value;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoreError, Result};

/// Serialize any serde value to canonical CBOR bytes.
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let value = Value::serialized(value).map_err(|e| CoreError::EncodingError(e.to_string()))?;
    encode_value(&value)
}

/// Decode canonical CBOR bytes into a serde value.
///
/// Fails with [`CoreError::NonCanonical`] if the input is valid CBOR but not
/// in canonical form, including trailing bytes after the first item.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let value = decode_value(bytes)?;
    value
        .deserialized()
        .map_err(|e| CoreError::DecodingError(e.to_string()))
}

/// Decode canonical CBOR bytes into a raw [`Value`].
pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    if bytes.is_empty() {
        return Err(CoreError::DecodingError("empty input".into()));
    }
    let value: Value =
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))?;
    ensure_canonical(&value, bytes)?;
    Ok(value)
}

/// Check that `bytes` is exactly the canonical encoding of `value`.
pub fn ensure_canonical(value: &Value, bytes: &[u8]) -> Result<()> {
    if encode_value(value)? == bytes {
        Ok(())
    } else {
        Err(CoreError::NonCanonical)
    }
}

/// Encode a CBOR Value to canonical bytes.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value)?;
    Ok(buf)
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Integer(i) => encode_integer(buf, i128::from(*i)),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => encode_array(buf, arr)?,
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(_) => {
            return Err(CoreError::EncodingError(
                "floats are not allowed in canonical encoding".into(),
            ))
        }
        Value::Tag(tag, _) => {
            return Err(CoreError::EncodingError(format!("unsupported tag {tag}")));
        }
        _ => return Err(CoreError::EncodingError("unsupported CBOR value type".into())),
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, n: i128) {
    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

fn encode_array(buf: &mut Vec<u8>, arr: &[Value]) -> Result<()> {
    encode_uint(buf, 4, arr.len() as u64);
    for item in arr {
        encode_value_to(buf, item)?;
    }
    Ok(())
}

/// Encode a map canonically (major type 5).
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<()> {
    let mut pairs = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        pairs.push((encode_value(k)?, v));
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(CoreError::EncodingError("duplicate map key".into()));
    }

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        zeta: u32,
        alpha: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        extra: Option<u64>,
    }

    #[test]
    fn test_integer_encoding() {
        let mut buf = Vec::new();

        encode_uint(&mut buf, 0, 0);
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        encode_uint(&mut buf, 0, 23);
        assert_eq!(buf, vec![0x17]);

        buf.clear();
        encode_uint(&mut buf, 0, 24);
        assert_eq!(buf, vec![0x18, 24]);

        buf.clear();
        encode_uint(&mut buf, 0, 256);
        assert_eq!(buf, vec![0x19, 0x01, 0x00]);

        buf.clear();
        encode_integer(&mut buf, -1);
        assert_eq!(buf, vec![0x20]);

        buf.clear();
        encode_integer(&mut buf, -25);
        assert_eq!(buf, vec![0x38, 24]);
    }

    #[test]
    fn test_map_key_ordering() {
        let entries = vec![
            (Value::Integer(8.into()), Value::Integer(80.into())),
            (Value::Integer(0.into()), Value::Integer(0.into())),
            (Value::Integer(5.into()), Value::Integer(50.into())),
        ];
        let buf = encode_value(&Value::Map(entries)).unwrap();

        assert_eq!(buf, vec![0xa3, 0x00, 0x00, 0x05, 0x18, 50, 0x08, 0x18, 80]);
    }

    #[test]
    fn test_struct_fields_sorted() {
        let bytes = to_canonical_bytes(&Sample {
            zeta: 1,
            alpha: "a".into(),
            extra: None,
        })
        .unwrap();

        // Shorter encoded keys sort first: {"zeta": 1, "alpha": "a"}
        let mut expected = vec![0xa2, 0x64];
        expected.extend_from_slice(b"zeta");
        expected.extend_from_slice(&[0x01, 0x65]);
        expected.extend_from_slice(b"alpha");
        expected.extend_from_slice(&[0x61, b'a']);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_decode_roundtrip() {
        let sample = Sample {
            zeta: 7,
            alpha: "x".into(),
            extra: Some(300),
        };
        let bytes = to_canonical_bytes(&sample).unwrap();
        let decoded: Sample = from_canonical_bytes(&bytes).unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_rejects_non_canonical() {
        // 1 encoded with a one-byte length prefix instead of inline
        assert_eq!(decode_value(&[0x18, 0x01]), Err(CoreError::NonCanonical));

        // Map keys out of order: {1: 0, 0: 0}
        assert_eq!(
            decode_value(&[0xa2, 0x01, 0x00, 0x00, 0x00]),
            Err(CoreError::NonCanonical)
        );

        // Trailing garbage after a valid item
        assert_eq!(decode_value(&[0x01, 0x02]), Err(CoreError::NonCanonical));
    }

    #[test]
    fn test_rejects_floats_and_empty() {
        assert!(matches!(
            encode_value(&Value::Float(1.5)),
            Err(CoreError::EncodingError(_))
        ));
        assert!(matches!(decode_value(&[]), Err(CoreError::DecodingError(_))));
    }
}
