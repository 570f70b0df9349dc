//! Content identifiers.
//!
//! A CID is a blake3 digest of an exact byte string tagged with a content
//! codec. Binary layout:
//!
//! ```text
//! varint(1) || varint(codec) || varint(0x1e) || varint(32) || digest
//! ```
//!
//! The text form is multibase base32-lower (`b` prefix, no padding).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::crypto::Blake3Hash;
use crate::error::{CoreError, Result};

/// CID version.
const CID_VERSION: u64 = 1;

/// Multihash code for blake3-256.
const BLAKE3_MULTIHASH: u64 = 0x1e;

/// Digest length in bytes.
const DIGEST_LEN: u64 = 32;

/// Codec for contract data (serialized messages).
pub const CONTRACT_DATA_CODEC: u64 = 0x51_1e01;

/// Codec for key identifiers (serialized public keys).
pub const KEY_CODEC: u64 = 0x51_1e02;

const BASE32_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

/// A content identifier: codec plus blake3 digest.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cid {
    codec: u64,
    hash: Blake3Hash,
}

impl Cid {
    /// Hash `data` and tag it with `codec`.
    pub fn compute(codec: u64, data: &[u8]) -> Self {
        Self {
            codec,
            hash: Blake3Hash::hash(data),
        }
    }

    /// Build from an existing digest.
    pub const fn from_parts(codec: u64, hash: Blake3Hash) -> Self {
        Self { codec, hash }
    }

    /// The content codec.
    pub const fn codec(&self) -> u64 {
        self.codec
    }

    /// The digest.
    pub const fn hash(&self) -> &Blake3Hash {
        &self.hash
    }

    /// Binary form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        write_varint(&mut buf, CID_VERSION);
        write_varint(&mut buf, self.codec);
        write_varint(&mut buf, BLAKE3_MULTIHASH);
        write_varint(&mut buf, DIGEST_LEN);
        buf.extend_from_slice(self.hash.as_bytes());
        buf
    }

    /// Parse the binary form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = bytes;

        let version = read_varint(&mut cursor)?;
        if version != CID_VERSION {
            return Err(CoreError::InvalidCid(format!("unsupported version {version}")));
        }
        let codec = read_varint(&mut cursor)?;
        let mh = read_varint(&mut cursor)?;
        if mh != BLAKE3_MULTIHASH {
            return Err(CoreError::InvalidCid(format!("unsupported multihash 0x{mh:x}")));
        }
        let len = read_varint(&mut cursor)?;
        if len != DIGEST_LEN || cursor.len() != DIGEST_LEN as usize {
            return Err(CoreError::InvalidCid("bad digest length".into()));
        }

        let mut digest = [0u8; 32];
        digest.copy_from_slice(cursor);
        Ok(Self {
            codec,
            hash: Blake3Hash(digest),
        })
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", base32_encode(&self.to_bytes()))
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({self})")
    }
}

impl FromStr for Cid {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let body = s
            .strip_prefix('b')
            .ok_or_else(|| CoreError::InvalidCid(format!("unsupported multibase in {s:?}")))?;
        let bytes = base32_decode(body)?;
        Self::from_bytes(&bytes)
    }
}

impl Serialize for Cid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Cid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn write_varint(buf: &mut Vec<u8>, mut n: u64) {
    while n >= 0x80 {
        buf.push((n as u8) | 0x80);
        n >>= 7;
    }
    buf.push(n as u8);
}

/// Read an unsigned LEB128 varint in its minimal encoding.
fn read_varint(cursor: &mut &[u8]) -> Result<u64> {
    let mut n: u64 = 0;
    for shift in (0..64).step_by(7) {
        let (&byte, rest) = cursor
            .split_first()
            .ok_or_else(|| CoreError::InvalidCid("truncated varint".into()))?;
        *cursor = rest;
        // The tenth byte carries only the top bit of a u64.
        if shift == 63 && byte > 1 {
            return Err(CoreError::InvalidCid("varint overflow".into()));
        }
        n |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            if byte == 0 && shift > 0 {
                return Err(CoreError::InvalidCid("varint is not minimally encoded".into()));
            }
            return Ok(n);
        }
    }
    Err(CoreError::InvalidCid("varint overflow".into()))
}

fn base32_encode(data: &[u8]) -> String {
    let mut result = String::with_capacity((data.len() * 8 + 4) / 5);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for &byte in data {
        buffer = (buffer << 8) | u64::from(byte);
        bits_in_buffer += 8;

        while bits_in_buffer >= 5 {
            bits_in_buffer -= 5;
            let index = ((buffer >> bits_in_buffer) & 0x1f) as usize;
            result.push(BASE32_ALPHABET[index] as char);
        }
    }

    if bits_in_buffer > 0 {
        let index = ((buffer << (5 - bits_in_buffer)) & 0x1f) as usize;
        result.push(BASE32_ALPHABET[index] as char);
    }

    result
}

fn base32_decode(text: &str) -> Result<Vec<u8>> {
    let mut result = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits_in_buffer = 0;

    for c in text.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c)
            .ok_or_else(|| CoreError::InvalidCid(format!("invalid base32 character {:?}", c as char)))?;
        buffer = (buffer << 5) | value as u64;
        bits_in_buffer += 5;

        if bits_in_buffer >= 8 {
            bits_in_buffer -= 8;
            result.push((buffer >> bits_in_buffer) as u8);
        }
    }

    // Leftover bits must be zero padding.
    if buffer & ((1 << bits_in_buffer) - 1) != 0 {
        return Err(CoreError::InvalidCid("non-zero base32 padding".into()));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_base32_encode() {
        // RFC 4648 test vectors (lowercase, no padding)
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "my");
        assert_eq!(base32_encode(b"fo"), "mzxq");
        assert_eq!(base32_encode(b"foo"), "mzxw6");
        assert_eq!(base32_encode(b"foob"), "mzxw6yq");
        assert_eq!(base32_encode(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
    }

    #[test]
    fn test_base32_decode_rejects_garbage() {
        assert!(base32_decode("MZXW6").is_err());
        assert!(base32_decode("mzxw1").is_err());
        assert_eq!(base32_decode("mzxw6ytboi").unwrap(), b"foobar");
    }

    #[test]
    fn test_cid_layout() {
        let cid = Cid::compute(CONTRACT_DATA_CODEC, b"hello");
        let bytes = cid.to_bytes();

        assert_eq!(bytes[0], 0x01);
        // 0x511e01 as LEB128
        assert_eq!(&bytes[1..5], &[0x81, 0xbc, 0xc4, 0x02]);
        assert_eq!(&bytes[5..7], &[0x1e, 0x20]);
        assert_eq!(&bytes[7..], Blake3Hash::hash(b"hello").as_bytes());
    }

    #[test]
    fn test_cid_codec_distinguishes() {
        let a = Cid::compute(CONTRACT_DATA_CODEC, b"same");
        let b = Cid::compute(KEY_CODEC, b"same");
        assert_ne!(a, b);
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn test_cid_text_form() {
        let cid = Cid::compute(KEY_CODEC, b"key");
        let text = cid.to_string();
        assert!(text.starts_with('b'));
        assert_eq!(text.parse::<Cid>().unwrap(), cid);

        assert!("zabc".parse::<Cid>().is_err());
        assert!("b".parse::<Cid>().is_err());
    }

    #[test]
    fn test_varint_must_be_minimal() {
        let read = |bytes: &[u8]| {
            let mut cursor = bytes;
            read_varint(&mut cursor)
        };
        assert_eq!(read(&[0x00]).unwrap(), 0);
        assert_eq!(read(&[0x7f]).unwrap(), 0x7f);
        assert_eq!(read(&[0x80, 0x01]).unwrap(), 0x80);

        // Padded encodings of 1 and 0.
        assert!(read(&[0x81, 0x00]).is_err());
        assert!(read(&[0x80, 0x80, 0x00]).is_err());

        let mut max = vec![0xff; 9];
        max.push(0x01);
        assert_eq!(read(&max).unwrap(), u64::MAX);
        let mut wide = vec![0xff; 9];
        wide.push(0x02);
        assert!(read(&wide).is_err());
        assert!(read(&[0x80; 11]).is_err());

        // The same CID with its codec padded by one byte is rejected.
        let cid = Cid::compute(CONTRACT_DATA_CODEC, b"x");
        let mut padded = vec![0x01, 0x81, 0xbc, 0xc4, 0x82, 0x00, 0x1e, 0x20];
        padded.extend_from_slice(cid.hash().as_bytes());
        assert!(Cid::from_bytes(&cid.to_bytes()).is_ok());
        assert!(Cid::from_bytes(&padded).is_err());
    }

    proptest! {
        #[test]
        fn prop_varint_roundtrip(n in any::<u64>()) {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let mut cursor = buf.as_slice();
            prop_assert_eq!(read_varint(&mut cursor).unwrap(), n);
            prop_assert!(cursor.is_empty());
        }
    }
}
