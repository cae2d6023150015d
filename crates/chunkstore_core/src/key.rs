//! Record key kinds and their on-disk layouts.
//!
//! The engine persists two record layouts, differing only in how the key is
//! carried:
//!
//! ```text
//! keyed record:  | key_len (4) | value_len (4) | key_bytes (N) | value_bytes (M) |
//! id record:     | id (8)      | value_len (4) | value_bytes (M)                 |
//! ```
//!
//! All integers are little-endian. A record is tombstoned in place by
//! overwriting its `value_len` field with `-(value_len + 1)`; the bias keeps
//! zero-length values unambiguous and lets sequential scans skip the correct
//! number of bytes without any other bookkeeping.
//!
//! [`RecordKey`] is the seam between the two layouts: stores, segments, and
//! the hint log are generic over it, so the same engine serves string-keyed
//! metadata records and id-addressed object blocks.

use std::fmt::Debug;
use std::hash::Hash;

/// Maximum length of a string key in bytes.
pub const MAX_KEY_LEN: usize = 4096;

/// Parsed fixed-size record prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordPrefix<K> {
    /// Number of key bytes following the prefix (0 for id records).
    pub key_material_len: usize,
    /// Raw value-length field; negative means tombstoned.
    pub value_len_raw: i32,
    /// The key, when it is carried inside the prefix itself (id records).
    pub inline_key: Option<K>,
}

impl<K> RecordPrefix<K> {
    /// Whether the record is tombstoned.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value_len_raw < 0
    }

    /// The value length in bytes, tombstoned or not.
    #[must_use]
    pub fn value_len(&self) -> u32 {
        decode_value_len(self.value_len_raw).0
    }
}

/// Encodes the tombstone form of a value-length field.
#[must_use]
pub fn tombstone_value_len(value_len: u32) -> i32 {
    -(value_len as i32) - 1
}

/// Decodes a raw value-length field into `(value_len, tombstone)`.
#[must_use]
pub fn decode_value_len(raw: i32) -> (u32, bool) {
    if raw < 0 {
        ((-(raw + 1)) as u32, true)
    } else {
        (raw as u32, false)
    }
}

/// A key that can be stored in segment records and hint logs.
///
/// Implementations define the record layout for their key kind. The two
/// provided implementations are `String` (keyed records, used by metadata
/// and object-name stores) and `u64` (id records, used by block stores).
pub trait RecordKey:
    Clone + Eq + Hash + Ord + Debug + Send + Sync + Sized + 'static
{
    /// Number of fixed bytes at the start of every record.
    const PREFIX_LEN: usize;

    /// Byte offset of the value-length field within a record.
    const VALUE_LEN_OFFSET: u64;

    /// Number of key bytes stored after the prefix (0 when the key is
    /// carried inside the prefix).
    fn key_material_len(&self) -> usize;

    /// Checks that the key can be stored at all.
    ///
    /// Invalid keys are rejected before any byte is written; a record
    /// with an unparseable header would poison sequential scans.
    fn validate(&self) -> Result<(), &'static str> {
        Ok(())
    }

    /// Encodes a full record (prefix, key material, value).
    fn encode_record(&self, value: &[u8]) -> Vec<u8>;

    /// Parses the fixed prefix. Returns `None` for structurally invalid
    /// prefixes (bad lengths, negative ids).
    fn parse_prefix(prefix: &[u8]) -> Option<RecordPrefix<Self>>;

    /// Decodes a key from its stored key material.
    ///
    /// Only called when [`RecordPrefix::inline_key`] is `None`.
    fn decode_key(material: &[u8]) -> Option<Self>;

    /// Serializes the key for a hint record.
    fn hint_bytes(&self) -> Vec<u8>;

    /// Deserializes a key from a hint record.
    fn from_hint_bytes(bytes: &[u8]) -> Option<Self>;
}

impl RecordKey for String {
    const PREFIX_LEN: usize = 8;
    const VALUE_LEN_OFFSET: u64 = 4;

    fn key_material_len(&self) -> usize {
        self.len()
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.is_empty() {
            Err("key must not be empty")
        } else if self.len() > MAX_KEY_LEN {
            Err("key exceeds maximum length")
        } else {
            Ok(())
        }
    }

    fn encode_record(&self, value: &[u8]) -> Vec<u8> {
        let key = self.as_bytes();
        let mut buf = Vec::with_capacity(Self::PREFIX_LEN + key.len() + value.len());
        buf.extend_from_slice(&(key.len() as i32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        buf
    }

    fn parse_prefix(prefix: &[u8]) -> Option<RecordPrefix<Self>> {
        if prefix.len() < Self::PREFIX_LEN {
            return None;
        }
        let key_len = i32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let value_len_raw = i32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);

        if key_len < 1 || key_len as usize > MAX_KEY_LEN {
            return None;
        }

        Some(RecordPrefix {
            key_material_len: key_len as usize,
            value_len_raw,
            inline_key: None,
        })
    }

    fn decode_key(material: &[u8]) -> Option<Self> {
        std::str::from_utf8(material).ok().map(str::to_owned)
    }

    fn hint_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn from_hint_bytes(bytes: &[u8]) -> Option<Self> {
        Self::decode_key(bytes)
    }
}

impl RecordKey for u64 {
    const PREFIX_LEN: usize = 12;
    const VALUE_LEN_OFFSET: u64 = 8;

    fn key_material_len(&self) -> usize {
        0
    }

    fn validate(&self) -> Result<(), &'static str> {
        // Ids are stored as i64; the sign bit marks an invalid record.
        if *self > i64::MAX as u64 {
            Err("id exceeds the signed 64-bit range")
        } else {
            Ok(())
        }
    }

    fn encode_record(&self, value: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::PREFIX_LEN + value.len());
        buf.extend_from_slice(&(*self as i64).to_le_bytes());
        buf.extend_from_slice(&(value.len() as i32).to_le_bytes());
        buf.extend_from_slice(value);
        buf
    }

    fn parse_prefix(prefix: &[u8]) -> Option<RecordPrefix<Self>> {
        if prefix.len() < Self::PREFIX_LEN {
            return None;
        }
        let id = i64::from_le_bytes([
            prefix[0], prefix[1], prefix[2], prefix[3], prefix[4], prefix[5], prefix[6],
            prefix[7],
        ]);
        let value_len_raw = i32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]);

        if id < 0 {
            return None;
        }

        Some(RecordPrefix {
            key_material_len: 0,
            value_len_raw,
            inline_key: Some(id as u64),
        })
    }

    fn decode_key(_material: &[u8]) -> Option<Self> {
        None
    }

    fn hint_bytes(&self) -> Vec<u8> {
        self.to_le_bytes().to_vec()
    }

    fn from_hint_bytes(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(u64::from_le_bytes(arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_bias_roundtrip() {
        for len in [0u32, 1, 50, 1024] {
            let raw = tombstone_value_len(len);
            assert!(raw < 0);
            assert_eq!(decode_value_len(raw), (len, true));
        }
        assert_eq!(decode_value_len(50), (50, false));
    }

    #[test]
    fn keyed_record_layout() {
        let key = "a.png".to_string();
        let record = key.encode_record(b"hello");

        assert_eq!(record.len(), 8 + 5 + 5);
        assert_eq!(&record[0..4], &5i32.to_le_bytes());
        assert_eq!(&record[4..8], &5i32.to_le_bytes());
        assert_eq!(&record[8..13], b"a.png");
        assert_eq!(&record[13..18], b"hello");

        let prefix = String::parse_prefix(&record).unwrap();
        assert_eq!(prefix.key_material_len, 5);
        assert_eq!(prefix.value_len(), 5);
        assert!(!prefix.is_tombstone());
        assert!(prefix.inline_key.is_none());

        let decoded = String::decode_key(&record[8..13]).unwrap();
        assert_eq!(decoded, key);
    }

    #[test]
    fn id_record_layout() {
        let id = 42u64;
        let record = id.encode_record(b"block");

        assert_eq!(record.len(), 12 + 5);
        assert_eq!(&record[0..8], &42i64.to_le_bytes());
        assert_eq!(&record[8..12], &5i32.to_le_bytes());

        let prefix = u64::parse_prefix(&record).unwrap();
        assert_eq!(prefix.inline_key, Some(42));
        assert_eq!(prefix.value_len(), 5);
    }

    #[test]
    fn negative_id_rejected() {
        let mut record = 1u64.encode_record(b"x");
        record[7] = 0xFF; // Flip the sign bit of the id.
        assert!(u64::parse_prefix(&record).is_none());
    }

    #[test]
    fn oversized_key_len_rejected() {
        let mut record = "k".to_string().encode_record(b"v");
        record[0..4].copy_from_slice(&(MAX_KEY_LEN as i32 + 1).to_le_bytes());
        assert!(String::parse_prefix(&record).is_none());
    }

    #[test]
    fn key_validation() {
        assert!("a.png".to_string().validate().is_ok());
        assert!(String::new().validate().is_err());
        assert!("x".repeat(MAX_KEY_LEN + 1).validate().is_err());

        assert!(42u64.validate().is_ok());
        assert!((i64::MAX as u64).validate().is_ok());
        assert!((i64::MAX as u64 + 1).validate().is_err());
    }

    #[test]
    fn hint_bytes_roundtrip() {
        let s = "bucket/object".to_string();
        assert_eq!(String::from_hint_bytes(&s.hint_bytes()), Some(s));

        let id = 0xDEAD_BEEFu64;
        assert_eq!(u64::from_hint_bytes(&id.hint_bytes()), Some(id));
    }
}
