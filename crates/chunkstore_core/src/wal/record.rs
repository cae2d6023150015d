//! Edit-log operation records.

use crate::error::{CoreError, CoreResult};
use crate::key::MAX_KEY_LEN;

/// Op code for an add/upsert of a metadata record.
pub const OP_ADD: u8 = 1;
/// Op code for a removal of a metadata record.
pub const OP_REMOVE: u8 = 2;

/// A structured mutation logged by a metadata store.
///
/// Every operation a metadata store accepts is one of these variants;
/// decoding and replay match exhaustively, so adding an operation kind
/// means adding a variant and its handlers, enforced at compile time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOp {
    /// Insert or replace the record under `key`.
    Add {
        /// Record key.
        key: String,
        /// Record payload.
        value: Vec<u8>,
    },
    /// Remove the record under `key`.
    Remove {
        /// Record key.
        key: String,
    },
}

impl MetaOp {
    /// The operation's wire op code.
    #[must_use]
    pub fn op_code(&self) -> u8 {
        match self {
            Self::Add { .. } => OP_ADD,
            Self::Remove { .. } => OP_REMOVE,
        }
    }

    /// The key this operation touches.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Add { key, .. } | Self::Remove { key } => key,
        }
    }

    /// Serializes the operation payload (without the op-code/length frame).
    ///
    /// ```text
    /// Add:    | key_len (4) | key_bytes (N) | value_bytes (M) |
    /// Remove: | key_len (4) | key_bytes (N) |
    /// ```
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        match self {
            Self::Add { key, value } => {
                let key_bytes = key.as_bytes();
                let mut buf = Vec::with_capacity(4 + key_bytes.len() + value.len());
                buf.extend_from_slice(&(key_bytes.len() as i32).to_le_bytes());
                buf.extend_from_slice(key_bytes);
                buf.extend_from_slice(value);
                buf
            }
            Self::Remove { key } => {
                let key_bytes = key.as_bytes();
                let mut buf = Vec::with_capacity(4 + key_bytes.len());
                buf.extend_from_slice(&(key_bytes.len() as i32).to_le_bytes());
                buf.extend_from_slice(key_bytes);
                buf
            }
        }
    }

    /// Decodes an operation from its op code and payload.
    pub fn decode(op_code: u8, payload: &[u8]) -> CoreResult<Self> {
        if payload.len() < 4 {
            return Err(CoreError::wal_corruption("payload shorter than key length"));
        }
        let key_len = i32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if key_len < 1 || key_len as usize > MAX_KEY_LEN {
            return Err(CoreError::wal_corruption("invalid key length"));
        }
        let key_len = key_len as usize;
        if payload.len() < 4 + key_len {
            return Err(CoreError::wal_corruption("payload shorter than key"));
        }

        let key = std::str::from_utf8(&payload[4..4 + key_len])
            .map_err(|_| CoreError::wal_corruption("key is not valid UTF-8"))?
            .to_string();

        match op_code {
            OP_ADD => Ok(Self::Add {
                key,
                value: payload[4 + key_len..].to_vec(),
            }),
            OP_REMOVE => {
                if payload.len() != 4 + key_len {
                    return Err(CoreError::wal_corruption(
                        "trailing bytes in remove record",
                    ));
                }
                Ok(Self::Remove { key })
            }
            other => Err(CoreError::wal_corruption(format!(
                "unknown op code {other}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_roundtrip() {
        let op = MetaOp::Add {
            key: "bucket/object".to_string(),
            value: vec![0xCA, 0xFE],
        };
        let payload = op.encode_payload();
        let decoded = MetaOp::decode(op.op_code(), &payload).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn add_with_empty_value() {
        let op = MetaOp::Add {
            key: "k".to_string(),
            value: Vec::new(),
        };
        let payload = op.encode_payload();
        assert_eq!(MetaOp::decode(OP_ADD, &payload).unwrap(), op);
    }

    #[test]
    fn remove_roundtrip() {
        let op = MetaOp::Remove {
            key: "bucket".to_string(),
        };
        let payload = op.encode_payload();
        assert_eq!(MetaOp::decode(OP_REMOVE, &payload).unwrap(), op);
    }

    #[test]
    fn unknown_op_code_rejected() {
        let payload = MetaOp::Remove {
            key: "k".to_string(),
        }
        .encode_payload();
        assert!(matches!(
            MetaOp::decode(99, &payload),
            Err(CoreError::WalCorruption { .. })
        ));
    }

    #[test]
    fn bad_key_length_rejected() {
        let mut payload = MetaOp::Remove {
            key: "k".to_string(),
        }
        .encode_payload();
        payload[0..4].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(MetaOp::decode(OP_REMOVE, &payload).is_err());
    }

    #[test]
    fn remove_rejects_trailing_bytes() {
        let mut payload = MetaOp::Remove {
            key: "k".to_string(),
        }
        .encode_payload();
        payload.push(0);
        assert!(MetaOp::decode(OP_REMOVE, &payload).is_err());
    }
}
