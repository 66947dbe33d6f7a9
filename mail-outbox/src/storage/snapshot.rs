//! Binary snapshot layout shared by the byte-oriented adapters.
//!
//! Envelope (CBOR): magic, schema version, blake3 checksum of the payload, and
//! the CBOR payload itself. Timestamps are stored as integer milliseconds.

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::item::QueueItem;

pub const CURRENT_SCHEMA_VERSION: u32 = 1;
pub const MAX_SNAPSHOT_BYTES: usize = 100 * 1024 * 1024;
pub const MAX_SNAPSHOT_ITEMS: usize = 100_000;
const SNAPSHOT_MAGIC: &[u8; 4] = b"MOQS";

#[derive(Serialize, Deserialize, Debug)]
struct SnapshotEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Serialize)]
struct SnapshotPayloadRef<'a> {
    items: &'a [QueueItem],
}

#[derive(Deserialize)]
struct SnapshotPayload {
    items: Vec<QueueItem>,
}

pub fn encode(items: &[QueueItem]) -> Result<Vec<u8>, StorageError> {
    let mut payload_bytes = Vec::new();
    ciborium::into_writer(&SnapshotPayloadRef { items }, &mut payload_bytes)?;

    let checksum = blake3::hash(&payload_bytes);

    let envelope = SnapshotEnvelope {
        magic: *SNAPSHOT_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload: payload_bytes,
    };

    let mut envelope_bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut envelope_bytes)?;

    if envelope_bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StorageError::StoreTooLarge {
            size: envelope_bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    Ok(envelope_bytes)
}

pub fn decode(bytes: &[u8]) -> Result<Vec<QueueItem>, StorageError> {
    if bytes.is_empty() {
        return Err(StorageError::Corrupted {
            reason: "empty snapshot",
        });
    }

    if bytes.len() > MAX_SNAPSHOT_BYTES {
        return Err(StorageError::StoreTooLarge {
            size: bytes.len(),
            max: MAX_SNAPSHOT_BYTES,
        });
    }

    let envelope: SnapshotEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *SNAPSHOT_MAGIC {
        return Err(StorageError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StorageError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    if envelope.schema_version < CURRENT_SCHEMA_VERSION {
        return Err(StorageError::UnknownSchema(envelope.schema_version));
    }

    let actual_checksum = blake3::hash(&envelope.payload);
    if actual_checksum.as_bytes() != &envelope.checksum {
        return Err(StorageError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual_checksum.as_bytes()),
        });
    }

    let payload: SnapshotPayload = ciborium::from_reader(&envelope.payload[..])?;

    if payload.items.len() > MAX_SNAPSHOT_ITEMS {
        return Err(StorageError::Corrupted {
            reason: "too many items in snapshot",
        });
    }

    Ok(payload.items)
}

/// Encode a single item, for adapters that store one row per item.
pub fn encode_item(item: &QueueItem) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(item, &mut bytes)?;
    Ok(bytes)
}

pub fn decode_item(bytes: &[u8]) -> Result<QueueItem, StorageError> {
    Ok(ciborium::from_reader(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::UnixTimeMs;
    use crate::item::{Payload, Priority};
    use std::time::Duration;

    fn sample_items() -> Vec<QueueItem> {
        let mut failed = QueueItem::new(
            Payload::new(b"{\"to\":\"b@example.com\"}".to_vec()),
            Priority::High,
            3,
            UnixTimeMs(1_700_000_000_123),
        );
        failed.record_failure(
            UnixTimeMs(1_700_000_000_456),
            Some("421 try later".into()),
            |_| Duration::from_millis(2_345),
        );

        vec![
            QueueItem::new(
                Payload::new(b"first".to_vec()),
                Priority::Low,
                5,
                UnixTimeMs(1_700_000_000_001),
            ),
            failed,
        ]
    }

    #[test]
    fn roundtrip_preserves_every_field() {
        let items = sample_items();
        let bytes = encode(&items).unwrap();
        let loaded = decode(&bytes).unwrap();
        assert_eq!(loaded, items);
        assert_eq!(loaded[1].last_attempt_at, Some(UnixTimeMs(1_700_000_000_456)));
        assert_eq!(loaded[1].next_retry_at, UnixTimeMs(1_700_000_002_801));
    }

    #[test]
    fn roundtrip_empty_snapshot() {
        let bytes = encode(&[]).unwrap();
        assert!(decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn empty_bytes_are_corrupt() {
        assert!(matches!(decode(&[]), Err(StorageError::Corrupted { .. })));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode(b"definitely not cbor").is_err());
    }

    #[test]
    fn flipped_payload_byte_fails_integrity() {
        let bytes = encode(&sample_items()).unwrap();

        let mut envelope: SnapshotEnvelope = ciborium::from_reader(&bytes[..]).unwrap();
        if let Some(byte) = envelope.payload.last_mut() {
            *byte ^= 0xFF;
        }
        let mut tampered = Vec::new();
        ciborium::into_writer(&envelope, &mut tampered).unwrap();

        assert!(matches!(
            decode(&tampered),
            Err(StorageError::IntegrityCheckFailed { .. })
        ));
    }

    #[test]
    fn wrong_magic_and_future_schema_are_rejected() {
        let bytes = encode(&[]).unwrap();
        let envelope: SnapshotEnvelope = ciborium::from_reader(&bytes[..]).unwrap();

        let wrong_magic = SnapshotEnvelope {
            magic: *b"NOPE",
            ..envelope
        };
        let mut out = Vec::new();
        ciborium::into_writer(&wrong_magic, &mut out).unwrap();
        assert!(matches!(decode(&out), Err(StorageError::Corrupted { .. })));

        let future = SnapshotEnvelope {
            magic: *SNAPSHOT_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            ..wrong_magic
        };
        let mut out = Vec::new();
        ciborium::into_writer(&future, &mut out).unwrap();
        assert!(matches!(decode(&out), Err(StorageError::FutureSchema { .. })));
    }

    #[test]
    fn oversized_input_rejected() {
        let oversized = vec![0u8; MAX_SNAPSHOT_BYTES + 1];
        assert!(matches!(
            decode(&oversized),
            Err(StorageError::StoreTooLarge { .. })
        ));
    }

    #[test]
    fn single_item_roundtrip() {
        let item = sample_items().remove(1);
        let bytes = encode_item(&item).unwrap();
        assert_eq!(decode_item(&bytes).unwrap(), item);
    }
}
