//! Oplog application interface and batching of buffered entries.

use crate::bson_helper::{doc_size, get_integer};
use crate::error::{ErrorCode, Result, SyncError};
use crate::oplog_buffer::OplogBuffer;
use crate::optime::OpTimeWithHash;
use crate::{COMMAND_OP, NAMESPACE_KEY, OP_KEY};
use bson::Document;

/// The only oplog format understood by appliers.
pub const OPLOG_VERSION: i64 = 2;

/// Result of one applied batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedBatch {
    /// position of the last entry of the batch.
    pub last_applied: OpTimeWithHash,
    /// documents the applier had to fetch from the sync source because they were missing locally.
    pub fetched_missing_docs: u64,
}

/// Apply fetched oplog entries to local storage.
pub trait OplogApplier: Send + Sync {
    /// Apply `ops` in order, they are never empty.
    fn apply_batch(&self, ops: &[Document]) -> Result<AppliedBatch>;
}

/// Upper bounds of one batch handed to [OplogApplier::apply_batch].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub ops: usize,
    pub bytes: usize,
}

/// true for entries which have to be applied in a batch of their own.
pub fn must_apply_alone(entry: &Document) -> bool {
    match entry.get_str(OP_KEY) {
        Ok(COMMAND_OP) => true,
        Ok("i") => entry
            .get_str(NAMESPACE_KEY)
            .map(|ns| ns.ends_with(".system.indexes"))
            .unwrap_or(false),
        _ => false,
    }
}

/// Pop the next batch from `buffer`, an empty batch means the buffer is empty.
///
/// A batch holds at least one entry, even when that entry alone exceeds the byte limit.
pub fn next_applier_batch(buffer: &OplogBuffer, limits: &BatchLimits) -> Result<Vec<Document>> {
    let mut ops = Vec::new();
    let mut bytes = 0;
    while let Some(entry) = buffer.peek() {
        match get_integer(&entry, "v") {
            Ok(OPLOG_VERSION) => {}
            _ => {
                return Err(SyncError::new(
                    ErrorCode::BadValue,
                    format!("expected oplog version {} but found: {}", OPLOG_VERSION, entry),
                ))
            }
        }

        if must_apply_alone(&entry) {
            if ops.is_empty() {
                buffer.try_pop();
                ops.push(entry);
            }
            break;
        }
        if ops.len() >= limits.ops {
            break;
        }
        let size = doc_size(&entry);
        if !ops.is_empty() && bytes + size > limits.bytes {
            break;
        }
        buffer.try_pop();
        bytes += size;
        ops.push(entry);
    }
    Ok(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, Timestamp};

    fn insert(i: u32) -> Document {
        doc! {
            "ts": Timestamp { time: i, increment: 0 },
            "h": i as i64,
            "v": 2,
            "op": "i",
            "ns": "db.coll",
            "o": {"_id": i}
        }
    }

    fn command(i: u32) -> Document {
        doc! {
            "ts": Timestamp { time: i, increment: 0 },
            "h": i as i64,
            "v": 2,
            "op": "c",
            "ns": "db.$cmd",
            "o": {"create": "other"}
        }
    }

    fn limits(ops: usize) -> BatchLimits {
        BatchLimits {
            ops,
            bytes: 1024 * 1024,
        }
    }

    #[test]
    fn test_batch_limited_by_ops() {
        let buffer = OplogBuffer::new(1024 * 1024);
        buffer.push_all_non_blocking((1..=5).map(insert));
        let batch = next_applier_batch(&buffer, &limits(3)).unwrap();
        assert_eq!(batch, vec![insert(1), insert(2), insert(3)]);
        let batch = next_applier_batch(&buffer, &limits(3)).unwrap();
        assert_eq!(batch, vec![insert(4), insert(5)]);
        assert!(next_applier_batch(&buffer, &limits(3)).unwrap().is_empty());
    }

    #[test]
    fn test_batch_limited_by_bytes() {
        let buffer = OplogBuffer::new(1024 * 1024);
        buffer.push_all_non_blocking((1..=3).map(insert));
        let one = doc_size(&insert(1));
        let limits = BatchLimits {
            ops: 100,
            bytes: one * 2,
        };
        assert_eq!(next_applier_batch(&buffer, &limits).unwrap().len(), 2);

        // a single entry over the byte limit still makes a batch.
        let limits = BatchLimits { ops: 100, bytes: 1 };
        assert_eq!(next_applier_batch(&buffer, &limits).unwrap(), vec![insert(3)]);
    }

    #[test]
    fn test_command_is_applied_alone() {
        let buffer = OplogBuffer::new(1024 * 1024);
        buffer.push_all_non_blocking(vec![insert(1), insert(2), command(3), insert(4)]);
        assert_eq!(
            next_applier_batch(&buffer, &limits(10)).unwrap(),
            vec![insert(1), insert(2)]
        );
        assert_eq!(next_applier_batch(&buffer, &limits(10)).unwrap(), vec![command(3)]);
        assert_eq!(next_applier_batch(&buffer, &limits(10)).unwrap(), vec![insert(4)]);
    }

    #[test]
    fn test_index_insert_is_applied_alone() {
        let mut index = insert(2);
        index.insert("ns", "db.system.indexes");
        assert!(must_apply_alone(&index));
        assert!(!must_apply_alone(&insert(1)));
    }

    #[test]
    fn test_unexpected_oplog_version() {
        let buffer = OplogBuffer::new(1024 * 1024);
        let mut entry = insert(1);
        entry.insert("v", 1);
        buffer.push(entry).unwrap();
        let err = next_applier_batch(&buffer, &limits(10)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);
    }
}
