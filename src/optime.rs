//! Oplog positions.

use crate::bson_helper;
use crate::error::{ErrorCode, Result, SyncError};
use crate::{HASH_KEY, TIMESTAMP_KEY};
use bson::{doc, Document, Timestamp};
use chrono::{DateTime, Local, TimeZone};
use std::cmp::Ordering;
use std::fmt;
use std::time::UNIX_EPOCH;

/// Identify one oplog entry by its timestamp and hash.
///
/// Positions are ordered by logical time (`ts`). The hash only breaks ties between entries with
/// the same `ts`, which happens when histories diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpTimeWithHash {
    pub ts: Timestamp,
    pub hash: i64,
}

impl OpTimeWithHash {
    pub fn new(ts: Timestamp, hash: i64) -> Self {
        OpTimeWithHash { ts, hash }
    }

    /// The position before any oplog entry.
    pub fn null() -> Self {
        OpTimeWithHash {
            ts: Timestamp {
                time: 0,
                increment: 0,
            },
            hash: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.ts.time == 0 && self.ts.increment == 0
    }

    /// Parse `ts` and `h` from an oplog entry.
    pub fn from_oplog_entry(entry: &Document) -> Result<Self> {
        let ts = entry.get_timestamp(TIMESTAMP_KEY).map_err(|e| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("oplog entry without a valid `ts` field ({:?}): {:?}", e, entry),
            )
        })?;
        let hash = bson_helper::get_integer(entry, HASH_KEY).map_err(|e| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("oplog entry without a valid `h` field ({:?}): {:?}", e, entry),
            )
        })?;
        Ok(OpTimeWithHash { ts, hash })
    }

    pub fn to_document(&self) -> Document {
        doc! { TIMESTAMP_KEY: self.ts, HASH_KEY: self.hash }
    }
}

impl Ord for OpTimeWithHash {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ts.time, self.ts.increment, self.hash).cmp(&(
            other.ts.time,
            other.ts.increment,
            other.hash,
        ))
    }
}

impl PartialOrd for OpTimeWithHash {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OpTimeWithHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ts: Timestamp({}, {}), h: {} }}",
            self.ts.time, self.ts.increment, self.hash
        )
    }
}

impl Default for OpTimeWithHash {
    fn default() -> Self {
        OpTimeWithHash::null()
    }
}

/// Human readable time of a timestamp, for logs only.
pub fn to_datetime(ts: &Timestamp) -> DateTime<Local> {
    Local
        .timestamp_opt(ts.time as i64, 0)
        .single()
        .unwrap_or_else(|| DateTime::<Local>::from(UNIX_EPOCH))
}
