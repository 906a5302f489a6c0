use crate::bson_helper::split_namespace;
use crate::error::{ErrorCode, Result, SyncError};
use crate::{OPLOG_COLL, OPLOG_DB};
use std::fmt;

/// Full collection namespace, `<db>.<coll>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse a `<db>.<coll>` string, both parts must be non-empty.
    pub fn parse(ns: &str) -> Result<Self> {
        match split_namespace(ns) {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Namespace::new(db, coll)),
            _ => Err(SyncError::new(
                ErrorCode::BadValue,
                format!("invalid namespace: {:?}", ns),
            )),
        }
    }

    /// `local.oplog.rs`.
    pub fn oplog() -> Self {
        Namespace::new(OPLOG_DB, OPLOG_COLL)
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// true for `<db>.system.*` collections.
    pub fn is_system(&self) -> bool {
        self.coll.starts_with("system.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
