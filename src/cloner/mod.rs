//! Copy databases and collections from a sync source into local storage.
//!
//! [DatabasesCloner] lists the databases of the sync source and runs one [DatabaseCloner] at a
//! time. A [DatabaseCloner] lists the collections of one database and runs one
//! [CollectionCloner] at a time.
mod collection_cloner;
mod database_cloner;
mod databases_cloner;

pub use collection_cloner::{CollectionCloner, CollectionStats};
pub use database_cloner::{CollectionCallback, CollectionPredicate, DatabaseCloner, DatabaseStats};
pub use databases_cloner::{DatabasePredicate, DatabasesCloner, DatabasesStats};

use bson::Document;
use chrono::{DateTime, Local};
use std::fmt;

/// Retry attempts of the first command of every cloner cursor (`count`, `listIndexes`, `find`,
/// `listCollections`, `listDatabases`).
pub const CLONER_RETRY_ATTEMPTS: usize = 3;

/// Called once with the terminal status of a cloner.
pub type CompletionFn = Box<dyn FnOnce(crate::Result<()>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonerState {
    PreStart,
    Running,
    ShuttingDown,
    Complete,
}

impl fmt::Display for ClonerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

fn append_time_stats(
    doc: &mut Document,
    start: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
) {
    if let Some(start) = start {
        doc.insert("start", bson::DateTime::from_millis(start.timestamp_millis()));
        if let Some(end) = end {
            doc.insert("end", bson::DateTime::from_millis(end.timestamp_millis()));
            doc.insert(
                "elapsedMillis",
                end.signed_duration_since(start).num_milliseconds(),
            );
        }
    }
}
