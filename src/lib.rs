//! Mongo initial sync lib, which bootstraps a replica set member from one of its peers.
//!
//! [DataReplicator] drives the whole procedure: it clones every database of a sync source
//! with a [DatabasesCloner] while an [OplogFetcher] tails the oplog of the same source into an
//! [OplogBuffer], then applies the buffered entries until the copy is consistent.
//!
//! Remote commands go through a [RemoteCommandRunner], local writes through a
//! [StorageInterface] and oplog application through an [OplogApplier]. The [blocking] module
//! implements all three with the mongodb driver.
//!
//! # Example:
//! ```no_run
//! use mongo_initial_sync::blocking::{MongoCommandRunner, MongoOplogApplier, MongoStorage};
//! use mongo_initial_sync::{
//!     DataReplicator, DataReplicatorOptions, Namespace, StaticSyncSourceSelector, TaskExecutor,
//! };
//! use std::sync::Arc;
//!
//! let executor = TaskExecutor::new(4, Arc::new(MongoCommandRunner::new())).unwrap();
//! let storage = MongoStorage::new("mongodb://localhost:27018", 1 << 30).unwrap();
//! let applier = MongoOplogApplier::new(storage.client().clone(), Namespace::oplog());
//! let replicator = DataReplicator::new(
//!     DataReplicatorOptions::default(),
//!     executor,
//!     Arc::new(storage),
//!     Arc::new(StaticSyncSourceSelector::new(vec!["localhost:27017".to_string()])),
//!     Arc::new(applier),
//! );
//! let last_applied = replicator.do_initial_sync(10).unwrap();
//! ```

pub mod applier;
pub mod blocking;
pub mod bson_helper;
pub mod cloner;
pub mod cmd_oplog;
mod config;
mod data_replicator;
mod error;
pub mod executor;
pub mod fetcher;
mod namespace;
pub mod oplog_buffer;
pub mod oplog_fetcher;
mod optime;
pub mod retry_scheduler;
pub mod rollback_checker;
pub mod storage;
pub mod sync_source;

/// mongodb internal database for admin.
const ADMIN_DB_NAME: &str = "admin";
/// mongodb internal database which saves oplogs.
const OPLOG_DB: &str = "local";
/// mongodb internal collection which saves oplogs.
const OPLOG_COLL: &str = "oplog.rs";

/// oplog namespace key name.
const NAMESPACE_KEY: &str = "ns";
/// oplog timestamp key name.
const TIMESTAMP_KEY: &str = "ts";
/// oplog hash key name.
const HASH_KEY: &str = "h";
/// oplog operation key name.
const OP_KEY: &str = "op";
/// noop operation.
const NOOP_OP: &str = "n";
/// command operation.
const COMMAND_OP: &str = "c";

pub use applier::{AppliedBatch, BatchLimits, OplogApplier};
pub use cloner::{CollectionCloner, DatabaseCloner, DatabasesCloner};
pub use config::{InitialSyncConf, InitialSyncConfig};
pub use data_replicator::{
    DataReplicator, DataReplicatorOptions, DataReplicatorState, InitialSyncAttemptInfo,
    InitialSyncStats,
};
pub use error::{ErrorCode, Result, SyncError};
pub use executor::{RemoteCommandRequest, RemoteCommandRunner, TaskExecutor};
pub use fetcher::{FetchOutcome, Fetcher, QueryResponse};
pub use namespace::Namespace;
pub use oplog_buffer::OplogBuffer;
pub use oplog_fetcher::{DocumentsInfo, OplogFetcher, OplogFetcherOptions};
pub use optime::OpTimeWithHash;
pub use storage::{CollectionBulkLoader, CollectionOptions, StorageInterface};
pub use sync_source::{StaticSyncSourceSelector, SyncSourceSelector};
