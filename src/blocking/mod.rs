//! Blocking adapters backed by the mongodb driver.
mod applier;
mod connection;
mod oplog_bulk;
mod storage;

pub use applier::MongoOplogApplier;
pub use connection::MongoCommandRunner;
pub use oplog_bulk::execute_normal_oplogs;
pub use storage::MongoStorage;
