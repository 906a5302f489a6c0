//! initial sync configuration, express in toml.
//!
//! Basic configuration file example:
//! ```toml
//! [source]
//! # replica set members which may serve as sync source, tried in order.
//! uris = ["mongodb://localhost:27017", "mongodb://localhost:27019"]
//!
//! [local]
//! # the member to bootstrap.
//! uri = "mongodb://localhost:27018"
//!
//! [initial_sync]
//! max_attempts = 10
//! worker_threads = 4
//! ```
use crate::applier::BatchLimits;
use crate::data_replicator::DataReplicatorOptions;
use crate::executor::MIN_WORKER_THREADS;
use crate::oplog_fetcher::OplogFetcherOptions;
use serde::Deserialize;
use std::time::Duration;

/// Global initial sync configuration.
#[derive(Deserialize, Debug)]
pub struct InitialSyncConfig {
    source: Source,
    local: Local,
    #[serde(default)]
    initial_sync: InitialSyncConf,
}

impl InitialSyncConfig {
    /// get uris of the sync source candidates.
    pub fn get_source_uris(&self) -> &[String] {
        &self.source.uris
    }

    /// get uri of the node to bootstrap.
    pub fn get_local_uri(&self) -> &str {
        &self.local.uri
    }

    /// get detail initial sync settings.
    pub fn get_initial_sync_conf(&self) -> &InitialSyncConf {
        &self.initial_sync
    }
}

/// Sync source configuration.
#[derive(Deserialize, Debug)]
pub struct Source {
    /// mongodb urls of replica set members, begin with 'mongodb://'
    uris: Vec<String>,
}

/// Local node configuration.
#[derive(Deserialize, Debug)]
pub struct Local {
    uri: String,
}

/// Tuning of the initial sync procedure.
#[derive(Deserialize, Debug)]
pub struct InitialSyncConf {
    #[serde(default = "default_max_attempts")]
    max_attempts: usize,
    /// threads of the task executor, at least 2.
    #[serde(default = "number_of_cpus")]
    worker_threads: usize,
    #[serde(default = "default_retry_wait_ms")]
    initial_sync_retry_wait_ms: u64,
    #[serde(default = "default_retry_wait_ms")]
    sync_source_retry_wait_ms: u64,
    #[serde(default = "default_connect_attempts")]
    num_connect_attempts: usize,
    #[serde(default = "default_find_attempts")]
    num_oplog_find_attempts: usize,
    #[serde(default = "default_oplog_fetcher_max_restarts")]
    oplog_fetcher_max_restarts: usize,
    #[serde(default = "default_oplog_batch_size")]
    oplog_batch_size: i32,
    #[serde(default = "default_await_data_timeout_ms")]
    await_data_timeout_ms: u64,
    #[serde(default = "default_batch_limit_operations")]
    repl_batch_limit_operations: usize,
    #[serde(default = "default_batch_limit_bytes")]
    repl_batch_limit_bytes: usize,
    #[serde(default = "default_oplog_buffer_bytes")]
    oplog_buffer_max_size: usize,
}

impl Default for InitialSyncConf {
    fn default() -> Self {
        InitialSyncConf {
            max_attempts: default_max_attempts(),
            worker_threads: number_of_cpus(),
            initial_sync_retry_wait_ms: default_retry_wait_ms(),
            sync_source_retry_wait_ms: default_retry_wait_ms(),
            num_connect_attempts: default_connect_attempts(),
            num_oplog_find_attempts: default_find_attempts(),
            oplog_fetcher_max_restarts: default_oplog_fetcher_max_restarts(),
            oplog_batch_size: default_oplog_batch_size(),
            await_data_timeout_ms: default_await_data_timeout_ms(),
            repl_batch_limit_operations: default_batch_limit_operations(),
            repl_batch_limit_bytes: default_batch_limit_bytes(),
            oplog_buffer_max_size: default_oplog_buffer_bytes(),
        }
    }
}

impl InitialSyncConf {
    /// get how many failed attempts are tolerated before giving up.
    pub fn get_max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// get worker threads of the task executor.
    ///
    /// The oplog fetcher may block one worker while it waits for buffer space, so there are
    /// always at least two.
    pub fn get_worker_threads(&self) -> usize {
        self.worker_threads.max(MIN_WORKER_THREADS)
    }

    /// build options of the [DataReplicator](crate::DataReplicator).
    pub fn to_replicator_options(&self) -> DataReplicatorOptions {
        let defaults = DataReplicatorOptions::default();
        DataReplicatorOptions {
            initial_sync_retry_wait: Duration::from_millis(self.initial_sync_retry_wait_ms),
            sync_source_retry_wait: Duration::from_millis(self.sync_source_retry_wait_ms),
            num_connect_attempts: self.num_connect_attempts,
            num_oplog_find_attempts: self.num_oplog_find_attempts,
            oplog_fetcher: OplogFetcherOptions {
                batch_size: self.oplog_batch_size,
                max_restarts: self.oplog_fetcher_max_restarts,
                await_data_timeout: Duration::from_millis(self.await_data_timeout_ms),
                ..OplogFetcherOptions::default()
            },
            batch_limits: BatchLimits {
                ops: self.repl_batch_limit_operations,
                bytes: self.repl_batch_limit_bytes,
            },
            oplog_buffer_max_size: self.oplog_buffer_max_size,
            ..defaults
        }
    }
}

fn default_max_attempts() -> usize {
    10
}

fn number_of_cpus() -> usize {
    num_cpus::get()
}

fn default_retry_wait_ms() -> u64 {
    1000
}

fn default_connect_attempts() -> usize {
    10
}

fn default_find_attempts() -> usize {
    3
}

fn default_oplog_fetcher_max_restarts() -> usize {
    1
}

fn default_oplog_batch_size() -> i32 {
    13981010
}

fn default_await_data_timeout_ms() -> u64 {
    2000
}

fn default_batch_limit_operations() -> usize {
    5000
}

fn default_batch_limit_bytes() -> usize {
    100 * 1024 * 1024
}

fn default_oplog_buffer_bytes() -> usize {
    256 * 1024 * 1024
}
