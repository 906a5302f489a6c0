use clap::Parser;
use mongo_initial_sync::blocking::{MongoCommandRunner, MongoOplogApplier, MongoStorage};
use mongo_initial_sync::{
    DataReplicator, InitialSyncConfig, Namespace, StaticSyncSourceSelector, TaskExecutor,
};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"), author = env!("CARGO_PKG_AUTHORS"))]
struct Opts {
    /// configuration file path.
    #[clap(short, long, default_value = "config.toml")]
    conf: String,
    /// log file path, if not specified, all log information will be output to stdout.
    #[clap(long)]
    log_path: Option<String>,
    /// override `initial_sync.max_attempts` of the configuration file.
    #[clap(long)]
    max_attempts: Option<usize>,
    /// size of the local oplog created by initial sync, in bytes.
    #[clap(long, default_value = "1073741824")]
    oplog_size: i64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opts: Opts = Opts::parse();
    let collector = tracing_subscriber::fmt();
    let (non_blocking, _guard) = match opts.log_path {
        Some(ref path) => {
            let path = Path::new(path);
            let dir_name = path.parent().unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|f| f.to_str())
                .ok_or("log path must name a file")?;
            let file_appender = tracing_appender::rolling::daily(dir_name, file_name);
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };
    collector.with_writer(non_blocking).init();

    let conf: InitialSyncConfig = toml::from_slice(&fs::read(&opts.conf)?)?;
    let detail = conf.get_initial_sync_conf();
    let max_attempts = opts.max_attempts.unwrap_or_else(|| detail.get_max_attempts());
    let options = detail.to_replicator_options();

    let executor = TaskExecutor::new(
        detail.get_worker_threads(),
        Arc::new(MongoCommandRunner::new()),
    )?;
    let storage = MongoStorage::new(conf.get_local_uri(), opts.oplog_size)?;
    let applier = MongoOplogApplier::new(storage.client().clone(), Namespace::oplog());
    let replicator = DataReplicator::new(
        options,
        executor.clone(),
        Arc::new(storage),
        Arc::new(StaticSyncSourceSelector::new(
            conf.get_source_uris().to_vec(),
        )),
        Arc::new(applier),
    );

    info!(sources = ?conf.get_source_uris(), local = %conf.get_local_uri(), max_attempts, "Starting initial sync.");
    let result = replicator.do_initial_sync(max_attempts);
    info!(progress = %replicator.get_initial_sync_progress(), "Initial sync progress.");
    executor.shutdown();
    match result {
        Ok(last_applied) => {
            info!(%last_applied, "Initial sync complete.");
            Ok(())
        }
        Err(e) => {
            error!(?e, "Initial sync failed.");
            Err(e.into())
        }
    }
}
