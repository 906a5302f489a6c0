//! Initial sync driver.
//!
//! [DataReplicator::do_initial_sync] runs on the calling thread. Every attempt drops local
//! replicated data, clones all databases of a sync source while tailing its oplog into an
//! [OplogBuffer], then applies buffered entries until the local node is consistent with the
//! oplog position read after cloning finished.

use crate::applier::{next_applier_batch, BatchLimits, OplogApplier};
use crate::cloner::DatabasesCloner;
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{Event, TaskExecutor};
use crate::fetcher::{FetchOutcome, Fetcher, QueryResponse};
use crate::namespace::Namespace;
use crate::oplog_buffer::OplogBuffer;
use crate::oplog_fetcher::{DocumentsInfo, OplogFetcher, OplogFetcherOptions};
use crate::optime::{to_datetime, OpTimeWithHash};
use crate::retry_scheduler::RetryPolicy;
use crate::rollback_checker::RollbackChecker;
use crate::storage::StorageInterface;
use crate::sync_source::SyncSourceSelector;
use bson::{doc, Bson, Document, Timestamp};
use chrono::{DateTime, Local};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct DataReplicatorOptions {
    /// oplog of the local node, dropped and recreated by every attempt.
    pub local_oplog_ns: Namespace,
    /// oplog read on the sync source.
    pub remote_oplog_ns: Namespace,
    pub initial_sync_retry_wait: Duration,
    pub sync_source_retry_wait: Duration,
    pub num_connect_attempts: usize,
    /// attempts of the `find` reading the newest oplog entry of the sync source.
    pub num_oplog_find_attempts: usize,
    /// attempts of `replSetGetRBID`.
    pub num_rbid_attempts: usize,
    pub oplog_fetcher: OplogFetcherOptions,
    pub batch_limits: BatchLimits,
    /// byte budget of the oplog buffer.
    pub oplog_buffer_max_size: usize,
    /// how long the apply loop waits for new entries before looking at its events again.
    pub apply_poll_interval: Duration,
}

impl Default for DataReplicatorOptions {
    fn default() -> Self {
        DataReplicatorOptions {
            local_oplog_ns: Namespace::oplog(),
            remote_oplog_ns: Namespace::oplog(),
            initial_sync_retry_wait: Duration::from_secs(1),
            sync_source_retry_wait: Duration::from_secs(1),
            num_connect_attempts: 10,
            num_oplog_find_attempts: 3,
            num_rbid_attempts: 3,
            oplog_fetcher: OplogFetcherOptions::default(),
            batch_limits: BatchLimits {
                ops: 5000,
                bytes: 100 * 1024 * 1024,
            },
            oplog_buffer_max_size: 256 * 1024 * 1024,
            apply_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReplicatorState {
    Uninitialized,
    InitialSync,
}

impl fmt::Display for DataReplicatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome of one initial sync attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialSyncAttemptInfo {
    pub duration_millis: i64,
    pub status: String,
    pub sync_source: String,
}

impl InitialSyncAttemptInfo {
    pub fn to_document(&self) -> Document {
        doc! {
            "durationMillis": self.duration_millis,
            "status": self.status.clone(),
            "syncSource": self.sync_source.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InitialSyncStats {
    pub failed_initial_sync_attempts: usize,
    pub max_failed_initial_sync_attempts: usize,
    pub initial_sync_start: Option<DateTime<Local>>,
    pub initial_sync_end: Option<DateTime<Local>>,
    pub attempts: Vec<InitialSyncAttemptInfo>,
}

impl InitialSyncStats {
    fn append(&self, doc: &mut Document) {
        doc.insert(
            "failedInitialSyncAttempts",
            self.failed_initial_sync_attempts as i64,
        );
        doc.insert(
            "maxFailedInitialSyncAttempts",
            self.max_failed_initial_sync_attempts as i64,
        );
        if let Some(start) = self.initial_sync_start {
            doc.insert(
                "initialSyncStart",
                bson::DateTime::from_millis(start.timestamp_millis()),
            );
            if let Some(end) = self.initial_sync_end {
                doc.insert(
                    "initialSyncEnd",
                    bson::DateTime::from_millis(end.timestamp_millis()),
                );
                doc.insert(
                    "initialSyncElapsedMillis",
                    end.signed_duration_since(start).num_milliseconds(),
                );
            }
        }
        let attempts: Vec<Bson> = self
            .attempts
            .iter()
            .map(|a| Bson::Document(a.to_document()))
            .collect();
        doc.insert("initialSyncAttempts", attempts);
    }
}

/// Messages from the components of a running attempt to the control thread.
#[derive(Debug)]
enum AttemptEvent {
    ClonerDone(Result<()>),
    OplogFetcherDone(Result<()>, OpTimeWithHash),
    Shutdown,
}

/// Live components and counters of the current attempt.
struct AttemptContext {
    sync_source: String,
    started: Instant,
    events: Sender<AttemptEvent>,
    rollback_checker: Option<Arc<RollbackChecker>>,
    last_entry_fetcher: Option<Fetcher>,
    dbs_cloner: Option<DatabasesCloner>,
    oplog_fetcher: Option<OplogFetcher>,
    seed_doc: Option<Document>,
    begin_timestamp: Option<Timestamp>,
    stop_timestamp: Option<Timestamp>,
    applied_ops: u64,
    fetched_missing_docs: u64,
    canceled: AtomicBool,
}

impl AttemptContext {
    fn new(sync_source: String, events: Sender<AttemptEvent>) -> Self {
        AttemptContext {
            sync_source,
            started: Instant::now(),
            events,
            rollback_checker: None,
            last_entry_fetcher: None,
            dbs_cloner: None,
            oplog_fetcher: None,
            seed_doc: None,
            begin_timestamp: None,
            stop_timestamp: None,
            applied_ops: 0,
            fetched_missing_docs: 0,
            canceled: AtomicBool::new(false),
        }
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        if let Some(checker) = self.rollback_checker.as_ref() {
            checker.shutdown();
        }
        if let Some(fetcher) = self.last_entry_fetcher.as_ref() {
            fetcher.shutdown();
        }
        if let Some(cloner) = self.dbs_cloner.as_ref() {
            cloner.shutdown();
        }
        if let Some(fetcher) = self.oplog_fetcher.as_ref() {
            fetcher.shutdown();
        }
    }

    fn append(&self, doc: &mut Document) {
        doc.insert("fetchedMissingDocs", self.fetched_missing_docs as i64);
        doc.insert("appliedOps", self.applied_ops as i64);
        if let Some(ts) = self.begin_timestamp {
            doc.insert("initialSyncOplogStart", ts);
        }
        if let Some(ts) = self.stop_timestamp {
            doc.insert("initialSyncOplogEnd", ts);
        }
        if let Some(cloner) = self.dbs_cloner.as_ref() {
            doc.insert("databases", cloner.get_stats().to_document());
        }
    }
}

/// Bring an empty or stale node in sync with a healthy member of its replica set.
#[derive(Clone)]
pub struct DataReplicator {
    inner: Arc<ReplicatorInner>,
}

struct ReplicatorInner {
    options: DataReplicatorOptions,
    executor: TaskExecutor,
    storage: Arc<dyn StorageInterface>,
    selector: Arc<dyn SyncSourceSelector>,
    applier: Arc<dyn OplogApplier>,
    buffer: Arc<OplogBuffer>,
    shutdown_event: Event,
    shared: Mutex<Shared>,
}

struct Shared {
    state: DataReplicatorState,
    in_shutdown: bool,
    sync_source: Option<String>,
    last_fetched: OpTimeWithHash,
    last_applied: OpTimeWithHash,
    stats: InitialSyncStats,
    attempt: Option<AttemptContext>,
}

impl DataReplicator {
    pub fn new(
        options: DataReplicatorOptions,
        executor: TaskExecutor,
        storage: Arc<dyn StorageInterface>,
        selector: Arc<dyn SyncSourceSelector>,
        applier: Arc<dyn OplogApplier>,
    ) -> Self {
        let buffer = Arc::new(OplogBuffer::new(options.oplog_buffer_max_size));
        DataReplicator {
            inner: Arc::new(ReplicatorInner {
                options,
                executor,
                storage,
                selector,
                applier,
                buffer,
                shutdown_event: Event::new(),
                shared: Mutex::new(Shared {
                    state: DataReplicatorState::Uninitialized,
                    in_shutdown: false,
                    sync_source: None,
                    last_fetched: OpTimeWithHash::null(),
                    last_applied: OpTimeWithHash::null(),
                    stats: InitialSyncStats::default(),
                    attempt: None,
                }),
            }),
        }
    }

    /// Run initial sync until an attempt succeeds or `max_attempts` attempts failed.
    ///
    /// Returns the last applied position, or the error of the last failed attempt.
    pub fn do_initial_sync(&self, max_attempts: usize) -> Result<OpTimeWithHash> {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.in_shutdown {
                return Err(shutdown_status());
            }
            if shared.state == DataReplicatorState::InitialSync {
                return Err(SyncError::new(
                    ErrorCode::InitialSyncActive,
                    "Initial sync in progress; try resync to start anew.",
                ));
            }
            shared.state = DataReplicatorState::InitialSync;
            shared.stats = InitialSyncStats {
                max_failed_initial_sync_attempts: max_attempts,
                initial_sync_start: Some(Local::now()),
                ..Default::default()
            };
        }

        self.inner.buffer.startup();
        let result = self.inner.run_attempts(max_attempts);
        self.inner.buffer.shutdown();

        let mut shared = self.inner.shared.lock().unwrap();
        shared.state = DataReplicatorState::Uninitialized;
        match &result {
            Ok(last_applied) => {
                let took = shared
                    .stats
                    .initial_sync_start
                    .zip(shared.stats.initial_sync_end)
                    .map(|(start, end)| end.signed_duration_since(start).num_seconds())
                    .unwrap_or_default();
                info!(%last_applied, took_secs = took, "Initial sync done.");
            }
            Err(e) => error!(?e, "Initial sync failed."),
        }
        result
    }

    /// Stop a running initial sync, the current attempt fails with `ShutdownInProgress`.
    pub fn shutdown(&self) {
        {
            let mut shared = self.inner.shared.lock().unwrap();
            if shared.in_shutdown {
                return;
            }
            shared.in_shutdown = true;
            if let Some(attempt) = shared.attempt.as_ref() {
                attempt.cancel();
                let _ = attempt.events.send(AttemptEvent::Shutdown);
            }
        }
        info!("Shutting down initial sync.");
        self.inner.buffer.shutdown();
        self.inner.shutdown_event.signal();
    }

    pub fn state(&self) -> DataReplicatorState {
        self.inner.shared.lock().unwrap().state
    }

    pub fn sync_source(&self) -> Option<String> {
        self.inner.shared.lock().unwrap().sync_source.clone()
    }

    pub fn last_fetched(&self) -> OpTimeWithHash {
        self.inner.shared.lock().unwrap().last_fetched
    }

    pub fn last_applied(&self) -> OpTimeWithHash {
        self.inner.shared.lock().unwrap().last_applied
    }

    pub fn oplog_buffer_count(&self) -> usize {
        self.inner.buffer.count()
    }

    pub fn stats(&self) -> InitialSyncStats {
        self.inner.shared.lock().unwrap().stats.clone()
    }

    /// Counters of the whole initial sync and of the current (or last) attempt.
    pub fn get_initial_sync_progress(&self) -> Document {
        let shared = self.inner.shared.lock().unwrap();
        progress_document(&shared)
    }
}

impl fmt::Display for DataReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock().unwrap();
        write!(
            f,
            "DataReplicator - state: {}, syncSource: {}, lastFetched: {}, lastApplied: {}, oplogBuffer: {} entries",
            shared.state,
            shared.sync_source.as_deref().unwrap_or(""),
            shared.last_fetched,
            shared.last_applied,
            self.inner.buffer.count()
        )
    }
}

fn shutdown_status() -> SyncError {
    SyncError::new(
        ErrorCode::ShutdownInProgress,
        "Shutting down while in doInitialSync.",
    )
}

fn progress_document(shared: &Shared) -> Document {
    let mut doc = Document::new();
    shared.stats.append(&mut doc);
    if let Some(attempt) = shared.attempt.as_ref() {
        attempt.append(&mut doc);
    }
    doc
}

/// The newest entry out of a `{find, sort: {$natural: -1}, limit: 1}` reply.
fn first_document(batch: QueryResponse) -> Result<Document> {
    batch.documents.into_iter().next().ok_or_else(|| {
        SyncError::new(
            ErrorCode::NoMatchingDocument,
            "No document in batch from sync source oplog.",
        )
    })
}

impl ReplicatorInner {
    fn run_attempts(self: &Arc<Self>, max_attempts: usize) -> Result<OpTimeWithHash> {
        self.storage.set_initial_sync_flag()?;

        loop {
            {
                let mut shared = self.shared.lock().unwrap();
                if shared.in_shutdown {
                    return Err(shutdown_status());
                }
                shared.sync_source = None;
                shared.attempt = None;
                shared.last_applied = OpTimeWithHash::null();
                shared.last_fetched = OpTimeWithHash::null();
            }
            self.buffer.clear();

            let started = Instant::now();
            let status = self
                .choose_sync_source()
                .and_then(|source| self.run_attempt(source));
            debug!(?status, "Initial sync attempt returned.");
            self.teardown_attempt();

            let mut shared = self.shared.lock().unwrap();
            let duration = shared
                .attempt
                .as_ref()
                .map(|a| a.started.elapsed())
                .unwrap_or_else(|| started.elapsed());
            let info = InitialSyncAttemptInfo {
                duration_millis: duration.as_millis() as i64,
                status: match &status {
                    Ok(()) => "OK".to_string(),
                    Err(e) => e.to_string(),
                },
                sync_source: shared.sync_source.clone().unwrap_or_default(),
            };
            shared.stats.attempts.push(info);

            if status.is_ok() {
                shared.stats.initial_sync_end = Some(Local::now());
                info!(stats = %progress_document(&shared), "Initial Sync Statistics.");
            }
            if shared.in_shutdown {
                error!(?status, "Initial sync attempt terminated due to shutdown.");
                return Err(match status {
                    Err(e) if !e.is_canceled() && e.code() != ErrorCode::ShutdownInProgress => e,
                    _ => shutdown_status(),
                });
            }
            let err = match status {
                Ok(()) => break,
                Err(e) => e,
            };

            shared.stats.failed_initial_sync_attempts += 1;
            let failed = shared.stats.failed_initial_sync_attempts;
            error!(
                attempts_left = max_attempts.saturating_sub(failed),
                ?err,
                "Initial sync attempt failed."
            );
            if failed >= max_attempts {
                error!("The maximum number of retries have been exhausted for initial sync.");
                shared.stats.initial_sync_end = Some(Local::now());
                info!(stats = %progress_document(&shared), "Initial Sync Statistics.");
                return Err(err);
            }
            drop(shared);

            if self
                .shutdown_event
                .wait_timeout(self.options.initial_sync_retry_wait)
            {
                return Err(shutdown_status());
            }
        }

        let last_applied = {
            let mut shared = self.shared.lock().unwrap();
            shared.last_fetched = shared.last_applied;
            shared.last_applied
        };
        self.storage.clear_initial_sync_flag()?;
        self.storage.set_applied_through(&last_applied)?;
        Ok(last_applied)
    }

    fn choose_sync_source(&self) -> Result<String> {
        let attempts = self.options.num_connect_attempts;
        for attempt in 1..=attempts {
            let last_fetched = self.shared.lock().unwrap().last_fetched;
            if let Some(source) = self.selector.choose_new_sync_source(&last_fetched) {
                self.shared.lock().unwrap().sync_source = Some(source.clone());
                return Ok(source);
            }
            debug!(
                attempt,
                attempts,
                wait = ?self.options.sync_source_retry_wait,
                "No sync source available, trying again."
            );
            if self
                .shutdown_event
                .wait_timeout(self.options.sync_source_retry_wait)
            {
                return Err(shutdown_status());
            }
        }
        Err(SyncError::new(
            ErrorCode::InitialSyncOplogSourceMissing,
            "No valid sync source found in current replica set to do an initial sync.",
        ))
    }

    fn run_attempt(self: &Arc<Self>, source: String) -> Result<()> {
        info!(%source, "Starting initial sync attempt.");
        let (sender, receiver) = channel::unbounded();
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.in_shutdown {
                return Err(shutdown_status());
            }
            shared.attempt = Some(AttemptContext::new(source.clone(), sender.clone()));
        }

        let local_oplog = self.options.local_oplog_ns.clone();
        debug!(oplog = %local_oplog, "Dropping the oplog and replicated databases.");
        self.run_storage_task(move |storage| {
            storage.drop_collection(&local_oplog)?;
            storage.drop_replicated_databases()?;
            storage.create_oplog(&local_oplog)
        })?;

        let rollback_checker = Arc::new(RollbackChecker::new(
            self.executor.clone(),
            source.clone(),
            RetryPolicy::new(self.options.num_rbid_attempts),
        ));
        self.with_attempt(|attempt| attempt.rollback_checker = Some(rollback_checker.clone()))?;
        rollback_checker.reset_sync()?;

        let seed_doc = self.get_latest_oplog_entry(&source)?;
        let begin = OpTimeWithHash::from_oplog_entry(&seed_doc)?;
        self.with_attempt(|attempt| {
            attempt.seed_doc = Some(seed_doc.clone());
            attempt.begin_timestamp = Some(begin.ts);
        })?;

        self.start_cloning(&source, begin, &sender)?;
        let mut fetcher_done = self.wait_for_cloning(&receiver)?;

        let stop_doc = self.get_latest_oplog_entry(&source)?;
        let stop = OpTimeWithHash::from_oplog_entry(&stop_doc)?;
        self.with_attempt(|attempt| attempt.stop_timestamp = Some(stop.ts))?;

        if begin < stop {
            info!(
                begin = %to_datetime(&begin.ts),
                stop = %to_datetime(&stop.ts),
                "Applying operations before initial sync can complete."
            );
            self.apply_until_consistent(&source, &receiver, &mut fetcher_done)?;
        } else {
            info!(stop = %to_datetime(&stop.ts), "No need to apply operations.");
            let mut shared = self.shared.lock().unwrap();
            if shared.last_applied < stop {
                shared.last_applied = stop;
            }
        }

        let has_had_rollback = rollback_checker.has_had_rollback()?;
        if has_had_rollback {
            return Err(SyncError::new(
                ErrorCode::UnrecoverableRollbackError,
                "Rollback occurred during initial sync",
            ));
        }

        let (applied_ops, seed_doc) = {
            let shared = self.shared.lock().unwrap();
            match shared.attempt.as_ref() {
                Some(attempt) => (attempt.applied_ops, attempt.seed_doc.clone()),
                None => (0, None),
            }
        };
        if applied_ops == 0 {
            if let Some(seed_doc) = seed_doc {
                debug!(%seed_doc, "Inserting oplog seed document.");
                let local_oplog = self.options.local_oplog_ns.clone();
                self.run_storage_task(move |storage| {
                    storage.insert_documents(&local_oplog, &[seed_doc])
                })?;
            }
        }
        Ok(())
    }

    /// Start the databases cloner and the oplog fetcher, both report to `events`.
    fn start_cloning(
        self: &Arc<Self>,
        source: &str,
        begin: OpTimeWithHash,
        events: &Sender<AttemptEvent>,
    ) -> Result<()> {
        let cloner_events = events.clone();
        let dbs_cloner = DatabasesCloner::new(
            self.executor.clone(),
            source,
            DatabasesCloner::default_predicate(),
            self.storage.clone(),
            move |status| {
                let _ = cloner_events.send(AttemptEvent::ClonerDone(status));
            },
        );

        let weak: Weak<ReplicatorInner> = Arc::downgrade(self);
        let fetcher_events = events.clone();
        let oplog_fetcher = OplogFetcher::new(
            self.executor.clone(),
            begin,
            source,
            self.options.remote_oplog_ns.clone(),
            self.options.oplog_fetcher,
            Arc::new(move |docs: &[Document], info: &DocumentsInfo| match weak.upgrade() {
                Some(inner) => inner.enqueue_documents(docs, info),
                None => Err(SyncError::canceled()),
            }),
            move |status, last_fetched| {
                let _ = fetcher_events.send(AttemptEvent::OplogFetcherDone(status, last_fetched));
            },
        );

        self.with_attempt(|attempt| {
            attempt.dbs_cloner = Some(dbs_cloner.clone());
            attempt.oplog_fetcher = Some(oplog_fetcher.clone());
        })?;
        debug!(fetcher = %oplog_fetcher, "Starting oplog fetcher.");
        oplog_fetcher.startup()?;
        dbs_cloner.startup()
    }

    /// Block until cloning finished, returns whether the oplog fetcher already completed.
    fn wait_for_cloning(&self, events: &Receiver<AttemptEvent>) -> Result<bool> {
        let mut fetcher_done = false;
        loop {
            let event = events.recv().map_err(|_| SyncError::canceled())?;
            match event {
                AttemptEvent::ClonerDone(Ok(())) => {
                    info!("Data clone finished.");
                    return Ok(fetcher_done);
                }
                AttemptEvent::ClonerDone(Err(e)) => {
                    error!(?e, "Failed to clone data.");
                    return Err(e);
                }
                event => {
                    self.on_fetcher_or_shutdown(event)?;
                    fetcher_done = true;
                }
            }
        }
    }

    fn on_fetcher_or_shutdown(&self, event: AttemptEvent) -> Result<()> {
        match event {
            AttemptEvent::OplogFetcherDone(status, last_fetched) => {
                info!(?status, %last_fetched, "Finished fetching oplog during initial sync.");
                status?;
                self.shared.lock().unwrap().last_fetched = last_fetched;
                Ok(())
            }
            AttemptEvent::Shutdown => Err(shutdown_status()),
            AttemptEvent::ClonerDone(status) => status,
        }
    }

    fn apply_until_consistent(
        &self,
        source: &str,
        events: &Receiver<AttemptEvent>,
        fetcher_done: &mut bool,
    ) -> Result<()> {
        loop {
            loop {
                match events.try_recv() {
                    Ok(event) => {
                        self.on_fetcher_or_shutdown(event)?;
                        *fetcher_done = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return Err(SyncError::canceled()),
                }
            }

            let stop_ts = {
                let shared = self.shared.lock().unwrap();
                if shared.in_shutdown {
                    return Err(shutdown_status());
                }
                let stop_ts = shared.attempt.as_ref().and_then(|a| a.stop_timestamp);
                match stop_ts {
                    Some(ts) if !shared.last_applied.is_null() && shared.last_applied.ts >= ts => {
                        return Ok(())
                    }
                    _ => stop_ts,
                }
            };

            let batch = next_applier_batch(&self.buffer, &self.options.batch_limits)?;
            if batch.is_empty() {
                if *fetcher_done {
                    return Err(SyncError::new(
                        ErrorCode::InitialSyncFailure,
                        format!(
                            "oplog fetcher finished before reaching the stop timestamp {:?}",
                            stop_ts
                        ),
                    ));
                }
                self.buffer.wait_for_data(self.options.apply_poll_interval);
                continue;
            }

            let count = batch.len() as u64;
            let applier = self.applier.clone();
            let applied = self.run_task(move || applier.apply_batch(&batch))?;

            if applied.fetched_missing_docs > 0 {
                let newest = self.get_latest_oplog_entry(source)?;
                let new_stop = OpTimeWithHash::from_oplog_entry(&newest)?;
                debug!(
                    old = ?stop_ts,
                    new = ?new_stop.ts,
                    fetched_missing_docs = applied.fetched_missing_docs,
                    "Pushing back the stop timestamp."
                );
                self.with_attempt(|attempt| {
                    attempt.fetched_missing_docs += applied.fetched_missing_docs;
                    attempt.stop_timestamp = Some(new_stop.ts);
                })?;
            }

            let mut shared = self.shared.lock().unwrap();
            shared.last_applied = applied.last_applied;
            if let Some(attempt) = shared.attempt.as_mut() {
                attempt.applied_ops += count;
            }
        }
    }

    /// Push a fetched batch into the buffer, blocking while it lacks room and the attempt is live.
    fn enqueue_documents(&self, docs: &[Document], info: &DocumentsInfo) -> Result<()> {
        if info.to_apply_document_count == 0 {
            return Ok(());
        }
        let bytes = info.to_apply_document_bytes;
        while !self
            .buffer
            .wait_for_space_timeout(bytes, self.options.apply_poll_interval)?
        {
            let shared = self.shared.lock().unwrap();
            if shared.in_shutdown {
                return Err(shutdown_status());
            }
            if shared.attempt.as_ref().map_or(true, |a| a.is_canceled()) {
                return Err(SyncError::canceled());
            }
        }
        if self.shared.lock().unwrap().in_shutdown {
            return Err(shutdown_status());
        }
        self.buffer.push_all_non_blocking(docs.iter().cloned());
        debug!(
            entries = self.buffer.count(),
            bytes = self.buffer.size(),
            "Oplog buffer filled."
        );
        self.shared.lock().unwrap().last_fetched = info.last_document;
        Ok(())
    }

    /// Newest entry of the remote oplog, read with a retried `find`.
    fn get_latest_oplog_entry(&self, source: &str) -> Result<Document> {
        let (sender, receiver) = channel::bounded(1);
        let remote = &self.options.remote_oplog_ns;
        let fetcher = Fetcher::new(
            self.executor.clone(),
            source,
            remote.db(),
            doc! {"find": remote.coll(), "sort": {"$natural": -1}, "limit": 1},
            move |res: Result<QueryResponse>| {
                let _ = sender.try_send(res.and_then(first_document));
                FetchOutcome::Stop
            },
            RetryPolicy::new(self.options.num_oplog_find_attempts),
        );
        self.with_attempt(|attempt| attempt.last_entry_fetcher = Some(fetcher.clone()))?;
        fetcher.schedule()?;
        let result = receiver.recv().unwrap_or_else(|_| Err(SyncError::canceled()));
        fetcher.join();
        result
    }

    /// Run `f` on the current attempt, fails once shutdown started.
    fn with_attempt<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut AttemptContext),
    {
        let mut shared = self.shared.lock().unwrap();
        if shared.in_shutdown {
            return Err(shutdown_status());
        }
        match shared.attempt.as_mut() {
            Some(attempt) => {
                f(attempt);
                Ok(())
            }
            None => Err(SyncError::new(
                ErrorCode::IllegalOperation,
                "no initial sync attempt in progress",
            )),
        }
    }

    fn run_storage_task<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn StorageInterface) -> Result<T> + Send + 'static,
    {
        let storage = self.storage.clone();
        self.run_task(move || f(storage.as_ref()))
    }

    /// Run `f` on the executor and block until it returned.
    fn run_task<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (sender, receiver) = channel::bounded(1);
        self.executor.schedule_work(move |status| {
            let _ = sender.send(status.and_then(|()| f()));
        })?;
        receiver.recv().unwrap_or_else(|_| Err(SyncError::canceled()))
    }

    /// Cancel and join every component of the current attempt.
    fn teardown_attempt(&self) {
        let (cloner, oplog_fetcher, last_entry_fetcher) = {
            let shared = self.shared.lock().unwrap();
            match shared.attempt.as_ref() {
                Some(attempt) => {
                    attempt.cancel();
                    (
                        attempt.dbs_cloner.clone(),
                        attempt.oplog_fetcher.clone(),
                        attempt.last_entry_fetcher.clone(),
                    )
                }
                None => return,
            }
        };
        // the oplog fetcher may be blocked on a full buffer, nothing drains it anymore.
        self.buffer.clear();
        if let Some(fetcher) = last_entry_fetcher {
            fetcher.join();
        }
        if let Some(fetcher) = oplog_fetcher {
            debug!(%fetcher, "Waiting on oplog fetcher.");
            fetcher.join();
        }
        if let Some(cloner) = cloner {
            debug!("Waiting on databases cloner.");
            cloner.join();
        }
        if let Some(attempt) = self.shared.lock().unwrap().attempt.as_ref() {
            if attempt.applied_ops > 0 {
                debug!(
                    source = %attempt.sync_source,
                    applied_ops = attempt.applied_ops,
                    "Initial sync attempt torn down."
                );
            }
        }
        if self.buffer.count() > 0 {
            warn!(entries = self.buffer.count(), "Dropping buffered oplog entries.");
        }
        self.buffer.clear();
    }
}
