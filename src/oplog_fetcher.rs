//! Tail the oplog of the sync source.

use crate::bson_helper::doc_size;
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::TaskExecutor;
use crate::fetcher::{FetchOutcome, Fetcher, FetcherState, QueryResponse};
use crate::namespace::Namespace;
use crate::optime::OpTimeWithHash;
use crate::retry_scheduler::RetryPolicy;
use bson::{doc, Document};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Byte and document counts of one fetched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DocumentsInfo {
    pub network_document_count: usize,
    pub network_document_bytes: usize,
    pub to_apply_document_count: usize,
    pub to_apply_document_bytes: usize,
    /// position of the last document, null for a batch without new document.
    pub last_document: OpTimeWithHash,
}

/// Receive the entries to apply of each batch.
pub type EnqueueDocumentsFn = Arc<dyn Fn(&[Document], &DocumentsInfo) -> Result<()> + Send + Sync>;

/// Receive the terminal status and the last fetched position.
pub type OnShutdownFn = Box<dyn FnOnce(Result<()>, OpTimeWithHash) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OplogFetcherOptions {
    pub batch_size: i32,
    /// consecutive restarts after a failed command before giving up.
    pub max_restarts: usize,
    /// `maxTimeMS` of the first `find`.
    pub initial_find_max_time: Duration,
    /// `maxTimeMS` of a `find` sent by a restart.
    pub retried_find_max_time: Duration,
    /// `maxTimeMS` of every `getMore`.
    pub await_data_timeout: Duration,
}

impl Default for OplogFetcherOptions {
    fn default() -> Self {
        OplogFetcherOptions {
            batch_size: 13981010,
            max_restarts: 1,
            initial_find_max_time: Duration::from_secs(60),
            retried_find_max_time: Duration::from_secs(2),
            await_data_timeout: Duration::from_secs(2),
        }
    }
}

/// Check that the first batch of a `{ts: {$gte: last_fetched}}` query starts exactly at
/// `last_fetched`.
pub fn check_remote_oplog_start(documents: &[Document], last_fetched: &OpTimeWithHash) -> Result<()> {
    let first = documents.first().ok_or_else(|| {
        SyncError::new(
            ErrorCode::OplogStartMissing,
            "Received an empty batch from sync source.",
        )
    })?;
    let optime = OpTimeWithHash::from_oplog_entry(first).map_err(|e| {
        SyncError::new(
            ErrorCode::InvalidBson,
            format!(
                "our last op time fetched: {}. failed to parse optime from first oplog on source: {}: {}",
                last_fetched, first, e
            ),
        )
    })?;
    if optime != *last_fetched {
        return Err(SyncError::new(
            ErrorCode::OplogStartMissing,
            format!(
                "Our last op time fetched: {}. source's GTE: {}",
                last_fetched, optime
            ),
        ));
    }
    Ok(())
}

/// Check ordering of a batch and count what it holds.
///
/// The first document of a first batch is the last fetched entry, it is neither checked nor
/// applied again.
pub fn validate_documents(
    documents: &[Document],
    first: bool,
    last_ts: bson::Timestamp,
) -> Result<DocumentsInfo> {
    if first && documents.is_empty() {
        return Err(SyncError::new(
            ErrorCode::OplogStartMissing,
            format!(
                "The first batch of oplog entries is empty, but expected at least 1 document matching ts: {:?}",
                last_ts
            ),
        ));
    }

    let mut info = DocumentsInfo::default();
    let mut last_ts = last_ts;
    for doc in documents {
        info.network_document_bytes += doc_size(doc);
        info.network_document_count += 1;
        if first && info.network_document_count == 1 {
            continue;
        }

        info.last_document = OpTimeWithHash::from_oplog_entry(doc)?;
        let doc_ts = info.last_document.ts;
        if last_ts >= doc_ts {
            return Err(SyncError::new(
                ErrorCode::OplogOutOfOrder,
                format!(
                    "Out of order entries in oplog. lastTS: {:?} outOfOrderTS: {:?} in batch with {} docs; first-batch: {}, doc: {}",
                    last_ts, doc_ts, info.network_document_count, first, doc
                ),
            ));
        }
        last_ts = doc_ts;
    }

    info.to_apply_document_count = documents.len();
    info.to_apply_document_bytes = info.network_document_bytes;
    if first {
        info.to_apply_document_count -= 1;
        info.to_apply_document_bytes -= doc_size(&documents[0]);
    }
    Ok(info)
}

/// Tailable, awaitData cursor on the oplog of the sync source.
///
/// Failed commands are retried by restarting the cursor from the last fetched position, at
/// most `max_restarts` consecutive times. The shutdown callback fires exactly once when the
/// fetcher was started.
#[derive(Clone)]
pub struct OplogFetcher {
    inner: Arc<OplogFetcherInner>,
}

struct OplogFetcherInner {
    executor: TaskExecutor,
    source: String,
    nss: Namespace,
    options: OplogFetcherOptions,
    enqueue: EnqueueDocumentsFn,
    shared: Mutex<Shared>,
    cond: Condvar,
}

struct Shared {
    state: FetcherState,
    last_fetched: OpTimeWithHash,
    restarts: usize,
    fetchers: Vec<Fetcher>,
    on_shutdown: Option<OnShutdownFn>,
    fetched_documents: usize,
    fetched_bytes: usize,
}

impl OplogFetcher {
    pub fn new<F>(
        executor: TaskExecutor,
        last_fetched: OpTimeWithHash,
        source: impl Into<String>,
        nss: Namespace,
        options: OplogFetcherOptions,
        enqueue: EnqueueDocumentsFn,
        on_shutdown: F,
    ) -> Self
    where
        F: FnOnce(Result<()>, OpTimeWithHash) + Send + 'static,
    {
        OplogFetcher {
            inner: Arc::new(OplogFetcherInner {
                executor,
                source: source.into(),
                nss,
                options,
                enqueue,
                shared: Mutex::new(Shared {
                    state: FetcherState::PreStart,
                    last_fetched,
                    restarts: 0,
                    fetchers: vec![],
                    on_shutdown: Some(Box::new(on_shutdown)),
                    fetched_documents: 0,
                    fetched_bytes: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn startup(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != FetcherState::PreStart {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                format!("oplog fetcher already started, state: {}", shared.state),
            ));
        }
        let fetcher = self
            .inner
            .make_fetcher(shared.last_fetched, self.inner.options.initial_find_max_time);
        if let Err(e) = fetcher.schedule() {
            shared.state = FetcherState::Complete;
            return Err(e);
        }
        shared.state = FetcherState::Running;
        shared.fetchers.push(fetcher);
        info!(
            source = %self.inner.source,
            last_fetched = %shared.last_fetched,
            "Oplog fetcher started."
        );
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            FetcherState::PreStart => {
                shared.state = FetcherState::Complete;
                self.inner.cond.notify_all();
            }
            FetcherState::Running => {
                shared.state = FetcherState::ShuttingDown;
                for fetcher in &shared.fetchers {
                    fetcher.shutdown();
                }
            }
            FetcherState::ShuttingDown | FetcherState::Complete => {}
        }
    }

    /// Block until the shutdown callback returned and every cursor fetcher is complete.
    pub fn join(&self) {
        let fetchers = {
            let mut shared = self.inner.shared.lock().unwrap();
            while shared.state != FetcherState::Complete {
                shared = self.inner.cond.wait(shared).unwrap();
            }
            shared.fetchers.clone()
        };
        for fetcher in fetchers {
            fetcher.join();
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            FetcherState::Running | FetcherState::ShuttingDown
        )
    }

    pub fn state(&self) -> FetcherState {
        self.inner.shared.lock().unwrap().state
    }

    pub fn get_last_op_time_with_hash_fetched(&self) -> OpTimeWithHash {
        self.inner.shared.lock().unwrap().last_fetched
    }

    /// consecutive restarts since the last successful batch.
    pub fn restarts(&self) -> usize {
        self.inner.shared.lock().unwrap().restarts
    }

    /// the `find` command the cursor would be opened with right now.
    pub fn find_command(&self) -> Document {
        let last_fetched = self.get_last_op_time_with_hash_fetched();
        self.inner
            .find_command(&last_fetched, self.inner.options.initial_find_max_time)
    }
}

impl fmt::Display for OplogFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock().unwrap();
        write!(
            f,
            "OplogFetcher source: {} last fetched: {} state: {} fetched: {} docs, {} bytes",
            self.inner.source,
            shared.last_fetched,
            shared.state,
            shared.fetched_documents,
            shared.fetched_bytes
        )
    }
}

impl OplogFetcherInner {
    fn find_command(&self, last_fetched: &OpTimeWithHash, max_time: Duration) -> Document {
        doc! {
            "find": self.nss.coll(),
            "filter": {"ts": {"$gte": last_fetched.ts}},
            "tailable": true,
            "oplogReplay": true,
            "awaitData": true,
            "maxTimeMS": max_time.as_millis() as i64,
            "batchSize": self.options.batch_size,
        }
    }

    fn make_fetcher(self: &Arc<Self>, last_fetched: OpTimeWithHash, max_time: Duration) -> Fetcher {
        let weak: Weak<OplogFetcherInner> = Arc::downgrade(self);
        Fetcher::new(
            self.executor.clone(),
            self.source.clone(),
            self.nss.db(),
            self.find_command(&last_fetched, max_time),
            move |res| match weak.upgrade() {
                Some(inner) => inner.on_batch(res),
                None => FetchOutcome::Stop,
            },
            RetryPolicy::no_retry(),
        )
    }

    fn on_batch(self: Arc<Self>, res: Result<QueryResponse>) -> FetchOutcome {
        let batch = match res {
            Ok(batch) => batch,
            Err(e) => {
                self.on_fetch_error(e);
                return FetchOutcome::Stop;
            }
        };

        let last_fetched = {
            let shared = self.shared.lock().unwrap();
            if shared.state != FetcherState::Running {
                drop(shared);
                self.finish(Err(SyncError::canceled()));
                return FetchOutcome::Stop;
            }
            shared.last_fetched
        };
        if let Err(e) = self.process_batch(&batch, &last_fetched) {
            self.finish(Err(e));
            return FetchOutcome::Stop;
        }
        if batch.cursor_id == 0 {
            info!(source = %self.source, "Remote oplog cursor closed.");
            self.finish(Ok(()));
            return FetchOutcome::Stop;
        }
        FetchOutcome::GetMore(doc! {
            "batchSize": self.options.batch_size,
            "maxTimeMS": self.options.await_data_timeout.as_millis() as i64,
        })
    }

    fn process_batch(&self, batch: &QueryResponse, last_fetched: &OpTimeWithHash) -> Result<()> {
        let documents = &batch.documents;
        if batch.first {
            check_remote_oplog_start(documents, last_fetched)?;
            debug!(source = %self.source, "Oplog fetcher found its start point.");
        }
        let info = validate_documents(documents, batch.first, last_fetched.ts)?;
        let to_apply = if batch.first {
            &documents[1..]
        } else {
            &documents[..]
        };
        (self.enqueue)(to_apply, &info)?;

        let mut shared = self.shared.lock().unwrap();
        if !info.last_document.is_null() {
            shared.last_fetched = info.last_document;
        }
        shared.restarts = 0;
        shared.fetched_documents += info.network_document_count;
        shared.fetched_bytes += info.network_document_bytes;
        Ok(())
    }

    fn on_fetch_error(self: Arc<Self>, err: SyncError) {
        if err.is_canceled() {
            self.finish(Err(err));
            return;
        }
        let mut shared = self.shared.lock().unwrap();
        if shared.state != FetcherState::Running {
            drop(shared);
            self.finish(Err(SyncError::canceled()));
            return;
        }
        if shared.restarts >= self.options.max_restarts {
            drop(shared);
            warn!(source = %self.source, ?err, "Oplog fetcher ran out of restarts.");
            self.finish(Err(err));
            return;
        }

        shared.restarts += 1;
        warn!(
            source = %self.source,
            ?err,
            restart = shared.restarts,
            max_restarts = self.options.max_restarts,
            last_fetched = %shared.last_fetched,
            "Restarting oplog fetcher."
        );
        let fetcher = self.make_fetcher(shared.last_fetched, self.options.retried_find_max_time);
        match fetcher.schedule() {
            Ok(()) => {
                shared.fetchers.retain(|f| f.is_active());
                shared.fetchers.push(fetcher);
            }
            Err(e) => {
                drop(shared);
                self.finish(Err(e));
            }
        }
    }

    fn finish(&self, status: Result<()>) {
        let (on_shutdown, last_fetched) = {
            let mut shared = self.shared.lock().unwrap();
            match shared.on_shutdown.take() {
                Some(f) => (f, shared.last_fetched),
                None => return,
            }
        };
        match &status {
            Ok(()) => info!(source = %self.source, %last_fetched, "Oplog fetcher finished."),
            Err(e) => info!(source = %self.source, %last_fetched, ?e, "Oplog fetcher stopped."),
        }
        on_shutdown(status, last_fetched);

        let mut shared = self.shared.lock().unwrap();
        shared.state = FetcherState::Complete;
        self.cond.notify_all();
    }
}
