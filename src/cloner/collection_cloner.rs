use super::{append_time_stats, ClonerState, CompletionFn, CLONER_RETRY_ATTEMPTS};
use crate::bson_helper::{self, get_integer};
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{CallbackHandle, RemoteCommandRequest, RemoteCommandResponse, TaskExecutor};
use crate::fetcher::{FetchOutcome, Fetcher, QueryResponse};
use crate::namespace::Namespace;
use crate::retry_scheduler::{RemoteCommandRetryScheduler, RetryPolicy};
use crate::storage::{CollectionBulkLoader, CollectionOptions, StorageInterface};
use bson::{doc, Document};
use chrono::{DateTime, Local};
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::{debug, info, warn};

const ID_INDEX_NAME: &str = "_id_";

/// Progress of one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionStats {
    pub ns: String,
    pub documents_to_copy: u64,
    pub documents_copied: u64,
    pub indexes: usize,
    pub fetched_batches: usize,
    pub start: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
}

impl CollectionStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "ns": self.ns.clone(),
            "documentsToCopy": self.documents_to_copy as i64,
            "documentsCopied": self.documents_copied as i64,
            "indexes": self.indexes as i64,
            "fetchedBatches": self.fetched_batches as i64,
        };
        append_time_stats(&mut doc, self.start, self.end);
        doc
    }
}

/// Copy one collection: `count`, `listIndexes`, bulk loader creation, `find`, commit.
#[derive(Clone)]
pub struct CollectionCloner {
    inner: Arc<ClonerInner>,
}

struct ClonerInner {
    executor: TaskExecutor,
    source: String,
    nss: Namespace,
    options: CollectionOptions,
    storage: Arc<dyn StorageInterface>,
    loader: Mutex<Option<Box<dyn CollectionBulkLoader>>>,
    shared: Mutex<Shared>,
    cond: Condvar,
}

struct Shared {
    state: ClonerState,
    status: Result<()>,
    on_completion: Option<CompletionFn>,
    count_scheduler: Option<RemoteCommandRetryScheduler>,
    list_indexes_fetcher: Option<Fetcher>,
    find_fetcher: Option<Fetcher>,
    db_work: Option<CallbackHandle>,
    id_index_spec: Option<Document>,
    index_specs: Vec<Document>,
    stats: CollectionStats,
}

impl CollectionCloner {
    pub fn new<F>(
        executor: TaskExecutor,
        source: impl Into<String>,
        nss: Namespace,
        options: CollectionOptions,
        storage: Arc<dyn StorageInterface>,
        on_completion: F,
    ) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let stats = CollectionStats {
            ns: nss.to_string(),
            ..Default::default()
        };
        CollectionCloner {
            inner: Arc::new(ClonerInner {
                executor,
                source: source.into(),
                nss,
                options,
                storage,
                loader: Mutex::new(None),
                shared: Mutex::new(Shared {
                    state: ClonerState::PreStart,
                    status: Ok(()),
                    on_completion: Some(Box::new(on_completion)),
                    count_scheduler: None,
                    list_indexes_fetcher: None,
                    find_fetcher: None,
                    db_work: None,
                    id_index_spec: None,
                    index_specs: vec![],
                    stats,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Send `count`, the remaining stages chain from its reply.
    pub fn startup(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != ClonerState::PreStart {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                format!("collection cloner for {} already started", self.inner.nss),
            ));
        }

        let weak = Arc::downgrade(&self.inner);
        let scheduler = RemoteCommandRetryScheduler::new(
            self.inner.executor.clone(),
            RemoteCommandRequest::new(
                self.inner.source.clone(),
                self.inner.nss.db(),
                doc! {"count": self.inner.nss.coll()},
            ),
            RetryPolicy::new(CLONER_RETRY_ATTEMPTS),
            move |res| {
                if let Some(inner) = weak.upgrade() {
                    inner.count_callback(res);
                }
            },
        );
        if let Err(e) = scheduler.startup() {
            shared.state = ClonerState::Complete;
            shared.status = Err(e.clone());
            return Err(e);
        }
        shared.state = ClonerState::Running;
        shared.stats.start = Some(Local::now());
        shared.count_scheduler = Some(scheduler);
        info!(ns = %self.inner.nss, source = %self.inner.source, "Collection cloner started.");
        Ok(())
    }

    /// Cancel every outstanding stage, the completion callback still fires while running.
    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            ClonerState::PreStart => {
                shared.state = ClonerState::Complete;
                self.inner.cond.notify_all();
            }
            ClonerState::Running => {
                shared.state = ClonerState::ShuttingDown;
                if let Some(scheduler) = shared.count_scheduler.as_ref() {
                    scheduler.shutdown();
                }
                if let Some(fetcher) = shared.list_indexes_fetcher.as_ref() {
                    fetcher.shutdown();
                }
                if let Some(fetcher) = shared.find_fetcher.as_ref() {
                    fetcher.shutdown();
                }
                if let Some(handle) = shared.db_work.as_ref() {
                    self.inner.executor.cancel(handle);
                }
            }
            ClonerState::ShuttingDown | ClonerState::Complete => {}
        }
    }

    /// Block until the cloner and every fetcher it started are complete.
    ///
    /// Never call it from the completion callback.
    pub fn join(&self) {
        let (scheduler, fetchers) = {
            let mut shared = self.inner.shared.lock().unwrap();
            while shared.state != ClonerState::Complete {
                shared = self.inner.cond.wait(shared).unwrap();
            }
            let fetchers: Vec<Fetcher> = shared
                .list_indexes_fetcher
                .iter()
                .chain(shared.find_fetcher.iter())
                .cloned()
                .collect();
            (shared.count_scheduler.clone(), fetchers)
        };
        if let Some(scheduler) = scheduler {
            scheduler.join();
        }
        for fetcher in fetchers {
            fetcher.join();
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state(),
            ClonerState::Running | ClonerState::ShuttingDown
        )
    }

    pub fn state(&self) -> ClonerState {
        self.inner.shared.lock().unwrap().state
    }

    pub fn status(&self) -> Result<()> {
        self.inner.shared.lock().unwrap().status.clone()
    }

    pub fn get_stats(&self) -> CollectionStats {
        self.inner.shared.lock().unwrap().stats.clone()
    }

    pub fn get_source_namespace(&self) -> &Namespace {
        &self.inner.nss
    }
}

impl ClonerInner {
    fn count_callback(self: Arc<Self>, res: Result<RemoteCommandResponse>) {
        let count = match res.and_then(|r| parse_count(&r.data)) {
            Ok(count) => count,
            Err(e) if e.code() == ErrorCode::NamespaceNotFound => {
                debug!(ns = %self.nss, "Collection vanished before count, assuming it is empty.");
                0
            }
            Err(e) => {
                self.finish(Err(e.with_context(format!("count of {} failed", self.nss))));
                return;
            }
        };

        let mut shared = self.shared.lock().unwrap();
        shared.count_scheduler = None;
        if shared.state != ClonerState::Running {
            drop(shared);
            self.finish(Err(SyncError::canceled()));
            return;
        }
        shared.stats.documents_to_copy = count;

        let weak = Arc::downgrade(&self);
        let fetcher = Fetcher::new(
            self.executor.clone(),
            self.source.clone(),
            self.nss.db(),
            doc! {"listIndexes": self.nss.coll()},
            move |res| ClonerInner::with_upgraded(&weak, |inner| inner.list_indexes_callback(res)),
            RetryPolicy::new(CLONER_RETRY_ATTEMPTS),
        );
        match fetcher.schedule() {
            Ok(()) => shared.list_indexes_fetcher = Some(fetcher),
            Err(e) => {
                drop(shared);
                self.finish(Err(e));
            }
        }
    }

    fn list_indexes_callback(self: Arc<Self>, res: Result<QueryResponse>) -> FetchOutcome {
        let batch = match res {
            Ok(batch) => batch,
            Err(e) if e.code() == ErrorCode::NamespaceNotFound => {
                debug!(ns = %self.nss, "Collection not found on sync source, creating it empty.");
                let inner = self.clone();
                self.schedule_db_work(move |status| inner.create_empty_collection(status));
                return FetchOutcome::Stop;
            }
            Err(e) => {
                self.finish(Err(e.with_context(format!("listIndexes of {} failed", self.nss))));
                return FetchOutcome::Stop;
            }
        };

        let mut shared = self.shared.lock().unwrap();
        if shared.state != ClonerState::Running {
            return FetchOutcome::Stop;
        }
        for mut spec in batch.documents {
            if spec.contains_key("ns") {
                spec.insert("ns", self.nss.to_string());
            }
            if matches!(spec.get_str("name"), Ok(ID_INDEX_NAME)) {
                shared.id_index_spec = Some(spec);
            } else {
                shared.index_specs.push(spec);
            }
        }
        if batch.cursor_id != 0 {
            return FetchOutcome::get_more();
        }

        shared.stats.indexes =
            shared.index_specs.len() + usize::from(shared.id_index_spec.is_some());
        drop(shared);
        let inner = self.clone();
        self.schedule_db_work(move |status| inner.create_collection_for_bulk_loading(status));
        FetchOutcome::Stop
    }

    fn create_empty_collection(self: Arc<Self>, status: Result<()>) {
        let status = status
            .and_then(|_| self.check_running())
            .and_then(|_| self.storage.create_collection(&self.nss, &self.options));
        self.finish(status);
    }

    fn create_collection_for_bulk_loading(self: Arc<Self>, status: Result<()>) {
        if let Err(e) = status.and_then(|_| self.check_running()) {
            self.finish(Err(e));
            return;
        }
        let (id_index_spec, index_specs) = {
            let mut shared = self.shared.lock().unwrap();
            shared.db_work = None;
            (
                shared.id_index_spec.take(),
                std::mem::take(&mut shared.index_specs),
            )
        };
        if !self.options.auto_index_id() && id_index_spec.is_some() {
            warn!(ns = %self.nss, "Collection has autoIndexId: false, deferring creation of the _id index.");
        }

        let loader = self.storage.create_collection_for_bulk_loading(
            &self.nss,
            &self.options,
            id_index_spec,
            index_specs,
        );
        match loader {
            Ok(loader) => *self.loader.lock().unwrap() = Some(loader),
            Err(e) => {
                self.finish(Err(e));
                return;
            }
        }

        let mut shared = self.shared.lock().unwrap();
        if shared.state != ClonerState::Running {
            drop(shared);
            self.finish(Err(SyncError::canceled()));
            return;
        }
        let weak = Arc::downgrade(&self);
        let fetcher = Fetcher::new(
            self.executor.clone(),
            self.source.clone(),
            self.nss.db(),
            doc! {"find": self.nss.coll(), "noCursorTimeout": true},
            move |res| ClonerInner::with_upgraded(&weak, |inner| inner.find_callback(res)),
            RetryPolicy::new(CLONER_RETRY_ATTEMPTS),
        );
        match fetcher.schedule() {
            Ok(()) => shared.find_fetcher = Some(fetcher),
            Err(e) => {
                drop(shared);
                self.finish(Err(e));
            }
        }
    }

    fn find_callback(self: Arc<Self>, res: Result<QueryResponse>) -> FetchOutcome {
        let batch = match res {
            Ok(batch) => batch,
            Err(e) => {
                self.finish(Err(e.with_context(format!("find on {} failed", self.nss))));
                return FetchOutcome::Stop;
            }
        };
        if self.check_running().is_err() {
            return FetchOutcome::Stop;
        }

        let inserted = {
            let mut loader = self.loader.lock().unwrap();
            match loader.as_mut() {
                Some(loader) => loader.insert_documents(&batch.documents),
                None => Err(SyncError::new(
                    ErrorCode::InternalError,
                    format!("no bulk loader for {}", self.nss),
                )),
            }
        };
        if let Err(e) = inserted {
            self.finish(Err(e));
            return FetchOutcome::Stop;
        }
        {
            let mut shared = self.shared.lock().unwrap();
            shared.stats.fetched_batches += 1;
            shared.stats.documents_copied += batch.documents.len() as u64;
        }

        if batch.cursor_id != 0 {
            return FetchOutcome::get_more();
        }
        let committed = match self.loader.lock().unwrap().as_mut() {
            Some(loader) => loader.commit(),
            None => Err(SyncError::new(
                ErrorCode::InternalError,
                format!("no bulk loader for {}", self.nss),
            )),
        };
        self.finish(committed);
        FetchOutcome::Stop
    }

    fn schedule_db_work<F>(&self, work: F)
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != ClonerState::Running {
            drop(shared);
            self.finish(Err(SyncError::canceled()));
            return;
        }
        match self.executor.schedule_work(work) {
            Ok(handle) => shared.db_work = Some(handle),
            Err(e) => {
                drop(shared);
                self.finish(Err(e));
            }
        }
    }

    fn check_running(&self) -> Result<()> {
        if self.shared.lock().unwrap().state == ClonerState::Running {
            Ok(())
        } else {
            Err(SyncError::canceled())
        }
    }

    fn with_upgraded<F>(weak: &Weak<ClonerInner>, f: F) -> FetchOutcome
    where
        F: FnOnce(Arc<ClonerInner>) -> FetchOutcome,
    {
        match weak.upgrade() {
            Some(inner) => f(inner),
            None => FetchOutcome::Stop,
        }
    }

    /// Deliver the terminal status once, later calls are ignored.
    fn finish(&self, status: Result<()>) {
        let (on_completion, stats) = {
            let mut shared = self.shared.lock().unwrap();
            let on_completion = match shared.on_completion.take() {
                Some(f) => f,
                None => return,
            };
            shared.status = status.clone();
            shared.stats.end = Some(Local::now());
            shared.db_work = None;
            (on_completion, shared.stats.clone())
        };
        self.loader.lock().unwrap().take();

        match &status {
            Ok(()) => info!(ns = %self.nss, ?stats, "Collection clone finished."),
            Err(e) if e.is_canceled() => debug!(ns = %self.nss, "Collection clone canceled."),
            Err(e) => warn!(ns = %self.nss, ?e, "Collection clone failed."),
        }
        on_completion(status);

        let mut shared = self.shared.lock().unwrap();
        shared.state = ClonerState::Complete;
        self.cond.notify_all();
    }
}

fn parse_count(reply: &Document) -> Result<u64> {
    bson_helper::check_command_response(reply)?;
    let count = get_integer(reply, "n").map_err(|_| {
        SyncError::new(
            ErrorCode::FailedToParse,
            format!("count reply without an integer `n`: {}", reply),
        )
    })?;
    Ok(count.max(0) as u64)
}
