use super::{
    append_time_stats, ClonerState, CollectionCloner, CollectionStats, CompletionFn,
    CLONER_RETRY_ATTEMPTS,
};
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::TaskExecutor;
use crate::fetcher::{FetchOutcome, Fetcher, QueryResponse};
use crate::namespace::Namespace;
use crate::retry_scheduler::RetryPolicy;
use crate::storage::{CollectionOptions, StorageInterface};
use bson::{doc, Document};
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, Weak};
use tracing::{debug, info, warn};

/// Decide from a `listCollections` entry if the collection is cloned.
pub type CollectionPredicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Receive the terminal status of every collection.
pub type CollectionCallback = Arc<dyn Fn(&Namespace, &Result<()>) + Send + Sync>;

/// System collections which hold user data and are cloned like normal collections.
const LEGAL_CLIENT_SYSTEM_COLLECTIONS: [&str; 6] = [
    "system.users",
    "system.roles",
    "system.version",
    "system.js",
    "system.new_users",
    "system.backup_users",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseStats {
    pub db_name: String,
    pub collections: usize,
    pub cloned_collections: usize,
    pub start: Option<DateTime<Local>>,
    pub end: Option<DateTime<Local>>,
    pub collection_stats: Vec<CollectionStats>,
}

impl DatabaseStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {
            "collections": self.collections as i64,
            "clonedCollections": self.cloned_collections as i64,
        };
        append_time_stats(&mut doc, self.start, self.end);
        for stats in &self.collection_stats {
            doc.insert(stats.ns.clone(), stats.to_document());
        }
        doc
    }
}

/// Clone every collection of one database, one collection at a time.
///
/// The terminal status is the first failed collection's status. A failed collection does not
/// stop the next one from being cloned.
#[derive(Clone)]
pub struct DatabaseCloner {
    inner: Arc<DbClonerInner>,
}

struct DbClonerInner {
    executor: TaskExecutor,
    source: String,
    db_name: String,
    predicate: CollectionPredicate,
    collection_work: CollectionCallback,
    storage: Arc<dyn StorageInterface>,
    shared: Mutex<Shared>,
    cond: Condvar,
}

struct Shared {
    state: ClonerState,
    status: Result<()>,
    on_completion: Option<CompletionFn>,
    list_collections_fetcher: Option<Fetcher>,
    collections: Vec<(Namespace, CollectionOptions)>,
    seen: HashSet<String>,
    cloners: Vec<CollectionCloner>,
    start: Option<DateTime<Local>>,
    end: Option<DateTime<Local>>,
}

impl DatabaseCloner {
    pub fn new<F>(
        executor: TaskExecutor,
        source: impl Into<String>,
        db_name: impl Into<String>,
        predicate: CollectionPredicate,
        storage: Arc<dyn StorageInterface>,
        collection_work: CollectionCallback,
        on_completion: F,
    ) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        DatabaseCloner {
            inner: Arc::new(DbClonerInner {
                executor,
                source: source.into(),
                db_name: db_name.into(),
                predicate,
                collection_work,
                storage,
                shared: Mutex::new(Shared {
                    state: ClonerState::PreStart,
                    status: Ok(()),
                    on_completion: Some(Box::new(on_completion)),
                    list_collections_fetcher: None,
                    collections: vec![],
                    seen: HashSet::new(),
                    cloners: vec![],
                    start: None,
                    end: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Default predicate, clone every collection but `system.profile`.
    pub fn default_predicate() -> CollectionPredicate {
        Arc::new(|info: &Document| !matches!(info.get_str("name"), Ok("system.profile")))
    }

    /// Send `listCollections`.
    pub fn startup(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != ClonerState::PreStart {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                format!("database cloner for {} already started", self.inner.db_name),
            ));
        }
        let weak = Arc::downgrade(&self.inner);
        let fetcher = Fetcher::new(
            self.inner.executor.clone(),
            self.inner.source.clone(),
            self.inner.db_name.clone(),
            doc! {"listCollections": 1},
            move |res| {
                DbClonerInner::with_upgraded(&weak, |inner| inner.list_collections_callback(res))
            },
            RetryPolicy::new(CLONER_RETRY_ATTEMPTS),
        );
        if let Err(e) = fetcher.schedule() {
            shared.state = ClonerState::Complete;
            shared.status = Err(e.clone());
            return Err(e);
        }
        shared.state = ClonerState::Running;
        shared.start = Some(Local::now());
        shared.list_collections_fetcher = Some(fetcher);
        info!(db = %self.inner.db_name, source = %self.inner.source, "Database cloner started.");
        Ok(())
    }

    /// Stop listing collections and shut the running collection cloner down, no further
    /// collection is started.
    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            ClonerState::PreStart => {
                shared.state = ClonerState::Complete;
                self.inner.cond.notify_all();
            }
            ClonerState::Running => {
                shared.state = ClonerState::ShuttingDown;
                if let Some(fetcher) = shared.list_collections_fetcher.as_ref() {
                    fetcher.shutdown();
                }
                if let Some(cloner) = shared.cloners.last() {
                    cloner.shutdown();
                }
            }
            ClonerState::ShuttingDown | ClonerState::Complete => {}
        }
    }

    /// Block until the cloner and everything it started is complete.
    pub fn join(&self) {
        let (fetcher, cloners) = {
            let mut shared = self.inner.shared.lock().unwrap();
            while shared.state != ClonerState::Complete {
                shared = self.inner.cond.wait(shared).unwrap();
            }
            (
                shared.list_collections_fetcher.clone(),
                shared.cloners.clone(),
            )
        };
        if let Some(fetcher) = fetcher {
            fetcher.join();
        }
        for cloner in cloners {
            cloner.join();
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

    pub fn db_name(&self) -> &str {
        &self.inner.db_name
    }

    /// namespaces selected for cloning, in cloning order.
    pub fn get_collection_namespaces(&self) -> Vec<Namespace> {
        let shared = self.inner.shared.lock().unwrap();
        shared.collections.iter().map(|(nss, _)| nss.clone()).collect()
    }

    pub fn get_stats(&self) -> DatabaseStats {
        let shared = self.inner.shared.lock().unwrap();
        DatabaseStats {
            db_name: self.inner.db_name.clone(),
            collections: shared.collections.len(),
            cloned_collections: shared
                .cloners
                .iter()
                .filter(|c| c.state() == ClonerState::Complete)
                .count(),
            start: shared.start,
            end: shared.end,
            collection_stats: shared.cloners.iter().map(|c| c.get_stats()).collect(),
        }
    }
}

impl DbClonerInner {
    fn list_collections_callback(self: Arc<Self>, res: Result<QueryResponse>) -> FetchOutcome {
        let batch = match res {
            Ok(batch) => batch,
            Err(e) => {
                self.finish(Err(e.with_context(format!(
                    "listCollections of database {} failed",
                    self.db_name
                ))));
                return FetchOutcome::Stop;
            }
        };

        let mut shared = self.shared.lock().unwrap();
        if shared.state != ClonerState::Running {
            return FetchOutcome::Stop;
        }
        for info in batch.documents {
            let parsed = self.parse_collection_info(&info, &mut shared.seen);
            match parsed {
                Ok(Some(collection)) => shared.collections.push(collection),
                Ok(None) => {}
                Err(e) => {
                    drop(shared);
                    self.finish(Err(e));
                    return FetchOutcome::Stop;
                }
            }
        }
        if batch.cursor_id != 0 {
            return FetchOutcome::get_more();
        }

        if shared.collections.is_empty() {
            drop(shared);
            info!(db = %self.db_name, "No collection to clone.");
            self.finish(Ok(()));
            return FetchOutcome::Stop;
        }
        drop(shared);
        self.start_next_collection();
        FetchOutcome::Stop
    }

    /// `Ok(None)` for collections filtered out.
    fn parse_collection_info(
        &self,
        info: &Document,
        seen: &mut HashSet<String>,
    ) -> Result<Option<(Namespace, CollectionOptions)>> {
        let name = match info.get_str("name") {
            Ok(name) if !name.is_empty() => name,
            Ok(_) => {
                return Err(SyncError::new(
                    ErrorCode::BadValue,
                    format!("collection name cannot be empty: {}", info),
                ))
            }
            Err(_) => {
                return Err(SyncError::new(
                    ErrorCode::FailedToParse,
                    format!("collection info must contain a string `name`: {}", info),
                ))
            }
        };
        let options = info.get_document("options").map_err(|_| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("collection info must contain an `options` document: {}", info),
            )
        })?;

        if !(self.predicate)(info) {
            debug!(db = %self.db_name, %name, "Collection filtered out.");
            return Ok(None);
        }
        let nss = Namespace::new(self.db_name.clone(), name);
        if nss.is_system() && !LEGAL_CLIENT_SYSTEM_COLLECTIONS.contains(&name) {
            debug!(%nss, "Skipping system collection.");
            return Ok(None);
        }
        if !seen.insert(name.to_string()) {
            return Err(SyncError::new(
                ErrorCode::BadValue,
                format!("duplicate collection name found: {}", nss),
            ));
        }
        let options = CollectionOptions::parse(options)?;
        Ok(Some((nss, options)))
    }

    fn start_next_collection(self: Arc<Self>) {
        let mut shared = self.shared.lock().unwrap();
        let index = shared.cloners.len();
        if shared.state != ClonerState::Running || index >= shared.collections.len() {
            let status = if shared.state == ClonerState::Running {
                shared.status.clone()
            } else {
                shared.status.clone().and(Err(SyncError::canceled()))
            };
            drop(shared);
            self.finish(status);
            return;
        }

        let (nss, options) = shared.collections[index].clone();
        let weak = Arc::downgrade(&self);
        let done_nss = nss.clone();
        let cloner = CollectionCloner::new(
            self.executor.clone(),
            self.source.clone(),
            nss,
            options,
            self.storage.clone(),
            move |status| {
                if let Some(inner) = weak.upgrade() {
                    inner.collection_done(&done_nss, status);
                }
            },
        );
        shared.cloners.push(cloner.clone());
        if let Err(e) = cloner.startup() {
            let nss = cloner.get_source_namespace().clone();
            drop(shared);
            self.collection_done(&nss, Err(e));
        }
    }

    fn collection_done(self: Arc<Self>, nss: &Namespace, status: Result<()>) {
        (self.collection_work)(nss, &status);
        {
            let mut shared = self.shared.lock().unwrap();
            if let Err(e) = &status {
                if !e.is_canceled() {
                    warn!(%nss, ?e, "Failed to clone collection.");
                }
                if shared.status.is_ok() {
                    shared.status = Err(e.clone());
                }
            }
        }
        self.start_next_collection();
    }

    fn with_upgraded<F>(weak: &Weak<DbClonerInner>, f: F) -> FetchOutcome
    where
        F: FnOnce(Arc<DbClonerInner>) -> FetchOutcome,
    {
        match weak.upgrade() {
            Some(inner) => f(inner),
            None => FetchOutcome::Stop,
        }
    }

    fn finish(&self, status: Result<()>) {
        let on_completion = {
            let mut shared = self.shared.lock().unwrap();
            let on_completion = match shared.on_completion.take() {
                Some(f) => f,
                None => return,
            };
            shared.status = status.clone();
            shared.end = Some(Local::now());
            on_completion
        };
        match &status {
            Ok(()) => info!(db = %self.db_name, "Database clone finished."),
            Err(e) => warn!(db = %self.db_name, ?e, "Database clone failed."),
        }
        on_completion(status);

        let mut shared = self.shared.lock().unwrap();
        shared.state = ClonerState::Complete;
        self.cond.notify_all();
    }
}
