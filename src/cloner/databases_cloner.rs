use super::{ClonerState, CompletionFn, DatabaseCloner, DatabaseStats, CLONER_RETRY_ATTEMPTS};
use crate::bson_helper;
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{RemoteCommandRequest, RemoteCommandResponse, TaskExecutor};
use crate::namespace::Namespace;
use crate::retry_scheduler::{RemoteCommandRetryScheduler, RetryPolicy};
use crate::storage::StorageInterface;
use crate::{ADMIN_DB_NAME, OPLOG_DB};
use bson::{doc, Bson, Document};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info, warn};

/// Decide from a database name if the database is cloned.
pub type DatabasePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabasesStats {
    pub databases_cloned: usize,
    pub database_stats: Vec<DatabaseStats>,
}

impl DatabasesStats {
    pub fn to_document(&self) -> Document {
        let mut doc = doc! {"databasesCloned": self.databases_cloned as i64};
        for stats in &self.database_stats {
            doc.insert(stats.db_name.clone(), stats.to_document());
        }
        doc
    }
}

/// Clone every database of the sync source, one database at a time, `admin` first.
#[derive(Clone)]
pub struct DatabasesCloner {
    inner: Arc<DbsClonerInner>,
}

struct DbsClonerInner {
    executor: TaskExecutor,
    source: String,
    predicate: DatabasePredicate,
    storage: Arc<dyn StorageInterface>,
    shared: Mutex<Shared>,
    cond: Condvar,
}

struct Shared {
    state: ClonerState,
    status: Result<()>,
    on_completion: Option<CompletionFn>,
    list_databases: Option<RemoteCommandRetryScheduler>,
    db_names: Vec<String>,
    cloners: Vec<DatabaseCloner>,
}

impl DatabasesCloner {
    pub fn new<F>(
        executor: TaskExecutor,
        source: impl Into<String>,
        predicate: DatabasePredicate,
        storage: Arc<dyn StorageInterface>,
        on_completion: F,
    ) -> Self
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        DatabasesCloner {
            inner: Arc::new(DbsClonerInner {
                executor,
                source: source.into(),
                predicate,
                storage,
                shared: Mutex::new(Shared {
                    state: ClonerState::PreStart,
                    status: Ok(()),
                    on_completion: Some(Box::new(on_completion)),
                    list_databases: None,
                    db_names: vec![],
                    cloners: vec![],
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Clone every database but `local`.
    pub fn default_predicate() -> DatabasePredicate {
        Arc::new(|db_name: &str| db_name != OPLOG_DB)
    }

    /// Send `listDatabases`.
    pub fn startup(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != ClonerState::PreStart {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                "databases cloner already started",
            ));
        }
        let weak = Arc::downgrade(&self.inner);
        let scheduler = RemoteCommandRetryScheduler::new(
            self.inner.executor.clone(),
            RemoteCommandRequest::new(
                self.inner.source.clone(),
                ADMIN_DB_NAME,
                doc! {"listDatabases": 1},
            ),
            RetryPolicy::new(CLONER_RETRY_ATTEMPTS),
            move |res| {
                if let Some(inner) = weak.upgrade() {
                    inner.list_databases_callback(res);
                }
            },
        );
        if let Err(e) = scheduler.startup() {
            shared.state = ClonerState::Complete;
            shared.status = Err(e.clone());
            return Err(e);
        }
        shared.state = ClonerState::Running;
        shared.list_databases = Some(scheduler);
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            ClonerState::PreStart => {
                shared.state = ClonerState::Complete;
                self.inner.cond.notify_all();
            }
            ClonerState::Running => {
                shared.state = ClonerState::ShuttingDown;
                if let Some(scheduler) = shared.list_databases.as_ref() {
                    scheduler.shutdown();
                }
                if let Some(cloner) = shared.cloners.last() {
                    cloner.shutdown();
                }
            }
            ClonerState::ShuttingDown | ClonerState::Complete => {}
        }
    }

    pub fn join(&self) {
        let (scheduler, cloners) = {
            let mut shared = self.inner.shared.lock().unwrap();
            while shared.state != ClonerState::Complete {
                shared = self.inner.cond.wait(shared).unwrap();
            }
            (shared.list_databases.clone(), shared.cloners.clone())
        };
        if let Some(scheduler) = scheduler {
            scheduler.join();
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

    /// databases selected for cloning, in cloning order.
    pub fn get_database_names(&self) -> Vec<String> {
        self.inner.shared.lock().unwrap().db_names.clone()
    }

    pub fn get_stats(&self) -> DatabasesStats {
        let shared = self.inner.shared.lock().unwrap();
        DatabasesStats {
            databases_cloned: shared
                .cloners
                .iter()
                .filter(|c| c.state() == ClonerState::Complete)
                .count(),
            database_stats: shared.cloners.iter().map(|c| c.get_stats()).collect(),
        }
    }
}

impl DbsClonerInner {
    fn list_databases_callback(self: Arc<Self>, res: Result<RemoteCommandResponse>) {
        let names = match res.and_then(|r| parse_database_names(&r.data)) {
            Ok(names) => names,
            Err(e) => {
                self.finish(Err(e.with_context("listDatabases failed")));
                return;
            }
        };

        let mut db_names: Vec<String> =
            names.into_iter().filter(|name| (self.predicate)(name.as_str())).collect();
        // admin goes first.
        if let Some(pos) = db_names.iter().position(|name| name == ADMIN_DB_NAME) {
            let admin = db_names.remove(pos);
            db_names.insert(0, admin);
        }
        info!(source = %self.source, databases = ?db_names, "Databases to clone.");

        {
            let mut shared = self.shared.lock().unwrap();
            shared.list_databases = None;
            shared.db_names = db_names;
        }
        self.start_next_database();
    }

    fn start_next_database(self: Arc<Self>) {
        let mut shared = self.shared.lock().unwrap();
        let index = shared.cloners.len();
        if shared.state != ClonerState::Running || index >= shared.db_names.len() {
            let status = if shared.state == ClonerState::Running {
                shared.status.clone()
            } else {
                shared.status.clone().and(Err(SyncError::canceled()))
            };
            drop(shared);
            self.finish(status);
            return;
        }

        let db_name = shared.db_names[index].clone();
        let weak = Arc::downgrade(&self);
        let cloner = DatabaseCloner::new(
            self.executor.clone(),
            self.source.clone(),
            db_name.clone(),
            DatabaseCloner::default_predicate(),
            self.storage.clone(),
            Arc::new(|nss: &Namespace, status: &Result<()>| match status {
                Ok(()) => debug!(%nss, "Collection cloned."),
                Err(e) => debug!(%nss, ?e, "Collection clone failed."),
            }),
            move |status| {
                if let Some(inner) = weak.upgrade() {
                    inner.database_done(status);
                }
            },
        );
        shared.cloners.push(cloner.clone());
        if let Err(e) = cloner.startup() {
            drop(shared);
            warn!(db = %db_name, ?e, "Failed to start database cloner.");
            self.database_done(Err(e));
        }
    }

    fn database_done(self: Arc<Self>, status: Result<()>) {
        if let Err(e) = status {
            let mut shared = self.shared.lock().unwrap();
            if shared.status.is_ok() {
                shared.status = Err(e);
            }
        }
        self.start_next_database();
    }

    fn finish(&self, status: Result<()>) {
        let on_completion = {
            let mut shared = self.shared.lock().unwrap();
            let on_completion = match shared.on_completion.take() {
                Some(f) => f,
                None => return,
            };
            shared.status = status.clone();
            on_completion
        };
        match &status {
            Ok(()) => info!(source = %self.source, "All databases cloned."),
            Err(e) => warn!(source = %self.source, ?e, "Cloning databases failed."),
        }
        on_completion(status);

        let mut shared = self.shared.lock().unwrap();
        shared.state = ClonerState::Complete;
        self.cond.notify_all();
    }
}

/// Names out of a `{databases: [{name, ...}], ok: 1}` reply.
fn parse_database_names(reply: &Document) -> Result<Vec<String>> {
    bson_helper::check_command_response(reply)?;
    let databases = reply.get_array("databases").map_err(|_| {
        SyncError::new(
            ErrorCode::FailedToParse,
            format!("listDatabases reply must contain a `databases` array: {}", reply),
        )
    })?;
    databases
        .iter()
        .map(|db| match db {
            Bson::Document(d) => d.get_str("name").map(|n| n.to_string()).map_err(|_| {
                SyncError::new(
                    ErrorCode::FailedToParse,
                    format!("listDatabases entry without a string `name`: {}", d),
                )
            }),
            other => Err(SyncError::new(
                ErrorCode::FailedToParse,
                format!("listDatabases entry must be a document: {}", other),
            )),
        })
        .collect()
}
