//! Drive a remote cursor through `find` and `getMore` batches.

use crate::bson_helper::{self, split_namespace};
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{
    CallbackHandle, RemoteCommandRequest, RemoteCommandResponse, TaskExecutor,
};
use crate::retry_scheduler::{RemoteCommandRetryScheduler, RetryPolicy};
use bson::{doc, Bson, Document};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, trace};

/// One batch of a cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    /// 0 when the cursor is exhausted.
    pub cursor_id: i64,
    pub ns: String,
    pub documents: Vec<Document>,
    pub elapsed: Duration,
    /// true for the batch answering the first command.
    pub first: bool,
}

impl QueryResponse {
    /// Parse `{cursor: {id, ns, firstBatch | nextBatch}, ok: 1}`.
    pub fn parse(reply: &Document, first: bool, elapsed: Duration) -> Result<QueryResponse> {
        bson_helper::check_command_response(reply)?;
        let cursor = reply.get_document("cursor").map_err(|_| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("cursor response must contain a `cursor` document: {}", reply),
            )
        })?;
        let cursor_id = bson_helper::get_integer(cursor, "id").map_err(|_| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("cursor response must contain an integer `cursor.id`: {}", reply),
            )
        })?;
        let ns = cursor.get_str("ns").map_err(|_| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("cursor response must contain a string `cursor.ns`: {}", reply),
            )
        })?;
        if split_namespace(ns).is_none() {
            return Err(SyncError::new(
                ErrorCode::BadValue,
                format!("cursor response has an invalid namespace `{}`", ns),
            ));
        }
        let batch_field = if first { "firstBatch" } else { "nextBatch" };
        let batch = cursor.get_array(batch_field).map_err(|_| {
            SyncError::new(
                ErrorCode::FailedToParse,
                format!("cursor response must contain `cursor.{}` array: {}", batch_field, reply),
            )
        })?;

        let mut documents = Vec::with_capacity(batch.len());
        for item in batch {
            match item {
                Bson::Document(d) => documents.push(d.clone()),
                other => {
                    return Err(SyncError::new(
                        ErrorCode::FailedToParse,
                        format!("found a non-document in `cursor.{}`: {}", batch_field, other),
                    ))
                }
            }
        }
        Ok(QueryResponse {
            cursor_id,
            ns: ns.to_string(),
            documents,
            elapsed,
            first,
        })
    }
}

/// What the fetcher does after a batch was handed to the callback.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Stop fetching, an open cursor is killed.
    Stop,
    /// Send `getMore`, the document's fields are added to the command.
    GetMore(Document),
}

impl FetchOutcome {
    /// `getMore` without extra fields.
    pub fn get_more() -> Self {
        FetchOutcome::GetMore(Document::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetcherState {
    PreStart,
    Running,
    ShuttingDown,
    Complete,
}

impl fmt::Display for FetcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub type FetcherCallback = Box<dyn FnMut(Result<QueryResponse>) -> FetchOutcome + Send>;

/// Batched cursor fetcher.
///
/// Each batch (or the error ending the cursor) is handed to the callback in cursor order. Only
/// the first command is retried with the configured [RetryPolicy]. After an error the callback
/// is never called again. A fetcher shut down while running always ends with one final
/// `CallbackCanceled` callback, so the owner can rely on seeing a terminal call.
///
/// The callback must not call back into its own fetcher.
#[derive(Clone)]
pub struct Fetcher {
    inner: Arc<FetcherInner>,
}

struct FetcherInner {
    executor: TaskExecutor,
    source: String,
    db_name: String,
    cmd: Document,
    policy: RetryPolicy,
    timeout: Option<Duration>,
    callback: Mutex<FetcherCallback>,
    shared: Mutex<FetcherShared>,
    cond: Condvar,
}

struct FetcherShared {
    state: FetcherState,
    status: Result<()>,
    first_command: Option<RemoteCommandRetryScheduler>,
    get_more: Option<CallbackHandle>,
    batches: usize,
}

impl Fetcher {
    pub fn new<F>(
        executor: TaskExecutor,
        source: impl Into<String>,
        db_name: impl Into<String>,
        cmd: Document,
        callback: F,
        policy: RetryPolicy,
    ) -> Fetcher
    where
        F: FnMut(Result<QueryResponse>) -> FetchOutcome + Send + 'static,
    {
        Fetcher::build(
            executor,
            source.into(),
            db_name.into(),
            cmd,
            Box::new(callback),
            policy,
            None,
        )
    }

    /// Same as [new](Self::new), with a network timeout applied to every command.
    pub fn with_timeout<F>(
        executor: TaskExecutor,
        source: impl Into<String>,
        db_name: impl Into<String>,
        cmd: Document,
        callback: F,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Fetcher
    where
        F: FnMut(Result<QueryResponse>) -> FetchOutcome + Send + 'static,
    {
        Fetcher::build(
            executor,
            source.into(),
            db_name.into(),
            cmd,
            Box::new(callback),
            policy,
            Some(timeout),
        )
    }

    fn build(
        executor: TaskExecutor,
        source: String,
        db_name: String,
        cmd: Document,
        callback: FetcherCallback,
        policy: RetryPolicy,
        timeout: Option<Duration>,
    ) -> Fetcher {
        Fetcher {
            inner: Arc::new(FetcherInner {
                executor,
                source,
                db_name,
                cmd,
                policy,
                timeout,
                callback: Mutex::new(callback),
                shared: Mutex::new(FetcherShared {
                    state: FetcherState::PreStart,
                    status: Ok(()),
                    first_command: None,
                    get_more: None,
                    batches: 0,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Send the first command.
    pub fn schedule(&self) -> Result<()> {
        let mut shared = self.inner.shared.lock().unwrap();
        if shared.state != FetcherState::PreStart {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                format!("fetcher can only be scheduled once, state: {}", shared.state),
            ));
        }

        let weak = Arc::downgrade(&self.inner);
        let request = RemoteCommandRequest::new(
            self.inner.source.clone(),
            self.inner.db_name.clone(),
            self.inner.cmd.clone(),
        )
        .with_timeout(self.inner.timeout);
        let scheduler = RemoteCommandRetryScheduler::new(
            self.inner.executor.clone(),
            request,
            self.inner.policy,
            move |res| FetcherInner::on_response(&weak, res, true),
        );
        if let Err(e) = scheduler.startup() {
            shared.state = FetcherState::Complete;
            shared.status = Err(e.clone());
            self.inner.cond.notify_all();
            return Err(e);
        }
        shared.state = FetcherState::Running;
        shared.first_command = Some(scheduler);
        debug!(source = %self.inner.source, cmd = %self.inner.cmd, "Fetcher scheduled.");
        Ok(())
    }

    /// Cancel the outstanding command, idempotent.
    pub fn shutdown(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        match shared.state {
            FetcherState::PreStart => {
                shared.state = FetcherState::Complete;
                self.inner.cond.notify_all();
            }
            FetcherState::Running => {
                shared.state = FetcherState::ShuttingDown;
                if let Some(scheduler) = shared.first_command.as_ref() {
                    scheduler.shutdown();
                }
                if let Some(handle) = shared.get_more.as_ref() {
                    self.inner.executor.cancel(handle);
                }
            }
            FetcherState::ShuttingDown | FetcherState::Complete => {}
        }
    }

    /// Block until the fetcher is complete and its last callback returned.
    pub fn join(&self) {
        let mut shared = self.inner.shared.lock().unwrap();
        while shared.state != FetcherState::Complete {
            shared = self.inner.cond.wait(shared).unwrap();
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

    /// Terminal status, `Ok` until the fetcher failed.
    pub fn status(&self) -> Result<()> {
        self.inner.shared.lock().unwrap().status.clone()
    }

    /// number of batches handed to the callback.
    pub fn batches(&self) -> usize {
        self.inner.shared.lock().unwrap().batches
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub fn command(&self) -> &Document {
        &self.inner.cmd
    }
}

impl fmt::Display for Fetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Fetcher source: {} database: {} query: {} active: {}",
            self.inner.source,
            self.inner.db_name,
            self.inner.cmd,
            self.is_active()
        )
    }
}

impl FetcherInner {
    fn on_response(weak: &Weak<FetcherInner>, res: Result<RemoteCommandResponse>, first: bool) {
        let inner = match weak.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        let mut parsed = res.and_then(|r| QueryResponse::parse(&r.data, first, r.elapsed));

        {
            let mut shared = inner.shared.lock().unwrap();
            if first {
                shared.first_command = None;
            }
            shared.get_more = None;
            if shared.state == FetcherState::ShuttingDown {
                if let Ok(batch) = &parsed {
                    inner.kill_cursor(batch.cursor_id, &batch.ns);
                }
                parsed = Err(SyncError::canceled());
            } else if parsed.is_ok() {
                shared.batches += 1;
            }
        }

        let (cursor_id, ns, status) = match &parsed {
            Ok(batch) => (batch.cursor_id, batch.ns.clone(), Ok(())),
            Err(e) => (0, String::new(), Err(e.clone())),
        };
        let outcome = inner.invoke_callback(parsed);
        if let Err(e) = status {
            inner.finish(Err(e));
            return;
        }

        let mut shared = inner.shared.lock().unwrap();
        if shared.state == FetcherState::ShuttingDown {
            drop(shared);
            inner.kill_cursor(cursor_id, &ns);
            inner.invoke_callback(Err(SyncError::canceled()));
            inner.finish(Err(SyncError::canceled()));
            return;
        }

        match outcome {
            FetchOutcome::Stop => {
                drop(shared);
                inner.kill_cursor(cursor_id, &ns);
                inner.finish(Ok(()));
            }
            FetchOutcome::GetMore(_) if cursor_id == 0 => {
                drop(shared);
                let err = SyncError::new(
                    ErrorCode::IllegalOperation,
                    format!("getMore requested on an exhausted cursor of {}", ns),
                );
                inner.invoke_callback(Err(err.clone()));
                inner.finish(Err(err));
            }
            FetchOutcome::GetMore(extra) => {
                let coll = split_namespace(&ns).map(|(_, c)| c).unwrap_or_default();
                let mut cmd = doc! {"getMore": cursor_id, "collection": coll};
                for (key, value) in extra {
                    cmd.insert(key, value);
                }
                trace!(%cmd, "Scheduling getMore.");
                let request =
                    RemoteCommandRequest::new(inner.source.clone(), inner.db_name.clone(), cmd)
                        .with_timeout(inner.timeout);
                let next = Arc::downgrade(&inner);
                let scheduled = inner.executor.schedule_remote_command(request, move |res| {
                    FetcherInner::on_response(&next, res, false)
                });
                match scheduled {
                    Ok(handle) => shared.get_more = Some(handle),
                    Err(e) => {
                        drop(shared);
                        inner.kill_cursor(cursor_id, &ns);
                        inner.invoke_callback(Err(e.clone()));
                        inner.finish(Err(e));
                    }
                }
            }
        }
    }

    fn invoke_callback(&self, res: Result<QueryResponse>) -> FetchOutcome {
        let mut callback = self.callback.lock().unwrap();
        (callback)(res)
    }

    /// Best effort, the reply is ignored.
    fn kill_cursor(&self, cursor_id: i64, ns: &str) {
        if cursor_id == 0 {
            return;
        }
        let coll = match split_namespace(ns) {
            Some((_, coll)) => coll,
            None => return,
        };
        let request = RemoteCommandRequest::new(
            self.source.clone(),
            self.db_name.clone(),
            doc! {"killCursors": coll, "cursors": [cursor_id]},
        );
        let _ = self.executor.schedule_remote_command(request, |_| {});
    }

    fn finish(&self, status: Result<()>) {
        let mut shared = self.shared.lock().unwrap();
        if let Err(e) = &status {
            if !e.is_canceled() {
                debug!(source = %self.source, cmd = %self.cmd, ?e, "Fetcher finished with error.");
            }
        }
        shared.state = FetcherState::Complete;
        shared.status = status;
        shared.first_command = None;
        shared.get_more = None;
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_batch() {
        let reply = doc! {
            "cursor": {"id": 5_i64, "ns": "db.coll", "firstBatch": [{"_id": 1}, {"_id": 2}]},
            "ok": 1
        };
        let batch = QueryResponse::parse(&reply, true, Duration::from_millis(1)).unwrap();
        assert_eq!(batch.cursor_id, 5);
        assert_eq!(batch.ns, "db.coll");
        assert_eq!(batch.documents, vec![doc! {"_id": 1}, doc! {"_id": 2}]);
        assert!(batch.first);
    }

    #[test]
    fn test_parse_next_batch_requires_next_batch_field() {
        let reply = doc! {
            "cursor": {"id": 0_i64, "ns": "db.coll", "firstBatch": []},
            "ok": 1
        };
        let err = QueryResponse::parse(&reply, false, Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedToParse);
    }

    #[test]
    fn test_parse_rejects_bad_shapes() {
        let err = QueryResponse::parse(&doc! {"ok": 1}, true, Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedToParse);

        let reply = doc! {"cursor": {"id": 0_i64, "ns": "nodot", "firstBatch": []}, "ok": 1};
        let err = QueryResponse::parse(&reply, true, Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), ErrorCode::BadValue);

        let reply = doc! {"cursor": {"id": 0_i64, "ns": "db.c", "firstBatch": [1]}, "ok": 1};
        let err = QueryResponse::parse(&reply, true, Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedToParse);

        let reply = doc! {"ok": 0, "code": 26, "errmsg": "no such collection"};
        let err = QueryResponse::parse(&reply, true, Duration::ZERO).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NamespaceNotFound);
    }
}
