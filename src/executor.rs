//! Task executor shared by every initial sync component.
//!
//! Network commands and storage tasks are both dispatched on one rayon thread pool. Nothing in
//! this crate owns a dedicated thread, except the control thread which drives
//! [DataReplicator::do_initial_sync](crate::DataReplicator::do_initial_sync).

use crate::bson_helper;
use crate::error::{ErrorCode, Result, SyncError};
use bson::Document;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// The oplog fetcher may hold one worker while it waits for buffer space.
pub const MIN_WORKER_THREADS: usize = 2;

/// A command to run against database `db_name` of host `target`.
#[derive(Debug, Clone)]
pub struct RemoteCommandRequest {
    pub target: String,
    pub db_name: String,
    pub cmd: Document,
    pub timeout: Option<Duration>,
}

impl RemoteCommandRequest {
    pub fn new(target: impl Into<String>, db_name: impl Into<String>, cmd: Document) -> Self {
        RemoteCommandRequest {
            target: target.into(),
            db_name: db_name.into(),
            cmd,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// name of the command, e.g. `find` or `getMore`.
    pub fn command_name(&self) -> &str {
        bson_helper::command_name(&self.cmd)
    }
}

impl fmt::Display for RemoteCommandRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}.$cmd at {}", self.cmd, self.db_name, self.target)
    }
}

/// Raw reply of a remote command, `ok: 0` replies are not turned into errors at this level.
#[derive(Debug, Clone)]
pub struct RemoteCommandResponse {
    pub data: Document,
    pub elapsed: Duration,
}

/// The wire transport.
///
/// Implementations block the calling worker until the reply is available. Transport failures
/// are returned as errors, server side failures may be returned either way.
pub trait RemoteCommandRunner: Send + Sync {
    fn run_command(&self, request: &RemoteCommandRequest) -> Result<Document>;
}

/// Handle of a scheduled task, used for cancellation.
#[derive(Debug, Clone)]
pub struct CallbackHandle {
    id: u64,
    canceled: Arc<AtomicBool>,
}

impl CallbackHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Shared pool of worker threads.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<ExecutorInner>,
}

struct ExecutorInner {
    pool: ThreadPool,
    runner: Arc<dyn RemoteCommandRunner>,
    next_id: AtomicU64,
    in_shutdown: AtomicBool,
}

impl TaskExecutor {
    pub fn num_threads(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// create an executor with `num_threads` workers which sends commands through `runner`.
    ///
    /// Less than [MIN_WORKER_THREADS] workers are raised to that minimum.
    pub fn new(num_threads: usize, runner: Arc<dyn RemoteCommandRunner>) -> Result<TaskExecutor> {
        if num_threads < MIN_WORKER_THREADS {
            warn!(num_threads, min = MIN_WORKER_THREADS, "Too few worker threads, using the minimum.");
        }
        let num_threads = num_threads.max(MIN_WORKER_THREADS);
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("initial-sync-worker-{}", idx))
            .build()
            .map_err(|e| {
                SyncError::new(
                    ErrorCode::InternalError,
                    format!("failed to build worker pool: {}", e),
                )
            })?;
        Ok(TaskExecutor {
            inner: Arc::new(ExecutorInner {
                pool,
                runner,
                next_id: AtomicU64::new(1),
                in_shutdown: AtomicBool::new(false),
            }),
        })
    }

    fn make_handle(&self) -> Result<CallbackHandle> {
        if self.is_shutting_down() {
            return Err(SyncError::new(
                ErrorCode::ShutdownInProgress,
                "task executor is shutting down",
            ));
        }
        Ok(CallbackHandle {
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            canceled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Run `work` on the pool.
    ///
    /// `work` receives `Err(CallbackCanceled)` instead of `Ok(())` when the handle was canceled
    /// before a worker picked it up.
    pub fn schedule_work<F>(&self, work: F) -> Result<CallbackHandle>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let handle = self.make_handle()?;
        let task_handle = handle.clone();
        self.inner.pool.spawn(move || {
            if task_handle.is_canceled() {
                work(Err(SyncError::canceled()));
            } else {
                work(Ok(()));
            }
        });
        Ok(handle)
    }

    /// Send `request` on a worker and deliver the reply to `on_completion`.
    ///
    /// A handle canceled before the reply arrives delivers `Err(CallbackCanceled)`, whatever the
    /// remote side answered.
    pub fn schedule_remote_command<F>(
        &self,
        request: RemoteCommandRequest,
        on_completion: F,
    ) -> Result<CallbackHandle>
    where
        F: FnOnce(Result<RemoteCommandResponse>) + Send + 'static,
    {
        let handle = self.make_handle()?;
        let task_handle = handle.clone();
        let runner = self.inner.runner.clone();
        self.inner.pool.spawn(move || {
            if task_handle.is_canceled() {
                on_completion(Err(SyncError::canceled()));
                return;
            }
            trace!(request = %request, "Sending remote command.");
            let start = Instant::now();
            let result = runner.run_command(&request);
            if task_handle.is_canceled() {
                on_completion(Err(SyncError::canceled()));
                return;
            }
            on_completion(result.map(|data| RemoteCommandResponse {
                data,
                elapsed: start.elapsed(),
            }));
        });
        Ok(handle)
    }

    /// Cancel the task behind `handle`, a no-op for completed tasks.
    pub fn cancel(&self, handle: &CallbackHandle) {
        handle.canceled.store(true, Ordering::SeqCst);
    }

    /// Reject every later scheduling request, already scheduled tasks still run.
    pub fn shutdown(&self) {
        self.inner.in_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.in_shutdown.load(Ordering::SeqCst)
    }
}

/// One shot event, used by the control thread to wait for asynchronous completion.
#[derive(Debug, Default)]
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Event::default()
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap()
    }

    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cond.wait(signaled).unwrap();
        }
    }

    /// Wait at most `timeout`, returns true when the event is signaled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let signaled = self.signaled.lock().unwrap();
        let (signaled, _) = self
            .cond
            .wait_timeout_while(signaled, timeout, |signaled| !*signaled)
            .unwrap();
        *signaled
    }
}
