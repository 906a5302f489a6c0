//! Retry first commands of a cursor on transient failures.

use crate::bson_helper;
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{
    CallbackHandle, RemoteCommandRequest, RemoteCommandResponse, TaskExecutor,
};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, warn};

/// How many times a command is sent before its error is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: usize,
}

impl RetryPolicy {
    /// Retry transient errors until `max_attempts` commands were sent.
    pub fn new(max_attempts: usize) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Send the command once.
    pub fn no_retry() -> Self {
        RetryPolicy::new(1)
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Decide if a command which failed with `err` after `attempts` tries should be sent again.
    pub fn should_retry(&self, attempts: usize, err: &SyncError) -> bool {
        attempts < self.max_attempts && err.code().is_retriable()
    }
}

type CompletionFn = Box<dyn FnOnce(Result<RemoteCommandResponse>) + Send>;

/// Send one command and keep resending it according to a [RetryPolicy].
///
/// Exactly one completion callback is delivered per successful [startup](Self::startup). Both
/// transport errors and `{ok: 0}` replies carrying a transient code are retried, the last reply
/// is passed through unchanged otherwise.
#[derive(Clone)]
pub struct RemoteCommandRetryScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    executor: TaskExecutor,
    request: RemoteCommandRequest,
    policy: RetryPolicy,
    on_completion: Mutex<Option<CompletionFn>>,
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

#[derive(Default)]
struct SchedulerState {
    active: bool,
    started: bool,
    in_shutdown: bool,
    attempts: usize,
    handle: Option<CallbackHandle>,
}

impl RemoteCommandRetryScheduler {
    pub fn new<F>(
        executor: TaskExecutor,
        request: RemoteCommandRequest,
        policy: RetryPolicy,
        on_completion: F,
    ) -> Self
    where
        F: FnOnce(Result<RemoteCommandResponse>) + Send + 'static,
    {
        RemoteCommandRetryScheduler {
            inner: Arc::new(SchedulerInner {
                executor,
                request,
                policy,
                on_completion: Mutex::new(Some(Box::new(on_completion))),
                state: Mutex::new(SchedulerState::default()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Send the first attempt.
    pub fn startup(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if state.in_shutdown {
            return Err(SyncError::new(
                ErrorCode::ShutdownInProgress,
                "retry scheduler shut down before startup",
            ));
        }
        if state.started {
            return Err(SyncError::new(
                ErrorCode::IllegalOperation,
                "retry scheduler already started",
            ));
        }
        let handle = SchedulerInner::schedule_attempt(&self.inner)?;
        state.started = true;
        state.active = true;
        state.handle = Some(handle);
        Ok(())
    }

    /// Cancel the outstanding attempt, the completion callback receives `CallbackCanceled`.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.in_shutdown = true;
        if let Some(handle) = state.handle.as_ref() {
            self.inner.executor.cancel(handle);
        }
    }

    /// Block until the completion callback returned.
    pub fn join(&self) {
        let mut state = self.inner.state.lock().unwrap();
        while state.active {
            state = self.inner.cond.wait(state).unwrap();
        }
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().unwrap().active
    }

    /// number of commands sent so far.
    pub fn attempts(&self) -> usize {
        self.inner.state.lock().unwrap().attempts
    }
}

impl SchedulerInner {
    fn schedule_attempt(inner: &Arc<SchedulerInner>) -> Result<CallbackHandle> {
        let owner = inner.clone();
        inner
            .executor
            .schedule_remote_command(inner.request.clone(), move |res| owner.on_response(res))
    }

    fn on_response(self: Arc<Self>, res: Result<RemoteCommandResponse>) {
        let mut state = self.state.lock().unwrap();
        state.attempts += 1;
        state.handle = None;
        if state.in_shutdown {
            drop(state);
            self.finish(Err(SyncError::canceled()));
            return;
        }

        let failure = match &res {
            Ok(response) => bson_helper::check_command_response(&response.data).err(),
            Err(e) => Some(e.clone()),
        };
        let retry = match &failure {
            Some(err) => self.policy.should_retry(state.attempts, err),
            None => false,
        };
        if !retry {
            drop(state);
            self.finish(res);
            return;
        }

        if let Some(err) = failure {
            warn!(
                request = %self.request,
                attempt = state.attempts,
                max_attempts = self.policy.max_attempts(),
                ?err,
                "Remote command failed, retrying."
            );
        }
        match SchedulerInner::schedule_attempt(&self) {
            Ok(handle) => state.handle = Some(handle),
            Err(e) => {
                drop(state);
                self.finish(Err(e));
            }
        }
    }

    fn finish(&self, res: Result<RemoteCommandResponse>) {
        let on_completion = self.on_completion.lock().unwrap().take();
        if let Some(on_completion) = on_completion {
            debug!(request = %self.request, ok = res.is_ok(), "Remote command finished.");
            on_completion(res);
        }
        let mut state = self.state.lock().unwrap();
        state.active = false;
        self.cond.notify_all();
    }
}
