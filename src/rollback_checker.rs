//! Detect a rollback of the sync source through its rollback id.

use crate::bson_helper::{self, get_integer};
use crate::error::{ErrorCode, Result, SyncError};
use crate::executor::{RemoteCommandRequest, TaskExecutor};
use crate::retry_scheduler::{RemoteCommandRetryScheduler, RetryPolicy};
use crate::ADMIN_DB_NAME;
use bson::{doc, Document};
use crossbeam::channel;
use std::sync::Mutex;
use tracing::{info, warn};

/// Remember the rollback id (`replSetGetRBID`) of a sync source and compare later values with it.
///
/// Both calls block the calling thread, [shutdown](Self::shutdown) interrupts them.
pub struct RollbackChecker {
    executor: TaskExecutor,
    source: String,
    policy: RetryPolicy,
    state: Mutex<CheckerState>,
}

#[derive(Default)]
struct CheckerState {
    base_rbid: Option<i64>,
    last_rbid: Option<i64>,
    in_shutdown: bool,
    active: Option<RemoteCommandRetryScheduler>,
}

impl RollbackChecker {
    pub fn new(executor: TaskExecutor, source: impl Into<String>, policy: RetryPolicy) -> Self {
        RollbackChecker {
            executor,
            source: source.into(),
            policy,
            state: Mutex::new(CheckerState::default()),
        }
    }

    /// Record the current rollback id as baseline.
    pub fn reset_sync(&self) -> Result<i64> {
        let rbid = self.get_rbid()?;
        let mut state = self.state.lock().unwrap();
        state.base_rbid = Some(rbid);
        state.last_rbid = Some(rbid);
        info!(source = %self.source, rbid, "Recorded rollback id of sync source.");
        Ok(rbid)
    }

    /// true when the sync source went through a rollback since [reset_sync](Self::reset_sync).
    pub fn has_had_rollback(&self) -> Result<bool> {
        let base = self.state.lock().unwrap().base_rbid.ok_or_else(|| {
            SyncError::new(
                ErrorCode::IllegalOperation,
                "rollback checker has no baseline, call reset_sync first",
            )
        })?;
        let rbid = self.get_rbid()?;
        self.state.lock().unwrap().last_rbid = Some(rbid);
        if rbid != base {
            warn!(source = %self.source, base, rbid, "Sync source rolled back.");
        }
        Ok(rbid != base)
    }

    pub fn base_rbid(&self) -> Option<i64> {
        self.state.lock().unwrap().base_rbid
    }

    pub fn last_rbid(&self) -> Option<i64> {
        self.state.lock().unwrap().last_rbid
    }

    /// Cancel the outstanding request and reject later ones.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_shutdown = true;
        if let Some(scheduler) = state.active.as_ref() {
            scheduler.shutdown();
        }
    }

    fn get_rbid(&self) -> Result<i64> {
        let (sender, receiver) = channel::bounded(1);
        let scheduler = RemoteCommandRetryScheduler::new(
            self.executor.clone(),
            RemoteCommandRequest::new(
                self.source.clone(),
                ADMIN_DB_NAME,
                doc! {"replSetGetRBID": 1},
            ),
            self.policy,
            move |res| {
                let _ = sender.send(res);
            },
        );
        {
            let mut state = self.state.lock().unwrap();
            if state.in_shutdown {
                return Err(SyncError::canceled());
            }
            scheduler.startup()?;
            state.active = Some(scheduler.clone());
        }

        let res = receiver.recv().map_err(|_| SyncError::canceled());
        scheduler.join();
        self.state.lock().unwrap().active = None;
        parse_rbid(&res??.data)
    }
}

fn parse_rbid(reply: &Document) -> Result<i64> {
    bson_helper::check_command_response(reply)?;
    get_integer(reply, "rbid").map_err(|_| {
        SyncError::new(
            ErrorCode::FailedToParse,
            format!("replSetGetRBID reply without an integer `rbid`: {}", reply),
        )
    })
}
