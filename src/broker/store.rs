//! In-memory tracking of submissions until acknowledged or expired.
//!
//! Each entry publishes its latest view on a `watch` channel, so polling reads
//! a snapshot and waiting for a result is a `wait_for` on the receiver. Entries
//! leave the store when acknowledged or when the retention janitor finds them
//! terminal for longer than the retention window.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

use super::submission::{ExecutionResult, Submission, SubmissionId, SubmissionStatus};
use crate::error::ConsistencyFault;

/// Lookup failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Submission {0} not found")]
    NotFound(SubmissionId),

    #[error("Submission {id} is still {status}")]
    NotTerminal {
        id: SubmissionId,
        status: SubmissionStatus,
    },
}

/// What a poller sees. `result` is `None` until the submission is terminal.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    pub submission: Submission,
    pub result: Option<ExecutionResult>,
}

/// One tracked submission.
pub struct Tracked {
    view: watch::Sender<SubmissionView>,
    cancel: watch::Sender<bool>,
    finished: OnceLock<Instant>,
}

impl Tracked {
    fn new(submission: Submission) -> Self {
        let (view, _) = watch::channel(SubmissionView {
            submission,
            result: None,
        });
        let (cancel, _) = watch::channel(false);
        Self {
            view,
            cancel,
            finished: OnceLock::new(),
        }
    }

    /// Publishes a non-terminal status change.
    pub fn update(&self, submission: &Submission) {
        self.view.send_modify(|view| view.submission = submission.clone());
    }

    /// Publishes the terminal submission and its result.
    ///
    /// Only the first call succeeds.
    pub fn complete(
        &self,
        submission: &Submission,
        result: ExecutionResult,
    ) -> Result<(), ConsistencyFault> {
        let mut delivered = false;
        self.view.send_if_modified(|view| {
            if view.result.is_some() {
                return false;
            }
            view.submission = submission.clone();
            view.result = Some(result);
            delivered = true;
            true
        });

        if !delivered {
            return Err(ConsistencyFault::ResultAlreadyDelivered {
                submission_id: submission.id.to_string(),
            });
        }
        let _ = self.finished.set(Instant::now());
        Ok(())
    }

    /// Receiver that flips to `true` when cancellation is requested.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }

    pub fn status(&self) -> SubmissionStatus {
        self.view.borrow().submission.status
    }

    pub fn snapshot(&self) -> SubmissionView {
        self.view.borrow().clone()
    }

    fn expired(&self, retention: Duration) -> bool {
        self.finished
            .get()
            .is_some_and(|at| at.elapsed() >= retention)
    }
}

/// Tracking store shared by the broker and the HTTP layer.
#[derive(Default)]
pub struct SubmissionStore {
    entries: RwLock<HashMap<SubmissionId, Arc<Tracked>>>,
}

impl SubmissionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SubmissionId, Arc<Tracked>>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SubmissionId, Arc<Tracked>>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts tracking a submission.
    pub fn insert(&self, submission: Submission) -> Arc<Tracked> {
        let id = submission.id;
        let tracked = Arc::new(Tracked::new(submission));
        self.write().insert(id, Arc::clone(&tracked));
        tracked
    }

    fn tracked(&self, id: &SubmissionId) -> Result<Arc<Tracked>, StoreError> {
        self.read()
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound(*id))
    }

    pub fn get(&self, id: &SubmissionId) -> Result<SubmissionView, StoreError> {
        self.tracked(id).map(|t| t.snapshot())
    }

    /// Waits until the submission is terminal and returns its result.
    pub async fn wait_result(&self, id: &SubmissionId) -> Result<ExecutionResult, StoreError> {
        let mut rx = self.tracked(id)?.view.subscribe();
        let view = rx
            .wait_for(|view| view.result.is_some())
            .await
            .map_err(|_| StoreError::NotFound(*id))?;
        view.result.clone().ok_or(StoreError::NotFound(*id))
    }

    /// Requests cancellation and returns the status at the time of the
    /// request. Terminal submissions are left alone.
    pub fn request_cancel(&self, id: &SubmissionId) -> Result<SubmissionStatus, StoreError> {
        let tracked = self.tracked(id)?;
        let status = tracked.status();
        if !status.is_terminal() {
            tracked.cancel.send_replace(true);
        }
        Ok(status)
    }

    /// Evicts a terminal submission, returning its result.
    pub fn acknowledge(&self, id: &SubmissionId) -> Result<ExecutionResult, StoreError> {
        let mut entries = self.write();
        let tracked = entries.get(id).ok_or(StoreError::NotFound(*id))?;

        let view = tracked.snapshot();
        match view.result {
            Some(result) => {
                entries.remove(id);
                Ok(result)
            }
            None => Err(StoreError::NotTerminal {
                id: *id,
                status: view.submission.status,
            }),
        }
    }

    /// Evicts terminal submissions older than `retention`. Returns how many.
    pub fn evict_expired(&self, retention: Duration) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, tracked| !tracked.expired(retention));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
