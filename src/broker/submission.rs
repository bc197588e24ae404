//! Submission model and its state machine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ConsistencyFault;
use crate::execution::{CapturedOutput, Language};

/// Opaque submission identifier, generated on intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubmissionId(Uuid);

impl SubmissionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubmissionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for SubmissionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a submission.
///
/// ```text
/// QUEUED -> PROVISIONING -> RUNNING -> COLLECTING -> DONE
///                                  \-> TIMEOUT | MEMORY_EXCEEDED
/// QUEUED -> REJECTED
/// any non-terminal -> FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Queued,
    Provisioning,
    Running,
    Collecting,
    Done,
    Failed,
    Timeout,
    MemoryExceeded,
    Rejected,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Done
                | SubmissionStatus::Failed
                | SubmissionStatus::Timeout
                | SubmissionStatus::MemoryExceeded
                | SubmissionStatus::Rejected
        )
    }

    /// Whether moving from `self` to `next` follows the state machine.
    pub fn can_transition_to(&self, next: SubmissionStatus) -> bool {
        use SubmissionStatus::*;
        match (self, next) {
            (Queued, Provisioning | Rejected | Failed) => true,
            (Provisioning, Running | Failed) => true,
            (Running, Collecting | Timeout | MemoryExceeded | Failed) => true,
            (Collecting, Done | Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Queued => "QUEUED",
            SubmissionStatus::Provisioning => "PROVISIONING",
            SubmissionStatus::Running => "RUNNING",
            SubmissionStatus::Collecting => "COLLECTING",
            SubmissionStatus::Done => "DONE",
            SubmissionStatus::Failed => "FAILED",
            SubmissionStatus::Timeout => "TIMEOUT",
            SubmissionStatus::MemoryExceeded => "MEMORY_EXCEEDED",
            SubmissionStatus::Rejected => "REJECTED",
        }
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource constraints of one submission, after defaults were applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub time_limit_sec: u64,
    pub memory_mb: u64,
    pub network_mode: String,
}

/// Terminal outcome of a submission. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    /// `None` if the process never ran to an exit.
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    /// Set if and only if the container started.
    pub runtime_ms: Option<u64>,
    pub memory_mb_peak: Option<u64>,
    /// Diagnostic, present only when `status` is not `DONE`.
    pub failure_reason: Option<String>,
}

/// A request to execute code, owned by the broker for its whole lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub language: Language,
    pub task_id: Option<String>,
    pub constraints: Constraints,
    /// Hex SHA-256 of the payload.
    pub payload_sha256: String,
    pub payload_bytes: usize,
    pub status: SubmissionStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Submission {
    /// A freshly queued submission.
    pub fn new(
        id: SubmissionId,
        language: Language,
        payload: &str,
        task_id: Option<String>,
        constraints: Constraints,
    ) -> Self {
        Self {
            id,
            language,
            task_id,
            constraints,
            payload_sha256: payload_digest(payload),
            payload_bytes: payload.len(),
            status: SubmissionStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Moves to `next`, stamping `started_at` on RUNNING and `finished_at`
    /// on any terminal status.
    pub fn transition(&mut self, next: SubmissionStatus) -> Result<(), ConsistencyFault> {
        if !self.status.can_transition_to(next) {
            return Err(ConsistencyFault::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == SubmissionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }
}

/// Hex-encoded SHA-256 of a payload.
pub fn payload_digest(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Builder for the terminal result of one submission.
#[derive(Debug, Clone)]
pub struct ResultBuilder {
    result: ExecutionResult,
}

impl ResultBuilder {
    pub fn new(submission_id: SubmissionId, status: SubmissionStatus) -> Self {
        Self {
            result: ExecutionResult {
                submission_id,
                status,
                exit_code: None,
                stdout: String::new(),
                stdout_truncated: false,
                stderr: String::new(),
                stderr_truncated: false,
                runtime_ms: None,
                memory_mb_peak: None,
                failure_reason: None,
            },
        }
    }

    pub fn exit_code(mut self, code: Option<i64>) -> Self {
        self.result.exit_code = code;
        self
    }

    pub fn output(mut self, output: CapturedOutput) -> Self {
        self.result.stdout = output.stdout;
        self.result.stdout_truncated = output.stdout_truncated;
        self.result.stderr = output.stderr;
        self.result.stderr_truncated = output.stderr_truncated;
        self
    }

    pub fn runtime_ms(mut self, ms: u64) -> Self {
        self.result.runtime_ms = Some(ms);
        self
    }

    pub fn memory_mb_peak(mut self, mb: u64) -> Self {
        self.result.memory_mb_peak = Some(mb);
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.result.failure_reason = Some(reason.into());
        self
    }

    /// Finishes the result. A failure reason on `DONE` is dropped.
    pub fn build(mut self) -> ExecutionResult {
        if self.result.status == SubmissionStatus::Done {
            self.result.failure_reason = None;
        }
        self.result
    }
}
