//! Request handlers and the error-to-status mapping.

use std::convert::Infallible;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;

use super::AppState;
use crate::broker::{
    ExecutionResult, Rejection, StoreError, SubmissionId, SubmissionStatus, SubmissionView,
    SubmitRequest,
};
use crate::error::AdmissionError;
use crate::health::HealthReport;

/// Errors returned by the HTTP surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Invalid submission id '{0}'")]
    BadId(String),
}

/// JSON error body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<SubmissionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SubmissionStatus>,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Rejected(r) => match r.error {
                AdmissionError::CapacityExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
                AdmissionError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                _ => StatusCode::UNPROCESSABLE_ENTITY,
            },
            ApiError::Store(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Store(StoreError::NotTerminal { .. }) => StatusCode::CONFLICT,
            ApiError::BadId(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> ErrorBody {
        let (kind, submission_id, status) = match self {
            ApiError::Rejected(r) => (
                r.error.kind(),
                Some(r.submission_id),
                Some(SubmissionStatus::Rejected),
            ),
            ApiError::Store(StoreError::NotFound(id)) => ("not_found", Some(*id), None),
            ApiError::Store(StoreError::NotTerminal { id, status }) => {
                ("not_terminal", Some(*id), Some(*status))
            }
            ApiError::BadId(_) => ("bad_request", None, None),
        };
        ErrorBody {
            error: self.to_string(),
            kind: kind.to_string(),
            submission_id,
            status,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

fn parse_id(raw: &str) -> Result<SubmissionId, ApiError> {
    raw.parse().map_err(|_| ApiError::BadId(raw.to_string()))
}

/// Body of an accepted submission or a cancellation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitResponse {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
}

/// Body of a poll. Result fields appear only once the status is terminal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PollResponse {
    pub submission_id: SubmissionId,
    pub status: SubmissionStatus,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    pub payload_sha256: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub result: Option<ResultFields>,
}

/// The result part of a poll response.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultFields {
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stdout_truncated: bool,
    pub stderr: String,
    pub stderr_truncated: bool,
    pub runtime_ms: Option<u64>,
    pub memory_mb_peak: Option<u64>,
    pub failure_reason: Option<String>,
}

impl From<ExecutionResult> for ResultFields {
    fn from(r: ExecutionResult) -> Self {
        Self {
            exit_code: r.exit_code,
            stdout: r.stdout,
            stdout_truncated: r.stdout_truncated,
            stderr: r.stderr,
            stderr_truncated: r.stderr_truncated,
            runtime_ms: r.runtime_ms,
            memory_mb_peak: r.memory_mb_peak,
            failure_reason: r.failure_reason,
        }
    }
}

impl From<SubmissionView> for PollResponse {
    fn from(view: SubmissionView) -> Self {
        let sub = view.submission;
        Self {
            submission_id: sub.id,
            status: sub.status,
            language: sub.language.to_string(),
            task_id: sub.task_id,
            payload_sha256: sub.payload_sha256,
            created_at: sub.created_at,
            started_at: sub.started_at,
            finished_at: sub.finished_at,
            result: view.result.map(ResultFields::from),
        }
    }
}

pub async fn submit(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let submission_id = state.broker.submit(request)?;
    let status = state
        .broker
        .poll(&submission_id)
        .map(|view| view.submission.status)
        .unwrap_or(SubmissionStatus::Provisioning);

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            submission_id,
            status,
        }),
    ))
}

pub async fn poll(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PollResponse>, ApiError> {
    let id = parse_id(&id)?;
    let view = state.broker.poll(&id)?;
    Ok(Json(view.into()))
}

/// 202 when a cancellation was requested, 200 when the submission had
/// already finished and nothing changed.
pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let id = parse_id(&id)?;
    let status = state.broker.cancel(&id)?;
    let code = if status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        code,
        Json(SubmitResponse {
            submission_id: id,
            status,
        }),
    ))
}

pub async fn acknowledge(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let id = parse_id(&id)?;
    Ok(Json(state.broker.acknowledge(&id)?))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = HealthReport::new(
        state.health.status(),
        state.broker.governor_snapshot(),
        state.broker.images().report(),
    );
    let code = if report.health.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

pub async fn results_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = BroadcastStream::new(state.broker.subscribe_results()).filter_map(|item| {
        let result = match item {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Result stream subscriber lagged");
                return None;
            }
        };
        Event::default()
            .event("result")
            .id(result.submission_id.to_string())
            .json_data(&result)
            .ok()
            .map(Ok)
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
