//! HTTP client for the runner API, as used by a Judge.
//!
//! `wait_result` polls with backoff (500 ms growing ×1.5 up to 2 s), gives up
//! `time_limit_sec + 5 s` after it started, cancels the submission when it
//! gives up, and acknowledges the result once it has it.

use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::api::{ErrorBody, PollResponse, SubmitResponse};
use crate::broker::{ExecutionResult, SubmissionId, SubmissionStatus, SubmitRequest};
use crate::config::RunnerConfig;
use crate::health::HealthStatus;
use crate::policy::BackoffPolicy;

/// Slack added to the time limit before a waiting client gives up.
pub const WAIT_GRACE: Duration = Duration::from_secs(5);

/// Errors raised by [`RunnerClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Submission rejected ({kind}): {message}")]
    Rejected {
        kind: String,
        message: String,
        submission_id: Option<SubmissionId>,
    },

    #[error("Runner returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse runner response: {0}")]
    Parse(String),

    #[error("No result for submission {submission_id} after {waited:?}")]
    WaitTimeout {
        submission_id: SubmissionId,
        waited: Duration,
    },
}

/// Health body as seen by a client. Unknown fields are ignored.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteHealth {
    pub status: String,
    #[serde(flatten)]
    pub health: HealthStatus,
}

/// Client for one runner service.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    base_url: String,
    http_client: Client,
    poll_backoff: BackoffPolicy,
}

impl RunnerClient {
    /// Creates a client for the service at `base_url` (e.g. `http://localhost:8080`).
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ClientError::Request(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http_client,
            poll_backoff: BackoffPolicy::new(Duration::from_millis(500), Duration::from_secs(2))
                .with_factor(1.5),
        })
    }

    /// Overrides the polling schedule.
    pub fn with_poll_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.poll_backoff = backoff;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Reads the health endpoint. An unready service still answers (503).
    pub async fn health(&self) -> Result<RemoteHealth, ClientError> {
        let response = self
            .http_client
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;

        if response.status() == StatusCode::SERVICE_UNAVAILABLE {
            return parse(response).await;
        }
        decode(response).await
    }

    pub async fn submit(&self, request: &SubmitRequest) -> Result<SubmitResponse, ClientError> {
        let response = self
            .http_client
            .post(self.url("/submissions"))
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        decode(response).await
    }

    pub async fn poll(&self, id: &SubmissionId) -> Result<PollResponse, ClientError> {
        let response = self
            .http_client
            .get(self.url(&format!("/submissions/{id}")))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        decode(response).await
    }

    pub async fn cancel(&self, id: &SubmissionId) -> Result<SubmitResponse, ClientError> {
        let response = self
            .http_client
            .delete(self.url(&format!("/submissions/{id}")))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        decode(response).await
    }

    pub async fn acknowledge(&self, id: &SubmissionId) -> Result<ExecutionResult, ClientError> {
        let response = self
            .http_client
            .post(self.url(&format!("/submissions/{id}/ack")))
            .send()
            .await
            .map_err(|e| ClientError::Request(e.to_string()))?;
        decode(response).await
    }

    /// Polls until the submission is terminal, then acknowledges it.
    ///
    /// Gives up after `time_limit_sec` plus [`WAIT_GRACE`], cancelling the
    /// submission on the way out.
    pub async fn wait_result(
        &self,
        id: &SubmissionId,
        time_limit_sec: u64,
    ) -> Result<ExecutionResult, ClientError> {
        let started = Instant::now();
        let budget = Duration::from_secs(time_limit_sec) + WAIT_GRACE;
        let mut attempt = 0;

        loop {
            let polled = self.poll(id).await?;
            if polled.status.is_terminal() {
                return Ok(self.finish(id, polled).await);
            }

            let waited = started.elapsed();
            if waited >= budget {
                if let Err(e) = self.cancel(id).await {
                    warn!(submission_id = %id, error = %e, "Cancel after wait timeout failed");
                }
                return Err(ClientError::WaitTimeout {
                    submission_id: *id,
                    waited,
                });
            }

            let delay = self.poll_backoff.next(attempt).min(budget - waited);
            debug!(
                submission_id = %id,
                status = %polled.status,
                delay_ms = delay.as_millis() as u64,
                "Result not ready"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Acknowledges and returns the result. Falls back to the polled fields if
    /// the acknowledgement fails, e.g. because another client acknowledged first.
    async fn finish(&self, id: &SubmissionId, polled: PollResponse) -> ExecutionResult {
        match self.acknowledge(id).await {
            Ok(result) => result,
            Err(e) => {
                warn!(submission_id = %id, error = %e, "Acknowledge failed");
                result_from_poll(polled)
            }
        }
    }

    /// Submits and waits for the result in one call.
    ///
    /// Without an explicit time limit the wait is bounded by the default
    /// maximum, since the service's own default is not known here.
    pub async fn run(&self, request: &SubmitRequest) -> Result<ExecutionResult, ClientError> {
        let accepted = self.submit(request).await?;
        let time_limit = request
            .constraints
            .time_limit_sec
            .or(request.time_limit_sec)
            .unwrap_or(RunnerConfig::default().max_time_limit_secs);
        self.wait_result(&accepted.submission_id, time_limit).await
    }
}

fn result_from_poll(polled: PollResponse) -> ExecutionResult {
    let fields = polled.result.unwrap_or_default();
    ExecutionResult {
        submission_id: polled.submission_id,
        status: polled.status,
        exit_code: fields.exit_code,
        stdout: fields.stdout,
        stdout_truncated: fields.stdout_truncated,
        stderr: fields.stderr,
        stderr_truncated: fields.stderr_truncated,
        runtime_ms: fields.runtime_ms,
        memory_mb_peak: fields.memory_mb_peak,
        failure_reason: fields.failure_reason,
    }
}

/// Decodes a success body, or turns an error body into a [`ClientError`].
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return parse(response).await;
    }

    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to read error response".to_string());

    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) if body.status == Some(SubmissionStatus::Rejected) => Err(ClientError::Rejected {
            kind: body.kind,
            message: body.error,
            submission_id: body.submission_id,
        }),
        Ok(body) => Err(ClientError::Api {
            status: status.as_u16(),
            message: body.error,
        }),
        Err(_) => Err(ClientError::Api {
            status: status.as_u16(),
            message: text,
        }),
    }
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    response
        .json()
        .await
        .map_err(|e| ClientError::Parse(e.to_string()))
}
