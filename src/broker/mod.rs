//! Execution broker.
//!
//! Accepts submissions, decides admission synchronously and then drives each
//! admitted submission through its state machine on its own task:
//!
//! ```text
//! PROVISIONING  wait for image, create container (retried), start it
//! RUNNING       arm watchdog, follow output, wait for exit | watchdog | cancel
//! COLLECTING    drain output within the collect timeout
//! terminal      record result, emit it, remove container, release admission
//! ```
//!
//! Every admitted submission ends in exactly one terminal status and produces
//! exactly one result. Infrastructure problems surface only as `FAILED`.

pub mod channel;
pub mod store;
pub mod submission;

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::error::{AdmissionError, InfrastructureFault, RuntimeError};
use crate::execution::{
    CapturedOutput, ContainerSpec, ExecutionLimits, Language, RuntimeClient, LABEL_SUBMISSION_ID,
    LABEL_TASK_ID, PAYLOAD_ENV,
};
use crate::governor::{AdmissionToken, GovernorLimits, GovernorSnapshot, ResourceGovernor};
use crate::images::ImageCache;
use crate::metrics::MetricsCollector;
use crate::watchdog::{WatchTarget, Watchdog, WatchdogSignal};

pub use channel::ResultChannel;
pub use store::{StoreError, SubmissionStore, SubmissionView, Tracked};
pub use submission::{
    Constraints, ExecutionResult, ResultBuilder, Submission, SubmissionId, SubmissionStatus,
};

/// Failure reason recorded for cancelled submissions.
pub const CANCELLED_REASON: &str = "cancelled";

/// Constraint fields of a submit request. Missing values take configured
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstraintsRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_sec: Option<u64>,
    #[serde(
        default,
        alias = "memory_limit_mb",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
}

/// A request to run code.
///
/// Besides the nested `constraints` object, the flat field names
/// `code`, `time_limit_sec`, `memory_limit_mb` and `network_disabled` are
/// accepted. Nested values take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub language: String,
    #[serde(alias = "code")]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub constraints: ConstraintsRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_sec: Option<u64>,
    #[serde(
        default,
        alias = "memory_limit_mb",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_disabled: Option<bool>,
}

impl SubmitRequest {
    pub fn new(language: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            payload: payload.into(),
            task_id: None,
            constraints: ConstraintsRequest::default(),
            time_limit_sec: None,
            memory_mb: None,
            network_disabled: None,
        }
    }

    pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_time_limit(mut self, secs: u64) -> Self {
        self.constraints.time_limit_sec = Some(secs);
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.constraints.memory_mb = Some(mb);
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.constraints.network_mode = Some(mode.into());
        self
    }
}

/// A submission refused at intake. Nothing was reserved and nothing is tracked.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Submission {submission_id} rejected: {error}")]
pub struct Rejection {
    pub submission_id: SubmissionId,
    #[source]
    pub error: AdmissionError,
}

/// How the RUNNING phase ended, after the watchdog race was settled.
enum RunEnd {
    Exited(Result<i64, RuntimeError>),
    Watchdog(WatchdogSignal),
    Cancelled,
}

/// Everything needed to build the terminal result.
struct Outcome {
    status: SubmissionStatus,
    exit_code: Option<i64>,
    output: CapturedOutput,
    runtime: Option<Duration>,
    peak_mb: Option<u64>,
    reason: Option<String>,
}

impl Outcome {
    /// Ended before any container ran.
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: SubmissionStatus::Failed,
            exit_code: None,
            output: CapturedOutput::default(),
            runtime: None,
            peak_mb: None,
            reason: Some(reason.into()),
        }
    }
}

struct Inner {
    config: Arc<RunnerConfig>,
    runtime: Arc<dyn RuntimeClient>,
    governor: ResourceGovernor,
    images: ImageCache,
    watchdog: Watchdog,
    store: SubmissionStore,
    results: ResultChannel,
    metrics: MetricsCollector,
}

/// Accepts submissions and drives them to a terminal result.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ExecutionBroker {
    inner: Arc<Inner>,
}

impl ExecutionBroker {
    pub fn new(config: Arc<RunnerConfig>, runtime: Arc<dyn RuntimeClient>) -> Self {
        let governor = ResourceGovernor::new(GovernorLimits {
            max_concurrent: config.max_concurrent,
            aggregate_memory_mb: config.aggregate_memory_mb,
        });
        let images = ImageCache::new(
            Arc::clone(&runtime),
            config.pull_backoff,
            config.pull_timeout,
        );
        let watchdog = Watchdog::new(Arc::clone(&runtime), config.stats_interval);

        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                governor,
                images,
                watchdog,
                store: SubmissionStore::new(),
                results: ResultChannel::default(),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }

    pub fn runtime(&self) -> Arc<dyn RuntimeClient> {
        Arc::clone(&self.inner.runtime)
    }

    pub fn governor(&self) -> &ResourceGovernor {
        &self.inner.governor
    }

    pub fn governor_snapshot(&self) -> GovernorSnapshot {
        self.inner.governor.snapshot()
    }

    pub fn images(&self) -> &ImageCache {
        &self.inner.images
    }

    /// Validates and admits a submission, then starts driving it.
    ///
    /// Returns as soon as the admission decision is made.
    pub fn submit(&self, request: SubmitRequest) -> Result<SubmissionId, Rejection> {
        let id = SubmissionId::new();

        let (language, constraints) = match self.validate(&request) {
            Ok(valid) => valid,
            Err(error) => return Err(self.reject(id, &request, error)),
        };

        let token = match self.inner.governor.try_admit(constraints.memory_mb) {
            Ok(token) => token,
            Err(error) => return Err(self.reject(id, &request, error)),
        };

        let mut submission = Submission::new(
            id,
            language,
            &request.payload,
            request.task_id.clone(),
            constraints,
        );

        if let Err(fault) = submission.transition(SubmissionStatus::Provisioning) {
            // Unreachable for a fresh submission; keep accounting whole anyway.
            error!(submission_id = %id, fault = %fault, "Invalid initial transition");
            let _ = self.inner.governor.release(&token);
            return Err(Rejection {
                submission_id: id,
                error: AdmissionError::InvalidConstraints(fault.to_string()),
            });
        }

        info!(
            submission_id = %id,
            language = %language,
            task_id = submission.task_id.as_deref().unwrap_or(""),
            payload_sha256 = %submission.payload_sha256,
            time_limit_sec = submission.constraints.time_limit_sec,
            memory_mb = submission.constraints.memory_mb,
            "Submission admitted"
        );

        let tracked = self.inner.store.insert(submission.clone());
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(submission, request.payload, token, tracked).await;
        });

        Ok(id)
    }

    fn validate(&self, request: &SubmitRequest) -> Result<(Language, Constraints), AdmissionError> {
        let config = &self.inner.config;

        let language: Language = request.language.parse()?;

        let size = request.payload.len();
        if size > config.max_payload_bytes {
            return Err(AdmissionError::PayloadTooLarge {
                size,
                max: config.max_payload_bytes,
            });
        }

        let time_limit_sec = request
            .constraints
            .time_limit_sec
            .or(request.time_limit_sec)
            .unwrap_or(config.default_time_limit_secs);
        if time_limit_sec == 0 || time_limit_sec > config.max_time_limit_secs {
            return Err(AdmissionError::InvalidConstraints(format!(
                "time_limit_sec must be between 1 and {}, got {}",
                config.max_time_limit_secs, time_limit_sec
            )));
        }

        let memory_mb = request
            .constraints
            .memory_mb
            .or(request.memory_mb)
            .unwrap_or(config.default_memory_mb);
        if memory_mb == 0 || memory_mb > config.max_memory_mb {
            return Err(AdmissionError::InvalidConstraints(format!(
                "memory_mb must be between 1 and {}, got {}",
                config.max_memory_mb, memory_mb
            )));
        }

        let network_mode = match (&request.constraints.network_mode, request.network_disabled) {
            (Some(mode), _) => mode.trim().to_string(),
            (None, Some(false)) => {
                return Err(AdmissionError::InvalidConstraints(
                    "network_disabled=false requires an explicit network_mode".to_string(),
                ))
            }
            (None, _) => "none".to_string(),
        };
        if !config.network_allowed(&network_mode) {
            return Err(AdmissionError::NetworkNotAllowed(network_mode));
        }

        Ok((
            language,
            Constraints {
                time_limit_sec,
                memory_mb,
                network_mode,
            },
        ))
    }

    fn reject(&self, id: SubmissionId, request: &SubmitRequest, error: AdmissionError) -> Rejection {
        self.inner.metrics.record_rejection(error.kind());
        self.inner
            .metrics
            .record_terminal(SubmissionStatus::Rejected.as_str(), &request.language, None);
        info!(
            submission_id = %id,
            language = %request.language,
            reason = error.kind(),
            error = %error,
            "Submission rejected"
        );
        Rejection {
            submission_id: id,
            error,
        }
    }

    /// Current status, plus the result once terminal.
    pub fn poll(&self, id: &SubmissionId) -> Result<SubmissionView, StoreError> {
        self.inner.store.get(id)
    }

    /// Waits for the terminal result.
    pub async fn wait_result(&self, id: &SubmissionId) -> Result<ExecutionResult, StoreError> {
        self.inner.store.wait_result(id).await
    }

    /// Requests cancellation. Returns the status observed when the request
    /// was made; a terminal status means nothing changed.
    pub fn cancel(&self, id: &SubmissionId) -> Result<SubmissionStatus, StoreError> {
        let status = self.inner.store.request_cancel(id)?;
        if !status.is_terminal() {
            info!(submission_id = %id, status = %status, "Cancellation requested");
        }
        Ok(status)
    }

    /// Acknowledges a terminal result and stops tracking the submission.
    pub fn acknowledge(&self, id: &SubmissionId) -> Result<ExecutionResult, StoreError> {
        let result = self.inner.store.acknowledge(id)?;
        debug!(submission_id = %id, "Result acknowledged");
        Ok(result)
    }

    /// Subscribes to terminal results as they are produced.
    pub fn subscribe_results(&self) -> broadcast::Receiver<ExecutionResult> {
        self.inner.results.subscribe()
    }

    /// Number of tracked submissions.
    pub fn tracked_count(&self) -> usize {
        self.inner.store.len()
    }

    /// Periodically evicts terminal results nobody acknowledged.
    pub fn spawn_janitor(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.config.janitor_interval);
            loop {
                ticker.tick().await;
                let evicted = inner.store.evict_expired(inner.config.result_retention);
                if evicted > 0 {
                    debug!(evicted, remaining = inner.store.len(), "Evicted expired results");
                }
            }
        })
    }
}

impl Inner {
    async fn drive(
        self: Arc<Self>,
        mut submission: Submission,
        payload: String,
        token: AdmissionToken,
        tracked: Arc<Tracked>,
    ) {
        let mut cancel = tracked.cancel_signal();
        let (outcome, container_id) = self
            .execute(&mut submission, &payload, &tracked, &mut cancel)
            .await;

        self.finish(&mut submission, &tracked, outcome);

        if let Some(container_id) = container_id {
            self.cleanup(&submission.id, &container_id).await;
        }

        // Failures are logged and counted by the governor.
        let _ = self.governor.release(&token);
    }

    /// Runs PROVISIONING and RUNNING. Returns the outcome and the container
    /// to clean up, if one was created.
    async fn execute(
        &self,
        submission: &mut Submission,
        payload: &str,
        tracked: &Tracked,
        cancel: &mut watch::Receiver<bool>,
    ) -> (Outcome, Option<String>) {
        let id = submission.id;
        let language = submission.language;

        // Image
        let image = tokio::select! {
            biased;
            Ok(_) = cancel.wait_for(|c| *c) => Err(CANCELLED_REASON.to_string()),
            ready = self.images.wait_ready(language, self.config.pull_timeout) => {
                ready.map_err(|fault| fault.to_string())
            }
        };
        if let Err(reason) = image {
            return (Outcome::failed(reason), None);
        }

        // Container
        let spec = self.container_spec(submission, payload);
        let container_id = match self.create_with_retry(&spec, language).await {
            Ok(container_id) => container_id,
            Err(fault) => return (Outcome::failed(fault.to_string()), None),
        };
        debug!(submission_id = %id, container_id = %container_id, "Container created");

        if *cancel.borrow() {
            return (Outcome::failed(CANCELLED_REASON), Some(container_id));
        }

        if let Err(e) = self.runtime.start_container(&container_id).await {
            let fault = if e.is_daemon_unreachable() {
                InfrastructureFault::DaemonUnreachable(e.to_string())
            } else {
                InfrastructureFault::ContainerStartFailed(e.to_string())
            };
            return (Outcome::failed(fault.to_string()), Some(container_id));
        }

        let outcome = self.run(submission, tracked, cancel, &container_id).await;
        (outcome, Some(container_id))
    }

    fn container_spec(&self, submission: &Submission, payload: &str) -> ContainerSpec {
        let profile = submission.language.profile();

        let mut env = vec![format!("{}={}", PAYLOAD_ENV, BASE64.encode(payload))];
        env.extend(profile.env.iter().map(|e| e.to_string()));

        let mut spec = ContainerSpec::new(
            format!("solution-runner-{}", submission.id),
            profile.image,
        )
        .with_cmd(submission.language.entrypoint())
        .with_env(env)
        .with_limits(ExecutionLimits::for_submission(
            &self.config,
            submission.constraints.memory_mb,
        ))
        .with_network_mode(submission.constraints.network_mode.clone())
        .with_label(LABEL_SUBMISSION_ID, submission.id.to_string());

        if let Some(task_id) = &submission.task_id {
            spec = spec.with_label(LABEL_TASK_ID, task_id.clone());
        }
        spec
    }

    /// Creates the container, retrying transient daemon errors with backoff.
    async fn create_with_retry(
        &self,
        spec: &ContainerSpec,
        language: Language,
    ) -> Result<String, InfrastructureFault> {
        let attempts = self.config.create_retries.max(1);
        let mut attempt = 0;

        loop {
            let err = match self.runtime.create_container(spec).await {
                Ok(id) => return Ok(id),
                Err(err) => err,
            };
            attempt += 1;

            if matches!(err, RuntimeError::ImageNotFound(_)) {
                self.images.invalidate(language);
            }

            if !err.is_transient() || attempt >= attempts {
                warn!(
                    container = %spec.name,
                    attempts = attempt,
                    error = %err,
                    "Container creation failed"
                );
                // A timed-out request may still have created it.
                let _ = self.runtime.remove_container(&spec.name).await;
                return Err(InfrastructureFault::ContainerCreateFailed {
                    attempts: attempt,
                    reason: err.to_string(),
                });
            }

            let delay = self.config.create_backoff.next(attempt - 1);
            debug!(
                container = %spec.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying container creation"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// RUNNING through the end of collection.
    async fn run(
        &self,
        submission: &mut Submission,
        tracked: &Tracked,
        cancel: &mut watch::Receiver<bool>,
        container_id: &str,
    ) -> Outcome {
        let id = submission.id;
        let started = Instant::now();
        self.advance(submission, SubmissionStatus::Running);
        tracked.update(submission);

        let (watch_handle, mut fired) = self.watchdog.arm(WatchTarget {
            submission_id: id.to_string(),
            container_id: container_id.to_string(),
            started,
            time_limit: Duration::from_secs(submission.constraints.time_limit_sec),
            memory_mb: submission.constraints.memory_mb,
        });

        let mut output_task = {
            let runtime = Arc::clone(&self.runtime);
            let container_id = container_id.to_string();
            let cap = self.config.output_cap_bytes;
            tokio::spawn(async move { runtime.stream_output(&container_id, cap).await })
        };

        let mut wait = self.runtime.wait_container(container_id);

        let first = tokio::select! {
            exited = &mut wait => RunEnd::Exited(exited),
            Ok(signal) = &mut fired => RunEnd::Watchdog(signal),
            Ok(_) = cancel.wait_for(|c| *c) => RunEnd::Cancelled,
        };
        let observed_at = started.elapsed();

        // The first terminal signal wins. If the watchdog flipped first, its
        // signal replaces whatever the broker saw.
        let end = match first {
            RunEnd::Watchdog(signal) => RunEnd::Watchdog(signal),
            other => {
                if watch_handle.disarm() {
                    other
                } else {
                    match (&mut fired).await {
                        Ok(signal) => RunEnd::Watchdog(signal),
                        Err(_) => other,
                    }
                }
            }
        };
        watch_handle.disarm();
        let peak_mb = watch_handle.peak_memory_mb();

        let (status, exit_code, runtime, reason) = match end {
            RunEnd::Exited(Ok(code)) => {
                let oom = match self.runtime.inspect_container(container_id).await {
                    Ok(state) => state.oom_killed,
                    Err(e) => {
                        warn!(submission_id = %id, error = %e, "Inspect after exit failed");
                        false
                    }
                };
                if oom {
                    (
                        SubmissionStatus::MemoryExceeded,
                        Some(code),
                        observed_at,
                        Some(format!(
                            "killed by the kernel OOM killer (limit {} MB)",
                            submission.constraints.memory_mb
                        )),
                    )
                } else {
                    (SubmissionStatus::Done, Some(code), observed_at, None)
                }
            }
            RunEnd::Exited(Err(e)) => {
                // The process may still be running.
                self.kill(&id, container_id).await;
                let reason = if e.is_daemon_unreachable() {
                    InfrastructureFault::DaemonUnreachable(e.to_string()).to_string()
                } else {
                    format!("waiting for container failed: {e}")
                };
                (SubmissionStatus::Failed, None, observed_at, Some(reason))
            }
            RunEnd::Watchdog(WatchdogSignal::Deadline { elapsed }) => {
                self.kill(&id, container_id).await;
                (
                    SubmissionStatus::Timeout,
                    None,
                    elapsed,
                    Some(format!(
                        "time limit of {}s exceeded",
                        submission.constraints.time_limit_sec
                    )),
                )
            }
            RunEnd::Watchdog(WatchdogSignal::MemoryExceeded { usage_mb }) => {
                self.kill(&id, container_id).await;
                (
                    SubmissionStatus::MemoryExceeded,
                    None,
                    observed_at,
                    Some(format!(
                        "memory usage {} MB exceeded limit of {} MB",
                        usage_mb, submission.constraints.memory_mb
                    )),
                )
            }
            RunEnd::Cancelled => {
                self.kill(&id, container_id).await;
                (
                    SubmissionStatus::Failed,
                    None,
                    observed_at,
                    Some(CANCELLED_REASON.to_string()),
                )
            }
        };

        if status == SubmissionStatus::Done {
            self.advance(submission, SubmissionStatus::Collecting);
            tracked.update(submission);
        }

        let collected = self.collect(&mut output_task).await;

        let mut outcome = Outcome {
            status,
            exit_code,
            output: CapturedOutput::default(),
            runtime: Some(runtime),
            peak_mb,
            reason,
        };

        match collected {
            Ok(output) => outcome.output = output,
            Err(reason) if status == SubmissionStatus::Done => {
                outcome.status = SubmissionStatus::Failed;
                outcome.reason =
                    Some(InfrastructureFault::OutputCollectionFailed(reason).to_string());
            }
            Err(reason) => {
                debug!(submission_id = %id, reason = %reason, "Partial output unavailable");
            }
        }

        outcome
    }

    /// Waits for the output follower, bounded by the collect timeout.
    async fn collect(
        &self,
        task: &mut JoinHandle<Result<CapturedOutput, RuntimeError>>,
    ) -> Result<CapturedOutput, String> {
        match tokio::time::timeout(self.config.collect_timeout, &mut *task).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(e.to_string()),
            Ok(Err(join)) => Err(format!("output task failed: {join}")),
            Err(_) => {
                task.abort();
                Err(format!(
                    "output not drained within {:?}",
                    self.config.collect_timeout
                ))
            }
        }
    }

    async fn kill(&self, id: &SubmissionId, container_id: &str) {
        if let Err(e) = self.runtime.kill_container(container_id).await {
            // Removal force-kills anyway.
            warn!(submission_id = %id, container_id = %container_id, error = %e, "Kill failed");
        }
    }

    fn advance(&self, submission: &mut Submission, next: SubmissionStatus) {
        if let Err(fault) = submission.transition(next) {
            error!(submission_id = %submission.id, fault = %fault, "State machine violation");
            self.metrics.record_consistency_fault("invalid_transition");
        }
    }

    /// Moves to the terminal status, records the result and emits it.
    fn finish(&self, submission: &mut Submission, tracked: &Tracked, outcome: Outcome) {
        self.advance(submission, outcome.status);

        let mut builder = ResultBuilder::new(submission.id, outcome.status)
            .exit_code(outcome.exit_code)
            .output(outcome.output);
        if let Some(runtime) = outcome.runtime {
            builder = builder.runtime_ms(runtime.as_millis() as u64);
        }
        if let Some(peak) = outcome.peak_mb {
            builder = builder.memory_mb_peak(peak);
        }
        if let Some(reason) = outcome.reason {
            builder = builder.failure_reason(reason);
        }
        let result = builder.build();

        if let Err(fault) = tracked.complete(submission, result.clone()) {
            error!(submission_id = %submission.id, fault = %fault, "Duplicate result suppressed");
            self.metrics.record_consistency_fault("result_already_delivered");
            return;
        }
        self.results.deliver(result.clone());

        self.metrics.record_terminal(
            result.status.as_str(),
            submission.language.as_str(),
            outcome.runtime.map(|d| d.as_secs_f64()),
        );
        info!(
            submission_id = %submission.id,
            language = %submission.language,
            status = %result.status,
            exit_code = result.exit_code,
            runtime_ms = result.runtime_ms,
            stdout_truncated = result.stdout_truncated,
            stderr_truncated = result.stderr_truncated,
            reason = result.failure_reason.as_deref().unwrap_or(""),
            "Submission finished"
        );
    }

    /// Removes the container with bounded retries. Never fails the submission.
    async fn cleanup(&self, id: &SubmissionId, container_id: &str) {
        let attempts = self.config.cleanup_retries.max(1);

        for attempt in 0..attempts {
            match self.runtime.remove_container(container_id).await {
                Ok(()) => {
                    debug!(submission_id = %id, container_id = %container_id, "Container removed");
                    return;
                }
                Err(e) => {
                    warn!(
                        submission_id = %id,
                        container_id = %container_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Container removal failed"
                    );
                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.config.create_backoff.next(attempt)).await;
                    }
                }
            }
        }

        error!(
            submission_id = %id,
            container_id = %container_id,
            attempts,
            "Giving up on container removal"
        );
        self.metrics.record_cleanup_failure();
    }
}

/// Convenience for callers that hold only a receiver.
pub async fn next_result(
    rx: &mut broadcast::Receiver<ExecutionResult>,
) -> Option<ExecutionResult> {
    loop {
        match rx.recv().await {
            Ok(result) => return Some(result),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Result subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{ContainerState, ResourceStats};
    use async_trait::async_trait;

    /// Runtime that must never be reached: validation tests only.
    struct Unreachable;

    #[async_trait]
    impl RuntimeClient for Unreachable {
        async fn ping(&self) -> Result<(), RuntimeError> {
            Err(RuntimeError::DaemonUnavailable("test".into()))
        }
        async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn create_container(&self, _spec: &ContainerSpec) -> Result<String, RuntimeError> {
            Err(RuntimeError::DaemonUnavailable("test".into()))
        }
        async fn start_container(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn wait_container(&self, _id: &str) -> Result<i64, RuntimeError> {
            Ok(0)
        }
        async fn inspect_container(&self, _id: &str) -> Result<ContainerState, RuntimeError> {
            Ok(ContainerState::default())
        }
        async fn stats(&self, _id: &str) -> Result<ResourceStats, RuntimeError> {
            Ok(ResourceStats::default())
        }
        async fn stream_output(
            &self,
            _id: &str,
            _cap: usize,
        ) -> Result<CapturedOutput, RuntimeError> {
            Ok(CapturedOutput::default())
        }
        async fn kill_container(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn remove_container(&self, _id: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    fn broker(config: RunnerConfig) -> ExecutionBroker {
        ExecutionBroker::new(Arc::new(config), Arc::new(Unreachable))
    }

    #[test]
    fn test_request_aliases() {
        let json = r#"{
            "language": "python",
            "code": "print(1)",
            "memory_limit_mb": 64,
            "time_limit_sec": 3,
            "network_disabled": true
        }"#;
        let request: SubmitRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.payload, "print(1)");
        assert_eq!(request.memory_mb, Some(64));
        assert_eq!(request.time_limit_sec, Some(3));

        let broker = broker(RunnerConfig::default());
        let (_, constraints) = broker.validate(&request).unwrap();
        assert_eq!(constraints.memory_mb, 64);
        assert_eq!(constraints.time_limit_sec, 3);
        assert_eq!(constraints.network_mode, "none");
    }

    #[test]
    fn test_nested_constraints_take_precedence() {
        let request = SubmitRequest {
            time_limit_sec: Some(9),
            ..SubmitRequest::new("python", "pass").with_time_limit(2)
        };
        let (_, constraints) = broker(RunnerConfig::default()).validate(&request).unwrap();
        assert_eq!(constraints.time_limit_sec, 2);
    }

    #[test]
    fn test_defaults_applied() {
        let config = RunnerConfig::default();
        let (lang, constraints) = broker(config.clone())
            .validate(&SubmitRequest::new("js", "1"))
            .unwrap();
        assert_eq!(lang, Language::JavaScript);
        assert_eq!(constraints.time_limit_sec, config.default_time_limit_secs);
        assert_eq!(constraints.memory_mb, config.default_memory_mb);
    }

    #[test]
    fn test_constraints_out_of_range_rejected() {
        let broker = broker(RunnerConfig::default());
        for request in [
            SubmitRequest::new("python", "").with_time_limit(0),
            SubmitRequest::new("python", "").with_time_limit(61),
            SubmitRequest::new("python", "").with_memory_mb(0),
            SubmitRequest::new("python", "").with_memory_mb(4096),
        ] {
            assert!(matches!(
                broker.validate(&request),
                Err(AdmissionError::InvalidConstraints(_))
            ));
        }
    }

    #[test]
    fn test_network_whitelist() {
        let config =
            RunnerConfig::default().with_network_whitelist(vec!["grading-net".to_string()]);
        let broker = broker(config);

        let ok = SubmitRequest::new("python", "").with_network_mode("grading-net");
        assert!(broker.validate(&ok).is_ok());

        let denied = SubmitRequest::new("python", "").with_network_mode("bridge");
        assert_eq!(
            broker.validate(&denied).unwrap_err(),
            AdmissionError::NetworkNotAllowed("bridge".to_string())
        );
    }

    #[test]
    fn test_oversized_payload() {
        let broker = broker(RunnerConfig::default().with_max_payload_bytes(8));
        let err = broker
            .validate(&SubmitRequest::new("python", "print('too long')"))
            .unwrap_err();
        assert!(matches!(err, AdmissionError::PayloadTooLarge { max: 8, .. }));
    }

    #[tokio::test]
    async fn test_rejection_is_not_tracked() {
        let broker = broker(RunnerConfig::default());
        let rejection = broker
            .submit(SubmitRequest::new("cobol", "DISPLAY 'HI'."))
            .unwrap_err();

        assert_eq!(
            rejection.error,
            AdmissionError::UnsupportedLanguage("cobol".to_string())
        );
        assert_eq!(broker.tracked_count(), 0);
        assert_eq!(broker.governor_snapshot().admitted, 0);
        assert!(broker.poll(&rejection.submission_id).is_err());
    }

    #[test]
    fn test_container_spec_carries_payload_and_labels() {
        let broker = broker(RunnerConfig::default());
        let mut sub = Submission::new(
            SubmissionId::new(),
            Language::Python,
            "print(1)",
            Some("task-9".to_string()),
            Constraints {
                time_limit_sec: 5,
                memory_mb: 1,
                network_mode: "none".to_string(),
            },
        );
        sub.transition(SubmissionStatus::Provisioning).unwrap();

        let spec = broker.inner.container_spec(&sub, "print(1)");
        assert_eq!(spec.image, "python:3.12-slim");
        assert_eq!(spec.env_value(PAYLOAD_ENV), Some("cHJpbnQoMSk="));
        assert_eq!(spec.env_value("TMPDIR"), Some("/scratch"));
        assert_eq!(spec.limits.memory_mb, 1);
        assert!(spec.network_disabled());
        assert_eq!(
            spec.labels.get(LABEL_TASK_ID).map(String::as_str),
            Some("task-9")
        );
        assert_eq!(
            spec.labels.get(LABEL_SUBMISSION_ID),
            Some(&sub.id.to_string())
        );
    }
}
