//! Runtime daemon health and service readiness.
//!
//! A background task pings the daemon every `health_interval`. The service
//! reports unready until the first ping succeeds, and after that only turns
//! unready again once `health_retries` consecutive pings failed, so a single
//! slow answer does not flap the readiness probe.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::execution::RuntimeClient;
use crate::governor::GovernorSnapshot;

/// Latest health observation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Whether the most recent ping succeeded.
    pub daemon_reachable: bool,
    pub ready: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    #[serde(flatten)]
    pub health: HealthStatus,
    pub governor: GovernorSnapshot,
    pub images: HashMap<String, String>,
}

impl HealthReport {
    pub fn new(
        health: HealthStatus,
        governor: GovernorSnapshot,
        images: HashMap<String, String>,
    ) -> Self {
        Self {
            status: if health.ready { "ok" } else { "unavailable" },
            health,
            governor,
            images,
        }
    }
}

/// Tracks daemon reachability.
pub struct HealthMonitor {
    runtime: Arc<dyn RuntimeClient>,
    interval: Duration,
    retries: u32,
    state: watch::Sender<HealthStatus>,
}

impl HealthMonitor {
    pub fn new(runtime: Arc<dyn RuntimeClient>, interval: Duration, retries: u32) -> Self {
        let (state, _) = watch::channel(HealthStatus::default());
        Self {
            runtime,
            interval,
            retries: retries.max(1),
            state,
        }
    }

    /// Pings the daemon once and folds the outcome into the status.
    ///
    /// A ping that does not answer within one check interval counts as a
    /// failure.
    pub async fn check(&self) -> HealthStatus {
        let outcome = match tokio::time::timeout(self.interval, self.runtime.ping()).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => Err(format!("ping unanswered after {:?}", self.interval)),
        };
        let retries = self.retries;

        self.state.send_modify(|status| {
            status.checked_at = Some(Utc::now());
            match &outcome {
                Ok(()) => {
                    if !status.ready {
                        info!("Runtime daemon reachable, service ready");
                    }
                    status.daemon_reachable = true;
                    status.ready = true;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                }
                Err(e) => {
                    status.daemon_reachable = false;
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    status.last_error = Some(e.clone());
                    if status.ready && status.consecutive_failures >= retries {
                        warn!(
                            failures = status.consecutive_failures,
                            error = %e,
                            "Runtime daemon unreachable, service unready"
                        );
                        status.ready = false;
                    }
                }
            }
        });

        self.status()
    }

    pub fn status(&self) -> HealthStatus {
        self.state.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.state.borrow().ready
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthStatus> {
        self.state.subscribe()
    }

    /// Starts the periodic check loop.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.check().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RuntimeError;
    use crate::execution::{CapturedOutput, ContainerSpec, ContainerState, ResourceStats};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Toggle {
        up: AtomicBool,
        /// Pings never answer.
        hung: AtomicBool,
    }

    #[async_trait]
    impl RuntimeClient for Toggle {
        async fn ping(&self) -> Result<(), RuntimeError> {
            if self.hung.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RuntimeError::DaemonUnavailable("connection refused".into()))
            }
        }
        async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
            Ok(true)
        }
        async fn pull_image(&self, _image: &str) -> Result<(), RuntimeError> {
            Ok(())
        }
        async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
            Ok(spec.name.clone())
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

    fn monitor(up: bool, retries: u32) -> (Arc<Toggle>, HealthMonitor) {
        let runtime = Arc::new(Toggle {
            up: AtomicBool::new(up),
            hung: AtomicBool::new(false),
        });
        let monitor = HealthMonitor::new(runtime.clone(), Duration::from_millis(10), retries);
        (runtime, monitor)
    }

    #[tokio::test]
    async fn test_unready_until_first_success() {
        let (runtime, monitor) = monitor(false, 3);
        assert!(!monitor.is_ready());

        let status = monitor.check().await;
        assert!(!status.ready);
        assert!(!status.daemon_reachable);
        assert!(status.last_error.is_some());

        runtime.up.store(true, Ordering::SeqCst);
        let status = monitor.check().await;
        assert!(status.ready);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_tolerates_failures_below_retry_budget() {
        let (runtime, monitor) = monitor(true, 3);
        monitor.check().await;

        runtime.up.store(false, Ordering::SeqCst);
        monitor.check().await;
        let status = monitor.check().await;
        assert!(status.ready);
        assert!(!status.daemon_reachable);
        assert_eq!(status.consecutive_failures, 2);

        let status = monitor.check().await;
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_hung_ping_counts_as_failure() {
        let (runtime, monitor) = monitor(true, 2);
        assert!(monitor.check().await.ready);

        runtime.hung.store(true, Ordering::SeqCst);
        let status = tokio::time::timeout(Duration::from_secs(1), monitor.check())
            .await
            .expect("check is bounded by the interval");
        assert!(!status.daemon_reachable);
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.is_some());
        assert!(status.ready);

        let status = monitor.check().await;
        assert!(!status.ready);
    }

    #[tokio::test]
    async fn test_background_loop_publishes() {
        let (_runtime, monitor) = monitor(true, 1);
        let monitor = Arc::new(monitor);
        let mut rx = monitor.subscribe();
        let task = monitor.spawn();

        let ready = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.ready))
            .await
            .expect("became ready")
            .map(|s| s.ready)
            .unwrap_or(false);
        assert!(ready);
        task.abort();
    }

    #[test]
    fn test_report_status_label() {
        let report = HealthReport::new(
            HealthStatus::default(),
            GovernorSnapshot::default(),
            HashMap::new(),
        );
        assert_eq!(report.status, "unavailable");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["ready"], false);
        assert_eq!(json["governor"]["admitted"], 0);
    }
}
