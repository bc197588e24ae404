//! Image availability cache.
//!
//! One `watch` channel per language holds that language's last known image
//! state. The map of channels is built once and never mutated, so checking
//! one language never contends with a pull running for another.
//!
//! Nothing is pulled eagerly. The first request for a language checks the
//! daemon and pulls if needed; a failed pull is retried only when a later
//! request arrives after the backoff window. A check or pull that outlives
//! the pull timeout counts as failed, so a hung daemon call cannot pin a
//! language in `Pending`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{InfrastructureFault, RuntimeError};
use crate::execution::{Language, RuntimeClient};
use crate::metrics::MetricsCollector;
use crate::policy::BackoffPolicy;

/// Last known state of one language's image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageState {
    /// Never checked.
    Unknown,
    /// A presence check or pull is in flight.
    Pending,
    /// Present on the daemon.
    Ready,
    /// Last pull failed; no new attempt before `retry_at`.
    Failed {
        attempts: u32,
        retry_at: Instant,
        reason: String,
    },
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::Unknown => "unknown",
            ImageState::Pending => "pending",
            ImageState::Ready => "ready",
            ImageState::Failed { .. } => "failed",
        }
    }
}

/// Answer to "can a container for this language be created now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Ready,
    Pending,
    Failed(String),
}

struct Entry {
    state: watch::Sender<ImageState>,
    failures: AtomicU32,
}

/// Tracks image presence per language and triggers pulls lazily.
pub struct ImageCache {
    runtime: Arc<dyn RuntimeClient>,
    backoff: BackoffPolicy,
    pull_timeout: Duration,
    entries: HashMap<Language, Arc<Entry>>,
    metrics: MetricsCollector,
}

impl ImageCache {
    pub fn new(
        runtime: Arc<dyn RuntimeClient>,
        backoff: BackoffPolicy,
        pull_timeout: Duration,
    ) -> Self {
        let entries = Language::ALL
            .iter()
            .map(|lang| {
                let (state, _) = watch::channel(ImageState::Unknown);
                (
                    *lang,
                    Arc::new(Entry {
                        state,
                        failures: AtomicU32::new(0),
                    }),
                )
            })
            .collect();

        Self {
            runtime,
            backoff,
            pull_timeout,
            entries,
            metrics: MetricsCollector::new(),
        }
    }

    fn entry(&self, language: Language) -> Result<&Arc<Entry>, InfrastructureFault> {
        self.entries
            .get(&language)
            .ok_or_else(|| InfrastructureFault::ImagePullFailed {
                image: language.image().to_string(),
                reason: "language has no cache entry".to_string(),
            })
    }

    /// Reports availability, starting a check or pull when the state allows.
    ///
    /// Never waits on the daemon.
    pub fn ensure_available(&self, language: Language) -> Availability {
        let Ok(entry) = self.entry(language) else {
            return Availability::Failed(format!("no image configured for {language}"));
        };

        let mut start = false;
        entry.state.send_if_modified(|state| match state {
            ImageState::Ready | ImageState::Pending => false,
            ImageState::Unknown => {
                *state = ImageState::Pending;
                start = true;
                true
            }
            ImageState::Failed { retry_at, .. } => {
                if Instant::now() >= *retry_at {
                    *state = ImageState::Pending;
                    start = true;
                    true
                } else {
                    false
                }
            }
        });

        if start {
            tokio::spawn(refresh(
                Arc::clone(entry),
                Arc::clone(&self.runtime),
                language,
                self.backoff,
                self.pull_timeout,
                self.metrics,
            ));
        }

        let state = entry.state.borrow();
        match &*state {
            ImageState::Ready => Availability::Ready,
            ImageState::Unknown | ImageState::Pending => Availability::Pending,
            ImageState::Failed { reason, .. } => Availability::Failed(reason.clone()),
        }
    }

    /// Waits until the image is ready, it fails, or `timeout` elapses.
    pub async fn wait_ready(
        &self,
        language: Language,
        timeout: Duration,
    ) -> Result<(), InfrastructureFault> {
        let image = language.image();
        let fault = |reason: String| InfrastructureFault::ImagePullFailed {
            image: image.to_string(),
            reason,
        };

        match self.ensure_available(language) {
            Availability::Ready => return Ok(()),
            Availability::Failed(reason) => return Err(fault(reason)),
            Availability::Pending => {}
        }

        let mut rx = self.entry(language)?.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| !matches!(s, ImageState::Pending | ImageState::Unknown)),
        )
        .await;

        match settled {
            Err(_) => Err(fault(format!("image not ready after {timeout:?}"))),
            Ok(Err(_)) => Err(fault("image cache closed".to_string())),
            Ok(Ok(state)) => match &*state {
                ImageState::Ready => Ok(()),
                ImageState::Failed { reason, .. } => Err(fault(reason.clone())),
                other => Err(fault(format!("unexpected image state {}", other.as_str()))),
            },
        }
    }

    /// Forgets a language's state, e.g. after the daemon reported its image
    /// missing. The next request checks again.
    pub fn invalidate(&self, language: Language) {
        if let Ok(entry) = self.entry(language) {
            entry.state.send_if_modified(|state| {
                if matches!(state, ImageState::Ready) {
                    *state = ImageState::Unknown;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Current state of one language.
    pub fn state(&self, language: Language) -> ImageState {
        self.entry(language)
            .map(|entry| entry.state.borrow().clone())
            .unwrap_or(ImageState::Unknown)
    }

    /// Current state name of every language, for health reporting.
    pub fn report(&self) -> HashMap<String, String> {
        Language::ALL
            .iter()
            .map(|lang| (lang.to_string(), self.state(*lang).as_str().to_string()))
            .collect()
    }
}

async fn refresh(
    entry: Arc<Entry>,
    runtime: Arc<dyn RuntimeClient>,
    language: Language,
    backoff: BackoffPolicy,
    pull_timeout: Duration,
    metrics: MetricsCollector,
) {
    let image = language.image();

    let attempt = async {
        match runtime.image_exists(image).await {
            Ok(true) => Ok(false),
            Ok(false) => {
                info!(language = %language, image = %image, "Pulling image");
                runtime.pull_image(image).await.map(|()| true)
            }
            Err(e) => Err(e),
        }
    };

    let result = match tokio::time::timeout(pull_timeout, attempt).await {
        Ok(result) => result.map_err(|e| describe(&e)),
        Err(_) => Err(format!("pull of {image} did not finish within {pull_timeout:?}")),
    };

    match result {
        Ok(pulled) => {
            if pulled {
                metrics.record_image_pull(language.as_str(), "success");
                info!(language = %language, image = %image, "Image pulled");
            }
            entry.failures.store(0, Ordering::Release);
            entry.state.send_replace(ImageState::Ready);
        }
        Err(reason) => {
            let previous = entry.failures.fetch_add(1, Ordering::AcqRel);
            let delay = backoff.next(previous);
            metrics.record_image_pull(language.as_str(), "failure");
            warn!(
                language = %language,
                image = %image,
                error = %reason,
                attempts = previous + 1,
                retry_in_ms = delay.as_millis() as u64,
                "Image unavailable"
            );
            entry.state.send_replace(ImageState::Failed {
                attempts: previous + 1,
                retry_at: Instant::now() + delay,
                reason,
            });
        }
    }
}

fn describe(err: &RuntimeError) -> String {
    match err {
        RuntimeError::PullFailed { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}
