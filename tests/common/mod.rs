//! In-process container runtime for broker integration tests.
//!
//! Each created container gets a [`Behavior`] chosen by a script from the
//! decoded source payload, so tests describe programs by what they do.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::watch;

use solution_runner::error::RuntimeError;
use solution_runner::execution::{
    CapturedOutput, ContainerSpec, ContainerState, OutputCapture, ResourceStats, RuntimeClient,
    StreamKind, PAYLOAD_ENV,
};

/// What a fake container does once started.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Runs for `after`, prints, and exits with `code`.
    Exit {
        code: i64,
        stdout: String,
        stderr: String,
        after: Duration,
    },
    /// Prints `stdout` and then runs until killed.
    Hang { stdout: String },
    /// Runs until killed, reporting these memory samples in order (the last repeats).
    Allocate { samples_mb: Vec<u64> },
    /// Killed by the kernel OOM killer shortly after start.
    OomKilled,
    /// Exits with code 0 at the moment the first memory sample reports
    /// `usage_mb`, so exit and breach land together.
    ExitOnBreach { usage_mb: u64 },
}

impl Behavior {
    pub fn exit(code: i64, stdout: &str) -> Self {
        Behavior::Exit {
            code,
            stdout: stdout.to_string(),
            stderr: String::new(),
            after: Duration::from_millis(20),
        }
    }
}

type Script = dyn Fn(&str) -> Behavior + Send + Sync;

struct FakeContainer {
    behavior: Behavior,
    spec: ContainerSpec,
    stopped: watch::Sender<bool>,
    stats_calls: AtomicUsize,
}

/// Scriptable [`RuntimeClient`].
pub struct FakeRuntime {
    script: Box<Script>,
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    next_id: AtomicUsize,
    created: AtomicUsize,
    removed: Mutex<Vec<String>>,
    create_attempts: AtomicUsize,
    /// Transient create failures still to inject.
    create_failures: AtomicU32,
    image_present: AtomicBool,
    pull_gate: watch::Sender<bool>,
    pulls: AtomicUsize,
    pulls_fail: AtomicBool,
    start_fails: AtomicBool,
    wait_fails: AtomicBool,
    stats_fail: AtomicBool,
    removes_fail: AtomicBool,
    remove_attempts: AtomicUsize,
}

impl FakeRuntime {
    pub fn new(script: impl Fn(&str) -> Behavior + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self::build(Box::new(script)))
    }

    /// Default script: recognises a handful of programs by their text.
    pub fn scripted() -> Arc<Self> {
        Self::new(default_script)
    }

    fn build(script: Box<Script>) -> Self {
        let (pull_gate, _) = watch::channel(true);
        Self {
            script,
            containers: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            created: AtomicUsize::new(0),
            removed: Mutex::new(Vec::new()),
            create_attempts: AtomicUsize::new(0),
            create_failures: AtomicU32::new(0),
            image_present: AtomicBool::new(true),
            pull_gate,
            pulls: AtomicUsize::new(0),
            pulls_fail: AtomicBool::new(false),
            start_fails: AtomicBool::new(false),
            wait_fails: AtomicBool::new(false),
            stats_fail: AtomicBool::new(false),
            removes_fail: AtomicBool::new(false),
            remove_attempts: AtomicUsize::new(0),
        }
    }

    /// Makes the next `n` create calls fail with a transient daemon error.
    pub fn fail_creates(&self, n: u32) {
        self.create_failures.store(n, Ordering::SeqCst);
    }

    /// Images are absent and pulls block until [`FakeRuntime::release_pulls`].
    pub fn block_pulls(&self) {
        self.image_present.store(false, Ordering::SeqCst);
        self.pull_gate.send_replace(false);
    }

    pub fn release_pulls(&self) {
        self.pull_gate.send_replace(true);
    }

    /// Images are absent and every pull fails.
    pub fn fail_pulls(&self) {
        self.image_present.store(false, Ordering::SeqCst);
        self.pulls_fail.store(true, Ordering::SeqCst);
    }

    /// The daemon drops the connection on every start.
    pub fn fail_start(&self) {
        self.start_fails.store(true, Ordering::SeqCst);
    }

    /// The daemon drops the connection while the broker waits for an exit.
    pub fn fail_wait(&self) {
        self.wait_fails.store(true, Ordering::SeqCst);
    }

    /// Every stats call errors, so no memory sample is ever recorded.
    pub fn fail_stats(&self) {
        self.stats_fail.store(true, Ordering::SeqCst);
    }

    /// Every removal errors and the container stays behind.
    pub fn fail_removes(&self) {
        self.removes_fail.store(true, Ordering::SeqCst);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn create_attempts(&self) -> usize {
        self.create_attempts.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn remove_attempts(&self) -> usize {
        self.remove_attempts.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    /// Containers created and not yet removed.
    pub fn live(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Spec of the most recently created live container, if any.
    pub fn last_spec(&self) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .next()
            .map(|c| c.spec.clone())
    }

    fn container(&self, id: &str) -> Result<Arc<FakeContainer>, RuntimeError> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| RuntimeError::ContainerNotFound { id: id.to_string() })
    }
}

/// Decodes the source carried in a container spec.
pub fn source_of(spec: &ContainerSpec) -> String {
    spec.env_value(PAYLOAD_ENV)
        .and_then(|b64| BASE64.decode(b64).ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn default_script(source: &str) -> Behavior {
    if source.contains("print(sum(range(100)))") {
        Behavior::exit(0, "4950\n")
    } else if source.contains("while True") {
        Behavior::Hang {
            stdout: "tick\n".to_string(),
        }
    } else if source.contains("bytearray(500") {
        Behavior::Allocate {
            samples_mb: vec![2, 40, 500],
        }
    } else if source.contains("oom") {
        Behavior::OomKilled
    } else if let Some(rest) = source.strip_prefix("spam ") {
        let n: usize = rest.trim().parse().unwrap_or(0);
        Behavior::exit(0, &"x".repeat(n))
    } else if source.contains("exit(3)") {
        Behavior::Exit {
            code: 3,
            stdout: String::new(),
            stderr: "boom\n".to_string(),
            after: Duration::from_millis(10),
        }
    } else {
        Behavior::exit(0, "")
    }
}

#[async_trait]
impl RuntimeClient for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool, RuntimeError> {
        Ok(self.image_present.load(Ordering::SeqCst))
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        if self.pulls_fail.load(Ordering::SeqCst) {
            return Err(RuntimeError::PullFailed {
                image: image.to_string(),
                reason: "manifest unknown".to_string(),
            });
        }
        let mut gate = self.pull_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        self.image_present.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .create_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RuntimeError::DaemonUnavailable("daemon warming up".into()));
        }

        let id = format!("ctr-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (stopped, _) = watch::channel(false);
        let container = FakeContainer {
            behavior: (self.script)(&source_of(spec)),
            spec: spec.clone(),
            stopped,
            stats_calls: AtomicUsize::new(0),
        };
        self.containers
            .lock()
            .unwrap()
            .insert(id.clone(), Arc::new(container));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        if self.start_fails.load(Ordering::SeqCst) {
            return Err(RuntimeError::DaemonUnavailable("connection reset".into()));
        }
        self.container(id).map(|_| ())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let container = self.container(id)?;
        if self.wait_fails.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            return Err(RuntimeError::DaemonUnavailable("connection reset".into()));
        }
        match &container.behavior {
            Behavior::Exit { code, after, .. } => {
                let mut stopped = container.stopped.subscribe();
                tokio::select! {
                    _ = tokio::time::sleep(*after) => {}
                    _ = stopped.wait_for(|s| *s) => return Ok(137),
                }
                container.stopped.send_replace(true);
                Ok(*code)
            }
            Behavior::OomKilled => {
                tokio::time::sleep(Duration::from_millis(20)).await;
                container.stopped.send_replace(true);
                Ok(137)
            }
            Behavior::Hang { .. } | Behavior::Allocate { .. } => {
                let mut stopped = container.stopped.subscribe();
                let _ = stopped.wait_for(|s| *s).await;
                Ok(137)
            }
            Behavior::ExitOnBreach { .. } => {
                let mut stopped = container.stopped.subscribe();
                let _ = stopped.wait_for(|s| *s).await;
                Ok(0)
            }
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let container = self.container(id)?;
        let oom = matches!(container.behavior, Behavior::OomKilled);
        let running = !*container.stopped.borrow();
        Ok(ContainerState {
            running,
            exit_code: None,
            oom_killed: oom,
        })
    }

    async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError> {
        let container = self.container(id)?;
        if self.stats_fail.load(Ordering::SeqCst) {
            return Err(RuntimeError::Api {
                status: 500,
                message: "stats unavailable".into(),
            });
        }
        let n = container.stats_calls.fetch_add(1, Ordering::SeqCst);
        let memory_mb = match &container.behavior {
            Behavior::Allocate { samples_mb } => samples_mb
                .get(n.min(samples_mb.len().saturating_sub(1)))
                .copied()
                .unwrap_or(0),
            Behavior::ExitOnBreach { usage_mb } => {
                // The process exits as this sample is taken.
                container.stopped.send_replace(true);
                *usage_mb
            }
            _ => 3,
        };
        Ok(ResourceStats { memory_mb })
    }

    async fn stream_output(&self, id: &str, cap: usize) -> Result<CapturedOutput, RuntimeError> {
        let container = self.container(id)?;
        let mut stopped = container.stopped.subscribe();
        let _ = stopped.wait_for(|s| *s).await;

        let mut capture = OutputCapture::new(cap);
        match &container.behavior {
            Behavior::Exit { stdout, stderr, .. } => {
                capture.push(StreamKind::Stdout, stdout.as_bytes());
                capture.push(StreamKind::Stderr, stderr.as_bytes());
            }
            Behavior::Hang { stdout } => capture.push(StreamKind::Stdout, stdout.as_bytes()),
            Behavior::Allocate { .. }
            | Behavior::OomKilled
            | Behavior::ExitOnBreach { .. } => {}
        }
        Ok(capture.finish())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        let container = self.container(id)?;
        container.stopped.send_replace(true);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.remove_attempts.fetch_add(1, Ordering::SeqCst);
        if self.removes_fail.load(Ordering::SeqCst) {
            return Err(RuntimeError::DaemonUnavailable("connection reset".into()));
        }
        let removed = self.containers.lock().unwrap().remove(id);
        if let Some(container) = removed {
            container.stopped.send_replace(true);
            self.removed.lock().unwrap().push(id.to_string());
        }
        Ok(())
    }
}
