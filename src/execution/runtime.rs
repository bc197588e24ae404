//! Container runtime capability.
//!
//! The broker, watchdog, image cache and health monitor only ever talk to a
//! daemon through [`RuntimeClient`]. [`DockerClient`](super::DockerClient) is the
//! production implementation; tests substitute an in-process fake.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::RuntimeError;
use crate::execution::output::CapturedOutput;
use crate::execution::resources::ExecutionLimits;

/// Label carrying the submission id on every container.
pub const LABEL_SUBMISSION_ID: &str = "solution-runner.submission_id";
/// Label carrying the task id on every container.
pub const LABEL_TASK_ID: &str = "solution-runner.task_id";

/// Everything needed to create one submission container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, unique per submission.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entrypoint command.
    pub cmd: Vec<String>,
    /// Environment, `KEY=value`.
    pub env: Vec<String>,
    /// Working directory inside the container.
    pub working_dir: String,
    /// Host-enforced limits.
    pub limits: ExecutionLimits,
    /// Network mode, `"none"` unless whitelisted.
    pub network_mode: String,
    /// Container labels.
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Creates a spec with no network and a `/scratch` working directory.
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: crate::execution::language::SCRATCH_DIR.to_string(),
            limits: ExecutionLimits::default(),
            network_mode: "none".to_string(),
            labels: HashMap::new(),
        }
    }

    pub fn with_cmd(mut self, cmd: Vec<String>) -> Self {
        self.cmd = cmd;
        self
    }

    pub fn with_env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = mode.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Value of an env var set on this spec.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Whether the container is cut off from every network.
    pub fn network_disabled(&self) -> bool {
        self.network_mode == "none"
    }
}

/// Container state as reported by the runtime after it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerState {
    pub running: bool,
    pub exit_code: Option<i64>,
    /// Whether the kernel OOM killer ended the process.
    pub oom_killed: bool,
}

/// One resource usage sample.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Working-set memory in megabytes (page cache excluded).
    pub memory_mb: u64,
}

/// Minimal capability interface over a container runtime daemon.
///
/// Every method may be called concurrently for different containers.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Checks that the daemon responds.
    async fn ping(&self) -> Result<(), RuntimeError>;

    /// Whether the image is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError>;

    /// Pulls an image, returning once the pull finished.
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Creates a container and returns its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Waits until the container stops and returns its exit code.
    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError>;

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError>;

    /// Takes one resource usage sample.
    async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError>;

    /// Follows the container's output until it stops, keeping at most `cap`
    /// bytes per stream.
    async fn stream_output(&self, id: &str, cap: usize) -> Result<CapturedOutput, RuntimeError>;

    /// Sends SIGKILL.
    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Force-removes the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_spec_builder() {
        let spec = ContainerSpec::new("sub-1", "python:3.12-slim")
            .with_cmd(vec!["sh".into(), "-c".into(), "true".into()])
            .with_env(vec!["SOURCE_B64=cHJpbnQoMSk=".into(), "A=b=c".into()])
            .with_label(LABEL_SUBMISSION_ID, "sub-1");

        assert_eq!(spec.working_dir, "/scratch");
        assert!(spec.network_disabled());
        assert_eq!(spec.cmd.len(), 3);
        assert_eq!(spec.env_value("SOURCE_B64"), Some("cHJpbnQoMSk="));
        assert_eq!(spec.env_value("A"), Some("b=c"));
        assert_eq!(spec.env_value("MISSING"), None);
        assert_eq!(spec.labels.get(LABEL_SUBMISSION_ID).map(String::as_str), Some("sub-1"));
    }

    #[test]
    fn test_whitelisted_network() {
        let spec = ContainerSpec::new("sub-2", "node:20-alpine").with_network_mode("grading-net");
        assert!(!spec.network_disabled());
    }
}
