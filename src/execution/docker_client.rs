//! Docker implementation of [`RuntimeClient`] using the bollard crate.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions, LogOutput,
    LogsOptions, MemoryStatsStats, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::{Docker, API_DEFAULT_VERSION};
use futures::StreamExt;
use tracing::debug;

use crate::error::RuntimeError;
use crate::execution::language::SCRATCH_DIR;
use crate::execution::output::{CapturedOutput, OutputCapture, StreamKind};
use crate::execution::runtime::{ContainerSpec, ContainerState, ResourceStats, RuntimeClient};

/// Seconds bollard waits for a single daemon request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Docker client wrapper for container operations.
#[derive(Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Creates a new Docker client connecting to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::DaemonUnavailable` if the client cannot be built.
    /// Reachability is only known after [`RuntimeClient::ping`].
    pub fn new() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Connects to an explicit daemon address (`unix://...`, `tcp://...`,
    /// `http://...`), or the local default when `host` is `None`.
    pub fn connect(host: Option<&str>) -> Result<Self, RuntimeError> {
        let docker = match host {
            None => return Self::new(),
            Some(addr) if addr.starts_with("unix://") || addr.starts_with('/') => {
                Docker::connect_with_unix(addr, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            }
            Some(addr) => Docker::connect_with_http(addr, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION),
        }
        .map_err(|e| RuntimeError::DaemonUnavailable(format!("Failed to connect: {e}")))?;

        Ok(Self { docker })
    }

    /// Creates a new Docker client from an existing bollard Docker instance.
    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Translates a spec into the daemon's create request.
///
/// Root is read-only; the only writable path is a tmpfs at [`SCRATCH_DIR`].
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut tmpfs = HashMap::new();
    tmpfs.insert(SCRATCH_DIR.to_string(), spec.limits.scratch_mount_options());

    let host_config = HostConfig {
        memory: Some(spec.limits.memory_bytes()),
        memory_swap: Some(spec.limits.memory_swap_bytes()),
        nano_cpus: Some(spec.limits.nano_cpus()),
        pids_limit: Some(spec.limits.pids_limit),
        network_mode: Some(spec.network_mode.clone()),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(spec.labels.clone()),
        network_disabled: Some(spec.network_disabled()),
        host_config: Some(host_config),
        tty: Some(false),
        attach_stdin: Some(false),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

/// Maps a bollard error onto the runtime taxonomy.
///
/// Anything that is not a structured daemon response is treated as the daemon
/// being unreachable.
fn map_err(err: BollardError) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::DaemonUnavailable(other.to_string()),
    }
}

fn is_status(err: &BollardError, status: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == status)
}

#[async_trait]
impl RuntimeClient for DockerClient {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker.ping().await.map_err(map_err)?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, RuntimeError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) if is_status(&e, 404) => {
                    return Err(RuntimeError::ImageNotFound(image.to_string()));
                }
                Err(e) => {
                    return Err(RuntimeError::PullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    RuntimeError::ImageNotFound(spec.image.clone())
                } else {
                    map_err(e)
                }
            })?;

        for warning in &response.warnings {
            debug!(container = %spec.name, warning = %warning, "Create warning");
        }

        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    RuntimeError::ContainerNotFound { id: id.to_string() }
                } else {
                    map_err(e)
                }
            })
    }

    async fn wait_container(&self, id: &str) -> Result<i64, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.docker.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) if is_status(&e, 404) => Err(RuntimeError::ContainerNotFound {
                id: id.to_string(),
            }),
            Some(Err(e)) => Err(map_err(e)),
            None => {
                let state = self.inspect_container(id).await?;
                state.exit_code.ok_or_else(|| RuntimeError::Api {
                    status: 500,
                    message: format!("container {id} stopped without an exit code"),
                })
            }
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|e| {
                if is_status(&e, 404) {
                    RuntimeError::ContainerNotFound { id: id.to_string() }
                } else {
                    map_err(e)
                }
            })?;

        let state = info.state.unwrap_or_default();

        Ok(ContainerState {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            oom_killed: state.oom_killed.unwrap_or(false),
        })
    }

    async fn stats(&self, id: &str) -> Result<ResourceStats, RuntimeError> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.docker.stats(id, Some(options));

        let stats = match stream.next().await {
            Some(Ok(stats)) => stats,
            Some(Err(e)) if is_status(&e, 404) => {
                return Err(RuntimeError::ContainerNotFound { id: id.to_string() })
            }
            Some(Err(e)) => return Err(map_err(e)),
            None => return Ok(ResourceStats::default()),
        };

        let usage = stats.memory_stats.usage.unwrap_or(0);
        let inactive_file = match stats.memory_stats.stats {
            Some(MemoryStatsStats::V1(v1)) => v1.total_inactive_file,
            Some(MemoryStatsStats::V2(v2)) => v2.inactive_file,
            None => 0,
        };
        let working_set = usage.saturating_sub(inactive_file);

        Ok(ResourceStats {
            memory_mb: working_set / (1024 * 1024),
        })
    }

    async fn stream_output(&self, id: &str, cap: usize) -> Result<CapturedOutput, RuntimeError> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            timestamps: false,
            ..Default::default()
        };

        let mut logs = self.docker.logs(id, Some(options));
        let mut capture = OutputCapture::new(cap);

        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    capture.push(StreamKind::Stdout, &message);
                }
                Ok(LogOutput::StdErr { message }) => {
                    capture.push(StreamKind::Stderr, &message);
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    return Err(RuntimeError::Output(format!("Error reading logs: {e}")));
                }
            }

            if capture.is_full() {
                break;
            }
        }

        Ok(capture.finish())
    }

    async fn kill_container(&self, id: &str) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) if is_status(&e, 404) => {
                Err(RuntimeError::ContainerNotFound { id: id.to_string() })
            }
            Err(e) => Err(map_err(e)),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone.
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }
}
