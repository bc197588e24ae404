//! Host-enforced resource limits for submission containers.

use serde::{Deserialize, Serialize};

use crate::config::RunnerConfig;

/// Smallest memory limit the runtime accepts for a container.
pub const MIN_HOST_MEMORY_MB: u64 = 6;

/// Resource limits passed to the runtime when a container is created.
///
/// These are enforced by the kernel through the runtime, not advisory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionLimits {
    /// Memory the submission asked for, in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub pids_limit: i64,
    /// Size of the writable scratch tmpfs in megabytes.
    pub scratch_mb: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 128,
            cpu_cores: 1.0,
            pids_limit: 64,
            scratch_mb: 64,
        }
    }
}

impl ExecutionLimits {
    /// Limits for a submission that asked for `memory_mb`, with the remaining
    /// values taken from configuration.
    pub fn for_submission(config: &RunnerConfig, memory_mb: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores: config.cpu_cores,
            pids_limit: config.pids_limit,
            scratch_mb: config.scratch_size_mb,
        }
    }

    /// Memory limit handed to the runtime, in bytes.
    ///
    /// Raised to [`MIN_HOST_MEMORY_MB`] because the runtime refuses anything
    /// smaller. Watchdog sampling still compares against `memory_mb`.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb.max(MIN_HOST_MEMORY_MB) * 1024 * 1024) as i64
    }

    /// Memory plus swap; equal to `memory_bytes` so no swap is available.
    pub fn memory_swap_bytes(&self) -> i64 {
        self.memory_bytes()
    }

    /// CPU limit in units of 1e-9 CPUs.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_cores * 1_000_000_000.0) as i64
    }

    /// Mount options for the scratch tmpfs.
    pub fn scratch_mount_options(&self) -> String {
        format!("rw,exec,nosuid,size={}m", self.scratch_mb)
    }
}
