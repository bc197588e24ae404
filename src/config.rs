//! Runner configuration.
//!
//! A single immutable [`RunnerConfig`] is built once at process start (usually
//! with [`RunnerConfig::from_env`]) and shared by reference with every
//! component. Nothing else in the crate reads the process environment.

use std::time::Duration;

use thiserror::Error;

use crate::policy::BackoffPolicy;

/// Largest env var value the kernel accepts for a single string (MAX_ARG_STRLEN).
const MAX_ENV_VALUE_BYTES: usize = 128 * 1024;

/// Errors that can occur while building the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the execution service.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    // Runtime daemon
    /// Daemon address (`unix:///var/run/docker.sock`, `tcp://host:2375`).
    /// `None` connects to the local default socket.
    pub docker_host: Option<String>,

    // HTTP surface
    /// Address the HTTP API binds to.
    pub bind_addr: String,

    // Admission
    /// Maximum number of concurrently admitted submissions.
    pub max_concurrent: usize,
    /// Ceiling on the sum of admitted `memory_mb`.
    pub aggregate_memory_mb: u64,

    // Per-submission limits
    /// Time limit applied when a submission does not specify one.
    pub default_time_limit_secs: u64,
    /// Largest time limit a submission may request.
    pub max_time_limit_secs: u64,
    /// Memory limit applied when a submission does not specify one.
    pub default_memory_mb: u64,
    /// Largest memory limit a submission may request.
    pub max_memory_mb: u64,
    /// CPU cores granted to each container.
    pub cpu_cores: f64,
    /// Maximum processes inside each container.
    pub pids_limit: i64,
    /// Size of the writable scratch tmpfs.
    pub scratch_size_mb: u64,
    /// Largest accepted payload.
    pub max_payload_bytes: usize,
    /// Cap applied separately to stdout and stderr.
    pub output_cap_bytes: usize,
    /// Networks a submission may request besides `none`.
    pub network_whitelist: Vec<String>,

    // Retries
    /// Attempts for container creation before giving up.
    pub create_retries: u32,
    /// Backoff between container creation attempts.
    pub create_backoff: BackoffPolicy,
    /// Attempts for container removal.
    pub cleanup_retries: u32,
    /// Backoff applied to failed image pulls.
    pub pull_backoff: BackoffPolicy,
    /// Longest a submission waits for its image.
    pub pull_timeout: Duration,

    // Supervision
    /// Interval between memory samples.
    pub stats_interval: Duration,
    /// Longest output collection may take after the process exits.
    pub collect_timeout: Duration,

    // Retention
    /// How long an unacknowledged terminal result is kept.
    pub result_retention: Duration,
    /// Interval between retention sweeps.
    pub janitor_interval: Duration,

    // Health
    /// Interval between daemon health probes.
    pub health_interval: Duration,
    /// Consecutive probe failures before the daemon is declared unhealthy.
    pub health_retries: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            docker_host: None,
            bind_addr: "0.0.0.0:8080".to_string(),

            max_concurrent: 8,
            aggregate_memory_mb: 4096,

            default_time_limit_secs: 10,
            max_time_limit_secs: 60,
            default_memory_mb: 128,
            max_memory_mb: 1024,
            cpu_cores: 1.0,
            pids_limit: 64,
            scratch_size_mb: 64,
            max_payload_bytes: 64 * 1024,
            output_cap_bytes: 64 * 1024,
            network_whitelist: Vec::new(),

            create_retries: 3,
            create_backoff: BackoffPolicy::new(Duration::from_millis(200), Duration::from_secs(5)),
            cleanup_retries: 3,
            pull_backoff: BackoffPolicy::new(Duration::from_secs(5), Duration::from_secs(300)),
            pull_timeout: Duration::from_secs(300),

            stats_interval: Duration::from_millis(250),
            collect_timeout: Duration::from_secs(5),

            result_retention: Duration::from_secs(600),
            janitor_interval: Duration::from_secs(30),

            health_interval: Duration::from_secs(5),
            health_retries: 3,
        }
    }
}

impl RunnerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RUNNER_DOCKER_HOST`: daemon address (default: local socket)
    /// - `RUNNER_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
    /// - `RUNNER_MAX_CONCURRENT`: concurrency ceiling (default: 8)
    /// - `RUNNER_AGGREGATE_MEMORY_MB`: aggregate memory ceiling (default: 4096)
    /// - `RUNNER_DEFAULT_TIME_LIMIT_SECS` / `RUNNER_MAX_TIME_LIMIT_SECS` (default: 10 / 60)
    /// - `RUNNER_DEFAULT_MEMORY_MB` / `RUNNER_MAX_MEMORY_MB` (default: 128 / 1024)
    /// - `RUNNER_CPU_CORES`: cores per container (default: 1.0)
    /// - `RUNNER_PIDS_LIMIT`: processes per container (default: 64)
    /// - `RUNNER_SCRATCH_SIZE_MB`: scratch tmpfs size (default: 64)
    /// - `RUNNER_MAX_PAYLOAD_BYTES`: payload cap (default: 65536)
    /// - `RUNNER_OUTPUT_CAP_BYTES`: stdout/stderr cap (default: 65536)
    /// - `RUNNER_NETWORK_WHITELIST`: comma-separated network names (default: empty)
    /// - `RUNNER_CREATE_RETRIES` / `RUNNER_CREATE_BACKOFF_MS` (default: 3 / 200)
    /// - `RUNNER_CLEANUP_RETRIES` (default: 3)
    /// - `RUNNER_PULL_BACKOFF_SECS` / `RUNNER_PULL_BACKOFF_MAX_SECS` (default: 5 / 300)
    /// - `RUNNER_PULL_TIMEOUT_SECS` (default: 300)
    /// - `RUNNER_STATS_INTERVAL_MS` (default: 250)
    /// - `RUNNER_COLLECT_TIMEOUT_SECS` (default: 5)
    /// - `RUNNER_RESULT_RETENTION_SECS` / `RUNNER_JANITOR_INTERVAL_SECS` (default: 600 / 30)
    /// - `RUNNER_HEALTH_INTERVAL_SECS` / `RUNNER_HEALTH_RETRIES` (default: 5 / 3)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    ///
    /// Used by [`RunnerConfig::from_env`]; tests pass a map instead of touching
    /// the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("RUNNER_DOCKER_HOST") {
            if !val.trim().is_empty() {
                config.docker_host = Some(val.trim().to_string());
            }
        }

        if let Some(val) = lookup("RUNNER_BIND_ADDR") {
            config.bind_addr = val;
        }

        // Admission
        if let Some(val) = lookup("RUNNER_MAX_CONCURRENT") {
            config.max_concurrent = parse_env_value(&val, "RUNNER_MAX_CONCURRENT")?;
        }

        if let Some(val) = lookup("RUNNER_AGGREGATE_MEMORY_MB") {
            config.aggregate_memory_mb = parse_env_value(&val, "RUNNER_AGGREGATE_MEMORY_MB")?;
        }

        // Per-submission limits
        if let Some(val) = lookup("RUNNER_DEFAULT_TIME_LIMIT_SECS") {
            config.default_time_limit_secs =
                parse_env_value(&val, "RUNNER_DEFAULT_TIME_LIMIT_SECS")?;
        }

        if let Some(val) = lookup("RUNNER_MAX_TIME_LIMIT_SECS") {
            config.max_time_limit_secs = parse_env_value(&val, "RUNNER_MAX_TIME_LIMIT_SECS")?;
        }

        if let Some(val) = lookup("RUNNER_DEFAULT_MEMORY_MB") {
            config.default_memory_mb = parse_env_value(&val, "RUNNER_DEFAULT_MEMORY_MB")?;
        }

        if let Some(val) = lookup("RUNNER_MAX_MEMORY_MB") {
            config.max_memory_mb = parse_env_value(&val, "RUNNER_MAX_MEMORY_MB")?;
        }

        if let Some(val) = lookup("RUNNER_CPU_CORES") {
            config.cpu_cores = parse_env_value(&val, "RUNNER_CPU_CORES")?;
        }

        if let Some(val) = lookup("RUNNER_PIDS_LIMIT") {
            config.pids_limit = parse_env_value(&val, "RUNNER_PIDS_LIMIT")?;
        }

        if let Some(val) = lookup("RUNNER_SCRATCH_SIZE_MB") {
            config.scratch_size_mb = parse_env_value(&val, "RUNNER_SCRATCH_SIZE_MB")?;
        }

        if let Some(val) = lookup("RUNNER_MAX_PAYLOAD_BYTES") {
            config.max_payload_bytes = parse_env_value(&val, "RUNNER_MAX_PAYLOAD_BYTES")?;
        }

        if let Some(val) = lookup("RUNNER_OUTPUT_CAP_BYTES") {
            config.output_cap_bytes = parse_env_value(&val, "RUNNER_OUTPUT_CAP_BYTES")?;
        }

        if let Some(val) = lookup("RUNNER_NETWORK_WHITELIST") {
            config.network_whitelist = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Retries
        if let Some(val) = lookup("RUNNER_CREATE_RETRIES") {
            config.create_retries = parse_env_value(&val, "RUNNER_CREATE_RETRIES")?;
        }

        if let Some(val) = lookup("RUNNER_CREATE_BACKOFF_MS") {
            let ms: u64 = parse_env_value(&val, "RUNNER_CREATE_BACKOFF_MS")?;
            config.create_backoff.first = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("RUNNER_CLEANUP_RETRIES") {
            config.cleanup_retries = parse_env_value(&val, "RUNNER_CLEANUP_RETRIES")?;
        }

        if let Some(val) = lookup("RUNNER_PULL_BACKOFF_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_PULL_BACKOFF_SECS")?;
            config.pull_backoff.first = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RUNNER_PULL_BACKOFF_MAX_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_PULL_BACKOFF_MAX_SECS")?;
            config.pull_backoff.max = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RUNNER_PULL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_PULL_TIMEOUT_SECS")?;
            config.pull_timeout = Duration::from_secs(secs);
        }

        // Supervision
        if let Some(val) = lookup("RUNNER_STATS_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "RUNNER_STATS_INTERVAL_MS")?;
            config.stats_interval = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("RUNNER_COLLECT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_COLLECT_TIMEOUT_SECS")?;
            config.collect_timeout = Duration::from_secs(secs);
        }

        // Retention
        if let Some(val) = lookup("RUNNER_RESULT_RETENTION_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_RESULT_RETENTION_SECS")?;
            config.result_retention = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RUNNER_JANITOR_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_JANITOR_INTERVAL_SECS")?;
            config.janitor_interval = Duration::from_secs(secs);
        }

        // Health
        if let Some(val) = lookup("RUNNER_HEALTH_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "RUNNER_HEALTH_INTERVAL_SECS")?;
            config.health_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RUNNER_HEALTH_RETRIES") {
            config.health_retries = parse_env_value(&val, "RUNNER_HEALTH_RETRIES")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.aggregate_memory_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "aggregate_memory_mb must be greater than 0".to_string(),
            ));
        }

        if self.default_time_limit_secs == 0 || self.max_time_limit_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "time limits must be greater than 0".to_string(),
            ));
        }

        if self.default_time_limit_secs > self.max_time_limit_secs {
            return Err(ConfigError::ValidationFailed(
                "default_time_limit_secs cannot exceed max_time_limit_secs".to_string(),
            ));
        }

        if self.default_memory_mb == 0 || self.max_memory_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "memory limits must be greater than 0".to_string(),
            ));
        }

        if self.default_memory_mb > self.max_memory_mb {
            return Err(ConfigError::ValidationFailed(
                "default_memory_mb cannot exceed max_memory_mb".to_string(),
            ));
        }

        if self.max_memory_mb > self.aggregate_memory_mb {
            return Err(ConfigError::ValidationFailed(
                "max_memory_mb cannot exceed aggregate_memory_mb".to_string(),
            ));
        }

        if self.cpu_cores <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "cpu_cores must be greater than 0".to_string(),
            ));
        }

        if self.pids_limit <= 0 {
            return Err(ConfigError::ValidationFailed(
                "pids_limit must be greater than 0".to_string(),
            ));
        }

        if self.max_payload_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_payload_bytes must be greater than 0".to_string(),
            ));
        }

        // Payloads travel base64-encoded in a single env var.
        if encoded_len(self.max_payload_bytes) + 64 > MAX_ENV_VALUE_BYTES {
            return Err(ConfigError::ValidationFailed(format!(
                "max_payload_bytes must be at most {} bytes",
                (MAX_ENV_VALUE_BYTES - 64) / 4 * 3
            )));
        }

        if self.output_cap_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "output_cap_bytes must be greater than 0".to_string(),
            ));
        }

        if self.create_retries == 0 {
            return Err(ConfigError::ValidationFailed(
                "create_retries must be at least 1".to_string(),
            ));
        }

        if self.stats_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stats_interval must be greater than 0".to_string(),
            ));
        }

        if self.janitor_interval.is_zero() || self.health_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "background intervals must be greater than 0".to_string(),
            ));
        }

        if self.network_whitelist.iter().any(|n| n == "host") {
            return Err(ConfigError::ValidationFailed(
                "the host network cannot be whitelisted".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether a submission may join the given network.
    pub fn network_allowed(&self, network: &str) -> bool {
        network == "none" || self.network_whitelist.iter().any(|n| n == network)
    }

    /// Sets the daemon address.
    pub fn with_docker_host(mut self, host: impl Into<String>) -> Self {
        self.docker_host = Some(host.into());
        self
    }

    /// Sets the HTTP bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Sets the concurrency ceiling.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the aggregate memory ceiling.
    pub fn with_aggregate_memory_mb(mut self, mb: u64) -> Self {
        self.aggregate_memory_mb = mb;
        self
    }

    /// Sets default and maximum time limits.
    pub fn with_time_limits(mut self, default_secs: u64, max_secs: u64) -> Self {
        self.default_time_limit_secs = default_secs;
        self.max_time_limit_secs = max_secs;
        self
    }

    /// Sets default and maximum memory limits.
    pub fn with_memory_limits(mut self, default_mb: u64, max_mb: u64) -> Self {
        self.default_memory_mb = default_mb;
        self.max_memory_mb = max_mb;
        self
    }

    /// Sets the payload cap.
    pub fn with_max_payload_bytes(mut self, bytes: usize) -> Self {
        self.max_payload_bytes = bytes;
        self
    }

    /// Sets the stdout/stderr cap.
    pub fn with_output_cap_bytes(mut self, bytes: usize) -> Self {
        self.output_cap_bytes = bytes;
        self
    }

    /// Sets the network whitelist.
    pub fn with_network_whitelist(mut self, networks: Vec<String>) -> Self {
        self.network_whitelist = networks;
        self
    }

    /// Sets container creation retries and backoff.
    pub fn with_create_retries(mut self, retries: u32, backoff: BackoffPolicy) -> Self {
        self.create_retries = retries;
        self.create_backoff = backoff;
        self
    }

    /// Sets the image pull backoff.
    pub fn with_pull_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.pull_backoff = backoff;
        self
    }

    /// Sets the memory sampling interval.
    pub fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Sets the output collection timeout.
    pub fn with_collect_timeout(mut self, timeout: Duration) -> Self {
        self.collect_timeout = timeout;
        self
    }

    /// Sets result retention.
    pub fn with_result_retention(mut self, retention: Duration) -> Self {
        self.result_retention = retention;
        self
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Length of the base64 encoding of `len` bytes.
fn encoded_len(len: usize) -> usize {
    len.div_ceil(3) * 4
}
