//! CLI command definitions for solution-runner.

use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use crate::api::{self, AppState};
use crate::broker::{ExecutionBroker, SubmitRequest};
use crate::client::RunnerClient;
use crate::config::RunnerConfig;
use crate::execution::{DockerClient, Language, RuntimeClient};
use crate::health::HealthMonitor;
use crate::metrics::init_metrics;

/// Default URL of a running service, for `submit` and `health`.
const DEFAULT_URL: &str = "http://localhost:8080";

/// Runs untrusted code submissions in ephemeral, resource-capped containers.
#[derive(Parser)]
#[command(name = "solution-runner")]
#[command(about = "Run code submissions in ephemeral, resource-capped containers")]
#[command(version)]
#[command(
    long_about = "solution-runner executes untrusted code submissions in short-lived containers with hard time and memory limits, and reports exactly one result per submission.\n\nConfiguration is read from RUNNER_* environment variables.\n\nExample usage:\n  solution-runner serve\n  solution-runner run solution.py\n  solution-runner submit solution.py --url http://runner:8080 --time-limit 5"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the HTTP service.
    Serve(ServeArgs),

    /// Execute one local file against the local container daemon and print the result.
    Run(RunArgs),

    /// Send one local file to a running service and wait for the result.
    Submit(SubmitArgs),

    /// Query the health of a running service.
    Health(HealthArgs),
}

/// Arguments for `solution-runner serve`.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Address to listen on. Overrides RUNNER_BIND_ADDR.
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Container daemon address. Overrides RUNNER_DOCKER_HOST.
    #[arg(long)]
    pub docker_host: Option<String>,
}

/// Submission options shared by `run` and `submit`.
#[derive(Parser, Debug, Clone)]
pub struct SourceArgs {
    /// Source file to execute.
    pub file: String,

    /// Language of the file. Inferred from the extension when omitted.
    #[arg(short = 'L', long)]
    pub language: Option<String>,

    /// Wall-clock limit in seconds.
    #[arg(short, long)]
    pub time_limit: Option<u64>,

    /// Memory limit in megabytes.
    #[arg(short, long)]
    pub memory_mb: Option<u64>,

    /// Task identifier to attach to the submission.
    #[arg(long)]
    pub task_id: Option<String>,
}

/// Arguments for `solution-runner run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Container daemon address. Overrides RUNNER_DOCKER_HOST.
    #[arg(long)]
    pub docker_host: Option<String>,
}

/// Arguments for `solution-runner submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Base URL of the service.
    #[arg(short, long, default_value = DEFAULT_URL, env = "RUNNER_URL")]
    pub url: String,
}

/// Arguments for `solution-runner health`.
#[derive(Parser, Debug)]
pub struct HealthArgs {
    /// Base URL of the service.
    #[arg(short, long, default_value = DEFAULT_URL, env = "RUNNER_URL")]
    pub url: String,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse CLI arguments and run the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(args).await,
        Commands::Run(args) => run_run_command(args).await,
        Commands::Submit(args) => run_submit_command(args).await,
        Commands::Health(args) => run_health_command(args).await,
    }
}

// ============================================================================
// Local service
// ============================================================================

fn load_config(docker_host: Option<String>) -> anyhow::Result<RunnerConfig> {
    let mut config = RunnerConfig::from_env().context("Invalid RUNNER_* configuration")?;
    if let Some(host) = docker_host {
        config = config.with_docker_host(host);
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn connect(config: &RunnerConfig) -> anyhow::Result<Arc<dyn RuntimeClient>> {
    let client = DockerClient::connect(config.docker_host.as_deref())
        .context("Failed to connect to the container daemon")?;
    Ok(Arc::new(client))
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.docker_host)?;
    if let Some(bind) = args.bind {
        config = config.with_bind_addr(bind);
    }

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics registration failed, continuing without metrics");
    }

    let runtime = connect(&config)?;
    let config = Arc::new(config);

    let health = Arc::new(HealthMonitor::new(
        Arc::clone(&runtime),
        config.health_interval,
        config.health_retries,
    ));
    let health_task = health.spawn();

    let broker = ExecutionBroker::new(Arc::clone(&config), runtime);
    let janitor = broker.spawn_janitor();

    info!(
        bind = %config.bind_addr,
        max_concurrent = config.max_concurrent,
        aggregate_memory_mb = config.aggregate_memory_mb,
        "Starting solution-runner"
    );

    let served = api::serve(AppState::new(broker, health), &config.bind_addr).await;

    health_task.abort();
    janitor.abort();
    served.with_context(|| format!("HTTP server on {} failed", config.bind_addr))
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.docker_host)?;
    let runtime = connect(&config)?;
    runtime
        .ping()
        .await
        .context("Container daemon is not reachable")?;

    let request = build_request(&args.source)?;
    let broker = ExecutionBroker::new(Arc::new(config), runtime);

    let id = broker.submit(request)?;
    info!(submission_id = %id, "Submitted");

    let result = broker.wait_result(&id).await?;
    // The container is removed after the result is recorded; give cleanup a
    // chance to finish before the process exits.
    while broker.governor_snapshot().admitted > 0 {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

// ============================================================================
// Remote service
// ============================================================================

async fn run_submit_command(args: SubmitArgs) -> anyhow::Result<()> {
    let request = build_request(&args.source)?;
    let client = RunnerClient::new(&args.url)?;

    let result = client.run(&request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_health_command(args: HealthArgs) -> anyhow::Result<()> {
    let client = RunnerClient::new(&args.url)?;
    let health = client.health().await?;

    println!("{}", serde_json::to_string_pretty(&health.health)?);
    if !health.health.ready {
        bail!("Service at {} is not ready ({})", args.url, health.status);
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Builds a submit request from a source file.
fn build_request(args: &SourceArgs) -> anyhow::Result<SubmitRequest> {
    let path = Path::new(&args.file);
    let payload = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let language = match &args.language {
        Some(language) => language.clone(),
        None => language_from_path(path)
            .with_context(|| {
                format!(
                    "Cannot infer the language of {}; pass --language",
                    path.display()
                )
            })?
            .to_string(),
    };

    let mut request = SubmitRequest::new(language, payload);
    if let Some(task_id) = &args.task_id {
        request = request.with_task_id(task_id.clone());
    }
    if let Some(secs) = args.time_limit {
        request = request.with_time_limit(secs);
    }
    if let Some(mb) = args.memory_mb {
        request = request.with_memory_mb(mb);
    }
    Ok(request)
}

/// Maps a file extension to a supported language.
fn language_from_path(path: &Path) -> Option<Language> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "py" => Some(Language::Python),
        "js" | "mjs" => Some(Language::JavaScript),
        "rb" => Some(Language::Ruby),
        "sh" | "bash" => Some(Language::Bash),
        "go" => Some(Language::Go),
        "cpp" | "cc" | "cxx" => Some(Language::Cpp),
        _ => None,
    }
}
