//! Command-line interface for solution-runner.
//!
//! Provides commands to serve the HTTP API, run a single file locally, and
//! talk to a running service.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
