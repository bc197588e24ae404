//! solution-runner: run untrusted code submissions in ephemeral,
//! resource-capped containers.
//!
//! The library is organised around an [`ExecutionBroker`] that admits
//! submissions through a [`ResourceGovernor`], supervises each run with a
//! [`Watchdog`], and delivers exactly one [`ExecutionResult`] per admitted
//! submission. The container daemon sits behind the [`RuntimeClient`] trait.

pub mod api;
pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod execution;
pub mod governor;
pub mod health;
pub mod images;
pub mod metrics;
pub mod policy;
pub mod watchdog;

pub use broker::{
    ExecutionBroker, ExecutionResult, Rejection, SubmissionId, SubmissionStatus, SubmitRequest,
};
pub use client::{ClientError, RunnerClient};
pub use config::{ConfigError, RunnerConfig};
pub use error::{AdmissionError, ConsistencyFault, InfrastructureFault, RuntimeError};
pub use execution::{DockerClient, Language, RuntimeClient};
pub use governor::{AdmissionToken, ResourceGovernor};
pub use health::HealthMonitor;
pub use policy::BackoffPolicy;
pub use watchdog::Watchdog;
