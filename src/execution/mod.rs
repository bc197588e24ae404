//! Container execution layer.
//!
//! [`RuntimeClient`] is the capability the rest of the crate depends on;
//! [`DockerClient`] implements it with bollard.
//!
//! # Example
//!
//! ```ignore
//! use solution_runner::execution::{ContainerSpec, DockerClient, Language, RuntimeClient};
//!
//! let client = DockerClient::new()?;
//! let lang = Language::Python;
//!
//! let spec = ContainerSpec::new("sub-123", lang.image()).with_cmd(lang.entrypoint());
//! let id = client.create_container(&spec).await?;
//! client.start_container(&id).await?;
//! let exit_code = client.wait_container(&id).await?;
//! client.remove_container(&id).await?;
//! ```

pub mod docker_client;
pub mod language;
pub mod output;
pub mod resources;
pub mod runtime;

pub use docker_client::DockerClient;
pub use language::{Language, LanguageProfile, PAYLOAD_ENV, SCRATCH_DIR};
pub use output::{CapturedOutput, OutputCapture, StreamKind};
pub use resources::{ExecutionLimits, MIN_HOST_MEMORY_MB};
pub use runtime::{
    ContainerSpec, ContainerState, ResourceStats, RuntimeClient, LABEL_SUBMISSION_ID,
    LABEL_TASK_ID,
};
