//! Error types for solution-runner operations.
//!
//! Defines the error taxonomy shared by every subsystem:
//! - Container runtime (daemon) interactions
//! - Admission decisions, returned synchronously to callers
//! - Infrastructure faults, surfaced only through a terminal `FAILED` result
//! - Consistency faults, which indicate a broken internal invariant

use thiserror::Error;

/// Errors returned by a container runtime client.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Container runtime daemon not available: {0}")]
    DaemonUnavailable(String),

    #[error("Image '{0}' not found")]
    ImageNotFound(String),

    #[error("Failed to pull image '{image}': {reason}")]
    PullFailed { image: String, reason: String },

    #[error("Container '{id}' not found")]
    ContainerNotFound { id: String },

    #[error("Container runtime rejected request ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to read container output: {0}")]
    Output(String),
}

impl RuntimeError {
    /// Whether retrying the same call later may succeed.
    ///
    /// The daemon being unreachable (e.g. still warming up) and server-side
    /// 5xx responses are transient; client errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::DaemonUnavailable(_) => true,
            RuntimeError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Whether the daemon could not be reached at all.
    pub fn is_daemon_unreachable(&self) -> bool {
        matches!(self, RuntimeError::DaemonUnavailable(_))
    }
}

/// Reasons a submission is refused before it consumes any resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Capacity exceeded: {admitted}/{max_concurrent} running, {requested_mb} MB requested with {available_mb} MB available")]
    CapacityExceeded {
        admitted: usize,
        max_concurrent: usize,
        requested_mb: u64,
        available_mb: u64,
    },

    #[error("Unsupported language '{0}'")]
    UnsupportedLanguage(String),

    #[error("Payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid constraints: {0}")]
    InvalidConstraints(String),

    #[error("Network '{0}' is not whitelisted")]
    NetworkNotAllowed(String),
}

impl AdmissionError {
    /// Short machine-readable reason, used as a metric label and in API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            AdmissionError::CapacityExceeded { .. } => "capacity_exceeded",
            AdmissionError::UnsupportedLanguage(_) => "unsupported_language",
            AdmissionError::PayloadTooLarge { .. } => "payload_too_large",
            AdmissionError::InvalidConstraints(_) => "invalid_constraints",
            AdmissionError::NetworkNotAllowed(_) => "network_not_allowed",
        }
    }
}

/// Infrastructure failures. These end a submission as `FAILED` and are never
/// attributed to the submitted code.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfrastructureFault {
    #[error("Container runtime daemon unreachable: {0}")]
    DaemonUnreachable(String),

    #[error("Image pull failed for '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Container creation failed after {attempts} attempts: {reason}")]
    ContainerCreateFailed { attempts: u32, reason: String },

    #[error("Container start failed: {0}")]
    ContainerStartFailed(String),

    #[error("Output collection failed: {0}")]
    OutputCollectionFailed(String),
}

impl InfrastructureFault {
    /// Classifies a runtime error raised while the container was in use.
    pub fn from_runtime(err: &RuntimeError) -> Self {
        if err.is_daemon_unreachable() {
            InfrastructureFault::DaemonUnreachable(err.to_string())
        } else {
            InfrastructureFault::OutputCollectionFailed(err.to_string())
        }
    }
}

/// Violations of internal invariants. Always a programming error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConsistencyFault {
    #[error("Admission token {token} released twice")]
    DoubleRelease { token: u64 },

    #[error("Admission token {token} was never issued by this governor")]
    UnknownToken { token: u64 },

    #[error("Result for submission {submission_id} already delivered")]
    ResultAlreadyDelivered { submission_id: String },

    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RuntimeError::DaemonUnavailable("warming up".into()).is_transient());
        assert!(RuntimeError::Api {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!RuntimeError::Api {
            status: 400,
            message: "bad config".into()
        }
        .is_transient());
        assert!(!RuntimeError::ImageNotFound("python:3.12".into()).is_transient());
    }

    #[test]
    fn test_admission_error_kind() {
        let err = AdmissionError::CapacityExceeded {
            admitted: 4,
            max_concurrent: 4,
            requested_mb: 128,
            available_mb: 0,
        };
        assert_eq!(err.kind(), "capacity_exceeded");
        assert!(err.to_string().contains("4/4"));

        let err = AdmissionError::UnsupportedLanguage("cobol".into());
        assert_eq!(err.kind(), "unsupported_language");
        assert!(err.to_string().contains("cobol"));
    }

    #[test]
    fn test_fault_from_runtime() {
        let fault =
            InfrastructureFault::from_runtime(&RuntimeError::DaemonUnavailable("refused".into()));
        assert!(matches!(fault, InfrastructureFault::DaemonUnreachable(_)));

        let fault = InfrastructureFault::from_runtime(&RuntimeError::Output("eof".into()));
        assert!(matches!(fault, InfrastructureFault::OutputCollectionFailed(_)));
    }

    #[test]
    fn test_consistency_fault_display() {
        let fault = ConsistencyFault::DoubleRelease { token: 7 };
        assert!(fault.to_string().contains("released twice"));
    }
}
