use core::error::Error;

use error_stack::Report;

/// Errors that can occur while talking to the control plane.
#[derive(Debug, derive_more::Display)]
pub enum ClusterError {
    #[display("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },
    #[display("{kind} {name} already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[display("conflicting update to {kind} {name}")]
    Conflict { kind: &'static str, name: String },
    #[display("Kubernetes API request failed: {message}")]
    Api { message: String },
    #[display("Failed to watch {kind}: {message}")]
    Watch { kind: &'static str, message: String },
    #[display("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[display("Failed to serialize {kind}: {message}")]
    Serialization { kind: &'static str, message: String },
}

impl Error for ClusterError {}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Returns true when the report's current context says the object is gone.
pub fn is_not_found(report: &Report<ClusterError>) -> bool {
    report.current_context().is_not_found()
}
