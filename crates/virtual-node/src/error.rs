//! Error taxonomy surfaced by the orchestrator.

use core::error::Error;
use std::time::Duration;

/// Errors returned from [`crate::Orchestrator`] runs.
#[derive(Debug, derive_more::Display)]
pub enum AgentError {
    /// Bad or missing input. Raised before any external object is touched.
    #[display("configuration error: {message}")]
    Configuration { message: String },
    /// The cluster client could not be built or authentication material could not be resolved.
    #[display("cluster connectivity error: {message}")]
    Connectivity { message: String },
    /// The backend provider refused to initialize.
    #[display("failed to initialize provider {provider}")]
    ProviderInit { provider: String },
    /// The pod controller did not become ready in time.
    #[display("pod controller did not become ready within {timeout:?}")]
    StartupTimeout { timeout: Duration },
    /// The admin HTTP endpoint could not be started.
    #[display("admin server error: {message}")]
    AdminServer { message: String },
    /// A long-running controller failed after startup.
    #[display("{controller} controller failed")]
    FatalController { controller: ControllerKind },
}

impl Error for AgentError {}

impl AgentError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
        }
    }
}

/// The two supervised reconciliation loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ControllerKind {
    #[display("pod")]
    Pod,
    #[display("node")]
    Node,
}

/// Startup step that produced an error, attached to every startup-phase report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum StartupPhase {
    #[display("provider lookup")]
    ProviderLookup,
    #[display("cluster client construction")]
    ClientConstruction,
    #[display("configuration validation")]
    Validation,
    #[display("taint computation")]
    Taint,
    #[display("admin authentication")]
    AdminAuthentication,
    #[display("provider initialization")]
    ProviderInit,
    #[display("node controller construction")]
    NodeController,
    #[display("pod controller construction")]
    PodController,
    #[display("admin server startup")]
    AdminServer,
    #[display("readiness wait")]
    Readiness,
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn display_formatting() {
        assert_eq!(
            AgentError::configuration("pod sync workers must be greater than 0").to_string(),
            "configuration error: pod sync workers must be greater than 0"
        );
        assert_eq!(
            AgentError::ProviderInit {
                provider: "mock".to_string()
            }
            .to_string(),
            "failed to initialize provider mock"
        );
        assert_eq!(
            AgentError::StartupTimeout {
                timeout: Duration::from_secs(3)
            }
            .to_string(),
            "pod controller did not become ready within 3s"
        );
        assert_eq!(
            AgentError::FatalController {
                controller: ControllerKind::Node
            }
            .to_string(),
            "node controller failed"
        );
    }
}
