use std::time::Duration;

use error_stack::Report;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::AgentError;
use crate::pod::ReadySignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// The pod controller is draining its queues.
    Ready,
    /// The run was cancelled before readiness.
    Cancelled,
}

/// One-shot wait for pod controller readiness.
///
/// The gate starts out waiting and settles exactly once, either on the
/// readiness signal or on timeout. [`ReadinessGate::wait`] consumes the gate,
/// so a settled gate cannot be consulted again.
pub struct ReadinessGate {
    signal: ReadySignal,
}

impl ReadinessGate {
    pub fn new(signal: ReadySignal) -> Self {
        Self { signal }
    }

    /// # Errors
    ///
    /// - [`AgentError::StartupTimeout`] if the signal did not fire within `timeout`
    pub async fn wait(
        self,
        timeout: Duration,
        token: &CancellationToken,
    ) -> Result<GateOutcome, Report<AgentError>> {
        let signal = self.signal;
        let ready = async {
            if signal.fired().await {
                GateOutcome::Ready
            } else {
                // The controller exited without becoming ready; its supervisor cancels the run.
                token.cancelled().await;
                GateOutcome::Cancelled
            }
        };

        select! {
            biased;
            _ = token.cancelled() => Ok(GateOutcome::Cancelled),
            outcome = tokio::time::timeout(timeout, ready) => match outcome {
                Ok(outcome) => {
                    info!(?outcome, "Readiness gate settled");
                    Ok(outcome)
                }
                Err(_) => Err(Report::new(AgentError::StartupTimeout { timeout })),
            },
        }
    }
}
