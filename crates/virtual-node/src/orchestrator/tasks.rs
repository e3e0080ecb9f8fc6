use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use error_stack::Report;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ControllerKind;

/// Supervises the long-running controller loops of one run.
///
/// A controller that fails while the run is live records itself as the fatal
/// cause and cancels the run token, which stops every other task. Failures
/// observed after cancellation count as a clean shutdown.
pub struct ControllerTasks {
    token: CancellationToken,
    fatal: Arc<Mutex<Option<ControllerKind>>>,
    tasks: Vec<(ControllerKind, JoinHandle<()>)>,
}

impl ControllerTasks {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            fatal: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
        }
    }

    pub fn spawn<F, E>(&mut self, controller: ControllerKind, task: F)
    where
        F: Future<Output = Result<(), Report<E>>> + Send + 'static,
        E: Debug + Send + Sync + 'static,
    {
        let token = self.token.clone();
        let fatal = Arc::clone(&self.fatal);
        let handle = tokio::spawn(async move {
            tracing::info!(%controller, "Starting controller task");
            let failure = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{e:?}")),
                Err(_) => Some("controller task panicked".to_string()),
            };
            match failure {
                None => tracing::info!(%controller, "Controller task completed"),
                Some(cause) if token.is_cancelled() => {
                    tracing::debug!(%controller, "Controller task failed during shutdown: {cause}");
                }
                Some(cause) => {
                    tracing::error!(%controller, "Controller task failed: {cause}");
                    fatal
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .get_or_insert(controller);
                    token.cancel();
                }
            }
        });
        self.tasks.push((controller, handle));
    }

    /// The first controller that failed while the run was live.
    pub fn fatal(&self) -> Option<ControllerKind> {
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels the run and waits up to `grace` for the tasks to drain.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ControllerKind> {
        self.token.cancel();
        tokio::time::timeout(grace, async {
            for (controller, task) in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!(%controller, "Controller task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Controller shutdown timed out after {:?}", grace);
            for (_, task) in &self.tasks {
                task.abort();
            }
        });
        self.fatal()
    }
}
