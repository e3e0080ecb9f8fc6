use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::select;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::rate_limiter::RateLimiter;
use crate::cache::ObjectKey;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<ObjectKey>,
    /// Keys waiting to be processed, including ones re-added while processing.
    dirty: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    shutting_down: bool,
}

/// De-duplicating work queue keyed by pod.
///
/// A key is handed to at most one worker at a time. Adding a key that is
/// being processed schedules it again once [`WorkQueue::done`] is called.
pub struct WorkQueue {
    name: &'static str,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Arc<dyn RateLimiter>,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: &'static str, rate_limiter: Arc<dyn RateLimiter>) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            rate_limiter,
            shutdown: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn add(&self, key: ObjectKey) {
        let mut state = self.state();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        trace!(queue = self.name, %key, "Queued");
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let delay = self.rate_limiter.when(&key);
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &ObjectKey) {
        self.rate_limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Next key to process, or `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.state();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Marks `key` as finished, re-queueing it if it was added meanwhile.
    pub fn done(&self, key: &ObjectKey) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
