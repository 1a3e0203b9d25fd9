//! Group dispatch queue.
//!
//! One FIFO of pending jobs per routing key plus a global permit pool.
//! A key runs at most one job at a time; the pool caps how many keys run
//! at once. Dispatch is attempted after every submission and after every
//! job completion, so backlogs drain without a dedicated worker loop.
//!
//! Jobs are plain futures. They start only once dispatched, which is what
//! lets a cancelled submitter's queued work be discarded unrun.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::QueueError;

struct QueuedJob {
    job: BoxFuture<'static, ()>,
    cancel: CancellationToken,
}

/// Pending list and executing flag for one key.
#[derive(Default)]
struct GroupEntry {
    pending: VecDeque<QueuedJob>,
    executing: bool,
}

struct Inner {
    /// Only ever held for O(1) bookkeeping, never across an await.
    state: Mutex<HashMap<String, GroupEntry>>,
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Per-key FIFO dispatcher with a global concurrency limit.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Inner>,
}

impl GroupQueue {
    /// Create a queue allowing `limit` jobs to run at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(limit)),
                limit,
            }),
        }
    }

    /// Append `job` to the FIFO for `key` and try to dispatch.
    ///
    /// Fails only when `cancel` has already fired. If `cancel` fires while
    /// the job is still queued, the job is dropped without running. Must be
    /// called from within a Tokio runtime.
    pub fn submit<F>(&self, key: &str, cancel: &CancellationToken, job: F) -> Result<(), QueueError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if cancel.is_cancelled() {
            debug!(group = %key, "Submission rejected: cancelled");
            return Err(QueueError::Cancelled {
                key: key.to_string(),
            });
        }

        {
            let mut state = self.inner.state.lock();
            let entry = state.entry(key.to_string()).or_default();
            entry.pending.push_back(QueuedJob {
                job: job.boxed(),
                cancel: cancel.clone(),
            });
            debug!(group = %key, pending = entry.pending.len(), "Job queued");
        }

        self.inner.dispatch();
        Ok(())
    }

    /// Jobs waiting for `key`, excluding one that is currently executing.
    pub fn pending_count(&self, key: &str) -> usize {
        self.inner
            .state
            .lock()
            .get(key)
            .map_or(0, |entry| entry.pending.len())
    }

    /// Whether a job for `key` is executing right now.
    pub fn is_running(&self, key: &str) -> bool {
        self.inner
            .state
            .lock()
            .get(key)
            .is_some_and(|entry| entry.executing)
    }

    /// Number of keys with a job executing.
    pub fn active_count(&self) -> usize {
        self.inner
            .state
            .lock()
            .values()
            .filter(|entry| entry.executing)
            .count()
    }

    /// The global concurrency limit.
    pub fn limit(&self) -> usize {
        self.inner.limit
    }
}

impl Inner {
    /// Start as many eligible head jobs as permits allow.
    fn dispatch(self: &Arc<Self>) {
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            loop {
                let Some(key) = state
                    .iter()
                    .find(|(_, entry)| !entry.executing && !entry.pending.is_empty())
                    .map(|(key, _)| key.clone())
                else {
                    break;
                };
                let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                    break;
                };
                let Some(entry) = state.get_mut(&key) else {
                    continue;
                };
                let Some(queued) = entry.pending.pop_front() else {
                    continue;
                };

                if queued.cancel.is_cancelled() {
                    debug!(group = %key, "Discarding queued job: submitter cancelled");
                    if entry.pending.is_empty() {
                        state.remove(&key);
                    }
                    drop(permit);
                    continue;
                }

                entry.executing = true;
                ready.push((key, permit, queued.job));
            }
        }

        for (key, permit, job) in ready {
            self.start(key, permit, job);
        }
    }

    fn start(self: &Arc<Self>, key: String, permit: OwnedSemaphorePermit, job: BoxFuture<'static, ()>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let guard = RunGuard {
                inner: Arc::clone(&inner),
                key,
                _permit: permit,
            };
            debug!(group = %guard.key, "Job started");

            if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                error!(
                    group = %guard.key,
                    panic = panic_message(&*panic),
                    "Job panicked"
                );
            }

            drop(guard);
            inner.dispatch();
        });
    }

    fn finish(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(key) {
            entry.executing = false;
            if entry.pending.is_empty() {
                state.remove(key);
            }
        }
    }
}

/// Clears the executing flag and returns the permit on every exit path.
struct RunGuard {
    inner: Arc<Inner>,
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.inner.finish(&self.key);
        debug!(group = %self.key, "Job finished");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
