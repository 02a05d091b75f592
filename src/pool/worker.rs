//! Dedicated thread that owns thread-affine state
//!
//! Jobs are closures over the worker's state, queued on an unbounded channel
//! and run strictly in submission order. Results travel back over oneshot
//! channels, so async callers never block.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, ThreadId};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::{Result, SnareError};

type Job<S> = Box<dyn FnOnce(&mut S) + Send>;

/// Handle to a thread that owns a value of type `S`
///
/// The state never leaves its thread, so `S` need not be `Send`. The thread
/// exits once every handle is dropped and the queue is drained.
pub struct AffinityWorker<S> {
    jobs: mpsc::UnboundedSender<Job<S>>,
    thread: ThreadId,
}

impl<S> Clone for AffinityWorker<S> {
    fn clone(&self) -> Self {
        Self {
            jobs: self.jobs.clone(),
            thread: self.thread,
        }
    }
}

impl<S: 'static> AffinityWorker<S> {
    /// Start the worker thread; `init` builds the state on that thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn<F>(name: &str, init: F) -> Result<Self>
    where
        F: FnOnce() -> S + Send + 'static,
    {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job<S>>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut state = init();
                while let Some(job) = queue.blocking_recv() {
                    if catch_unwind(AssertUnwindSafe(|| job(&mut state))).is_err() {
                        error!("Affinity job panicked");
                    }
                }
                debug!("Affinity worker stopped");
            })?;

        Ok(Self {
            jobs,
            thread: handle.thread().id(),
        })
    }

    /// Queue a job without waiting for it
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread is gone
    pub fn post<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.jobs
            .send(Box::new(job))
            .map_err(|_| SnareError::unavailable("affinity worker stopped"))
    }

    /// Run a job on the worker and wait for its result
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread is gone or the job panicked
    pub async fn call<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, result) = oneshot::channel();
        self.post(move |state| {
            let _ = reply.send(job(state));
        })?;

        result
            .await
            .map_err(|_| SnareError::Other("affinity job did not complete".to_string()))
    }

    /// Whether the caller runs on the worker thread
    #[must_use]
    pub fn is_affinity_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}
