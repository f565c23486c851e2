//! Bounded set of concurrently running transfer jobs

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use std::future::Future;
use tokio::task::JoinError;

/// Runs at most `capacity` spawned jobs at a time
///
/// Each job is submitted with a tag that comes back with its result, so the
/// owner can correlate completions (which arrive in any order) with what it
/// dispatched. A panicking job surfaces as `Err(JoinError)` instead of
/// taking the owner down.
pub(crate) struct WorkerPool<T, R> {
    capacity: usize,
    running: FuturesUnordered<BoxFuture<'static, (T, Result<R, JoinError>)>>,
}

impl<T, R> WorkerPool<T, R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            running: FuturesUnordered::new(),
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.running.len() < self.capacity
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.running.is_empty()
    }

    /// Spawn a job onto the runtime and track it
    ///
    /// Callers check [`WorkerPool::has_capacity`] first; submitting past
    /// capacity is logged and still accepted rather than dropping work.
    pub(crate) fn submit<F>(&mut self, tag: T, job: F)
    where
        F: Future<Output = R> + Send + 'static,
    {
        if !self.has_capacity() {
            tracing::warn!(
                capacity = self.capacity,
                in_flight = self.running.len(),
                "job submitted to a full worker pool"
            );
        }
        let handle = tokio::spawn(job);
        self.running
            .push(Box::pin(async move { (tag, handle.await) }));
    }

    /// Wait for the next job to finish, in completion order
    ///
    /// Returns `None` when nothing is running.
    pub(crate) async fn next_completion(&mut self) -> Option<(T, Result<R, JoinError>)> {
        self.running.next().await
    }

    /// Wait for every running job and return their results in completion order
    pub(crate) async fn drain(&mut self) -> Vec<(T, Result<R, JoinError>)> {
        let mut done = Vec::with_capacity(self.running.len());
        while let Some(completion) = self.running.next().await {
            done.push(completion);
        }
        done
    }
}
