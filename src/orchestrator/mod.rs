//! Batch orchestrator split into focused submodules.
//!
//! The [`BatchOrchestrator`] handle and its methods are organized by concern:
//! - [`control`] - Batch start and pause/resume/cancel/status
//! - [`lifecycle`] - Graceful shutdown
//! - [`registry`] - One live session per user
//! - [`session`] - Per-user dispatch loop
//! - [`pool`] - Bounded concurrent job execution
//! - [`reorder`] - Sequence-ordered reporting
//! - [`job`] - Single transfer job state machine

mod control;
mod job;
mod lifecycle;
mod pool;
pub(crate) mod registry;
mod reorder;
mod session;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

pub use control::BatchRequest;
pub use registry::SessionRegistry;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::progress::ProgressAggregator;
use crate::retry::RetryPolicy;
use crate::stats::{StatsSnapshot, TransferStats};
use crate::transport::Transport;
use crate::types::{Event, JobId, ProgressSnapshot, SessionId};
use crate::utils;

/// Main orchestrator instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct BatchOrchestrator {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Remote service collaborator
    pub(crate) transport: Arc<dyn Transport>,
    /// Live sessions keyed by user
    pub(crate) registry: Arc<SessionRegistry>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Retry classification and backoff
    pub(crate) retry_policy: Arc<RetryPolicy>,
    /// Progress throttling shared by all jobs
    pub(crate) progress: Arc<ProgressAggregator>,
    /// Process-wide counters
    pub(crate) stats: Arc<TransferStats>,
    /// Caps concurrent transfers across all sessions
    pub(crate) global_limit: Arc<Semaphore>,
    /// Parent of every session's cancel token; fired on shutdown
    pub(crate) root_cancel: CancellationToken,
    /// Flag to indicate whether new batches are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    next_job_id: Arc<AtomicU64>,
    next_session_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for BatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOrchestrator")
            .field("config", &self.config)
            .field("accepting_new", &self.accepting_new.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl BatchOrchestrator {
    /// Create a new orchestrator with its own session registry
    ///
    /// Validates the configuration, creates the staging directory and, if
    /// enabled, removes staged files left behind by a previous run.
    pub async fn new(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::with_registry(config, transport, Arc::new(SessionRegistry::new())).await
    }

    /// Create an orchestrator around an existing registry
    pub async fn with_registry(
        config: Config,
        transport: Arc<dyn Transport>,
        registry: Arc<SessionRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        let staging_dir = &config.staging.staging_dir;
        tokio::fs::create_dir_all(staging_dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "Failed to create staging directory '{}': {}",
                    staging_dir.display(),
                    e
                ),
            ))
        })?;

        if config.staging.sweep_on_start {
            match utils::sweep_stale_staging(staging_dir, config.staging.stale_after).await {
                Ok(0) => {}
                Ok(removed) => tracing::info!(removed, "swept stale staged files"),
                Err(e) => tracing::warn!(error = %e, "failed to sweep staging directory"),
            }
        }

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = broadcast::channel(1000);

        Ok(Self {
            retry_policy: Arc::new(RetryPolicy::new(&config.retry)),
            progress: Arc::new(ProgressAggregator::new(config.progress.clone())),
            global_limit: Arc::new(Semaphore::new(config.batch.max_global_transfers)),
            config: Arc::new(config),
            transport,
            registry,
            event_tx,
            stats: Arc::new(TransferStats::new()),
            root_cancel: CancellationToken::new(),
            accepting_new: Arc::new(AtomicBool::new(true)),
            next_job_id: Arc::new(AtomicU64::new(1)),
            next_session_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Subscribe to orchestrator events
    ///
    /// Each subscriber receives every event emitted after it subscribed. A
    /// subscriber that falls more than 1000 events behind gets `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Process-wide transfer statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Latest byte progress of an in-flight job
    ///
    /// `None` once the job has finished or before it has moved any bytes.
    /// Job ids come from [`Event::JobDispatched`].
    pub fn progress_snapshot(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        self.progress.snapshot(job_id)
    }

    /// The session registry this orchestrator registers into
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Broadcast an event, ignoring the no-subscriber case
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    pub(crate) fn next_job_id(&self) -> JobId {
        JobId(self.next_job_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn next_session_id(&self) -> SessionId {
        SessionId(self.next_session_id.fetch_add(1, Ordering::Relaxed))
    }
}
