//! # msg-relay
//!
//! Batch transfer orchestrator for relaying remote chat messages.
//!
//! A user asks for "the next N messages starting at this link"; the
//! orchestrator turns that into a sequence of transfer jobs, each of which
//! resolves one message, stages its content on local disk, delivers it to a
//! destination and removes the staged file. Jobs run a few at a time, are
//! retried on transient failures, report progress, and can be paused,
//! resumed or cancelled mid-flight.
//!
//! ## Design Philosophy
//!
//! - **Transport-agnostic** - All network I/O goes through the [`Transport`] trait
//! - **One batch per user** - Enforced atomically by the [`SessionRegistry`]
//! - **Ordered reporting** - Results arrive in the order they were requested
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use msg_relay::{BatchOrchestrator, Config, Event, MessageReference, Transport, UserId};
//!
//! # async fn example(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = BatchOrchestrator::new(Config::default(), transport).await?;
//!
//! // Subscribe to events
//! let mut events = orchestrator.subscribe();
//! tokio::spawn(async move {
//!     while let Ok(event) = events.recv().await {
//!         if let Event::ItemReported { report, .. } = event {
//!             println!("{}: {:?}", report.reference, report.outcome);
//!         }
//!     }
//! });
//!
//! let first: MessageReference = "https://t.me/somechannel/100".parse()?;
//! orchestrator.start_batch(UserId(42), first, 10).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Batch orchestration (decomposed into focused submodules)
pub mod orchestrator;
/// Throttled progress tracking
pub mod progress;
/// Message link parsing
pub mod reference;
/// Retry policy with exponential backoff
pub mod retry;
/// Transfer statistics
pub mod stats;
/// Transport collaborator interface
pub mod transport;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{BatchError, Error, Result, TransportError};
pub use orchestrator::{BatchOrchestrator, BatchRequest, SessionRegistry};
pub use stats::StatsSnapshot;
pub use transport::{ProgressFn, Transport};
pub use types::{
    BatchState, BatchSummary, ChatRef, ContentKind, ContentMetadata, Destination, Event,
    FailureKind, JobId, JobOutcome, JobPhase, JobReport, MessageReference, ProgressSnapshot,
    SessionId, TransferDirection, UserId,
};

/// Run the orchestrator until the process is asked to stop, then shut it down.
///
/// On Unix this waits for SIGTERM or SIGINT; elsewhere for Ctrl+C. Shutdown
/// cancels every running batch and waits for staged files to be removed.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use msg_relay::{BatchOrchestrator, Config, Transport, run_with_shutdown};
///
/// # async fn example(transport: Arc<dyn Transport>) -> Result<(), Box<dyn std::error::Error>> {
/// let orchestrator = BatchOrchestrator::new(Config::default(), transport).await?;
///
/// // Hand the orchestrator to the command layer, then block until a signal arrives
/// run_with_shutdown(orchestrator).await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_with_shutdown(orchestrator: BatchOrchestrator) -> Result<()> {
    shutdown_on(orchestrator, stop_signal()).await
}

/// Shut the orchestrator down once `stop` resolves
///
/// [`run_with_shutdown`] passes the process signals; embedders with their own
/// stop condition (a oneshot, an admin command) pass that instead.
pub async fn shutdown_on<F>(orchestrator: BatchOrchestrator, stop: F) -> Result<()>
where
    F: std::future::Future<Output = ()>,
{
    stop.await;
    let sessions = orchestrator.registry().len().await;
    tracing::info!(sessions, "stop requested, cancelling running batches");
    orchestrator.shutdown().await
}

#[cfg(unix)]
async fn stop_signal() {
    use tokio::signal::unix::{Signal, SignalKind, signal};

    fn register(kind: SignalKind, name: &str) -> Option<Signal> {
        signal(kind)
            .map_err(|e| tracing::warn!(signal = name, error = %e, "cannot listen for signal"))
            .ok()
    }

    // A missing stream never yields, so the other one decides
    async fn next(stream: &mut Option<Signal>) -> Option<()> {
        match stream {
            Some(stream) => stream.recv().await,
            None => std::future::pending().await,
        }
    }

    let mut term = register(SignalKind::terminate(), "SIGTERM");
    let mut int = register(SignalKind::interrupt(), "SIGINT");
    if term.is_none() && int.is_none() {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!(signal = "ctrl_c", "stop signal received");
        return;
    }

    let received = tokio::select! {
        Some(()) = next(&mut term) => "SIGTERM",
        Some(()) = next(&mut int) => "SIGINT",
        else => "signal stream closed",
    };
    tracing::info!(signal = received, "stop signal received");
}

#[cfg(not(unix))]
async fn stop_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl+C; stopping now");
        return;
    }
    tracing::info!(signal = "ctrl_c", "stop signal received");
}
