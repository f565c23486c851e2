//! Shutdown coordination.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Result;
use crate::types::Event;

use super::BatchOrchestrator;

/// How long shutdown waits for sessions to drain
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl BatchOrchestrator {
    /// Gracefully shut down the orchestrator
    ///
    /// 1. Stops accepting new batches
    /// 2. Cancels every session (and with it every in-flight job)
    /// 3. Waits up to 30 seconds for sessions to clean up and leave the registry
    /// 4. Logs final statistics and emits [`Event::Shutdown`]
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        self.root_cancel.cancel();
        tracing::info!("Stopped accepting new batches and cancelled active sessions");

        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_all_sessions()).await {
            Ok(()) => tracing::info!("All sessions finished"),
            Err(_) => {
                let remaining = self.registry.len().await;
                tracing::warn!(
                    remaining,
                    "Timeout waiting for sessions to finish, proceeding with shutdown"
                );
            }
        }

        let stats = self.stats.snapshot();
        tracing::info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            retries = stats.retries,
            success_rate = stats.success_rate,
            "final transfer statistics"
        );

        self.emit_event(Event::Shutdown);
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }

    /// Whether new batches are accepted
    pub fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    async fn wait_for_all_sessions(&self) {
        loop {
            let remaining = self.registry.len().await;
            if remaining == 0 {
                return;
            }
            tracing::debug!(remaining, "Waiting for sessions to finish");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
