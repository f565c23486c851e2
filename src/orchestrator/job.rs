//! Transfer job state machine
//!
//! One job carries one reference through
//! `Pending → Fetching → Staging → Delivering → Cleaning → terminal`.
//! Text messages skip `Staging`; messages with nothing to relay end in
//! `Skipped` right after `Fetching`.
//! Every path out of the pre-cleaning phases (success, exhausted retries,
//! fatal error, cancellation) goes through `Cleaning`, which removes the
//! staged file before the job reports its outcome.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::retry::{self, RetryDecision};
use crate::transport::ProgressFn;
use crate::types::{
    ContentKind, ContentMetadata, Destination, Event, FailureKind, JobId, JobOutcome, JobPhase,
    JobReport, MessageReference, UserId,
};
use crate::utils::{self, format_bytes};

use super::BatchOrchestrator;

/// What the session needs to account for a job whose task died
#[derive(Clone, Debug)]
pub(crate) struct JobTicket {
    pub(crate) job_id: JobId,
    pub(crate) seq: usize,
    pub(crate) reference: MessageReference,
    pub(crate) staged_path: PathBuf,
    pub(crate) dispatched_at: Instant,
}

impl JobTicket {
    /// Report for a job that panicked instead of returning one
    pub(crate) fn crashed_report(&self, message: String) -> JobReport {
        JobReport {
            job_id: self.job_id,
            seq: self.seq,
            reference: self.reference.clone(),
            outcome: JobOutcome::Failed,
            attempts: 1,
            error_kind: Some(FailureKind::Fatal),
            error_code: Some("panicked".to_string()),
            error: Some(message),
            file_name: None,
            bytes_delivered: 0,
            elapsed: self.dispatched_at.elapsed(),
            cleanup_error: None,
        }
    }
}

/// Why a job ended without delivering
#[derive(Debug)]
struct JobFailure {
    outcome: JobOutcome,
    kind: FailureKind,
    code: String,
    message: String,
}

impl JobFailure {
    fn cancelled() -> Self {
        Self {
            outcome: JobOutcome::Skipped,
            kind: FailureKind::Cancelled,
            code: TransportError::Cancelled.code().to_string(),
            message: TransportError::Cancelled.to_string(),
        }
    }

    fn from_error(phase: JobPhase, kind: FailureKind, error: &TransportError) -> Self {
        let outcome = match (kind, phase, error) {
            (FailureKind::Cancelled, _, _) => JobOutcome::Skipped,
            // Deleted messages and ones with nothing to relay are not reliability failures
            (_, JobPhase::Fetching, TransportError::NotFound(_) | TransportError::Unsupported(_)) => {
                JobOutcome::Skipped
            }
            _ => JobOutcome::Failed,
        };
        Self {
            outcome,
            kind,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// A single reference in flight
pub(crate) struct TransferJob {
    id: JobId,
    seq: usize,
    user_id: UserId,
    reference: MessageReference,
    destination: Destination,
    staged_path: PathBuf,
    cancel: CancellationToken,
    orch: BatchOrchestrator,
    phase: JobPhase,
    attempts: u32,
    /// Set once the job starts staging media
    staged: Option<PathBuf>,
    content: Option<ContentMetadata>,
    bytes_delivered: u64,
}

impl TransferJob {
    pub(crate) fn new(
        orch: BatchOrchestrator,
        seq: usize,
        user_id: UserId,
        reference: MessageReference,
        destination: Destination,
        cancel: CancellationToken,
    ) -> Self {
        let id = orch.next_job_id();
        let staged_path =
            utils::staged_path_for(&orch.config.staging.staging_dir, user_id, id, &reference);
        Self {
            id,
            seq,
            user_id,
            reference,
            destination,
            staged_path,
            cancel,
            orch,
            phase: JobPhase::Pending,
            attempts: 1,
            staged: None,
            content: None,
            bytes_delivered: 0,
        }
    }

    pub(crate) fn id(&self) -> JobId {
        self.id
    }

    pub(crate) fn ticket(&self) -> JobTicket {
        JobTicket {
            job_id: self.id,
            seq: self.seq,
            reference: self.reference.clone(),
            staged_path: self.staged_path.clone(),
            dispatched_at: Instant::now(),
        }
    }

    /// Drive the job to a terminal phase and report the outcome
    pub(crate) async fn run(mut self) -> JobReport {
        let started = Instant::now();

        let result = match self.acquire_slot().await {
            Some(_permit) => self.execute().await,
            None => Err(JobFailure::cancelled()),
        };

        self.enter(JobPhase::Cleaning);
        let cleanup_error = self.clean().await;

        let outcome = match &result {
            Ok(()) => JobOutcome::Succeeded,
            Err(failure) => failure.outcome,
        };
        self.enter(outcome.into());
        self.orch.progress.forget(self.id);

        let failure = result.err();
        let report = JobReport {
            job_id: self.id,
            seq: self.seq,
            reference: self.reference.clone(),
            outcome,
            attempts: self.attempts,
            error_kind: failure.as_ref().map(|f| f.kind),
            error_code: failure.as_ref().map(|f| f.code.clone()),
            error: failure.map(|f| f.message),
            file_name: self.content.as_ref().and_then(|c| c.file_name.clone()),
            bytes_delivered: self.bytes_delivered,
            elapsed: started.elapsed(),
            cleanup_error,
        };

        match report.outcome {
            JobOutcome::Succeeded => tracing::info!(
                user_id = self.user_id.0,
                job_id = self.id.0,
                seq = self.seq,
                attempts = report.attempts,
                bytes = report.bytes_delivered,
                "transfer succeeded"
            ),
            JobOutcome::Failed => tracing::error!(
                user_id = self.user_id.0,
                job_id = self.id.0,
                seq = self.seq,
                attempts = report.attempts,
                code = report.error_code.as_deref().unwrap_or_default(),
                error = report.error.as_deref().unwrap_or_default(),
                "transfer failed"
            ),
            JobOutcome::Skipped => tracing::info!(
                user_id = self.user_id.0,
                job_id = self.id.0,
                seq = self.seq,
                code = report.error_code.as_deref().unwrap_or_default(),
                "transfer skipped"
            ),
        }
        report
    }

    /// Wait in `Pending` for a process-wide transfer slot
    async fn acquire_slot(&self) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            permit = self.orch.global_limit.clone().acquire_owned() => permit.ok(),
        }
    }

    async fn execute(&mut self) -> Result<(), JobFailure> {
        self.enter(JobPhase::Fetching);
        loop {
            let phase = self.phase;
            let step = match phase {
                JobPhase::Fetching => self.fetch().await,
                JobPhase::Staging => self.stage().await,
                JobPhase::Delivering => self.deliver().await,
                other => {
                    return Err(JobFailure::from_error(
                        other,
                        FailureKind::Fatal,
                        &TransportError::Other(format!("job cannot execute in phase {other}")),
                    ));
                }
            };

            let error = match step {
                Ok(()) => match phase {
                    JobPhase::Fetching => {
                        if self.is_text() {
                            self.enter(JobPhase::Delivering);
                        } else {
                            self.staged = Some(self.staged_path.clone());
                            self.enter(JobPhase::Staging);
                        }
                        continue;
                    }
                    JobPhase::Staging => {
                        self.enter(JobPhase::Delivering);
                        continue;
                    }
                    _ => return Ok(()),
                },
                Err(error) => error,
            };

            // An aborted call may surface as any error; cancellation wins
            let error = if self.cancel.is_cancelled() {
                TransportError::Cancelled
            } else {
                error
            };
            let kind = self.orch.retry_policy.classify(&error);
            match self
                .orch
                .retry_policy
                .should_retry(kind, self.attempts, error.retry_after())
            {
                RetryDecision::GiveUp => return Err(JobFailure::from_error(phase, kind, &error)),
                RetryDecision::RetryAfter(delay) => {
                    self.prepare_retry(phase, kind, &error, delay).await?
                }
            }
        }
    }

    async fn prepare_retry(
        &mut self,
        phase: JobPhase,
        kind: FailureKind,
        error: &TransportError,
        delay: Duration,
    ) -> Result<(), JobFailure> {
        self.orch.stats.record_retry();
        tracing::warn!(
            user_id = self.user_id.0,
            job_id = self.id.0,
            seq = self.seq,
            phase = %phase,
            attempt = self.attempts,
            max_attempts = self.orch.retry_policy.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "attempt failed, retrying"
        );
        self.orch.emit_event(Event::JobRetrying {
            user_id: self.user_id,
            job_id: self.id,
            seq: self.seq,
            attempt: self.attempts,
            delay_ms: delay.as_millis() as u64,
            error: error.to_string(),
        });

        // A partial staged file must not leak into the next attempt
        if phase == JobPhase::Staging
            && let Err(e) = utils::remove_staged_file(&self.staged_path).await
        {
            tracing::warn!(job_id = self.id.0, error = %e, "failed to remove partial staged file");
        }

        if !retry::wait(delay, &self.cancel).await {
            return Err(JobFailure::cancelled());
        }

        if kind == FailureKind::CrashClass {
            let transport = self.orch.transport.clone();
            match self.guarded(transport.reconnect()).await {
                Ok(()) => tracing::info!(job_id = self.id.0, "transport reconnected"),
                Err(TransportError::Cancelled) => return Err(JobFailure::cancelled()),
                // The next attempt will fail and be classified on its own
                Err(e) => tracing::warn!(job_id = self.id.0, error = %e, "reconnect failed"),
            }
        }

        self.attempts += 1;
        Ok(())
    }

    async fn fetch(&mut self) -> Result<(), TransportError> {
        let transport = self.orch.transport.clone();
        let content = self.guarded(transport.resolve(&self.reference)).await?;

        if content.kind == ContentKind::Unsupported {
            return Err(TransportError::Unsupported(self.reference.to_string()));
        }
        let max = self.orch.config.staging.max_file_size;
        if content.kind == ContentKind::Media && content.size_bytes > max {
            return Err(TransportError::Rejected(format!(
                "content is {} which exceeds the {} limit",
                format_bytes(content.size_bytes),
                format_bytes(max)
            )));
        }

        tracing::debug!(
            job_id = self.id.0,
            reference = %self.reference,
            size = content.size_bytes,
            file_name = content.file_name.as_deref().unwrap_or_default(),
            "resolved content"
        );
        self.content = Some(content);
        Ok(())
    }

    async fn stage(&mut self) -> Result<(), TransportError> {
        let content = self.content_metadata()?;
        let progress = self.progress_fn();
        let transport = self.orch.transport.clone();
        let written = self
            .guarded(transport.download_to(
                &content,
                &self.staged_path,
                progress,
                self.cancel.clone(),
            ))
            .await?;

        let size = self.validate_staged().await?;
        self.orch.stats.add_downloaded(size);
        tracing::debug!(job_id = self.id.0, written, size, "content staged");
        Ok(())
    }

    async fn deliver(&mut self) -> Result<(), TransportError> {
        let content = self.content_metadata()?;
        let transport = self.orch.transport.clone();

        if let ContentKind::Text { text } = &content.kind {
            self.guarded(transport.send_text(
                &content,
                text,
                &self.destination,
                self.cancel.clone(),
            ))
            .await?;
            self.bytes_delivered = text.len() as u64;
            self.orch.stats.add_uploaded(self.bytes_delivered);
            return Ok(());
        }

        let progress = self.progress_fn();
        self.guarded(transport.upload_from(
            &self.staged_path,
            &content,
            &self.destination,
            progress,
            self.cancel.clone(),
        ))
        .await?;

        let size = tokio::fs::metadata(&self.staged_path)
            .await
            .map(|m| m.len())
            .unwrap_or(content.size_bytes);
        self.bytes_delivered = size;
        self.orch.stats.add_uploaded(size);
        Ok(())
    }

    /// Check the staged file before handing it to delivery
    async fn validate_staged(&self) -> Result<u64, TransportError> {
        let metadata = tokio::fs::metadata(&self.staged_path).await?;
        let size = metadata.len();
        if size == 0 {
            return Err(TransportError::Rejected("staged file is empty".to_string()));
        }
        let max = self.orch.config.staging.max_file_size;
        if size > max {
            return Err(TransportError::Rejected(format!(
                "staged file is {} which exceeds the {} limit",
                format_bytes(size),
                format_bytes(max)
            )));
        }
        Ok(size)
    }

    /// Remove the staged file; failures are reported, never fatal
    ///
    /// Removal is attempted even if the job never reached staging, so a
    /// transport that wrote before failing resolution cannot leave a file.
    async fn clean(&mut self) -> Option<String> {
        let path = self.staged.take().unwrap_or_else(|| self.staged_path.clone());
        match utils::remove_staged_file(&path).await {
            Ok(removed) => {
                if removed {
                    tracing::debug!(job_id = self.id.0, path = %path.display(), "staged file removed");
                }
                None
            }
            Err(e) => {
                tracing::warn!(
                    job_id = self.id.0,
                    path = %path.display(),
                    error = %e,
                    "failed to remove staged file"
                );
                Some(e.to_string())
            }
        }
    }

    fn enter(&mut self, next: JobPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal job transition {} -> {}",
            self.phase,
            next
        );
        tracing::trace!(job_id = self.id.0, from = %self.phase, to = %next, "job phase");
        self.phase = next;
        self.orch.emit_event(Event::JobPhaseChanged {
            user_id: self.user_id,
            job_id: self.id,
            seq: self.seq,
            phase: next,
        });
    }

    fn is_text(&self) -> bool {
        matches!(
            self.content.as_ref().map(|c| &c.kind),
            Some(ContentKind::Text { .. })
        )
    }

    fn content_metadata(&self) -> Result<ContentMetadata, TransportError> {
        self.content
            .clone()
            .ok_or_else(|| TransportError::Other("content was not resolved".to_string()))
    }

    /// Progress callback tagged with the current phase's direction
    fn progress_fn(&self) -> ProgressFn {
        let progress = self.orch.progress.clone();
        let events = self.orch.event_tx.clone();
        let direction = self.phase.direction();
        let (job_id, seq, user_id) = (self.id, self.seq, self.user_id);
        Arc::new(move |done, total| {
            let Some(direction) = direction else { return };
            if let Some(snapshot) = progress.record(job_id, direction, done, total, Instant::now()) {
                events
                    .send(Event::Progress {
                        user_id,
                        seq,
                        snapshot,
                    })
                    .ok();
            }
        })
    }

    /// Race a transport call against the job's cancel token
    async fn guarded<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        F: Future<Output = Result<T, TransportError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = op => result,
        }
    }
}
