//! Per-user batch session loop
//!
//! The loop is the single owner of a batch's cursor, counters and state.
//! It reacts to three inputs: control commands, job completions from the
//! worker pool, and the session cancel token (fired by `cancel` or by
//! orchestrator shutdown). Dispatch happens after each of them, never by
//! polling.

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::error::{BatchError, Result};
use crate::types::{
    BatchState, BatchSummary, Destination, Event, JobOutcome, JobReport, MessageReference,
    SessionId, UserId,
};
use crate::utils;

use super::BatchOrchestrator;
use super::job::{JobTicket, TransferJob};
use super::pool::WorkerPool;
use super::registry::SessionCommand;
use super::reorder::ReorderBuffer;

pub(crate) struct BatchSession {
    orch: BatchOrchestrator,
    id: SessionId,
    user_id: UserId,
    destination: Destination,
    references: Vec<MessageReference>,
    /// Next reference to dispatch; only moves forward
    cursor: usize,
    state: BatchState,
    pool: WorkerPool<JobTicket, JobReport>,
    reorder: ReorderBuffer<JobReport>,
    summary: watch::Sender<BatchSummary>,
    commands: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
}

impl BatchSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        orch: BatchOrchestrator,
        id: SessionId,
        user_id: UserId,
        destination: Destination,
        references: Vec<MessageReference>,
        summary: watch::Sender<BatchSummary>,
        commands: mpsc::Receiver<SessionCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let concurrency = orch.config.batch.concurrency;
        Self {
            orch,
            id,
            user_id,
            destination,
            references,
            cursor: 0,
            state: BatchState::AwaitingStart,
            pool: WorkerPool::new(concurrency),
            reorder: ReorderBuffer::new(concurrency),
            summary,
            commands,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        self.state = BatchState::Running;
        self.summary.send_modify(|s| s.state = BatchState::Running);
        tracing::info!(
            user_id = self.user_id.0,
            session_id = self.id.0,
            first = %self.summary.borrow().first_reference,
            total = self.references.len(),
            "batch started"
        );
        self.orch.emit_event(Event::BatchStarted {
            user_id: self.user_id,
            session_id: self.id,
            first: self.summary.borrow().first_reference.clone(),
            total: self.references.len(),
        });

        let mut commands_open = true;
        loop {
            self.dispatch();
            if self.is_finished() {
                break;
            }

            let pool_busy = !self.pool.is_idle();
            let live = !self.state.is_terminal();
            tokio::select! {
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        commands_open = false;
                        self.begin_cancel("session handle dropped");
                    }
                },
                Some((ticket, result)) = self.pool.next_completion(), if pool_busy => {
                    self.on_completion(ticket, result).await;
                }
                _ = self.cancel.cancelled(), if live => self.begin_cancel("cancel signal"),
                else => break,
            }

            // Cancelled jobs finish promptly; account for them and stop
            if self.state == BatchState::Cancelled {
                for (ticket, result) in self.pool.drain().await {
                    self.on_completion(ticket, result).await;
                }
                break;
            }
        }

        self.finish().await;
    }

    /// Start jobs while running, references remain and a slot is free
    fn dispatch(&mut self) {
        while self.state == BatchState::Running
            && self.cursor < self.references.len()
            && self.pool.has_capacity()
            && self.reorder.accepts(self.cursor)
        {
            let seq = self.cursor;
            let reference = self.references[seq].clone();
            let job = TransferJob::new(
                self.orch.clone(),
                seq,
                self.user_id,
                reference.clone(),
                self.destination,
                self.cancel.child_token(),
            );
            let job_id = job.id();
            self.pool.submit(job.ticket(), job.run());
            self.cursor += 1;

            tracing::debug!(
                user_id = self.user_id.0,
                job_id = job_id.0,
                seq,
                reference = %reference,
                "job dispatched"
            );
            self.orch.emit_event(Event::JobDispatched {
                user_id: self.user_id,
                job_id,
                seq,
                reference,
            });

            let (dispatched, in_flight) = (self.cursor, self.pool.in_flight());
            self.summary.send_modify(|s| {
                s.dispatched = dispatched;
                s.in_flight = in_flight;
            });
        }
    }

    fn is_finished(&self) -> bool {
        if !self.pool.is_idle() {
            return false;
        }
        match self.state {
            BatchState::Cancelled => true,
            BatchState::Running | BatchState::Paused => self.cursor >= self.references.len(),
            BatchState::AwaitingStart | BatchState::Completed => false,
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Pause(reply) => {
                reply.send(self.pause()).ok();
            }
            SessionCommand::Resume(reply) => {
                reply.send(self.resume()).ok();
            }
            SessionCommand::Cancel(reply) => {
                reply.send(self.cancel_batch()).ok();
            }
        }
    }

    fn pause(&mut self) -> Result<BatchSummary> {
        match self.state {
            BatchState::Running => {
                self.state = BatchState::Paused;
                self.summary.send_modify(|s| {
                    s.state = BatchState::Paused;
                    s.paused_at = Some(Utc::now());
                });
                tracing::info!(
                    user_id = self.user_id.0,
                    cursor = self.cursor,
                    in_flight = self.pool.in_flight(),
                    "batch paused"
                );
                self.orch.emit_event(Event::BatchPaused {
                    user_id: self.user_id,
                });
                Ok(self.current())
            }
            state if state.is_terminal() => Err(BatchError::NoActiveSession {
                user_id: self.user_id,
            }
            .into()),
            state => Err(BatchError::NotRunning {
                user_id: self.user_id,
                state,
            }
            .into()),
        }
    }

    fn resume(&mut self) -> Result<BatchSummary> {
        match self.state {
            BatchState::Paused => {
                self.state = BatchState::Running;
                self.summary.send_modify(|s| {
                    s.state = BatchState::Running;
                    s.paused_at = None;
                });
                tracing::info!(user_id = self.user_id.0, cursor = self.cursor, "batch resumed");
                self.orch.emit_event(Event::BatchResumed {
                    user_id: self.user_id,
                });
                Ok(self.current())
            }
            state if state.is_terminal() => Err(BatchError::NoActiveSession {
                user_id: self.user_id,
            }
            .into()),
            state => Err(BatchError::NotPaused {
                user_id: self.user_id,
                state,
            }
            .into()),
        }
    }

    fn cancel_batch(&mut self) -> Result<BatchSummary> {
        if self.state.is_terminal() {
            return Err(BatchError::NoActiveSession {
                user_id: self.user_id,
            }
            .into());
        }
        self.begin_cancel("user request");
        Ok(self.current())
    }

    /// Stop dispatching and abort every in-flight job
    ///
    /// The loop keeps running until the pool drains so completions are still
    /// counted and reported in order.
    fn begin_cancel(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.state = BatchState::Cancelled;
        self.cancel.cancel();
        self.summary.send_modify(|s| s.state = BatchState::Cancelled);
        tracing::info!(
            user_id = self.user_id.0,
            session_id = self.id.0,
            reason,
            in_flight = self.pool.in_flight(),
            never_dispatched = self.references.len() - self.cursor,
            "batch cancelled"
        );
    }

    async fn on_completion(&mut self, ticket: JobTicket, result: std::result::Result<JobReport, JoinError>) {
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::error!(
                    user_id = self.user_id.0,
                    job_id = ticket.job_id.0,
                    seq = ticket.seq,
                    error = %e,
                    "transfer job panicked"
                );
                // Staging paths are deterministic, so the file can still be removed
                let mut report = ticket.crashed_report(e.to_string());
                if let Err(err) = utils::remove_staged_file(&ticket.staged_path).await {
                    report.cleanup_error = Some(err.to_string());
                }
                report
            }
        };

        self.orch.stats.record_report(&report);
        let outcome = report.outcome;
        let in_flight = self.pool.in_flight();
        self.summary.send_modify(|s| {
            match outcome {
                JobOutcome::Succeeded => s.succeeded += 1,
                JobOutcome::Failed => s.failed += 1,
                JobOutcome::Skipped => s.skipped += 1,
            }
            s.in_flight = in_flight;
        });

        let released = self.reorder.push(ticket.seq, report);
        if released.is_empty() {
            tracing::debug!(
                user_id = self.user_id.0,
                seq = ticket.seq,
                waiting_for = self.reorder.next_expected(),
                buffered = self.reorder.buffered(),
                "report held until earlier items finish"
            );
        }
        for report in released {
            let reference = report.reference.clone();
            self.summary
                .send_modify(|s| s.last_reported = Some(reference));
            self.orch.emit_event(Event::ItemReported {
                user_id: self.user_id,
                report,
            });
        }
    }

    async fn finish(mut self) {
        if self.state != BatchState::Cancelled {
            self.state = BatchState::Completed;
        }
        let state = self.state;
        self.summary.send_modify(|s| {
            s.state = state;
            s.in_flight = 0;
            s.finished_at = Some(Utc::now());
        });
        let summary = self.current();

        tracing::info!(
            user_id = self.user_id.0,
            session_id = self.id.0,
            state = %summary.state,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            never_dispatched = summary.total - summary.dispatched,
            elapsed_secs = summary.elapsed().map(|d| d.as_secs_f64()).unwrap_or_default(),
            items_per_sec = summary.items_per_second().unwrap_or_default(),
            "batch finished"
        );
        let event = match state {
            BatchState::Cancelled => Event::BatchCancelled { summary },
            _ => Event::BatchCompleted { summary },
        };
        self.orch.emit_event(event);

        self.orch.registry.remove(self.user_id, self.id).await;
    }

    fn current(&self) -> BatchSummary {
        self.summary.borrow().clone()
    }
}
