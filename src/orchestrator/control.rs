//! Batch control: start, pause, resume, cancel, status.

use chrono::Utc;
use std::sync::atomic::Ordering;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{BatchError, Error, Result};
use crate::types::{BatchState, BatchSummary, Destination, MessageReference, UserId};

use super::BatchOrchestrator;
use super::registry::{SessionCommand, SessionHandle};
use super::session::BatchSession;

/// Commands queued per session before senders wait
const COMMAND_BUFFER: usize = 16;

/// Parameters of a batch
#[derive(Clone, Debug)]
pub struct BatchRequest {
    /// Requesting user
    pub user_id: UserId,
    /// First reference of the run
    pub first: MessageReference,
    /// Number of consecutive references to transfer
    pub count: usize,
    /// Where content is delivered; defaults to the user's own chat
    pub destination: Option<Destination>,
}

impl BatchRequest {
    /// Batch delivering back to the requesting user
    pub fn new(user_id: UserId, first: MessageReference, count: usize) -> Self {
        Self {
            user_id,
            first,
            count,
            destination: None,
        }
    }

    /// Deliver somewhere other than the requesting user
    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }
}

/// `count` consecutive references starting at `first`
pub(crate) fn enumerate_references(
    first: &MessageReference,
    count: usize,
) -> Result<Vec<MessageReference>> {
    (0..count)
        .map(|i| {
            first.offset(i).ok_or_else(|| {
                Error::InvalidReference(format!(
                    "message id {} + {i} is out of range",
                    first.message_id
                ))
            })
        })
        .collect()
}

impl BatchOrchestrator {
    /// Start a batch of `count` messages beginning at `first`, delivered to the user
    ///
    /// # Errors
    ///
    /// - [`BatchError::EmptyBatch`] if `count` is zero
    /// - [`BatchError::BatchTooLarge`] if `count` exceeds `batch.max_batch_size`
    /// - [`BatchError::AlreadyRunning`] if the user has a live batch
    /// - [`Error::InvalidReference`] if the message ids would overflow
    /// - [`Error::ShuttingDown`] after [`BatchOrchestrator::shutdown`]
    ///
    /// No session is created when any of these is returned.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use msg_relay::*;
    /// # async fn example(orchestrator: BatchOrchestrator) -> Result<()> {
    /// let first: MessageReference = "https://t.me/somechannel/100".parse()?;
    /// let summary = orchestrator.start_batch(UserId(42), first, 25).await?;
    /// assert_eq!(summary.total, 25);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn start_batch(
        &self,
        user_id: UserId,
        first: MessageReference,
        count: usize,
    ) -> Result<BatchSummary> {
        self.start_batch_with(BatchRequest::new(user_id, first, count))
            .await
    }

    /// Start a batch from a full request
    pub async fn start_batch_with(&self, request: BatchRequest) -> Result<BatchSummary> {
        if !self.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let BatchRequest {
            user_id,
            first,
            count,
            destination,
        } = request;

        if count == 0 {
            return Err(BatchError::EmptyBatch.into());
        }
        let max = self.config.batch.max_batch_size;
        if count > max {
            return Err(BatchError::BatchTooLarge {
                requested: count,
                max,
            }
            .into());
        }
        let references = enumerate_references(&first, count)?;

        let session_id = self.next_session_id();
        let cancel = self.root_cancel.child_token();
        let (summary_tx, summary_rx) = watch::channel(BatchSummary {
            session_id,
            user_id,
            state: BatchState::AwaitingStart,
            first_reference: first,
            total: count,
            dispatched: 0,
            in_flight: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            last_reported: None,
            created_at: Utc::now(),
            paused_at: None,
            finished_at: None,
        });
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = SessionHandle {
            id: session_id,
            commands: commands_tx,
            summary: summary_rx,
        };

        self.registry.try_register(user_id, handle.clone()).await?;

        let session = BatchSession::new(
            self.clone(),
            session_id,
            user_id,
            destination.unwrap_or_else(|| Destination::from(user_id)),
            references,
            summary_tx,
            commands_rx,
            cancel,
        );
        tokio::spawn(session.run());

        // Return once the loop owns the session and has left AwaitingStart
        let mut summary = handle.summary;
        let started = summary
            .wait_for(|s| s.state != BatchState::AwaitingStart)
            .await
            .map(|s| s.clone())
            .map_err(|_| Error::Other(format!("batch session {session_id} stopped before starting")))?;
        Ok(started)
    }

    /// Stop dispatching new references; in-flight jobs run to completion
    ///
    /// Fails with [`BatchError::NotRunning`] unless the batch is running.
    pub async fn pause(&self, user_id: UserId) -> Result<BatchSummary> {
        self.send_command(user_id, SessionCommand::Pause).await
    }

    /// Continue dispatching from the unchanged cursor
    ///
    /// Fails with [`BatchError::NotPaused`] unless the batch is paused.
    pub async fn resume(&self, user_id: UserId) -> Result<BatchSummary> {
        self.send_command(user_id, SessionCommand::Resume).await
    }

    /// Abort in-flight jobs and discard the remaining references
    ///
    /// Returns as soon as the session has switched to cancelled. The session
    /// leaves the registry once every in-flight job has cleaned up; use
    /// [`BatchOrchestrator::wait_for_session`] to wait for that.
    pub async fn cancel(&self, user_id: UserId) -> Result<BatchSummary> {
        self.send_command(user_id, SessionCommand::Cancel).await
    }

    /// Summary of the user's registered session
    ///
    /// A cancelled session that is still draining is reported with state
    /// `Cancelled` until it leaves the registry.
    pub async fn status(&self, user_id: UserId) -> Result<BatchSummary> {
        self.registry
            .get(user_id)
            .await
            .map(|handle| handle.summary())
            .ok_or_else(|| BatchError::NoActiveSession { user_id }.into())
    }

    /// Summaries of every registered session, ordered by user
    pub async fn active_sessions(&self) -> Vec<BatchSummary> {
        let mut summaries: Vec<BatchSummary> = self
            .registry
            .handles()
            .await
            .iter()
            .map(SessionHandle::summary)
            .collect();
        summaries.sort_by_key(|s| s.user_id.0);
        summaries
    }

    /// Wait until the user's session has finished and left the registry
    ///
    /// Returns the final summary.
    pub async fn wait_for_session(&self, user_id: UserId) -> Result<BatchSummary> {
        let handle = self
            .registry
            .get(user_id)
            .await
            .ok_or(BatchError::NoActiveSession { user_id })?;
        handle.commands.closed().await;
        Ok(handle.summary())
    }

    /// Join a channel through the transport so its messages become readable
    pub async fn join_channel(&self, invite: &str) -> Result<()> {
        self.transport.join_channel(invite).await?;
        tracing::info!(invite, "joined channel");
        Ok(())
    }

    async fn send_command(
        &self,
        user_id: UserId,
        command: fn(oneshot::Sender<Result<BatchSummary>>) -> SessionCommand,
    ) -> Result<BatchSummary> {
        let no_session = || Error::from(BatchError::NoActiveSession { user_id });

        let handle = self.registry.get(user_id).await.ok_or_else(no_session)?;
        if !handle.is_live() {
            return Err(no_session());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        handle
            .commands
            .send(command(reply_tx))
            .await
            .map_err(|_| no_session())?;
        reply_rx.await.map_err(|_| no_session())?
    }
}
