//! Process-wide map from user to their live batch session

use std::collections::HashMap;
use tokio::sync::{Mutex, mpsc, oneshot, watch};

use crate::error::{BatchError, Result};
use crate::types::{BatchSummary, SessionId, UserId};

/// Control message sent to a session's loop
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Pause(oneshot::Sender<Result<BatchSummary>>),
    Resume(oneshot::Sender<Result<BatchSummary>>),
    Cancel(oneshot::Sender<Result<BatchSummary>>),
}

/// Cheap handle onto a running session
///
/// The registry only holds handles; the session loop owns all mutable batch
/// state and publishes it through the summary channel.
#[derive(Clone, Debug)]
pub(crate) struct SessionHandle {
    pub(crate) id: SessionId,
    pub(crate) commands: mpsc::Sender<SessionCommand>,
    pub(crate) summary: watch::Receiver<BatchSummary>,
}

impl SessionHandle {
    /// Current summary as last published by the loop
    pub(crate) fn summary(&self) -> BatchSummary {
        self.summary.borrow().clone()
    }

    /// Running, paused or not yet started
    pub(crate) fn is_live(&self) -> bool {
        !self.summary.borrow().state.is_terminal()
    }
}

/// Registry of batch sessions, at most one live session per user
///
/// All mutation happens under a single lock, so a `start` racing the removal
/// of a finishing session can never leave two live sessions for one user.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<UserId, SessionHandle>>,
}

impl SessionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session unless the user already has a live one
    ///
    /// A terminal session that is still draining its in-flight jobs is
    /// superseded: the new handle replaces it and the old loop's later
    /// [`SessionRegistry::remove`] becomes a no-op.
    pub(crate) async fn try_register(
        &self,
        user_id: UserId,
        handle: SessionHandle,
    ) -> std::result::Result<(), BatchError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&user_id) {
            if existing.is_live() {
                return Err(BatchError::AlreadyRunning { user_id });
            }
            tracing::debug!(
                user_id = user_id.0,
                old_session = existing.id.0,
                new_session = handle.id.0,
                "superseding finished session"
            );
        }
        sessions.insert(user_id, handle);
        Ok(())
    }

    pub(crate) async fn get(&self, user_id: UserId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&user_id).cloned()
    }

    /// Remove the user's entry if it still belongs to `session_id`
    pub(crate) async fn remove(&self, user_id: UserId, session_id: SessionId) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&user_id) {
            Some(handle) if handle.id == session_id => {
                sessions.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub(crate) async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.lock().await.values().cloned().collect()
    }

    /// Number of registered sessions, including ones still draining
    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Whether no session is registered
    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    /// Users with a registered session
    pub async fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.lock().await.keys().copied().collect();
        users.sort_by_key(|u| u.0);
        users
    }
}
