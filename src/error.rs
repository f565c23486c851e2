//! Error types for msg-relay
//!
//! This module provides the error hierarchy for the library:
//! - [`Error`] - top-level error returned by public operations
//! - [`BatchError`] - batch session control errors (start/pause/resume/cancel/status)
//! - [`TransportError`] - failures reported by the transport collaborator
//!
//! Every error carries a stable, machine-readable code so the command layer can
//! map it to a reply without matching on display strings.

use std::time::Duration;
use thiserror::Error;

use crate::types::{BatchState, UserId};

/// Result type alias for msg-relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for msg-relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "batch.concurrency")
        key: Option<String>,
    },

    /// Batch session control error
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// Transport collaborator error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A message link or reference could not be understood
    #[error("invalid message reference: {0}")]
    InvalidReference(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new batches
    #[error("shutdown in progress: not accepting new batches")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Batch session control errors
#[derive(Debug, Error)]
pub enum BatchError {
    /// The user already has a live batch
    #[error("user {user_id} already has a batch running")]
    AlreadyRunning {
        /// User that owns the live batch
        user_id: UserId,
    },

    /// Requested batch is above the configured cap
    #[error("batch of {requested} messages exceeds the maximum of {max}")]
    BatchTooLarge {
        /// Number of messages requested
        requested: usize,
        /// Configured maximum batch size
        max: usize,
    },

    /// Requested batch contains no messages
    #[error("batch must contain at least one message")]
    EmptyBatch,

    /// The user has no live batch
    #[error("user {user_id} has no active batch")]
    NoActiveSession {
        /// User that was looked up
        user_id: UserId,
    },

    /// Operation requires a running batch
    #[error("batch for user {user_id} is not running (state: {state})")]
    NotRunning {
        /// Owning user
        user_id: UserId,
        /// State the batch was in
        state: BatchState,
    },

    /// Operation requires a paused batch
    #[error("batch for user {user_id} is not paused (state: {state})")]
    NotPaused {
        /// Owning user
        user_id: UserId,
        /// State the batch was in
        state: BatchState,
    },
}

/// Failures reported by the transport collaborator
///
/// The orchestrator never inspects display strings: classification into
/// transient/fatal/crash-class goes through [`TransportError::code`] and the
/// retry policy's classification table.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The referenced message does not exist (deleted, never existed)
    #[error("message not found: {0}")]
    NotFound(String),

    /// The account may not read the source or write the destination
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The destination permanently refused the content
    #[error("content rejected: {0}")]
    Rejected(String),

    /// The message carries nothing that can be relayed
    #[error("unsupported message type: {0}")]
    Unsupported(String),

    /// The operation did not finish within the transport's per-attempt timeout
    #[error("operation timed out")]
    Timeout,

    /// The remote side closed the stream
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// The remote service asked us to slow down
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Wait requested by the remote service, if it sent one
        retry_after: Option<Duration>,
    },

    /// The underlying connection object is no longer usable
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The operation was aborted by a cancel signal
    #[error("operation cancelled")]
    Cancelled,

    /// Local I/O failure while staging content
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Stable code used as the key of the retry classification table
    pub fn code(&self) -> &'static str {
        match self {
            TransportError::NotFound(_) => "not_found",
            TransportError::AccessDenied(_) => "access_denied",
            TransportError::Rejected(_) => "rejected",
            TransportError::Unsupported(_) => "unsupported",
            TransportError::Timeout => "timeout",
            TransportError::Disconnected(_) => "disconnected",
            TransportError::RateLimited { .. } => "rate_limited",
            TransportError::ConnectionLost(_) => "connection_lost",
            TransportError::Cancelled => "cancelled",
            TransportError::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => "io_timeout",
                std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::NotConnected
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted => "io_connection",
                _ => "io_error",
            },
            TransportError::Other(_) => "other",
        }
    }

    /// Wait the remote service asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl Error {
    /// Machine-readable error code for the command layer
    pub fn code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Batch(e) => match e {
                BatchError::AlreadyRunning { .. } => "already_running",
                BatchError::BatchTooLarge { .. } => "batch_too_large",
                BatchError::EmptyBatch => "empty_batch",
                BatchError::NoActiveSession { .. } => "no_active_session",
                BatchError::NotRunning { .. } => "not_running",
                BatchError::NotPaused { .. } => "not_paused",
            },
            Error::Transport(e) => e.code(),
            Error::InvalidReference(_) => "invalid_reference",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
            Error::ShuttingDown => "shutting_down",
            Error::Other(_) => "internal_error",
        }
    }

    /// Shorthand for a configuration error on a specific key
    pub(crate) fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }
}
