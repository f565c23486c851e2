//! Transport collaborator interface
//!
//! The orchestrator never talks to the remote service directly. Everything
//! that touches the network goes through a [`Transport`] implementation
//! supplied by the surrounding application: resolving a reference, streaming
//! content down to a staging file and streaming it back up to a destination.
//! Text-only messages bypass staging and go out through
//! [`Transport::send_text`].

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::types::{ContentMetadata, Destination, MessageReference};

/// Byte progress callback: `(bytes_done, total_bytes)`
///
/// Implementations may call it as often as they like; throttling happens on
/// the orchestrator side.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Remote service operations used by transfer jobs
///
/// Every streaming operation receives a [`CancellationToken`]. Implementations
/// should stop I/O and return [`TransportError::Cancelled`] promptly once it
/// fires. The orchestrator also races each call against the token, so an
/// implementation that ignores it only delays its own cleanup, never the job.
///
/// Per-attempt timeouts belong to the implementation and are reported as
/// [`TransportError::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolve a reference to content metadata
    ///
    /// Returns [`TransportError::NotFound`] for deleted or never-existing
    /// messages; the job reports those as skipped.
    async fn resolve(&self, reference: &MessageReference) -> Result<ContentMetadata, TransportError>;

    /// Stream content to `local_path`, returning the number of bytes written
    async fn download_to(
        &self,
        content: &ContentMetadata,
        local_path: &Path,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError>;

    /// Stream the staged file at `local_path` to `destination`
    async fn upload_from(
        &self,
        local_path: &Path,
        content: &ContentMetadata,
        destination: &Destination,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Send a text-only message to `destination`
    ///
    /// Used for content resolved as [`ContentKind::Text`](crate::types::ContentKind::Text).
    async fn send_text(
        &self,
        content: &ContentMetadata,
        text: &str,
        destination: &Destination,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Join a channel from an invite link
    ///
    /// Not used by batch processing; exposed so the command layer can make
    /// private sources readable before starting a batch.
    async fn join_channel(&self, invite: &str) -> Result<(), TransportError>;

    /// Re-establish the underlying connection
    ///
    /// Called before retrying after a crash-class failure. The default does
    /// nothing, for transports that reconnect on their own.
    async fn reconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
