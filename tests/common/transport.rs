//! Filesystem-backed transport
//!
//! "Remote" messages are files in a source directory: `<message_id>.bin`
//! for media, `<message_id>.txt` for text-only messages and an empty
//! `<message_id>.poll` for anything that cannot be relayed. Delivery writes
//! into `<delivery_dir>/<destination>/<file_name>`.

use async_trait::async_trait;
use msg_relay::{
    ContentKind, ContentMetadata, Destination, MessageReference, ProgressFn, Transport, TransportError,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const CHUNK: usize = 1024;

pub struct LoopbackTransport {
    source_dir: PathBuf,
    delivery_dir: PathBuf,
    chunk_delay: Duration,
    stalled: Mutex<HashSet<i64>>,
    failures: Mutex<HashMap<i64, VecDeque<TransportError>>>,
    attempts: Mutex<HashMap<i64, u32>>,
}

impl LoopbackTransport {
    pub fn new(source_dir: &Path, delivery_dir: &Path) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            delivery_dir: delivery_dir.to_path_buf(),
            chunk_delay: Duration::from_millis(1),
            stalled: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Put a message with `content` on the "remote" side
    pub fn publish(&self, message_id: i64, content: &[u8]) {
        std::fs::write(self.source_dir.join(format!("{message_id}.bin")), content).unwrap();
    }

    /// Put a text-only message on the "remote" side
    pub fn publish_text(&self, message_id: i64, text: &str) {
        std::fs::write(self.source_dir.join(format!("{message_id}.txt")), text).unwrap();
    }

    /// Put a message with neither media nor text on the "remote" side
    pub fn publish_poll(&self, message_id: i64) {
        std::fs::write(self.source_dir.join(format!("{message_id}.poll")), b"").unwrap();
    }

    /// Downloads of `message_id` block until cancelled
    pub fn stall(&self, message_id: i64) {
        self.stalled.lock().unwrap().insert(message_id);
    }

    /// The next downloads of `message_id` fail with these errors
    pub fn fail_next(&self, message_id: i64, errors: Vec<TransportError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(message_id, errors.into());
    }

    pub fn download_attempts(&self, message_id: i64) -> u32 {
        self.attempts
            .lock()
            .unwrap()
            .get(&message_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn delivered_path(&self, destination: Destination, file_name: &str) -> PathBuf {
        self.delivery_dir
            .join(destination.0.to_string())
            .join(file_name)
    }

    fn source_path(&self, message_id: i64) -> PathBuf {
        self.source_dir.join(format!("{message_id}.bin"))
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn resolve(&self, reference: &MessageReference) -> Result<ContentMetadata, TransportError> {
        let id = reference.message_id;
        if let Ok(text) = tokio::fs::read_to_string(self.source_dir.join(format!("{id}.txt"))).await {
            return Ok(ContentMetadata {
                reference: reference.clone(),
                file_name: None,
                size_bytes: text.len() as u64,
                mime_type: Some("text/plain".to_string()),
                kind: ContentKind::Text { text },
            });
        }
        if self.source_dir.join(format!("{id}.poll")).exists() {
            return Ok(ContentMetadata {
                reference: reference.clone(),
                file_name: None,
                size_bytes: 0,
                mime_type: None,
                kind: ContentKind::Unsupported,
            });
        }

        let path = self.source_path(id);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::NotFound(reference.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(ContentMetadata {
            reference: reference.clone(),
            file_name: Some(format!("{}.bin", reference.message_id)),
            size_bytes: metadata.len(),
            mime_type: None,
            kind: ContentKind::Media,
        })
    }

    async fn download_to(
        &self,
        content: &ContentMetadata,
        local_path: &Path,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError> {
        let id = content.reference.message_id;
        *self.attempts.lock().unwrap().entry(id).or_insert(0) += 1;

        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        let data = tokio::fs::read(self.source_path(id)).await?;
        let total = data.len() as u64;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;
        on_progress(0, total);

        let stalled = self.stalled.lock().unwrap().contains(&id);
        if stalled {
            // Leave a partial file behind, like an interrupted transfer would
            file.write_all(&data[..data.len().min(CHUNK)]).await?;
            file.flush().await?;
            cancel.cancelled().await;
            return Err(TransportError::Cancelled);
        }

        for chunk in data.chunks(CHUNK) {
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            file.write_all(chunk).await?;
            written += chunk.len() as u64;
            on_progress(written, total);
            tokio::time::sleep(self.chunk_delay).await;
        }
        file.flush().await?;
        Ok(written)
    }

    async fn upload_from(
        &self,
        local_path: &Path,
        content: &ContentMetadata,
        destination: &Destination,
        on_progress: ProgressFn,
        _cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let file_name = content
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.bin", content.reference.message_id));
        let target = self.delivered_path(*destination, &file_name);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let copied = tokio::fs::copy(local_path, &target).await?;
        on_progress(copied, copied);
        Ok(())
    }

    async fn send_text(
        &self,
        content: &ContentMetadata,
        text: &str,
        destination: &Destination,
        _cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let target =
            self.delivered_path(*destination, &format!("{}.txt", content.reference.message_id));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, text).await?;
        Ok(())
    }

    async fn join_channel(&self, _invite: &str) -> Result<(), TransportError> {
        Ok(())
    }
}
