//! Shared test helpers: a scripted in-memory transport and orchestrator setup.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::TransportError;
use crate::orchestrator::BatchOrchestrator;
use crate::transport::{ProgressFn, Transport};
use crate::types::{ChatRef, ContentKind, ContentMetadata, Destination, Event, MessageReference};

/// Transport whose behaviour is scripted per message id
///
/// Unscripted messages resolve to `content_size` bytes, stage after
/// `default_delay` and deliver immediately.
pub(crate) struct ScriptedTransport {
    content_size: u64,
    default_delay: Duration,
    delays: Mutex<HashMap<i64, Duration>>,
    sizes: Mutex<HashMap<i64, u64>>,
    missing: Mutex<HashSet<i64>>,
    hanging: Mutex<HashSet<i64>>,
    unresponsive_downloads: Mutex<HashSet<i64>>,
    unresponsive_uploads: Mutex<HashSet<i64>>,
    texts: Mutex<HashMap<i64, String>>,
    unsupported: Mutex<HashSet<i64>>,
    download_failures: Mutex<HashMap<i64, VecDeque<TransportError>>>,
    upload_failures: Mutex<HashMap<i64, VecDeque<TransportError>>>,
    /// Message ids in the order they were delivered
    pub(crate) delivered: Mutex<Vec<i64>>,
    /// Text messages sent, as (message id, body)
    pub(crate) sent_texts: Mutex<Vec<(i64, String)>>,
    /// Number of download attempts per message id
    pub(crate) download_calls: Mutex<HashMap<i64, u32>>,
    /// Staged paths seen by downloads
    pub(crate) staged_paths: Mutex<Vec<PathBuf>>,
    pub(crate) reconnects: AtomicU32,
    pub(crate) joined: Mutex<Vec<String>>,
    active: AtomicUsize,
    /// Highest number of simultaneous downloads observed
    pub(crate) max_active: AtomicUsize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            content_size: 4096,
            default_delay: Duration::from_millis(5),
            delays: Mutex::new(HashMap::new()),
            sizes: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashSet::new()),
            hanging: Mutex::new(HashSet::new()),
            unresponsive_downloads: Mutex::new(HashSet::new()),
            unresponsive_uploads: Mutex::new(HashSet::new()),
            texts: Mutex::new(HashMap::new()),
            unsupported: Mutex::new(HashSet::new()),
            download_failures: Mutex::new(HashMap::new()),
            upload_failures: Mutex::new(HashMap::new()),
            delivered: Mutex::new(Vec::new()),
            sent_texts: Mutex::new(Vec::new()),
            download_calls: Mutex::new(HashMap::new()),
            staged_paths: Mutex::new(Vec::new()),
            reconnects: AtomicU32::new(0),
            joined: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Staging of `message_id` takes `delay`
    pub(crate) fn with_delay(self, message_id: i64, delay: Duration) -> Self {
        self.delays.lock().unwrap().insert(message_id, delay);
        self
    }

    pub(crate) fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    pub(crate) fn with_size(self, message_id: i64, size: u64) -> Self {
        self.sizes.lock().unwrap().insert(message_id, size);
        self
    }

    /// `message_id` resolves to NotFound
    pub(crate) fn with_missing(self, message_id: i64) -> Self {
        self.missing.lock().unwrap().insert(message_id);
        self
    }

    /// Staging of `message_id` never finishes until cancelled
    pub(crate) fn with_hang(self, message_id: i64) -> Self {
        self.hanging.lock().unwrap().insert(message_id);
        self
    }

    /// Staging of `message_id` never returns and ignores its cancel token
    pub(crate) fn with_unresponsive_download(self, message_id: i64) -> Self {
        self.unresponsive_downloads.lock().unwrap().insert(message_id);
        self
    }

    /// Delivery of `message_id` never returns and ignores its cancel token
    pub(crate) fn with_unresponsive_upload(self, message_id: i64) -> Self {
        self.unresponsive_uploads.lock().unwrap().insert(message_id);
        self
    }

    /// `message_id` is a text-only message
    pub(crate) fn with_text(self, message_id: i64, text: &str) -> Self {
        self.texts.lock().unwrap().insert(message_id, text.to_string());
        self
    }

    /// `message_id` carries neither media nor text
    pub(crate) fn with_unsupported(self, message_id: i64) -> Self {
        self.unsupported.lock().unwrap().insert(message_id);
        self
    }

    pub(crate) fn sent_texts(&self) -> Vec<(i64, String)> {
        self.sent_texts.lock().unwrap().clone()
    }

    /// The next downloads of `message_id` fail with these errors, in order
    pub(crate) fn with_download_failures(self, message_id: i64, errors: Vec<TransportError>) -> Self {
        self.download_failures
            .lock()
            .unwrap()
            .insert(message_id, errors.into());
        self
    }

    /// The next uploads of `message_id` fail with these errors, in order
    pub(crate) fn with_upload_failures(self, message_id: i64, errors: Vec<TransportError>) -> Self {
        self.upload_failures
            .lock()
            .unwrap()
            .insert(message_id, errors.into());
        self
    }

    pub(crate) fn delivered(&self) -> Vec<i64> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn download_calls(&self, message_id: i64) -> u32 {
        self.download_calls
            .lock()
            .unwrap()
            .get(&message_id)
            .copied()
            .unwrap_or(0)
    }

    fn size_of(&self, message_id: i64) -> u64 {
        self.sizes
            .lock()
            .unwrap()
            .get(&message_id)
            .copied()
            .unwrap_or(self.content_size)
    }

    async fn download_inner(
        &self,
        content: &ContentMetadata,
        local_path: &Path,
        on_progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<u64, TransportError> {
        let id = content.reference.message_id;
        *self.download_calls.lock().unwrap().entry(id).or_insert(0) += 1;
        self.staged_paths
            .lock()
            .unwrap()
            .push(local_path.to_path_buf());

        let total = content.size_bytes;
        on_progress(0, total);
        // Partial content exists on disk while the transfer runs
        tokio::fs::write(local_path, vec![0u8; (total / 2) as usize]).await?;

        let unresponsive = self.unresponsive_downloads.lock().unwrap().contains(&id);
        if unresponsive {
            return std::future::pending().await;
        }

        let hang = self.hanging.lock().unwrap().contains(&id);
        if hang {
            cancel.cancelled().await;
            return Err(TransportError::Cancelled);
        }

        let delay = self
            .delays
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(self.default_delay);
        tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        let failure = self
            .download_failures
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        tokio::fs::write(local_path, vec![7u8; total as usize]).await?;
        on_progress(total / 2, total);
        on_progress(total, total);
        Ok(total)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn resolve(&self, reference: &MessageReference) -> Result<ContentMetadata, TransportError> {
        let missing = self.missing.lock().unwrap().contains(&reference.message_id);
        if missing {
            return Err(TransportError::NotFound(reference.to_string()));
        }
        let id = reference.message_id;
        let text = self.texts.lock().unwrap().get(&id).cloned();
        if let Some(text) = text {
            return Ok(ContentMetadata {
                reference: reference.clone(),
                file_name: None,
                size_bytes: text.len() as u64,
                mime_type: None,
                kind: ContentKind::Text { text },
            });
        }
        let unsupported = self.unsupported.lock().unwrap().contains(&id);
        if unsupported {
            return Ok(ContentMetadata {
                reference: reference.clone(),
                file_name: None,
                size_bytes: 0,
                mime_type: None,
                kind: ContentKind::Unsupported,
            });
        }
        Ok(ContentMetadata {
            reference: reference.clone(),
            file_name: Some(format!("file_{id}.bin")),
            size_bytes: self.size_of(id),
            mime_type: Some("application/octet-stream".to_string()),
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
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        let result = self
            .download_inner(content, local_path, on_progress, cancel)
            .await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn upload_from(
        &self,
        local_path: &Path,
        content: &ContentMetadata,
        _destination: &Destination,
        on_progress: ProgressFn,
        _cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let id = content.reference.message_id;
        let unresponsive = self.unresponsive_uploads.lock().unwrap().contains(&id);
        if unresponsive {
            return std::future::pending().await;
        }
        if !local_path.exists() {
            return Err(TransportError::Other(format!(
                "staged file missing: {}",
                local_path.display()
            )));
        }
        let failure = self
            .upload_failures
            .lock()
            .unwrap()
            .get_mut(&id)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }
        on_progress(content.size_bytes, content.size_bytes);
        self.delivered.lock().unwrap().push(id);
        Ok(())
    }

    async fn send_text(
        &self,
        content: &ContentMetadata,
        text: &str,
        _destination: &Destination,
        _cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let id = content.reference.message_id;
        self.sent_texts.lock().unwrap().push((id, text.to_string()));
        self.delivered.lock().unwrap().push(id);
        Ok(())
    }

    async fn join_channel(&self, invite: &str) -> Result<(), TransportError> {
        self.joined.lock().unwrap().push(invite.to_string());
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Config tuned for fast tests: millisecond backoff, no jitter
pub(crate) fn test_config(staging_dir: &Path) -> Config {
    let mut config = Config::default();
    config.staging.staging_dir = staging_dir.to_path_buf();
    config.retry.base_delay = Duration::from_millis(10);
    config.retry.max_delay = Duration::from_millis(50);
    config.retry.jitter_ratio = 0.0;
    config.progress.min_interval = Duration::from_millis(10);
    config
}

/// Helper to create a test orchestrator around a scripted transport.
/// Returns the orchestrator and the tempdir (which must be kept alive).
pub(crate) async fn create_test_orchestrator(
    transport: Arc<ScriptedTransport>,
    tweak: impl FnOnce(&mut Config),
) -> (BatchOrchestrator, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(&temp_dir.path().join("staging"));
    tweak(&mut config);
    let orchestrator = BatchOrchestrator::new(config, transport).await.unwrap();
    (orchestrator, temp_dir)
}

pub(crate) fn chan_ref(message_id: i64) -> MessageReference {
    MessageReference::new(ChatRef::Username("testchannel".to_string()), message_id)
}

/// Receive events until `pred` matches, failing the test after 5 seconds
pub(crate) async fn wait_for_event(
    events: &mut broadcast::Receiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Files left in the staging directory
pub(crate) fn staged_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    }
}
