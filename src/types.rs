//! Core types for msg-relay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identity of the user who owns a batch
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Locally unique identifier of a transfer job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one batch session (distinguishes successive batches of the same user)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The chat a message lives in
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRef {
    /// Public channel or group addressed by username
    Username(String),
    /// Private channel addressed by numeric id (stored in `-100` prefixed form)
    Id(i64),
}

impl std::fmt::Display for ChatRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatRef::Username(name) => write!(f, "@{name}"),
            ChatRef::Id(id) => write!(f, "{id}"),
        }
    }
}

/// Identifies one remote message: chat, optional forum topic, message id
///
/// Immutable once created. Batches are enumerated by [`MessageReference::offset`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageReference {
    /// Chat containing the message
    pub chat: ChatRef,
    /// Forum topic (thread) id, if the link pointed into a topic
    pub topic_id: Option<i64>,
    /// Message id within the chat
    pub message_id: i64,
}

impl MessageReference {
    /// Create a reference without a topic
    pub fn new(chat: ChatRef, message_id: i64) -> Self {
        Self {
            chat,
            topic_id: None,
            message_id,
        }
    }

    /// Reference `n` messages after this one in the same chat and topic
    ///
    /// Returns `None` on message id overflow.
    pub fn offset(&self, n: usize) -> Option<Self> {
        let n = i64::try_from(n).ok()?;
        Some(Self {
            chat: self.chat.clone(),
            topic_id: self.topic_id,
            message_id: self.message_id.checked_add(n)?,
        })
    }

    /// Whether reaching this chat needs a user account (private channel)
    pub fn is_private(&self) -> bool {
        matches!(self.chat, ChatRef::Id(_))
    }
}

impl std::fmt::Display for MessageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.chat {
            ChatRef::Username(name) => write!(f, "https://t.me/{name}")?,
            ChatRef::Id(id) => {
                let bare = id.to_string();
                let bare = bare.strip_prefix("-100").unwrap_or(&bare);
                write!(f, "https://t.me/c/{bare}")?;
            }
        }
        if let Some(topic) = self.topic_id {
            write!(f, "/{topic}")?;
        }
        write!(f, "/{}", self.message_id)
    }
}

/// Where delivered content is sent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Destination(pub i64);

impl From<UserId> for Destination {
    fn from(user: UserId) -> Self {
        Self(user.0)
    }
}

/// What the transport learned about a message when resolving it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentMetadata {
    /// The resolved reference
    pub reference: MessageReference,
    /// Original file name, if the message carries a named file
    pub file_name: Option<String>,
    /// Expected content size in bytes (0 if unknown)
    pub size_bytes: u64,
    /// MIME type, if known
    pub mime_type: Option<String>,
    /// What the message carries
    #[serde(default)]
    pub kind: ContentKind,
}

/// Payload of a resolved message
///
/// Only media goes through staging. Text is sent straight to the destination
/// and messages with neither are skipped.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentKind {
    /// A downloadable attachment
    #[default]
    Media,
    /// A text-only message
    Text {
        /// Message body
        text: String,
    },
    /// Polls, service messages and anything else that cannot be relayed
    Unsupported,
}

/// Direction of a byte stream, used to tag progress samples
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Staging: remote → local disk
    Download,
    /// Delivering: local disk → destination
    Upload,
}

/// Phase of a transfer job
///
/// `Pending → Fetching → Staging → Delivering → Cleaning → {Succeeded | Failed | Skipped}`.
/// Text messages go from `Fetching` straight to `Delivering`. Every
/// pre-terminal phase may route to `Cleaning`; terminal phases are only
/// reachable from `Cleaning`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Queued, waiting for a transfer slot
    Pending,
    /// Resolving the reference to content metadata
    Fetching,
    /// Streaming content to local storage
    Staging,
    /// Streaming staged content to the destination
    Delivering,
    /// Removing the staged file
    Cleaning,
    /// Delivered and cleaned up
    Succeeded,
    /// Retries exhausted or fatal error
    Failed,
    /// Unresolvable reference or cancelled
    Skipped,
}

impl JobPhase {
    /// Whether the job has finished
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobPhase::Succeeded | JobPhase::Failed | JobPhase::Skipped
        )
    }

    /// Legal edges of the job state machine
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        use JobPhase::*;
        match (self, next) {
            (Pending, Fetching) => true,
            (Fetching, Staging | Delivering) => true,
            (Staging, Delivering) => true,
            (Pending | Fetching | Staging | Delivering, Cleaning) => true,
            (Cleaning, Succeeded | Failed | Skipped) => true,
            _ => false,
        }
    }

    /// Byte stream direction active in this phase
    pub fn direction(&self) -> Option<TransferDirection> {
        match self {
            JobPhase::Staging => Some(TransferDirection::Download),
            JobPhase::Delivering => Some(TransferDirection::Upload),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobPhase::Pending => "pending",
            JobPhase::Fetching => "fetching",
            JobPhase::Staging => "staging",
            JobPhase::Delivering => "delivering",
            JobPhase::Cleaning => "cleaning",
            JobPhase::Succeeded => "succeeded",
            JobPhase::Failed => "failed",
            JobPhase::Skipped => "skipped",
        };
        f.write_str(name)
    }
}

/// How a failed attempt is treated by the retry policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable transport/network condition
    Transient,
    /// Permanent per-item failure
    Fatal,
    /// Transport connection unusable; reconnect before retrying
    CrashClass,
    /// User-initiated abort
    Cancelled,
}

/// Terminal outcome of a transfer job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    /// Delivered
    Succeeded,
    /// Retries exhausted or fatal error
    Failed,
    /// Unresolvable reference, or cancelled mid-flight
    Skipped,
}

impl From<JobOutcome> for JobPhase {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded => JobPhase::Succeeded,
            JobOutcome::Failed => JobPhase::Failed,
            JobOutcome::Skipped => JobPhase::Skipped,
        }
    }
}

/// Final result of one transfer job, reported to the user in sequence order
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobReport {
    /// Job identifier
    pub job_id: JobId,
    /// Position of the reference in the batch (0-based)
    pub seq: usize,
    /// The transferred reference
    pub reference: MessageReference,
    /// Terminal outcome
    pub outcome: JobOutcome,
    /// Attempts made (1 + retries)
    pub attempts: u32,
    /// Classification of the last error, if any
    pub error_kind: Option<FailureKind>,
    /// Transport error code of the last error (e.g. "not_found")
    pub error_code: Option<String>,
    /// Human-readable last error
    pub error: Option<String>,
    /// File name of the delivered content, if any
    pub file_name: Option<String>,
    /// Bytes delivered to the destination
    pub bytes_delivered: u64,
    /// Wall time from first fetch to terminal phase
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
    /// Set when the staged file could not be removed
    pub cleanup_error: Option<String>,
}

impl JobReport {
    /// Whether the job was skipped because of a cancel signal
    pub fn was_cancelled(&self) -> bool {
        self.outcome == JobOutcome::Skipped && self.error_kind == Some(FailureKind::Cancelled)
    }
}

/// State of a batch session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    /// Created, dispatch loop not yet running
    AwaitingStart,
    /// Dispatching references
    Running,
    /// No new dispatches; in-flight jobs continue
    Paused,
    /// Cancelled by the user or by shutdown
    Cancelled,
    /// Every reference reached a terminal outcome
    Completed,
}

impl BatchState {
    /// Whether the session will never dispatch again
    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchState::Cancelled | BatchState::Completed)
    }
}

impl std::fmt::Display for BatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BatchState::AwaitingStart => "awaiting_start",
            BatchState::Running => "running",
            BatchState::Paused => "paused",
            BatchState::Cancelled => "cancelled",
            BatchState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Snapshot of a batch session for status replies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Session identifier
    pub session_id: SessionId,
    /// Owning user
    pub user_id: UserId,
    /// Current state
    pub state: BatchState,
    /// First reference of the batch
    pub first_reference: MessageReference,
    /// Number of references enumerated
    pub total: usize,
    /// References handed to the worker pool so far (the cursor)
    pub dispatched: usize,
    /// Jobs dispatched but not yet terminal
    pub in_flight: usize,
    /// Jobs that delivered their content
    pub succeeded: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Jobs skipped (unresolvable or cancelled)
    pub skipped: usize,
    /// Last reference reported to the user, in sequence order
    pub last_reported: Option<MessageReference>,
    /// When the batch was created
    pub created_at: DateTime<Utc>,
    /// When the batch was last paused (None while not paused)
    pub paused_at: Option<DateTime<Utc>>,
    /// When the batch completed or finished draining after a cancel
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl BatchSummary {
    /// Jobs that reached a terminal outcome
    pub fn finished(&self) -> usize {
        self.succeeded + self.failed + self.skipped
    }

    /// Share of the batch that is finished (0.0 to 100.0)
    pub fn percent(&self) -> f32 {
        if self.total == 0 {
            return 100.0;
        }
        self.finished() as f32 / self.total as f32 * 100.0
    }

    /// Wall-clock run time, once the batch has finished
    pub fn elapsed(&self) -> Option<Duration> {
        let finished_at = self.finished_at?;
        (finished_at - self.created_at).to_std().ok()
    }

    /// Finished items per second over the whole run
    pub fn items_per_second(&self) -> Option<f64> {
        let secs = self.elapsed()?.as_secs_f64();
        (secs > 0.0).then(|| self.finished() as f64 / secs)
    }
}

/// Throttled, human-relevant view of a job's byte progress
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Job the snapshot belongs to
    pub job_id: JobId,
    /// Download (staging) or upload (delivering)
    pub direction: TransferDirection,
    /// Progress percentage (0.0 to 100.0)
    pub percent: f32,
    /// Bytes transferred so far
    pub bytes_done: u64,
    /// Expected total bytes (0 if unknown)
    pub total_bytes: u64,
    /// Smoothed speed in bytes per second
    pub speed_bps: u64,
    /// Estimated seconds remaining (None if unknown)
    pub eta_seconds: Option<u64>,
    /// Human-readable size, e.g. "12.5 MB / 40.0 MB"
    pub size_display: String,
}

/// Event emitted by the orchestrator for the command layer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A batch session was created and started
    BatchStarted {
        /// Owning user
        user_id: UserId,
        /// Session identifier
        session_id: SessionId,
        /// First reference
        first: MessageReference,
        /// Number of references
        total: usize,
    },

    /// A reference was handed to the worker pool
    JobDispatched {
        /// Owning user
        user_id: UserId,
        /// Job identifier
        job_id: JobId,
        /// Sequence position
        seq: usize,
        /// Reference being transferred
        reference: MessageReference,
    },

    /// A job entered a new phase
    JobPhaseChanged {
        /// Owning user
        user_id: UserId,
        /// Job identifier
        job_id: JobId,
        /// Sequence position
        seq: usize,
        /// New phase
        phase: JobPhase,
    },

    /// Throttled byte progress of a job
    Progress {
        /// Owning user
        user_id: UserId,
        /// Sequence position
        seq: usize,
        /// Progress snapshot
        snapshot: ProgressSnapshot,
    },

    /// A failed attempt will be retried
    JobRetrying {
        /// Owning user
        user_id: UserId,
        /// Job identifier
        job_id: JobId,
        /// Sequence position
        seq: usize,
        /// Attempt that failed (1-based)
        attempt: u32,
        /// Wait before the next attempt in milliseconds
        delay_ms: u64,
        /// Error message of the failed attempt
        error: String,
    },

    /// A job's terminal outcome, emitted strictly in sequence order
    ItemReported {
        /// Owning user
        user_id: UserId,
        /// The job report
        report: JobReport,
    },

    /// A batch was paused
    BatchPaused {
        /// Owning user
        user_id: UserId,
    },

    /// A batch was resumed
    BatchResumed {
        /// Owning user
        user_id: UserId,
    },

    /// A batch was cancelled and all of its in-flight jobs are terminal
    BatchCancelled {
        /// Final summary
        summary: BatchSummary,
    },

    /// A batch finished every reference
    BatchCompleted {
        /// Final summary
        summary: BatchSummary,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

impl Event {
    /// User the event concerns, if any
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            Event::BatchStarted { user_id, .. }
            | Event::JobDispatched { user_id, .. }
            | Event::JobPhaseChanged { user_id, .. }
            | Event::Progress { user_id, .. }
            | Event::JobRetrying { user_id, .. }
            | Event::ItemReported { user_id, .. }
            | Event::BatchPaused { user_id }
            | Event::BatchResumed { user_id } => Some(*user_id),
            Event::BatchCancelled { summary } | Event::BatchCompleted { summary } => {
                Some(summary.user_id)
            }
            Event::Shutdown => None,
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn public_ref(id: i64) -> MessageReference {
        MessageReference::new(ChatRef::Username("somechannel".into()), id)
    }

    #[test]
    fn offset_keeps_chat_and_topic() {
        let mut reference = public_ref(100);
        reference.topic_id = Some(4);

        let later = reference.offset(5).unwrap();
        assert_eq!(later.message_id, 105);
        assert_eq!(later.topic_id, Some(4));
        assert_eq!(later.chat, reference.chat);
    }

    #[test]
    fn offset_reports_overflow_instead_of_wrapping() {
        let reference = public_ref(i64::MAX - 1);
        assert!(reference.offset(1).is_some());
        assert!(reference.offset(2).is_none());
    }

    #[test]
    fn private_reference_displays_without_channel_prefix() {
        let reference = MessageReference::new(ChatRef::Id(-1001234567890), 42);
        assert_eq!(reference.to_string(), "https://t.me/c/1234567890/42");
        assert!(reference.is_private());
    }

    #[test]
    fn topic_reference_displays_topic_segment() {
        let mut reference = public_ref(9);
        reference.topic_id = Some(3);
        assert_eq!(reference.to_string(), "https://t.me/somechannel/3/9");
    }

    #[test]
    fn job_phase_only_reaches_terminal_through_cleaning() {
        use JobPhase::*;
        for from in [Pending, Fetching, Staging, Delivering] {
            for to in [Succeeded, Failed, Skipped] {
                assert!(
                    !from.can_transition_to(to),
                    "{from} must not jump straight to {to}"
                );
            }
            assert!(from.can_transition_to(Cleaning));
        }
        for to in [Succeeded, Failed, Skipped] {
            assert!(Cleaning.can_transition_to(to));
        }
    }

    #[test]
    fn job_phase_forward_edges_only() {
        use JobPhase::*;
        assert!(Pending.can_transition_to(Fetching));
        assert!(Fetching.can_transition_to(Staging));
        // text has nothing to stage
        assert!(Fetching.can_transition_to(Delivering));
        assert!(Staging.can_transition_to(Delivering));
        assert!(!Delivering.can_transition_to(Staging));
        assert!(!Staging.can_transition_to(Fetching));
        assert!(!Succeeded.can_transition_to(Cleaning));
    }

    #[test]
    fn summary_percent_counts_all_terminal_outcomes() {
        let summary = BatchSummary {
            session_id: SessionId(1),
            user_id: UserId(1),
            state: BatchState::Running,
            first_reference: public_ref(1),
            total: 8,
            dispatched: 5,
            in_flight: 1,
            succeeded: 2,
            failed: 1,
            skipped: 1,
            last_reported: None,
            created_at: Utc::now(),
            paused_at: None,
            finished_at: None,
        };
        assert_eq!(summary.finished(), 4);
        assert!((summary.percent() - 50.0).abs() < f32::EPSILON);
        assert_eq!(summary.elapsed(), None);
        assert_eq!(summary.items_per_second(), None);
    }

    #[test]
    fn finished_summary_reports_elapsed_and_rate() {
        let created_at = Utc::now();
        let summary = BatchSummary {
            session_id: SessionId(1),
            user_id: UserId(1),
            state: BatchState::Completed,
            first_reference: public_ref(1),
            total: 10,
            dispatched: 10,
            in_flight: 0,
            succeeded: 8,
            failed: 1,
            skipped: 1,
            last_reported: None,
            created_at,
            paused_at: None,
            finished_at: Some(created_at + chrono::Duration::seconds(4)),
        };
        assert_eq!(summary.elapsed(), Some(Duration::from_secs(4)));
        assert_eq!(summary.items_per_second(), Some(2.5));
    }

    #[test]
    fn content_kind_defaults_to_media_when_absent() {
        let json = serde_json::json!({
            "reference": public_ref(3),
            "file_name": null,
            "size_bytes": 10,
            "mime_type": null,
        });
        let content: ContentMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(content.kind, ContentKind::Media);

        let text = ContentKind::Text { text: "hi".into() };
        let json = serde_json::to_value(&text).unwrap();
        assert_eq!(json["kind"], "text");
        assert_eq!(json["text"], "hi");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::BatchPaused { user_id: UserId(5) };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "batch_paused");
        assert_eq!(json["user_id"], 5);
        assert_eq!(event.user_id(), Some(UserId(5)));
        assert_eq!(Event::Shutdown.user_id(), None);
    }
}
