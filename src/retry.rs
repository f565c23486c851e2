//! Retry policy with exponential backoff
//!
//! Failed attempts are classified through a [`ClassificationTable`] keyed by
//! [`TransportError::code`] and then handed to [`RetryPolicy::should_retry`],
//! which either returns a jittered delay or gives up. Waiting is done with
//! [`wait`], which returns early when the job's cancel token fires.
//!
//! # Example
//!
//! ```
//! use msg_relay::config::RetryConfig;
//! use msg_relay::retry::{RetryDecision, RetryPolicy};
//! use msg_relay::types::FailureKind;
//!
//! let policy = RetryPolicy::new(&RetryConfig::default());
//! assert!(matches!(
//!     policy.should_retry(FailureKind::Transient, 1, None),
//!     RetryDecision::RetryAfter(_)
//! ));
//! assert_eq!(
//!     policy.should_retry(FailureKind::Fatal, 1, None),
//!     RetryDecision::GiveUp
//! );
//! ```

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::TransportError;
use crate::types::FailureKind;

/// What to do after a failed attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then try again
    RetryAfter(Duration),
    /// Stop and report the failure
    GiveUp,
}

/// Maps transport error codes to failure kinds
///
/// Codes missing from the table are treated as fatal, so a new transport
/// error never causes a retry loop until it is explicitly classified.
#[derive(Clone, Debug)]
pub struct ClassificationTable {
    kinds: HashMap<String, FailureKind>,
}

impl Default for ClassificationTable {
    fn default() -> Self {
        use FailureKind::*;
        let kinds = [
            ("not_found", Fatal),
            ("access_denied", Fatal),
            ("rejected", Fatal),
            ("unsupported", Fatal),
            ("timeout", Transient),
            ("disconnected", Transient),
            ("rate_limited", Transient),
            ("io_timeout", Transient),
            ("io_connection", Transient),
            ("connection_lost", CrashClass),
            ("io_error", Fatal),
            ("other", Fatal),
        ]
        .into_iter()
        .map(|(code, kind)| (code.to_string(), kind))
        .collect();
        Self { kinds }
    }
}

impl ClassificationTable {
    /// Default table with configured overrides applied on top
    pub fn with_overrides(overrides: &HashMap<String, FailureKind>) -> Self {
        let mut table = Self::default();
        for (code, kind) in overrides {
            table.kinds.insert(code.clone(), *kind);
        }
        table
    }

    /// Kind for a raw error code
    pub fn classify_code(&self, code: &str) -> FailureKind {
        self.kinds.get(code).copied().unwrap_or(FailureKind::Fatal)
    }

    /// Kind for a transport error
    ///
    /// Cancellation is not configurable: it always maps to
    /// [`FailureKind::Cancelled`].
    pub fn classify(&self, error: &TransportError) -> FailureKind {
        match error {
            TransportError::Cancelled => FailureKind::Cancelled,
            other => self.classify_code(other.code()),
        }
    }
}

/// Decides whether and when a failed attempt is retried
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    config: RetryConfig,
    table: ClassificationTable,
}

impl RetryPolicy {
    /// Build a policy from configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            table: ClassificationTable::with_overrides(&config.classification),
        }
    }

    /// Total attempts allowed per job, including the first
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Classify a transport error
    pub fn classify(&self, error: &TransportError) -> FailureKind {
        self.table.classify(error)
    }

    /// Decide what follows failed attempt number `attempt` (1-based)
    ///
    /// `retry_after` is the wait the remote side asked for, if any. It raises
    /// the delay but is still capped at `max_rate_limit_wait`.
    pub fn should_retry(
        &self,
        kind: FailureKind,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        match kind {
            FailureKind::Fatal | FailureKind::Cancelled => return RetryDecision::GiveUp,
            FailureKind::Transient | FailureKind::CrashClass => {}
        }
        if attempt >= self.config.max_attempts {
            return RetryDecision::GiveUp;
        }

        let delay = add_jitter(self.backoff_delay(attempt), self.config.jitter_ratio);
        let delay = match retry_after {
            Some(requested) => delay.max(requested.min(self.config.max_rate_limit_wait)),
            None => delay,
        };
        RetryDecision::RetryAfter(delay)
    }

    /// Backoff before retrying after failed attempt `attempt`, without jitter
    ///
    /// `base * multiplier^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.config.base_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.config.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.config.max_delay)
    }
}

/// Sleep for `delay` unless `cancel` fires first
///
/// Returns `true` if the full delay elapsed and `false` if it was cut short.
pub async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Spread a delay uniformly over `[delay * (1 - ratio), delay * (1 + ratio)]`
fn add_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(delay)
}
