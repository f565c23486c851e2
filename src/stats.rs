//! Process-wide transfer statistics and error tracking

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{JobOutcome, JobReport};

/// Counters shared by every session
#[derive(Debug)]
pub struct TransferStats {
    started_at: DateTime<Utc>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    retries: AtomicU64,
    bytes_downloaded: AtomicU64,
    bytes_uploaded: AtomicU64,
    errors: Mutex<HashMap<String, u64>>,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// When counting began
    pub started_at: DateTime<Utc>,
    /// Jobs delivered
    pub succeeded: u64,
    /// Jobs that failed
    pub failed: u64,
    /// Jobs skipped (unresolvable or cancelled)
    pub skipped: u64,
    /// Retries performed across all jobs
    pub retries: u64,
    /// Bytes staged from the source
    pub bytes_downloaded: u64,
    /// Bytes delivered to destinations
    pub bytes_uploaded: u64,
    /// Fraction of decided jobs that succeeded, in percent
    pub success_rate: f64,
    /// Most frequent error codes, highest first
    pub top_errors: Vec<(String, u64)>,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            errors: Mutex::new(HashMap::new()),
        }
    }
}

impl TransferStats {
    /// Fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a finished job
    pub fn record_report(&self, report: &JobReport) {
        let counter = match report.outcome {
            JobOutcome::Succeeded => &self.succeeded,
            JobOutcome::Failed => &self.failed,
            JobOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if let Some(code) = &report.error_code {
            self.record_error(code);
        }
    }

    /// Count one occurrence of an error code
    pub fn record_error(&self, code: &str) {
        let mut errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        *errors.entry(code.to_string()).or_insert(0) += 1;
    }

    /// Count a retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Add staged bytes
    pub fn add_downloaded(&self, bytes: u64) {
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add delivered bytes
    pub fn add_uploaded(&self, bytes: u64) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Success rate over succeeded + failed, in percent
    ///
    /// Skipped jobs do not count against reliability. Returns 100 when
    /// nothing has been decided yet.
    pub fn success_rate(&self) -> f64 {
        let ok = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        if ok + failed == 0 {
            return 100.0;
        }
        ok as f64 / (ok + failed) as f64 * 100.0
    }

    /// The `n` most frequent error codes, ties broken by code
    pub fn most_common_errors(&self, n: usize) -> Vec<(String, u64)> {
        let errors = self.errors.lock().unwrap_or_else(|e| e.into_inner());
        let mut counts: Vec<(String, u64)> =
            errors.iter().map(|(k, v)| (k.clone(), *v)).collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// Copy out the current values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started_at: self.started_at,
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            success_rate: self.success_rate(),
            top_errors: self.most_common_errors(5),
        }
    }
}
