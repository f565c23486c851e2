//! Throttled progress tracking for transfer jobs
//!
//! Transports report raw byte counts as often as they like. The aggregator
//! keeps a short rolling window of samples per job to smooth the speed and
//! only produces a [`ProgressSnapshot`] when the percentage crosses into a new
//! bucket or the minimum interval has elapsed since the previous one.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

use crate::config::ProgressConfig;
use crate::types::{JobId, ProgressSnapshot, TransferDirection};
use crate::utils::format_bytes;

/// Speeds below this many bytes per second are treated as stalled
const MIN_SPEED_BPS: f64 = 1.0;

#[derive(Debug)]
struct JobSamples {
    direction: TransferDirection,
    total_bytes: u64,
    window: VecDeque<(Instant, u64)>,
    /// Time and percent bucket of the last emitted snapshot
    last_emit: Option<(Instant, u8)>,
    latest: Option<ProgressSnapshot>,
}

impl JobSamples {
    fn new(direction: TransferDirection, total_bytes: u64) -> Self {
        Self {
            direction,
            total_bytes,
            window: VecDeque::new(),
            last_emit: None,
            latest: None,
        }
    }

    fn speed_bps(&self) -> f64 {
        let (Some((t0, b0)), Some((t1, b1))) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        let secs = t1.saturating_duration_since(*t0).as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        b1.saturating_sub(*b0) as f64 / secs
    }
}

/// Per-job progress aggregation with emission throttling
#[derive(Debug)]
pub struct ProgressAggregator {
    config: ProgressConfig,
    jobs: Mutex<HashMap<JobId, JobSamples>>,
}

impl ProgressAggregator {
    /// Create an aggregator
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            config,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Record a byte-count sample
    ///
    /// Returns a snapshot when one should be shown to the user, `None` when
    /// the sample was absorbed by throttling. A change of direction (staging
    /// finished, delivery started) or a byte count going backwards (the
    /// attempt restarted) starts a fresh window.
    pub fn record(
        &self,
        job_id: JobId,
        direction: TransferDirection,
        bytes_done: u64,
        total_bytes: u64,
        at: Instant,
    ) -> Option<ProgressSnapshot> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let samples = jobs
            .entry(job_id)
            .or_insert_with(|| JobSamples::new(direction, total_bytes));

        let restarted = samples
            .window
            .back()
            .is_some_and(|(_, prev)| bytes_done < *prev);
        if samples.direction != direction || restarted {
            *samples = JobSamples::new(direction, total_bytes);
        }
        samples.total_bytes = total_bytes;

        samples.window.push_back((at, bytes_done));
        while samples.window.len() > self.config.window_size {
            samples.window.pop_front();
        }

        let percent = if total_bytes > 0 {
            (bytes_done as f64 / total_bytes as f64 * 100.0).min(100.0) as f32
        } else {
            0.0
        };
        let bucket = (percent as u8) / self.config.percent_bucket.max(1);

        let emit = match samples.last_emit {
            None => true,
            Some((last_at, last_bucket)) => {
                bucket != last_bucket
                    || at.saturating_duration_since(last_at) >= self.config.min_interval
            }
        };

        let speed = samples.speed_bps();
        let eta_seconds = if speed >= MIN_SPEED_BPS && total_bytes > 0 {
            Some((total_bytes.saturating_sub(bytes_done) as f64 / speed).ceil() as u64)
        } else {
            None
        };
        let snapshot = ProgressSnapshot {
            job_id,
            direction,
            percent,
            bytes_done,
            total_bytes,
            speed_bps: speed as u64,
            eta_seconds,
            size_display: format!("{} / {}", format_bytes(bytes_done), format_bytes(total_bytes)),
        };
        samples.latest = Some(snapshot.clone());

        if emit {
            samples.last_emit = Some((at, bucket));
            Some(snapshot)
        } else {
            None
        }
    }

    /// Latest snapshot for a job, emitted or not
    pub fn snapshot(&self, job_id: JobId) -> Option<ProgressSnapshot> {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.get(&job_id).and_then(|s| s.latest.clone())
    }

    /// Drop all samples of a finished job
    pub fn forget(&self, job_id: JobId) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(&job_id);
    }

    /// Number of jobs currently tracked
    pub fn tracked_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
