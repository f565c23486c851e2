//! Event helpers for integration tests

use msg_relay::{BatchOrchestrator, BatchSummary, Event, JobReport, UserId};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

/// Wait for an event matching the predicate
pub async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
    mut predicate: F,
) -> Option<Event>
where
    F: FnMut(&Event) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Collect a user's item reports until their batch completes or is cancelled
pub async fn collect_reports(
    events: &mut broadcast::Receiver<Event>,
    user: UserId,
    timeout: Duration,
) -> (Vec<JobReport>, BatchSummary) {
    let mut reports = Vec::new();
    let summary = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::ItemReported { user_id, report }) if user_id == user => {
                    reports.push(report);
                }
                Ok(Event::BatchCompleted { summary }) | Ok(Event::BatchCancelled { summary })
                    if summary.user_id == user =>
                {
                    return summary;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream failed: {e}"),
            }
        }
    })
    .await
    .expect("batch did not finish before the timeout");
    (reports, summary)
}

/// Wait until the user no longer has a registered session
pub async fn wait_until_unregistered(orchestrator: &BatchOrchestrator, user: UserId) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while orchestrator.status(user).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("session never left the registry");
}

/// Assert a directory has no files left in it
pub fn assert_dir_empty(dir: &Path) {
    let leftovers: Vec<_> = std::fs::read_dir(dir)
        .map(|entries| entries.map(|e| e.unwrap().path()).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "files left in {}: {leftovers:?}", dir.display());
}
