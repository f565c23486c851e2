//! Formatting helpers and staging-directory file management

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::types::{JobId, MessageReference, UserId};

/// Extension used for staged content
pub const STAGED_EXTENSION: &str = "part";

/// Format a byte count with binary units, e.g. `12.5 MB`
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// Format a remaining-time estimate as `42s`, `3m 7s` or `2h 15m`
pub fn format_eta(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s")
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

/// Path a job stages its content at
///
/// The path is derived only from the owning user, the job id and the message
/// id, so it is unique per job and can be recomputed for cleanup after the
/// job task itself is gone.
pub fn staged_path_for(
    staging_dir: &Path,
    user_id: UserId,
    job_id: JobId,
    reference: &MessageReference,
) -> PathBuf {
    staging_dir.join(format!(
        "u{}_j{}_m{}.{}",
        user_id.0, job_id.0, reference.message_id, STAGED_EXTENSION
    ))
}

/// Remove a staged file
///
/// Returns `Ok(true)` if a file was removed and `Ok(false)` if there was
/// nothing to remove, which makes repeated cleanup harmless.
pub async fn remove_staged_file(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Delete staged files older than `max_age` left behind by a previous run
///
/// Only files carrying the staging extension are touched. Returns the number
/// of files removed. A missing staging directory counts as empty.
pub async fn sweep_stale_staging(staging_dir: &Path, max_age: Duration) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(staging_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(STAGED_EXTENSION) {
            continue;
        }
        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }
        match remove_staged_file(&path).await {
            Ok(true) => {
                removed += 1;
                tracing::debug!(path = %path.display(), age_secs = age.as_secs(), "removed stale staged file");
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove stale staged file");
            }
        }
    }
    Ok(removed)
}
