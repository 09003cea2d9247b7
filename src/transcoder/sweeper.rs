use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Extension of the HLS segment files the encoder writes
const SEGMENT_EXTENSION: &str = "ts";

/// Delete segment files in `dir` last modified more than `max_age` before `now`.
///
/// Returns how many files were removed. Files that vanish mid-sweep are ignored.
pub async fn sweep_segments(dir: &Path, max_age: Duration, now: SystemTime) -> std::io::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(m) if m.is_file() => m,
            _ => continue,
        };
        let modified = match metadata.modified() {
            Ok(t) => t,
            Err(_) => continue,
        };

        let age = now.duration_since(modified).unwrap_or_default();
        if age >= max_age {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    debug!("Removed stale segment {}", path.display());
                    removed += 1;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove segment {}: {}", path.display(), e),
            }
        }
    }

    Ok(removed)
}

/// Periodically sweep stale segments until the task is dropped
pub async fn run_segment_sweeper(dir: PathBuf, max_age: Duration, every: Duration) {
    info!(
        "Segment sweeper started for {} (max age {:?}, every {:?})",
        dir.display(),
        max_age,
        every
    );
    let mut ticker = interval(every);

    loop {
        ticker.tick().await;
        match sweep_segments(&dir, max_age, SystemTime::now()).await {
            Ok(0) => {}
            Ok(n) => debug!("Swept {} stale segments", n),
            Err(e) => warn!("Segment sweep of {} failed: {}", dir.display(), e),
        }
    }
}
