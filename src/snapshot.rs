//! Snapshot persistence: periodically flushes the in-memory statistics to a
//! versioned JSON file via an atomic temp-file rename, and restores it on
//! startup.

use crate::error::TelemetryError;
use crate::stats::{RequestStatistics, StatisticsSnapshot};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const SNAPSHOT_VERSION: u32 = 1;

fn snapshot_retention() -> ChronoDuration {
    ChronoDuration::hours(24)
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    #[serde(default)]
    version: u32,
    saved_at: DateTime<Utc>,
    usage: StatisticsSnapshot,
}

/// Merge a previously saved snapshot into `stats`. A missing file is fine;
/// an unknown version number is refused. Samples older than 24 hours are
/// pruned after loading.
pub fn load_snapshot_into(stats: &RequestStatistics, path: &Path) -> Result<(), TelemetryError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(TelemetryError::Snapshot(format!(
                "read usage snapshot: {}",
                e
            )))
        }
    };

    let payload: SnapshotFile = serde_json::from_slice(&data)
        .map_err(|e| TelemetryError::Snapshot(format!("decode usage snapshot: {}", e)))?;
    if payload.version != 0 && payload.version != SNAPSHOT_VERSION {
        return Err(TelemetryError::Snapshot(format!(
            "unsupported usage snapshot version: {}",
            payload.version
        )));
    }

    stats.reset();
    stats.merge_snapshot(payload.usage);
    let removed = stats.prune_before(Utc::now() - snapshot_retention());
    // Clean unless pruning removed old samples, which should be persisted
    // again soon.
    stats.set_dirty(removed);
    Ok(())
}

/// Spawn the persistence loop: every `interval`, prune old samples and, if
/// new data arrived since the last write, save a snapshot. A failed write
/// re-asserts the dirty flag so the next tick retries.
///
/// Returns a stop signal and the task handle.
pub fn spawn_snapshot_persistence(
    stats: Arc<RequestStatistics>,
    path: PathBuf,
    interval: Duration,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first write happens one interval after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                _ = ticker.tick() => {
                    let removed = stats.prune_before(Utc::now() - snapshot_retention());
                    if removed {
                        stats.mark_dirty();
                    }
                    if !stats.take_dirty() {
                        continue;
                    }

                    let snapshot = stats.snapshot();
                    if let Err(e) = save_snapshot_file(&path, snapshot) {
                        stats.mark_dirty();
                        tracing::warn!(error = %e, "failed to persist usage statistics snapshot");
                    }
                }
            }
        }
        tracing::debug!("usage statistics snapshot task stopped");
    });

    (stop_tx, handle)
}

/// Write the snapshot with create-temp + atomic rename. On platforms where
/// renaming over an existing file fails (Windows), the destination is
/// removed and the rename retried.
pub fn save_snapshot_file(path: &Path, snapshot: StatisticsSnapshot) -> Result<(), TelemetryError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .map_err(|e| TelemetryError::Snapshot(format!("create usage snapshot dir: {}", e)))?;

    let payload = SnapshotFile {
        version: SNAPSHOT_VERSION,
        saved_at: Utc::now(),
        usage: snapshot,
    };
    let data = serde_json::to_vec(&payload)
        .map_err(|e| TelemetryError::Snapshot(format!("encode usage snapshot: {}", e)))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| TelemetryError::Snapshot(format!("create temp usage snapshot: {}", e)))?;
    tmp.write_all(&data)
        .map_err(|e| TelemetryError::Snapshot(format!("write temp usage snapshot: {}", e)))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = tmp
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600));
    }

    if let Err(persist_err) = tmp.persist(path) {
        let _ = std::fs::remove_file(path);
        persist_err
            .file
            .persist(path)
            .map_err(|e| TelemetryError::Snapshot(format!("replace usage snapshot: {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-snapshot.json");

        let stats = RequestStatistics::new();
        stats.record("sk-1", 10, 20);
        save_snapshot_file(&path, stats.snapshot()).unwrap();

        let restored = RequestStatistics::new();
        load_snapshot_into(&restored, &path).unwrap();
        let snapshot = restored.snapshot();
        assert_eq!(snapshot.samples.len(), 1);
        assert_eq!(snapshot.key_totals["sk-1"].requests, 1);
        // A freshly loaded snapshot with nothing pruned is clean.
        assert!(!restored.take_dirty());
    }

    #[test]
    fn test_load_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let stats = RequestStatistics::new();
        load_snapshot_into(&stats, &dir.path().join("absent.json")).unwrap();
        assert!(stats.snapshot().samples.is_empty());
    }

    #[test]
    fn test_load_refuses_unknown_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-snapshot.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 99,
                "saved_at": Utc::now(),
                "usage": {"samples": [], "key_totals": {}}
            })
            .to_string(),
        )
        .unwrap();

        let stats = RequestStatistics::new();
        let err = load_snapshot_into(&stats, &path).unwrap_err();
        assert!(matches!(err, TelemetryError::Snapshot(_)));
    }

    #[test]
    fn test_load_prunes_stale_samples_and_marks_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-snapshot.json");

        let mut usage = StatisticsSnapshot::default();
        usage.samples.push(crate::stats::RequestSample {
            at: Utc::now() - ChronoDuration::hours(48),
            api_key: "sk-1".to_string(),
            input_tokens: 1,
            output_tokens: 1,
        });
        save_snapshot_file(&path, usage).unwrap();

        let stats = RequestStatistics::new();
        load_snapshot_into(&stats, &path).unwrap();
        assert!(stats.snapshot().samples.is_empty());
        // Pruning removed data, so the next persistence tick must rewrite.
        assert!(stats.take_dirty());
    }

    #[test]
    fn test_save_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-snapshot.json");

        save_snapshot_file(&path, StatisticsSnapshot::default()).unwrap();
        let stats = RequestStatistics::new();
        stats.record("sk-1", 1, 1);
        save_snapshot_file(&path, stats.snapshot()).unwrap();

        let restored = RequestStatistics::new();
        load_snapshot_into(&restored, &path).unwrap();
        assert_eq!(restored.snapshot().samples.len(), 1);
    }

    #[tokio::test]
    async fn test_persistence_task_writes_dirty_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("usage-snapshot.json");

        let stats = Arc::new(RequestStatistics::new());
        stats.record("sk-1", 5, 5);

        let (stop, handle) =
            spawn_snapshot_persistence(stats.clone(), path.clone(), Duration::from_millis(20));

        let mut rounds = 0;
        while !path.exists() {
            rounds += 1;
            assert!(rounds < 200, "snapshot never written");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let _ = stop.send(true);
        let _ = handle.await;

        let restored = RequestStatistics::new();
        load_snapshot_into(&restored, &path).unwrap();
        assert_eq!(restored.snapshot().key_totals["sk-1"].requests, 1);
    }
}
