//! Periodic deletion of usage records older than the retention window.
//!
//! Deletions run in small batches with pauses in between to keep write-lock
//! hold times short, and each cleanup cycle is bounded to 15 seconds. The
//! retention window is an atomic integer so it can be changed at runtime
//! without restarting the loop.

use crate::store::Store;
use crate::timeparam::format_rfc3339_local;
use chrono::Local;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

const DEFAULT_RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
const DEFAULT_RETENTION_BATCH_SIZE: i64 = 1000;
const DEFAULT_RETENTION_PAUSE: Duration = Duration::from_millis(200);
const DEFAULT_RETENTION_MAX_RUNTIME: Duration = Duration::from_secs(15);

/// Background cleaner that ages out usage records.
///
/// A retention of zero or fewer days disables deletion while keeping the
/// loop alive, so a later [`RetentionCleaner::update_retention_days`] takes
/// effect without a restart.
pub struct RetentionCleaner {
    store: Arc<Store>,
    retention_days: AtomicI64,
    started: AtomicBool,
    stop: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    done: Mutex<Option<JoinHandle<()>>>,

    interval: Duration,
    batch_size: i64,
    pause: Duration,
    max_runtime: Duration,
}

impl RetentionCleaner {
    pub fn new(store: Arc<Store>, retention_days: i64) -> Arc<Self> {
        let (stop, stop_rx) = watch::channel(false);
        Arc::new(Self {
            store,
            retention_days: AtomicI64::new(retention_days),
            started: AtomicBool::new(false),
            stop,
            stop_rx,
            done: Mutex::new(None),
            interval: DEFAULT_RETENTION_INTERVAL,
            batch_size: DEFAULT_RETENTION_BATCH_SIZE,
            pause: DEFAULT_RETENTION_PAUSE,
            max_runtime: DEFAULT_RETENTION_MAX_RUNTIME,
        })
    }

    /// Start the cleanup loop. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleaner = self.clone();
        let stop_rx = self.stop_rx.clone();
        let handle = tokio::spawn(async move { cleaner.run_loop(stop_rx).await });
        if let Ok(mut done) = self.done.lock() {
            *done = Some(handle);
        }
    }

    /// Stop the loop and wait for it to exit.
    pub async fn stop(&self) {
        let _ = self.stop.send(true);
        let handle = match self.done.lock() {
            Ok(mut done) => done.take(),
            Err(_) => None,
        };
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn retention_days(&self) -> i64 {
        self.retention_days.load(Ordering::SeqCst)
    }

    /// Swap the retention window at runtime. Returns the previous value.
    pub fn update_retention_days(&self, days: i64) -> i64 {
        self.retention_days.swap(days, Ordering::SeqCst)
    }

    async fn run_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        // The first run is delayed by 1 minute plus up to 2 minutes derived
        // from the wall clock, so a fleet restarting together does not hit
        // its databases at the same instant.
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| Duration::from_nanos((d.as_nanos() % 120_000_000_000) as u64))
            .unwrap_or(Duration::ZERO);
        let mut delay = Duration::from_secs(60) + jitter;

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = tokio::time::sleep(delay) => {
                    self.run_once(&mut stop).await;
                    delay = self.interval;
                }
            }
        }
    }

    async fn run_once(&self, stop: &mut watch::Receiver<bool>) {
        let days = self.retention_days.load(Ordering::SeqCst);
        if days <= 0 {
            return;
        }

        let cutoff = format_rfc3339_local(Local::now() - chrono::Duration::days(days));
        let started = Instant::now();
        let mut total_deleted: u64 = 0;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= self.max_runtime {
                break;
            }
            let remaining = self.max_runtime - elapsed;

            let deleted = match tokio::time::timeout(
                remaining,
                self.store.delete_older_than_cutoff_batch(&cutoff, self.batch_size),
            )
            .await
            {
                Ok(Ok(deleted)) => deleted,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "usage record retention cleanup failed");
                    break;
                }
                Err(_) => {
                    tracing::debug!("usage record retention cleanup timed out");
                    break;
                }
            };

            if deleted == 0 {
                break;
            }
            total_deleted += deleted;

            if !self.pause.is_zero() {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = tokio::time::sleep(self.pause) => {}
                }
            }
        }

        if total_deleted > 0 {
            metrics::counter!("usage_retention_deleted_total").increment(total_deleted);
            tracing::info!(
                deleted = total_deleted,
                retention_days = days,
                "usage record retention cleanup finished"
            );
        }
    }
}
