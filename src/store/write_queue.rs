//! Bounded, lossy write pipeline between the request path and the store.
//!
//! Enqueue never blocks: when the channel is full the task is dropped and a
//! warn-level drop event is emitted at most once per 10 seconds. A single
//! drain task serializes the actual SQL writes, bounding each one with a
//! 5-second timeout. Telemetry may be lost under sustained overload, but
//! request latency is never coupled to database latency.

use super::Store;
use crate::record::{RequestCandidate, UsageRecord};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const DEFAULT_WRITE_QUEUE_SIZE: usize = 2048;
const WRITE_TASK_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_DROP_LOG_INTERVAL: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum WriteTask {
    InsertUsageRecord(Box<UsageRecord>),
    InsertRequestCandidate(Box<RequestCandidate>),
}

/// Handle for the best-effort write pipeline.
///
/// Delivery is at-most-once: `enqueue_*` returns `false` when the task was
/// dropped (full channel or closed store) and the caller is expected to
/// carry on.
pub struct WriteQueue {
    store: Arc<Store>,
    tx: mpsc::Sender<WriteTask>,
    stop: watch::Sender<bool>,
    drain: Mutex<Option<JoinHandle<()>>>,
    drop_log_at: AtomicI64,
}

impl WriteQueue {
    /// Spawn the queue with the default capacity of 2048 tasks.
    pub fn spawn(store: Arc<Store>) -> Arc<Self> {
        Self::spawn_with_capacity(store, DEFAULT_WRITE_QUEUE_SIZE)
    }

    pub fn spawn_with_capacity(store: Arc<Store>, capacity: usize) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = watch::channel(false);
        let drain = tokio::spawn(drain_loop(store.clone(), rx, stop_rx));

        Arc::new(Self {
            store,
            tx,
            stop: stop_tx,
            drain: Mutex::new(Some(drain)),
            drop_log_at: AtomicI64::new(0),
        })
    }

    /// Construct a queue whose drain task is not running. Lets tests observe
    /// overflow behavior deterministically.
    #[cfg(test)]
    fn detached(store: Arc<Store>, capacity: usize) -> (Self, mpsc::Receiver<WriteTask>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, _stop_rx) = watch::channel(false);
        (
            Self {
                store,
                tx,
                stop: stop_tx,
                drain: Mutex::new(None),
                drop_log_at: AtomicI64::new(0),
            },
            rx,
        )
    }

    /// Best-effort enqueue of a usage record insert. Returns `false` when
    /// the task was dropped.
    pub fn enqueue_usage_record(&self, record: UsageRecord) -> bool {
        if self.store.is_closed() {
            return false;
        }
        match self.tx.try_send(WriteTask::InsertUsageRecord(Box::new(record))) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.log_drop("usage record");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Best-effort enqueue of a request candidate insert. Returns `false`
    /// when the task was dropped.
    pub fn enqueue_request_candidate(&self, candidate: RequestCandidate) -> bool {
        if self.store.is_closed() {
            return false;
        }
        match self
            .tx
            .try_send(WriteTask::InsertRequestCandidate(Box::new(candidate)))
        {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.log_drop("request candidate");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    fn log_drop(&self, kind: &'static str) {
        metrics::counter!("usage_write_queue_dropped_total", "kind" => kind).increment(1);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        if !self.should_log_drop(now) {
            return;
        }

        let queue_cap = self.tx.max_capacity();
        let queue_len = queue_cap - self.tx.capacity();
        tracing::warn!(
            kind,
            queue_len,
            queue_cap,
            "usage record write queue is full; dropping write task"
        );
    }

    /// Rate limit for drop logging: at most one event per interval, decided
    /// by compare-and-swap on the last-logged nanosecond timestamp.
    fn should_log_drop(&self, now_nanos: i64) -> bool {
        let last = self.drop_log_at.load(Ordering::Relaxed);
        if last > 0 && now_nanos.saturating_sub(last) < WRITE_DROP_LOG_INTERVAL.as_nanos() as i64 {
            return false;
        }
        self.drop_log_at
            .compare_exchange(last, now_nanos, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Signal the drain task to stop and wait up to 2 seconds for it to
    /// exit. Tasks still queued after the grace period are abandoned.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);

        let drain = match self.drain.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(handle) = drain {
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                tracing::warn!("write queue drain task did not stop within grace period");
            }
        }
    }
}

async fn drain_loop(
    store: Arc<Store>,
    mut rx: mpsc::Receiver<WriteTask>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            task = rx.recv() => {
                let Some(task) = task else { break };
                if store.is_closed() {
                    continue;
                }
                run_write_task(&store, task).await;
            }
        }
    }
    tracing::debug!("usage record write queue drain task stopped");
}

async fn run_write_task(store: &Store, task: WriteTask) {
    let kind = match &task {
        WriteTask::InsertUsageRecord(_) => "usage record",
        WriteTask::InsertRequestCandidate(_) => "request candidate",
    };

    let result = tokio::time::timeout(WRITE_TASK_TIMEOUT, async {
        match task {
            WriteTask::InsertUsageRecord(record) => store.insert(&record).await.map(|_| ()),
            WriteTask::InsertRequestCandidate(candidate) => {
                store.insert_request_candidate(&candidate).await.map(|_| ())
            }
        }
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, kind, "failed to process write task"),
        Err(_) => tracing::warn!(kind, "write task timed out"),
    }
}
