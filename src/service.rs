//! Service wiring: one explicitly-constructed [`Telemetry`] value owns the
//! store, the write pipeline, the plugin, the retention cleaner, and the
//! snapshot task. Lifecycle is init, serve, stop.
//!
//! A process-level accessor backed by `arc_swap` exists for the entry
//! middleware's benefit; everything else should take the service value
//! through its call sites.

use crate::candidate::CandidateHook;
use crate::config::TelemetryConfig;
use crate::error::TelemetryError;
use crate::plugin::UsagePlugin;
use crate::retention::RetentionCleaner;
use crate::snapshot::{load_snapshot_into, spawn_snapshot_persistence};
use crate::stats::RequestStatistics;
use crate::store::{Store, WriteQueue};
use arc_swap::ArcSwapOption;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

static DEFAULT_TELEMETRY: ArcSwapOption<Telemetry> = ArcSwapOption::const_empty();

/// The assembled usage-telemetry subsystem.
pub struct Telemetry {
    store: Arc<Store>,
    queue: Arc<WriteQueue>,
    plugin: Arc<UsagePlugin>,
    cleaner: Arc<RetentionCleaner>,
    stats: Arc<RequestStatistics>,
    snapshot_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl Telemetry {
    /// Open the store and start the background tasks described by `config`.
    pub async fn init(config: &TelemetryConfig) -> Result<Arc<Self>, TelemetryError> {
        let cache_ttl = if config.cache_ttl_secs > 0 {
            Duration::from_secs(config.cache_ttl_secs as u64)
        } else {
            Duration::ZERO
        };

        let store = Arc::new(Store::open(&config.data_dir, cache_ttl).await?);
        let queue = WriteQueue::spawn(store.clone());
        let plugin = Arc::new(UsagePlugin::new(store.clone(), queue.clone()));
        plugin.set_enabled(config.enabled);

        let cleaner = RetentionCleaner::new(store.clone(), config.retention_days);
        cleaner.start();

        let stats = Arc::new(RequestStatistics::new());
        let snapshot_task = if config.snapshot_path.is_empty() || config.snapshot_interval_secs == 0
        {
            None
        } else {
            let path = PathBuf::from(&config.snapshot_path);
            if let Err(e) = load_snapshot_into(&stats, &path) {
                tracing::warn!(error = %e, "failed to load usage statistics snapshot");
            }
            Some(spawn_snapshot_persistence(
                stats.clone(),
                path,
                Duration::from_secs(config.snapshot_interval_secs),
            ))
        };

        // Feed the statistics object from the plugin's callback hooks.
        {
            let stats = stats.clone();
            plugin.set_token_incrementor(Arc::new(move |api_key, input, output| {
                stats.record(api_key, input, output);
            }));
        }

        Ok(Arc::new(Self {
            store,
            queue,
            plugin,
            cleaner,
            stats,
            snapshot_task: Mutex::new(snapshot_task),
        }))
    }

    /// Convenience for tests and embedded use: an in-memory store with all
    /// background tasks wired.
    pub async fn init_in_memory() -> Result<Arc<Self>, TelemetryError> {
        let store = Arc::new(Store::open_in_memory(Duration::ZERO).await?);
        let queue = WriteQueue::spawn(store.clone());
        let plugin = Arc::new(UsagePlugin::new(store.clone(), queue.clone()));
        let cleaner = RetentionCleaner::new(store.clone(), 0);

        Ok(Arc::new(Self {
            store,
            queue,
            plugin,
            cleaner,
            stats: Arc::new(RequestStatistics::new()),
            snapshot_task: Mutex::new(None),
        }))
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<WriteQueue> {
        &self.queue
    }

    pub fn plugin(&self) -> &Arc<UsagePlugin> {
        &self.plugin
    }

    pub fn stats(&self) -> &Arc<RequestStatistics> {
        &self.stats
    }

    /// A hook the retry engine can call for each routing attempt.
    pub fn candidate_hook(&self) -> CandidateHook {
        CandidateHook::new(self.queue.clone())
    }

    /// Change the retention window at runtime. Returns the previous value.
    pub fn update_retention_days(&self, days: i64) -> i64 {
        self.cleaner.update_retention_days(days)
    }

    pub fn retention_days(&self) -> i64 {
        self.cleaner.retention_days()
    }

    /// Stop background tasks and close the store. The write queue gets up to
    /// 2 seconds to drain.
    pub async fn shutdown(&self) {
        self.cleaner.stop().await;

        let snapshot_task = match self.snapshot_task.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some((stop, handle)) = snapshot_task {
            let _ = stop.send(true);
            let _ = handle.await;
        }

        self.queue.shutdown().await;
        self.store.close().await;
    }
}

/// Install the process-level default service used by the entry middleware.
pub fn install_default(telemetry: Arc<Telemetry>) {
    DEFAULT_TELEMETRY.store(Some(telemetry));
}

/// The process-level default service, if one has been installed.
pub fn default_telemetry() -> Option<Arc<Telemetry>> {
    DEFAULT_TELEMETRY.load_full()
}

/// Remove the process-level default. The service itself is not shut down.
pub fn clear_default() {
    DEFAULT_TELEMETRY.store(None);
}
