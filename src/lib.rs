//! Usage-telemetry subsystem for an AI-model proxy.
//!
//! Every inbound request is captured as a two-phase record: the entry
//! middleware inserts a pending row at request start and patches it with the
//! outcome on exit, the usage-event plugin enriches it with token counts
//! from the provider layer, and the candidate hook appends a per-attempt
//! routing trace. A bounded, lossy write pipeline decouples request latency
//! from database writes; the read path serves the operations dashboard with
//! time-bucketed aggregates, rolling RPM/TPM, scatter samples, and filtered
//! listings out of a single-writer SQLite database.

pub mod candidate;
pub mod config;
pub mod error;
pub mod handlers;
pub mod mask;
pub mod middleware;
pub mod plugin;
pub mod record;
pub mod retention;
pub mod scope;
pub mod service;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod timeparam;

pub use candidate::{CandidateEvent, CandidateHook};
pub use config::TelemetryConfig;
pub use error::TelemetryError;
pub use middleware::usage_record_middleware;
pub use plugin::{TokenUsage, UsageEvent, UsagePlugin};
pub use record::{ListQuery, ListResult, RequestCandidate, UsageRecord};
pub use scope::{RequestId, RequestScope};
pub use service::{clear_default, default_telemetry, install_default, Telemetry};
pub use store::{RecordPatch, Store, WriteQueue};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize tracing/logging for standalone use.
///
/// Hosts that already configure a subscriber should skip this; the crate
/// only emits `tracing` events and never installs a subscriber on its own.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
