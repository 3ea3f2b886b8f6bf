use serde::{Deserialize, Serialize};

/// Configuration for the usage-telemetry subsystem.
///
/// Hosts usually embed this as a section of their own configuration; the
/// [`load_config`] helper exists for standalone deployments and tools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Master switch for the usage-event plugin.
    pub enabled: bool,

    /// Directory holding the database file. Created (0755) if missing.
    pub data_dir: String,

    /// Records older than this many days are aged out. Zero or negative
    /// disables deletion.
    pub retention_days: i64,

    /// TTL for the aggregate query cache, in seconds. Zero or negative
    /// disables caching.
    pub cache_ttl_secs: i64,

    /// Path of the statistics snapshot file. Empty disables snapshot
    /// persistence.
    pub snapshot_path: String,

    /// Interval between snapshot writes, in seconds.
    pub snapshot_interval_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            data_dir: "./data".to_string(),
            retention_days: 30,
            cache_ttl_secs: 15,
            snapshot_path: String::new(),
            snapshot_interval_secs: 60,
        }
    }
}

/// Load configuration from an optional `telemetry` file (TOML/YAML/JSON) in
/// the working directory, with `USAGE_TELEMETRY__*` environment variables
/// taking precedence.
pub fn load_config() -> anyhow::Result<TelemetryConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("telemetry").required(false))
        .add_source(config::Environment::with_prefix("USAGE_TELEMETRY").separator("__"))
        .build()?;

    let cfg: TelemetryConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

fn validate_config(cfg: &TelemetryConfig) -> anyhow::Result<()> {
    if cfg.enabled && cfg.data_dir.trim().is_empty() {
        anyhow::bail!("data_dir must not be empty when telemetry is enabled");
    }
    if !cfg.snapshot_path.is_empty() && cfg.snapshot_interval_secs == 0 {
        anyhow::bail!("snapshot_interval_secs must be positive when snapshot_path is set");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TelemetryConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.cache_ttl_secs, 15);
        assert!(cfg.snapshot_path.is_empty());
    }

    #[test]
    fn test_validate_rejects_empty_data_dir() {
        let cfg = TelemetryConfig {
            data_dir: "  ".to_string(),
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_snapshot_interval() {
        let cfg = TelemetryConfig {
            snapshot_path: "/tmp/usage-snapshot.json".to_string(),
            snapshot_interval_secs: 0,
            ..Default::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let cfg: TelemetryConfig = serde_json::from_str(r#"{"retention_days": 7}"#).unwrap();
        assert_eq!(cfg.retention_days, 7);
        assert!(cfg.enabled);
        assert_eq!(cfg.data_dir, "./data");
    }
}
