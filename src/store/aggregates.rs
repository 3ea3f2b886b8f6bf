//! Aggregate queries backing the operations dashboard: heat-maps, per-model
//! and per-provider roll-ups, KPI tiles, timelines, and the interval scatter
//! plot.
//!
//! Timestamps are stored as text, so day/hour/minute bucketing uses
//! `substr(timestamp, 1, N)` prefixes rather than SQLite date functions;
//! this stays robust across the legacy timestamp formats the read path
//! tolerates. All series are emitted dense, with zero-filled gaps.

use super::{bind_args, bind_scalar_args, time_filters, Filters, SqlArg, Store};
use crate::error::TelemetryError;
use crate::record::ListQuery;
use crate::timeparam::{format_rfc3339_local, parse_stored_timestamp, parse_time_param_to_time};
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::collections::{HashMap, HashSet};

/// A single day in the activity heatmap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivityHeatmapDay {
    pub date: String,
    pub requests: i64,
    pub total_tokens: i64,
    pub avg_duration: f64,
    pub unique_models: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityHeatmap {
    pub start_date: String,
    pub end_date: String,
    pub total_days: i64,
    pub max_requests: i64,
    pub days: Vec<ActivityHeatmapDay>,
}

/// Usage statistics for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStats {
    pub model: String,
    pub provider: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    #[serde(rename = "avg_duration_ms")]
    pub avg_duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelStatsResult {
    pub models: Vec<ModelStats>,
    pub total_models: i64,
}

/// Usage statistics for a single provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStats {
    pub provider: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub total_tokens: i64,
    #[serde(rename = "avg_duration_ms")]
    pub avg_duration: f64,
    pub model_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatsResult {
    pub providers: Vec<ProviderStats>,
    pub total_providers: i64,
}

/// Distinct model/provider values for filter dropdowns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctOptionsResult {
    pub models: Vec<String>,
    pub providers: Vec<String>,
}

/// Overall usage summary statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageSummary {
    pub total_requests: i64,
    pub success_requests: i64,
    pub failure_requests: i64,
    pub success_rate: f64,
    pub total_tokens: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(rename = "avg_duration_ms")]
    pub avg_duration: f64,
    pub unique_models: i64,
    pub unique_providers: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiTrendPoint {
    pub t: String,
    pub v: i64,
}

/// Lightweight KPI metrics for the usage records page. Trends are dense,
/// zero-filled series; RPM/TPM are evaluated over the trailing 60 seconds
/// under the same filter as the list they accompany.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageKpis {
    pub total_requests: i64,
    pub success_requests: i64,
    pub failure_requests: i64,

    pub total_tokens: i64,
    pub cached_tokens: i64,
    pub reasoning_tokens: i64,

    pub rpm: i64,
    pub tpm: i64,

    /// `hour` or `day`
    pub trend_bucket: String,
    pub requests_trend: Vec<KpiTrendPoint>,
    pub tokens_trend: Vec<KpiTrendPoint>,
    pub rpm_trend: Vec<KpiTrendPoint>,
    pub tpm_trend: Vec<KpiTrendPoint>,

    pub generated_at: String,
}

/// A single point in the hourly request timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTimelinePoint {
    pub hour: String,
    pub requests: i64,
    pub tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTimelineResult {
    pub start_time: String,
    pub end_time: String,
    pub total_hours: i64,
    pub max_requests: i64,
    pub points: Vec<RequestTimelinePoint>,
}

/// A single point in the interval scatter chart: x is the request timestamp,
/// y the gap to the previous successful request in minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalTimelinePoint {
    pub x: String,
    pub y: f64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalTimelineResult {
    pub analysis_period_hours: i64,
    pub total_points: i64,
    pub points: Vec<IntervalTimelinePoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
}

/// Aggregated statistics for a single API key, derived from the persisted
/// records so they survive restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyStats {
    pub api_key: String,
    pub usage_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub last_used_at: String,
}

fn trunc_hour(t: DateTime<Local>) -> DateTime<Local> {
    t.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_minute(0))
        .unwrap_or(t)
}

fn trunc_minute(t: DateTime<Local>) -> DateTime<Local> {
    t.with_nanosecond(0)
        .and_then(|t| t.with_second(0))
        .unwrap_or(t)
}

impl Store {
    /// Activity data for the last N days heatmap. `days` is clamped to
    /// [1, 365] (default 90); every day in the window is present in the
    /// output, zero-filled when no requests were recorded.
    pub async fn get_activity_heatmap(&self, days: i64) -> Result<ActivityHeatmap, TelemetryError> {
        let days = match days {
            n if n < 1 => 90,
            n if n > 365 => 365,
            n => n,
        };

        self.cached(format!("heatmap:{}", days), || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;
            self.activity_heatmap_inner(days).await
        })
        .await
    }

    async fn activity_heatmap_inner(&self, days: i64) -> Result<ActivityHeatmap, TelemetryError> {
        let end_date = Local::now();
        let start_date = end_date - ChronoDuration::days(days - 1);

        let rows = sqlx::query(
            r#"
            SELECT
                substr(timestamp, 1, 10) as day,
                COUNT(*) as requests,
                COALESCE(SUM(total_tokens), 0) as total_tokens,
                COALESCE(AVG(duration_ms), 0.0) as avg_duration,
                COUNT(DISTINCT model) as unique_models
            FROM usage_records
            WHERE substr(timestamp, 1, 10) >= ? AND substr(timestamp, 1, 10) <= ?
            GROUP BY substr(timestamp, 1, 10)
            ORDER BY day ASC
            "#,
        )
        .bind(start_date.format("%Y-%m-%d").to_string())
        .bind(end_date.format("%Y-%m-%d").to_string())
        .fetch_all(self.pool())
        .await?;

        let mut data: HashMap<String, ActivityHeatmapDay> = HashMap::new();
        let mut max_requests = 0i64;
        for row in &rows {
            let day = ActivityHeatmapDay {
                date: row.try_get("day")?,
                requests: row.try_get("requests")?,
                total_tokens: row.try_get("total_tokens")?,
                avg_duration: row.try_get("avg_duration")?,
                unique_models: row.try_get("unique_models")?,
            };
            max_requests = max_requests.max(day.requests);
            data.insert(day.date.clone(), day);
        }

        let mut all_days = Vec::with_capacity(days as usize);
        let mut d = start_date.date_naive();
        let end = end_date.date_naive();
        while d <= end {
            let date = d.format("%Y-%m-%d").to_string();
            match data.remove(&date) {
                Some(day) => all_days.push(day),
                None => all_days.push(ActivityHeatmapDay {
                    date,
                    ..Default::default()
                }),
            }
            d = match d.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }

        Ok(ActivityHeatmap {
            start_date: start_date.format("%Y-%m-%d").to_string(),
            end_date: end_date.format("%Y-%m-%d").to_string(),
            total_days: all_days.len() as i64,
            max_requests,
            days: all_days,
        })
    }

    /// Usage statistics grouped by model, most-requested first.
    pub async fn get_model_stats(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<ModelStatsResult, TelemetryError> {
        let filters = time_filters(start_time, end_time);
        let key = format!("model_stats:{}:{}", start_time, end_time);

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let sql = format!(
                r#"
                SELECT
                    model,
                    provider,
                    COUNT(*) as request_count,
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) as success_count,
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) as failure_count,
                    COALESCE(SUM(input_tokens), 0) as input_tokens,
                    COALESCE(SUM(output_tokens), 0) as output_tokens,
                    COALESCE(SUM(total_tokens), 0) as total_tokens,
                    COALESCE(AVG(duration_ms), 0.0) as avg_duration
                FROM usage_records
                {}
                GROUP BY model, provider
                ORDER BY request_count DESC
                "#,
                filters.where_clause()
            );

            let rows = bind_args(sqlx::query(&sql), &filters.args)
                .fetch_all(self.pool())
                .await?;

            let mut models = Vec::with_capacity(rows.len());
            for row in &rows {
                models.push(ModelStats {
                    model: row.try_get("model")?,
                    provider: row.try_get("provider")?,
                    request_count: row.try_get("request_count")?,
                    success_count: row.try_get("success_count")?,
                    failure_count: row.try_get("failure_count")?,
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                    total_tokens: row.try_get("total_tokens")?,
                    avg_duration: row.try_get("avg_duration")?,
                });
            }

            let total_models = models.len() as i64;
            Ok(ModelStatsResult {
                models,
                total_models,
            })
        })
        .await
    }

    /// Usage statistics grouped by provider, most-requested first.
    pub async fn get_provider_stats(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<ProviderStatsResult, TelemetryError> {
        let filters = time_filters(start_time, end_time);
        let key = format!("provider_stats:{}:{}", start_time, end_time);

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let sql = format!(
                r#"
                SELECT
                    provider,
                    COUNT(*) as request_count,
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) as success_count,
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) as failure_count,
                    COALESCE(SUM(total_tokens), 0) as total_tokens,
                    COALESCE(AVG(duration_ms), 0.0) as avg_duration,
                    COUNT(DISTINCT model) as model_count
                FROM usage_records
                {}
                GROUP BY provider
                ORDER BY request_count DESC
                "#,
                filters.where_clause()
            );

            let rows = bind_args(sqlx::query(&sql), &filters.args)
                .fetch_all(self.pool())
                .await?;

            let mut providers = Vec::with_capacity(rows.len());
            for row in &rows {
                providers.push(ProviderStats {
                    provider: row.try_get("provider")?,
                    request_count: row.try_get("request_count")?,
                    success_count: row.try_get("success_count")?,
                    failure_count: row.try_get("failure_count")?,
                    total_tokens: row.try_get("total_tokens")?,
                    avg_duration: row.try_get("avg_duration")?,
                    model_count: row.try_get("model_count")?,
                });
            }

            let total_providers = providers.len() as i64;
            Ok(ProviderStatsResult {
                providers,
                total_providers,
            })
        })
        .await
    }

    /// Distinct non-blank model and provider values within the time range.
    pub async fn get_distinct_options(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<DistinctOptionsResult, TelemetryError> {
        let filters = time_filters(start_time, end_time);
        let key = format!("options:{}:{}", start_time, end_time);

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let models = self
                .distinct_strings("model", &filters)
                .await?;
            let providers = self
                .distinct_strings("provider", &filters)
                .await?;

            Ok(DistinctOptionsResult { models, providers })
        })
        .await
    }

    async fn distinct_strings(
        &self,
        column: &str,
        filters: &Filters,
    ) -> Result<Vec<String>, TelemetryError> {
        let sql = format!(
            "SELECT DISTINCT {col} FROM usage_records {wh} ORDER BY {col} ASC",
            col = column,
            wh = filters.where_clause()
        );
        let rows = bind_scalar_args(sqlx::query_scalar::<_, String>(&sql), &filters.args)
            .fetch_all(self.pool())
            .await?;
        Ok(rows
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    /// Overall usage summary for the time range.
    pub async fn get_usage_summary(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<UsageSummary, TelemetryError> {
        let filters = time_filters(start_time, end_time);
        let key = format!("summary:{}:{}", start_time, end_time);

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let sql = format!(
                r#"
                SELECT
                    COUNT(*) as total_requests,
                    COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) as success_requests,
                    COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) as failure_requests,
                    COALESCE(SUM(input_tokens), 0) as input_tokens,
                    COALESCE(SUM(output_tokens), 0) as output_tokens,
                    COALESCE(SUM(total_tokens), 0) as total_tokens,
                    COALESCE(AVG(duration_ms), 0.0) as avg_duration,
                    COUNT(DISTINCT model) as unique_models,
                    COUNT(DISTINCT provider) as unique_providers
                FROM usage_records
                {}
                "#,
                filters.where_clause()
            );

            let row = bind_args(sqlx::query(&sql), &filters.args)
                .fetch_one(self.pool())
                .await?;

            let mut summary = UsageSummary {
                total_requests: row.try_get("total_requests")?,
                success_requests: row.try_get("success_requests")?,
                failure_requests: row.try_get("failure_requests")?,
                success_rate: 0.0,
                total_tokens: row.try_get("total_tokens")?,
                input_tokens: row.try_get("input_tokens")?,
                output_tokens: row.try_get("output_tokens")?,
                avg_duration: row.try_get("avg_duration")?,
                unique_models: row.try_get("unique_models")?,
                unique_providers: row.try_get("unique_providers")?,
            };
            if summary.total_requests > 0 {
                summary.success_rate =
                    summary.success_requests as f64 / summary.total_requests as f64 * 100.0;
            }
            Ok(summary)
        })
        .await
    }

    /// Per-API-key aggregates derived from the persisted records.
    pub async fn get_api_key_stats(&self) -> Result<HashMap<String, ApiKeyStats>, TelemetryError> {
        self.cached("api_key_stats".to_string(), || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let rows = sqlx::query(
                r#"
                SELECT
                    api_key,
                    COUNT(*) as usage_count,
                    COALESCE(SUM(input_tokens), 0) as input_tokens,
                    COALESCE(SUM(output_tokens), 0) as output_tokens,
                    MAX(timestamp) as last_used_at
                FROM usage_records
                WHERE api_key != ''
                GROUP BY api_key
                "#,
            )
            .fetch_all(self.pool())
            .await?;

            let mut result = HashMap::with_capacity(rows.len());
            for row in &rows {
                let stats = ApiKeyStats {
                    api_key: row.try_get("api_key")?,
                    usage_count: row.try_get("usage_count")?,
                    input_tokens: row.try_get("input_tokens")?,
                    output_tokens: row.try_get("output_tokens")?,
                    last_used_at: row.try_get("last_used_at")?,
                };
                result.insert(stats.api_key.clone(), stats);
            }
            Ok(result)
        })
        .await
    }

    /// Hourly request distribution between `start_time` and `end_time`
    /// (defaults: last 24 hours). Every hour in the window is present.
    pub async fn get_request_timeline(
        &self,
        start_time: &str,
        end_time: &str,
    ) -> Result<RequestTimelineResult, TelemetryError> {
        let filters = time_filters(start_time, end_time);
        let key = format!("timeline:{}:{}", start_time, end_time);

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let sql = format!(
                r#"
                SELECT
                    substr(timestamp, 1, 13) as hour,
                    COUNT(*) as requests,
                    COALESCE(SUM(total_tokens), 0) as tokens
                FROM usage_records
                {}
                GROUP BY hour
                ORDER BY hour ASC
                "#,
                filters.where_clause()
            );

            let rows = bind_args(sqlx::query(&sql), &filters.args)
                .fetch_all(self.pool())
                .await?;

            let mut data: HashMap<String, RequestTimelinePoint> = HashMap::new();
            let mut max_requests = 0i64;
            for row in &rows {
                let hour: String = row.try_get("hour")?;
                let requests: i64 = row.try_get("requests")?;
                let tokens: i64 = row.try_get("tokens")?;
                // "2026-01-11T15" -> "2026-01-11 15:00" for display
                let display_hour = format!("{}:00", hour.replacen('T', " ", 1));
                max_requests = max_requests.max(requests);
                data.insert(
                    display_hour.clone(),
                    RequestTimelinePoint {
                        hour: display_hour,
                        requests,
                        tokens,
                    },
                );
            }

            let now = Local::now();
            let start_date = if start_time.is_empty() {
                now - ChronoDuration::hours(24)
            } else {
                parse_time_param_to_time(start_time).unwrap_or(now - ChronoDuration::hours(24))
            };
            let end_date = if end_time.is_empty() {
                now
            } else {
                parse_time_param_to_time(end_time).unwrap_or(now)
            };

            let start_hour = trunc_hour(start_date);
            let end_hour = trunc_hour(end_date);

            let mut points = Vec::new();
            let mut h = start_hour;
            while h <= end_hour {
                let hour_str = h.format("%Y-%m-%d %H:00").to_string();
                match data.remove(&hour_str) {
                    Some(point) => points.push(point),
                    None => points.push(RequestTimelinePoint {
                        hour: hour_str,
                        requests: 0,
                        tokens: 0,
                    }),
                }
                h += ChronoDuration::hours(1);
            }

            Ok(RequestTimelineResult {
                start_time: format_rfc3339_local(start_hour),
                end_time: format_rfc3339_local(end_hour),
                total_hours: points.len() as i64,
                max_requests,
                points,
            })
        })
        .await
    }

    /// Gap between consecutive successful requests over the last N hours,
    /// for the scatter chart. `hours` is clamped to [1, 720] (default 24),
    /// `limit` to [1, 10000] (default 5000); when the raw sample count
    /// exceeds the limit, evenly-strided samples are emitted instead.
    pub async fn get_interval_timeline(
        &self,
        hours: i64,
        limit: i64,
    ) -> Result<IntervalTimelineResult, TelemetryError> {
        let hours = match hours {
            n if n < 1 => 24,
            n if n > 720 => 720,
            n => n,
        };
        let limit = match limit {
            n if n < 1 => 5000,
            n if n > 10_000 => 10_000,
            n => n,
        };

        self.cached(format!("intervals:{}:{}", hours, limit), || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;

            let start_time = Local::now() - ChronoDuration::hours(hours);

            let rows = sqlx::query(
                r#"
                SELECT timestamp, model
                FROM usage_records
                WHERE timestamp >= ? AND success = 1
                ORDER BY timestamp ASC
                "#,
            )
            .bind(format_rfc3339_local(start_time))
            .fetch_all(self.pool())
            .await?;

            let mut records: Vec<(DateTime<Local>, String)> = Vec::with_capacity(rows.len());
            for row in &rows {
                let raw: String = row.try_get("timestamp")?;
                let model: String = row.try_get("model")?;
                if let Some(ts) = parse_stored_timestamp(&raw) {
                    records.push((ts, model));
                }
            }

            let mut points = Vec::new();
            let mut models_set = HashSet::new();
            for pair in records.windows(2) {
                let (ref prev, _) = pair[0];
                let (ref curr, ref model) = pair[1];
                let interval = (*curr - *prev).num_milliseconds() as f64 / 60_000.0;
                if interval > 120.0 {
                    continue;
                }
                // Two decimal places, truncated.
                let y = (interval * 100.0) as i64 as f64 / 100.0;
                if y <= 0.0 {
                    continue;
                }
                points.push(IntervalTimelinePoint {
                    x: format_rfc3339_local(*curr),
                    y,
                    model: model.clone(),
                });
                if !model.is_empty() {
                    models_set.insert(model.clone());
                }
            }

            if points.len() as i64 > limit {
                let len = points.len();
                let mut sampled = Vec::with_capacity(limit as usize);
                for i in 0..limit {
                    let idx = (i as usize * len) / limit as usize;
                    if idx < len {
                        sampled.push(points[idx].clone());
                    }
                }
                points = sampled;
            }

            let mut models: Vec<String> = models_set.into_iter().collect();
            models.sort();

            Ok(IntervalTimelineResult {
                analysis_period_hours: hours,
                total_points: points.len() as i64,
                points,
                models,
            })
        })
        .await
    }

    /// KPI metrics under the same filter set as a record listing.
    pub async fn get_usage_kpis(&self, query: &ListQuery) -> Result<UsageKpis, TelemetryError> {
        let filters = super::list_filters(query);
        let where_clause = filters.where_clause();
        let key = format!(
            "kpis:{}:{:?}:{}:{}",
            where_clause, filters.args, query.start_time, query.end_time
        );

        self.cached(key, || async move {
            let _guard = self.lock.read().await;
            self.ensure_open()?;
            self.usage_kpis_inner(&where_clause, &filters.args, &query.start_time, &query.end_time)
                .await
        })
        .await
    }

    /// Compute KPIs for an already-built WHERE clause. Called by `list` with
    /// the lock already held; does not lock or consult the cache itself.
    pub(crate) async fn usage_kpis_inner(
        &self,
        where_clause: &str,
        where_args: &[SqlArg],
        start_time: &str,
        end_time: &str,
    ) -> Result<UsageKpis, TelemetryError> {
        let mut kpis = UsageKpis {
            total_requests: 0,
            success_requests: 0,
            failure_requests: 0,
            total_tokens: 0,
            cached_tokens: 0,
            reasoning_tokens: 0,
            rpm: 0,
            tpm: 0,
            trend_bucket: String::new(),
            requests_trend: Vec::new(),
            tokens_trend: Vec::new(),
            rpm_trend: Vec::new(),
            tpm_trend: Vec::new(),
            generated_at: format_rfc3339_local(Local::now()),
        };

        // Totals under the same filters as the list endpoint. The KPI token
        // total intentionally includes cached and reasoning tokens.
        let totals_sql = format!(
            r#"
            SELECT
                COUNT(*) as total_requests,
                COALESCE(SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END), 0) as success_requests,
                COALESCE(SUM(CASE WHEN success = 0 THEN 1 ELSE 0 END), 0) as failure_requests,
                COALESCE(SUM(input_tokens + output_tokens + cached_tokens + reasoning_tokens), 0) as total_tokens,
                COALESCE(SUM(cached_tokens), 0) as cached_tokens,
                COALESCE(SUM(reasoning_tokens), 0) as reasoning_tokens
            FROM usage_records
            {}
            "#,
            where_clause
        );
        let row = bind_args(sqlx::query(&totals_sql), where_args)
            .fetch_one(self.pool())
            .await?;
        kpis.total_requests = row.try_get("total_requests")?;
        kpis.success_requests = row.try_get("success_requests")?;
        kpis.failure_requests = row.try_get("failure_requests")?;
        kpis.total_tokens = row.try_get("total_tokens")?;
        kpis.cached_tokens = row.try_get("cached_tokens")?;
        kpis.reasoning_tokens = row.try_get("reasoning_tokens")?;

        // Trend window.
        let mut trend_end = parse_time_param_to_time(end_time).unwrap_or_else(Local::now);
        let mut trend_start =
            parse_time_param_to_time(start_time).unwrap_or(trend_end - ChronoDuration::hours(24));
        if trend_start > trend_end {
            std::mem::swap(&mut trend_start, &mut trend_end);
        }

        let bucket = if trend_end - trend_start > ChronoDuration::hours(48) {
            "day"
        } else {
            "hour"
        };
        kpis.trend_bucket = bucket.to_string();

        let key_expr = if bucket == "day" {
            "substr(timestamp, 1, 10)"
        } else {
            "substr(timestamp, 1, 13)"
        };
        let trend_sql = format!(
            r#"
            SELECT
                {} as bucket_key,
                COUNT(*) as requests,
                COALESCE(SUM(input_tokens + output_tokens + cached_tokens + reasoning_tokens), 0) as tokens
            FROM usage_records
            {}
            GROUP BY bucket_key
            ORDER BY bucket_key ASC
            "#,
            key_expr, where_clause
        );

        let mut requests_by_bucket: HashMap<String, i64> = HashMap::new();
        let mut tokens_by_bucket: HashMap<String, i64> = HashMap::new();
        for row in &bind_args(sqlx::query(&trend_sql), where_args)
            .fetch_all(self.pool())
            .await?
        {
            let bucket_key: String = row.try_get("bucket_key")?;
            let requests: i64 = row.try_get("requests")?;
            let tokens: i64 = row.try_get("tokens")?;
            let label = if bucket == "hour" {
                format!("{}:00", bucket_key.replacen('T', " ", 1))
            } else {
                bucket_key
            };
            requests_by_bucket.insert(label.clone(), requests);
            tokens_by_bucket.insert(label, tokens);
        }

        if bucket == "day" {
            let mut d = trend_start.date_naive();
            let end = trend_end.date_naive();
            while d <= end {
                let label = d.format("%Y-%m-%d").to_string();
                kpis.requests_trend.push(KpiTrendPoint {
                    t: label.clone(),
                    v: requests_by_bucket.get(&label).copied().unwrap_or(0),
                });
                kpis.tokens_trend.push(KpiTrendPoint {
                    t: label.clone(),
                    v: tokens_by_bucket.get(&label).copied().unwrap_or(0),
                });
                d = match d.succ_opt() {
                    Some(next) => next,
                    None => break,
                };
            }
        } else {
            let mut h = trunc_hour(trend_start);
            let end_hour = trunc_hour(trend_end);
            while h <= end_hour {
                let label = h.format("%Y-%m-%d %H:00").to_string();
                kpis.requests_trend.push(KpiTrendPoint {
                    t: label.clone(),
                    v: requests_by_bucket.get(&label).copied().unwrap_or(0),
                });
                kpis.tokens_trend.push(KpiTrendPoint {
                    t: label.clone(),
                    v: tokens_by_bucket.get(&label).copied().unwrap_or(0),
                });
                h += ChronoDuration::hours(1);
            }
        }

        // RPM/TPM: trailing 60 seconds ending at the query's end time (or
        // now). The list's WHERE clause is inherited and the window filter
        // appended; timestamp filters therefore interact. Specified
        // behavior, kept as-is.
        let window_end = trend_end;
        let window_start = window_end - ChronoDuration::seconds(60);

        let mut window_args: Vec<SqlArg> = where_args.to_vec();
        let window_clause = if where_clause.trim().is_empty() {
            "WHERE timestamp >= ? AND timestamp <= ?".to_string()
        } else {
            format!("{} AND timestamp >= ? AND timestamp <= ?", where_clause.trim())
        };
        window_args.push(SqlArg::Text(format_rfc3339_local(window_start)));
        window_args.push(SqlArg::Text(format_rfc3339_local(window_end)));

        let rpm_sql = format!("SELECT COUNT(*) FROM usage_records {}", window_clause);
        kpis.rpm = bind_scalar_args(sqlx::query_scalar(&rpm_sql), &window_args)
            .fetch_one(self.pool())
            .await?;

        let tpm_sql = format!(
            "SELECT COALESCE(SUM(input_tokens + output_tokens + cached_tokens + reasoning_tokens), 0) FROM usage_records {}",
            window_clause
        );
        kpis.tpm = bind_scalar_args(sqlx::query_scalar(&tpm_sql), &window_args)
            .fetch_one(self.pool())
            .await?;

        // RPM/TPM trend: per-minute buckets over the trailing 60 minutes.
        let minute_end = trunc_minute(window_end);
        let minute_start = minute_end - ChronoDuration::minutes(59);

        let mut minute_args: Vec<SqlArg> = where_args.to_vec();
        let minute_clause = if where_clause.trim().is_empty() {
            "WHERE timestamp >= ? AND timestamp <= ?".to_string()
        } else {
            format!("{} AND timestamp >= ? AND timestamp <= ?", where_clause.trim())
        };
        minute_args.push(SqlArg::Text(format_rfc3339_local(minute_start)));
        minute_args.push(SqlArg::Text(format_rfc3339_local(minute_end)));

        let minute_sql = format!(
            r#"
            SELECT
                substr(timestamp, 1, 16) as minute_key,
                COUNT(*) as requests,
                COALESCE(SUM(input_tokens + output_tokens + cached_tokens + reasoning_tokens), 0) as tokens
            FROM usage_records
            {}
            GROUP BY minute_key
            ORDER BY minute_key ASC
            "#,
            minute_clause
        );

        let mut minute_requests: HashMap<String, i64> = HashMap::new();
        let mut minute_tokens: HashMap<String, i64> = HashMap::new();
        for row in &bind_args(sqlx::query(&minute_sql), &minute_args)
            .fetch_all(self.pool())
            .await?
        {
            let minute_key: String = row.try_get("minute_key")?;
            let requests: i64 = row.try_get("requests")?;
            let tokens: i64 = row.try_get("tokens")?;
            let label = minute_key.replacen('T', " ", 1);
            minute_requests.insert(label.clone(), requests);
            minute_tokens.insert(label, tokens);
        }

        let mut t = minute_start;
        while t <= minute_end {
            let label = t.format("%Y-%m-%d %H:%M").to_string();
            kpis.rpm_trend.push(KpiTrendPoint {
                t: label.clone(),
                v: minute_requests.get(&label).copied().unwrap_or(0),
            });
            kpis.tpm_trend.push(KpiTrendPoint {
                t: label.clone(),
                v: minute_tokens.get(&label).copied().unwrap_or(0),
            });
            t += ChronoDuration::minutes(1);
        }

        Ok(kpis)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{create_test_store, sample_record};
    use super::*;
    use crate::record::ListQuery;
    use crate::timeparam::format_rfc3339_local;

    #[tokio::test]
    async fn test_usage_summary_empty_db() {
        let store = create_test_store().await;
        let summary = store.get_usage_summary("", "").await.unwrap();
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.success_requests, 0);
        assert_eq!(summary.failure_requests, 0);
        assert_eq!(summary.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_usage_summary_rates() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();
        let mut failed = sample_record("req-2");
        failed.success = false;
        store.insert(&failed).await.unwrap();

        let summary = store.get_usage_summary("", "").await.unwrap();
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.success_requests, 1);
        assert_eq!(summary.failure_requests, 1);
        assert!((summary.success_rate - 50.0).abs() < f64::EPSILON);
        assert_eq!(summary.input_tokens, 20);
        assert_eq!(summary.output_tokens, 40);
    }

    #[tokio::test]
    async fn test_heatmap_returns_exactly_n_days_zero_filled() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();

        let heatmap = store.get_activity_heatmap(7).await.unwrap();
        assert_eq!(heatmap.total_days, 7);
        assert_eq!(heatmap.days.len(), 7);
        // Only today has data; the rest are zero-filled.
        let today = Local::now().format("%Y-%m-%d").to_string();
        let nonzero: Vec<_> = heatmap.days.iter().filter(|d| d.requests > 0).collect();
        assert_eq!(nonzero.len(), 1);
        assert_eq!(nonzero[0].date, today);
        assert_eq!(
            heatmap.max_requests,
            heatmap.days.iter().map(|d| d.requests).max().unwrap()
        );
    }

    #[tokio::test]
    async fn test_heatmap_clamps_days() {
        let store = create_test_store().await;
        let heatmap = store.get_activity_heatmap(0).await.unwrap();
        assert_eq!(heatmap.total_days, 90);
        let heatmap = store.get_activity_heatmap(9999).await.unwrap();
        assert_eq!(heatmap.total_days, 365);
    }

    #[tokio::test]
    async fn test_model_and_provider_stats_grouping() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();
        store.insert(&sample_record("req-2")).await.unwrap();
        let mut other = sample_record("req-3");
        other.model = "m2".to_string();
        other.provider = "anthropic".to_string();
        other.success = false;
        store.insert(&other).await.unwrap();

        let models = store.get_model_stats("", "").await.unwrap();
        assert_eq!(models.total_models, 2);
        assert_eq!(models.models[0].model, "m1");
        assert_eq!(models.models[0].request_count, 2);
        assert_eq!(models.models[0].success_count, 2);

        let providers = store.get_provider_stats("", "").await.unwrap();
        assert_eq!(providers.total_providers, 2);
        let anthropic = providers
            .providers
            .iter()
            .find(|p| p.provider == "anthropic")
            .unwrap();
        assert_eq!(anthropic.failure_count, 1);
    }

    #[tokio::test]
    async fn test_distinct_options_skips_blank() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();
        let mut blank = sample_record("req-2");
        blank.model = "".to_string();
        store.insert(&blank).await.unwrap();

        let options = store.get_distinct_options("", "").await.unwrap();
        assert_eq!(options.models, vec!["m1".to_string()]);
        assert_eq!(options.providers, vec!["openai".to_string()]);
    }

    #[tokio::test]
    async fn test_kpi_bucket_hour_within_48h() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();

        let end = Local::now();
        let start = end - ChronoDuration::hours(48);
        let kpis = store
            .get_usage_kpis(&ListQuery {
                start_time: format_rfc3339_local(start),
                end_time: format_rfc3339_local(end),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(kpis.trend_bucket, "hour");
        assert_eq!(kpis.requests_trend.len(), 49);
        assert_eq!(kpis.rpm_trend.len(), 60);
        assert_eq!(kpis.tpm_trend.len(), 60);
    }

    #[tokio::test]
    async fn test_kpi_bucket_flips_to_day_past_48h() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();

        let end = Local::now();
        let start = end - ChronoDuration::hours(48) - ChronoDuration::seconds(1);
        let kpis = store
            .get_usage_kpis(&ListQuery {
                start_time: format_rfc3339_local(start),
                end_time: format_rfc3339_local(end),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(kpis.trend_bucket, "day");
        // Dense day buckets across the window, inclusive.
        assert_eq!(
            kpis.requests_trend.len() as i64,
            (end.date_naive() - start.date_naive()).num_days() + 1
        );
    }

    #[tokio::test]
    async fn test_kpi_totals_and_rpm_under_filter() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();
        let mut other = sample_record("req-2");
        other.model = "m2".to_string();
        store.insert(&other).await.unwrap();

        let kpis = store
            .get_usage_kpis(&ListQuery {
                model: "m1".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(kpis.total_requests, 1);
        assert_eq!(kpis.success_requests, 1);
        // input + output + cached + reasoning for the single m1 row
        assert_eq!(kpis.total_tokens, 30);
        // The row was just inserted, so it falls inside the trailing minute.
        assert_eq!(kpis.rpm, 1);
        assert_eq!(kpis.tpm, 30);
    }

    #[tokio::test]
    async fn test_interval_timeline_bounds_and_decimation() {
        let store = create_test_store().await;
        let base = Local::now() - ChronoDuration::hours(2);
        for i in 0..12 {
            let mut record = sample_record(&format!("req-{}", i));
            record.timestamp = base + ChronoDuration::minutes(i * 5);
            store.insert(&record).await.unwrap();
        }
        // One record far in the past: the gap to it exceeds 120 minutes and
        // must be discarded.
        let mut stale = sample_record("req-stale");
        stale.timestamp = base - ChronoDuration::hours(10);
        store.insert(&stale).await.unwrap();

        let result = store.get_interval_timeline(24, 5).await.unwrap();
        assert_eq!(result.analysis_period_hours, 24);
        assert_eq!(result.points.len(), 5);
        for point in &result.points {
            assert!(point.y > 0.0 && point.y <= 120.0);
        }
        // Non-decreasing by x.
        let xs: Vec<&str> = result.points.iter().map(|p| p.x.as_str()).collect();
        let mut sorted = xs.clone();
        sorted.sort();
        assert_eq!(xs, sorted);
        assert_eq!(result.models, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn test_interval_timeline_skips_failed_requests() {
        let store = create_test_store().await;
        let base = Local::now() - ChronoDuration::hours(1);
        for i in 0..3 {
            let mut record = sample_record(&format!("req-{}", i));
            record.timestamp = base + ChronoDuration::minutes(i * 10);
            record.success = i != 1;
            store.insert(&record).await.unwrap();
        }

        let result = store.get_interval_timeline(24, 5000).await.unwrap();
        // Two successful rows -> one interval of 20 minutes.
        assert_eq!(result.points.len(), 1);
        assert!((result.points[0].y - 20.0).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_request_timeline_dense_hours() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();

        let end = Local::now();
        let start = end - ChronoDuration::hours(5);
        let timeline = store
            .get_request_timeline(&format_rfc3339_local(start), &format_rfc3339_local(end))
            .await
            .unwrap();

        assert_eq!(timeline.total_hours, 6);
        assert_eq!(timeline.points.len(), 6);
        assert_eq!(timeline.max_requests, 1);
        assert_eq!(timeline.points.last().unwrap().requests, 1);
    }

    #[tokio::test]
    async fn test_api_key_stats_groups_by_key() {
        let store = create_test_store().await;
        store.insert(&sample_record("req-1")).await.unwrap();
        store.insert(&sample_record("req-2")).await.unwrap();
        let mut anonymous = sample_record("req-3");
        anonymous.api_key = String::new();
        store.insert(&anonymous).await.unwrap();

        let stats = store.get_api_key_stats().await.unwrap();
        assert_eq!(stats.len(), 1);
        let entry = &stats["sk-test-key-123"];
        assert_eq!(entry.usage_count, 2);
        assert_eq!(entry.input_tokens, 20);
        assert!(!entry.last_used_at.is_empty());
    }
}
