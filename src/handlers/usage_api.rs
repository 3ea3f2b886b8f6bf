//! Usage records HTTP API
//!
//! Router fragment the host mounts under its management surface; management
//! authentication is the host's concern. Responses are JSON with stable
//! field names, timestamps as RFC3339, booleans as JSON booleans.

use crate::error::TelemetryError;
use crate::record::{ListQuery, ListResult, RequestCandidate, UsageRecord};
use crate::service::Telemetry;
use crate::store::{
    ActivityHeatmap, DistinctOptionsResult, IntervalTimelineResult, ModelStatsResult,
    ProviderStatsResult, RequestTimelineResult, UsageSummary,
};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the usage API router.
pub fn router(telemetry: Arc<Telemetry>) -> Router {
    Router::new()
        .route(
            "/usage/records",
            get(list_usage_records).delete(delete_old_usage_records),
        )
        .route("/usage/records/{id}", get(get_usage_record))
        .route(
            "/usage/requests/{request_id}/candidates",
            get(get_request_candidates),
        )
        .route("/usage/heatmap", get(get_activity_heatmap))
        .route("/usage/models", get(get_model_stats))
        .route("/usage/providers", get(get_provider_stats))
        .route("/usage/summary", get(get_usage_summary))
        .route("/usage/options", get(get_usage_record_options))
        .route("/usage/timeline", get(get_request_timeline))
        .route("/usage/intervals", get(get_interval_timeline))
        .layer(TraceLayer::new_for_http())
        .with_state(telemetry)
}

/// Query parameters for the record listing.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub url: Option<String>,
    pub ip: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    /// `"true"`/`"1"` filter successes, anything else failures.
    pub success: Option<String>,
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub include_kpis: Option<bool>,
}

impl ListParams {
    fn into_query(self) -> ListQuery {
        ListQuery {
            page: self.page.unwrap_or(1),
            page_size: self.page_size.unwrap_or(20),
            api_key: self.api_key.unwrap_or_default(),
            model: self.model.unwrap_or_default(),
            provider: self.provider.unwrap_or_default(),
            url: self.url.unwrap_or_default(),
            ip: self.ip.unwrap_or_default(),
            start_time: self.start_time.unwrap_or_default(),
            end_time: self.end_time.unwrap_or_default(),
            success: self
                .success
                .filter(|s| !s.is_empty())
                .map(|s| s == "true" || s == "1"),
            search: self.search.unwrap_or_default(),
            sort_by: self.sort_by.unwrap_or_default(),
            sort_order: self.sort_order.unwrap_or_default(),
            include_kpis: self.include_kpis.unwrap_or(false),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TimeRangeParams {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HeatmapParams {
    pub days: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IntervalParams {
    pub hours: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct DeleteParams {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteBody {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CandidatesResponse {
    pub request_id: String,
    pub candidates: Vec<RequestCandidate>,
}

/// GET /usage/records - paginated, filtered record listing.
///
/// Example: GET /usage/records?page=1&page_size=20&model=gpt&include_kpis=true
pub async fn list_usage_records(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<ListParams>,
) -> Result<Json<ListResult>, TelemetryError> {
    let result = telemetry.store().list(&params.into_query()).await?;
    Ok(Json(result))
}

/// GET /usage/records/{id} - one record with full request/response details.
pub async fn get_usage_record(
    State(telemetry): State<Arc<Telemetry>>,
    Path(id): Path<i64>,
) -> Result<Json<UsageRecord>, TelemetryError> {
    match telemetry.store().get_by_id(id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(TelemetryError::NotFound),
    }
}

/// DELETE /usage/records?days=N - remove records older than N days.
/// `days` may also come from a JSON body; it must be at least 1.
pub async fn delete_old_usage_records(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<DeleteParams>,
    body: Option<Json<DeleteBody>>,
) -> Result<Json<serde_json::Value>, TelemetryError> {
    let days = body
        .and_then(|Json(body)| body.days)
        .or(params.days)
        .unwrap_or(30);
    if days < 1 {
        return Err(TelemetryError::InvalidParam(
            "days must be at least 1".to_string(),
        ));
    }

    let deleted = telemetry
        .store()
        .delete_older_than(chrono::Duration::days(days))
        .await?;

    Ok(Json(json!({
        "deleted": deleted,
        "message": format!("deleted {} records older than {} days", deleted, days),
    })))
}

/// GET /usage/requests/{request_id}/candidates - the routing trace for one
/// request, ordered by (candidate_index, retry_index).
pub async fn get_request_candidates(
    State(telemetry): State<Arc<Telemetry>>,
    Path(request_id): Path<String>,
) -> Result<Json<CandidatesResponse>, TelemetryError> {
    let candidates = telemetry.store().get_request_candidates(&request_id).await?;
    Ok(Json(CandidatesResponse {
        request_id,
        candidates,
    }))
}

/// GET /usage/heatmap?days=N - daily activity for the heatmap.
pub async fn get_activity_heatmap(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<HeatmapParams>,
) -> Result<Json<ActivityHeatmap>, TelemetryError> {
    let heatmap = telemetry
        .store()
        .get_activity_heatmap(params.days.unwrap_or(90))
        .await?;
    Ok(Json(heatmap))
}

/// GET /usage/models - usage statistics grouped by model.
pub async fn get_model_stats(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<ModelStatsResult>, TelemetryError> {
    let stats = telemetry
        .store()
        .get_model_stats(
            params.start_time.as_deref().unwrap_or(""),
            params.end_time.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(stats))
}

/// GET /usage/providers - usage statistics grouped by provider.
pub async fn get_provider_stats(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<ProviderStatsResult>, TelemetryError> {
    let stats = telemetry
        .store()
        .get_provider_stats(
            params.start_time.as_deref().unwrap_or(""),
            params.end_time.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(stats))
}

/// GET /usage/summary - overall usage summary.
pub async fn get_usage_summary(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<UsageSummary>, TelemetryError> {
    let summary = telemetry
        .store()
        .get_usage_summary(
            params.start_time.as_deref().unwrap_or(""),
            params.end_time.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(summary))
}

/// GET /usage/options - distinct model/provider values for filters.
pub async fn get_usage_record_options(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<DistinctOptionsResult>, TelemetryError> {
    let options = telemetry
        .store()
        .get_distinct_options(
            params.start_time.as_deref().unwrap_or(""),
            params.end_time.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(options))
}

/// GET /usage/timeline - hourly request distribution.
pub async fn get_request_timeline(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<TimeRangeParams>,
) -> Result<Json<RequestTimelineResult>, TelemetryError> {
    let timeline = telemetry
        .store()
        .get_request_timeline(
            params.start_time.as_deref().unwrap_or(""),
            params.end_time.as_deref().unwrap_or(""),
        )
        .await?;
    Ok(Json(timeline))
}

/// GET /usage/intervals?hours=24&limit=5000 - request interval scatter data.
pub async fn get_interval_timeline(
    State(telemetry): State<Arc<Telemetry>>,
    Query(params): Query<IntervalParams>,
) -> Result<Json<IntervalTimelineResult>, TelemetryError> {
    let timeline = telemetry
        .store()
        .get_interval_timeline(params.hours.unwrap_or(24), params.limit.unwrap_or(5000))
        .await?;
    Ok(Json(timeline))
}
