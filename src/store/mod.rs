//! SQLite-backed storage for usage records and request candidates.
//!
//! The store opens the database with a single connection (SQLite has one
//! writer) and serializes every write behind an internal reader/writer lock;
//! reads run concurrently. Column encoding is deliberately simple and
//! forward-compatible: booleans as 0/1, timestamps as RFC3339 text, header
//! maps as JSON objects. New columns are added with tolerant `ALTER TABLE`
//! migrations whose errors are ignored (the column may already exist).

pub mod aggregates;
pub mod patch;
pub mod query_cache;
pub mod write_queue;

pub use aggregates::{
    ActivityHeatmap, ActivityHeatmapDay, ApiKeyStats, DistinctOptionsResult, IntervalTimelinePoint,
    IntervalTimelineResult, KpiTrendPoint, ModelStats, ModelStatsResult, ProviderStats,
    ProviderStatsResult, RequestTimelinePoint, RequestTimelineResult, UsageKpis, UsageSummary,
};
pub use patch::RecordPatch;
pub use query_cache::QueryCache;
pub use write_queue::WriteQueue;

use crate::error::TelemetryError;
use crate::record::{ListQuery, ListResult, RequestCandidate, UsageRecord};
use crate::timeparam::{format_rfc3339_local, parse_stored_timestamp, parse_time_param};
use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

const DB_FILE_NAME: &str = "usage_records.db";
const DEFAULT_RETENTION_BATCH_SIZE: i64 = 1000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS usage_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    timestamp DATETIME NOT NULL,
    ip TEXT NOT NULL DEFAULT '',
    api_key TEXT NOT NULL DEFAULT '',
    api_key_masked TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    provider TEXT NOT NULL DEFAULT '',
    is_streaming INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    cached_tokens INTEGER NOT NULL DEFAULT 0,
    reasoning_tokens INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 1,
    request_url TEXT NOT NULL DEFAULT '',
    request_method TEXT NOT NULL DEFAULT '',
    request_headers TEXT NOT NULL DEFAULT '{}',
    request_body TEXT NOT NULL DEFAULT '',
    response_headers TEXT NOT NULL DEFAULT '{}',
    response_body TEXT NOT NULL DEFAULT '',
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_usage_records_timestamp ON usage_records(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_usage_records_api_key ON usage_records(api_key);
CREATE INDEX IF NOT EXISTS idx_usage_records_model ON usage_records(model);
CREATE INDEX IF NOT EXISTS idx_usage_records_provider ON usage_records(provider);
CREATE INDEX IF NOT EXISTS idx_usage_records_request_id ON usage_records(request_id);

CREATE TABLE IF NOT EXISTS request_candidates (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    timestamp DATETIME NOT NULL,
    provider TEXT NOT NULL DEFAULT '',
    api_key TEXT NOT NULL DEFAULT '',
    api_key_masked TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    status_code INTEGER NOT NULL DEFAULT 0,
    success INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    error_message TEXT NOT NULL DEFAULT '',
    candidate_index INTEGER NOT NULL DEFAULT 0,
    retry_index INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_request_candidates_request_id ON request_candidates(request_id);
CREATE INDEX IF NOT EXISTS idx_request_candidates_timestamp ON request_candidates(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_request_candidates_status ON request_candidates(status);
"#;

/// A positional SQL argument for dynamically built queries.
#[derive(Debug, Clone)]
pub(crate) enum SqlArg {
    Text(String),
    Int(i64),
}

/// Dynamically assembled WHERE conditions plus their positional arguments.
#[derive(Debug, Default, Clone)]
pub(crate) struct Filters {
    conditions: Vec<String>,
    pub(crate) args: Vec<SqlArg>,
}

impl Filters {
    pub(crate) fn push(&mut self, condition: &str, arg: SqlArg) {
        self.conditions.push(condition.to_string());
        self.args.push(arg);
    }

    pub(crate) fn push_raw(&mut self, condition: &str) {
        self.conditions.push(condition.to_string());
    }

    pub(crate) fn where_clause(&self) -> String {
        if self.conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.conditions.join(" AND "))
        }
    }
}

pub(crate) fn bind_args<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    args: &'q [SqlArg],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    let mut query = query;
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s.as_str()),
            SqlArg::Int(i) => query.bind(*i),
        };
    }
    query
}

pub(crate) fn bind_scalar_args<'q, O>(
    query: sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>>,
    args: &'q [SqlArg],
) -> sqlx::query::QueryScalar<'q, sqlx::Sqlite, O, sqlx::sqlite::SqliteArguments<'q>> {
    let mut query = query;
    for arg in args {
        query = match arg {
            SqlArg::Text(s) => query.bind(s.as_str()),
            SqlArg::Int(i) => query.bind(*i),
        };
    }
    query
}

fn encode_headers(headers: &HashMap<String, String>) -> String {
    serde_json::to_string(headers).unwrap_or_else(|_| "{}".to_string())
}

fn decode_headers(raw: &str) -> HashMap<String, String> {
    serde_json::from_str(raw).unwrap_or_default()
}

/// Time-range conditions shared by the aggregate queries. Bounds are
/// inclusive; empty strings add no condition.
pub(crate) fn time_filters(start_time: &str, end_time: &str) -> Filters {
    let mut filters = Filters::default();
    if !start_time.is_empty() {
        filters.push("timestamp >= ?", SqlArg::Text(parse_time_param(start_time)));
    }
    if !end_time.is_empty() {
        filters.push("timestamp <= ?", SqlArg::Text(parse_time_param(end_time)));
    }
    filters
}

/// SQLite-backed storage for usage records.
///
/// All operations fail with [`TelemetryError::StoreClosed`] after
/// [`Store::close`]. Aggregate reads are served through the query cache when
/// one is configured; every successful write invalidates it.
pub struct Store {
    pool: SqlitePool,
    db_path: PathBuf,
    lock: RwLock<()>,
    closed: AtomicBool,
    cache: Option<QueryCache>,
}

impl Store {
    /// Open (or create) the database under `data_dir`. The directory is
    /// created if missing. A zero `cache_ttl` disables the query cache.
    pub async fn open(data_dir: impl AsRef<Path>, cache_ttl: Duration) -> Result<Self, TelemetryError> {
        let dir = data_dir.as_ref();
        let dir = if dir.as_os_str().is_empty() {
            Path::new(".")
        } else {
            dir
        };
        std::fs::create_dir_all(dir)
            .map_err(|e| TelemetryError::Internal(format!("failed to create data directory: {}", e)))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755));
        }

        let db_path = dir.join(DB_FILE_NAME);
        let options = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, db_path, cache_ttl);
        store.init_schema().await?;

        tracing::info!(path = %store.db_path.display(), "usage record store initialized");
        Ok(store)
    }

    /// Open an in-memory database. Used by tests and short-lived tooling.
    pub async fn open_in_memory(cache_ttl: Duration) -> Result<Self, TelemetryError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, PathBuf::from(":memory:"), cache_ttl);
        store.init_schema().await?;
        Ok(store)
    }

    fn from_pool(pool: SqlitePool, db_path: PathBuf, cache_ttl: Duration) -> Self {
        Self {
            pool,
            db_path,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
            cache: QueryCache::new(cache_ttl),
        }
    }

    async fn init_schema(&self) -> Result<(), TelemetryError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;

        // Additive migrations for databases created by earlier builds. The
        // column may already exist, so errors are intentionally ignored.
        for migration in [
            "ALTER TABLE usage_records ADD COLUMN ip TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE usage_records ADD COLUMN cached_tokens INTEGER NOT NULL DEFAULT 0",
            "ALTER TABLE usage_records ADD COLUMN reasoning_tokens INTEGER NOT NULL DEFAULT 0",
        ] {
            let _ = sqlx::raw_sql(migration).execute(&self.pool).await;
        }

        Ok(())
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), TelemetryError> {
        if self.is_closed() {
            Err(TelemetryError::StoreClosed)
        } else {
            Ok(())
        }
    }

    pub(crate) fn invalidate_caches(&self) {
        if let Some(cache) = &self.cache {
            cache.clear();
        }
    }

    /// Serve an aggregate read through the query cache when enabled,
    /// coalescing concurrent computations per key.
    pub(crate) async fn cached<T, F, Fut>(&self, key: String, compute: F) -> Result<T, TelemetryError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TelemetryError>>,
    {
        match &self.cache {
            Some(cache) => cache.get_with(&key, compute).await,
            None => compute().await,
        }
    }

    /// Insert a new usage record and return its assigned id.
    pub async fn insert(&self, record: &UsageRecord) -> Result<i64, TelemetryError> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;

        let request_headers = encode_headers(&record.request_headers);
        let response_headers = encode_headers(&record.response_headers);

        let result = sqlx::query(
            r#"
            INSERT INTO usage_records (
                request_id, timestamp, ip, api_key, api_key_masked, model, provider,
                is_streaming, input_tokens, output_tokens, total_tokens,
                cached_tokens, reasoning_tokens,
                duration_ms, status_code, success, request_url, request_method,
                request_headers, request_body, response_headers, response_body
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_id)
        .bind(format_rfc3339_local(record.timestamp))
        .bind(&record.ip)
        .bind(&record.api_key)
        .bind(&record.api_key_masked)
        .bind(&record.model)
        .bind(&record.provider)
        .bind(record.is_streaming as i64)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.total_tokens)
        .bind(record.cached_tokens)
        .bind(record.reasoning_tokens)
        .bind(record.duration_ms)
        .bind(record.status_code)
        .bind(record.success as i64)
        .bind(&record.request_url)
        .bind(&record.request_method)
        .bind(request_headers)
        .bind(&record.request_body)
        .bind(response_headers)
        .bind(&record.response_body)
        .execute(&self.pool)
        .await?;

        self.invalidate_caches();
        Ok(result.last_insert_rowid())
    }

    /// Insert a routing-attempt candidate row and return its assigned id.
    pub async fn insert_request_candidate(
        &self,
        candidate: &RequestCandidate,
    ) -> Result<i64, TelemetryError> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;

        let result = sqlx::query(
            r#"
            INSERT INTO request_candidates (
                request_id, timestamp, provider, api_key, api_key_masked,
                status, status_code, success, duration_ms, error_message,
                candidate_index, retry_index
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&candidate.request_id)
        .bind(format_rfc3339_local(candidate.timestamp))
        .bind(&candidate.provider)
        .bind(&candidate.api_key)
        .bind(&candidate.api_key_masked)
        .bind(&candidate.status)
        .bind(candidate.status_code)
        .bind(candidate.success as i64)
        .bind(candidate.duration_ms)
        .bind(&candidate.error_message)
        .bind(candidate.candidate_index)
        .bind(candidate.retry_index)
        .execute(&self.pool)
        .await?;

        self.invalidate_caches();
        Ok(result.last_insert_rowid())
    }

    /// Fetch a single record with full request/response details.
    /// Returns `Ok(None)` when the id does not exist.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<UsageRecord>, TelemetryError> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;

        let row = sqlx::query(
            r#"
            SELECT id, request_id, timestamp, ip, api_key, api_key_masked, model, provider,
                is_streaming, input_tokens, output_tokens, total_tokens, cached_tokens, reasoning_tokens,
                duration_ms, status_code, success, request_url, request_method,
                request_headers, request_body, response_headers, response_body
            FROM usage_records
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(decode_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Retrieve a paginated, filtered list of usage records. Invalid
    /// pagination values are coerced: page >= 1, page_size in [1, 100]
    /// (default 20). The sort column is whitelisted.
    pub async fn list(&self, query: &ListQuery) -> Result<ListResult, TelemetryError> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;

        let page = if query.page < 1 { 1 } else { query.page };
        let page_size = match query.page_size {
            n if n < 1 => 20,
            n if n > 100 => 100,
            n => n,
        };

        let filters = list_filters(query);
        let where_clause = filters.where_clause();

        let count_sql = format!("SELECT COUNT(*) FROM usage_records {}", where_clause);
        let total: i64 = bind_scalar_args(sqlx::query_scalar(&count_sql), &filters.args)
            .fetch_one(&self.pool)
            .await?;

        let sort_by = match query.sort_by.as_str() {
            "timestamp" | "model" | "provider" | "total_tokens" | "duration_ms" | "status_code" => {
                query.sort_by.as_str()
            }
            _ => "timestamp",
        };
        let sort_order = if query.sort_order.eq_ignore_ascii_case("asc") {
            "ASC"
        } else {
            "DESC"
        };

        let offset = (page - 1) * page_size;
        let select_sql = format!(
            r#"
            SELECT id, request_id, timestamp, ip, api_key, api_key_masked, model, provider,
                is_streaming, input_tokens, output_tokens, total_tokens, cached_tokens, reasoning_tokens,
                duration_ms, status_code, success, request_url, request_method,
                request_headers, request_body, response_headers, response_body
            FROM usage_records {}
            ORDER BY {} {}
            LIMIT ? OFFSET ?
            "#,
            where_clause, sort_by, sort_order
        );

        let rows = bind_args(sqlx::query(&select_sql), &filters.args)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_record(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "failed to decode usage record row"),
            }
        }

        let total_pages = (total + page_size - 1) / page_size;

        let kpis = if query.include_kpis {
            match self
                .usage_kpis_inner(&where_clause, &filters.args, &query.start_time, &query.end_time)
                .await
            {
                Ok(kpis) => Some(kpis),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to compute usage kpis");
                    None
                }
            }
        } else {
            None
        };

        Ok(ListResult {
            records,
            total,
            page,
            page_size,
            total_pages,
            kpis,
        })
    }

    /// All candidate rows for a request id, ordered by
    /// `(candidate_index, retry_index)`.
    pub async fn get_request_candidates(
        &self,
        request_id: &str,
    ) -> Result<Vec<RequestCandidate>, TelemetryError> {
        let _guard = self.lock.read().await;
        self.ensure_open()?;

        let rows = sqlx::query(
            r#"
            SELECT id, request_id, timestamp, provider, api_key, api_key_masked,
                status, status_code, success, duration_ms, error_message,
                candidate_index, retry_index
            FROM request_candidates
            WHERE request_id = ?
            ORDER BY candidate_index ASC, retry_index ASC
            "#,
        )
        .bind(request_id)
        .fetch_all(&self.pool)
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode_candidate(row) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => tracing::warn!(error = %e, "failed to decode request candidate row"),
            }
        }
        Ok(candidates)
    }

    /// Remove records older than `age`. Admin path; callers validate the
    /// requested age. Returns the number of deleted rows.
    pub async fn delete_older_than(&self, age: chrono::Duration) -> Result<u64, TelemetryError> {
        let _guard = self.lock.write().await;
        self.ensure_open()?;

        let cutoff = format_rfc3339_local(Local::now() - age);
        let result = sqlx::query("DELETE FROM usage_records WHERE timestamp < ?")
            .bind(&cutoff)
            .execute(&self.pool)
            .await?;

        self.invalidate_caches();
        Ok(result.rows_affected())
    }

    /// Delete up to `batch_size` rows whose timestamp is before `cutoff`,
    /// oldest first. The retention cleaner calls this in a loop to keep
    /// write-lock hold times short.
    pub async fn delete_older_than_cutoff_batch(
        &self,
        cutoff: &str,
        batch_size: i64,
    ) -> Result<u64, TelemetryError> {
        let batch_size = if batch_size <= 0 {
            DEFAULT_RETENTION_BATCH_SIZE
        } else {
            batch_size
        };

        let _guard = self.lock.write().await;
        self.ensure_open()?;

        let result = sqlx::query(
            r#"
            DELETE FROM usage_records
            WHERE id IN (
                SELECT id
                FROM usage_records
                WHERE timestamp < ?
                ORDER BY timestamp ASC
                LIMIT ?
            )
            "#,
        )
        .bind(cutoff)
        .bind(batch_size)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.invalidate_caches();
        }
        Ok(result.rows_affected())
    }

    /// Close the store. Subsequent operations fail with `StoreClosed`;
    /// closing twice is a no-op.
    pub async fn close(&self) {
        let _guard = self.lock.write().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pool.close().await;
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn list_filters(query: &ListQuery) -> Filters {
    let mut filters = Filters::default();

    if !query.api_key.is_empty() {
        filters.push("api_key LIKE ?", SqlArg::Text(format!("%{}%", query.api_key)));
    }
    if !query.model.is_empty() {
        filters.push("model LIKE ?", SqlArg::Text(format!("%{}%", query.model)));
    }
    if !query.provider.is_empty() {
        filters.push("provider LIKE ?", SqlArg::Text(format!("%{}%", query.provider)));
    }
    if !query.url.is_empty() {
        filters.push("request_url LIKE ?", SqlArg::Text(format!("%{}%", query.url)));
    }
    if !query.ip.is_empty() {
        filters.push("ip LIKE ?", SqlArg::Text(format!("%{}%", query.ip)));
    }
    if !query.start_time.is_empty() {
        filters.push("timestamp >= ?", SqlArg::Text(parse_time_param(&query.start_time)));
    }
    if !query.end_time.is_empty() {
        filters.push("timestamp <= ?", SqlArg::Text(parse_time_param(&query.end_time)));
    }
    match query.success {
        Some(true) => filters.push_raw("success = 1"),
        Some(false) => filters.push_raw("success = 0"),
        None => {}
    }
    if !query.search.is_empty() {
        filters.push_raw(
            "(model LIKE ? OR provider LIKE ? OR request_url LIKE ? OR api_key LIKE ? OR api_key_masked LIKE ? OR ip LIKE ?)",
        );
        let term = format!("%{}%", query.search);
        for _ in 0..6 {
            filters.args.push(SqlArg::Text(term.clone()));
        }
    }

    filters
}

fn decode_record(row: &SqliteRow) -> Result<UsageRecord, sqlx::Error> {
    let timestamp_raw: String = row.try_get("timestamp")?;
    let request_headers_raw: String = row.try_get("request_headers")?;
    let response_headers_raw: String = row.try_get("response_headers")?;

    Ok(UsageRecord {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        timestamp: parse_stored_timestamp(&timestamp_raw).unwrap_or_else(Local::now),
        ip: row.try_get("ip")?,
        api_key: row.try_get("api_key")?,
        api_key_masked: row.try_get("api_key_masked")?,
        model: row.try_get("model")?,
        provider: row.try_get("provider")?,
        is_streaming: row.try_get::<i64, _>("is_streaming")? == 1,
        input_tokens: row.try_get("input_tokens")?,
        output_tokens: row.try_get("output_tokens")?,
        total_tokens: row.try_get("total_tokens")?,
        cached_tokens: row.try_get("cached_tokens")?,
        reasoning_tokens: row.try_get("reasoning_tokens")?,
        duration_ms: row.try_get("duration_ms")?,
        status_code: row.try_get("status_code")?,
        success: row.try_get::<i64, _>("success")? == 1,
        request_url: row.try_get("request_url")?,
        request_method: row.try_get("request_method")?,
        request_headers: decode_headers(&request_headers_raw),
        request_body: row.try_get("request_body")?,
        response_headers: decode_headers(&response_headers_raw),
        response_body: row.try_get("response_body")?,
    })
}

fn decode_candidate(row: &SqliteRow) -> Result<RequestCandidate, sqlx::Error> {
    let timestamp_raw: String = row.try_get("timestamp")?;

    Ok(RequestCandidate {
        id: row.try_get("id")?,
        request_id: row.try_get("request_id")?,
        timestamp: parse_stored_timestamp(&timestamp_raw).unwrap_or_else(Local::now),
        provider: row.try_get("provider")?,
        api_key: row.try_get("api_key")?,
        api_key_masked: row.try_get("api_key_masked")?,
        status: row.try_get("status")?,
        status_code: row.try_get("status_code")?,
        success: row.try_get::<i64, _>("success")? == 1,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
        candidate_index: row.try_get("candidate_index")?,
        retry_index: row.try_get("retry_index")?,
    })
}
