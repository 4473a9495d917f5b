//! HTTP request handlers.

use super::AppState;
use crate::db::DbError;
use crate::hub::serve_viewer;
use crate::ingest::{CreateExecutionRequest, IngestError};
use crate::metrics::{TimeWindow, DEFAULT_WINDOW_DAYS};

use axum::{
    extract::{rejection::JsonRejection, ws::WebSocketUpgrade, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

/// Executions returned by the job detail endpoint when no limit is given.
pub const DEFAULT_EXECUTION_LIMIT: usize = 100;

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

// ============================================================================
// Health
// ============================================================================

pub async fn handle_health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

// ============================================================================
// Live viewers
// ============================================================================

pub async fn handle_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let hub = state.hub.clone();
    let timings = state.pump_timings;
    ws.on_upgrade(move |socket| serve_viewer(socket, hub, timings))
}

// ============================================================================
// API: Executions
// ============================================================================

pub async fn handle_create_execution(
    State(state): State<AppState>,
    body: Result<Json<CreateExecutionRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match body {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.body_text()),
    };

    match state.intake.ingest(req) {
        Ok(record) => (StatusCode::CREATED, Json(record)).into_response(),
        Err(IngestError::Malformed(msg)) => error_response(StatusCode::BAD_REQUEST, msg),
        Err(IngestError::NotFound(_)) => error_response(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ============================================================================
// API: Jobs and dashboard
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct RangeQuery {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub limit: Option<String>,
}

impl RangeQuery {
    fn window(&self) -> Result<TimeWindow, String> {
        parse_date_range(self.from.as_deref(), self.to.as_deref(), Utc::now())
    }

    /// Positive limits are honored, anything else falls back to the default.
    fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|l| l.trim().parse::<usize>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_EXECUTION_LIMIT)
    }
}

/// Turn `YYYY-MM-DD` bounds into a window.
///
/// `to` covers its whole day. Unless both bounds are given the window is the
/// trailing seven days ending at `now`.
pub fn parse_date_range(
    from: Option<&str>,
    to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<TimeWindow, String> {
    let from = from.map(str::trim).filter(|s| !s.is_empty());
    let to = to.map(str::trim).filter(|s| !s.is_empty());

    let (from, to) = match (from, to) {
        (Some(from), Some(to)) => (from, to),
        _ => return Ok(TimeWindow::trailing_days(now, DEFAULT_WINDOW_DAYS)),
    };

    let from = NaiveDate::parse_from_str(from, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or("invalid from date format, expected YYYY-MM-DD")?
        .and_utc();
    let to = NaiveDate::parse_from_str(to, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_nano_opt(23, 59, 59, 999_999_999))
        .ok_or("invalid to date format, expected YYYY-MM-DD")?
        .and_utc();

    if from > to {
        return Err("from date must not be after to date".to_string());
    }
    Ok(TimeWindow::new(from, to))
}

pub async fn handle_get_jobs(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let window = match query.window() {
        Ok(w) => w,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.aggregator.list_targets(window) {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => {
            tracing::error!("Failed to list jobs: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn handle_get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let id = match id.parse::<i64>() {
        Ok(id) if id > 0 => id,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid job ID"),
    };
    let window = match query.window() {
        Ok(w) => w,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.aggregator.target_detail(id, window, Some(query.limit())) {
        Ok(detail) => Json(detail).into_response(),
        Err(DbError::NotFound) => error_response(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => {
            tracing::error!(job_id = id, "Failed to load job: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

pub async fn handle_dashboard_summary(
    State(state): State<AppState>,
    Query(query): Query<RangeQuery>,
) -> impl IntoResponse {
    let window = match query.window() {
        Ok(w) => w,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    match state.aggregator.summary(window) {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => {
            tracing::error!("Failed to compute dashboard summary: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}
