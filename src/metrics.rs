//! Health metrics derived from execution history.
//!
//! Nothing here is cached: every call recomputes from the store. Success
//! rate, average response time and the status breakdown are scoped to the
//! window. Last execution, recent executions and the type breakdown are not.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::db::{DbError, ExecutionRecord, Store, Target};

/// Window used when a query does not specify one.
pub const DEFAULT_WINDOW_DAYS: i64 = 7;
/// Size of the cross-target recent activity list.
pub const RECENT_ACTIVITY_LIMIT: usize = 20;
/// Size of the per-target recent execution list.
pub const TARGET_RECENT_LIMIT: usize = 10;

/// An inclusive time range `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// The `days` days leading up to `now`.
    pub fn trailing_days(now: DateTime<Utc>, days: i64) -> Self {
        Self {
            from: now - ChronoDuration::days(days),
            to: now,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from <= ts && ts <= self.to
    }
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::trailing_days(Utc::now(), DEFAULT_WINDOW_DAYS)
    }
}

/// Health of one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetMetrics {
    /// Percentage of successful executions in the window, 0 when there are none.
    pub success_rate: f64,
    /// Mean response time in the window in milliseconds, 0 when there are none.
    pub avg_response_time: f64,
    /// Newest execution across all history.
    pub last_execution: Option<DateTime<Utc>>,
    pub execution_count: i64,
}

/// Compute metrics from the executions inside a window.
///
/// `last_execution` is passed separately because it is not bounded by the
/// window: a narrow window must not hide that a target ran recently.
pub fn compute_target_metrics(
    window_executions: &[ExecutionRecord],
    last_execution: Option<DateTime<Utc>>,
) -> TargetMetrics {
    let total = window_executions.len() as i64;
    if total == 0 {
        return TargetMetrics {
            success_rate: 0.0,
            avg_response_time: 0.0,
            last_execution,
            execution_count: 0,
        };
    }

    let successes = window_executions.iter().filter(|e| e.is_success()).count() as i64;
    let total_time: i128 = window_executions
        .iter()
        .map(|e| e.response_time as i128)
        .sum();

    TargetMetrics {
        success_rate: success_rate(successes, total),
        avg_response_time: total_time as f64 / total as f64,
        last_execution,
        execution_count: total,
    }
}

fn success_rate(successes: i64, total: i64) -> f64 {
    if total == 0 {
        0.0
    } else {
        successes as f64 / total as f64 * 100.0
    }
}

/// Execution counts grouped by status.
pub fn status_breakdown<'a, I>(executions: I) -> BTreeMap<String, i64>
where
    I: IntoIterator<Item = &'a ExecutionRecord>,
{
    let mut breakdown = BTreeMap::new();
    for execution in executions {
        *breakdown
            .entry(execution.status.as_str().to_string())
            .or_insert(0) += 1;
    }
    breakdown
}

/// Target counts grouped by check type.
pub fn type_breakdown(targets: &[Target]) -> BTreeMap<String, i64> {
    let mut breakdown = BTreeMap::new();
    for target in targets {
        *breakdown
            .entry(target.check_type.as_str().to_string())
            .or_insert(0) += 1;
    }
    breakdown
}

/// Labels stored under `metadata.labels` in a target's configuration.
pub fn extract_labels(config: &Value) -> BTreeMap<String, String> {
    config
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// A target together with its metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetWithMetrics {
    #[serde(flatten)]
    pub target: Target,
    #[serde(flatten)]
    pub metrics: TargetMetrics,
}

/// A target with metrics and its executions inside the window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetDetail {
    #[serde(flatten)]
    pub target: Target,
    #[serde(flatten)]
    pub metrics: TargetMetrics,
    pub executions: Vec<ExecutionRecord>,
}

/// Dashboard row for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetSummary {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub metrics: TargetMetrics,
    /// Latest executions regardless of the window.
    pub recent_executions: Vec<ExecutionRecord>,
    pub labels: BTreeMap<String, String>,
}

/// System-wide dashboard view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardSummary {
    #[serde(rename = "total_jobs")]
    pub total_targets: i64,
    #[serde(rename = "active_jobs")]
    pub active_targets: i64,
    pub overall_success_rate: f64,
    pub total_executions: i64,
    #[serde(rename = "job_summaries")]
    pub target_summaries: Vec<TargetSummary>,
    pub recent_activity: Vec<ExecutionRecord>,
    pub status_breakdown: BTreeMap<String, i64>,
    pub type_breakdown: BTreeMap<String, i64>,
}

/// Computes metrics on demand from the store.
#[derive(Clone)]
pub struct MetricsAggregator {
    store: Arc<Store>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Metrics for one target plus the executions they were computed from.
    pub fn target_metrics(
        &self,
        target: &Target,
        window: TimeWindow,
    ) -> Result<(TargetMetrics, Vec<ExecutionRecord>), DbError> {
        let executions = self
            .store
            .get_executions(target.id, window.from, window.to, None)?;
        let last_execution = self.store.get_last_execution_time(target.id)?;
        Ok((compute_target_metrics(&executions, last_execution), executions))
    }

    /// Every target with its metrics.
    pub fn list_targets(&self, window: TimeWindow) -> Result<Vec<TargetWithMetrics>, DbError> {
        self.store
            .get_targets()?
            .into_iter()
            .map(|target| {
                let (metrics, _) = self.target_metrics(&target, window)?;
                Ok(TargetWithMetrics { target, metrics })
            })
            .collect()
    }

    /// One target with metrics and up to `limit` executions from the window.
    pub fn target_detail(
        &self,
        target_id: i64,
        window: TimeWindow,
        limit: Option<usize>,
    ) -> Result<TargetDetail, DbError> {
        let target = self.store.get_target(target_id)?;
        let (metrics, mut executions) = self.target_metrics(&target, window)?;
        if let Some(limit) = limit.filter(|l| *l > 0) {
            executions.truncate(limit);
        }
        Ok(TargetDetail {
            target,
            metrics,
            executions,
        })
    }

    /// The full dashboard summary for a window.
    pub fn summary(&self, window: TimeWindow) -> Result<DashboardSummary, DbError> {
        let targets = self.store.get_targets()?;

        let mut target_summaries = Vec::with_capacity(targets.len());
        let mut window_executions = Vec::new();
        for target in &targets {
            let (metrics, executions) = self.target_metrics(target, window)?;
            let recent_executions = self
                .store
                .get_latest_executions(Some(target.id), TARGET_RECENT_LIMIT)?;

            target_summaries.push(TargetSummary {
                id: target.id,
                name: target.name.clone(),
                check_type: target.check_type.as_str().to_string(),
                enabled: target.enabled,
                metrics,
                recent_executions,
                labels: extract_labels(&target.config),
            });
            window_executions.extend(executions);
        }

        let total_executions = window_executions.len() as i64;
        let successes = window_executions.iter().filter(|e| e.is_success()).count() as i64;

        Ok(DashboardSummary {
            total_targets: targets.len() as i64,
            active_targets: targets.iter().filter(|t| t.enabled).count() as i64,
            overall_success_rate: success_rate(successes, total_executions),
            total_executions,
            target_summaries,
            recent_activity: self.store.get_latest_executions(None, RECENT_ACTIVITY_LIMIT)?,
            status_breakdown: status_breakdown(&window_executions),
            type_breakdown: type_breakdown(&targets),
        })
    }
}
