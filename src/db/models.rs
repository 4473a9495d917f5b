//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::probe::{CheckType, ProbeStatus};

/// A monitoring target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub check_type: CheckType,
    /// Check-specific parameters, opaque to everything but the probe engine.
    pub config: Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Target {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            check_type: CheckType::Http,
            config: Value::Object(Map::new()),
            enabled: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// An execution to be persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExecution {
    pub target_id: i64,
    pub status: ProbeStatus,
    pub response_time: i64,
    pub error: Option<String>,
    pub details: Map<String, Value>,
    /// Defaults to the insertion time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// A persisted probe outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: i64,
    #[serde(rename = "job_id")]
    pub target_id: i64,
    /// Only populated when read back together with its target.
    #[serde(rename = "job_name", default, skip_serializing_if = "Option::is_none")]
    pub target_name: Option<String>,
    pub status: ProbeStatus,
    /// Milliseconds.
    pub response_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub details: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }
}
