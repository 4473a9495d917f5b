//! Execution intake: validate, persist, broadcast.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::db::{DbError, ExecutionRecord, NewExecution, Store};
use crate::hub::{Envelope, Hub};
use crate::probe::{ProbeResult, ProbeStatus};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed execution: {0}")]
    Malformed(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("storage failure: {0}")]
    Storage(#[source] DbError),
}

/// Body of `POST /api/v1/executions`, also what the runner sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateExecutionRequest {
    pub job_name: String,
    pub status: ProbeStatus,
    #[serde(default)]
    pub response_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl CreateExecutionRequest {
    /// Build a report for a finished probe.
    pub fn from_probe(job_name: &str, result: &ProbeResult) -> Self {
        let details = (!result.metadata().is_empty())
            .then(|| Value::Object(result.metadata().clone()));
        Self {
            job_name: job_name.to_string(),
            status: result.status(),
            response_time: i64::try_from(result.response_time_ms()).unwrap_or(i64::MAX),
            error: result.error().map(str::to_string),
            details,
            timestamp: Some(result.timestamp()),
        }
    }

    /// Check the request and split it into the target name and the execution
    /// to store. The error message falls back to `details.error`.
    fn validate(self) -> Result<(String, NewExecution), IngestError> {
        let name = self.job_name.trim();
        if name.is_empty() {
            return Err(IngestError::Malformed("job_name is required".to_string()));
        }
        if self.response_time < 0 {
            return Err(IngestError::Malformed(format!(
                "response_time must not be negative, got {}",
                self.response_time
            )));
        }

        let details = match self.details {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(_) => {
                return Err(IngestError::Malformed(
                    "details must be a JSON object".to_string(),
                ))
            }
        };

        let explicit_error = self
            .error
            .as_deref()
            .is_some_and(|e| !e.trim().is_empty());
        let message = self
            .error
            .filter(|e| !e.trim().is_empty())
            .or_else(|| {
                details
                    .get("error")
                    .and_then(Value::as_str)
                    .filter(|e| !e.trim().is_empty())
                    .map(str::to_string)
            });

        let error = match (self.status, message) {
            (ProbeStatus::Error, None) => {
                return Err(IngestError::Malformed(
                    "an error execution needs an error message".to_string(),
                ))
            }
            (ProbeStatus::Error, Some(message)) => Some(message),
            (ProbeStatus::Success, _) if explicit_error => {
                return Err(IngestError::Malformed(
                    "a successful execution cannot carry an error".to_string(),
                ))
            }
            (ProbeStatus::Success, _) => None,
        };

        Ok((
            name.to_string(),
            NewExecution {
                target_id: 0,
                status: self.status,
                response_time: self.response_time,
                error,
                details,
                timestamp: self.timestamp,
            },
        ))
    }
}

/// Accepts reported executions and fans them out to viewers.
#[derive(Clone)]
pub struct IntakeService {
    store: Arc<Store>,
    hub: Hub,
}

impl IntakeService {
    pub fn new(store: Arc<Store>, hub: Hub) -> Self {
        Self { store, hub }
    }

    /// Store one execution against the named target and broadcast it.
    ///
    /// Nothing is stored or broadcast unless the request is valid and the
    /// target exists.
    pub fn ingest(&self, request: CreateExecutionRequest) -> Result<ExecutionRecord, IngestError> {
        let (name, mut execution) = request.validate()?;

        let target = self.store.get_target_by_name(&name).map_err(|e| match e {
            DbError::NotFound => IngestError::NotFound(name.clone()),
            other => IngestError::Storage(other),
        })?;
        execution.target_id = target.id;

        let record = self.store.add_execution(&execution).map_err(|e| {
            tracing::error!(job = %name, "Failed to store execution: {}", e);
            IngestError::Storage(e)
        })?;

        tracing::debug!(
            job = %name,
            status = record.status.as_str(),
            response_time = record.response_time,
            "Execution recorded"
        );
        self.hub.broadcast(&Envelope::ExecutionCreated(record.clone()));

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use crate::hub::HubConfig;
    use crate::probe::{CheckType, ResultBuilder};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn setup() -> (Arc<Store>, Hub, IntakeService) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut target = Target {
            name: "api-health".to_string(),
            check_type: CheckType::Http,
            config: json!({"url": "http://localhost"}),
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let hub = Hub::spawn(HubConfig::default());
        let intake = IntakeService::new(store.clone(), hub.clone());
        (store, hub, intake)
    }

    fn request(value: Value) -> CreateExecutionRequest {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_ingest_persists_and_broadcasts() {
        let (store, hub, intake) = setup();
        let mut viewer = hub.register().await.unwrap();

        let record = intake
            .ingest(request(json!({
                "job_name": "api-health",
                "status": "success",
                "response_time": 42,
                "details": {"status_code": 200}
            })))
            .unwrap();

        assert_eq!(record.target_name.as_deref(), Some("api-health"));
        assert_eq!(record.response_time, 42);
        assert_eq!(store.count_executions().unwrap(), 1);

        let payload = viewer.receiver.recv().await.unwrap();
        let envelope: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(envelope["type"], "execution_created");
        assert_eq!(envelope["data"]["id"], record.id);
        assert_eq!(envelope["data"]["details"]["status_code"], 200);
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_stored_or_broadcast() {
        let (store, hub, intake) = setup();
        let mut viewer = hub.register().await.unwrap();

        let err = intake
            .ingest(request(json!({
                "job_name": "nope",
                "status": "success",
                "response_time": 1
            })))
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound(ref name) if name == "nope"));
        assert_eq!(store.count_executions().unwrap(), 0);

        // Round trip through the hub so any broadcast would already be queued.
        hub.connection_count().await.unwrap();
        assert_eq!(viewer.receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn test_failure_alias_and_details_error() {
        let (_, _, intake) = setup();
        let record = intake
            .ingest(request(json!({
                "job_name": "api-health",
                "status": "failure",
                "response_time": 7,
                "details": {"error": "connection refused"}
            })))
            .unwrap();
        assert_eq!(record.status, ProbeStatus::Error);
        assert_eq!(record.error.as_deref(), Some("connection refused"));
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let (store, _, intake) = setup();
        let cases = [
            json!({"job_name": " ", "status": "success"}),
            json!({"job_name": "api-health", "status": "success", "response_time": -1}),
            json!({"job_name": "api-health", "status": "error", "response_time": 1}),
            json!({"job_name": "api-health", "status": "success", "error": "boom"}),
            json!({"job_name": "api-health", "status": "success", "details": [1, 2]}),
        ];
        for case in cases {
            let err = intake.ingest(request(case.clone())).unwrap_err();
            assert!(matches!(err, IngestError::Malformed(_)), "{}", case);
        }
        assert_eq!(store.count_executions().unwrap(), 0);
    }

    #[test]
    fn test_from_probe_carries_result() {
        let mut builder = ResultBuilder::start();
        builder.meta("host", "db.internal");
        let result = builder.failure(Duration::from_millis(15), "TCP connection failed: refused");

        let req = CreateExecutionRequest::from_probe("db", &result);
        assert_eq!(req.job_name, "db");
        assert_eq!(req.status, ProbeStatus::Error);
        assert_eq!(req.response_time, 15);
        assert_eq!(req.error.as_deref(), Some("TCP connection failed: refused"));
        assert_eq!(req.details.unwrap()["host"], "db.internal");
        assert_eq!(req.timestamp, Some(result.timestamp()));
    }
}
