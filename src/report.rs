//! Delivers probe results to the intake endpoint.

use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

use crate::ingest::CreateExecutionRequest;
use crate::probe::ProbeResult;

pub const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to reach {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("intake rejected execution with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("failed to build reporter: {0}")]
    Client(#[source] reqwest::Error),
}

/// HTTP client for `POST {base}/api/v1/executions`.
pub struct Reporter {
    client: reqwest::Client,
    endpoint: String,
}

impl Reporter {
    pub fn new(base_url: &str) -> Result<Self, ReportError> {
        let client = reqwest::Client::builder()
            .timeout(REPORT_TIMEOUT)
            .build()
            .map_err(ReportError::Client)?;
        Ok(Self {
            client,
            endpoint: format!("{}/api/v1/executions", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Report one probe result for `job_name`.
    pub async fn report(&self, job_name: &str, result: &ProbeResult) -> Result<(), ReportError> {
        let payload = CreateExecutionRequest::from_probe(job_name, result);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|source| ReportError::Transport {
                url: self.endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReportError::Rejected { status, body });
        }

        tracing::debug!(job = job_name, %status, "Execution reported");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ResultBuilder;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_endpoint_joins_base() {
        let reporter = Reporter::new("http://moogie-api:8080/").unwrap();
        assert_eq!(reporter.endpoint(), "http://moogie-api:8080/api/v1/executions");
    }

    #[tokio::test]
    async fn test_report_posts_payload() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let captured = seen.clone();
        let app = Router::new().route(
            "/api/v1/executions",
            post(move |Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().unwrap() = Some(body);
                    (AxumStatus::CREATED, Json(json!({"id": 1})))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let mut builder = ResultBuilder::start();
        builder.meta("status_code", 200);
        let result = builder.success(Duration::from_millis(31));

        let reporter = Reporter::new(&format!("http://{}", addr)).unwrap();
        tokio_test::assert_ok!(reporter.report("api-health", &result).await);

        let body = seen.lock().unwrap().take().unwrap();
        assert_eq!(body["job_name"], "api-health");
        assert_eq!(body["status"], "success");
        assert_eq!(body["response_time"], 31);
        assert_eq!(body["details"]["status_code"], 200);
        assert!(body.get("error").is_none());
    }

    #[tokio::test]
    async fn test_report_rejected() {
        let app = Router::new().route(
            "/api/v1/executions",
            post(|| async { (AxumStatus::NOT_FOUND, Json(json!({"error": "Job not found"}))) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let result = ResultBuilder::start().success(Duration::ZERO);
        let reporter = Reporter::new(&format!("http://{}", addr)).unwrap();
        match reporter.report("missing", &result).await {
            Err(ReportError::Rejected { status, body }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert!(body.contains("Job not found"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_report_transport_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = ResultBuilder::start().success(Duration::ZERO);
        let reporter = Reporter::new(&format!("http://{}", addr)).unwrap();
        assert!(matches!(
            reporter.report("x", &result).await,
            Err(ReportError::Transport { .. })
        ));
    }
}
