//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::hub::{Hub, PumpTimings};
use crate::ingest::IntakeService;
use crate::metrics::MetricsAggregator;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub hub: Hub,
    pub aggregator: MetricsAggregator,
    pub intake: IntakeService,
    pub pump_timings: PumpTimings,
}

/// Web server for Moogie.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, hub: Hub) -> Self {
        Self {
            state: AppState {
                aggregator: MetricsAggregator::new(store.clone()),
                intake: IntakeService::new(store, hub.clone()),
                pump_timings: PumpTimings::default(),
                config,
                hub,
            },
        }
    }

    fn cors(&self) -> CorsLayer {
        let origins = &self.state.config.allowed_origins;
        let allow_origin = if origins.iter().any(|o| o == "*") {
            AllowOrigin::from(Any)
        } else {
            let values: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|o| match HeaderValue::from_str(o) {
                    Ok(v) => Some(v),
                    Err(_) => {
                        tracing::warn!("Ignoring invalid CORS origin {:?}", o);
                        None
                    }
                })
                .collect();
            AllowOrigin::list(values)
        };

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::DELETE,
                Method::OPTIONS,
            ])
            .allow_headers([
                header::ORIGIN,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
            ])
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        Router::new()
            .route("/health", get(handlers::handle_health))
            .route("/ws", get(handlers::handle_ws))
            // API endpoints
            .route("/api/v1/executions", post(handlers::handle_create_execution))
            .route("/api/v1/jobs", get(handlers::handle_get_jobs))
            .route("/api/v1/jobs/{id}", get(handlers::handle_get_job))
            .route(
                "/api/v1/dashboard/summary",
                get(handlers::handle_dashboard_summary),
            )
            .layer(self.cors())
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port and run until Ctrl-C.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        self.state.hub.shutdown().await;
        tracing::info!("Web server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use crate::hub::HubConfig;
    use crate::probe::{CheckType, ResultBuilder};
    use crate::report::Reporter;
    use futures::StreamExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct TestServer {
        base: String,
        store: Arc<Store>,
        hub: Hub,
    }

    async fn spawn_server() -> TestServer {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut target = Target {
            name: "api-health".to_string(),
            check_type: CheckType::Http,
            config: json!({"url": "http://localhost/health", "metadata": {"labels": {"env": "test"}}}),
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();

        let hub = Hub::spawn(HubConfig::default());
        let server = Server::new(ServerConfig::default(), store.clone(), hub.clone());
        let router = server.routes();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", addr),
            store,
            hub,
        }
    }

    async fn wait_for_viewers(hub: &Hub, n: usize) {
        for _ in 0..100 {
            if hub.connection_count().await.unwrap() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("viewer count never reached {}", n);
    }

    #[tokio::test]
    async fn test_health() {
        let server = spawn_server().await;
        let body: Value = reqwest::get(format!("{}/health", server.base))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_reported_execution_reaches_viewer() {
        let server = spawn_server().await;
        let ws_url = format!("{}/ws", server.base.replacen("http", "ws", 1));
        let (mut viewer, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
        wait_for_viewers(&server.hub, 1).await;

        let mut builder = ResultBuilder::start();
        builder.meta("status_code", 200);
        let result = builder.success(Duration::from_millis(12));
        Reporter::new(&server.base)
            .unwrap()
            .report("api-health", &result)
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), viewer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let text = match frame {
            WsMessage::Text(text) => text.as_str().to_string(),
            other => panic!("unexpected frame {:?}", other),
        };
        let envelope: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(envelope["type"], "execution_created");
        assert_eq!(envelope["data"]["job_name"], "api-health");
        assert_eq!(envelope["data"]["response_time"], 12);
        assert_eq!(server.store.count_executions().unwrap(), 1);

        drop(viewer);
        wait_for_viewers(&server.hub, 0).await;
    }

    #[tokio::test]
    async fn test_create_execution_errors() {
        let server = spawn_server().await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/executions", server.base);

        let resp = client
            .post(&url)
            .json(&json!({"job_name": "ghost", "status": "success", "response_time": 1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Job not found");

        let resp = client
            .post(&url)
            .json(&json!({"job_name": "api-health", "status": "maybe"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .post(&url)
            .json(&json!({"job_name": "api-health", "status": "error", "response_time": 3}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        assert_eq!(server.store.count_executions().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_jobs_and_summary() {
        let server = spawn_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/api/v1/executions", server.base))
            .json(&json!({
                "job_name": "api-health",
                "status": "failure",
                "response_time": 80,
                "details": {"error": "Expected status 200, got 503"}
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CREATED);

        let jobs: Value = client
            .get(format!("{}/api/v1/jobs", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(jobs[0]["name"], "api-health");
        assert_eq!(jobs[0]["success_rate"], 0.0);
        assert_eq!(jobs[0]["execution_count"], 1);

        let job: Value = client
            .get(format!("{}/api/v1/jobs/{}?limit=5", server.base, jobs[0]["id"]))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(job["executions"][0]["error"], "Expected status 200, got 503");

        let summary: Value = client
            .get(format!("{}/api/v1/dashboard/summary", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(summary["total_jobs"], 1);
        assert_eq!(summary["total_executions"], 1);
        assert_eq!(summary["status_breakdown"]["error"], 1);
        assert_eq!(summary["job_summaries"][0]["labels"]["env"], "test");

        let resp = client
            .get(format!("{}/api/v1/jobs/999", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let resp = client
            .get(format!("{}/api/v1/jobs/abc", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);

        let resp = client
            .get(format!("{}/api/v1/dashboard/summary?from=yesterday&to=today", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}
