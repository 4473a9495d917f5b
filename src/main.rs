//! Moogie API server.
//!
//! Accepts execution reports, serves dashboard metrics and streams new
//! executions to live viewers.

use moogie::config::ServerConfig;
use moogie::db::{self, Store};
use moogie::hub::Hub;
use moogie::probe::CheckType;
use moogie::web::Server;

use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("moogie=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting Moogie on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    // Add sample target if none exist
    let targets = store.get_targets()?;
    if targets.is_empty() {
        tracing::info!("Adding sample target: example-http");
        let mut target = db::Target {
            name: "example-http".to_string(),
            check_type: CheckType::Http,
            config: json!({
                "url": "https://example.com",
                "expected_status": 200,
                "metadata": {"labels": {"env": "sample"}}
            }),
            ..Default::default()
        };
        store.add_target(&mut target)?;
    }

    // Start broadcast hub
    let hub = Hub::spawn(cfg.hub_config());

    // Start web server
    let server = Server::new(cfg, store, hub);
    server.start().await?;

    Ok(())
}
