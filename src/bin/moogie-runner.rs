//! Moogie runner: run one check described by the environment and report it.
//!
//! Exit codes: 0 when the result was delivered (whatever its status), 1 when
//! it could not be delivered, 2 on a configuration error.

use moogie::config::RunnerConfig;
use moogie::probe::run_check;
use moogie::report::Reporter;

use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const EXIT_TRANSPORT: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("moogie=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();

    let cfg = match RunnerConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("Configuration error: {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let reporter = match Reporter::new(&cfg.api_url) {
        Ok(reporter) => reporter,
        Err(e) => {
            tracing::error!("Failed to set up reporter: {}", e);
            return ExitCode::from(EXIT_TRANSPORT);
        }
    };

    tracing::info!(
        job = %cfg.job_name,
        check = %cfg.check.check_type(),
        "Running check"
    );
    let result = run_check(&cfg.check).await;

    if let Err(e) = reporter.report(&cfg.job_name, &result).await {
        tracing::error!("Failed to report execution result: {}", e);
        return ExitCode::from(EXIT_TRANSPORT);
    }

    match result.error() {
        Some(error) => tracing::info!(
            status = result.status().as_str(),
            response_time_ms = result.response_time_ms(),
            "Check completed: {}",
            error
        ),
        None => tracing::info!(
            status = result.status().as_str(),
            response_time_ms = result.response_time_ms(),
            "Check completed"
        ),
    }

    ExitCode::SUCCESS
}
