//! Configuration module for Moogie.
//!
//! Both binaries read their configuration from environment variables. The
//! parsers take the variables as an iterator so they can be tested without
//! touching the process environment.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::hub::{HubConfig, DEFAULT_BROADCAST_QUEUE, DEFAULT_VIEWER_QUEUE};
use crate::probe::{Check, CheckType, ProbeError};

pub const DEFAULT_API_URL: &str = "http://moogie-api:8080";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "moogie.db")
    pub db_path: String,
    /// Origins allowed by CORS (default: "http://localhost:3000")
    pub allowed_origins: Vec<String>,
    /// Outbound queue capacity per viewer
    pub viewer_queue: usize,
    /// Capacity of the hub's broadcast ingress
    pub broadcast_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "moogie.db".to_string(),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            viewer_queue: DEFAULT_VIEWER_QUEUE,
            broadcast_queue: DEFAULT_BROADCAST_QUEUE,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `MOOGIE_HTTP_PORT`: HTTP port (default: 8080)
    /// - `MOOGIE_DB_PATH`: Database file path (default: "moogie.db")
    /// - `MOOGIE_ALLOWED_ORIGINS`: comma separated CORS origins
    /// - `MOOGIE_VIEWER_QUEUE`: per-viewer outbound queue (default: 256)
    /// - `MOOGIE_BROADCAST_QUEUE`: hub ingress queue (default: 256)
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();
        let mut cfg = Self::default();

        if let Some(port) = parse_var::<u16>(&vars, "MOOGIE_HTTP_PORT")? {
            if port == 0 {
                return Err(invalid("MOOGIE_HTTP_PORT", "port must not be 0"));
            }
            cfg.http_port = port;
        }

        if let Some(db_path) = non_empty(&vars, "MOOGIE_DB_PATH") {
            cfg.db_path = db_path.to_string();
        }

        if let Some(origins) = non_empty(&vars, "MOOGIE_ALLOWED_ORIGINS") {
            cfg.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(n) = parse_var::<usize>(&vars, "MOOGIE_VIEWER_QUEUE")? {
            if n == 0 {
                return Err(invalid("MOOGIE_VIEWER_QUEUE", "capacity must be positive"));
            }
            cfg.viewer_queue = n;
        }

        if let Some(n) = parse_var::<usize>(&vars, "MOOGIE_BROADCAST_QUEUE")? {
            if n == 0 {
                return Err(invalid("MOOGIE_BROADCAST_QUEUE", "capacity must be positive"));
            }
            cfg.broadcast_queue = n;
        }

        Ok(cfg)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            viewer_queue: self.viewer_queue,
            broadcast_queue: self.broadcast_queue,
        }
    }
}

/// Runner configuration: one check, the job it reports for, and where to report.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub job_name: String,
    pub api_url: String,
    pub check: Check,
}

impl RunnerConfig {
    /// Load configuration from environment variables.
    ///
    /// `CHECK_TYPE` and `JOB_NAME` are required, `MOOGIE_API_URL` defaults to
    /// `http://moogie-api:8080`. Check parameters come from variables prefixed
    /// with the check type, e.g. `HTTP_URL` or `SSL_DAYS_WARNING`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let check_type: CheckType = non_empty(&vars, "CHECK_TYPE")
            .ok_or(ConfigError::Missing("CHECK_TYPE"))?
            .parse()?;
        let job_name = non_empty(&vars, "JOB_NAME")
            .ok_or(ConfigError::Missing("JOB_NAME"))?
            .to_string();
        let api_url = non_empty(&vars, "MOOGIE_API_URL")
            .unwrap_or(DEFAULT_API_URL)
            .to_string();
        if reqwest::Url::parse(&api_url).is_err() {
            return Err(invalid("MOOGIE_API_URL", "not a valid URL"));
        }

        let check = Check::from_env_vars(check_type, vars)?;

        Ok(Self {
            job_name,
            api_url,
            check,
        })
    }
}

fn non_empty<'a>(vars: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_var<T>(vars: &HashMap<String, String>, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    non_empty(vars, name)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(name, format!("{:?}: {}", raw, e))))
        .transpose()
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.into(),
    }
}
