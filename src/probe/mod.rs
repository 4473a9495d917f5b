//! Probe engine for synthetic checks.
//!
//! Supports TCP, DNS, TLS certificate and HTTP checks. Every check runs
//! exactly once per call and always yields a [`ProbeResult`]; network
//! failures are `error` results, never Rust errors. Only bad parameters
//! surface as [`ProbeError`].

mod dns;
mod http;
mod params;
mod tcp;
mod tls;

pub use dns::*;
pub use http::*;
pub use params::*;
pub use tcp::*;
pub use tls::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Probe configuration errors.
///
/// These abort a probe before it starts and are never reported as results.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("missing required parameter `{0}`")]
    MissingParam(&'static str),
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParam { name: &'static str, reason: String },
    #[error("unknown check type: {0}")]
    UnknownCheckType(String),
}

/// The kind of synthetic check a target runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// Network reachability.
    Tcp,
    /// Name resolution.
    Dns,
    /// Certificate validity.
    Ssl,
    /// HTTP response.
    Http,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Tcp => "tcp",
            CheckType::Dns => "dns",
            CheckType::Ssl => "ssl",
            CheckType::Http => "http",
        }
    }

    /// Environment variable prefix used by the runner for this check's parameters.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            CheckType::Tcp => "TCP_",
            CheckType::Dns => "DNS_",
            CheckType::Ssl => "SSL_",
            CheckType::Http => "HTTP_",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" | "network-reachability" => Ok(CheckType::Tcp),
            "dns" | "name-resolution" => Ok(CheckType::Dns),
            "ssl" | "tls" | "certificate" => Ok(CheckType::Ssl),
            "http" | "https" | "http-response" => Ok(CheckType::Http),
            _ => Err(ProbeError::UnknownCheckType(s.to_string())),
        }
    }
}

/// Outcome status of one probe execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Success,
    #[serde(alias = "failure")]
    Error,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "success",
            ProbeStatus::Error => "error",
        }
    }
}

impl FromStr for ProbeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ProbeStatus::Success),
            "error" | "failure" => Ok(ProbeStatus::Error),
            other => Err(format!("unknown status: {}", other)),
        }
    }
}

/// Normalized result of a single probe execution.
///
/// Only constructible through [`ResultBuilder`], which guarantees that an
/// `error` status always carries a message and a `success` never does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeResult {
    status: ProbeStatus,
    #[serde(rename = "response_time")]
    response_time_ms: u64,
    timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
}

impl ProbeResult {
    pub fn status(&self) -> ProbeStatus {
        self.status
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }

    /// Elapsed wall-clock time of the attempted operation, in milliseconds.
    pub fn response_time_ms(&self) -> u64 {
        self.response_time_ms
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn metadata(&self) -> &Map<String, Value> {
        &self.metadata
    }
}

/// Accumulates metadata while a check runs and seals it into a [`ProbeResult`].
#[derive(Debug)]
pub struct ResultBuilder {
    timestamp: DateTime<Utc>,
    metadata: Map<String, Value>,
}

impl ResultBuilder {
    /// Start a result stamped with the current UTC time.
    pub fn start() -> Self {
        Self {
            timestamp: Utc::now(),
            metadata: Map::new(),
        }
    }

    pub fn meta(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn success(self, elapsed: Duration) -> ProbeResult {
        self.seal(ProbeStatus::Success, elapsed, None)
    }

    pub fn failure(self, elapsed: Duration, message: impl Into<String>) -> ProbeResult {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "check failed".to_string();
        }
        self.seal(ProbeStatus::Error, elapsed, Some(message))
    }

    fn seal(self, status: ProbeStatus, elapsed: Duration, error: Option<String>) -> ProbeResult {
        ProbeResult {
            status,
            response_time_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
            timestamp: self.timestamp,
            error,
            metadata: self.metadata,
        }
    }
}

/// A fully validated check, ready to run.
#[derive(Debug, Clone)]
pub enum Check {
    Tcp(TcpParams),
    Dns(DnsParams),
    Ssl(TlsParams),
    Http(HttpParams),
}

impl Check {
    /// Validate opaque target parameters for the given check type.
    pub fn from_params(check_type: CheckType, params: &Value) -> Result<Self, ProbeError> {
        let params = ParamMap::from_value(params)?;
        Ok(match check_type {
            CheckType::Tcp => Check::Tcp(TcpParams::parse(&params)?),
            CheckType::Dns => Check::Dns(DnsParams::parse(&params)?),
            CheckType::Ssl => Check::Ssl(TlsParams::parse(&params)?),
            CheckType::Http => Check::Http(HttpParams::parse(&params)?),
        })
    }

    /// Validate parameters taken from prefixed environment-style variables,
    /// e.g. `TCP_HOST` and `TCP_PORT` for a TCP check.
    pub fn from_env_vars<I>(check_type: CheckType, vars: I) -> Result<Self, ProbeError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let prefix = check_type.env_prefix();
        let params: Map<String, Value> = vars
            .into_iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix)
                    .map(|name| (name.to_ascii_lowercase(), Value::String(value)))
            })
            .collect();
        Check::from_params(check_type, &Value::Object(params))
    }

    pub fn check_type(&self) -> CheckType {
        match self {
            Check::Tcp(_) => CheckType::Tcp,
            Check::Dns(_) => CheckType::Dns,
            Check::Ssl(_) => CheckType::Ssl,
            Check::Http(_) => CheckType::Http,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            Check::Tcp(p) => p.timeout,
            Check::Dns(p) => p.timeout,
            Check::Ssl(p) => p.timeout,
            Check::Http(p) => p.timeout,
        }
    }
}

/// Run a single check.
pub async fn run_check(check: &Check) -> ProbeResult {
    let result = match check {
        Check::Tcp(p) => run_tcp_check(p).await,
        Check::Dns(p) => run_dns_check(p).await,
        Check::Ssl(p) => run_tls_check(p).await,
        Check::Http(p) => run_http_check(p).await,
    };

    tracing::debug!(
        check = %check.check_type(),
        status = result.status().as_str(),
        elapsed_ms = result.response_time_ms(),
        "probe finished"
    );

    result
}

/// Validate parameters and run the check in one step.
pub async fn run_probe(check_type: CheckType, params: &Value) -> Result<ProbeResult, ProbeError> {
    let check = Check::from_params(check_type, params)?;
    Ok(run_check(&check).await)
}

fn timed_out_message(timeout: Duration) -> String {
    format!("timed out after {:?}", timeout)
}
