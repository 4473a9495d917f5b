//! HTTP response check.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::time::{Duration, Instant};

use super::{timed_out_message, ParamMap, ProbeError, ProbeResult, ResultBuilder};

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EXPECTED_STATUS: u16 = 200;

/// Parameters of an HTTP check.
#[derive(Debug, Clone)]
pub struct HttpParams {
    pub url: String,
    pub method: Method,
    pub timeout: Duration,
    pub expected_status: StatusCode,
    pub headers: HeaderMap,
    pub body: Option<String>,
}

impl HttpParams {
    pub fn parse(params: &ParamMap<'_>) -> Result<Self, ProbeError> {
        let raw_url = params.required_str("url")?;
        let url = if raw_url.starts_with("http://") || raw_url.starts_with("https://") {
            raw_url
        } else {
            format!("http://{}", raw_url)
        };
        if reqwest::Url::parse(&url).is_err() {
            return Err(invalid("url", format!("{:?} is not a valid URL", url)));
        }

        let method = match params.optional_str("method")? {
            None => Method::GET,
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map_err(|_| invalid("method", format!("{:?} is not an HTTP method", m)))?,
        };

        let expected_status = match params.optional_u64("expected_status")? {
            None => StatusCode::from_u16(DEFAULT_EXPECTED_STATUS).unwrap_or(StatusCode::OK),
            Some(code) => u16::try_from(code)
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| invalid("expected_status", format!("{} is not a status code", code)))?,
        };

        let mut headers = HeaderMap::new();
        for (name, value) in params.header_pairs("headers")? {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| invalid("headers", format!("bad header name {:?}", name)))?;
            let header_value = HeaderValue::from_str(&value)
                .map_err(|_| invalid("headers", format!("bad value for header {}", name)))?;
            headers.insert(header_name, header_value);
        }

        Ok(Self {
            url,
            method,
            timeout: params.timeout_secs("timeout", DEFAULT_HTTP_TIMEOUT)?,
            expected_status,
            headers,
            body: params.optional_str("body")?,
        })
    }
}

fn invalid(name: &'static str, reason: String) -> ProbeError {
    ProbeError::InvalidParam { name, reason }
}

/// Send one request and compare the response status with the expected one.
pub async fn run_http_check(params: &HttpParams) -> ProbeResult {
    let mut result = ResultBuilder::start();
    result
        .meta("url", params.url.as_str())
        .meta("method", params.method.as_str());

    let client = match reqwest::Client::builder().timeout(params.timeout).build() {
        Ok(client) => client,
        Err(e) => return result.failure(Duration::ZERO, format!("HTTP client setup failed: {}", e)),
    };

    let mut request = client
        .request(params.method.clone(), &params.url)
        .headers(params.headers.clone());
    if let Some(body) = &params.body {
        request = request.body(body.clone());
    }

    let start = Instant::now();
    let outcome = tokio::time::timeout(params.timeout, request.send()).await;
    let elapsed = start.elapsed();

    let response = match outcome {
        Err(_) => {
            return result.failure(
                elapsed,
                format!("HTTP request failed: {}", timed_out_message(params.timeout)),
            )
        }
        Ok(Err(e)) if e.is_timeout() => {
            return result.failure(
                elapsed,
                format!("HTTP request failed: {}", timed_out_message(params.timeout)),
            )
        }
        Ok(Err(e)) => return result.failure(elapsed, format!("HTTP request failed: {}", e)),
        Ok(Ok(response)) => response,
    };

    let status = response.status();
    result.meta("status_code", status.as_u16());

    if status != params.expected_status {
        return result.failure(
            elapsed,
            format!(
                "Expected status {}, got {}",
                params.expected_status.as_u16(),
                status.as_u16()
            ),
        );
    }

    result.success(elapsed)
}
