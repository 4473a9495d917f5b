//! TCP reachability check.

use std::time::{Duration, Instant};
use tokio::net::TcpStream;

use super::{timed_out_message, ParamMap, ProbeError, ProbeResult, ResultBuilder};

pub const DEFAULT_TCP_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters of a TCP reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpParams {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
}

impl TcpParams {
    pub fn parse(params: &ParamMap<'_>) -> Result<Self, ProbeError> {
        Ok(Self {
            host: params.required_str("host")?,
            port: params.required_port("port")?,
            timeout: params.timeout_secs("timeout", DEFAULT_TCP_TIMEOUT)?,
        })
    }
}

/// Open a TCP connection to `host:port` and close it again.
pub async fn run_tcp_check(params: &TcpParams) -> ProbeResult {
    let mut result = ResultBuilder::start();
    result
        .meta("host", params.host.as_str())
        .meta("port", params.port);

    let start = Instant::now();
    let connect = TcpStream::connect((params.host.as_str(), params.port));
    let outcome = tokio::time::timeout(params.timeout, connect).await;
    let elapsed = start.elapsed();

    match outcome {
        Err(_) => result.failure(
            elapsed,
            format!("TCP connection failed: {}", timed_out_message(params.timeout)),
        ),
        Ok(Err(e)) => result.failure(elapsed, format!("TCP connection failed: {}", e)),
        Ok(Ok(stream)) => {
            if let Ok(addr) = stream.local_addr() {
                result.meta("local_addr", addr.to_string());
            }
            if let Ok(addr) = stream.peer_addr() {
                result.meta("remote_addr", addr.to_string());
            }
            result.success(elapsed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ProbeStatus;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[test]
    fn test_parse_requires_port() {
        let value = json!({"host": "example.com"});
        let params = ParamMap::from_value(&value).unwrap();
        assert_eq!(
            TcpParams::parse(&params).unwrap_err(),
            ProbeError::MissingParam("port")
        );
    }

    #[tokio::test]
    async fn test_tcp_check_success() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let params = TcpParams {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
        };
        let result = run_tcp_check(&params).await;
        assert_eq!(result.status(), ProbeStatus::Success);
        assert!(result.error().is_none());
        assert!(result.metadata().contains_key("remote_addr"));
        assert_eq!(result.metadata()["port"], json!(port));
    }

    #[tokio::test]
    async fn test_tcp_check_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = TcpParams {
            host: "127.0.0.1".to_string(),
            port,
            timeout: Duration::from_secs(2),
        };
        let result = run_tcp_check(&params).await;
        assert_eq!(result.status(), ProbeStatus::Error);
        assert!(result.error().unwrap().starts_with("TCP connection failed"));
        assert_eq!(result.metadata()["host"], "127.0.0.1");
    }
}
