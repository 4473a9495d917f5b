//! TLS certificate check.
//!
//! The handshake verifies the chain and host name as usual. A certificate
//! outside its validity period is verified again at a moment inside that
//! period, so expired and not-yet-valid certificates that are otherwise
//! trusted can be inspected and reported precisely.

use chrono::{DateTime, SecondsFormat, Utc};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{timed_out_message, ParamMap, ProbeError, ProbeResult, ResultBuilder};

pub const DEFAULT_TLS_PORT: u16 = 443;
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_DAYS_WARNING: i64 = 30;

/// Parameters of a certificate check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsParams {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    /// Fail when the certificate expires within this many days.
    pub days_warning: i64,
}

impl TlsParams {
    pub fn parse(params: &ParamMap<'_>) -> Result<Self, ProbeError> {
        let host = params.required_str("host")?;
        if ServerName::try_from(host.as_str()).is_err() {
            return Err(ProbeError::InvalidParam {
                name: "host",
                reason: format!("{:?} is not a valid server name", host),
            });
        }

        let days_warning = match params.optional_u64("days_warning")? {
            None => DEFAULT_DAYS_WARNING,
            Some(d) => i64::try_from(d).map_err(|_| ProbeError::InvalidParam {
                name: "days_warning",
                reason: "value too large".to_string(),
            })?,
        };

        Ok(Self {
            host,
            port: params.optional_port("port")?.unwrap_or(DEFAULT_TLS_PORT),
            timeout: params.timeout_secs("timeout", DEFAULT_TLS_TIMEOUT)?,
            days_warning,
        })
    }
}

/// Fields extracted from the leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub issuer: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial_number: String,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| format!("failed to parse certificate: {}", e))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| "certificate notBefore out of range".to_string())?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| "certificate notAfter out of range".to_string())?;

        Ok(Self {
            issuer: cert.issuer().to_string(),
            subject: cert.subject().to_string(),
            not_before,
            not_after,
            serial_number: cert.tbs_certificate.serial.to_string(),
        })
    }

    /// Whole days until expiry, truncated toward zero.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_hours() / 24
    }
}

/// Judge a certificate at `now`. Returns the failure message, if any.
pub fn assess_certificate(info: &CertificateInfo, now: DateTime<Utc>, days_warning: i64) -> Option<String> {
    if now > info.not_after {
        return Some(format!(
            "Certificate expired on {}",
            info.not_after.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }

    if now < info.not_before {
        return Some(format!(
            "Certificate not valid until {}",
            info.not_before.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
    }

    let days = info.days_until_expiry(now);
    if days <= days_warning {
        return Some(format!(
            "Certificate expires in {} days (warning threshold: {} days)",
            days, days_warning
        ));
    }

    None
}

/// Connect, complete a TLS handshake and inspect the leaf certificate.
pub async fn run_tls_check(params: &TlsParams) -> ProbeResult {
    check_with(params, tls_connector()).await
}

async fn check_with(params: &TlsParams, connector: Result<TlsConnector, String>) -> ProbeResult {
    let mut result = ResultBuilder::start();
    result
        .meta("host", params.host.as_str())
        .meta("port", params.port);

    let connector = match connector {
        Ok(c) => c,
        Err(e) => return result.failure(Duration::ZERO, format!("TLS setup failed: {}", e)),
    };
    let server_name = match ServerName::try_from(params.host.clone()) {
        Ok(name) => name,
        Err(e) => return result.failure(Duration::ZERO, format!("TLS connection failed: {}", e)),
    };

    let start = Instant::now();
    let handshake = async {
        let tcp = TcpStream::connect((params.host.as_str(), params.port)).await?;
        connector.connect(server_name, tcp).await
    };
    let outcome = tokio::time::timeout(params.timeout, handshake).await;
    let elapsed = start.elapsed();

    let stream = match outcome {
        Err(_) => {
            return result.failure(
                elapsed,
                format!("TLS connection failed: {}", timed_out_message(params.timeout)),
            )
        }
        Ok(Err(e)) => return result.failure(elapsed, format!("TLS connection failed: {}", e)),
        Ok(Ok(stream)) => stream,
    };

    let (_, session) = stream.get_ref();
    let leaf = match session.peer_certificates().and_then(|certs| certs.first()) {
        Some(leaf) => leaf,
        None => return result.failure(elapsed, "No certificates found"),
    };

    let info = match CertificateInfo::from_der(leaf.as_ref()) {
        Ok(info) => info,
        Err(e) => return result.failure(elapsed, e),
    };

    let now = Utc::now();
    result
        .meta("issuer", info.issuer.as_str())
        .meta("subject", info.subject.as_str())
        .meta("not_before", info.not_before.to_rfc3339())
        .meta("not_after", info.not_after.to_rfc3339())
        .meta("days_until_expiry", info.days_until_expiry(now))
        .meta("serial_number", info.serial_number.as_str());

    match assess_certificate(&info, now, params.days_warning) {
        Some(message) => result.failure(elapsed, message),
        None => result.success(elapsed),
    }
}

fn tls_connector() -> Result<TlsConnector, String> {
    static CONFIG: OnceLock<Result<Arc<ClientConfig>, String>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            build_client_config(RootCertStore {
                roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
            })
        })
        .clone()
        .map(TlsConnector::from)
}

fn build_client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>, String> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| e.to_string())?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| e.to_string())?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(ValidityTolerantVerifier { inner }))
        .with_no_client_auth();

    Ok(Arc::new(config))
}

/// WebPKI verification that tolerates validity-period errors.
///
/// Chain and host name are still checked: on a validity error the leaf is
/// verified again at the midpoint of its own validity window.
#[derive(Debug)]
struct ValidityTolerantVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ValidityTolerantVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(e)) if is_validity_error(&e) => {
                let Some(at) = time_within_validity(end_entity) else {
                    return Err(rustls::Error::InvalidCertificate(e));
                };
                self.inner
                    .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, at)
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn time_within_validity(der: &[u8]) -> Option<UnixTime> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).ok()?;
    let from = cert.validity().not_before.timestamp();
    let to = cert.validity().not_after.timestamp();
    let mid = u64::try_from(from + (to - from) / 2).ok()?;
    Some(UnixTime::since_unix_epoch(Duration::from_secs(mid)))
}

fn is_validity_error(e: &CertificateError) -> bool {
    matches!(
        e,
        CertificateError::Expired
            | CertificateError::ExpiredContext { .. }
            | CertificateError::NotValidYet
            | CertificateError::NotValidYetContext { .. }
    )
}
