//! DNS resolution check.
//!
//! Uses the system resolver by default. When a resolver override is given
//! the check talks to that server directly with raw UDP packets.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

use super::{timed_out_message, ParamMap, ProbeError, ProbeResult, ResultBuilder};

pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(10);

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;

/// Parameters of a DNS resolution check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsParams {
    pub hostname: String,
    pub timeout: Duration,
    /// At least one of these must appear in the answer when non-empty.
    pub expected_ips: Vec<String>,
    /// Resolver to query instead of the system one, e.g. `8.8.8.8:53`.
    pub server: Option<String>,
}

impl DnsParams {
    pub fn parse(params: &ParamMap<'_>) -> Result<Self, ProbeError> {
        Ok(Self {
            hostname: params.required_str("hostname")?,
            timeout: params.timeout_secs("timeout", DEFAULT_DNS_TIMEOUT)?,
            expected_ips: params.string_list("expected_ips")?,
            server: params.optional_str("server")?,
        })
    }
}

/// Resolve the hostname and optionally check the answer against expected addresses.
pub async fn run_dns_check(params: &DnsParams) -> ProbeResult {
    let mut result = ResultBuilder::start();
    result.meta("hostname", params.hostname.as_str());
    if let Some(server) = &params.server {
        result.meta("server", server.as_str());
    }

    let start = Instant::now();
    let lookup = async {
        match &params.server {
            Some(server) => resolve_with_server(&params.hostname, server).await,
            None => resolve_with_system(&params.hostname).await,
        }
    };
    let outcome = tokio::time::timeout(params.timeout, lookup).await;
    let elapsed = start.elapsed();

    let ips = match outcome {
        Err(_) => {
            return result.failure(
                elapsed,
                format!("DNS lookup failed: {}", timed_out_message(params.timeout)),
            )
        }
        Ok(Err(e)) => return result.failure(elapsed, format!("DNS lookup failed: {}", e)),
        Ok(Ok(ips)) => ips,
    };

    if ips.is_empty() {
        return result.failure(elapsed, "No IP addresses resolved");
    }

    let resolved: Vec<String> = ips.iter().map(|ip| ip.to_string()).collect();
    result
        .meta("resolved_ips", resolved.clone())
        .meta("ip_count", resolved.len());

    if !params.expected_ips.is_empty() && !any_expected(&params.expected_ips, &ips) {
        return result.failure(
            elapsed,
            format!(
                "None of the expected IPs found. Expected: {:?}, Got: {:?}",
                params.expected_ips, resolved
            ),
        );
    }

    result.success(elapsed)
}

fn any_expected(expected: &[String], resolved: &[IpAddr]) -> bool {
    expected.iter().any(|want| match want.parse::<IpAddr>() {
        Ok(ip) => resolved.contains(&ip),
        Err(_) => resolved.iter().any(|got| got.to_string() == *want),
    })
}

async fn resolve_with_system(hostname: &str) -> Result<Vec<IpAddr>, String> {
    let addrs = tokio::net::lookup_host((hostname, 0))
        .await
        .map_err(|e| e.to_string())?;

    let mut ips = Vec::new();
    for addr in addrs {
        if !ips.contains(&addr.ip()) {
            ips.push(addr.ip());
        }
    }
    Ok(ips)
}

/// Query A and AAAA records from a specific server.
async fn resolve_with_server(hostname: &str, server: &str) -> Result<Vec<IpAddr>, String> {
    let server_addr = resolve_server_addr(server).await?;
    let bind_addr: SocketAddr = if server_addr.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| format!("failed to bind socket: {}", e))?;
    socket
        .connect(server_addr)
        .await
        .map_err(|e| format!("failed to connect to {}: {}", server_addr, e))?;

    let mut ips = Vec::new();
    let mut last_err = None;
    for qtype in [QTYPE_A, QTYPE_AAAA] {
        match query(&socket, hostname, qtype).await {
            Ok(found) => {
                for ip in found {
                    if !ips.contains(&ip) {
                        ips.push(ip);
                    }
                }
            }
            Err(e) => last_err = Some(e),
        }
    }

    match (ips.is_empty(), last_err) {
        (true, Some(e)) => Err(e),
        _ => Ok(ips),
    }
}

async fn resolve_server_addr(server: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = server.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    let target = if server.contains(':') {
        server.to_string()
    } else {
        format!("{}:53", server)
    };
    tokio::net::lookup_host(target)
        .await
        .map_err(|e| format!("failed to resolve DNS server {}: {}", server, e))?
        .next()
        .ok_or_else(|| format!("no address for DNS server {}", server))
}

async fn query(socket: &UdpSocket, hostname: &str, qtype: u16) -> Result<Vec<IpAddr>, String> {
    let tx_id: u16 = rand::random();
    let packet = build_dns_query(tx_id, hostname, qtype)?;

    socket
        .send(&packet)
        .await
        .map_err(|e| format!("failed to send: {}", e))?;

    let mut response = [0u8; 1232];
    loop {
        let n = socket
            .recv(&mut response)
            .await
            .map_err(|e| format!("failed to recv: {}", e))?;
        // Late answers to an earlier query share the socket; skip them.
        if n >= 2 && u16::from_be_bytes([response[0], response[1]]) != tx_id {
            continue;
        }
        return parse_dns_response(&response[..n], tx_id);
    }
}

/// Build a recursive query packet for `hostname`.
fn build_dns_query(tx_id: u16, hostname: &str, qtype: u16) -> Result<Vec<u8>, String> {
    let flags: u16 = 0x0100; // Standard query, recursion desired

    let mut packet = Vec::with_capacity(64);
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ANCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    packet.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT

    for label in hostname.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("invalid hostname: {}", hostname));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());

    Ok(packet)
}

/// Extract A and AAAA answers from a response packet.
fn parse_dns_response(response: &[u8], tx_id: u16) -> Result<Vec<IpAddr>, String> {
    if response.len() < 12 {
        return Err(format!("response too short: {} bytes", response.len()));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        ));
    }
    if response[2] & 0x80 == 0 {
        return Err("packet is not a response".to_string());
    }

    match response[3] & 0x0F {
        0 => {}
        3 => return Err("no such host".to_string()),
        rcode => return Err(format!("DNS error RCODE: {}", rcode)),
    }

    let qd_count = u16::from_be_bytes([response[4], response[5]]);
    let an_count = u16::from_be_bytes([response[6], response[7]]);

    let mut pos = 12;
    for _ in 0..qd_count {
        pos = skip_name(response, pos)?;
        pos += 4; // QTYPE + QCLASS
    }

    let mut ips = Vec::new();
    for _ in 0..an_count {
        pos = skip_name(response, pos)?;
        let header = response
            .get(pos..pos + 10)
            .ok_or_else(|| "truncated answer".to_string())?;
        let rtype = u16::from_be_bytes([header[0], header[1]]);
        let rdlength = u16::from_be_bytes([header[8], header[9]]) as usize;
        pos += 10;

        let rdata = response
            .get(pos..pos + rdlength)
            .ok_or_else(|| "truncated record data".to_string())?;
        match (rtype, rdata.len()) {
            (QTYPE_A, 4) => ips.push(IpAddr::V4(Ipv4Addr::new(
                rdata[0], rdata[1], rdata[2], rdata[3],
            ))),
            (QTYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                ips.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {} // CNAME and friends
        }
        pos += rdlength;
    }

    Ok(ips)
}

/// Skip an encoded (possibly compressed) domain name, returning the next offset.
fn skip_name(packet: &[u8], mut pos: usize) -> Result<usize, String> {
    loop {
        let len = *packet
            .get(pos)
            .ok_or_else(|| "truncated name".to_string())? as usize;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => return Ok(pos + 2),
            l => pos += l + 1,
        }
    }
}
