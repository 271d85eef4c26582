// Copyright (c) 2024 Botho Foundation

//! Public address self-discovery over STUN (RFC 5389 binding requests).
//!
//! Only the binding exchange is implemented. The mapped address tells the
//! broker whether a NAT sits between this device and its peers and gives
//! the rendezvous service something to hand out.
//!
//! Every message starts with a 20 byte header: type (2), attribute
//! length (2), magic cookie (4) and a 96-bit transaction id.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;
const DEFAULT_STUN_PORT: u16 = 3478;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

type TransactionId = [u8; 12];

/// Address used to pick the outbound interface; nothing is sent to it.
const ROUTE_PROBE_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

#[derive(Debug, Error)]
pub enum StunError {
    #[error("socket error: {0}")]
    Network(#[from] std::io::Error),

    #[error("no binding response within {0:?}")]
    Timeout(Duration),

    #[error("malformed binding response: {0}")]
    InvalidResponse(&'static str),

    #[error("STUN server list is empty")]
    NoServers,

    #[error("cannot resolve STUN server {0:?}")]
    InvalidServer(String),
}

/// Servers and retry policy for binding requests.
#[derive(Debug, Clone)]
pub struct StunConfig {
    /// `host:port` or `stun:host[:port]`, tried in order
    pub servers: Vec<String>,
    pub request_timeout: Duration,
    /// Extra attempts per server after the first
    pub retries: u8,
    pub retry_delay: Duration,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: ["stun.l.google.com:19302", "stun.cloudflare.com:3478", "stun.nextcloud.com:443"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            request_timeout: Duration::from_secs(3),
            retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl StunConfig {
    pub fn with_servers(servers: Vec<String>) -> Self {
        Self {
            servers,
            ..Default::default()
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_retries(mut self, retries: u8, retry_delay: Duration) -> Self {
        self.retries = retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// A successful binding exchange.
#[derive(Debug, Clone)]
pub struct StunResult {
    /// This socket's address as the server saw it
    pub mapped_address: SocketAddr,
    pub server: String,
    pub rtt: Duration,
}

/// What self-discovery learned about this node's addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfAddresses {
    /// Mapped address, `None` when no STUN server answered.
    pub public: Option<SocketAddr>,
    /// Address of the interface used for outbound traffic.
    pub local: Option<IpAddr>,
}

impl SelfAddresses {
    /// True when the mapped address differs from the local interface, or
    /// when it could not be determined.
    pub fn behind_nat(&self) -> bool {
        match (self.public, self.local) {
            (Some(public), Some(local)) => public.ip() != local,
            _ => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StunClient {
    config: StunConfig,
}

impl StunClient {
    pub fn new(config: StunConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StunConfig {
        &self.config
    }

    /// Mapped address of a fresh ephemeral socket.
    pub async fn discover_public_address(&self) -> Result<StunResult, StunError> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        self.discover_from(&socket).await
    }

    /// Mapped address of an already bound socket. The first server to answer
    /// wins; the error from the last server is returned when none does.
    pub async fn discover_from(&self, socket: &UdpSocket) -> Result<StunResult, StunError> {
        let mut failure = StunError::NoServers;
        for server in &self.config.servers {
            match self.bind_via(socket, server).await {
                Ok(result) => {
                    info!(
                        server = %server,
                        rtt_ms = result.rtt.as_millis() as u64,
                        "Public address is {}",
                        result.mapped_address
                    );
                    return Ok(result);
                }
                Err(e) => {
                    warn!("STUN server {} failed: {}", server, e);
                    failure = e;
                }
            }
        }
        Err(failure)
    }

    /// Public and local addresses; a STUN failure leaves `public` empty.
    pub async fn self_addresses(&self) -> SelfAddresses {
        let public = self
            .discover_public_address()
            .await
            .map_err(|e| debug!("STUN self-discovery unavailable: {}", e))
            .ok()
            .map(|result| result.mapped_address);
        SelfAddresses {
            public,
            local: local_ip().await,
        }
    }

    async fn bind_via(&self, socket: &UdpSocket, server: &str) -> Result<StunResult, StunError> {
        let server_addr = resolve_server(server).await?;
        let mut attempt = 0;
        loop {
            let transaction: TransactionId = rand::random();
            let started = Instant::now();
            socket.send_to(&binding_request(&transaction), server_addr).await?;

            let mut buf = [0u8; 512];
            let outcome = match timeout(
                self.config.request_timeout,
                recv_response(socket, &mut buf, &transaction, server_addr),
            )
            .await
            {
                Ok(Ok(mapped)) => {
                    return Ok(StunResult {
                        mapped_address: mapped,
                        server: server.to_string(),
                        rtt: started.elapsed(),
                    })
                }
                Ok(Err(e)) => e,
                Err(_) => StunError::Timeout(self.config.request_timeout),
            };

            if attempt >= self.config.retries {
                return Err(outcome);
            }
            attempt += 1;
            debug!(server, attempt, "Retrying binding request after: {}", outcome);
            tokio::time::sleep(self.config.retry_delay).await;
        }
    }
}

/// Wait for the response to `transaction` from `server`. Unrelated datagrams
/// and late answers to earlier attempts are dropped.
async fn recv_response(
    socket: &UdpSocket,
    buf: &mut [u8],
    transaction: &TransactionId,
    server: SocketAddr,
) -> Result<SocketAddr, StunError> {
    loop {
        let (len, from) = socket.recv_from(buf).await?;
        let datagram = &buf[..len];
        if from != server || (len >= HEADER_LEN && &datagram[8..HEADER_LEN] != transaction) {
            trace!(%from, len, "Dropping unrelated datagram");
            continue;
        }
        return parse_binding_response(datagram, transaction)?
            .ok_or(StunError::InvalidResponse("no mapped address attribute"));
    }
}

/// Address of the interface the OS routes outbound traffic through.
pub async fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    // connect() on UDP only selects a route
    socket.connect(ROUTE_PROBE_ADDR).await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified()).then_some(ip)
}

/// Accepts `host:port`, `host` (port 3478) and either form behind `stun:`.
async fn resolve_server(server: &str) -> Result<SocketAddr, StunError> {
    let target = server.strip_prefix("stun:").unwrap_or(server);
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let resolved = if target.contains(':') {
        tokio::net::lookup_host(target).await.ok().and_then(|mut addrs| addrs.next())
    } else {
        tokio::net::lookup_host((target, DEFAULT_STUN_PORT))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
    };
    resolved.ok_or_else(|| StunError::InvalidServer(server.to_string()))
}

fn header(msg_type: u16, body_len: usize, transaction: &TransactionId) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + body_len);
    msg.extend_from_slice(&msg_type.to_be_bytes());
    msg.extend_from_slice(&(body_len as u16).to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(transaction);
    msg
}

/// A binding request carries no attributes.
pub(crate) fn binding_request(transaction: &TransactionId) -> Vec<u8> {
    header(BINDING_REQUEST, 0, transaction)
}

/// Walk the TLV attributes that follow the header, honoring 4-byte padding.
/// Stops quietly at the first attribute that overruns the body.
fn attributes(body: &[u8]) -> impl Iterator<Item = (u16, &[u8])> {
    let mut rest = body;
    std::iter::from_fn(move || {
        if rest.len() < 4 {
            return None;
        }
        let kind = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let value = rest.get(4..4 + len)?;
        let padded = (4 + len + 3) & !3;
        rest = rest.get(padded..).unwrap_or(&[]);
        Some((kind, value))
    })
}

/// The mapped address from a binding success response, preferring
/// XOR-MAPPED-ADDRESS over the legacy MAPPED-ADDRESS wherever it appears.
pub(crate) fn parse_binding_response(
    data: &[u8],
    transaction: &TransactionId,
) -> Result<Option<SocketAddr>, StunError> {
    if data.len() < HEADER_LEN {
        return Err(StunError::InvalidResponse("shorter than a header"));
    }
    if u16::from_be_bytes([data[0], data[1]]) != BINDING_SUCCESS {
        return Err(StunError::InvalidResponse("not a binding success"));
    }
    if data[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return Err(StunError::InvalidResponse("bad magic cookie"));
    }
    if &data[8..HEADER_LEN] != transaction {
        return Err(StunError::InvalidResponse("transaction id mismatch"));
    }
    let body_len = u16::from_be_bytes([data[2], data[3]]) as usize;
    let body = data
        .get(HEADER_LEN..HEADER_LEN + body_len)
        .ok_or(StunError::InvalidResponse("body truncated"))?;

    let mut legacy = None;
    for (kind, value) in attributes(body) {
        match kind {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, Some(transaction)) {
                    return Ok(Some(addr));
                }
            }
            ATTR_MAPPED_ADDRESS if legacy.is_none() => legacy = decode_address(value, None),
            _ => trace!("Skipping STUN attribute 0x{:04x}", kind),
        }
    }
    Ok(legacy)
}

/// The XOR key for an address attribute: cookie then transaction id.
fn xor_key(transaction: &TransactionId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    key[4..].copy_from_slice(transaction);
    key
}

/// Decode a (XOR-)MAPPED-ADDRESS value; `xor` carries the transaction id
/// for the XOR form.
fn decode_address(value: &[u8], xor: Option<&TransactionId>) -> Option<SocketAddr> {
    let (family, port, raw) = (*value.get(1)?, value.get(2..4)?, value.get(4..)?);
    let key = xor.map(xor_key).unwrap_or([0u8; 16]);
    let port = u16::from_be_bytes([port[0] ^ key[0], port[1] ^ key[1]]);

    let ip = match family {
        FAMILY_IPV4 => {
            let mut octets: [u8; 4] = raw.get(..4)?.try_into().ok()?;
            octets.iter_mut().zip(&key).for_each(|(b, k)| *b ^= k);
            IpAddr::from(octets)
        }
        FAMILY_IPV6 => {
            let mut octets: [u8; 16] = raw.get(..16)?.try_into().ok()?;
            octets.iter_mut().zip(&key).for_each(|(b, k)| *b ^= k);
            IpAddr::from(octets)
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Encode an address attribute value; the inverse of [`decode_address`].
#[cfg(test)]
fn encode_address(addr: SocketAddr, xor: Option<&TransactionId>) -> Vec<u8> {
    let key = xor.map(xor_key).unwrap_or([0u8; 16]);
    let (family, octets) = match addr.ip() {
        IpAddr::V4(ip) => (FAMILY_IPV4, ip.octets().to_vec()),
        IpAddr::V6(ip) => (FAMILY_IPV6, ip.octets().to_vec()),
    };
    let port = addr.port().to_be_bytes();

    let mut value = vec![0x00, family, port[0] ^ key[0], port[1] ^ key[1]];
    value.extend(octets.iter().zip(&key).map(|(b, k)| b ^ k));
    value
}

/// A binding success carrying the given attributes.
#[cfg(test)]
pub(crate) fn binding_response(transaction: &TransactionId, attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (kind, value) in attrs {
        body.extend_from_slice(&kind.to_be_bytes());
        body.extend_from_slice(&(value.len() as u16).to_be_bytes());
        body.extend_from_slice(value);
        body.resize((body.len() + 3) & !3, 0);
    }
    let mut msg = header(BINDING_SUCCESS, body.len(), transaction);
    msg.extend_from_slice(&body);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn xor_response(transaction: &TransactionId, mapped: SocketAddr) -> Vec<u8> {
        binding_response(
            transaction,
            &[(ATTR_XOR_MAPPED_ADDRESS, encode_address(mapped, Some(transaction)))],
        )
    }

    #[tokio::test]
    async fn test_resolve_server_forms() {
        for server in ["stun:192.168.1.1:3478", "192.168.1.1:3478", "127.0.0.1", "stun:127.0.0.1"] {
            let addr = resolve_server(server).await.unwrap();
            assert_eq!(addr.port(), 3478, "{}", server);
        }
        let addr = resolve_server("10.1.2.3:19302").await.unwrap();
        assert_eq!(addr, "10.1.2.3:19302".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_binding_request_layout() {
        let transaction = [9u8; 12];
        let request = binding_request(&transaction);

        assert_eq!(request.len(), HEADER_LEN);
        assert_eq!(&request[..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&request[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&request[8..], &transaction);
    }

    #[test]
    fn test_xor_mapped_ipv4() {
        let transaction = [7u8; 12];
        let mapped: SocketAddr = "192.0.2.1:32853".parse().unwrap();
        let response = xor_response(&transaction, mapped);
        // Port and address must not appear in the clear
        assert!(!response.windows(2).any(|w| w == 32853u16.to_be_bytes()));
        assert_eq!(parse_binding_response(&response, &transaction).unwrap(), Some(mapped));
    }

    #[test]
    fn test_xor_mapped_ipv6() {
        let transaction = [0xA5u8; 12];
        let mapped = SocketAddr::new(
            IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x42)),
            40000,
        );
        let response = xor_response(&transaction, mapped);
        assert_eq!(parse_binding_response(&response, &transaction).unwrap(), Some(mapped));
    }

    #[test]
    fn test_legacy_mapped_address() {
        let transaction = [3u8; 12];
        let response = binding_response(
            &transaction,
            &[(ATTR_MAPPED_ADDRESS, vec![0x00, 0x01, 0x1F, 0x90, 10, 0, 0, 5])],
        );
        let addr = parse_binding_response(&response, &transaction).unwrap();
        assert_eq!(addr, Some("10.0.0.5:8080".parse().unwrap()));
    }

    #[test]
    fn test_xor_preferred_over_legacy() {
        let transaction = [4u8; 12];
        let legacy: SocketAddr = "10.0.0.5:8080".parse().unwrap();
        let mapped: SocketAddr = "203.0.113.10:9000".parse().unwrap();
        let response = binding_response(
            &transaction,
            &[
                (ATTR_MAPPED_ADDRESS, encode_address(legacy, None)),
                // Odd length forces padding before the next attribute
                (0x8022, b"srv".to_vec()),
                (ATTR_XOR_MAPPED_ADDRESS, encode_address(mapped, Some(&transaction))),
            ],
        );
        assert_eq!(parse_binding_response(&response, &transaction).unwrap(), Some(mapped));
    }

    #[test]
    fn test_response_without_address() {
        let transaction = [5u8; 12];
        let response = binding_response(&transaction, &[(0x8022, b"software".to_vec())]);
        assert_eq!(parse_binding_response(&response, &transaction).unwrap(), None);
    }

    #[test]
    fn test_rejects_malformed() {
        let transaction = [1u8; 12];
        let mapped: SocketAddr = "192.0.2.1:1000".parse().unwrap();

        let reject = |data: &[u8], transaction: &TransactionId| {
            matches!(
                parse_binding_response(data, transaction),
                Err(StunError::InvalidResponse(_))
            )
        };

        assert!(reject(&xor_response(&transaction, mapped), &[2u8; 12]));
        assert!(reject(&[0u8; 10], &transaction));
        assert!(reject(&binding_request(&transaction), &transaction));

        let mut truncated = xor_response(&transaction, mapped);
        truncated.truncate(truncated.len() - 2);
        assert!(reject(&truncated, &transaction));

        let mut bad_cookie = xor_response(&transaction, mapped);
        bad_cookie[4] ^= 0xff;
        assert!(reject(&bad_cookie, &transaction));
    }

    #[test]
    fn test_behind_nat() {
        let local: IpAddr = "192.168.1.20".parse().unwrap();
        let natted = SelfAddresses {
            public: Some("203.0.113.9:5000".parse().unwrap()),
            local: Some(local),
        };
        assert!(natted.behind_nat());

        let open = SelfAddresses {
            public: Some(SocketAddr::new(local, 5000)),
            local: Some(local),
        };
        assert!(!open.behind_nat());

        let unknown = SelfAddresses {
            public: None,
            local: Some(local),
        };
        assert!(unknown.behind_nat());
    }

    #[tokio::test]
    async fn test_discover_against_local_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let reported: SocketAddr = "198.51.100.7:61000".parse().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_LEN);
            let transaction: TransactionId = buf[8..HEADER_LEN].try_into().unwrap();
            // A stale answer first, then the real one
            server.send_to(&xor_response(&[0u8; 12], reported), from).await.unwrap();
            server.send_to(&xor_response(&transaction, reported), from).await.unwrap();
        });

        let client = StunClient::new(StunConfig::with_servers(vec![server_addr.to_string()]));
        let result = client.discover_public_address().await.unwrap();
        assert_eq!(result.mapped_address, reported);
        assert_eq!(result.server, server_addr.to_string());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let client = StunClient::new(
            StunConfig::with_servers(vec![server_addr.to_string()])
                .with_request_timeout(Duration::from_millis(50))
                .with_retries(1, Duration::from_millis(10)),
        );
        assert!(matches!(
            client.discover_public_address().await,
            Err(StunError::Timeout(_))
        ));
        drop(server);
    }

    #[tokio::test]
    async fn test_empty_server_list() {
        let client = StunClient::new(StunConfig::with_servers(vec![]));
        assert!(matches!(
            client.discover_public_address().await,
            Err(StunError::NoServers)
        ));
    }
}
