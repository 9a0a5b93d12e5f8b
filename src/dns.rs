//! Minimal UDP stub resolver for IPv4 A records.
//!
//! Sends exactly one question and reads exactly one reply. The reply is judged
//! valid unless the low bit of the RCODE nibble is set, and the address is taken
//! from the final four bytes of the datagram. That holds for a single A answer
//! with no additional records and nothing else: there is no compression-pointer
//! handling and no multi-record walk. Callers rely on that narrow contract.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

/// Fixed transaction id written into every query
pub const QUERY_ID: u16 = 0x0102;
/// QTYPE A
pub const QTYPE_A: u16 = 0x0001;
/// QCLASS IN
pub const QCLASS_IN: u16 = 0x0001;

const HEADER_LEN: usize = 12;
const RESPONSE_BUF_LEN: usize = 1024;
const MAX_LABEL_LEN: usize = 63;

/// Default read timeout for a single query
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("dns socket error: {0}")]
    Io(#[from] io::Error),

    #[error("dns query timed out after {0:?}")]
    Timeout(Duration),

    #[error("dns server returned error flag (rcode {0})")]
    ServerError(u8),

    #[error("dns response too short: {0} bytes")]
    ShortResponse(usize),

    #[error("invalid domain name {0:?}")]
    InvalidDomain(String),
}

pub type DnsResult<T> = Result<T, DnsError>;

/// Build a single-question A/IN query for `domain`. The flags word is zero,
/// so recursion-desired is not requested.
pub fn build_query(domain: &str) -> DnsResult<Bytes> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + domain.len() + 6);

    // id, flags (standard query), qdcount=1, ancount, nscount, arcount
    buf.put_u16(QUERY_ID);
    buf.put_u16(0x0000);
    buf.put_u16(1);
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);

    for label in domain.split('.').filter(|l| !l.is_empty()) {
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::InvalidDomain(domain.to_string()));
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    buf.put_u16(QTYPE_A);
    buf.put_u16(QCLASS_IN);

    Ok(buf.freeze())
}

/// Interpret a reply datagram.
pub fn parse_response(reply: &[u8]) -> DnsResult<Ipv4Addr> {
    if reply.len() < HEADER_LEN + 4 {
        return Err(DnsError::ShortResponse(reply.len()));
    }
    if reply[3] & 0x01 != 0 {
        return Err(DnsError::ServerError(reply[3] & 0x0f));
    }
    let n = reply.len();
    Ok(Ipv4Addr::new(reply[n - 4], reply[n - 3], reply[n - 2], reply[n - 1]))
}

/// Stub resolver bound to one upstream server
#[derive(Debug, Clone)]
pub struct Resolver {
    server: SocketAddr,
    timeout: Duration,
}

impl Resolver {
    pub fn new(server: SocketAddr) -> Self {
        Self {
            server,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Issue one query and decode its reply.
    pub async fn query(&self, domain: &str) -> DnsResult<Ipv4Addr> {
        let query = build_query(domain)?;

        let bind_addr: SocketAddr = if self.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.server).await?;
        socket.send(&query).await?;

        let mut reply = [0u8; RESPONSE_BUF_LEN];
        let n = tokio::time::timeout(self.timeout, socket.recv(&mut reply))
            .await
            .map_err(|_| DnsError::Timeout(self.timeout))??;

        parse_response(&reply[..n])
    }

    /// Boolean-style contract: `Some(ip)` on success, `None` on any failure.
    pub async fn resolve(&self, domain: &str) -> Option<Ipv4Addr> {
        match self.query(domain).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                debug!("stub dns lookup of {} via {} failed: {}", domain, self.server, e);
                None
            }
        }
    }
}

/// Resolve `domain` against `server` with the default timeout.
pub async fn resolve(server: SocketAddr, domain: &str) -> Option<Ipv4Addr> {
    Resolver::new(server).resolve(domain).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crafted_reply(query: &[u8], flags_lo: u8, ip: [u8; 4]) -> Vec<u8> {
        let mut reply = Vec::new();
        reply.extend_from_slice(&query[..2]);
        reply.extend_from_slice(&[0x81, flags_lo, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        reply.extend_from_slice(&query[HEADER_LEN..]);
        // compressed name pointer, A, IN, ttl 300, rdlength 4
        reply.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x01, 0x2c, 0x00, 0x04]);
        reply.extend_from_slice(&ip);
        reply
    }

    async fn spawn_fake_server(flags_lo: u8) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let reply = crafted_reply(&buf[..n], flags_lo, [93, 184, 216, 34]);
            socket.send_to(&reply, peer).await.unwrap();
        });
        addr
    }

    #[test]
    fn query_layout() {
        let query = build_query("example.com").unwrap();
        let mut expected = vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        expected.push(7);
        expected.extend_from_slice(b"example");
        expected.push(3);
        expected.extend_from_slice(b"com");
        expected.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]);
        assert_eq!(&query[..], &expected[..]);
    }

    #[test]
    fn query_ignores_trailing_dot_and_rejects_long_labels() {
        assert_eq!(build_query("example.com.").unwrap(), build_query("example.com").unwrap());
        let long = format!("{}.com", "x".repeat(64));
        assert!(matches!(build_query(&long), Err(DnsError::InvalidDomain(_))));
    }

    #[test]
    fn parse_takes_last_four_bytes() {
        let query = build_query("example.com").unwrap();
        let reply = crafted_reply(&query, 0x80, [1, 2, 3, 4]);
        assert_eq!(parse_response(&reply).unwrap(), Ipv4Addr::new(1, 2, 3, 4));
    }

    #[test]
    fn parse_rejects_error_flag_and_short_replies() {
        let query = build_query("example.com").unwrap();
        let reply = crafted_reply(&query, 0x83, [1, 2, 3, 4]);
        assert!(matches!(parse_response(&reply), Err(DnsError::ServerError(3))));
        assert!(matches!(parse_response(&reply[..10]), Err(DnsError::ShortResponse(10))));
    }

    #[tokio::test]
    async fn resolves_against_udp_server() {
        let server = spawn_fake_server(0x80).await;
        let ip = resolve(server, "example.com").await;
        assert_eq!(ip, Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(ip.unwrap().to_string(), "93.184.216.34");
    }

    #[tokio::test]
    async fn error_flag_yields_none() {
        let server = spawn_fake_server(0x83).await;
        assert_eq!(resolve(server, "example.com").await, None);
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = Resolver::new(socket.local_addr().unwrap())
            .with_timeout(Duration::from_millis(100));
        assert!(matches!(resolver.query("example.com").await, Err(DnsError::Timeout(_))));
        drop(socket);
    }
}
