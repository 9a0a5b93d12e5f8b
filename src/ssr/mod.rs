//! Shadowsocksr outbound: a raw TCP connection to the SSR server wrapped with
//! a stream cipher, an obfuscation plugin and a protocol plugin.

pub mod cipher;
pub mod obfs;
pub mod protocol;
pub mod stream;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::addr::{parse_addr, AddrError, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::dns::{self, Resolver};
use crate::outbound::{BoxedStream, DialResult, OutboundDialer};

pub use cipher::{CipherKind, StreamCipher};
pub use obfs::{Obfs, ObfsKind};
pub use protocol::{Protocol, ProtocolKind};
pub use stream::SsrStream;

/// Assumed TCP maximum segment size handed to plugins
pub const TCP_MSS: u16 = 1460;

/// Head length used when the first payload is not a recognizable address
const DEFAULT_HEAD_LEN: usize = 30;

/// Error type for Shadowsocksr setup and dial operations
#[derive(Debug, thiserror::Error)]
pub enum SsrError {
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    #[error("unsupported obfs: {0}")]
    UnsupportedObfs(String),

    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("invalid SSR configuration: {0}")]
    InvalidConfig(String),

    #[error("cipher setup failed: {0}")]
    Cipher(String),

    #[error("invalid target address: {0}")]
    Addr(#[from] AddrError),

    #[error("connect to SSR server {server} failed: {source}")]
    Connect {
        server: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for SSR server {0}")]
    NoServerAddress(String),

    #[error("SSR handshake failed: {0}")]
    Handshake(#[source] io::Error),
}

/// Result type for Shadowsocksr operations
pub type SsrResult<T> = Result<T, SsrError>;

/// Per-endpoint metadata handed to obfs and protocol plugins.
#[derive(Clone)]
pub struct ServerInfo {
    pub host: String,
    pub port: u16,
    pub tcp_mss: u16,
    pub param: String,
    /// Local encryption IV of the stream cipher
    pub iv: Vec<u8>,
    /// Stream cipher key
    pub key: Vec<u8>,
    /// Length of the encoded target address at the head of the first write
    pub head_len: usize,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 0,
            tcp_mss: TCP_MSS,
            param: String::new(),
            iv: Vec::new(),
            key: Vec::new(),
            head_len: DEFAULT_HEAD_LEN,
        }
    }
}

impl std::fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tcp_mss", &self.tcp_mss)
            .field("param", &self.param)
            .field("head_len", &self.head_len)
            .finish()
    }
}

/// Length of a SOCKS5-style address at the head of `buf`.
pub fn head_size(buf: &[u8], default: usize) -> usize {
    match buf.first() {
        Some(&ATYP_IPV4) => 7,
        Some(&ATYP_IPV6) => 19,
        Some(&ATYP_DOMAIN) if buf.len() > 1 => 4 + buf[1] as usize,
        _ => default,
    }
}

/// Session identity shared by every connection of one dialer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthData {
    pub client_id: [u8; 4],
    pub connection_id: u32,
}

impl AuthData {
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let mut client_id = [0u8; 4];
        rng.fill_bytes(&mut client_id);
        Self {
            client_id,
            connection_id: rng.gen::<u32>() & 0x00FF_FFFF,
        }
    }

    /// Advance to the next connection, rolling the client id before the
    /// counter can wrap.
    pub fn next_connection(&mut self) -> ([u8; 4], u32) {
        self.connection_id = self.connection_id.wrapping_add(1);
        if self.connection_id > 0xFF00_0000 {
            *self = AuthData::new();
        }
        (self.client_id, self.connection_id)
    }
}

impl Default for AuthData {
    fn default() -> Self {
        Self::new()
    }
}

/// Plugin session state, produced on first use and handed to every later
/// plugin instance of the same dialer.
#[derive(Debug, Clone)]
pub enum PluginData {
    None,
    Auth(Arc<Mutex<AuthData>>),
}

impl PluginData {
    /// Whether both values refer to the same shared state.
    pub fn same_as(&self, other: &PluginData) -> bool {
        match (self, other) {
            (PluginData::None, PluginData::None) => true,
            (PluginData::Auth(a), PluginData::Auth(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// Settings for one SSR server.
#[derive(Clone)]
pub struct SsrConfig {
    pub host: String,
    pub port: u16,
    pub method: String,
    pub password: String,
    pub obfs: String,
    pub obfs_param: String,
    pub protocol: String,
    pub protocol_param: String,
    /// Stub resolver used when platform resolution of `host` fails
    pub dns_server: Option<SocketAddr>,
    pub dns_timeout: Duration,
}

impl SsrConfig {
    pub fn new(host: impl Into<String>, port: u16, method: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            method: method.into(),
            password: password.into(),
            obfs: "plain".to_string(),
            obfs_param: String::new(),
            protocol: "origin".to_string(),
            protocol_param: String::new(),
            dns_server: None,
            dns_timeout: dns::DEFAULT_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for SsrConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsrConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("method", &self.method)
            .field("password", &"<redacted>")
            .field("obfs", &self.obfs)
            .field("obfs_param", &self.obfs_param)
            .field("protocol", &self.protocol)
            .field("protocol_param", &self.protocol_param)
            .field("dns_server", &self.dns_server)
            .finish()
    }
}

/// Dials destinations through one Shadowsocksr server.
///
/// The server address cache and plugin session state live as long as the
/// dialer and are shared by all of its dials.
pub struct ShadowsocksrDialer {
    config: SsrConfig,
    cipher: CipherKind,
    resolver: Option<Resolver>,
    cache: RwLock<Vec<IpAddr>>,
    obfs_data: Mutex<Option<PluginData>>,
    protocol_data: Mutex<Option<PluginData>>,
}

impl ShadowsocksrDialer {
    pub fn new(config: SsrConfig) -> SsrResult<Self> {
        let cipher: CipherKind = config.method.parse()?;
        if config.host.is_empty() {
            return Err(SsrError::InvalidConfig("server host is empty".to_string()));
        }
        if config.port == 0 {
            return Err(SsrError::InvalidConfig("server port must be non-zero".to_string()));
        }

        let cached = match config.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => Vec::new(),
        };
        let resolver = config
            .dns_server
            .map(|server| Resolver::new(server).with_timeout(config.dns_timeout));

        Ok(Self {
            config,
            cipher,
            resolver,
            cache: RwLock::new(cached),
            obfs_data: Mutex::new(None),
            protocol_data: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &SsrConfig {
        &self.config
    }

    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }

    /// Snapshot of the resolved server addresses
    pub async fn cached_addrs(&self) -> Vec<IpAddr> {
        self.cache.read().await.clone()
    }

    /// Obfs session state retained from earlier dials
    pub fn obfs_data(&self) -> Option<PluginData> {
        self.obfs_data.lock().clone()
    }

    /// Protocol session state retained from earlier dials
    pub fn protocol_data(&self) -> Option<PluginData> {
        self.protocol_data.lock().clone()
    }

    fn server_label(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn connect_any(&self, addrs: &[IpAddr]) -> SsrResult<TcpStream> {
        let mut last_err = None;
        for ip in addrs {
            match TcpStream::connect(SocketAddr::new(*ip, self.config.port)).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!("SSR server {} at {} unreachable: {}", self.config.host, ip, e);
                    last_err = Some(e);
                }
            }
        }
        Err(SsrError::Connect {
            server: self.server_label(),
            source: last_err
                .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no cached server address")),
        })
    }

    /// Re-resolve the server host and replace the cache.
    async fn refresh_cache(&self) -> SsrResult<Vec<IpAddr>> {
        let mut cache = self.cache.write().await;

        let mut addrs: Vec<IpAddr> = match lookup_host((self.config.host.as_str(), self.config.port)).await {
            Ok(found) => found.map(|sa| sa.ip()).collect(),
            Err(e) => {
                debug!("lookup of {} failed: {}", self.config.host, e);
                Vec::new()
            }
        };
        addrs.dedup();

        if addrs.is_empty() {
            if let Some(resolver) = &self.resolver {
                if let Some(ip) = resolver.resolve(&self.config.host).await {
                    debug!("{} resolved to {} via {}", self.config.host, ip, resolver.server());
                    addrs.push(IpAddr::V4(ip));
                }
            }
        }

        if addrs.is_empty() {
            return Err(SsrError::NoServerAddress(self.config.host.clone()));
        }
        *cache = addrs.clone();
        Ok(addrs)
    }

    /// Cached addresses first; on failure refresh the cache and retry once.
    async fn connect_server(&self) -> SsrResult<TcpStream> {
        let cached = self.cached_addrs().await;
        match self.connect_any(&cached).await {
            Ok(stream) => Ok(stream),
            Err(e) => {
                debug!("{}; refreshing server address", e);
                let refreshed = self.refresh_cache().await?;
                self.connect_any(&refreshed).await
            }
        }
    }

    fn attach_obfs(&self, obfs: &mut dyn Obfs) {
        let mut slot = self.obfs_data.lock();
        match slot.as_ref() {
            Some(data) => obfs.set_data(data.clone()),
            None => *slot = Some(obfs.data()),
        }
    }

    fn attach_protocol(&self, protocol: &mut dyn Protocol) {
        let mut slot = self.protocol_data.lock();
        match slot.as_ref() {
            Some(data) => protocol.set_data(data.clone()),
            None => *slot = Some(protocol.data()),
        }
    }

    /// Open a tunnel to `host_port` and send its address as the first payload.
    pub async fn connect(&self, host_port: &str) -> SsrResult<SsrStream<TcpStream>> {
        let target = parse_addr(host_port)?;

        let tcp = self.connect_server().await?;
        let _ = tcp.set_nodelay(true);
        let peer = tcp.peer_addr().map_err(|source| SsrError::Connect {
            server: self.server_label(),
            source,
        })?;

        let cipher = StreamCipher::new(self.cipher, &self.config.password)?;
        let base = ServerInfo {
            host: peer.ip().to_string(),
            port: peer.port(),
            tcp_mss: TCP_MSS,
            param: String::new(),
            iv: cipher.iv().to_vec(),
            key: cipher.key().to_vec(),
            head_len: head_size(&target, DEFAULT_HEAD_LEN),
        };

        let mut obfs = self.config.obfs.parse::<ObfsKind>()?.build();
        obfs.set_server_info(ServerInfo {
            param: self.config.obfs_param.clone(),
            ..base.clone()
        });
        self.attach_obfs(obfs.as_mut());

        let mut protocol = self.config.protocol.parse::<ProtocolKind>()?.build();
        protocol.set_server_info(ServerInfo {
            param: self.config.protocol_param.clone(),
            ..base
        });
        self.attach_protocol(protocol.as_mut());

        let mut stream = SsrStream::new(tcp, cipher, obfs, protocol);
        let sent = async {
            stream.write_all(&target).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = sent {
            let _ = stream.shutdown().await;
            return Err(SsrError::Handshake(e));
        }
        Ok(stream)
    }
}

impl std::fmt::Debug for ShadowsocksrDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowsocksrDialer")
            .field("config", &self.config)
            .field("cipher", &self.cipher)
            .finish()
    }
}

#[async_trait]
impl OutboundDialer for ShadowsocksrDialer {
    async fn dial(&self, host_port: &str) -> DialResult<BoxedStream> {
        match self.connect(host_port).await {
            Ok(stream) => {
                debug!("SSR tunnel via {} to {} established", self.server_label(), host_port);
                Ok(Box::new(stream))
            }
            Err(e) => {
                if matches!(
                    e,
                    SsrError::UnsupportedObfs(_) | SsrError::UnsupportedProtocol(_) | SsrError::Cipher(_)
                ) {
                    warn!("SSR dial via {} misconfigured: {}", self.server_label(), e);
                }
                Err(e.into())
            }
        }
    }

    fn name(&self) -> &'static str {
        "ssr"
    }
}

/// Build a dialer and log what it was configured with.
pub fn dialer(config: SsrConfig) -> SsrResult<ShadowsocksrDialer> {
    let dialer = ShadowsocksrDialer::new(config)?;
    info!(
        "SSR outbound {} ({}, obfs {}, protocol {})",
        dialer.server_label(),
        dialer.cipher,
        dialer.config.obfs,
        dialer.config.protocol
    );
    Ok(dialer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn config(addr: SocketAddr, method: &str) -> SsrConfig {
        SsrConfig::new(addr.ip().to_string(), addr.port(), method, "secret")
    }

    #[test]
    fn head_size_follows_address_type() {
        assert_eq!(head_size(&parse_addr("1.2.3.4:80").unwrap(), 30), 7);
        assert_eq!(head_size(&parse_addr("[::1]:80").unwrap(), 30), 19);
        assert_eq!(head_size(&parse_addr("example.com:443").unwrap(), 30), 15);
        assert_eq!(head_size(&[0x09, 1, 2], 30), 30);
        assert_eq!(head_size(&[], 30), 30);
    }

    #[test]
    fn auth_data_rolls_client_id_near_wrap() {
        let mut data = AuthData::new();
        assert!(data.connection_id <= 0x00FF_FFFF);
        let (_, id) = data.next_connection();
        assert_eq!(id, data.connection_id);

        data.connection_id = 0xFF00_0000;
        let (_, id) = data.next_connection();
        assert!(id <= 0x0100_0000);
    }

    #[test]
    fn plugin_data_identity() {
        let shared = Arc::new(Mutex::new(AuthData::new()));
        let a = PluginData::Auth(shared.clone());
        let b = PluginData::Auth(shared);
        let c = PluginData::Auth(Arc::new(Mutex::new(AuthData::new())));
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert!(!a.same_as(&PluginData::None));
    }

    #[test]
    fn unknown_cipher_fails_before_any_io() {
        let cfg = SsrConfig::new("127.0.0.1", 1, "rc4-md5", "pw");
        assert!(matches!(
            ShadowsocksrDialer::new(cfg),
            Err(SsrError::UnsupportedCipher(name)) if name == "rc4-md5"
        ));

        let cfg = SsrConfig::new("127.0.0.1", 0, "aes-128-cfb", "pw");
        assert!(matches!(ShadowsocksrDialer::new(cfg), Err(SsrError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn ip_literal_host_is_cached_up_front() {
        let dialer = ShadowsocksrDialer::new(SsrConfig::new("127.0.0.1", 8388, "none", "pw")).unwrap();
        assert_eq!(dialer.cached_addrs().await, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let dialer = ShadowsocksrDialer::new(SsrConfig::new("localhost", 8388, "none", "pw")).unwrap();
        assert!(dialer.cached_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn hostname_is_resolved_after_failed_first_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = sock.read_to_end(&mut sink).await;
        });

        let dialer = ShadowsocksrDialer::new(SsrConfig::new("localhost", port, "none", "pw")).unwrap();
        let stream = dialer.connect("example.com:80").await.unwrap();
        drop(stream);
        assert!(!dialer.cached_addrs().await.is_empty());
    }

    #[tokio::test]
    async fn unresolvable_host_falls_back_to_stub_dns() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            let _ = sock.read_to_end(&mut sink).await;
        });

        // answers every A query with 127.0.0.1
        let udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let dns_server = udp.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, peer)) = udp.recv_from(&mut buf).await {
                let mut reply = buf[..n].to_vec();
                reply[2] = 0x81;
                reply[3] = 0x80;
                reply[7] = 1;
                reply.extend_from_slice(&[0xc0, 0x0c, 0x00, 0x01, 0x00, 0x01, 0, 0, 0, 60, 0x00, 0x04]);
                reply.extend_from_slice(&[127, 0, 0, 1]);
                let _ = udp.send_to(&reply, peer).await;
            }
        });

        let mut cfg = SsrConfig::new("ssr-server.invalid", port, "none", "pw");
        cfg.dns_server = Some(dns_server);
        cfg.dns_timeout = Duration::from_secs(2);
        let dialer = ShadowsocksrDialer::new(cfg).unwrap();
        assert!(dialer.cached_addrs().await.is_empty());

        let stream = dialer.connect("example.com:80").await.unwrap();
        drop(stream);
        assert_eq!(dialer.cached_addrs().await, vec![IpAddr::from([127, 0, 0, 1])]);
    }

    #[tokio::test]
    async fn malformed_target_fails_without_connecting() {
        let dialer = ShadowsocksrDialer::new(SsrConfig::new("127.0.0.1", 9, "none", "pw")).unwrap();
        assert!(matches!(dialer.connect("no-port").await, Err(SsrError::Addr(_))));
    }

    #[tokio::test]
    async fn unknown_obfs_fails_after_server_accepts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut sink = Vec::new();
            sock.read_to_end(&mut sink).await.unwrap();
            sink
        });

        let mut cfg = config(addr, "aes-128-cfb");
        cfg.obfs = "tls1.2_ticket_auth".to_string();
        let dialer = ShadowsocksrDialer::new(cfg).unwrap();

        assert!(matches!(
            dialer.connect("example.com:443").await,
            Err(SsrError::UnsupportedObfs(name)) if name == "tls1.2_ticket_auth"
        ));
        // connection was made, then dropped without any payload
        assert!(accepted.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn session_state_is_reused_across_dials() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let mut sink = Vec::new();
                    let _ = sock.read_to_end(&mut sink).await;
                });
            }
        });

        let mut cfg = config(addr, "aes-256-cfb");
        cfg.protocol = "auth_aes128_md5".to_string();
        let dialer = ShadowsocksrDialer::new(cfg).unwrap();
        assert!(dialer.protocol_data().is_none());

        let _first = dialer.connect("example.com:443").await.unwrap();
        let state = dialer.protocol_data().expect("state retained after first dial");
        let PluginData::Auth(handle) = &state else {
            panic!("auth protocol must retain auth state");
        };
        let after_first = handle.lock().connection_id;

        let _second = dialer.connect("example.org:443").await.unwrap();
        let again = dialer.protocol_data().unwrap();
        assert!(state.same_as(&again));
        assert_eq!(handle.lock().connection_id, after_first.wrapping_add(1));

        assert!(matches!(dialer.obfs_data(), Some(PluginData::None)));
    }

    #[tokio::test]
    async fn tunnel_carries_target_then_relays_both_ways() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();

            // http_simple request: the whole first write fits in the path
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed before request header");
                raw.extend_from_slice(&buf[..n]);
            }
            let text = String::from_utf8(raw).unwrap();
            let path = text.split(' ').nth(1).unwrap().trim_start_matches('/');
            let wire: Vec<u8> = path
                .split('%')
                .filter(|s| !s.is_empty())
                .map(|h| u8::from_str_radix(h, 16).unwrap())
                .collect();

            let mut cipher = StreamCipher::new(CipherKind::Aes128Cfb, "secret").unwrap();
            let mut plain = BytesMut::new();
            cipher.decrypt(&wire, &mut plain).unwrap();
            assert_eq!(&plain[..], &parse_addr("example.com:443").unwrap()[..]);

            let mut reply = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\n\r\n"[..]);
            cipher.encrypt(b"pong", &mut reply);
            sock.write_all(&reply).await.unwrap();
            text
        });

        let mut cfg = config(addr, "aes-128-cfb");
        cfg.obfs = "http_simple".to_string();
        cfg.obfs_param = "cdn.example.net".to_string();
        let dialer = ShadowsocksrDialer::new(cfg).unwrap();

        let mut stream = dialer.dial("example.com:443").await.unwrap();
        let mut pong = [0u8; 4];
        stream.read_exact(&mut pong).await.unwrap();
        assert_eq!(&pong, b"pong");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /"));
        assert!(request.contains(&format!("Host: cdn.example.net:{}\r\n", addr.port())));
    }
}
