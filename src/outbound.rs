//! Outbound-dial strategies.
//!
//! The HTTP front-end only sees [`OutboundDialer`]; whether a destination is
//! reached with a plain TCP connect, through an upstream SOCKS5 proxy or over a
//! Shadowsocksr tunnel is decided once, when the front-end is built.

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::socks::SocksError;
use crate::ssr::SsrError;

/// Bidirectional byte stream handed out by a dialer
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Error type for outbound dial attempts
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Ssr(#[from] SsrError),

    #[error(transparent)]
    Socks(#[from] SocksError),
}

pub type DialResult<T> = Result<T, DialError>;

/// Capability to open a connection to `host:port`
#[async_trait]
pub trait OutboundDialer: Send + Sync {
    async fn dial(&self, host_port: &str) -> DialResult<BoxedStream>;

    /// Short label used in logs
    fn name(&self) -> &'static str;
}

/// Operating-system TCP dial
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl OutboundDialer for DirectDialer {
    async fn dial(&self, host_port: &str) -> DialResult<BoxedStream> {
        let stream = TcpStream::connect(host_port)
            .await
            .map_err(|source| DialError::Connect {
                addr: host_port.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "direct"
    }
}
