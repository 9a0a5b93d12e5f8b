use async_trait::async_trait;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::outbound::{BoxedStream, DialResult, OutboundDialer};

/// Error type for SOCKS5 connection operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error("SOCKS5 connection via {proxy} failed: {source}")]
    ConnectionFailed {
        proxy: String,
        #[source]
        source: tokio_socks::Error,
    },

    #[error("SOCKS5 configuration error: {0}")]
    Config(String),
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Username/password for the upstream SOCKS5 server
#[derive(Clone)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

impl Auth {
    pub fn new(username: String, password: String) -> Self {
        Self { username, password }
    }
}

impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Dials destinations through an upstream SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    proxy: String,
    auth: Option<Auth>,
}

impl Socks5Dialer {
    pub fn new(proxy: impl Into<String>, auth: Option<Auth>) -> SocksResult<Self> {
        let proxy = proxy.into();
        if proxy.is_empty() {
            return Err(SocksError::Config("SOCKS5 address is required".to_string()));
        }
        if let Some(auth) = &auth {
            if auth.username.is_empty() || auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(SocksError::Config(
                    "SOCKS5 username must be 1..=255 bytes and password at most 255 bytes".to_string(),
                ));
            }
        }
        Ok(Self { proxy, auth })
    }

    /// Get the SOCKS5 server address
    pub fn proxy(&self) -> &str {
        &self.proxy
    }

    /// Open a SOCKS5 stream to the target address
    pub async fn connect(&self, target_addr: &str) -> SocksResult<Socks5Stream<tokio::net::TcpStream>> {
        let result = match &self.auth {
            Some(auth) => {
                Socks5Stream::connect_with_password(
                    self.proxy.as_str(),
                    target_addr,
                    &auth.username,
                    &auth.password,
                )
                .await
            }
            None => Socks5Stream::connect(self.proxy.as_str(), target_addr).await,
        };
        result.map_err(|source| SocksError::ConnectionFailed {
            proxy: self.proxy.clone(),
            source,
        })
    }
}

#[async_trait]
impl OutboundDialer for Socks5Dialer {
    async fn dial(&self, host_port: &str) -> DialResult<BoxedStream> {
        let stream = self.connect(host_port).await?;
        debug!("SOCKS5 tunnel via {} to {} established", self.proxy, host_port);
        Ok(Box::new(stream))
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}
