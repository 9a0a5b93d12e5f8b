//! HTTP proxy front-end: CONNECT tunnels and plain-HTTP forwarding with
//! keep-alive, over any [`OutboundDialer`](crate::outbound::OutboundDialer).

pub mod codec;
pub mod server;

pub use codec::{HttpProxyError, HttpResult, ProxyRequest, ProxyResponse};
pub use server::{HttpProxyServer, ServerHandle, CONNECT_ESTABLISHED};
