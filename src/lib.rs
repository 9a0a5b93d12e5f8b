pub mod addr;
pub mod config;
pub mod connection;
pub mod dns;
pub mod forward;
pub mod http;
pub mod outbound;
pub mod socks;
pub mod ssr;
pub mod traffic;

pub use self::http::{HttpProxyServer, ServerHandle};
pub use outbound::{BoxedStream, DialError, DirectDialer, OutboundDialer};
pub use ssr::{ShadowsocksrDialer, SsrConfig};
