use clap::{Args, Parser, ValueEnum};
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::addr::split_host_port;
use crate::outbound::{DirectDialer, OutboundDialer};
use crate::socks::{Auth, Socks5Dialer};
use crate::ssr::{self, ObfsKind, ProtocolKind, ShadowsocksrDialer, SsrConfig};

/// How the proxy reaches request targets
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutboundKind {
    /// Plain TCP connect from this host
    Direct,
    /// Through a Shadowsocksr server
    Ssr,
    /// Through an upstream SOCKS5 proxy
    Socks5,
}

/// Shadowsocksr server settings
#[derive(Debug, Clone, Args)]
pub struct SsrArgs {
    /// SSR server as host:port
    #[arg(long = "ssr-server", value_name = "HOST:PORT")]
    pub server: Option<String>,

    /// Stream cipher, e.g. aes-256-cfb or none
    #[arg(long = "ssr-method", default_value = "aes-256-cfb")]
    pub method: String,

    /// SSR password
    #[arg(long = "ssr-password", default_value = "")]
    pub password: String,

    /// Obfuscation plugin: plain, http_simple or http_post
    #[arg(long = "ssr-obfs", default_value = "plain")]
    pub obfs: String,

    /// Obfuscation parameter, e.g. "host1,host2#Header: value"
    #[arg(long = "ssr-obfs-param", default_value = "")]
    pub obfs_param: String,

    /// Protocol plugin: origin, auth_aes128_md5 or auth_aes128_sha1
    #[arg(long = "ssr-protocol", default_value = "origin")]
    pub protocol: String,

    /// Protocol parameter, e.g. "uid:password"
    #[arg(long = "ssr-protocol-param", default_value = "")]
    pub protocol_param: String,

    /// UDP DNS server used when the SSR server host does not resolve
    #[arg(long = "dns-server", value_name = "IP:PORT")]
    pub dns_server: Option<SocketAddr>,

    /// Stub DNS read timeout in seconds
    #[arg(long = "dns-timeout", default_value_t = 5)]
    pub dns_timeout: u64,
}

/// Upstream SOCKS5 settings
#[derive(Debug, Clone, Args)]
pub struct SocksArgs {
    /// Upstream SOCKS5 proxy address or hostname:port
    #[arg(long = "socks-address", value_name = "HOST:PORT")]
    pub address: Option<String>,

    /// SOCKS5 username
    #[arg(long = "socks-user")]
    pub username: Option<String>,

    /// SOCKS5 password
    #[arg(long = "socks-pass", id = "socks_password")]
    pub password: Option<String>,
}

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "HTTP proxy with Shadowsocksr / SOCKS5 / direct outbound",
    long_about = "ssrhp accepts HTTP proxy clients (CONNECT tunnels and plain HTTP with keep-alive) and reaches targets directly, through an upstream SOCKS5 proxy, or over a Shadowsocksr tunnel.\n\nSSR ciphers: none, aes-128-cfb, aes-192-cfb, aes-256-cfb\nSSR obfs: plain, http_simple, http_post\nSSR protocols: origin, auth_aes128_md5, auth_aes128_sha1\n"
)]
pub struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8188)]
    pub port: u16,

    /// IP address to bind the server
    #[arg(long, default_value = "127.0.0.1")]
    pub listen_ip: IpAddr,

    /// Outbound strategy
    #[arg(long, value_enum, default_value_t = OutboundKind::Direct)]
    pub outbound: OutboundKind,

    #[command(flatten)]
    pub ssr: SsrArgs,

    #[command(flatten)]
    pub socks: SocksArgs,

    /// Interval seconds to log traffic stats (0 disables)
    #[arg(long = "stats-interval", default_value_t = 60)]
    pub stats_interval: u64,
}

/// Validated outbound settings
#[derive(Debug, Clone)]
pub enum OutboundConfig {
    Direct,
    Ssr(SsrConfig),
    Socks5 { address: String, auth: Option<Auth> },
}

/// Proxy server configuration derived from CLI arguments
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub outbound: OutboundConfig,
    pub stats_interval: Option<Duration>,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Result<Self> {
        let listen_addr = SocketAddr::new(args.listen_ip, args.port);

        let outbound = match args.outbound {
            OutboundKind::Direct => OutboundConfig::Direct,
            OutboundKind::Ssr => OutboundConfig::Ssr(ssr_config(&args.ssr)?),
            OutboundKind::Socks5 => {
                let address = args
                    .socks
                    .address
                    .clone()
                    .ok_or_else(|| eyre!("--outbound socks5 requires --socks-address"))?;
                let auth = match (&args.socks.username, &args.socks.password) {
                    (Some(u), Some(p)) => Some(Auth::new(u.clone(), p.clone())),
                    (None, None) => None,
                    _ => return Err(eyre!("--socks-user and --socks-pass must be given together")),
                };
                OutboundConfig::Socks5 { address, auth }
            }
        };

        let stats_interval = match args.stats_interval {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            listen_addr,
            outbound,
            stats_interval,
        })
    }

    /// Build the outbound strategy the front-end will use for its lifetime.
    pub fn build_dialer(&self) -> Result<Arc<dyn OutboundDialer>> {
        Ok(match &self.outbound {
            OutboundConfig::Direct => Arc::new(DirectDialer),
            OutboundConfig::Ssr(cfg) => {
                Arc::new(ssr::dialer(cfg.clone()).wrap_err("invalid SSR configuration")?)
            }
            OutboundConfig::Socks5 { address, auth } => Arc::new(
                Socks5Dialer::new(address.clone(), auth.clone()).wrap_err("invalid SOCKS5 configuration")?,
            ),
        })
    }
}

fn ssr_config(args: &SsrArgs) -> Result<SsrConfig> {
    let server = args
        .server
        .as_deref()
        .ok_or_else(|| eyre!("--outbound ssr requires --ssr-server"))?;
    let (host, port) = split_host_port(server).wrap_err_with(|| format!("bad --ssr-server {:?}", server))?;

    // names are checked up front so a typo fails at startup
    args.obfs.parse::<ObfsKind>()?;
    args.protocol.parse::<ProtocolKind>()?;

    let mut cfg = SsrConfig::new(host, port, args.method.clone(), args.password.clone());
    cfg.obfs = args.obfs.clone();
    cfg.obfs_param = args.obfs_param.clone();
    cfg.protocol = args.protocol.clone();
    cfg.protocol_param = args.protocol_param.clone();
    cfg.dns_server = args.dns_server;
    cfg.dns_timeout = Duration::from_secs(args.dns_timeout.max(1));

    // cipher name and port are validated by the dialer itself
    ShadowsocksrDialer::new(cfg.clone())?;
    Ok(cfg)
}
