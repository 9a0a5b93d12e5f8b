use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::{read_request, read_response, relay_body, BodyLength, HttpProxyError, HttpResult};
use crate::connection::ActiveConnections;
use crate::forward::forward;
use crate::outbound::OutboundDialer;
use crate::traffic::TrafficCounters;

/// Reply to a successful CONNECT, byte for byte
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// HTTP proxy listener bound to one outbound-dial strategy for its lifetime.
pub struct HttpProxyServer {
    listener: TcpListener,
    dialer: Arc<dyn OutboundDialer>,
    handle: ServerHandle,
}

/// Control and statistics handle for a running [`HttpProxyServer`].
#[derive(Clone)]
pub struct ServerHandle {
    cancel: CancellationToken,
    traffic: Arc<TrafficCounters>,
    active: ActiveConnections,
}

impl ServerHandle {
    /// Stop accepting. Connections already being served run to completion.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Aggregate bytes relayed by all connections
    pub fn traffic(&self) -> &Arc<TrafficCounters> {
        &self.traffic
    }

    pub fn active_connections(&self) -> usize {
        self.active.get()
    }
}

impl HttpProxyServer {
    pub async fn bind(addr: SocketAddr, dialer: Arc<dyn OutboundDialer>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dialer,
            handle: ServerHandle {
                cancel: CancellationToken::new(),
                traffic: Arc::new(TrafficCounters::default()),
                active: ActiveConnections::new(),
            },
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Accept loop. Returns once [`ServerHandle::close`] has been called.
    pub async fn run(self) {
        let Self {
            listener,
            dialer,
            handle,
        } = self;
        info!(
            "HTTP proxy listening on {} (outbound: {})",
            listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            dialer.name()
        );

        loop {
            if handle.cancel.is_cancelled() {
                break;
            }
            let accepted = tokio::select! {
                _ = handle.cancel.cancelled() => break,
                res = listener.accept() => res,
            };
            if handle.cancel.is_cancelled() {
                break;
            }

            match accepted {
                Ok((stream, peer_addr)) => {
                    let dialer = dialer.clone();
                    let traffic = handle.traffic.clone();
                    let guard = handle.active.acquire();
                    tokio::task::spawn(async move {
                        let _guard = guard;
                        if let Err(err) = serve_connection(stream, peer_addr, dialer, traffic).await {
                            log_connection_error(peer_addr, &err);
                        }
                    });
                }
                Err(e) => {
                    warn!("Accept error: {} (retrying in {:?})", e, ACCEPT_BACKOFF);
                    if !backoff(&handle.cancel).await {
                        break;
                    }
                }
            }
        }
        info!("HTTP proxy stopped accepting, {} connections still active", handle.active.get());
    }
}

/// Sleep for [`ACCEPT_BACKOFF`]. Returns `false` if the server was closed meanwhile.
async fn backoff(cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

fn is_expected(err: &HttpProxyError) -> bool {
    match err {
        HttpProxyError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        ),
        _ => false,
    }
}

fn log_connection_error(peer_addr: SocketAddr, err: &HttpProxyError) {
    if is_expected(err) {
        debug!("Connection from {} ended: {}", peer_addr, err);
    } else {
        warn!("Connection from {} error: {}", peer_addr, err);
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    dialer: Arc<dyn OutboundDialer>,
    traffic: Arc<TrafficCounters>,
) -> HttpResult<()> {
    let _ = stream.set_nodelay(true);
    let mut client = BufReader::new(stream);

    let Some(mut req) = read_request(&mut client).await? else {
        return Ok(());
    };
    let host = req.host.clone();

    // no error page on dial failure; the client just sees the close
    let upstream = match dialer.dial(&host).await {
        Ok(s) => s,
        Err(e) => {
            warn!("{} -> {}: {} dial failed: {}", peer_addr, host, dialer.name(), e);
            return Ok(());
        }
    };

    if req.is_connect() {
        client.write_all(CONNECT_ESTABLISHED).await?;
        client.flush().await?;
        debug!("{} tunnel to {} established", peer_addr, host);
        // bytes the client pipelined after the CONNECT head sit in the
        // BufReader and are relayed first
        let report = forward(client, upstream, Some(traffic)).await;
        for (direction, e) in &report.errors {
            debug!("{} tunnel to {} {:?} ended: {}", peer_addr, host, direction, e);
        }
        debug!(
            "{} tunnel to {} closed ({} up, {} down)",
            peer_addr, host, report.upload, report.download
        );
        return Ok(());
    }

    let mut upstream = BufReader::new(upstream);
    loop {
        let head = req.encode_outbound();
        upstream.write_all(&head).await?;
        let sent = relay_body(&mut client, &mut upstream, req.body_length()?).await?;
        traffic.add_upload(head.len() as u64 + sent);

        let resp = loop {
            let resp = read_response(&mut upstream).await?;
            if !resp.is_interim() {
                break resp;
            }
            let interim = resp.encode_inbound();
            client.write_all(&interim).await?;
            traffic.add_download(interim.len() as u64);
        };
        let body = resp.body_length(&req.method)?;
        let head = resp.encode_inbound();
        client.write_all(&head).await?;
        traffic.add_download(head.len() as u64);

        // after 101 both sides speak the upgraded protocol
        if resp.status == 101 {
            client.flush().await?;
            debug!("{} {} {} upgraded, relaying raw", peer_addr, req.method, host);
            let report = forward(client, upstream, Some(traffic)).await;
            debug!(
                "{} upgraded stream to {} closed ({} up, {} down)",
                peer_addr, host, report.upload, report.download
            );
            return Ok(());
        }

        let received = relay_body(&mut upstream, &mut client, body).await?;
        traffic.add_download(received);
        debug!("{} {} {} -> {}", peer_addr, req.method, host, resp.status);

        if resp.closes() || !req.keep_alive() || body == BodyLength::UntilEof {
            break;
        }

        let Some(next) = read_request(&mut client).await? else {
            break;
        };
        // one outbound connection serves one host
        if next.host != host || next.is_connect() {
            debug!("{} switched from {} to {}, closing", peer_addr, host, next.host);
            break;
        }
        req = next;
    }

    let _ = upstream.shutdown().await;
    Ok(())
}
