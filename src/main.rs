use clap::Parser;
use color_eyre::eyre::Result;
use ssr_http_proxy::config::{Cli, OutboundConfig, ProxyConfig};
use ssr_http_proxy::traffic::{human_bytes, TrafficSnapshot};
use ssr_http_proxy::HttpProxyServer;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ssr_http_proxy=info,ssrhp=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    match &config.outbound {
        OutboundConfig::Direct => info!("Outbound: direct"),
        OutboundConfig::Ssr(ssr) => info!("Outbound: SSR server {}:{}", ssr.host, ssr.port),
        OutboundConfig::Socks5 { address, .. } => info!("Outbound: SOCKS5 backend {}", address),
    }

    let dialer = config.build_dialer()?;
    let server = HttpProxyServer::bind(config.listen_addr, dialer).await?;
    info!("HTTP Proxy listening on http://{}", server.local_addr()?);
    let handle = server.handle();

    if let Some(period) = config.stats_interval {
        let handle = handle.clone();
        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            let mut last = TrafficSnapshot::default();
            loop {
                interval.tick().await;
                let now = handle.traffic().snapshot();
                let delta = now.since(&last);
                // only log when something moved or connections are open
                let active = handle.active_connections();
                if delta != TrafficSnapshot::default() || active > 0 {
                    info!(
                        "Traffic: {} up / {} down in last {}s (total {} / {}), {} active",
                        human_bytes(delta.upload),
                        human_bytes(delta.download),
                        period.as_secs(),
                        human_bytes(now.upload),
                        human_bytes(now.download),
                        active
                    );
                }
                last = now;
            }
        });
    }

    let mut accept_loop = tokio::spawn(server.run());

    tokio::select! {
        res = signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("Failed to listen for CTRL+C: {}", e);
            }
            info!("Shutdown signal received");
            handle.close();
            if let Err(e) = (&mut accept_loop).await {
                warn!("Accept loop ended abnormally: {}", e);
            }
        }
        res = &mut accept_loop => {
            if let Err(e) = res {
                warn!("Server loop terminated: {}", e);
            }
        }
    }

    let active = handle.active_connections();
    if active > 0 {
        info!("Waiting for {} connections to close...", active);
        for i in 1..=30 {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            let remaining = handle.active_connections();
            if remaining == 0 {
                info!("All connections closed gracefully");
                break;
            }
            if i % 5 == 0 {
                info!("Still waiting for {} connections... ({}/30s)", remaining, i);
            }
        }
        let final_count = handle.active_connections();
        if final_count > 0 {
            warn!("Forced shutdown with {} connections still active", final_count);
        }
    }
    let total = handle.traffic().snapshot();
    info!(
        "Server shutdown complete ({} up / {} down)",
        human_bytes(total.upload),
        human_bytes(total.download)
    );
    Ok(())
}
