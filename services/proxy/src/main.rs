//! hostmux
//!
//! Hostname routing front end for a set of backend processes.
//!
//! This service:
//! - Binds the HTTP and HTTPS listeners from the site file
//! - Starts one backend process per site
//! - Routes each connection by `Host` header or TLS SNI
//! - Hands the socket and the bytes read so far to the backend

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use hostmux_proxy::config::{Config, SiteFile};
use hostmux_proxy::{ChannelKind, Proxy};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting hostmux");
    info!(
        path = %config.path.display(),
        site_count = config.sites.sites.len(),
        "Configuration loaded"
    );

    let http = bind(config.sites.http_addr, ChannelKind::Http).await;
    let https = bind(config.sites.https_addr, ChannelKind::Https).await;
    if http.is_none() && https.is_none() {
        bail!("no listener could be bound");
    }

    let proxy = Proxy::new(http, https);
    start_sites(&proxy, &config.sites);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::spawn({
        let proxy = proxy.clone();
        async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
            if let Err(e) = proxy.close().await {
                warn!(error = %e, "Failed to close proxy");
            }
        }
    });

    let result = proxy.run().await;
    if let Err(e) = &result {
        error!(error = %e, "Proxy stopped with error");
        // Stops the hosts; fails harmlessly if a signal already closed it.
        let _ = proxy.close().await;
    }
    result.context("proxy failed")?;

    info!("hostmux shutdown complete");
    Ok(())
}

/// Bind `addr` if configured. A failure is logged and the listener skipped.
async fn bind(addr: Option<SocketAddr>, kind: ChannelKind) -> Option<TcpListener> {
    let addr = addr?;
    match TcpListener::bind(addr).await {
        Ok(listener) => {
            info!(listener = %kind, bind_addr = %addr, "Listener bound");
            Some(listener)
        }
        Err(e) => {
            error!(listener = %kind, bind_addr = %addr, error = %e, "Failed to bind listener");
            None
        }
    }
}

/// Start a host per site. A site that fails is logged and left out.
fn start_sites(proxy: &Proxy, sites: &SiteFile) {
    let default_name = sites.default_site().map(|site| site.name.as_str());

    for site in &sites.sites {
        let host = match proxy.new_host(site.spawn_spec()) {
            Ok(host) => host,
            Err(e) => {
                error!(site = %site.name, error = %e, "Failed to start site");
                continue;
            }
        };

        if let Err(e) = host.add_aliases(&site.aliases) {
            warn!(site = %site.name, error = %e, "Failed to register aliases");
        }
        if Some(site.name.as_str()) == default_name {
            if let Err(e) = proxy.set_default(&host) {
                error!(site = %site.name, error = %e, "Failed to set default site");
            }
        }
    }
}
