//! hostmux-forward
//!
//! Runs as a hostmux backend and relays every handed-off connection to a
//! TCP server that knows nothing about handoffs.

use anyhow::Result;
use hostmux_forward::{run_channel, Config};
use hostmux_handoff::{ChannelKind, HandoffError, ProxyListener};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env();

    // Initialize tracing (prefer RUST_LOG, fallback to HOSTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        http_target = %config.http_target,
        https_target = %config.https_target,
        "Starting hostmux-forward"
    );

    let mut channels = JoinSet::new();
    for (kind, target) in [
        (ChannelKind::Http, &config.http_target),
        (ChannelKind::Https, &config.https_target),
    ] {
        if let Some(listener) = ProxyListener::from_env(kind)? {
            channels.spawn(run_channel(listener, target.clone()));
        }
    }
    if channels.is_empty() {
        return Err(HandoffError::NoSocket.into());
    }

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
                break;
            }
            joined = channels.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!(error = %e, "Handoff channel failed");
                    return Err(e.into());
                }
                Some(Err(e)) => return Err(e.into()),
                None => {
                    info!("All handoff channels closed");
                    break;
                }
            },
        }
    }

    info!("hostmux-forward shutdown complete");
    Ok(())
}
