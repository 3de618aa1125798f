//! Relaying handed-off connections.

use std::io;
use std::time::Duration;

use hostmux_handoff::{HandoffError, ProxiedStream, ProxyListener};
use tokio::net::TcpStream;
use tracing::{debug, info, warn, Instrument};

/// Delay before receiving again after a transient handoff error.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Relay every connection handed over on `listener` to `target`.
///
/// Returns `Ok(())` once the proxy closes the channel. Connections already
/// being relayed keep going.
pub async fn run_channel(listener: ProxyListener, target: String) -> Result<(), HandoffError> {
    let kind = listener.kind();
    info!(channel = %kind, target = %target, "Forwarding handoff channel");

    loop {
        match listener.accept().await {
            Ok(conn) => {
                let peer = conn.peer_addr().ok();
                let target = target.clone();
                tokio::spawn(
                    async move {
                        match forward(conn, &target).await {
                            Ok((sent, received)) => {
                                debug!(sent, received, "Connection finished")
                            }
                            Err(e) => warn!(error = %e, "Forwarding failed"),
                        }
                    }
                    .instrument(tracing::info_span!("connection", peer = ?peer, channel = %kind)),
                );
            }
            Err(HandoffError::Closed) => {
                info!(channel = %kind, "Proxy closed handoff channel");
                return Ok(());
            }
            // The listener has dropped the channel.
            Err(e @ (HandoffError::InvalidDescriptorCount(_) | HandoffError::InvalidLength(_))) => {
                return Err(e);
            }
            Err(e) => {
                warn!(channel = %kind, error = %e, "Failed to receive handoff");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Connect to `target` and copy both ways until either side is done.
///
/// The proxy's prefix is read out of `conn` first, so it reaches `target`
/// ahead of anything else. Returns the bytes sent to and received from
/// `target`.
pub async fn forward(mut conn: ProxiedStream, target: &str) -> io::Result<(u64, u64)> {
    let mut upstream = TcpStream::connect(target).await?;
    tokio::io::copy_bidirectional(&mut conn, &mut upstream).await
}
