//! Socket handoff between the hostmux proxy and its backend processes.
//!
//! The proxy peeks at the start of a client connection, then passes the
//! live socket to a backend over a private Unix socket pair. One handoff
//! on the wire is:
//!
//! ```text
//! sendmsg([len: u32 LE], SCM_RIGHTS[fd])  then  write(prefix[len])
//! ```
//!
//! where `prefix` holds the bytes the proxy already consumed. The backend
//! replays `prefix` before reading from the socket itself.
//!
//! - Proxy side: [`TransferChannel`]
//! - Backend side: [`ProxyListener`], [`ProxiedStream`], [`ProxyServer`]

mod channel;
mod error;
mod listener;
mod server;
mod tracker;

pub use channel::{HandoffSource, TransferChannel};
pub use error::HandoffError;
pub use listener::{ProxiedStream, ProxyListener};
pub use server::ProxyServer;
pub use tracker::{ConnectionGuard, ConnectionTracker};

/// Upper bound on bytes the proxy may consume before handing off (8KB).
///
/// Shared by both sniffers and by the backend's prefix length check.
pub const MAX_HEADER_SIZE: usize = 8192;

/// Environment variable naming the inherited descriptor of the HTTP channel.
pub const HTTP_SOCKET_ENV: &str = "HOSTMUX_HTTP_SOCKET";

/// Environment variable naming the inherited descriptor of the HTTPS channel.
pub const HTTPS_SOCKET_ENV: &str = "HOSTMUX_HTTPS_SOCKET";

/// Which proxy listener a channel (and every connection on it) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// Plaintext HTTP, routed by the `Host` header.
    Http,
    /// TLS, routed by the ClientHello SNI.
    Https,
}

impl ChannelKind {
    /// Environment variable a backend reads to find this channel.
    pub fn env_var(self) -> &'static str {
        match self {
            ChannelKind::Http => HTTP_SOCKET_ENV,
            ChannelKind::Https => HTTPS_SOCKET_ENV,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Http => "http",
            ChannelKind::Https => "https",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
