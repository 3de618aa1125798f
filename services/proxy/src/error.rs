//! Proxy error types.

use std::io;

use hostmux_handoff::HandoffError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// `start`/`run` was called without a default host.
    #[error("default host empty")]
    NoDefault,

    #[error("proxy already running")]
    Running,

    #[error("proxy not running")]
    NotRunning,

    #[error("proxy stopped")]
    Stopped,

    /// The alias belongs to another host.
    #[error("server alias already in use: {0}")]
    AliasInUse(String),

    /// The alias is not assigned to this host.
    #[error("server alias not assigned to this host: {0}")]
    UnknownAlias(String),

    /// The default host cannot stop while the proxy keeps running.
    #[error("host is default")]
    IsDefault,

    #[error("proxy closed")]
    ProxyClosed,

    #[error("host stopped")]
    HostStopped,

    #[error("host belongs to another proxy")]
    ForeignHost,

    #[error("failed to spawn backend {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("handoff error: {0}")]
    Handoff(#[from] HandoffError),

    /// A listener stopped accepting for a reason other than shutdown.
    #[error("listener failed: {0}")]
    Accept(#[source] io::Error),
}
