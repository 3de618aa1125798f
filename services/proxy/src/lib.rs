//! hostmux proxy
//!
//! Accepts HTTP and HTTPS connections, reads just enough of each one to
//! learn the requested hostname (`Host` header or TLS SNI) and hands the
//! live socket plus the bytes already read to the backend process serving
//! that hostname. The proxy never sees request bodies and never decrypts.

pub mod config;
pub mod error;
pub mod host;
pub mod proxy;
pub mod router;
pub mod sniff;

pub use error::ProxyError;
pub use host::{Host, SpawnSpec};
pub use hostmux_handoff::{ChannelKind, MAX_HEADER_SIZE};
pub use proxy::{ListenerStats, Proxy, BAD_REQUEST, HEADERS_TOO_LARGE};
pub use sniff::{sniff_http, sniff_tls, SniffError, Sniffed};
