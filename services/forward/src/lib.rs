//! hostmux forward
//!
//! A backend for servers that cannot take handoffs themselves. Every
//! connection handed over by the proxy is relayed to a fixed TCP address,
//! starting with the bytes the proxy already read.

pub mod config;
mod relay;

pub use config::Config;
pub use relay::{forward, run_channel};
