//! Forwarder configuration.

/// Forwarder configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Where connections from the HTTP channel go.
    pub http_target: String,

    /// Where connections from the HTTPS channel go.
    pub https_target: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let http_target = lookup("HOSTMUX_FORWARD_HTTP")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "127.0.0.1:8080".to_string());

        let https_target = lookup("HOSTMUX_FORWARD_HTTPS")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "127.0.0.1:8443".to_string());

        let log_level = lookup("HOSTMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Self {
            http_target,
            https_target,
            log_level,
        }
    }
}
