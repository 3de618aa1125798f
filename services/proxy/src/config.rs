//! Proxy configuration.
//!
//! The environment names a JSON site file; the site file lists the
//! listener addresses and one entry per backend.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::host::SpawnSpec;

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the site file.
    pub path: PathBuf,

    pub sites: SiteFile,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("HOSTMUX_CONFIG")
            .map(PathBuf::from)
            .context("Missing site file. Set HOSTMUX_CONFIG to its path.")?;

        let log_level = std::env::var("HOSTMUX_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let sites = SiteFile::load(&path)?;
        Ok(Self {
            path,
            sites,
            log_level,
        })
    }
}

/// Listener addresses and backends.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteFile {
    /// Routed by `Host` header.
    pub http_addr: Option<SocketAddr>,

    /// Routed by TLS SNI.
    pub https_addr: Option<SocketAddr>,

    pub sites: Vec<SiteConfig>,
}

/// One backend and the hostnames it serves.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub name: String,

    /// Receives connections for unknown hostnames.
    #[serde(default)]
    pub default: bool,

    #[serde(default)]
    pub aliases: Vec<String>,

    pub command: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    pub working_dir: Option<PathBuf>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl SiteConfig {
    pub fn spawn_spec(&self) -> SpawnSpec {
        SpawnSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            uid: self.uid,
            gid: self.gid,
        }
    }
}

impl SiteFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read site file {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid site file {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: Self = serde_json::from_str(raw)?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> Result<()> {
        if self.http_addr.is_none() && self.https_addr.is_none() {
            bail!("at least one of http_addr and https_addr is required");
        }
        if self.sites.is_empty() {
            bail!("no sites configured");
        }

        let mut names = HashSet::new();
        for site in &self.sites {
            if site.name.is_empty() {
                bail!("site name must not be empty");
            }
            if !names.insert(site.name.as_str()) {
                bail!("duplicate site name: {}", site.name);
            }
            if site.command.as_os_str().is_empty() {
                bail!("site {} has an empty command", site.name);
            }
        }

        let defaults = self.sites.iter().filter(|site| site.default).count();
        if defaults > 1 {
            bail!("{defaults} sites are marked default, at most one may be");
        }
        Ok(())
    }

    /// The site flagged `default`, otherwise the first one.
    pub fn default_site(&self) -> Option<&SiteConfig> {
        self.sites
            .iter()
            .find(|site| site.default)
            .or_else(|| self.sites.first())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"{
        "http_addr": "127.0.0.1:8080",
        "sites": [
            { "name": "blog", "aliases": ["blog.test"], "command": "/srv/blog" },
            {
                "name": "shop",
                "default": true,
                "aliases": ["shop.test", "www.shop.test"],
                "command": "/srv/shop",
                "args": ["--quiet"],
                "env": { "MODE": "prod" },
                "uid": 1000,
                "gid": 1000
            }
        ]
    }"#;

    #[test]
    fn test_parse_sample() {
        let file = SiteFile::parse(SAMPLE).unwrap();
        assert_eq!(file.http_addr, Some("127.0.0.1:8080".parse().unwrap()));
        assert!(file.https_addr.is_none());
        assert_eq!(file.sites.len(), 2);
        assert_eq!(file.default_site().unwrap().name, "shop");

        let spec = file.sites[1].spawn_spec();
        assert_eq!(spec.name, "shop");
        assert_eq!(spec.command, PathBuf::from("/srv/shop"));
        assert_eq!(spec.args, ["--quiet"]);
        assert_eq!(spec.env.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!((spec.uid, spec.gid), (Some(1000), Some(1000)));
    }

    #[test]
    fn test_first_site_is_default_when_none_flagged() {
        let file = SiteFile::parse(
            r#"{ "https_addr": "[::1]:8443", "sites": [
                { "name": "a", "command": "/bin/a" },
                { "name": "b", "command": "/bin/b" }
            ] }"#,
        )
        .unwrap();
        assert_eq!(file.default_site().unwrap().name, "a");
    }

    #[test]
    fn test_rejects_invalid_files() {
        let cases = [
            r#"{ "sites": [ { "name": "a", "command": "/bin/a" } ] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [ { "name": "", "command": "/bin/a" } ] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [ { "name": "a", "command": "" } ] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [
                { "name": "a", "command": "/bin/a" },
                { "name": "a", "command": "/bin/b" } ] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [
                { "name": "a", "command": "/bin/a", "default": true },
                { "name": "b", "command": "/bin/b", "default": true } ] }"#,
            r#"{ "http_addr": "127.0.0.1:80", "sites": [ { "name": "a", "command": "/bin/a", "color": "red" } ] }"#,
            r#"{ "http_addr": "localhost", "sites": [ { "name": "a", "command": "/bin/a" } ] }"#,
        ];
        for raw in cases {
            assert!(SiteFile::parse(raw).is_err(), "accepted: {raw}");
        }
    }

    #[test]
    fn test_load_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();

        let err = SiteFile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("invalid site file"));

        let missing = file.path().with_extension("missing");
        let err = SiteFile::load(&missing).unwrap_err();
        assert!(err.to_string().contains("failed to read site file"));
    }
}
