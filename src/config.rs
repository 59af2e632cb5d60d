use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use dockscope_logs::{KEEPALIVE, StreamSettings};
use dockscope_web::MEMBERSHIP_BUFFER;

/// Contents of `dockscope.toml`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub addr: String,

    pub stream: StreamConfig,

    /// Docker engines to serve, each under its own name
    pub hosts: Vec<HostConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub keepalive_secs: u64,

    /// Capacity of label-based membership channels
    pub membership_buffer: usize,

    /// Per-request cap on tailed containers
    pub max_workers: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HostConfig {
    pub name: String,

    /// `unix://` socket or HTTP address; local defaults when absent
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            stream: StreamConfig::default(),
            hosts: vec![HostConfig {
                name: "localhost".to_string(),
                endpoint: None,
            }],
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: KEEPALIVE.as_secs(),
            membership_buffer: MEMBERSHIP_BUFFER,
            max_workers: None,
        }
    }
}

impl Config {
    /// Read the file at `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        if config.hosts.is_empty() {
            anyhow::bail!("at least one host is required");
        }
        Ok(config)
    }

    pub fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            keepalive: Duration::from_secs(self.stream.keepalive_secs.max(1)),
            max_workers: self.stream.max_workers,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/dockscope.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.hosts[0].name, "localhost");
        assert_eq!(config.stream_settings().keepalive, Duration::from_secs(5));
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            addr = "127.0.0.1:9090"

            [stream]
            keepalive_secs = 15
            max_workers = 50

            [[hosts]]
            name = "local"

            [[hosts]]
            name = "edge"
            endpoint = "tcp://10.0.0.5:2375"
            "#,
        )
        .unwrap();

        assert_eq!(config.addr, "127.0.0.1:9090");
        assert_eq!(config.stream.membership_buffer, MEMBERSHIP_BUFFER);
        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.hosts[1].endpoint.as_deref(), Some("tcp://10.0.0.5:2375"));

        let settings = config.stream_settings();
        assert_eq!(settings.keepalive, Duration::from_secs(15));
        assert_eq!(settings.max_workers, Some(50));
    }

    #[test]
    fn test_rejects_empty_host_list() {
        assert!(Config::parse("hosts = []").is_err());
    }
}
