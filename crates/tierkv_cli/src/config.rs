//! YAML configuration for the shell.

use crate::error::CliResult;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tierkv_client::ClientConfig;
use tierkv_core::ClusterConfig;

/// Client settings of the shell.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Address the shell's client identifies itself with.
    pub ip: String,
    /// Milliseconds a request may go unanswered before it is retried.
    pub timeout_ms: u64,
    /// Retries before a request is answered TIMEOUT.
    pub max_retries: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            timeout_ms: 10_000,
            max_retries: 1,
        }
    }
}

/// Complete shell configuration: the cluster plus a `client` section.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Cluster layout started in-process.
    #[serde(flatten)]
    pub cluster: ClusterConfig,
    /// Client settings.
    pub client: ClientSection,
}

impl CliConfig {
    /// Loads a configuration file.
    pub fn load(path: &Path) -> CliResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parses YAML text. An empty document yields the defaults.
    pub fn parse(text: &str) -> CliResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Builds the client configuration; routing addresses are filled in once
    /// the cluster is running.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::new(self.client.ip.clone(), 0)
            .with_timeout(Duration::from_millis(self.client.timeout_ms))
            .with_max_retries(self.client.max_retries)
    }
}
