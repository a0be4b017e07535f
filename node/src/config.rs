use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use bitmessage_core::pow::{NETWORK_EXTRA_BYTES, NETWORK_NONCE_TRIALS_PER_BYTE};
use bitmessage_inventory::AcceptancePolicy;
use bitmessage_network::NetworkConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// TCP port peers connect to.
    pub port: u16,
    /// Target outbound connections per stream.
    pub connection_limit: usize,
    /// Seconds before an outbound connection is recycled.
    pub connection_ttl: u64,
    pub user_agent: String,
    /// Streams this node joins.
    pub streams: Vec<u64>,
    pub network_nonce_trials_per_byte: u64,
    pub network_extra_bytes: u64,
    pub datadir: String,
    /// Accept inbound connections.
    pub listen: bool,
    /// Threads the proof-of-work engine may use; 0 picks the CPU count.
    pub pow_threads: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            port: 8444,
            connection_limit: 8,
            connection_ttl: 30 * 60,
            user_agent: "/bitmessage-rust:0.1.0/".to_string(),
            streams: vec![1],
            network_nonce_trials_per_byte: NETWORK_NONCE_TRIALS_PER_BYTE,
            network_extra_bytes: NETWORK_EXTRA_BYTES,
            datadir: "./data".to_string(),
            listen: true,
            pow_threads: 0,
        }
    }
}

impl NodeConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path))?;
        let config: Self = toml::from_str(&contents).context("parsing config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.streams.is_empty(), "at least one stream is required");
        anyhow::ensure!(self.connection_limit > 0, "connection_limit must be positive");
        Ok(())
    }

    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            port: self.port,
            connection_limit: self.connection_limit,
            connection_ttl: Duration::from_secs(self.connection_ttl),
            user_agent: self.user_agent.clone(),
            streams: self.streams.clone(),
            listen: self.listen,
        }
    }

    pub fn acceptance_policy(&self) -> AcceptancePolicy {
        AcceptancePolicy {
            nonce_trials_per_byte: self.network_nonce_trials_per_byte,
            extra_bytes: self.network_extra_bytes,
        }
    }

    pub fn pow_threads(&self) -> usize {
        if self.pow_threads > 0 {
            return self.pow_threads;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_protocol() {
        let config = NodeConfig::default();
        assert_eq!(config.port, 8444);
        assert_eq!(config.connection_limit, 8);
        assert_eq!(config.connection_ttl, 1800);
        assert_eq!(config.streams, vec![1]);
        assert_eq!(config.network_nonce_trials_per_byte, 1000);
        assert_eq!(config.network_extra_bytes, 1000);
        config.validate().unwrap();
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let parsed: NodeConfig = toml::from_str("port = 9000\nstreams = [1, 2]\n").unwrap();
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.streams, vec![1, 2]);
        assert_eq!(parsed.connection_limit, 8);
    }

    #[test]
    fn empty_streams_are_invalid() {
        let config = NodeConfig {
            streams: vec![],
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
