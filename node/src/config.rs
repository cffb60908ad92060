//! Node configuration, loaded from a TOML file with per-field defaults.

use anyhow::{Context, Result};
use lipchain_chain::GenesisAlloc;
use lipchain_types::{Address, ChainConfig, IpRange};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSection,
    pub chain: ChainSection,
    pub consensus: ConsensusSection,
    pub genesis: Vec<GenesisEntry>,
    pub log: LogSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    pub data_dir: PathBuf,
    pub key_file: PathBuf,
    /// Environment variable holding the keystore passphrase.
    pub passphrase_env: String,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainSection {
    pub initial_nonce: u64,
    pub genesis_timestamp: u64,
    pub time_queue_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusSection {
    /// This validator's DKG index.
    pub validator_id: u64,
    /// Shares needed to reconstruct the group signature.
    pub threshold: usize,
    /// DKG indices of the full validator set.
    pub validator_ids: Vec<u64>,
    /// Seconds before an incomplete DKG round is abandoned and re-dealt.
    pub dkg_timeout_secs: u64,
}

/// One genesis allocation as written in the config file; ranges are CIDR
/// strings for readability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisEntry {
    pub address: String,
    pub ranges: Vec<String>,
    #[serde(default)]
    pub map_server: Option<Ipv4Addr>,
    #[serde(default)]
    pub locator: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node: NodeSection::default(),
            chain: ChainSection::default(),
            consensus: ConsensusSection::default(),
            genesis: Vec::new(),
            log: LogSection::default(),
        }
    }
}

impl Default for NodeSection {
    fn default() -> Self {
        NodeSection {
            data_dir: PathBuf::from("data"),
            key_file: PathBuf::from("data/node.key"),
            passphrase_env: "LIPCHAIN_PASSPHRASE".to_string(),
            poll_interval_ms: 500,
        }
    }
}

impl Default for ChainSection {
    fn default() -> Self {
        let defaults = ChainConfig::default();
        ChainSection {
            initial_nonce: defaults.initial_nonce,
            genesis_timestamp: defaults.genesis_timestamp,
            time_queue_interval_secs: defaults.time_queue_interval_secs,
        }
    }
}

impl Default for ConsensusSection {
    fn default() -> Self {
        ConsensusSection {
            validator_id: 0,
            threshold: 1,
            validator_ids: Vec::new(),
            dkg_timeout_secs: 60,
        }
    }
}

impl Default for LogSection {
    fn default() -> Self {
        LogSection {
            level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from a TOML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(NodeConfig::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            initial_nonce: self.chain.initial_nonce,
            genesis_timestamp: self.chain.genesis_timestamp,
            time_queue_interval_secs: self.chain.time_queue_interval_secs,
        }
    }

    /// Resolve the CIDR-notation genesis entries into allocations.
    pub fn genesis_allocs(&self) -> Result<Vec<GenesisAlloc>> {
        let mut allocs = Vec::with_capacity(self.genesis.len());
        for entry in &self.genesis {
            let address = Address::from_str(&entry.address)
                .with_context(|| format!("genesis address {}", entry.address))?;
            let mut ranges = Vec::with_capacity(entry.ranges.len());
            for cidr in &entry.ranges {
                ranges.push(
                    IpRange::from_cidr(cidr).with_context(|| format!("genesis range {cidr}"))?,
                );
            }
            let mut alloc = GenesisAlloc::new(address, ranges);
            alloc.map_server = entry.map_server;
            alloc.locator = entry.locator;
            allocs.push(alloc);
        }
        Ok(allocs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let config = NodeConfig::load(Path::new("/nonexistent/lipchain.toml")).unwrap();
        assert_eq!(config.node.poll_interval_ms, 500);
        assert_eq!(config.consensus.threshold, 1);
        assert!(config.genesis.is_empty());
    }

    #[test]
    fn parses_genesis_entries() {
        let raw = r#"
            [node]
            poll_interval_ms = 100

            [consensus]
            validator_id = 2
            threshold = 3
            validator_ids = [1, 2, 3, 4]

            [[genesis]]
            address = "0x0101010101010101010101010101010101010101"
            ranges = ["10.0.0.0/24", "192.168.0.0/16"]
            map_server = "10.1.1.1"
        "#;
        let config: NodeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.node.poll_interval_ms, 100);
        assert_eq!(config.consensus.validator_ids, vec![1, 2, 3, 4]);

        let allocs = config.genesis_allocs().unwrap();
        assert_eq!(allocs.len(), 1);
        assert_eq!(allocs[0].ranges.len(), 2);
        assert_eq!(allocs[0].map_server, Some("10.1.1.1".parse().unwrap()));
        assert_eq!(allocs[0].address, Address([1u8; 20]));
    }

    #[test]
    fn bad_genesis_range_is_an_error() {
        let config = NodeConfig {
            genesis: vec![GenesisEntry {
                address: "0x0101010101010101010101010101010101010101".to_string(),
                ranges: vec!["10.0.0.0/40".to_string()],
                map_server: None,
                locator: None,
            }],
            ..NodeConfig::default()
        };
        assert!(config.genesis_allocs().is_err());
    }
}
