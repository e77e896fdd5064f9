//! Configuration management for KiwiChain

use crate::consensus::ConsensusMode;
use crate::error::{ChainError, Result};
use crate::governance::{ConsensusParams, FEATURE_CUSTOM, MAX_DIFFICULTY_BITS};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub consensus: ConsensusConfig,
    #[serde(default)]
    pub arbiter: ArbiterConfig,
    #[serde(default)]
    pub genesis: GenesisConfig,
    #[serde(default)]
    pub node: NodeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusConfig {
    #[serde(default = "default_mode")]
    pub mode: ConsensusMode,
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_block_reward")]
    pub block_reward: u64,
    #[serde(default = "default_total_supply")]
    pub total_supply: u64,
    #[serde(default = "default_max_block_transactions")]
    pub max_block_transactions: usize,
    #[serde(default)]
    pub features: Vec<String>,
    /// Seeds the proof-of-stake lottery for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            difficulty: default_difficulty(),
            block_reward: default_block_reward(),
            total_supply: default_total_supply(),
            max_block_transactions: default_max_block_transactions(),
            features: Vec::new(),
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArbiterConfig {
    /// Bound of the submission channel; a full queue makes submitters wait.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_collection_window", with = "humantime_duration")]
    pub collection_window: Duration,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    #[serde(default = "default_round_timeout", with = "humantime_duration")]
    pub round_timeout: Duration,
    #[serde(default = "default_max_commit_retries")]
    pub max_commit_retries: u32,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            collection_window: default_collection_window(),
            max_candidates: default_max_candidates(),
            round_timeout: default_round_timeout(),
            max_commit_retries: default_max_commit_retries(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisConfig {
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub balances: BTreeMap<String, u64>,
    #[serde(default)]
    pub stakes: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_producers")]
    pub producers: usize,
    #[serde(default = "default_rounds")]
    pub rounds: u64,
    #[serde(default = "default_mempool_capacity")]
    pub mempool_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            producers: default_producers(),
            rounds: default_rounds(),
            mempool_capacity: default_mempool_capacity(),
        }
    }
}

fn default_mode() -> ConsensusMode {
    ConsensusMode::Work
}

fn default_difficulty() -> u32 {
    16
}

fn default_block_reward() -> u64 {
    50
}

fn default_total_supply() -> u64 {
    1_000_000
}

fn default_max_block_transactions() -> usize {
    10
}

fn default_queue_capacity() -> usize {
    64
}

fn default_collection_window() -> Duration {
    Duration::from_millis(250)
}

fn default_max_candidates() -> usize {
    16
}

fn default_round_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_commit_retries() -> u32 {
    3
}

fn default_producers() -> usize {
    2
}

fn default_rounds() -> u64 {
    5
}

fn default_mempool_capacity() -> usize {
    1_000
}

/// Durations are written as `"250ms"`, `"5s"` and so on.
mod humantime_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

impl Config {
    /// Parses TOML and validates the result.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let consensus = &self.consensus;
        if consensus.difficulty > MAX_DIFFICULTY_BITS {
            return Err(ChainError::ConfigError(format!(
                "consensus.difficulty must be at most {}, got {}",
                MAX_DIFFICULTY_BITS, consensus.difficulty
            )));
        }
        if consensus.max_block_transactions == 0 {
            return Err(ChainError::ConfigError(
                "consensus.max_block_transactions must be positive".to_string(),
            ));
        }
        if let Some(feature) = consensus.features.iter().find(|f| f.as_str() != FEATURE_CUSTOM) {
            return Err(ChainError::ConfigError(format!("unknown feature {:?}", feature)));
        }
        if consensus.mode == ConsensusMode::Stake && self.genesis.stakes.values().all(|w| *w == 0) {
            return Err(ChainError::ConfigError(
                "stake mode needs at least one genesis stake".to_string(),
            ));
        }

        let arbiter = &self.arbiter;
        if arbiter.queue_capacity == 0 {
            return Err(ChainError::ConfigError("arbiter.queue_capacity must be positive".to_string()));
        }
        if arbiter.max_candidates == 0 {
            return Err(ChainError::ConfigError("arbiter.max_candidates must be positive".to_string()));
        }
        if arbiter.round_timeout.is_zero() {
            return Err(ChainError::ConfigError("arbiter.round_timeout must be positive".to_string()));
        }
        if arbiter.collection_window >= arbiter.round_timeout {
            return Err(ChainError::ConfigError(format!(
                "arbiter.collection_window ({}) must be shorter than arbiter.round_timeout ({})",
                humantime::format_duration(arbiter.collection_window),
                humantime::format_duration(arbiter.round_timeout)
            )));
        }

        if self.node.mempool_capacity == 0 {
            return Err(ChainError::ConfigError("node.mempool_capacity must be positive".to_string()));
        }
        Ok(())
    }

    pub fn to_params(&self) -> ConsensusParams {
        ConsensusParams {
            difficulty: self.consensus.difficulty,
            block_reward: self.consensus.block_reward,
            total_supply: self.consensus.total_supply,
            max_block_transactions: self.consensus.max_block_transactions,
            features: self.consensus.features.iter().cloned().collect::<BTreeSet<_>>(),
        }
    }
}

/// Loads `path`, falling back to defaults when the file does not exist.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        let config = Config::default();
        config.validate()?;
        return Ok(config);
    }
    let source = fs::read_to_string(path)?;
    Config::from_toml(&source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.consensus.mode, ConsensusMode::Work);
        assert_eq!(config.arbiter.collection_window, Duration::from_millis(250));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[consensus]
mode = "stake"
seed = 7
features = ["custom"]

[arbiter]
collection_window = "40ms"
round_timeout = "2s"

[genesis.balances]
alice = 100

[genesis.stakes]
alice = 70
bob = 30
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.consensus.mode, ConsensusMode::Stake);
        assert_eq!(config.consensus.seed, Some(7));
        assert_eq!(config.consensus.difficulty, 16);
        assert_eq!(config.arbiter.collection_window, Duration::from_millis(40));
        assert_eq!(config.arbiter.round_timeout, Duration::from_secs(2));
        assert_eq!(config.arbiter.queue_capacity, 64);
        assert_eq!(config.genesis.stakes["bob"], 30);
        assert!(config.to_params().feature_enabled(FEATURE_CUSTOM));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = Config::from_toml("[consensus]\ndifficulty = 300\n").unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));

        let err = Config::from_toml("[arbiter]\nqueue_capacity = 0\n").unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));

        let err = Config::from_toml("[consensus]\nmode = \"stake\"\n").unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));

        let err = Config::from_toml("[consensus]\nfeatures = [\"shards\"]\n").unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));
    }

    #[test]
    fn test_window_must_be_shorter_than_round_timeout() {
        let source = "[arbiter]\ncollection_window = \"200ms\"\nround_timeout = \"200ms\"\n";
        let err = Config::from_toml(source).unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));

        let config = Config::from_toml("[arbiter]\ncollection_window = \"199ms\"\nround_timeout = \"200ms\"\n").unwrap();
        assert_eq!(config.arbiter.collection_window, Duration::from_millis(199));
    }

    #[test]
    fn test_bad_duration_is_parse_error() {
        let err = Config::from_toml("[arbiter]\nround_timeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ChainError::ConfigError(_)));
    }
}
