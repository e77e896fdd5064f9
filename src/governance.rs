//! Consensus parameters and the governance collaborator's write path.
//!
//! Parameters live behind a shared lock. The arbiter copies them at the start
//! of every round, so an update lands on the next round and never mid-round.

use crate::error::ChainError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

pub const PARAM_DIFFICULTY: &str = "difficulty";
pub const PARAM_REWARD: &str = "reward";
pub const PARAM_SUPPLY: &str = "supply";
pub const PARAM_BLOCK_SIZE: &str = "blockSize";

pub const FEATURE_CUSTOM: &str = "custom";

const KNOWN_FEATURES: &[&str] = &[FEATURE_CUSTOM];

/// A SHA-256 digest has 256 bits, so no hash can have more leading zeros.
pub const MAX_DIFFICULTY_BITS: u32 = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Required leading zero bits for proof-of-work.
    pub difficulty: u32,
    pub block_reward: u64,
    /// Denominator of the proof-of-stake acceptance probability.
    pub total_supply: u64,
    pub max_block_transactions: usize,
    pub features: BTreeSet<String>,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        ConsensusParams {
            difficulty: 16,
            block_reward: 50,
            total_supply: 1_000_000,
            max_block_transactions: 10,
            features: BTreeSet::new(),
        }
    }
}

impl ConsensusParams {
    pub fn feature_enabled(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn into_shared(self) -> SharedParams {
        Arc::new(RwLock::new(self))
    }
}

pub type SharedParams = Arc<RwLock<ConsensusParams>>;

#[derive(Clone)]
pub struct Governance {
    params: SharedParams,
}

impl Governance {
    pub fn new(params: SharedParams) -> Self {
        Governance { params }
    }

    pub fn params(&self) -> ConsensusParams {
        self.params.read().clone()
    }

    /// Applies a named parameter update. Values must be non-negative.
    pub fn update_parameter(&self, name: &str, value: i64) -> Result<(), ChainError> {
        if value < 0 {
            return Err(ChainError::GovernanceError(format!(
                "{} must be non-negative, got {}",
                name, value
            )));
        }
        let value = value as u64;

        let mut params = self.params.write();
        match name {
            PARAM_DIFFICULTY => {
                if value > MAX_DIFFICULTY_BITS as u64 {
                    return Err(ChainError::GovernanceError(format!(
                        "difficulty {} exceeds {} bits",
                        value, MAX_DIFFICULTY_BITS
                    )));
                }
                params.difficulty = value as u32;
            }
            PARAM_REWARD => params.block_reward = value,
            PARAM_SUPPLY => params.total_supply = value,
            PARAM_BLOCK_SIZE => {
                if value == 0 {
                    return Err(ChainError::GovernanceError(
                        "blockSize must be at least 1".to_string(),
                    ));
                }
                params.max_block_transactions = value as usize;
            }
            other => {
                return Err(ChainError::GovernanceError(format!(
                    "invalid parameter: {}",
                    other
                )))
            }
        }

        info!(parameter = name, value, "Updated consensus parameter");
        Ok(())
    }

    /// Enables a named transaction feature.
    pub fn add_feature(&self, feature: &str) -> Result<(), ChainError> {
        if !KNOWN_FEATURES.contains(&feature) {
            return Err(ChainError::GovernanceError(format!(
                "unknown feature: {}",
                feature
            )));
        }
        let mut params = self.params.write();
        if !params.features.insert(feature.to_string()) {
            return Err(ChainError::GovernanceError(format!(
                "feature already exists: {}",
                feature
            )));
        }
        info!(feature, "Added feature");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governance() -> Governance {
        Governance::new(ConsensusParams::default().into_shared())
    }

    #[test]
    fn test_update_known_parameters() {
        let gov = governance();
        gov.update_parameter(PARAM_DIFFICULTY, 4).unwrap();
        gov.update_parameter(PARAM_REWARD, 75).unwrap();
        gov.update_parameter(PARAM_SUPPLY, 500).unwrap();
        gov.update_parameter(PARAM_BLOCK_SIZE, 3).unwrap();

        let params = gov.params();
        assert_eq!(params.difficulty, 4);
        assert_eq!(params.block_reward, 75);
        assert_eq!(params.total_supply, 500);
        assert_eq!(params.max_block_transactions, 3);
    }

    #[test]
    fn test_update_rejects_unknown_and_negative() {
        let gov = governance();
        assert!(matches!(
            gov.update_parameter("shards", 10),
            Err(ChainError::GovernanceError(_))
        ));
        assert!(gov.update_parameter(PARAM_REWARD, -1).is_err());
        assert!(gov.update_parameter(PARAM_DIFFICULTY, 257).is_err());
        assert!(gov.update_parameter(PARAM_BLOCK_SIZE, 0).is_err());
        assert_eq!(gov.params(), ConsensusParams::default());
    }

    #[test]
    fn test_updates_visible_through_shared_handle() {
        let shared = ConsensusParams::default().into_shared();
        let gov = Governance::new(shared.clone());
        gov.update_parameter(PARAM_REWARD, 10).unwrap();
        assert_eq!(shared.read().block_reward, 10);
    }

    #[test]
    fn test_add_feature_once() {
        let gov = governance();
        assert!(!gov.params().feature_enabled(FEATURE_CUSTOM));
        gov.add_feature(FEATURE_CUSTOM).unwrap();
        assert!(gov.params().feature_enabled(FEATURE_CUSTOM));
        assert!(gov.add_feature(FEATURE_CUSTOM).is_err());
        assert!(gov.add_feature("teleport").is_err());
    }
}
