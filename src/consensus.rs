//! Proof strategies that finalize a drafted block.
//!
//! Both engines are pure with respect to the ledger: they take a draft, the
//! round's parameters and a stake snapshot, and return a sealed block or
//! `Cancelled`. Neither touches `LedgerState`.

use crate::blockchain::chain::hash_with_nonce;
use crate::blockchain::{Block, StakeTable};
use crate::error::ChainError;
use crate::governance::ConsensusParams;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Proof-of-work polls the cancellation token once per this many nonces.
pub const CANCEL_CHECK_INTERVAL: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Work,
    Stake,
}

impl std::fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConsensusMode::Work => write!(f, "proof-of-work"),
            ConsensusMode::Stake => write!(f, "proof-of-stake"),
        }
    }
}

impl std::str::FromStr for ConsensusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "work" | "pow" => Ok(ConsensusMode::Work),
            "stake" | "pos" => Ok(ConsensusMode::Stake),
            other => Err(format!("unknown consensus mode: {}", other)),
        }
    }
}

pub trait ConsensusEngine: Send + Sync {
    fn mode(&self) -> ConsensusMode;

    fn finalize(
        &self,
        draft: Block,
        params: &ConsensusParams,
        stakes: &StakeTable,
        cancel: &CancellationToken,
    ) -> Result<Block, ChainError>;
}

/// Builds the engine for `mode`. A seed makes proof-of-stake draws reproducible.
pub fn engine_for(mode: ConsensusMode, seed: Option<u64>) -> Arc<dyn ConsensusEngine> {
    match mode {
        ConsensusMode::Work => Arc::new(ProofOfWork),
        ConsensusMode::Stake => Arc::new(match seed {
            Some(seed) => ProofOfStake::with_seed(seed),
            None => ProofOfStake::new(),
        }),
    }
}

/// Nonce search until the hash carries `difficulty` leading zero bits.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProofOfWork;

impl ConsensusEngine for ProofOfWork {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::Work
    }

    fn finalize(
        &self,
        mut draft: Block,
        params: &ConsensusParams,
        _stakes: &StakeTable,
        cancel: &CancellationToken,
    ) -> Result<Block, ChainError> {
        let target = Block::hash_to_target(params.difficulty);
        let (prefix, suffix) = draft.hash_parts();

        for nonce in 0..=u64::MAX {
            if nonce % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                debug!(index = draft.index, attempts = nonce, "Proof-of-work cancelled");
                return Err(ChainError::Cancelled);
            }
            let nonce_bytes = nonce.to_be_bytes();
            let hash = hash_with_nonce(&prefix, &nonce_bytes, &suffix);
            if hash <= target {
                draft.nonce = nonce_bytes.to_vec();
                draft.hash = hash;
                debug!(
                    index = draft.index,
                    nonce,
                    hash = %draft.hash_str(),
                    "Proof-of-work found"
                );
                return Ok(draft);
            }
        }

        Err(ChainError::InvalidProof(format!(
            "nonce space exhausted for block {}",
            draft.index
        )))
    }
}

/// Stake-weighted proposer lottery.
pub struct ProofOfStake {
    rng: Mutex<StdRng>,
}

impl ProofOfStake {
    pub fn new() -> Self {
        ProofOfStake {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        ProofOfStake {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for ProofOfStake {
    fn default() -> Self {
        Self::new()
    }
}

/// Draws a stakeholder uniformly and accepts them with probability
/// `stake / effective_supply`, repeating until someone is accepted.
///
/// `effective_supply` is `total_supply` raised to the total stake when the
/// stakes exceed it, which keeps every acceptance probability at most one.
/// Returns the chosen identity and the number of draws taken.
pub fn select_proposer<R: Rng + ?Sized>(
    stakes: &StakeTable,
    total_supply: u64,
    rng: &mut R,
    cancel: &CancellationToken,
) -> Result<(String, u64), ChainError> {
    let eligible: Vec<(&String, u64)> = stakes
        .iter()
        .filter(|(_, weight)| **weight > 0)
        .map(|(id, weight)| (id, *weight))
        .collect();
    if eligible.is_empty() {
        return Err(ChainError::NoEligibleStakeholder);
    }

    let staked = eligible
        .iter()
        .fold(0u64, |acc, (_, weight)| acc.saturating_add(*weight));
    let effective_supply = total_supply.max(staked);

    let mut draws = 0u64;
    loop {
        if cancel.is_cancelled() {
            return Err(ChainError::Cancelled);
        }
        draws += 1;
        let (chosen, weight) = eligible[rng.gen_range(0..eligible.len())];
        if rng.gen_range(0..effective_supply) < weight {
            return Ok((chosen.clone(), draws));
        }
    }
}

impl ConsensusEngine for ProofOfStake {
    fn mode(&self) -> ConsensusMode {
        ConsensusMode::Stake
    }

    fn finalize(
        &self,
        mut draft: Block,
        params: &ConsensusParams,
        stakes: &StakeTable,
        cancel: &CancellationToken,
    ) -> Result<Block, ChainError> {
        let (proposer, draws) = {
            let mut rng = self.rng.lock();
            select_proposer(stakes, params.total_supply, &mut *rng, cancel)?
        };
        debug!(index = draft.index, proposer = %proposer, draws, "Proof-of-stake proposer selected");

        draft.proposer = proposer;
        draft.nonce = draws.to_be_bytes().to_vec();
        draft.seal();
        Ok(draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{leading_zero_bits, BlockFactory};

    fn params(difficulty: u32, total_supply: u64) -> ConsensusParams {
        ConsensusParams {
            difficulty,
            total_supply,
            ..ConsensusParams::default()
        }
    }

    fn draft() -> Block {
        let factory = BlockFactory::new(ConsensusParams::default().into_shared());
        factory.create_block(&Block::genesis(0), Vec::new(), "miner")
    }

    fn stakes(entries: &[(&str, u64)]) -> StakeTable {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_proof_of_work_meets_difficulty() {
        let block = ProofOfWork
            .finalize(draft(), &params(10, 0), &StakeTable::new(), &CancellationToken::new())
            .unwrap();
        assert!(leading_zero_bits(&block.hash) >= 10);
        assert!(block.has_valid_hash());
        assert_eq!(block.nonce.len(), 8);
    }

    #[test]
    fn test_proof_of_work_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = ProofOfWork.finalize(draft(), &params(255, 0), &StakeTable::new(), &cancel);
        assert_eq!(result.unwrap_err(), ChainError::Cancelled);
    }

    #[test]
    fn test_proof_of_work_cancelled_from_another_thread() {
        let cancel = CancellationToken::new();
        let remote = cancel.clone();
        let handle = std::thread::spawn(move || {
            ProofOfWork.finalize(draft(), &params(255, 0), &StakeTable::new(), &remote)
        });
        std::thread::sleep(std::time::Duration::from_millis(20));
        cancel.cancel();
        assert_eq!(handle.join().unwrap().unwrap_err(), ChainError::Cancelled);
    }

    #[test]
    fn test_proof_of_stake_empty_table() {
        let result = ProofOfStake::with_seed(1).finalize(
            draft(),
            &params(0, 100),
            &StakeTable::new(),
            &CancellationToken::new(),
        );
        assert_eq!(result.unwrap_err(), ChainError::NoEligibleStakeholder);
    }

    #[test]
    fn test_proof_of_stake_zero_weights() {
        let mut rng = StdRng::seed_from_u64(3);
        let result = select_proposer(&stakes(&[("a", 0), ("b", 0)]), 100, &mut rng, &CancellationToken::new());
        assert_eq!(result.unwrap_err(), ChainError::NoEligibleStakeholder);
    }

    #[test]
    fn test_proof_of_stake_records_proposer() {
        let table = stakes(&[("only", 5)]);
        let block = ProofOfStake::with_seed(9)
            .finalize(draft(), &params(0, 10), &table, &CancellationToken::new())
            .unwrap();
        assert_eq!(block.proposer, "only");
        assert!(block.has_valid_hash());
    }

    #[test]
    fn test_stake_above_supply_still_terminates() {
        let mut rng = StdRng::seed_from_u64(5);
        let (chosen, draws) =
            select_proposer(&stakes(&[("whale", 500)]), 100, &mut rng, &CancellationToken::new()).unwrap();
        assert_eq!(chosen, "whale");
        assert_eq!(draws, 1);
    }

    #[test]
    fn test_stake_weighted_selection_frequency() {
        let table = stakes(&[("A", 70), ("B", 30)]);
        let mut rng = StdRng::seed_from_u64(42);
        let cancel = CancellationToken::new();

        let rounds = 10_000;
        let mut a_wins = 0;
        for _ in 0..rounds {
            let (chosen, _) = select_proposer(&table, 100, &mut rng, &cancel).unwrap();
            if chosen == "A" {
                a_wins += 1;
            }
        }
        let b_wins = rounds - a_wins;

        // Expected 7000 with standard deviation ~46; allow well over 6 sigma.
        assert!(a_wins > b_wins);
        assert!((6_700..=7_300).contains(&a_wins), "A selected {} times", a_wins);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("work".parse::<ConsensusMode>(), Ok(ConsensusMode::Work));
        assert_eq!("PoS".parse::<ConsensusMode>(), Ok(ConsensusMode::Stake));
        assert!("shards".parse::<ConsensusMode>().is_err());
    }

    #[test]
    fn test_engine_for_mode() {
        assert_eq!(engine_for(ConsensusMode::Work, None).mode(), ConsensusMode::Work);
        assert_eq!(engine_for(ConsensusMode::Stake, Some(1)).mode(), ConsensusMode::Stake);
    }
}
