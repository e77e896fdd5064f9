use crate::consensus::ConsensusMode;
use crate::error::ChainError;
use crate::governance::ConsensusParams;
use crate::transaction::{Transaction, TransactionValidator};
use std::collections::HashSet;

use super::chain::Block;
use super::state::{apply_transaction, BalanceJournal, LedgerSnapshot};

/// Validates a block's transactions in order against a working copy of the
/// snapshot balances, so siblings in one block cannot jointly overdraw and a
/// triple cannot appear twice.
pub fn validate_block_transactions(
    transactions: &[Transaction],
    snapshot: &LedgerSnapshot,
    params: &ConsensusParams,
    validator: &TransactionValidator,
) -> Result<(), ChainError> {
    let mut working = snapshot.balances.clone();
    let mut journal = BalanceJournal::new();
    let mut seen = HashSet::with_capacity(transactions.len());

    for (i, tx) in transactions.iter().enumerate() {
        validator.validate_with_params(tx, &snapshot.chain, &working, params)?;
        if !seen.insert(tx.spend_key()) {
            return Err(ChainError::DuplicateTransaction(format!(
                "transaction {} repeats {} -> {} ({}) within the block",
                i, tx.sender, tx.receiver, tx.amount
            )));
        }
        apply_transaction(&mut working, tx, &mut journal)?;
    }
    Ok(())
}

/// Full candidate check against the round's snapshot: continuity, hash,
/// size, reward, proof and transactions.
pub fn validate_candidate(
    candidate: &Block,
    snapshot: &LedgerSnapshot,
    params: &ConsensusParams,
    mode: ConsensusMode,
    validator: &TransactionValidator,
) -> Result<(), ChainError> {
    let tip = snapshot.tip()?;

    if candidate.index != tip.index + 1 {
        return Err(ChainError::ChainContinuityError(format!(
            "expected index {}, got {}",
            tip.index + 1,
            candidate.index
        )));
    }
    if candidate.prev_hash != tip.hash {
        return Err(ChainError::ChainContinuityError(format!(
            "previous hash {} does not match tip {}",
            hex::encode(candidate.prev_hash),
            tip.hash_str()
        )));
    }

    let recomputed = candidate.calculate_hash();
    if recomputed != candidate.hash {
        return Err(ChainError::HashMismatch {
            expected: hex::encode(recomputed),
            found: candidate.hash_str(),
        });
    }

    if candidate.transactions.len() > params.max_block_transactions {
        return Err(ChainError::InvalidBlock(format!(
            "{} transactions exceeds block size {}",
            candidate.transactions.len(),
            params.max_block_transactions
        )));
    }
    if candidate.reward != params.block_reward {
        return Err(ChainError::InvalidBlock(format!(
            "reward {} does not match current block reward {}",
            candidate.reward, params.block_reward
        )));
    }

    match mode {
        ConsensusMode::Work => {
            if !Block::meets_difficulty(&candidate.hash, params.difficulty) {
                return Err(ChainError::InvalidProof(format!(
                    "hash {} does not meet difficulty {}",
                    candidate.hash_str(),
                    params.difficulty
                )));
            }
        }
        ConsensusMode::Stake => {
            // Only eligibility is checked. The lottery draw recorded in the
            // nonce is not replayed, so a producer may name any staker and the
            // stake weighting holds only for honest producers.
            let stake = snapshot.stakes.get(&candidate.proposer).copied().unwrap_or(0);
            if stake == 0 {
                return Err(ChainError::InvalidProof(format!(
                    "proposer {} holds no stake",
                    candidate.proposer
                )));
            }
        }
    }

    validate_block_transactions(&candidate.transactions, snapshot, params, validator)
}
