use crate::contract::ContractExecutor;
use crate::error::ChainError;
use crate::transaction::{CustomOpKind, Transaction};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::chain::{Block, Sha256Hash};

pub type BalanceTable = BTreeMap<String, u64>;
pub type StakeTable = BTreeMap<String, u64>;

/// Records every balance change so a partially applied block can be undone
/// by inverting the deltas in reverse order.
#[derive(Debug, Default)]
pub struct BalanceJournal {
    entries: Vec<(String, i128)>,
}

impl BalanceJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn credit(&mut self, balances: &mut BalanceTable, identity: &str, amount: u64) -> Result<(), ChainError> {
        if amount == 0 {
            return Ok(());
        }
        let balance = balances.entry(identity.to_string()).or_insert(0);
        *balance = balance.checked_add(amount).ok_or_else(|| {
            ChainError::InvalidTransaction(format!("balance overflow crediting {}", identity))
        })?;
        self.entries.push((identity.to_string(), amount as i128));
        Ok(())
    }

    /// Fails without touching the table if the debit would go negative.
    pub fn debit(&mut self, balances: &mut BalanceTable, identity: &str, amount: u64) -> Result<(), ChainError> {
        if amount == 0 {
            return Ok(());
        }
        let balance = balances.get(identity).copied().unwrap_or(0);
        if balance < amount {
            return Err(ChainError::InsufficientFunds {
                identity: identity.to_string(),
                balance,
                required: amount,
            });
        }
        balances.insert(identity.to_string(), balance - amount);
        self.entries.push((identity.to_string(), -(amount as i128)));
        Ok(())
    }

    pub fn revert(self, balances: &mut BalanceTable) {
        for (identity, delta) in self.entries.into_iter().rev() {
            let balance = balances.entry(identity).or_insert(0);
            let reverted = *balance as i128 - delta;
            *balance = reverted.clamp(0, u64::MAX as i128) as u64;
        }
    }
}

/// Applies one transaction's balance deltas: sender pays amount, fee and any
/// burn; receiver gets amount; a mint credits the sender.
pub fn apply_transaction(
    balances: &mut BalanceTable,
    tx: &Transaction,
    journal: &mut BalanceJournal,
) -> Result<(), ChainError> {
    let debit = tx
        .total_debit()
        .ok_or_else(|| ChainError::InvalidTransaction("amount overflow".to_string()))?;
    journal.debit(balances, &tx.sender, debit)?;
    journal.credit(balances, &tx.receiver, tx.amount)?;
    if let Some(op) = tx.custom_op() {
        if op.kind == CustomOpKind::Mint {
            journal.credit(balances, &tx.sender, op.amount)?;
        }
    }
    Ok(())
}

/// Read-only copy of the ledger taken at round start. The chain is shared
/// with the ledger until the next commit.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub chain: Arc<Vec<Block>>,
    pub balances: BalanceTable,
    pub stakes: StakeTable,
    /// Bumped on every mutation; a commit only succeeds against the version it validated.
    pub version: u64,
}

impl LedgerSnapshot {
    pub fn tip(&self) -> Result<&Block, ChainError> {
        self.chain
            .last()
            .ok_or_else(|| ChainError::InvariantViolation("ledger has no genesis block".to_string()))
    }

    pub fn balance_of(&self, identity: &str) -> u64 {
        self.balances.get(identity).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { index: u64, hash: Sha256Hash },
    /// The ledger changed since the snapshot the block was validated against.
    StaleSnapshot,
}

#[derive(Debug)]
struct LedgerInner {
    chain: Arc<Vec<Block>>,
    balances: BalanceTable,
    stakes: StakeTable,
    version: u64,
}

/// The committed chain, balances and stake table behind one mutex.
#[derive(Debug)]
pub struct LedgerState {
    inner: Mutex<LedgerInner>,
}

impl LedgerState {
    pub fn new(genesis: Block, balances: BalanceTable, stakes: StakeTable) -> Result<Self, ChainError> {
        if genesis.index != 0 {
            return Err(ChainError::InvalidBlock(format!(
                "Genesis block must have index 0, got {}",
                genesis.index
            )));
        }
        if !genesis.has_valid_hash() {
            return Err(ChainError::HashMismatch {
                expected: hex::encode(genesis.calculate_hash()),
                found: genesis.hash_str(),
            });
        }
        Ok(LedgerState {
            inner: Mutex::new(LedgerInner {
                chain: Arc::new(vec![genesis]),
                balances,
                stakes,
                version: 0,
            }),
        })
    }

    /// Copies the ledger out of the lock; the chain itself is only a
    /// reference count bump. A tip whose stored hash no longer matches its
    /// content is reported as a fatal invariant violation.
    pub fn snapshot(&self) -> Result<LedgerSnapshot, ChainError> {
        let inner = self.inner.lock();
        let snapshot = LedgerSnapshot {
            chain: inner.chain.clone(),
            balances: inner.balances.clone(),
            stakes: inner.stakes.clone(),
            version: inner.version,
        };
        drop(inner);

        let tip = snapshot.tip()?;
        if !tip.has_valid_hash() {
            return Err(ChainError::InvariantViolation(format!(
                "committed block {} has corrupted hash {}",
                tip.index,
                tip.hash_str()
            )));
        }
        Ok(snapshot)
    }

    pub fn chain(&self) -> Vec<Block> {
        let chain = self.inner.lock().chain.clone();
        chain.as_ref().clone()
    }

    pub fn tip(&self) -> Option<Block> {
        self.inner.lock().chain.last().cloned()
    }

    pub fn height(&self) -> u64 {
        self.inner.lock().chain.last().map_or(0, |b| b.index)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().chain.is_empty()
    }

    pub fn balance_of(&self, identity: &str) -> u64 {
        self.inner.lock().balances.get(identity).copied().unwrap_or(0)
    }

    pub fn balances(&self) -> BalanceTable {
        self.inner.lock().balances.clone()
    }

    pub fn stakes(&self) -> StakeTable {
        self.inner.lock().stakes.clone()
    }

    pub fn set_stake(&self, identity: &str, weight: u64) {
        let mut inner = self.inner.lock();
        if weight == 0 {
            inner.stakes.remove(identity);
        } else {
            inner.stakes.insert(identity.to_string(), weight);
        }
        inner.version += 1;
    }

    /// Appends `block` and applies its balance deltas in one critical section.
    ///
    /// The block must have been validated against the snapshot carrying
    /// `expected_version`; if anything changed since, nothing is applied and
    /// `StaleSnapshot` is returned. If applying a transaction fails, every
    /// delta already made is reverted and contract-bearing transactions are
    /// rolled back through `contracts`.
    pub fn commit_block(
        &self,
        block: Block,
        expected_version: u64,
        contracts: &dyn ContractExecutor,
    ) -> Result<CommitOutcome, ChainError> {
        let mut inner = self.inner.lock();
        if inner.version != expected_version {
            return Ok(CommitOutcome::StaleSnapshot);
        }

        let tip = inner
            .chain
            .last()
            .ok_or_else(|| ChainError::InvariantViolation("ledger has no genesis block".to_string()))?;
        if block.index != tip.index + 1 || block.prev_hash != tip.hash {
            return Err(ChainError::ChainContinuityError(format!(
                "block {} does not extend tip {} ({})",
                block.index,
                tip.index,
                tip.hash_str()
            )));
        }

        let inner = &mut *inner;
        let mut journal = BalanceJournal::new();
        let mut applied = 0usize;
        let mut result = Ok(());
        for tx in &block.transactions {
            if let Err(e) = apply_transaction(&mut inner.balances, tx, &mut journal) {
                result = Err(e);
                break;
            }
            applied += 1;
        }
        if result.is_ok() {
            result = block
                .total_fees()
                .and_then(|fees| fees.checked_add(block.reward))
                .ok_or_else(|| ChainError::InvalidBlock("reward overflow".to_string()))
                .and_then(|payout| journal.credit(&mut inner.balances, &block.proposer, payout));
        }

        if let Err(e) = result {
            warn!(
                index = block.index,
                reverted = journal.len(),
                error = %e,
                "Block application failed, reverting balance deltas"
            );
            journal.revert(&mut inner.balances);
            for tx in block.transactions[..applied].iter().rev() {
                if let Some(call) = tx.contract_call() {
                    contracts.rollback(call, tx);
                }
            }
            return Err(e);
        }

        let index = block.index;
        let hash = block.hash;
        Arc::make_mut(&mut inner.chain).push(block);
        inner.version += 1;
        debug!(index, hash = %hex::encode(hash), "Committed block");
        Ok(CommitOutcome::Committed { index, hash })
    }

    /// Checks linkage, hashes and index continuity of the whole chain.
    pub fn verify_chain(&self) -> Result<(), ChainError> {
        let inner = self.inner.lock();
        for (i, block) in inner.chain.iter().enumerate() {
            if !block.has_valid_hash() {
                return Err(ChainError::InvariantViolation(format!(
                    "block {} has corrupted hash",
                    block.index
                )));
            }
            if i > 0 {
                let prev = &inner.chain[i - 1];
                if block.index != prev.index + 1 || block.prev_hash != prev.hash {
                    return Err(ChainError::InvariantViolation(format!(
                        "block {} is not linked to block {}",
                        block.index, prev.index
                    )));
                }
            }
        }
        Ok(())
    }
}
