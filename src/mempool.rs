//! Pending transactions waiting for a producer.
//!
//! - Ordered by fee, highest first, ties by insertion order
//! - Duplicate detection by hash and by spend triple
//! - Hard capacity, refusing new entries when full

use crate::blockchain::{Block, LedgerSnapshot, Sha256Hash};
use crate::error::{ChainError, Result};
use crate::transaction::{SpendKey, Transaction, TransactionValidator};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone)]
struct MempoolEntry {
    tx: Transaction,
    order: (Reverse<u64>, u64),
}

#[derive(Debug)]
pub struct Mempool {
    capacity: usize,
    entries: HashMap<Sha256Hash, MempoolEntry>,
    by_fee: BTreeMap<(Reverse<u64>, u64), Sha256Hash>,
    spends: HashSet<SpendKey>,
    next_seq: u64,
}

impl Mempool {
    pub fn new(capacity: usize) -> Self {
        Mempool {
            capacity,
            entries: HashMap::new(),
            by_fee: BTreeMap::new(),
            spends: HashSet::new(),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn contains(&self, hash: &Sha256Hash) -> bool {
        self.entries.contains_key(hash)
    }

    /// Sum of what the pending transactions of `sender` will debit.
    fn pending_debit(&self, sender: &str) -> u64 {
        self.entries
            .values()
            .filter(|e| e.tx.sender == sender)
            .filter_map(|e| e.tx.total_debit())
            .fold(0u64, u64::saturating_add)
    }

    /// Validates `tx` against the snapshot, net of what the sender already
    /// has pending, and queues it.
    pub fn add(
        &mut self,
        tx: Transaction,
        validator: &TransactionValidator,
        snapshot: &LedgerSnapshot,
    ) -> Result<Sha256Hash> {
        let hash = tx.hash();
        if self.contains(&hash) || self.spends.contains(&tx.spend_key()) {
            return Err(ChainError::DuplicateTransaction(format!(
                "{} -> {} ({}) is already pending",
                tx.sender, tx.receiver, tx.amount
            )));
        }
        if self.is_full() {
            return Err(ChainError::MempoolFull);
        }

        let mut balances = snapshot.balances.clone();
        let pending = self.pending_debit(&tx.sender);
        if let Some(balance) = balances.get_mut(&tx.sender) {
            *balance = balance.saturating_sub(pending);
        }
        validator.validate(&tx, &snapshot.chain, &balances)?;

        let order = (Reverse(tx.fee), self.next_seq);
        self.next_seq += 1;
        self.by_fee.insert(order, hash);
        self.spends.insert(tx.spend_key());
        debug!(tx = %hex::encode(hash), fee = tx.fee, pending = self.entries.len() + 1, "Transaction queued");
        self.entries.insert(hash, MempoolEntry { tx, order });
        Ok(hash)
    }

    /// Up to `limit` transactions, highest fee first. They stay pending until
    /// pruned.
    pub fn take_by_fee(&self, limit: usize) -> Vec<Transaction> {
        self.by_fee
            .values()
            .take(limit)
            .filter_map(|hash| self.entries.get(hash))
            .map(|entry| entry.tx.clone())
            .collect()
    }

    fn remove(&mut self, hash: &Sha256Hash) -> Option<Transaction> {
        let entry = self.entries.remove(hash)?;
        self.by_fee.remove(&entry.order);
        self.spends.remove(&entry.tx.spend_key());
        Some(entry.tx)
    }

    /// Drops every pending transaction whose spend triple `block` committed.
    pub fn prune_committed(&mut self, block: &Block) -> usize {
        let committed: HashSet<SpendKey> = block.transactions.iter().map(Transaction::spend_key).collect();
        let stale: Vec<Sha256Hash> = self
            .entries
            .iter()
            .filter(|(_, e)| committed.contains(&e.tx.spend_key()))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in &stale {
            self.remove(hash);
        }
        stale.len()
    }

    /// Drops everything that no longer validates against `snapshot`, e.g.
    /// transfers that a block from another producer made unaffordable.
    pub fn prune(&mut self, validator: &TransactionValidator, snapshot: &LedgerSnapshot) -> usize {
        let mut balances = snapshot.balances.clone();
        let mut invalid = Vec::new();
        for hash in self.by_fee.values() {
            let Some(entry) = self.entries.get(hash) else {
                continue;
            };
            let tx = &entry.tx;
            match (validator.validate(tx, &snapshot.chain, &balances), tx.total_debit()) {
                (Ok(()), Some(debit)) => {
                    if let Some(balance) = balances.get_mut(&tx.sender) {
                        *balance = balance.saturating_sub(debit);
                    }
                }
                _ => invalid.push(*hash),
            }
        }
        for hash in &invalid {
            self.remove(hash);
        }
        if !invalid.is_empty() {
            debug!(dropped = invalid.len(), remaining = self.len(), "Pruned mempool");
        }
        invalid.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::{BalanceTable, BlockFactory, LedgerState, StakeTable};
    use crate::contract::NoContractRuntime;
    use crate::governance::ConsensusParams;
    use crate::wallet::{EmbeddedKeyDirectory, Wallet};
    use std::sync::Arc;

    fn validator() -> TransactionValidator {
        TransactionValidator::new(
            Arc::new(EmbeddedKeyDirectory),
            Arc::new(NoContractRuntime),
            ConsensusParams::default().into_shared(),
        )
    }

    fn ledger(entries: &[(&Wallet, u64)]) -> LedgerState {
        let balances: BalanceTable = entries.iter().map(|(w, v)| (w.identity(), *v)).collect();
        LedgerState::new(Block::genesis(0), balances, StakeTable::new()).unwrap()
    }

    #[test]
    fn test_take_by_fee_orders_highest_first_then_fifo() {
        let alice = Wallet::generate();
        let snapshot = ledger(&[(&alice, 1_000)]).snapshot().unwrap();
        let validator = validator();
        let mut pool = Mempool::new(10);

        for (amount, fee) in [(1, 1), (2, 5), (3, 5), (4, 0)] {
            let tx = alice.create_transaction("bob", amount, fee).unwrap();
            pool.add(tx, &validator, &snapshot).unwrap();
        }

        let amounts: Vec<u64> = pool.take_by_fee(10).iter().map(|tx| tx.amount).collect();
        assert_eq!(amounts, vec![2, 3, 1, 4]);
        assert_eq!(pool.take_by_fee(2).len(), 2);
        assert_eq!(pool.len(), 4);
    }

    #[test]
    fn test_duplicates_and_capacity() {
        let alice = Wallet::generate();
        let snapshot = ledger(&[(&alice, 1_000)]).snapshot().unwrap();
        let validator = validator();
        let mut pool = Mempool::new(2);

        let tx = alice.create_transaction("bob", 1, 0).unwrap();
        pool.add(tx.clone(), &validator, &snapshot).unwrap();
        assert!(matches!(
            pool.add(tx, &validator, &snapshot),
            Err(ChainError::DuplicateTransaction(_))
        ));
        // Same triple, different fee.
        let same_spend = alice.create_transaction("bob", 1, 9).unwrap();
        assert!(matches!(
            pool.add(same_spend, &validator, &snapshot),
            Err(ChainError::DuplicateTransaction(_))
        ));

        pool.add(alice.create_transaction("bob", 2, 0).unwrap(), &validator, &snapshot)
            .unwrap();
        assert_eq!(
            pool.add(alice.create_transaction("bob", 3, 0).unwrap(), &validator, &snapshot),
            Err(ChainError::MempoolFull)
        );
    }

    #[test]
    fn test_pending_debits_count_against_balance() {
        let alice = Wallet::generate();
        let snapshot = ledger(&[(&alice, 100)]).snapshot().unwrap();
        let validator = validator();
        let mut pool = Mempool::new(10);

        pool.add(alice.create_transaction("bob", 60, 0).unwrap(), &validator, &snapshot)
            .unwrap();
        assert!(matches!(
            pool.add(alice.create_transaction("carol", 60, 0).unwrap(), &validator, &snapshot),
            Err(ChainError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn test_prune_committed_and_revalidate() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let state = ledger(&[(&alice, 100), (&bob, 10)]);
        let validator = validator();
        let mut pool = Mempool::new(10);

        let first = alice.create_transaction(&bob.identity(), 30, 0).unwrap();
        let second = alice.create_transaction(&bob.identity(), 40, 0).unwrap();
        let bobs = bob.create_transaction(&alice.identity(), 10, 0).unwrap();
        let snapshot = state.snapshot().unwrap();
        pool.add(first.clone(), &validator, &snapshot).unwrap();
        pool.add(second, &validator, &snapshot).unwrap();
        pool.add(bobs, &validator, &snapshot).unwrap();

        let block = BlockFactory::new(ConsensusParams::default().into_shared()).create_block(
            &state.tip().unwrap(),
            vec![first],
            "p",
        );
        assert_eq!(pool.prune_committed(&block), 1);
        assert_eq!(pool.len(), 2);

        // Bob spends elsewhere, so his pending transfer no longer fits.
        let mut drained = snapshot.clone();
        drained.balances.insert(bob.identity(), 0);
        assert_eq!(pool.prune(&validator, &drained), 1);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.take_by_fee(5)[0].amount, 40);
    }
}
