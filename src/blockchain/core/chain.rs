use crate::governance::SharedParams;
use crate::transaction::types::put_len_prefixed;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub type Sha256Hash = [u8; 32];

pub const GENESIS_PREV_HASH: Sha256Hash = [0u8; 32];
pub const GENESIS_PROPOSER: &str = "genesis";

const BLOCK_DOMAIN: &[u8] = b"KIWI-BLOCK:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub index: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    #[serde(with = "hex::serde")]
    pub hash: Sha256Hash,
    #[serde(with = "hex::serde")]
    pub prev_hash: Sha256Hash,
    /// Proof value. Big-endian u64 nonce under proof-of-work, draw count under proof-of-stake.
    #[serde(with = "hex::serde")]
    pub nonce: Vec<u8>,
    pub proposer: String,
    pub reward: u64,
}

impl Block {
    pub fn genesis(timestamp: i64) -> Self {
        let mut block = Block {
            index: 0,
            timestamp,
            transactions: Vec::new(),
            hash: [0u8; 32],
            prev_hash: GENESIS_PREV_HASH,
            nonce: Vec::new(),
            proposer: GENESIS_PROPOSER.to_string(),
            reward: 0,
        };
        block.seal();
        block
    }

    /// Canonical encoding split around the nonce, so proof-of-work can hash
    /// the fixed prefix once and only re-hash the nonce and suffix.
    pub fn hash_parts(&self) -> (Vec<u8>, Vec<u8>) {
        let mut prefix = Vec::with_capacity(128);
        prefix.extend_from_slice(BLOCK_DOMAIN);
        prefix.extend_from_slice(&self.index.to_be_bytes());
        prefix.extend_from_slice(&self.timestamp.to_be_bytes());
        prefix.extend_from_slice(&(self.transactions.len() as u32).to_be_bytes());
        for tx in &self.transactions {
            tx.encode(&mut prefix);
        }
        prefix.extend_from_slice(&self.prev_hash);

        let mut suffix = Vec::with_capacity(self.proposer.len() + 12);
        put_len_prefixed(&mut suffix, self.proposer.as_bytes());
        suffix.extend_from_slice(&self.reward.to_be_bytes());
        (prefix, suffix)
    }

    pub fn calculate_hash(&self) -> Sha256Hash {
        let (prefix, suffix) = self.hash_parts();
        hash_with_nonce(&prefix, &self.nonce, &suffix)
    }

    /// Recomputes and stores the content hash.
    pub fn seal(&mut self) {
        self.hash = self.calculate_hash();
    }

    pub fn has_valid_hash(&self) -> bool {
        self.calculate_hash() == self.hash
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash)
    }

    /// Sum of all transaction fees, `None` on overflow.
    pub fn total_fees(&self) -> Option<u64> {
        self.transactions
            .iter()
            .try_fold(0u64, |acc, tx| acc.checked_add(tx.fee))
    }

    pub fn hash_to_target(difficulty: u32) -> Sha256Hash {
        let mut target = [0xFF; 32];
        let leading_zeros = (difficulty / 8).min(32);
        let partial_bits = difficulty % 8;

        for item in target.iter_mut().take(leading_zeros as usize) {
            *item = 0;
        }

        if leading_zeros < 32 && partial_bits > 0 {
            target[leading_zeros as usize] = 0xFF >> partial_bits;
        }
        target
    }

    /// Big-endian byte order makes the array comparison a numeric one.
    pub fn meets_difficulty(hash: &Sha256Hash, difficulty: u32) -> bool {
        *hash <= Self::hash_to_target(difficulty)
    }
}

pub(crate) fn hash_with_nonce(prefix: &[u8], nonce: &[u8], suffix: &[u8]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(prefix);
    hasher.update((nonce.len() as u32).to_be_bytes());
    hasher.update(nonce);
    hasher.update(suffix);
    hasher.finalize().into()
}

pub fn leading_zero_bits(hash: &Sha256Hash) -> u32 {
    let mut count = 0;
    for &b in hash {
        if b == 0 {
            count += 8;
        } else {
            count += b.leading_zeros();
            break;
        }
    }
    count
}

/// Builds unproofed candidate blocks on top of a given parent.
#[derive(Clone)]
pub struct BlockFactory {
    params: SharedParams,
}

impl BlockFactory {
    pub fn new(params: SharedParams) -> Self {
        BlockFactory { params }
    }

    /// The proposer's reward is recorded on the block but only credited when
    /// the block is committed.
    pub fn create_block(&self, prev: &Block, transactions: Vec<Transaction>, proposer: &str) -> Block {
        let reward = self.params.read().block_reward;
        let now = chrono::Utc::now().timestamp_millis();

        let mut block = Block {
            index: prev.index + 1,
            timestamp: now.max(prev.timestamp + 1),
            transactions,
            hash: [0u8; 32],
            prev_hash: prev.hash,
            nonce: Vec::new(),
            proposer: proposer.to_string(),
            reward,
        };
        block.seal();
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::ConsensusParams;

    fn factory() -> BlockFactory {
        BlockFactory::new(ConsensusParams::default().into_shared())
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis(1_700_000_000_000);
        assert_eq!(genesis.index, 0);
        assert!(genesis.transactions.is_empty());
        assert_eq!(genesis.prev_hash, GENESIS_PREV_HASH);
        assert!(genesis.has_valid_hash());
    }

    #[test]
    fn test_hash_is_deterministic() {
        let genesis = Block::genesis(1_700_000_000_000);
        let block = factory().create_block(&genesis, vec![Transaction::new("a", "b", 5, 1)], "p");
        assert_eq!(block.calculate_hash(), block.calculate_hash());
        assert_eq!(block.calculate_hash(), block.clone().calculate_hash());
    }

    #[test]
    fn test_distinct_blocks_hash_differently() {
        let genesis = Block::genesis(0);
        let base = factory().create_block(&genesis, Vec::new(), "p");

        let mut other_index = base.clone();
        other_index.index = 10;
        let mut other_nonce = base.clone();
        other_nonce.nonce = vec![1];
        let mut other_proposer = base.clone();
        other_proposer.proposer = "q".to_string();

        let hashes = [
            base.calculate_hash(),
            other_index.calculate_hash(),
            other_nonce.calculate_hash(),
            other_proposer.calculate_hash(),
        ];
        for i in 0..hashes.len() {
            for j in (i + 1)..hashes.len() {
                assert_ne!(hashes[i], hashes[j]);
            }
        }
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let genesis = Block::genesis(0);
        let f = factory();
        let a = f.create_block(&genesis, vec![Transaction::new("ab", "c", 1, 0)], "p");
        let mut b = a.clone();
        b.transactions = vec![Transaction::new("a", "bc", 1, 0)];
        assert_ne!(a.calculate_hash(), b.calculate_hash());
    }

    #[test]
    fn test_create_block_links_to_parent() {
        let genesis = Block::genesis(chrono::Utc::now().timestamp_millis() + 60_000);
        let block = factory().create_block(&genesis, Vec::new(), "proposer");

        assert_eq!(block.index, 1);
        assert_eq!(block.prev_hash, genesis.hash);
        assert_eq!(block.reward, 50);
        assert_eq!(block.proposer, "proposer");
        assert!(block.timestamp > genesis.timestamp);
        assert!(block.has_valid_hash());
    }

    #[test]
    fn test_hash_to_target() {
        assert_eq!(Block::hash_to_target(0), [0xFF; 32]);
        let target = Block::hash_to_target(12);
        assert_eq!(target[0], 0);
        assert_eq!(target[1], 0x0F);
        assert_eq!(target[2], 0xFF);
        assert_eq!(Block::hash_to_target(256), [0u8; 32]);
    }

    #[test]
    fn test_meets_difficulty_matches_leading_zero_bits() {
        let mut hash = [0xFFu8; 32];
        hash[0] = 0;
        hash[1] = 0b0001_0000;
        assert_eq!(leading_zero_bits(&hash), 11);
        assert!(Block::meets_difficulty(&hash, 11));
        assert!(!Block::meets_difficulty(&hash, 12));
    }

    #[test]
    fn test_total_fees() {
        let genesis = Block::genesis(0);
        let block = factory().create_block(
            &genesis,
            vec![Transaction::new("a", "b", 5, 2), Transaction::new("c", "d", 5, 3)],
            "p",
        );
        assert_eq!(block.total_fees(), Some(5));
    }
}
