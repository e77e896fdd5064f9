use crate::arbiter::{ArbiterHandle, ChainArbiter};
use crate::blockchain::{Block, LedgerState, Sha256Hash};
use crate::config::Config;
use crate::consensus::{engine_for, ConsensusEngine};
use crate::contract::ContractExecutor;
use crate::error::{ChainError, Result};
use crate::governance::{Governance, SharedParams};
use crate::mempool::Mempool;
use crate::producer::Producer;
use crate::transaction::{Transaction, TransactionValidator};
use crate::wallet::KeyDirectory;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Booting,
    Ready,
    Stopped,
}

/// Wires the ledger, parameters, validator, mempool, engine and arbiter
/// together from one configuration.
pub struct Node {
    pub config: Config,
    ledger: Arc<LedgerState>,
    params: SharedParams,
    governance: Governance,
    validator: Arc<TransactionValidator>,
    mempool: Arc<Mutex<Mempool>>,
    engine: Arc<dyn ConsensusEngine>,
    handle: ArbiterHandle,
    arbiter: Option<ChainArbiter>,
    shutdown: CancellationToken,
    state: NodeState,
}

impl Node {
    pub fn init(config: Config, keys: Arc<dyn KeyDirectory>, contracts: Arc<dyn ContractExecutor>) -> Result<Self> {
        config.validate()?;
        info!(
            mode = %config.consensus.mode,
            difficulty = config.consensus.difficulty,
            accounts = config.genesis.balances.len(),
            stakeholders = config.genesis.stakes.len(),
            "Starting KiwiChain node"
        );

        let genesis = Block::genesis(config.genesis.timestamp);
        let ledger = Arc::new(LedgerState::new(
            genesis,
            config.genesis.balances.clone(),
            config.genesis.stakes.clone(),
        )?);
        let params = config.to_params().into_shared();
        let governance = Governance::new(params.clone());
        let validator = Arc::new(TransactionValidator::new(keys, contracts, params.clone()));
        let mempool = Arc::new(Mutex::new(Mempool::new(config.node.mempool_capacity)));
        let engine = engine_for(config.consensus.mode, config.consensus.seed);
        let (arbiter, handle) = ChainArbiter::new(
            ledger.clone(),
            params.clone(),
            validator.clone(),
            config.consensus.mode,
            config.arbiter.clone(),
        );

        Ok(Node {
            config,
            ledger,
            params,
            governance,
            validator,
            mempool,
            engine,
            handle,
            arbiter: Some(arbiter),
            shutdown: CancellationToken::new(),
            state: NodeState::Booting,
        })
    }

    /// Spawns the arbiter task. Only the first call succeeds.
    pub fn spawn_arbiter(&mut self) -> Result<JoinHandle<Result<()>>> {
        let arbiter = self
            .arbiter
            .take()
            .ok_or_else(|| ChainError::ConfigError("arbiter already started".to_string()))?;
        self.state = NodeState::Ready;
        Ok(tokio::spawn(arbiter.run()))
    }

    pub fn producer(&self, identity: impl Into<String>) -> Producer {
        Producer::new(
            identity,
            self.handle.clone(),
            self.engine.clone(),
            self.params.clone(),
            self.mempool.clone(),
            self.validator.clone(),
            self.shutdown.clone(),
        )
    }

    /// Validates `tx` against the current ledger and queues it.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Sha256Hash> {
        let snapshot = self.ledger.snapshot()?;
        self.mempool.lock().add(tx, &self.validator, &snapshot)
    }

    pub fn pending_transactions(&self) -> usize {
        self.mempool.lock().len()
    }

    pub fn handle(&self) -> ArbiterHandle {
        self.handle.clone()
    }

    pub fn ledger(&self) -> &Arc<LedgerState> {
        &self.ledger
    }

    pub fn governance(&self) -> &Governance {
        &self.governance
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Cancels every producer's proof search.
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.state = NodeState::Stopped;
        info!(height = self.ledger.height(), "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::NoContractRuntime;
    use crate::governance::{PARAM_DIFFICULTY, PARAM_REWARD};
    use crate::wallet::{EmbeddedKeyDirectory, Wallet};
    use std::time::Duration;

    fn node_with(config: Config) -> Node {
        Node::init(config, Arc::new(EmbeddedKeyDirectory), Arc::new(NoContractRuntime)).unwrap()
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.consensus.difficulty = 4;
        config.arbiter.collection_window = Duration::from_millis(10);
        config
    }

    #[tokio::test]
    async fn test_node_commits_submitted_transaction() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();
        let mut config = fast_config();
        config.genesis.balances.insert(alice.identity(), 100);
        let mut node = node_with(config);
        node.spawn_arbiter().unwrap();
        assert_eq!(node.state(), NodeState::Ready);

        node.submit_transaction(alice.create_transaction(&bob.identity(), 40, 1).unwrap())
            .unwrap();
        assert_eq!(node.pending_transactions(), 1);

        let committed = node.producer("miner").run(1).await.unwrap();
        assert_eq!(committed, 1);
        assert_eq!(node.ledger().balance_of(&bob.identity()), 40);
        assert_eq!(node.ledger().balance_of("miner"), 51);
        assert_eq!(node.pending_transactions(), 0);
    }

    #[tokio::test]
    async fn test_governance_changes_apply_next_round() {
        let mut node = node_with(fast_config());
        node.spawn_arbiter().unwrap();
        node.governance().update_parameter(PARAM_REWARD, 7).unwrap();
        node.governance().update_parameter(PARAM_DIFFICULTY, 2).unwrap();

        node.producer("miner").run(1).await.unwrap();
        assert_eq!(node.ledger().balance_of("miner"), 7);
        assert_eq!(node.handle().get_chain_snapshot()[1].reward, 7);
    }

    #[tokio::test]
    async fn test_arbiter_spawns_once() {
        let mut node = node_with(fast_config());
        assert!(node.spawn_arbiter().is_ok());
        assert!(matches!(node.spawn_arbiter(), Err(ChainError::ConfigError(_))));
        node.shutdown();
        assert_eq!(node.state(), NodeState::Stopped);
    }
}
