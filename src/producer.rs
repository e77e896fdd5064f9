//! Block producers: draft from the mempool, finalize off the runtime, submit.

use crate::arbiter::{ArbiterHandle, CandidateOutcome};
use crate::blockchain::BlockFactory;
use crate::consensus::ConsensusEngine;
use crate::error::{ChainError, Result};
use crate::governance::SharedParams;
use crate::mempool::Mempool;
use crate::transaction::TransactionValidator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Back-off after a round that produced nothing useful.
const RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct Producer {
    identity: String,
    handle: ArbiterHandle,
    factory: BlockFactory,
    engine: Arc<dyn ConsensusEngine>,
    params: SharedParams,
    mempool: Arc<Mutex<Mempool>>,
    validator: Arc<TransactionValidator>,
    shutdown: CancellationToken,
}

impl Producer {
    pub fn new(
        identity: impl Into<String>,
        handle: ArbiterHandle,
        engine: Arc<dyn ConsensusEngine>,
        params: SharedParams,
        mempool: Arc<Mutex<Mempool>>,
        validator: Arc<TransactionValidator>,
        shutdown: CancellationToken,
    ) -> Self {
        Producer {
            identity: identity.into(),
            handle,
            factory: BlockFactory::new(params.clone()),
            engine,
            params,
            mempool,
            validator,
            shutdown,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Builds one candidate on the current tip and submits it.
    ///
    /// Proof search runs on the blocking pool and is cancelled as soon as the
    /// published tip reaches the index being produced, or on shutdown.
    pub async fn produce_once(&self) -> Result<CandidateOutcome> {
        let snapshot = self.handle.ledger().snapshot()?;
        let tip = snapshot.tip()?.clone();
        let params = self.params.read().clone();
        let transactions = {
            let mut mempool = self.mempool.lock();
            mempool.prune(&self.validator, &snapshot);
            mempool.take_by_fee(params.max_block_transactions)
        };
        let draft = self.factory.create_block(&tip, transactions, &self.identity);
        let index = draft.index;

        let cancel = self.shutdown.child_token();
        let watcher = {
            let mut status = self.handle.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    if status.borrow_and_update().tip_index >= index {
                        cancel.cancel();
                        return;
                    }
                    tokio::select! {
                        changed = status.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = cancel.cancelled() => return,
                    }
                }
            })
        };

        let engine = self.engine.clone();
        let stakes = snapshot.stakes;
        let proof_cancel = cancel.clone();
        let finalized =
            tokio::task::spawn_blocking(move || engine.finalize(draft, &params, &stakes, &proof_cancel)).await;
        cancel.cancel();
        let _ = watcher.await;

        let block = finalized.map_err(|e| ChainError::InvalidProof(format!("proof task failed: {}", e)))??;
        debug!(producer = %self.identity, index, hash = %block.hash_str(), "Submitting candidate");
        let outcome = self.handle.submit_candidate(block.clone()).await?;

        {
            let mut mempool = self.mempool.lock();
            if matches!(outcome, CandidateOutcome::Committed { .. }) {
                mempool.prune_committed(&block);
            }
            let fresh = self.handle.ledger().snapshot()?;
            mempool.prune(&self.validator, &fresh);
        }
        Ok(outcome)
    }

    /// Produces until the chain reaches `target_height` or shutdown is
    /// requested. Returns how many of this producer's blocks were committed.
    pub async fn run(&self, target_height: u64) -> Result<u64> {
        let mut committed = 0u64;
        while !self.shutdown.is_cancelled() && self.handle.ledger().height() < target_height {
            match self.produce_once().await {
                Ok(CandidateOutcome::Committed { index, hash }) => {
                    committed += 1;
                    info!(producer = %self.identity, index, hash = %hex::encode(hash), "Block committed");
                }
                Ok(CandidateOutcome::Superseded { index, .. }) => {
                    debug!(producer = %self.identity, index, "Candidate superseded");
                }
                Ok(CandidateOutcome::Rejected(reason)) => {
                    warn!(producer = %self.identity, reason = %reason, "Candidate rejected");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
                Err(ChainError::Cancelled) => {
                    debug!(producer = %self.identity, "Proof search cancelled");
                }
                Err(e) if e.is_fatal() || e == ChainError::ArbiterClosed => return Err(e),
                Err(e) => {
                    warn!(producer = %self.identity, error = %e, "Production attempt failed");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
        Ok(committed)
    }
}
