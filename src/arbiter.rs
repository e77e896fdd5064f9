//! Round-based arbitration of competing candidate blocks.
//!
//! One `ChainArbiter` task owns the commit path. Producers hand it finalized
//! blocks through an [`ArbiterHandle`]; each round collects candidates for a
//! short window, validates them in parallel against a single ledger
//! snapshot, picks one winner and commits it. Every submitter receives a
//! [`CandidateOutcome`] on its reply channel.
//!
//! Validation has `round_timeout` from the moment collection closes. A round
//! that runs out of time is abandoned: its validation task is cancelled and
//! awaited, and every contract call it executed is rolled back.
//!
//! ```text
//! Idle -> CollectingCandidates -> Validating -> Committing -> Idle
//! ```

use crate::blockchain::{validate_candidate, Block, CommitOutcome, LedgerSnapshot, LedgerState, Sha256Hash};
use crate::config::ArbiterConfig;
use crate::consensus::ConsensusMode;
use crate::contract::ContractJournal;
use crate::error::{ChainError, Result};
use crate::governance::{ConsensusParams, SharedParams};
use crate::transaction::TransactionValidator;
use rayon::prelude::*;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArbiterPhase {
    Idle,
    CollectingCandidates,
    Validating,
    Committing,
}

/// Published on every phase change and after every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbiterStatus {
    pub phase: ArbiterPhase,
    pub tip_index: u64,
    #[serde(with = "hex::serde")]
    pub tip_hash: Sha256Hash,
    pub round: u64,
    /// Candidates buffered in the current round.
    pub pending: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Committed { index: u64, hash: Sha256Hash },
    /// Valid, but another candidate won the index.
    Superseded { index: u64, winner: Sha256Hash },
    Rejected(ChainError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Committed {
        index: u64,
        hash: Sha256Hash,
        candidates: usize,
    },
    /// No candidate survived validation; the tip is unchanged.
    NoValidCandidate { index: u64, candidates: usize },
    Abandoned { index: u64, reason: ChainError },
}

struct Submission {
    block: Block,
    reply: oneshot::Sender<CandidateOutcome>,
}

/// Cloneable front door to a running arbiter.
#[derive(Clone)]
pub struct ArbiterHandle {
    submissions: mpsc::Sender<Submission>,
    ledger: Arc<LedgerState>,
    status: watch::Receiver<ArbiterStatus>,
}

impl ArbiterHandle {
    /// Queues `block` for the next round and waits for its outcome. Waits
    /// for room when the queue is full.
    pub async fn submit_candidate(&self, block: Block) -> Result<CandidateOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.submissions
            .send(Submission { block, reply })
            .await
            .map_err(|_| ChainError::ArbiterClosed)?;
        outcome.await.map_err(|_| ChainError::ArbiterClosed)
    }

    pub fn get_chain_snapshot(&self) -> Vec<Block> {
        self.ledger.chain()
    }

    pub fn status(&self) -> ArbiterStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ArbiterStatus> {
        self.status.clone()
    }

    pub fn ledger(&self) -> &Arc<LedgerState> {
        &self.ledger
    }
}

pub struct ChainArbiter {
    ledger: Arc<LedgerState>,
    params: SharedParams,
    validator: Arc<TransactionValidator>,
    mode: ConsensusMode,
    config: ArbiterConfig,
    submissions: mpsc::Receiver<Submission>,
    status: watch::Sender<ArbiterStatus>,
    round: u64,
}

/// Candidate pool of one round, in arrival order.
struct Pool {
    blocks: Arc<Vec<Block>>,
    replies: Vec<oneshot::Sender<CandidateOutcome>>,
}

impl ChainArbiter {
    pub fn new(
        ledger: Arc<LedgerState>,
        params: SharedParams,
        validator: Arc<TransactionValidator>,
        mode: ConsensusMode,
        config: ArbiterConfig,
    ) -> (Self, ArbiterHandle) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let (tip_index, tip_hash) = ledger.tip().map_or((0, [0u8; 32]), |tip| (tip.index, tip.hash));
        let (status_tx, status_rx) = watch::channel(ArbiterStatus {
            phase: ArbiterPhase::Idle,
            tip_index,
            tip_hash,
            round: 0,
            pending: 0,
        });

        let handle = ArbiterHandle {
            submissions: tx,
            ledger: ledger.clone(),
            status: status_rx,
        };
        let arbiter = ChainArbiter {
            ledger,
            params,
            validator,
            mode,
            config,
            submissions: rx,
            status: status_tx,
            round: 0,
        };
        (arbiter, handle)
    }

    /// Runs rounds until every handle is dropped. Returns early only on a
    /// fatal ledger error.
    pub async fn run(mut self) -> Result<()> {
        info!(mode = %self.mode, tip = self.ledger.height(), "Chain arbiter started");
        loop {
            self.publish(ArbiterPhase::Idle, 0);
            let Some(first) = self.submissions.recv().await else {
                info!(rounds = self.round, "All arbiter handles dropped, stopping");
                return Ok(());
            };

            self.round += 1;
            match self.run_round(first).await {
                Ok(RoundOutcome::Committed { index, hash, candidates }) => {
                    info!(
                        round = self.round,
                        index,
                        hash = %hex::encode(hash),
                        candidates,
                        "Round committed"
                    );
                }
                Ok(RoundOutcome::NoValidCandidate { index, candidates }) => {
                    warn!(round = self.round, index, candidates, "Round ended without a valid candidate");
                }
                Ok(RoundOutcome::Abandoned { index, reason }) => {
                    warn!(round = self.round, index, reason = %reason, "Round abandoned");
                }
                Err(e) => {
                    error!(round = self.round, error = %e, "Chain arbiter stopping on fatal error");
                    return Err(e);
                }
            }
        }
    }

    fn publish(&self, phase: ArbiterPhase, pending: usize) {
        let (tip_index, tip_hash) = self
            .ledger
            .tip()
            .map_or((0, [0u8; 32]), |tip| (tip.index, tip.hash));
        self.status.send_replace(ArbiterStatus {
            phase,
            tip_index,
            tip_hash,
            round: self.round,
            pending,
        });
    }

    async fn collect(&mut self, first: Submission) -> Pool {
        let mut blocks = vec![first.block];
        let mut replies = vec![first.reply];
        self.publish(ArbiterPhase::CollectingCandidates, 1);

        let window_end = Instant::now() + self.config.collection_window;
        while blocks.len() < self.config.max_candidates {
            match timeout_at(window_end, self.submissions.recv()).await {
                Ok(Some(submission)) => {
                    blocks.push(submission.block);
                    replies.push(submission.reply);
                    self.publish(ArbiterPhase::CollectingCandidates, blocks.len());
                }
                // Closed channel or window elapsed: arbitrate what we have.
                Ok(None) | Err(_) => break,
            }
        }
        Pool {
            blocks: Arc::new(blocks),
            replies,
        }
    }

    /// Validates every block of the pool on the blocking pool with rayon.
    ///
    /// `None` means the deadline passed first. In that case the task has been
    /// cancelled and awaited, and the contract calls it executed are rolled
    /// back before returning.
    async fn validate_pool(
        &self,
        blocks: Arc<Vec<Block>>,
        snapshot: Arc<LedgerSnapshot>,
        params: Arc<ConsensusParams>,
        deadline: Instant,
    ) -> Result<Option<Vec<Option<ChainError>>>> {
        let journal = Arc::new(ContractJournal::new(self.validator.contract_runtime()));
        let validator = self.validator.with_contracts(journal.clone());
        let mode = self.mode;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            blocks
                .par_iter()
                .map(|block| {
                    if task_cancel.is_cancelled() {
                        return Some(ChainError::Cancelled);
                    }
                    validate_candidate(block, &snapshot, &params, mode, &validator).err()
                })
                .collect::<Vec<_>>()
        });

        let joined = match timeout_at(deadline, &mut task).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.cancel();
                if let Err(e) = task.await {
                    warn!(round = self.round, error = %e, "Abandoned validation task failed");
                }
                let rolled_back = journal.rollback_all();
                debug!(round = self.round, rolled_back, "Rolled back contracts of abandoned round");
                return Ok(None);
            }
        };
        match joined {
            Ok(verdicts) => Ok(Some(verdicts)),
            Err(e) => Err(ChainError::InvariantViolation(format!(
                "candidate validation task failed: {}",
                e
            ))),
        }
    }

    async fn run_round(&mut self, first: Submission) -> Result<RoundOutcome> {
        let pool = self.collect(first).await;
        let candidates = pool.blocks.len();
        let deadline = Instant::now() + self.config.round_timeout;

        self.publish(ArbiterPhase::Validating, candidates);
        let mut snapshot = match self.ledger.snapshot() {
            Ok(snapshot) => Arc::new(snapshot),
            Err(e) => {
                reply_all(pool.replies, |_| CandidateOutcome::Rejected(e.clone()));
                return Err(e);
            }
        };
        let params = Arc::new(self.params.read().clone());
        let index = snapshot.tip()?.index + 1;
        debug!(round = self.round, index, candidates, "Validating candidates");

        let Some(mut verdicts) = self
            .validate_pool(pool.blocks.clone(), snapshot.clone(), params.clone(), deadline)
            .await?
        else {
            return Ok(self.abandon(pool, index));
        };

        self.publish(ArbiterPhase::Committing, candidates);
        let mut retries = 0u32;
        let committed = loop {
            let Some(winner) = self.pick_winner(&pool.blocks, &verdicts) else {
                break None;
            };

            let block = pool.blocks[winner].clone();
            match self
                .ledger
                .commit_block(block, snapshot.version, self.validator.contracts())
            {
                Ok(CommitOutcome::Committed { index, hash }) => break Some((winner, index, hash)),
                Ok(CommitOutcome::StaleSnapshot) => {
                    retries += 1;
                    if retries > self.config.max_commit_retries {
                        let reason = ChainError::InvalidBlock(format!(
                            "ledger kept changing during commit after {} retries",
                            self.config.max_commit_retries
                        ));
                        for verdict in verdicts.iter_mut().filter(|v| v.is_none()) {
                            *verdict = Some(reason.clone());
                        }
                        break None;
                    }
                    debug!(round = self.round, retries, "Snapshot went stale, re-validating");
                    snapshot = Arc::new(self.ledger.snapshot()?);
                    let Some(fresh) = self
                        .validate_pool(pool.blocks.clone(), snapshot.clone(), params.clone(), deadline)
                        .await?
                    else {
                        return Ok(self.abandon(pool, index));
                    };
                    for (verdict, fresh) in verdicts.iter_mut().zip(fresh) {
                        if verdict.is_none() {
                            *verdict = fresh;
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    reply_all(pool.replies, |_| CandidateOutcome::Rejected(e.clone()));
                    return Err(e);
                }
                Err(e) => verdicts[winner] = Some(e),
            }
        };

        for (seq, verdict) in verdicts.iter().enumerate() {
            if let Some(reason) = verdict {
                warn!(
                    round = self.round,
                    seq,
                    hash = %pool.blocks[seq].hash_str(),
                    reason = %reason,
                    "Candidate rejected"
                );
            }
        }

        let outcome = match committed {
            Some((winner, index, hash)) => {
                reply_all(pool.replies, |seq| {
                    if seq == winner {
                        CandidateOutcome::Committed { index, hash }
                    } else if let Some(reason) = &verdicts[seq] {
                        CandidateOutcome::Rejected(reason.clone())
                    } else {
                        CandidateOutcome::Superseded { index, winner: hash }
                    }
                });
                RoundOutcome::Committed {
                    index,
                    hash,
                    candidates,
                }
            }
            None => {
                reply_all(pool.replies, |seq| {
                    CandidateOutcome::Rejected(verdicts[seq].clone().unwrap_or_else(|| {
                        ChainError::InvalidBlock("no candidate committed this round".to_string())
                    }))
                });
                RoundOutcome::NoValidCandidate { index, candidates }
            }
        };
        Ok(outcome)
    }

    /// Lowest hash wins under work, earliest arrival under stake. Ties fall
    /// back to arrival order.
    fn pick_winner(&self, blocks: &[Block], verdicts: &[Option<ChainError>]) -> Option<usize> {
        let valid = (0..blocks.len()).filter(|&seq| verdicts[seq].is_none());
        match self.mode {
            ConsensusMode::Work => valid.min_by_key(|&seq| (blocks[seq].hash, seq)),
            ConsensusMode::Stake => valid.min(),
        }
    }

    fn abandon(&self, pool: Pool, index: u64) -> RoundOutcome {
        let reason = ChainError::RoundTimeout(index);
        reply_all(pool.replies, |_| CandidateOutcome::Rejected(reason.clone()));
        RoundOutcome::Abandoned { index, reason }
    }
}

fn reply_all(replies: Vec<oneshot::Sender<CandidateOutcome>>, outcome: impl Fn(usize) -> CandidateOutcome) {
    for (seq, reply) in replies.into_iter().enumerate() {
        // The submitter may have stopped waiting.
        let _ = reply.send(outcome(seq));
    }
}
