//! Contract-execution collaborator boundary.

use crate::transaction::{ContractCall, Transaction};
use parking_lot::Mutex;
use std::sync::Arc;

/// Synchronous black-box contract runtime.
///
/// `execute` runs during transaction validation. `rollback` runs when a block
/// carrying the transaction fails part-way through being applied, and for
/// every call a timed-out round had already executed.
pub trait ContractExecutor: Send + Sync {
    fn execute(&self, call: &ContractCall, tx: &Transaction) -> Result<(), String>;

    fn rollback(&self, _call: &ContractCall, _tx: &Transaction) {}
}

impl<F> ContractExecutor for F
where
    F: Fn(&ContractCall, &Transaction) -> Result<(), String> + Send + Sync,
{
    fn execute(&self, call: &ContractCall, tx: &Transaction) -> Result<(), String> {
        self(call, tx)
    }
}

/// Used when no contract runtime is attached: every contract call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContractRuntime;

impl ContractExecutor for NoContractRuntime {
    fn execute(&self, _call: &ContractCall, _tx: &Transaction) -> Result<(), String> {
        Err("no contract runtime attached".to_string())
    }
}

/// Wraps an executor and records every call that executed successfully, so
/// a round that is abandoned can undo them.
pub struct ContractJournal {
    inner: Arc<dyn ContractExecutor>,
    executed: Mutex<Vec<(ContractCall, Transaction)>>,
}

impl ContractJournal {
    pub fn new(inner: Arc<dyn ContractExecutor>) -> Self {
        ContractJournal {
            inner,
            executed: Mutex::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.executed.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.executed.lock().is_empty()
    }

    /// Rolls back every recorded call, newest first, and empties the journal.
    pub fn rollback_all(&self) -> usize {
        let executed = std::mem::take(&mut *self.executed.lock());
        for (call, tx) in executed.iter().rev() {
            self.inner.rollback(call, tx);
        }
        executed.len()
    }
}

impl ContractExecutor for ContractJournal {
    fn execute(&self, call: &ContractCall, tx: &Transaction) -> Result<(), String> {
        self.inner.execute(call, tx)?;
        self.executed.lock().push((call.clone(), tx.clone()));
        Ok(())
    }

    fn rollback(&self, call: &ContractCall, tx: &Transaction) {
        self.inner.rollback(call, tx);
    }
}
