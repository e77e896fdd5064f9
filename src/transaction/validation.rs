/// Validation logic for transactions separated from type definitions
use crate::blockchain::{BalanceTable, Block};
use crate::contract::ContractExecutor;
use crate::crypto::verify_signature;
use crate::error::ChainError;
use crate::governance::{ConsensusParams, SharedParams, FEATURE_CUSTOM};
use crate::transaction::types::{CustomOpKind, Payload, Transaction};
use crate::wallet::KeyDirectory;
use std::sync::Arc;

pub type ValidationResult = Result<(), ChainError>;

/// Checks a transaction against the committed chain and a balance table.
#[derive(Clone)]
pub struct TransactionValidator {
    keys: Arc<dyn KeyDirectory>,
    contracts: Arc<dyn ContractExecutor>,
    params: SharedParams,
}

impl TransactionValidator {
    pub fn new(keys: Arc<dyn KeyDirectory>, contracts: Arc<dyn ContractExecutor>, params: SharedParams) -> Self {
        TransactionValidator {
            keys,
            contracts,
            params,
        }
    }

    pub fn contracts(&self) -> &dyn ContractExecutor {
        self.contracts.as_ref()
    }

    pub fn contract_runtime(&self) -> Arc<dyn ContractExecutor> {
        self.contracts.clone()
    }

    /// Same keys and parameters, different contract runtime.
    pub fn with_contracts(&self, contracts: Arc<dyn ContractExecutor>) -> Self {
        TransactionValidator {
            keys: self.keys.clone(),
            contracts,
            params: self.params.clone(),
        }
    }

    /// Signature, then balance, then double-spend, then payload. Stops at the
    /// first failure and never mutates anything. Feature switches are read
    /// from the live parameters.
    pub fn validate(&self, tx: &Transaction, chain: &[Block], balances: &BalanceTable) -> ValidationResult {
        let params = self.params.read().clone();
        self.validate_with_params(tx, chain, balances, &params)
    }

    /// Same checks as [`validate`](Self::validate), gated by a fixed
    /// parameter set such as the one a round copied at its start.
    pub fn validate_with_params(
        &self,
        tx: &Transaction,
        chain: &[Block],
        balances: &BalanceTable,
        params: &ConsensusParams,
    ) -> ValidationResult {
        tx.validate_size()?;
        self.check_signature(tx)?;
        self.check_balance(tx, balances)?;
        check_not_spent(tx, chain)?;
        self.check_payload(tx, params)
    }

    fn check_signature(&self, tx: &Transaction) -> ValidationResult {
        if !tx.is_signed() {
            return Err(ChainError::InvalidSignature("transaction not signed".to_string()));
        }
        let public_key = self.keys.public_key_of(&tx.sender).ok_or_else(|| {
            ChainError::InvalidSignature(format!("no public key for sender {}", tx.sender))
        })?;
        verify_signature(&public_key, &tx.signable_message(), &tx.signature)
            .map_err(|e| ChainError::InvalidSignature(e.to_string()))
    }

    fn check_balance(&self, tx: &Transaction, balances: &BalanceTable) -> ValidationResult {
        let required = tx
            .total_debit()
            .ok_or_else(|| ChainError::InvalidTransaction("amount overflow".to_string()))?;
        let balance = balances.get(&tx.sender).copied().unwrap_or(0);
        if balance < required {
            return Err(ChainError::InsufficientFunds {
                identity: tx.sender.clone(),
                balance,
                required,
            });
        }
        Ok(())
    }

    fn check_payload(&self, tx: &Transaction, params: &ConsensusParams) -> ValidationResult {
        match &tx.payload {
            None => Ok(()),
            Some(Payload::Contract(call)) => self
                .contracts
                .execute(call, tx)
                .map_err(ChainError::ContractExecutionFailed),
            Some(Payload::Custom(op)) => {
                if !params.feature_enabled(FEATURE_CUSTOM) {
                    return Err(ChainError::InvalidTransaction(
                        "custom operations are not enabled".to_string(),
                    ));
                }
                if op.amount == 0 {
                    return Err(ChainError::InvalidTransaction(format!(
                        "{:?} amount must be positive",
                        op.kind
                    )));
                }
                if op.kind == CustomOpKind::Mint && tx.amount != 0 {
                    return Err(ChainError::InvalidTransaction(
                        "mint cannot carry a transfer amount".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Coarse double-spend check: any committed transaction with the same
/// sender, receiver and amount counts as the same spend.
pub fn check_not_spent(tx: &Transaction, chain: &[Block]) -> ValidationResult {
    let key = tx.spend_key();
    for block in chain {
        if let Some(existing) = block.transactions.iter().find(|t| t.spend_key() == key) {
            return Err(ChainError::DuplicateTransaction(format!(
                "{} -> {} ({}) already committed in block {} as {}",
                tx.sender,
                tx.receiver,
                tx.amount,
                block.index,
                existing.hash_str()
            )));
        }
    }
    Ok(())
}
