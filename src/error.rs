//! Error types for KiwiChain

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    InvalidSignature(String),
    InsufficientFunds {
        identity: String,
        balance: u64,
        required: u64,
    },
    DuplicateTransaction(String),
    ContractExecutionFailed(String),
    ChainContinuityError(String),
    HashMismatch {
        expected: String,
        found: String,
    },
    NoEligibleStakeholder,
    RoundTimeout(u64),
    InvalidProof(String),
    InvalidTransaction(String),
    InvalidBlock(String),
    CryptoError(String),
    MempoolFull,
    Cancelled,
    ArbiterClosed,
    GovernanceError(String),
    ConfigError(String),
    IoError(String),
    BincodeError(String),
    /// A committed block or ledger invariant was found broken. Never recoverable.
    InvariantViolation(String),
}

impl ChainError {
    /// Fatal errors stop the arbiter and are surfaced to the operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChainError::InvariantViolation(_))
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChainError::InvalidSignature(msg) => write!(f, "Invalid signature: {}", msg),
            ChainError::InsufficientFunds {
                identity,
                balance,
                required,
            } => write!(
                f,
                "Insufficient funds: {} has {} but needs {}",
                identity, balance, required
            ),
            ChainError::DuplicateTransaction(msg) => write!(f, "Duplicate transaction: {}", msg),
            ChainError::ContractExecutionFailed(msg) => {
                write!(f, "Contract execution failed: {}", msg)
            }
            ChainError::ChainContinuityError(msg) => write!(f, "Chain continuity error: {}", msg),
            ChainError::HashMismatch { expected, found } => write!(
                f,
                "Hash mismatch: expected {}, found {}",
                expected, found
            ),
            ChainError::NoEligibleStakeholder => write!(f, "No eligible stakeholder"),
            ChainError::RoundTimeout(index) => write!(f, "Round for index {} timed out", index),
            ChainError::InvalidProof(msg) => write!(f, "Invalid proof: {}", msg),
            ChainError::InvalidTransaction(msg) => write!(f, "Invalid transaction: {}", msg),
            ChainError::InvalidBlock(msg) => write!(f, "Invalid block: {}", msg),
            ChainError::CryptoError(msg) => write!(f, "Cryptographic error: {}", msg),
            ChainError::MempoolFull => write!(f, "Mempool is full"),
            ChainError::Cancelled => write!(f, "Operation cancelled"),
            ChainError::ArbiterClosed => write!(f, "Chain arbiter is not running"),
            ChainError::GovernanceError(msg) => write!(f, "Governance error: {}", msg),
            ChainError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            ChainError::IoError(msg) => write!(f, "IO error: {}", msg),
            ChainError::BincodeError(msg) => write!(f, "Bincode error: {}", msg),
            ChainError::InvariantViolation(msg) => write!(f, "Ledger invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
