/// Transaction types for KiwiChain
use crate::blockchain::Sha256Hash;
use crate::crypto::sha256;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

/// Maximum transaction size in bytes (100KB) to prevent DoS
pub const MAX_TRANSACTION_SIZE: usize = 100_000;

const SIGNING_DOMAIN: &[u8] = b"KIWI-TX:";

/// Appends a big-endian u32 length followed by the bytes themselves.
pub(crate) fn put_len_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Opaque contract invocation handed to the contract-execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractCall {
    #[serde(with = "hex::serde")]
    pub code: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomOpKind {
    Mint,
    Burn,
}

/// Governance-gated custom operation applied to the sender's own balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomOp {
    pub kind: CustomOpKind,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    Contract(ContractCall),
    Custom(CustomOp),
}

impl Payload {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Payload::Contract(call) => {
                out.push(1);
                put_len_prefixed(out, &call.code);
                put_len_prefixed(out, &call.input);
            }
            Payload::Custom(op) => {
                out.push(2);
                out.push(match op.kind {
                    CustomOpKind::Mint => 0,
                    CustomOpKind::Burn => 1,
                });
                out.extend_from_slice(&op.amount.to_be_bytes());
            }
        }
    }
}

/// The coarse identity used for double-spend detection: two transfers with the
/// same sender, receiver and amount are considered the same spend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpendKey {
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: String,
    pub receiver: String,
    pub amount: u64,
    pub fee: u64,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Transaction {
    /// Builds an unsigned transfer.
    pub fn new(sender: impl Into<String>, receiver: impl Into<String>, amount: u64, fee: u64) -> Self {
        Transaction {
            sender: sender.into(),
            receiver: receiver.into(),
            amount,
            fee,
            signature: Vec::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Canonical bytes covered by the sender's signature: sender, receiver, amount.
    ///
    /// The fee and the payload are not covered. Whoever relays or proposes a
    /// pending transfer can raise its fee up to the sender's balance and
    /// collect the difference, or attach a payload such as a burn, without
    /// invalidating the signature.
    pub fn signable_message(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(SIGNING_DOMAIN.len() + 16 + self.sender.len() + self.receiver.len());
        message.extend_from_slice(SIGNING_DOMAIN);
        put_len_prefixed(&mut message, self.sender.as_bytes());
        put_len_prefixed(&mut message, self.receiver.as_bytes());
        message.extend_from_slice(&self.amount.to_be_bytes());
        message
    }

    pub fn sign(&mut self, signature: Vec<u8>) {
        self.signature = signature;
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }

    /// Full canonical encoding, used by the block hasher.
    pub fn encode(&self, out: &mut Vec<u8>) {
        put_len_prefixed(out, self.sender.as_bytes());
        put_len_prefixed(out, self.receiver.as_bytes());
        out.extend_from_slice(&self.amount.to_be_bytes());
        out.extend_from_slice(&self.fee.to_be_bytes());
        put_len_prefixed(out, &self.signature);
        match &self.payload {
            Some(payload) => payload.encode(out),
            None => out.push(0),
        }
    }

    pub fn hash(&self) -> Sha256Hash {
        let mut bytes = Vec::new();
        self.encode(&mut bytes);
        sha256(&bytes)
    }

    pub fn hash_str(&self) -> String {
        hex::encode(self.hash())
    }

    pub fn spend_key(&self) -> SpendKey {
        SpendKey {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            amount: self.amount,
        }
    }

    pub fn custom_op(&self) -> Option<&CustomOp> {
        match &self.payload {
            Some(Payload::Custom(op)) => Some(op),
            _ => None,
        }
    }

    pub fn contract_call(&self) -> Option<&ContractCall> {
        match &self.payload {
            Some(Payload::Contract(call)) => Some(call),
            _ => None,
        }
    }

    /// Total debited from the sender: amount, fee and any burn.
    /// `None` on overflow.
    pub fn total_debit(&self) -> Option<u64> {
        let burn = match self.custom_op() {
            Some(CustomOp {
                kind: CustomOpKind::Burn,
                amount,
            }) => *amount,
            _ => 0,
        };
        self.amount.checked_add(self.fee)?.checked_add(burn)
    }

    /// Validate transaction size to prevent DoS attacks
    pub fn validate_size(&self) -> Result<(), ChainError> {
        let size = bincode::serialized_size(self)? as usize;
        if size > MAX_TRANSACTION_SIZE {
            return Err(ChainError::InvalidTransaction(format!(
                "Transaction too large: {} bytes (max: {})",
                size, MAX_TRANSACTION_SIZE
            )));
        }
        Ok(())
    }
}
