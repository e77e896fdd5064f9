//! Wallet collaborator boundary.
//!
//! The ledger core never generates keys. It only asks a [`KeyDirectory`] for
//! the public key behind an identity. [`Wallet`] is the reference signer used
//! by the node binary and the tests.

use crate::crypto::{public_key_from_identity, KeyPair};
use crate::error::ChainError;
use crate::transaction::{Payload, Transaction};

/// Resolves ledger identities to compressed secp256k1 public keys.
pub trait KeyDirectory: Send + Sync {
    fn public_key_of(&self, identity: &str) -> Option<Vec<u8>>;
}

/// Produces signatures over a transaction's signable message.
pub trait Signer {
    fn identity(&self) -> String;
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ChainError>;
}

/// Identities are hex-encoded public keys, so the directory needs no storage.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedKeyDirectory;

impl KeyDirectory for EmbeddedKeyDirectory {
    fn public_key_of(&self, identity: &str) -> Option<Vec<u8>> {
        public_key_from_identity(identity).ok().map(|key| key.to_vec())
    }
}

#[derive(Debug, Clone)]
pub struct Wallet {
    keypair: KeyPair,
}

impl Wallet {
    pub fn generate() -> Self {
        Wallet {
            keypair: KeyPair::generate(),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(secret_hex)
            .map_err(|e| ChainError::CryptoError(format!("Invalid secret key hex: {}", e)))?;
        Ok(Wallet {
            keypair: KeyPair::from_secret_bytes(&bytes)?,
        })
    }

    pub fn identity(&self) -> String {
        self.keypair.identity()
    }

    /// Builds and signs a plain transfer from this wallet.
    pub fn create_transaction(&self, to: &str, amount: u64, fee: u64) -> Result<Transaction, ChainError> {
        self.sign_transaction(Transaction::new(self.identity(), to, amount, fee))
    }

    pub fn create_transaction_with_payload(
        &self,
        to: &str,
        amount: u64,
        fee: u64,
        payload: Payload,
    ) -> Result<Transaction, ChainError> {
        self.sign_transaction(Transaction::new(self.identity(), to, amount, fee).with_payload(payload))
    }

    pub fn sign_transaction(&self, mut tx: Transaction) -> Result<Transaction, ChainError> {
        let signature = Signer::sign(self, &tx.signable_message())?;
        tx.sign(signature);
        Ok(tx)
    }
}

impl Signer for Wallet {
    fn identity(&self) -> String {
        self.keypair.identity()
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, ChainError> {
        Ok(self.keypair.sign(message)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;

    #[test]
    fn test_wallet_transactions_verify_against_directory() {
        let alice = Wallet::generate();
        let bob = Wallet::generate();

        let tx = alice.create_transaction(&bob.identity(), 25, 1).unwrap();
        assert_eq!(tx.sender, alice.identity());
        assert!(tx.is_signed());

        let key = EmbeddedKeyDirectory.public_key_of(&tx.sender).unwrap();
        assert!(verify_signature(&key, &tx.signable_message(), &tx.signature).is_ok());
    }

    #[test]
    fn test_directory_rejects_unknown_identity() {
        assert!(EmbeddedKeyDirectory.public_key_of("not-a-key").is_none());
    }

    #[test]
    fn test_wallet_restores_from_secret() {
        let secret = "11".repeat(32);
        let first = Wallet::from_secret_hex(&secret).unwrap();
        let second = Wallet::from_secret_hex(&secret).unwrap();
        assert_eq!(first.identity(), second.identity());
        assert!(Wallet::from_secret_hex("zz").is_err());
    }
}
