//! KiwiChain - a single-process ledger engine with proof-of-work and
//! proof-of-stake block arbitration
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`blockchain`] - Block model, hashing, ledger state and candidate validation
//! - [`transaction`] - Transaction types and validation
//! - [`mempool`] - Fee-ordered pending transactions
//!
//! ## Consensus
//! - [`consensus`] - Proof-of-work and proof-of-stake engines
//! - [`arbiter`] - Round-based candidate arbitration and commit
//! - [`producer`] - Block producer tasks
//!
//! ## Cryptography
//! - [`crypto`] - SHA-256 and secp256k1 signatures
//!
//! ## Collaborators
//! - [`wallet`] - Key directory, signer and reference wallet
//! - [`contract`] - Contract execution boundary
//! - [`governance`] - Consensus parameters and feature switches
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types
//! - [`node`] - Component wiring

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod blockchain;
pub mod mempool;
pub mod transaction;

// ============================================================================
// Consensus
// ============================================================================
pub mod arbiter;
pub mod consensus;
pub mod producer;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Collaborators
// ============================================================================
pub mod contract;
pub mod governance;
pub mod wallet;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
pub mod node;
