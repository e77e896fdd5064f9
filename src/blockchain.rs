// Thin re-export module: the block model, ledger state and candidate
// validation live under `blockchain/core/`.

pub mod core;
pub use self::core::*;
