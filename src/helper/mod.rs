//! Crypto-helper broker (§4.4).
//!
//! Owns one long-lived sub-process speaking the ASCII-tagged codec
//! (`codec::helper`). All cryptographic operations — ticket requests, key
//! derivation, signature verification — are delegated to this process;
//! this repo never implements cryptography itself.

pub mod broker;
pub mod transaction;

pub use broker::{CryptoHelperBroker, HelperState};
pub use transaction::{Transaction, TransactionId, TransactionStatus};
