//! Framed RPC codecs (§4.1, §6).
//!
//! Two wire formats are carried by the core: a big-endian length-delimited
//! binary codec used for both server RPC and client-control channels
//! (`rpc`), and an ASCII-tagged codec used for the crypto-helper
//! sub-process (`helper`).

pub mod helper;
pub mod rpc;
