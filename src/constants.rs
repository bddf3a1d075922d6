//! Tunable constants for the coordinator and brokers.
//!
//! These are the defaults described throughout §4; `RuntimeConfig` (see
//! `config.rs`) lets an operator override every one of them.

use std::time::Duration;

// ============================================================================
// Quench (§4.3)
// ============================================================================

/// Inbound queue length at which quench becomes `Forever`.
pub const QUEUE_QUENCH_MAX: usize = 50;

/// Number of events ingested per quench batch before a deadline gate applies.
pub const QUENCH_BATCH: usize = 100;

/// Per-event processing rate used to compute a batch's quench deadline.
pub const PROCESS_RATE: Duration = Duration::from_millis(5);

/// Maximum send/receive step pairs performed on one server socket per
/// broker iteration, keeping servers fair under load (§4.3).
pub const SERVER_TRANSFER_BUDGET: usize = 20;

// ============================================================================
// Reconnect backoff (§4.6)
// ============================================================================

pub const RECONNECT_DELAY: Duration = Duration::from_secs(60);
pub const BACKOFF_FACTOR: u32 = 4;
pub const MAX_BACKOFF: u32 = 5;

// ============================================================================
// Serialization cadence (§4.6)
// ============================================================================

pub const WM_SERIALIZATION_DELAY: Duration = Duration::from_secs(5 * 60);

// ============================================================================
// Timeouts (§5)
// ============================================================================

pub const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const TUNNEL_AUTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the broker's readiness-multiplexer wait during connect
/// polling.
pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on the broker's wait while polling sub-process liveness.
pub const SUBPROCESS_POLL_INTERVAL: Duration = Duration::from_millis(300);

// ============================================================================
// Server RPC message types (§4.1, §6) — carried in the frame header's
// `type` field. Not an exhaustive protocol; just the subset the manager
// needs to recognize to drive §4.5/§4.6.
// ============================================================================

pub const MSG_TYPE_SELECT_ROLE: u32 = 1;
pub const MSG_TYPE_SELECT_ROLE_REPLY: u32 = 2;
pub const MSG_TYPE_LOGIN: u32 = 3;
pub const MSG_TYPE_LOGIN_REPLY: u32 = 4;
pub const MSG_TYPE_EVENT: u32 = 5;
pub const MSG_TYPE_CREATE_WORKSPACE: u32 = 6;
pub const MSG_TYPE_CREATE_WORKSPACE_REPLY: u32 = 7;
pub const MSG_TYPE_DELETE_WORKSPACE: u32 = 8;
pub const MSG_TYPE_DELETE_WORKSPACE_REPLY: u32 = 9;

// ============================================================================
// Crypto-helper instruction codes (§4.4, §4.8) — the subset the manager and
// core-operation framework issue directly; application-layer instructions
// are out of scope (§1).
// ============================================================================

pub const HELPER_INSTR_GET_TICKET: u32 = 0x0001;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_constants_are_reasonable() {
        assert!(BACKOFF_FACTOR > 1);
        assert!(MAX_BACKOFF > 0);
        assert!(RECONNECT_DELAY >= Duration::from_secs(1));
    }
}
