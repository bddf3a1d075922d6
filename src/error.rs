//! The error taxonomy shared by every component (§7).
//!
//! `CoreError` is the single enum all state machines propagate. Conversions
//! from I/O, codec, and persistence errors live at the narrowest boundary
//! that first observes them, per the propagation policy in §7: transport
//! errors stay scoped to a server, auth errors stay scoped to a workspace's
//! login cascade, and `Internal` is the only variant that is ever allowed to
//! bubble all the way out of the coordination thread.

use std::fmt;

/// Structured login refusal / server-side semantic codes (§4.5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Accepted,
    BadSecurityCreds,
    Oos,
    BadKwsId,
    BadEmailId,
    DeletedKws,
    AccountLocked,
    Banned,
    CannotGetTicket,
    MiscError,
}

impl fmt::Display for LoginResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// The full error taxonomy (§7).
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoreError {
    /// Wire-format violation while decoding a message.
    #[error("decode error: {0}")]
    Decode(String),

    /// A received message violated a protocol-level expectation
    /// (e.g. unexpected message type for the current state).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Socket or sub-process failure. Scoped to one server connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Authentication-cascade failure. Scoped to one workspace's login.
    #[error("auth error: {0:?}")]
    Auth(LoginResult),

    /// Semantic server refusal not related to authentication.
    #[error("semantic error: {0}")]
    Semantic(SemanticError),

    /// A core operation or query was explicitly cancelled by its owner.
    #[error("cancelled")]
    Cancelled,

    /// A core operation was aborted because its prerequisite (connection,
    /// login, workspace) went away out from under it.
    #[error("interrupted")]
    Interrupted,

    /// A bounded wait (tunnel handshake, helper transaction) expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// A logic invariant was violated. Fatal: the coordinator cannot
    /// recover and must serialize-if-safe and exit non-zero.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Non-auth semantic refusals (§7).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SemanticError {
    #[error("unknown workspace id")]
    BadKwsId,
    #[error("unknown email id")]
    BadEmailId,
    #[error("workspace was deleted on the server")]
    DeletedKws,
    #[error("workspace event log is out of sync with the server")]
    Oos,
    #[error("server namespace requires a newer client version")]
    UpgradeRequired,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CoreError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CoreError::Internal(msg.into())
    }

    /// True for errors that should isolate to the server connection rather
    /// than to a single workspace (§7 propagation policy).
    pub fn is_transport_scoped(&self) -> bool {
        matches!(self, CoreError::Transport(_) | CoreError::Protocol(_))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Transport(e.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Transport(_)));
        assert!(err.is_transport_scoped());
    }

    #[test]
    fn internal_is_not_transport_scoped() {
        let err = CoreError::internal("invariant violated");
        assert!(!err.is_transport_scoped());
    }
}
