//! Application handler dispatch (§9 REDESIGN FLAGS).
//!
//! A tagged-sum enum dispatched by `match`, not dynamic dispatch: the
//! application set is closed and known at compile time, so there's no need
//! to pay for a vtable or erase the handler's concrete type.

use crate::error::CoreError;
use crate::ids::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum App {
    Chat,
    Kfs,
    Vnc,
    PublicBoard,
}

impl App {
    /// Namespace tag carried on the wire for events routed to this app
    /// (§4.5 event dispatch).
    pub fn namespace(self) -> &'static str {
        match self {
            App::Chat => "chat",
            App::Kfs => "kfs",
            App::Vnc => "vnc",
            App::PublicBoard => "publicboard",
        }
    }

    pub fn from_namespace(ns: &str) -> Option<App> {
        match ns {
            "chat" => Some(App::Chat),
            "kfs" => Some(App::Kfs),
            "vnc" => Some(App::Vnc),
            "publicboard" => Some(App::PublicBoard),
            _ => None,
        }
    }
}

/// Dispatches one inbound application-namespaced event payload to its
/// handler. A handler error transitions the owning workspace to
/// `Stop(error)` per §4.5; during a rebuild it escalates rebuild severity
/// instead (handled by the caller in `workspace::machine`).
pub fn dispatch_event(app: App, workspace: WorkspaceId, payload: &[u8]) -> Result<(), CoreError> {
    match app {
        App::Chat => dispatch_chat(workspace, payload),
        App::Kfs => dispatch_kfs(workspace, payload),
        App::Vnc => dispatch_vnc(workspace, payload),
        App::PublicBoard => dispatch_public_board(workspace, payload),
    }
}

fn dispatch_chat(_workspace: WorkspaceId, payload: &[u8]) -> Result<(), CoreError> {
    if payload.is_empty() {
        return Err(CoreError::Decode("empty chat event payload".to_string()));
    }
    Ok(())
}

fn dispatch_kfs(_workspace: WorkspaceId, payload: &[u8]) -> Result<(), CoreError> {
    if payload.is_empty() {
        return Err(CoreError::Decode("empty kfs event payload".to_string()));
    }
    Ok(())
}

fn dispatch_vnc(_workspace: WorkspaceId, payload: &[u8]) -> Result<(), CoreError> {
    if payload.is_empty() {
        return Err(CoreError::Decode("empty vnc event payload".to_string()));
    }
    Ok(())
}

fn dispatch_public_board(_workspace: WorkspaceId, payload: &[u8]) -> Result<(), CoreError> {
    if payload.is_empty() {
        return Err(CoreError::Decode("empty public board event payload".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_roundtrips() {
        for app in [App::Chat, App::Kfs, App::Vnc, App::PublicBoard] {
            assert_eq!(App::from_namespace(app.namespace()), Some(app));
        }
    }

    #[test]
    fn unknown_namespace_is_none() {
        assert_eq!(App::from_namespace("screensharedeluxe"), None);
    }

    #[test]
    fn empty_payload_is_decode_error_not_panic() {
        assert!(dispatch_event(App::Chat, WorkspaceId(1), &[]).is_err());
    }
}
