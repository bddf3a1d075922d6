//! Coordinator-side server handle (§4.3, §4.6, §8 invariant 1).
//!
//! This is the manager's view of a server: it never touches the transport
//! directly (that's the broker's job) — it tracks who wants the server
//! connected and the reconnect-backoff state.

use std::collections::HashSet;
use std::time::Instant;

use crate::constants::{BACKOFF_FACTOR, MAX_BACKOFF, RECONNECT_DELAY};
use crate::error::CoreError;
use crate::ids::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Scheduled,
    Connecting,
    /// Reserved for a broker that negotiates the wire handshake itself and
    /// can report it as a phase distinct from raw TCP connect; the current
    /// broker folds both into one `Connected` signal, so this state is
    /// never entered yet (§9 open questions).
    RoleReply,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub host: String,
    pub port: u16,
    pub status: ConnStatus,
    /// Workspaces that currently want this server connected. Invariant 1
    /// (§8): `status ∈ {Connecting, Connected} ⟺ connect_workspaces ≠ ∅`
    /// (or the server is mid-shutdown).
    pub connect_workspaces: HashSet<WorkspaceId>,
    pub negotiated_minor: Option<u16>,
    pub failed_connect_count: u32,
    pub last_error_at: Option<Instant>,
    pub last_error: Option<CoreError>,
}

impl ServerHandle {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            status: ConnStatus::Scheduled,
            connect_workspaces: HashSet::new(),
            negotiated_minor: None,
            failed_connect_count: 0,
            last_error_at: None,
            last_error: None,
        }
    }

    pub fn want_connected(&self) -> bool {
        !self.connect_workspaces.is_empty()
    }

    pub fn request_connect(&mut self, workspace: WorkspaceId) {
        self.connect_workspaces.insert(workspace);
        if self.status == ConnStatus::Disconnected {
            self.status = ConnStatus::Scheduled;
        }
    }

    /// Idempotent: dropping the last interested workspace does not force a
    /// disconnect here — that's the manager pass's job once the set is
    /// observed empty with no in-flight operations depending on it.
    pub fn release_connect(&mut self, workspace: WorkspaceId) {
        self.connect_workspaces.remove(&workspace);
    }

    pub fn on_connected(&mut self, negotiated_minor: u16) {
        self.status = ConnStatus::Connected;
        self.negotiated_minor = Some(negotiated_minor);
        // Cleared only on successful *connect*, never on mere read success
        // (§4.6) — a server that accepts TCP but always fails role
        // negotiation must not be masked as healthy.
        self.failed_connect_count = 0;
    }

    pub fn on_disconnected(&mut self, reason: Option<CoreError>, now: Instant) {
        self.status = ConnStatus::Disconnected;
        self.negotiated_minor = None;
        if reason.is_some() {
            self.failed_connect_count = self.failed_connect_count.saturating_add(1);
        }
        self.last_error_at = Some(now);
        self.last_error = reason;
    }

    /// Reconnect deadline per §4.6:
    /// `error_ts + reconnect_delay * backoff_factor^min(max(n-1,0), max_backoff)`.
    pub fn reconnect_deadline(&self) -> Option<Instant> {
        let error_ts = self.last_error_at?;
        let n = self.failed_connect_count;
        let exponent = (n.saturating_sub(1)).min(MAX_BACKOFF);
        let multiplier = BACKOFF_FACTOR.saturating_pow(exponent);
        Some(error_ts + RECONNECT_DELAY * multiplier)
    }

    pub fn reconnect_is_due(&self, now: Instant) -> bool {
        match self.reconnect_deadline() {
            Some(deadline) => now >= deadline,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn backoff_grows_with_failure_count_and_caps_at_max_backoff() {
        let mut h = ServerHandle::new("kcd.example".to_string(), 443);
        let base = Instant::now();

        h.on_disconnected(Some(CoreError::Transport("reset".into())), base);
        let d1 = h.reconnect_deadline().unwrap();
        assert_eq!(d1, base + RECONNECT_DELAY);

        h.failed_connect_count = 3;
        h.last_error_at = Some(base);
        let d3 = h.reconnect_deadline().unwrap();
        assert_eq!(d3, base + RECONNECT_DELAY * BACKOFF_FACTOR.pow(2));

        h.failed_connect_count = 50;
        h.last_error_at = Some(base);
        let capped = h.reconnect_deadline().unwrap();
        assert_eq!(capped, base + RECONNECT_DELAY * BACKOFF_FACTOR.pow(MAX_BACKOFF));
    }

    #[test]
    fn successful_connect_clears_failure_count() {
        let mut h = ServerHandle::new("kcd.example".to_string(), 443);
        h.on_disconnected(Some(CoreError::Transport("x".into())), Instant::now());
        assert_eq!(h.failed_connect_count, 1);
        h.on_connected(3);
        assert_eq!(h.failed_connect_count, 0);
    }

    #[test]
    fn want_connected_tracks_workspace_set() {
        let mut h = ServerHandle::new("kcd.example".to_string(), 443);
        assert!(!h.want_connected());
        h.request_connect(WorkspaceId(1));
        assert!(h.want_connected());
        h.release_connect(WorkspaceId(1));
        assert!(!h.want_connected());
    }

    #[test]
    fn no_prior_error_means_reconnect_due_immediately() {
        let h = ServerHandle::new("kcd.example".to_string(), 443);
        assert!(h.reconnect_is_due(Instant::now()));
    }

    #[test]
    fn reconnect_not_due_before_deadline() {
        let mut h = ServerHandle::new("kcd.example".to_string(), 443);
        h.on_disconnected(Some(CoreError::Transport("x".into())), Instant::now());
        assert!(!h.reconnect_is_due(Instant::now() + Duration::from_secs(1)));
    }
}
