//! Workspace data model (§4.5).

use std::collections::HashSet;

use crate::ids::{ServerId, WorkspaceId};
use crate::workspace::apps::App;

/// Derived, not stored — always recomputed from `current_task` and
/// `login_status` (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunLevel {
    Stopped,
    Offline,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentTask {
    Stop,
    Spawn,
    Rebuild,
    WorkOffline,
    WorkOnline,
    DeleteLocally,
    DeleteRemotely,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserTask {
    Stop,
    WorkOffline,
    WorkOnline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStatus {
    LoggedOut,
    /// Three-step cascade position while a login attempt is in flight.
    LoggingIn(LoginStep),
    LoggedIn,
    /// Transient: waiting on the client to supply a password (§4.5).
    PwdRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginStep {
    Cached,
    Ticket,
    Pwd,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub ticket: Option<String>,
    pub password_remembered: bool,
    pub cached_password: Option<String>,
}

impl Default for Credentials {
    fn default() -> Self {
        Self { ticket: None, password_remembered: false, cached_password: None }
    }
}

#[derive(Debug)]
pub struct Workspace {
    pub id: WorkspaceId,
    pub server_id: ServerId,
    pub name: String,
    pub external_kws_id: String,
    pub user_email_id: String,

    pub current_task: CurrentTask,
    pub user_task: UserTask,
    pub login_status: LoginStatus,
    pub credentials: Credentials,

    /// Auxiliary sub-step counters referenced by §4.5's derived want-flags.
    pub spawn_step_complete: bool,
    pub delete_remotely_step: DeleteRemotelyStep,
    pub rebuild_flags: RebuildFlags,
    pub last_received_event_id: u64,

    pub enabled_apps: HashSet<App>,
    /// Whether application handlers have been started for this pass of
    /// `want_app_running` (§4.5 step 2) — prevents re-starting on every
    /// wake-up while the task is unchanged.
    pub apps_running: bool,

    /// Result of the most recently completed login attempt, if any
    /// (§3 `server_state.login_result`).
    pub login_result: Option<crate::error::LoginResult>,
    /// Mirrors `server_state.events_up_to_date` (§3): true once the event
    /// log has been drained to the server's last known event id.
    pub events_up_to_date: bool,
    /// Mirrors `server_state.unprocessed_count` (§3, §8 invariant 4).
    pub unprocessed_count: u64,

    /// Bumped whenever transient UI-visible state changes (§4.7 `need_sync`).
    pub transient_rev: u64,
    /// Bumped whenever durable state changes (persisted on next serialization).
    pub permanent_rev: u64,

    pub ready_to_remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteRemotelyStep {
    NotStarted,
    Logout,
    EnsureConnected,
    Login,
    Done,
}

impl Workspace {
    pub fn new(id: WorkspaceId, server_id: ServerId, name: String, external_kws_id: String, user_email_id: String) -> Self {
        Self {
            id,
            server_id,
            name,
            external_kws_id,
            user_email_id,
            current_task: CurrentTask::Spawn,
            user_task: UserTask::WorkOnline,
            login_status: LoginStatus::LoggedOut,
            credentials: Credentials::default(),
            spawn_step_complete: false,
            delete_remotely_step: DeleteRemotelyStep::NotStarted,
            rebuild_flags: RebuildFlags::NONE,
            last_received_event_id: 0,
            enabled_apps: HashSet::new(),
            apps_running: false,
            login_result: None,
            events_up_to_date: false,
            unprocessed_count: 0,
            transient_rev: 0,
            permanent_rev: 0,
            ready_to_remove: false,
        }
    }

    /// Derived run level (§4.5): never stored directly.
    pub fn run_level(&self) -> RunLevel {
        match (self.current_task, self.login_status) {
            (CurrentTask::Stop, _) => RunLevel::Stopped,
            (_, LoginStatus::LoggedIn) => RunLevel::Online,
            _ => RunLevel::Offline,
        }
    }

    pub fn want_app_running(&self) -> bool {
        !matches!(self.current_task, CurrentTask::Stop | CurrentTask::DeleteLocally)
    }

    pub fn want_server_connected(&self) -> bool {
        matches!(
            self.current_task,
            CurrentTask::Spawn | CurrentTask::Rebuild | CurrentTask::WorkOnline | CurrentTask::DeleteRemotely
        )
    }

    pub fn want_login(&self) -> bool {
        if !self.want_server_connected() {
            return false;
        }
        match self.current_task {
            // Only the `Login` step of the delete-remotely walk should
            // attempt a login cascade (§4.8); the earlier steps are
            // strictly ordered before it.
            CurrentTask::DeleteRemotely => self.delete_remotely_step == DeleteRemotelyStep::Login,
            _ => true,
        }
    }

    pub fn bump_transient(&mut self) {
        self.transient_rev += 1;
    }

    pub fn bump_permanent(&mut self) {
        self.permanent_rev += 1;
        self.transient_rev += 1;
    }

    /// Out-of-sync recovery (§4.5, §8 scenario 2): server says our stored
    /// last-event-id is stale. Schedule a rebuild that flushes both sides.
    pub fn schedule_rebuild_on_oos(&mut self) {
        self.current_task = CurrentTask::Rebuild;
        self.rebuild_flags = RebuildFlags::FLUSH_SERVER_DATA | RebuildFlags::FLUSH_LOCAL_DATA;
        self.last_received_event_id = 0;
        self.login_result = Some(crate::error::LoginResult::Oos);
        self.events_up_to_date = false;
        self.bump_permanent();
    }
}

/// Minimal hand-rolled bitflag set (rebuild flush flags, §4.5) — avoids
/// pulling in a flags crate for two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildFlags(u8);

impl RebuildFlags {
    pub const NONE: RebuildFlags = RebuildFlags(0);
    pub const FLUSH_SERVER_DATA: RebuildFlags = RebuildFlags(1 << 0);
    pub const FLUSH_LOCAL_DATA: RebuildFlags = RebuildFlags(1 << 1);

    pub fn contains(self, other: RebuildFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for RebuildFlags {
    type Output = RebuildFlags;
    fn bitor(self, rhs: RebuildFlags) -> RebuildFlags {
        RebuildFlags(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws() -> Workspace {
        Workspace::new(WorkspaceId(1), ServerId(1), "Acme".to_string(), "kws-1".to_string(), "user@example.com".to_string())
    }

    #[test]
    fn stop_task_is_stopped_runlevel_regardless_of_login() {
        let mut w = ws();
        w.current_task = CurrentTask::Stop;
        assert_eq!(w.run_level(), RunLevel::Stopped);
    }

    #[test]
    fn logged_in_is_online() {
        let mut w = ws();
        w.current_task = CurrentTask::WorkOnline;
        w.login_status = LoginStatus::LoggedIn;
        assert_eq!(w.run_level(), RunLevel::Online);
    }

    #[test]
    fn oos_rebuild_sets_both_flush_flags_and_resets_event_id() {
        let mut w = ws();
        w.last_received_event_id = 100;
        w.schedule_rebuild_on_oos();
        assert_eq!(w.current_task, CurrentTask::Rebuild);
        assert!(w.rebuild_flags.contains(RebuildFlags::FLUSH_SERVER_DATA));
        assert!(w.rebuild_flags.contains(RebuildFlags::FLUSH_LOCAL_DATA));
        assert_eq!(w.last_received_event_id, 0);
    }

    #[test]
    fn bump_permanent_also_bumps_transient() {
        let mut w = ws();
        let (t0, p0) = (w.transient_rev, w.permanent_rev);
        w.bump_permanent();
        assert!(w.transient_rev > t0);
        assert!(w.permanent_rev > p0);
    }
}
