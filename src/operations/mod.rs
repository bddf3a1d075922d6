//! Core-operation framework (§4.8, §9 DESIGN NOTES).
//!
//! Every client command with a non-trivial lifecycle is modelled as a
//! `CoreOp` — not a trait object, but a sum-type variant the manager
//! matches on, the same way `workspace::apps::App` dispatches without a
//! vtable. An op registers as the sole listener on one workspace's
//! notification queue (`NotificationQueue::subscribe`) and is driven purely
//! by the notifications the manager forwards to it; it never touches a
//! transport or the crypto helper directly.
//!
//! The base dispatch rules below are what every op's listener inherits
//! before its own step logic runs: a server disconnect, a logout, or an
//! unwelcome task switch fails the op outright unless it explicitly
//! tolerates the new state.

use crate::client::command::{ChannelId, RequestId};
use crate::error::CoreError;
use crate::ids::WorkspaceId;
use crate::workspace::notify::{Notification, ServerConnState};
use crate::workspace::state::{CurrentTask, DeleteRemotelyStep, LoginStatus};

pub type OpId = u64;

/// Where a finished op's result is delivered: the external-client channel
/// and request id the originating command carried (§4.7).
#[derive(Debug, Clone, Copy)]
pub struct OpOrigin {
    pub channel: ChannelId,
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateWorkspaceStep {
    Initial,
    TicketReply,
    Connecting,
    CreateReply,
    LoggingIn,
    Done,
}

#[derive(Debug)]
pub struct CreateWorkspaceOp {
    pub id: OpId,
    pub workspace: WorkspaceId,
    pub origin: OpOrigin,
    pub step: CreateWorkspaceStep,
    pub done: bool,
    pub error: Option<CoreError>,
}

#[derive(Debug)]
pub struct DeleteRemotelyOp {
    pub id: OpId,
    pub workspace: WorkspaceId,
    pub origin: OpOrigin,
    pub done: bool,
    pub error: Option<CoreError>,
}

#[derive(Debug)]
pub enum CoreOp {
    CreateWorkspace(CreateWorkspaceOp),
    DeleteRemotely(DeleteRemotelyOp),
}

impl CoreOp {
    pub fn workspace(&self) -> WorkspaceId {
        match self {
            CoreOp::CreateWorkspace(op) => op.workspace,
            CoreOp::DeleteRemotely(op) => op.workspace,
        }
    }

    pub fn origin(&self) -> OpOrigin {
        match self {
            CoreOp::CreateWorkspace(op) => op.origin,
            CoreOp::DeleteRemotely(op) => op.origin,
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            CoreOp::CreateWorkspace(op) => op.done,
            CoreOp::DeleteRemotely(op) => op.done,
        }
    }

    pub fn error(&self) -> Option<&CoreError> {
        match self {
            CoreOp::CreateWorkspace(op) => op.error.as_ref(),
            CoreOp::DeleteRemotely(op) => op.error.as_ref(),
        }
    }

    /// `cancel()` (§4.8): a no-op on an already-completed op, otherwise
    /// sets `error = Cancelled` exactly once.
    pub fn cancel(&mut self) {
        if self.is_done() {
            return;
        }
        self.handle_failure(CoreError::Cancelled);
    }

    /// `handle_failure()` (§4.8): idempotent terminal failure.
    pub fn handle_failure(&mut self, err: CoreError) {
        match self {
            CoreOp::CreateWorkspace(op) if !op.done => {
                op.done = true;
                op.error = Some(err);
            }
            CoreOp::DeleteRemotely(op) if !op.done => {
                op.done = true;
                op.error = Some(err);
            }
            _ => {}
        }
    }

    /// Whether this op explicitly tolerates `task` mid-flight (§4.8
    /// dispatch rule for `TaskSwitch`) instead of failing on it.
    fn tolerates_task(&self, task: CurrentTask) -> bool {
        match self {
            CoreOp::CreateWorkspace(_) => {
                matches!(task, CurrentTask::Spawn | CurrentTask::WorkOnline | CurrentTask::WorkOffline)
            }
            CoreOp::DeleteRemotely(_) => matches!(task, CurrentTask::DeleteRemotely),
        }
    }

    /// Feeds one notification through the base dispatch rules (§4.8), then
    /// the op's own step logic if the base rules didn't already fail it.
    pub fn on_notification(&mut self, notif: &Notification) {
        if self.is_done() {
            return;
        }
        if let Some(err) = base_dispatch(self, notif) {
            self.handle_failure(err);
            return;
        }
        match self {
            CoreOp::CreateWorkspace(op) => advance_create_workspace(op, notif),
            CoreOp::DeleteRemotely(op) => advance_delete_remotely(op, notif),
        }
    }
}

/// Dispatch rules built into the base listener (§4.8): a disconnect, a
/// logout, or an intolerable task switch fails the op with the carried
/// error, or `Interrupted` if none was given.
///
/// `DeleteRemotely`'s own success sentinel — `LoginChange(LoggedOut,
/// Some(DeletedKws))` — is exempted from the generic logout-failure arm:
/// that notification is this op's completion signal, not a failure, and
/// its own step logic (`advance_delete_remotely`) handles it.
fn base_dispatch(op: &CoreOp, notif: &Notification) -> Option<CoreError> {
    match notif {
        Notification::ServerConnChange(ServerConnState::Disconnecting | ServerConnState::Disconnected, err) => {
            Some(err.clone().unwrap_or(CoreError::Interrupted))
        }
        Notification::LoginChange(LoginStatus::LoggedOut, Some(CoreError::Semantic(crate::error::SemanticError::DeletedKws)))
            if matches!(op, CoreOp::DeleteRemotely(_)) =>
        {
            None
        }
        Notification::LoginChange(LoginStatus::LoggedOut, Some(err)) => Some(err.clone()),
        Notification::TaskSwitch(task, err) => {
            if op.tolerates_task(*task) {
                None
            } else {
                Some(err.clone().unwrap_or(CoreError::Interrupted))
            }
        }
        _ => None,
    }
}

/// `CreateWorkspace` (§4.8): `Initial -> TicketReply -> Connecting ->
/// CreateReply -> LoggingIn -> Done`. Bring-up itself is driven by the
/// workspace state machine (§4.5); this op just rides along, advancing its
/// own step markers on the signals that correspond to each transition and
/// completing once login succeeds.
fn advance_create_workspace(op: &mut CreateWorkspaceOp, notif: &Notification) {
    match notif {
        Notification::ServerConnChange(ServerConnState::Connecting, _) if op.step == CreateWorkspaceStep::Initial => {
            op.step = CreateWorkspaceStep::TicketReply;
        }
        Notification::ServerConnChange(ServerConnState::Connected, _) => {
            if matches!(op.step, CreateWorkspaceStep::Initial | CreateWorkspaceStep::TicketReply) {
                op.step = CreateWorkspaceStep::Connecting;
            }
        }
        Notification::LoginChange(LoginStatus::LoggingIn(_), None) => {
            if op.step < CreateWorkspaceStep::LoggingIn {
                op.step = CreateWorkspaceStep::CreateReply;
            }
            op.step = CreateWorkspaceStep::LoggingIn;
        }
        Notification::LoginChange(LoginStatus::LoggedIn, None) => {
            op.step = CreateWorkspaceStep::Done;
            op.done = true;
        }
        Notification::LoginChange(LoginStatus::PwdRequired, _) => {
            // Waiting on `SetLoginPwd` is not a failure — the op simply
            // stays in `LoggingIn` until the cascade resumes or the client
            // cancels it.
        }
        _ => {}
    }
}

impl PartialOrd for CreateWorkspaceStep {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for CreateWorkspaceStep {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(s: &CreateWorkspaceStep) -> u8 {
            match s {
                CreateWorkspaceStep::Initial => 0,
                CreateWorkspaceStep::TicketReply => 1,
                CreateWorkspaceStep::Connecting => 2,
                CreateWorkspaceStep::CreateReply => 3,
                CreateWorkspaceStep::LoggingIn => 4,
                CreateWorkspaceStep::Done => 5,
            }
        }
        rank(self).cmp(&rank(other))
    }
}

/// `DeleteRemotely` (§4.8): logout -> ensure connected -> advance
/// `delete_remotely_step` to `Login` -> await a `DeletedKws` login result
/// -> local deletion. The step walk itself lives in
/// `workspace::machine::advance_delete_remotely`; this op watches for the
/// `DeletedKws` login outcome and the eventual `Stop` task switch that
/// local deletion produces.
fn advance_delete_remotely(op: &mut DeleteRemotelyOp, notif: &Notification) {
    if let Notification::LoginChange(LoginStatus::LoggedOut, Some(CoreError::Semantic(crate::error::SemanticError::DeletedKws))) = notif {
        op.done = true;
    }
}

/// Whether a workspace's delete-remotely orchestration has reached the
/// point where the manager should locally remove it (§4.8).
pub fn delete_remotely_finished(step: DeleteRemotelyStep) -> bool {
    step == DeleteRemotelyStep::Done
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> OpOrigin {
        OpOrigin { channel: ChannelId(1), request_id: RequestId(1) }
    }

    fn create_op() -> CoreOp {
        CoreOp::CreateWorkspace(CreateWorkspaceOp {
            id: 1,
            workspace: WorkspaceId(1),
            origin: origin(),
            step: CreateWorkspaceStep::Initial,
            done: false,
            error: None,
        })
    }

    #[test]
    fn server_disconnect_fails_the_op_with_interrupted_by_default() {
        let mut op = create_op();
        op.on_notification(&Notification::ServerConnChange(ServerConnState::Disconnected, None));
        assert!(op.is_done());
        assert!(matches!(op.error(), Some(CoreError::Interrupted)));
    }

    #[test]
    fn login_change_to_logged_in_completes_create_workspace() {
        let mut op = create_op();
        op.on_notification(&Notification::LoginChange(LoginStatus::LoggedIn, None));
        assert!(op.is_done());
        assert!(op.error().is_none());
    }

    #[test]
    fn cancel_is_idempotent() {
        let mut op = create_op();
        op.cancel();
        assert!(matches!(op.error(), Some(CoreError::Cancelled)));
        op.on_notification(&Notification::LoginChange(LoginStatus::LoggedIn, None));
        assert!(matches!(op.error(), Some(CoreError::Cancelled)), "completed op must not flip outcome");
    }

    #[test]
    fn delete_remotely_op_tolerates_its_own_task() {
        let mut op = CoreOp::DeleteRemotely(DeleteRemotelyOp {
            id: 2,
            workspace: WorkspaceId(1),
            origin: origin(),
            done: false,
            error: None,
        });
        op.on_notification(&Notification::TaskSwitch(CurrentTask::DeleteRemotely, None));
        assert!(!op.is_done());
    }

    #[test]
    fn delete_remotely_op_completes_on_deleted_kws() {
        let mut op = CoreOp::DeleteRemotely(DeleteRemotelyOp {
            id: 2,
            workspace: WorkspaceId(1),
            origin: origin(),
            done: false,
            error: None,
        });
        op.on_notification(&Notification::LoginChange(
            LoginStatus::LoggedOut,
            Some(CoreError::Semantic(crate::error::SemanticError::DeletedKws)),
        ));
        assert!(op.is_done());
        assert!(op.error().is_none());
    }

    #[test]
    fn unrelated_task_switch_fails_create_workspace_op() {
        let mut op = create_op();
        op.on_notification(&Notification::TaskSwitch(CurrentTask::DeleteRemotely, None));
        assert!(op.is_done());
    }
}
