//! Workspace state machine driver (§4.5).
//!
//! `run_pass` is the procedure the manager calls once per workspace per
//! wake-up. It never touches a transport or the crypto helper directly —
//! it returns a small set of `Action`s the manager carries out against the
//! server broker, the helper broker, and the persistence facade, keeping
//! this module testable without any I/O.

use crate::error::{CoreError, LoginResult, SemanticError};
use crate::ids::WorkspaceId;
use crate::persistence::{Direction, EventLog, EventStatus};
use crate::workspace::apps::{self, App};
use crate::workspace::notify::{Notification, NotificationQueue, ServerConnState};
use crate::workspace::state::{CurrentTask, DeleteRemotelyStep, LoginStatus, LoginStep, Workspace};

/// What the manager must do in response to one `run_pass` (or event
/// dispatch) call. Most fields are `None`/`false` on a quiescent pass.
#[derive(Debug, Default, Clone)]
pub struct Actions {
    /// The workspace now wants (or no longer wants) its server connected;
    /// the manager reconciles this against `ServerHandle::connect_workspaces`.
    pub want_server_connected: Option<bool>,
    /// Emit a login attempt for this step, once the server is connected.
    pub send_login: Option<LoginStep>,
    /// Request a fresh ticket from the crypto-helper broker before retrying
    /// login with `LoginStep::Ticket`.
    pub request_ticket: bool,
    /// A persisted event id that was just handed to its application
    /// handler and should be marked `Processed`.
    pub mark_processed: Option<u64>,
}

/// Advances one workspace by one pass (§4.5 `run_pass`). `quench_active`
/// comes from the manager's quench computation (§4.3) and gates step 5
/// (event drain) only — connect/login progress is never throttled.
pub fn run_pass(ws: &mut Workspace, notify: &mut NotificationQueue, events: &mut dyn EventLog, server_connected: bool, quench_active: bool) -> Actions {
    let mut actions = Actions::default();

    // Step 1: advance an in-progress rebuild by flushing whichever sides
    // its flags name, then fall through to a normal Spawn-like bring-up.
    if ws.current_task == CurrentTask::Rebuild {
        advance_rebuild(ws, events);
    }

    // Step 1b: walk the delete-remotely orchestration (§4.8): logout ->
    // ensure connected -> login. The core operation watching this
    // workspace completes once the login cascade below reports
    // `DeletedKws`.
    if ws.current_task == CurrentTask::DeleteRemotely {
        advance_delete_remotely(ws, server_connected);
    }

    // Step 2: start (or stop) application handlers.
    let want_apps = ws.want_app_running();
    if want_apps && !ws.apps_running {
        ws.apps_running = true;
        for app in ws.enabled_apps.clone() {
            notify.push(Notification::AppStatusChange(app));
        }
    } else if !want_apps && ws.apps_running {
        ws.apps_running = false;
        for app in ws.enabled_apps.clone() {
            notify.push(Notification::AppStatusChange(app));
        }
    }

    // Step 3: server connect tree.
    let want_connected = ws.want_server_connected();
    actions.want_server_connected = Some(want_connected);

    // Step 4: login, once connected and logged out.
    if ws.want_login() && server_connected && matches!(ws.login_status, LoginStatus::LoggedOut) {
        ws.login_status = LoginStatus::LoggingIn(LoginStep::Cached);
        actions.send_login = Some(LoginStep::Cached);
    }

    // Step 5: drain at most one unprocessed event, unless the manager's
    // quench says to hold off.
    if !quench_active {
        if let Some(record) = events.fetch_first_unprocessed(ws.id, Direction::Inbound) {
            match dispatch_payload(ws, notify, &record.payload) {
                Ok(()) => {
                    let _ = events.mark_status(ws.id, Direction::Inbound, record.event_id, EventStatus::Processed);
                    actions.mark_processed = Some(record.event_id);
                    ws.last_received_event_id = record.event_id;
                    ws.unprocessed_count = ws.unprocessed_count.saturating_sub(1);
                    ws.bump_permanent();
                }
                Err(err) => handle_dispatch_error(ws, notify, err),
            }
        } else if !ws.events_up_to_date {
            ws.events_up_to_date = true;
            notify.push(Notification::EventsUpToDate);
        }
    }

    actions
}

/// §4.5 rebuild: delete cached events and clear the user table (the app
/// handlers own the latter; only the event-log flush is this module's
/// concern), then resume as a normal bring-up.
fn advance_rebuild(ws: &mut Workspace, events: &mut dyn EventLog) {
    if ws.rebuild_flags.contains(crate::workspace::state::RebuildFlags::FLUSH_LOCAL_DATA) {
        let _ = events.delete_workspace(ws.id);
        ws.unprocessed_count = 0;
        ws.events_up_to_date = false;
    }
    ws.current_task = if ws.user_task == crate::workspace::state::UserTask::WorkOnline {
        CurrentTask::WorkOnline
    } else {
        CurrentTask::WorkOffline
    };
    ws.rebuild_flags = crate::workspace::state::RebuildFlags::NONE;
}

/// §4.8 `DeleteRemotely`: `NotStarted -> Logout -> EnsureConnected ->
/// Login -> Done`. `Done` is set by `handle_login_reply` once the server
/// confirms the deletion with `DeletedKws`; everything up to `Login` is
/// just sequencing, one step per pass.
fn advance_delete_remotely(ws: &mut Workspace, server_connected: bool) {
    match ws.delete_remotely_step {
        DeleteRemotelyStep::NotStarted => {
            ws.login_status = LoginStatus::LoggedOut;
            ws.delete_remotely_step = DeleteRemotelyStep::Logout;
        }
        DeleteRemotelyStep::Logout => {
            ws.delete_remotely_step = DeleteRemotelyStep::EnsureConnected;
        }
        DeleteRemotelyStep::EnsureConnected => {
            if server_connected {
                ws.delete_remotely_step = DeleteRemotelyStep::Login;
            }
        }
        DeleteRemotelyStep::Login | DeleteRemotelyStep::Done => {}
    }
}

/// Handles the server's reply to a login attempt, cascading through the
/// three-step protocol (§4.5). Returns the next `Actions` to carry out, if
/// the cascade isn't finished yet.
pub fn handle_login_reply(ws: &mut Workspace, notify: &mut NotificationQueue, result: LoginResult) -> Actions {
    ws.login_result = Some(result);
    let mut actions = Actions::default();

    match result {
        LoginResult::Accepted => {
            ws.login_status = LoginStatus::LoggedIn;
            ws.credentials.password_remembered = true;
            notify.push(Notification::LoginChange(LoginStatus::LoggedIn, None));
            ws.bump_permanent();
        }
        LoginResult::Oos => {
            ws.login_status = LoginStatus::LoggedOut;
            notify.push(Notification::LoginChange(LoginStatus::LoggedOut, Some(CoreError::Semantic(SemanticError::Oos))));
            ws.schedule_rebuild_on_oos();
        }
        LoginResult::BadSecurityCreds => {
            let current_step = match ws.login_status {
                LoginStatus::LoggingIn(step) => step,
                _ => LoginStep::Cached,
            };
            match current_step {
                LoginStep::Cached => {
                    ws.login_status = LoginStatus::LoggingIn(LoginStep::Ticket);
                    actions.request_ticket = true;
                }
                LoginStep::Ticket => {
                    ws.login_status = LoginStatus::PwdRequired;
                    notify.push(Notification::LoginChange(LoginStatus::PwdRequired, None));
                    ws.bump_transient();
                }
                LoginStep::Pwd => {
                    ws.login_status = LoginStatus::PwdRequired;
                    notify.push(Notification::LoginChange(
                        LoginStatus::PwdRequired,
                        Some(CoreError::Auth(LoginResult::BadSecurityCreds)),
                    ));
                    ws.bump_transient();
                }
            }
        }
        LoginResult::DeletedKws => {
            ws.login_status = LoginStatus::LoggedOut;
            if ws.current_task == CurrentTask::DeleteRemotely {
                ws.delete_remotely_step = DeleteRemotelyStep::Done;
            }
            notify.push(Notification::LoginChange(LoginStatus::LoggedOut, Some(CoreError::Semantic(SemanticError::DeletedKws))));
            ws.bump_permanent();
        }
        LoginResult::BadKwsId | LoginResult::BadEmailId | LoginResult::AccountLocked | LoginResult::Banned | LoginResult::CannotGetTicket | LoginResult::MiscError => {
            ws.login_status = LoginStatus::LoggedOut;
            notify.push(Notification::LoginChange(LoginStatus::LoggedOut, Some(CoreError::Auth(result))));
            ws.bump_transient();
        }
    }

    actions
}

/// Called once the external client supplies a password after `PwdRequired`
/// (§8 scenario 6). Resumes the cascade at the `Pwd` step.
pub fn supply_password(ws: &mut Workspace, password: String) -> Actions {
    ws.credentials.cached_password = Some(password);
    ws.login_status = LoginStatus::LoggingIn(LoginStep::Pwd);
    ws.bump_transient();
    Actions { send_login: Some(LoginStep::Pwd), ..Default::default() }
}

/// Dispatches one inbound event payload by namespace (§4.5 event dispatch).
/// `payload` is expected to carry the namespace tag as its first element;
/// for this core, that's modeled as a `(namespace, body)` split performed
/// by the caller via `codec::rpc::ElementReader` before the event reached
/// the log — here we just re-read it back out.
fn dispatch_payload(ws: &mut Workspace, notify: &mut NotificationQueue, payload: &[u8]) -> Result<(), CoreError> {
    let mut reader = crate::codec::rpc::ElementReader::new(payload);
    let namespace = reader.read_string()?;
    let body_len = reader.remaining();
    let body = &payload[payload.len() - body_len..];

    if namespace == "workspace" {
        return dispatch_workspace_namespace(ws, notify, body);
    }

    match App::from_namespace(&namespace) {
        Some(app) => apps::dispatch_event(app, ws.id, body),
        None => Err(CoreError::Semantic(SemanticError::UpgradeRequired)),
    }
}

fn dispatch_workspace_namespace(ws: &mut Workspace, notify: &mut NotificationQueue, body: &[u8]) -> Result<(), CoreError> {
    if body.is_empty() {
        return Err(CoreError::Decode("empty workspace-namespace event".to_string()));
    }
    // Minimal structural handling: a non-empty body is accepted as a
    // workspace-level update (user list / credential refresh / logout
    // cause); the payload's specific shape is owned by the application
    // layer this core does not implement (§1 out of scope).
    ws.bump_transient();
    notify.push(Notification::EventsUpToDate);
    Ok(())
}

/// A handler error transitions the workspace to `Stop(error)`; if it
/// happened mid-rebuild, that escalates the rebuild severity to a full
/// flush on the next attempt (§4.5).
fn handle_dispatch_error(ws: &mut Workspace, notify: &mut NotificationQueue, err: CoreError) {
    let was_rebuilding = ws.current_task == CurrentTask::Rebuild;
    ws.current_task = CurrentTask::Stop;
    if was_rebuilding {
        ws.rebuild_flags = crate::workspace::state::RebuildFlags::FLUSH_SERVER_DATA | crate::workspace::state::RebuildFlags::FLUSH_LOCAL_DATA;
    }
    notify.push(Notification::TaskSwitch(CurrentTask::Stop, Some(err)));
    ws.bump_permanent();
}

/// §4.5: a server disconnect (or disconnecting) notice fans out to every
/// workspace pinned to that server.
pub fn on_server_conn_change(ws: &mut Workspace, notify: &mut NotificationQueue, state: ServerConnState, err: Option<CoreError>) {
    if matches!(state, ServerConnState::Disconnecting | ServerConnState::Disconnected) {
        ws.login_status = LoginStatus::LoggedOut;
    }
    notify.push(Notification::ServerConnChange(state, err));
}

#[allow(dead_code)]
fn workspace_label(id: WorkspaceId) -> String {
    format!("kws_{id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ServerId;
    use crate::persistence::event_log::FileEventLog;

    fn ws() -> Workspace {
        Workspace::new(WorkspaceId(1), ServerId(1), "Acme".to_string(), "kws-1".to_string(), "user@example.com".to_string())
    }

    #[test]
    fn spawn_task_requests_login_once_connected_and_logged_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let mut w = ws();
        let mut notify = NotificationQueue::new();

        let actions = run_pass(&mut w, &mut notify, &mut log, true, false);
        assert_eq!(actions.send_login, Some(LoginStep::Cached));
        assert!(matches!(w.login_status, LoginStatus::LoggingIn(LoginStep::Cached)));
    }

    #[test]
    fn bad_creds_on_cached_step_requests_ticket() {
        let mut w = ws();
        w.login_status = LoginStatus::LoggingIn(LoginStep::Cached);
        let mut notify = NotificationQueue::new();
        let actions = handle_login_reply(&mut w, &mut notify, LoginResult::BadSecurityCreds);
        assert!(actions.request_ticket);
        assert!(matches!(w.login_status, LoginStatus::LoggingIn(LoginStep::Ticket)));
    }

    #[test]
    fn bad_creds_on_ticket_step_surfaces_pwd_required() {
        let mut w = ws();
        w.login_status = LoginStatus::LoggingIn(LoginStep::Ticket);
        let mut notify = NotificationQueue::new();
        handle_login_reply(&mut w, &mut notify, LoginResult::BadSecurityCreds);
        assert!(matches!(w.login_status, LoginStatus::PwdRequired));
    }

    #[test]
    fn password_cascade_fires_logged_in_exactly_once() {
        // §8 scenario 6: cached -> bad -> ticket -> bad -> PwdRequired ->
        // SetLoginPwd -> Accepted -> exactly one LoginChange(LoggedIn).
        let mut w = ws();
        let mut notify = NotificationQueue::new();

        w.login_status = LoginStatus::LoggingIn(LoginStep::Cached);
        handle_login_reply(&mut w, &mut notify, LoginResult::BadSecurityCreds);
        handle_login_reply(&mut w, &mut notify, LoginResult::BadSecurityCreds);
        assert!(matches!(w.login_status, LoginStatus::PwdRequired));

        supply_password(&mut w, "hunter2".to_string());
        let accepted_count_before = notify.drain().iter().filter(|n| matches!(n, Notification::LoginChange(LoginStatus::LoggedIn, None))).count();
        assert_eq!(accepted_count_before, 0);

        handle_login_reply(&mut w, &mut notify, LoginResult::Accepted);
        let drained = notify.drain();
        let logged_in_count = drained.iter().filter(|n| matches!(n, Notification::LoginChange(LoginStatus::LoggedIn, None))).count();
        assert_eq!(logged_in_count, 1);
        assert!(matches!(w.login_status, LoginStatus::LoggedIn));
    }

    #[test]
    fn oos_reply_schedules_rebuild_and_clears_event_id() {
        let mut w = ws();
        w.last_received_event_id = 100;
        w.login_status = LoginStatus::LoggingIn(LoginStep::Cached);
        let mut notify = NotificationQueue::new();
        handle_login_reply(&mut w, &mut notify, LoginResult::Oos);
        assert_eq!(w.current_task, CurrentTask::Rebuild);
        assert_eq!(w.last_received_event_id, 0);
    }

    #[test]
    fn deleted_kws_during_delete_remotely_marks_step_done() {
        let mut w = ws();
        w.current_task = CurrentTask::DeleteRemotely;
        w.delete_remotely_step = DeleteRemotelyStep::Login;
        w.login_status = LoginStatus::LoggingIn(LoginStep::Cached);
        let mut notify = NotificationQueue::new();
        handle_login_reply(&mut w, &mut notify, LoginResult::DeletedKws);
        assert_eq!(w.delete_remotely_step, DeleteRemotelyStep::Done);
    }

    #[test]
    fn unknown_namespace_dispatch_error_stops_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let mut w = ws();
        let mut notify = NotificationQueue::new();

        let mut writer = crate::codec::rpc::ElementWriter::new();
        writer.write_string("some_unknown_future_app");
        writer.write_bin(b"body");
        log.insert(w.id, Direction::Inbound, writer.into_vec()).unwrap();

        run_pass(&mut w, &mut notify, &mut log, false, false);
        assert_eq!(w.current_task, CurrentTask::Stop);
    }

    #[test]
    fn quench_active_holds_off_event_drain() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let mut w = ws();
        let mut notify = NotificationQueue::new();

        let mut writer = crate::codec::rpc::ElementWriter::new();
        writer.write_string("chat");
        writer.write_bin(b"hello");
        log.insert(w.id, Direction::Inbound, writer.into_vec()).unwrap();

        let actions = run_pass(&mut w, &mut notify, &mut log, false, true);
        assert!(actions.mark_processed.is_none());
        assert!(log.fetch_first_unprocessed(w.id, Direction::Inbound).is_some());
    }
}
