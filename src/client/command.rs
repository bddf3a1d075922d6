//! Command/reply/event vocabulary for the external-client broker (§4.7).
//!
//! Framed over the wire with the same header + typed-element payload as
//! the server RPC codec (§4.1) — a command channel looks, to the decoder,
//! exactly like a server connection. The message-type tags below are a
//! disjoint numbering from the server protocol's (`constants::MSG_TYPE_*`):
//! the two never share a socket so there's no risk of collision, but
//! keeping them visibly distinct avoids a reader mistaking one for the
//! other.

use crate::codec::rpc::{ElementReader, ElementWriter};
use crate::error::CoreError;
use crate::ids::WorkspaceId;
use crate::workspace::apps::App;
use crate::workspace::state::{RunLevel, UserTask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

pub const MSG_CREATE_WORKSPACE: u32 = 1;
pub const MSG_DELETE_WORKSPACE: u32 = 2;
pub const MSG_SET_WORKSPACE_TASK: u32 = 3;
pub const MSG_SET_LOGIN_PWD: u32 = 4;
pub const MSG_FETCH_STATE: u32 = 5;
pub const MSG_FETCH_EVENT: u32 = 6;
pub const MSG_CHECK_EVENT_UUID: u32 = 7;
pub const MSG_INVITE: u32 = 8;
pub const MSG_LOOKUP_RECIPIENT: u32 = 9;
pub const MSG_POST_CHAT: u32 = 10;
pub const MSG_ACCEPT_CHAT_REQUEST: u32 = 11;
pub const MSG_START_SCREEN_SHARE: u32 = 12;
pub const MSG_JOIN_SCREEN_SHARE: u32 = 13;
pub const MSG_EXPORT_KWS: u32 = 14;
pub const MSG_IMPORT_KWS: u32 = 15;
pub const MSG_SUBSCRIBE: u32 = 16;
pub const MSG_UNSUBSCRIBE: u32 = 17;

pub const REPLY_OK: u32 = 100;
pub const REPLY_WORKSPACE_ID: u32 = 101;
pub const REPLY_FAILURE: u32 = 102;
pub const REPLY_RECIPIENTS: u32 = 103;
pub const REPLY_EVENT_BATCH: u32 = 104;
pub const REPLY_STATE: u32 = 105;
pub const REPLY_SCREEN_SHARE_SESSION: u32 = 106;
pub const REPLY_BOOL: u32 = 107;
pub const REPLY_BUNDLE: u32 = 108;

pub const EVENT_FETCH_STATE_HINT: u32 = 200;
pub const EVENT_CHAT_MSG_RECEIVED: u32 = 201;
pub const EVENT_WORKSPACE_CREATED: u32 = 202;
pub const EVENT_LOCAL_SCREEN_SHARE_SESSION: u32 = 203;

/// The thirteen commands §4.7 lists, plus the subscribe/unsubscribe pair
/// that arms and disarms a channel's event pushes for one workspace.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    CreateWorkspace { name: String, host: String, port: u16, external_kws_id: String, user_email_id: String },
    DeleteWorkspace { workspace: WorkspaceId, remotely: bool },
    SetWorkspaceTask { workspace: WorkspaceId, task: UserTask },
    SetLoginPwd { workspace: WorkspaceId, password: String },
    FetchState { workspace: WorkspaceId },
    FetchEvent { workspace: WorkspaceId, event_id: u64 },
    CheckEventUuid { workspace: WorkspaceId, uuid: String },
    Invite { workspace: WorkspaceId, email: String },
    LookupRecipientAddress { workspace: WorkspaceId, email: String },
    PostChatMessage { workspace: WorkspaceId, app: App, payload: Vec<u8> },
    AcceptChatRequest { workspace: WorkspaceId },
    StartScreenShareSession { workspace: WorkspaceId },
    JoinScreenShareSession { workspace: WorkspaceId, session_id: u64 },
    ExportKws { workspace: WorkspaceId },
    ImportKws { xml: String },
    Subscribe { workspace: WorkspaceId },
    Unsubscribe { workspace: WorkspaceId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    BadWorkspace,
    BadCredentials,
    Transport,
    Internal,
    Cancelled,
}

impl ErrorKind {
    fn tag(self) -> u32 {
        match self {
            ErrorKind::BadWorkspace => 0,
            ErrorKind::BadCredentials => 1,
            ErrorKind::Transport => 2,
            ErrorKind::Internal => 3,
            ErrorKind::Cancelled => 4,
        }
    }

    fn from_tag(tag: u32) -> ErrorKind {
        match tag {
            0 => ErrorKind::BadWorkspace,
            1 => ErrorKind::BadCredentials,
            2 => ErrorKind::Transport,
            4 => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

impl From<&CoreError> for ErrorKind {
    fn from(err: &CoreError) -> ErrorKind {
        match err {
            CoreError::Auth(_) => ErrorKind::BadCredentials,
            CoreError::Semantic(crate::error::SemanticError::BadKwsId | crate::error::SemanticError::BadEmailId) => ErrorKind::BadWorkspace,
            CoreError::Transport(_) | CoreError::Protocol(_) | CoreError::Timeout(_) => ErrorKind::Transport,
            CoreError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceSnapshot {
    pub id: WorkspaceId,
    pub name: String,
    pub run_level: RunLevel,
    pub unprocessed_count: u64,
}

#[derive(Debug, Clone)]
pub enum ClientReply {
    Ok,
    WorkspaceId(WorkspaceId),
    Failure(ErrorKind, String),
    Recipients(Vec<String>),
    EventBatch(Vec<(u64, Vec<u8>)>),
    State(WorkspaceSnapshot),
    ScreenShareSession(u64),
    Bool(bool),
    /// Exported credential bundle XML (§4.12).
    Bundle(String),
}

/// Fire-and-forget pushes (§4.7): no reply expected, delivered FIFO per
/// channel, dropped along with the channel if it can't keep up.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    FetchStateHint(WorkspaceId),
    ChatMsgReceived { workspace: WorkspaceId, payload: Vec<u8> },
    WorkspaceCreated(WorkspaceId),
    LocalScreenShareSession { workspace: WorkspaceId, session_id: u64 },
}

fn user_task_tag(t: UserTask) -> u32 {
    match t {
        UserTask::Stop => 0,
        UserTask::WorkOffline => 1,
        UserTask::WorkOnline => 2,
    }
}

fn user_task_from_tag(tag: u32) -> Result<UserTask, CoreError> {
    Ok(match tag {
        0 => UserTask::Stop,
        1 => UserTask::WorkOffline,
        2 => UserTask::WorkOnline,
        _ => return Err(CoreError::Decode(format!("unknown user task tag {tag}"))),
    })
}

fn run_level_tag(r: RunLevel) -> u32 {
    match r {
        RunLevel::Stopped => 0,
        RunLevel::Offline => 1,
        RunLevel::Online => 2,
    }
}

fn run_level_from_tag(tag: u32) -> RunLevel {
    match tag {
        0 => RunLevel::Stopped,
        2 => RunLevel::Online,
        _ => RunLevel::Offline,
    }
}

pub fn encode_command(cmd: &ClientCommand) -> (u32, Vec<u8>) {
    let mut w = ElementWriter::new();
    let msg_type = match cmd {
        ClientCommand::CreateWorkspace { name, host, port, external_kws_id, user_email_id } => {
            w.write_string(name).write_string(host).write_u32(*port as u32).write_string(external_kws_id).write_string(user_email_id);
            MSG_CREATE_WORKSPACE
        }
        ClientCommand::DeleteWorkspace { workspace, remotely } => {
            w.write_u64(workspace.0).write_u32(*remotely as u32);
            MSG_DELETE_WORKSPACE
        }
        ClientCommand::SetWorkspaceTask { workspace, task } => {
            w.write_u64(workspace.0).write_u32(user_task_tag(*task));
            MSG_SET_WORKSPACE_TASK
        }
        ClientCommand::SetLoginPwd { workspace, password } => {
            w.write_u64(workspace.0).write_string(password);
            MSG_SET_LOGIN_PWD
        }
        ClientCommand::FetchState { workspace } => {
            w.write_u64(workspace.0);
            MSG_FETCH_STATE
        }
        ClientCommand::FetchEvent { workspace, event_id } => {
            w.write_u64(workspace.0).write_u64(*event_id);
            MSG_FETCH_EVENT
        }
        ClientCommand::CheckEventUuid { workspace, uuid } => {
            w.write_u64(workspace.0).write_string(uuid);
            MSG_CHECK_EVENT_UUID
        }
        ClientCommand::Invite { workspace, email } => {
            w.write_u64(workspace.0).write_string(email);
            MSG_INVITE
        }
        ClientCommand::LookupRecipientAddress { workspace, email } => {
            w.write_u64(workspace.0).write_string(email);
            MSG_LOOKUP_RECIPIENT
        }
        ClientCommand::PostChatMessage { workspace, app, payload } => {
            w.write_u64(workspace.0).write_string(app.namespace()).write_bin(payload);
            MSG_POST_CHAT
        }
        ClientCommand::AcceptChatRequest { workspace } => {
            w.write_u64(workspace.0);
            MSG_ACCEPT_CHAT_REQUEST
        }
        ClientCommand::StartScreenShareSession { workspace } => {
            w.write_u64(workspace.0);
            MSG_START_SCREEN_SHARE
        }
        ClientCommand::JoinScreenShareSession { workspace, session_id } => {
            w.write_u64(workspace.0).write_u64(*session_id);
            MSG_JOIN_SCREEN_SHARE
        }
        ClientCommand::ExportKws { workspace } => {
            w.write_u64(workspace.0);
            MSG_EXPORT_KWS
        }
        ClientCommand::ImportKws { xml } => {
            w.write_string(xml);
            MSG_IMPORT_KWS
        }
        ClientCommand::Subscribe { workspace } => {
            w.write_u64(workspace.0);
            MSG_SUBSCRIBE
        }
        ClientCommand::Unsubscribe { workspace } => {
            w.write_u64(workspace.0);
            MSG_UNSUBSCRIBE
        }
    };
    (msg_type, w.into_vec())
}

pub fn decode_command(msg_type: u32, payload: &[u8]) -> Result<ClientCommand, CoreError> {
    let mut r = ElementReader::new(payload);
    Ok(match msg_type {
        MSG_CREATE_WORKSPACE => ClientCommand::CreateWorkspace {
            name: r.read_string()?,
            host: r.read_string()?,
            port: r.read_u32()? as u16,
            external_kws_id: r.read_string()?,
            user_email_id: r.read_string()?,
        },
        MSG_DELETE_WORKSPACE => ClientCommand::DeleteWorkspace { workspace: WorkspaceId(r.read_u64()?), remotely: r.read_u32()? != 0 },
        MSG_SET_WORKSPACE_TASK => {
            let workspace = WorkspaceId(r.read_u64()?);
            ClientCommand::SetWorkspaceTask { workspace, task: user_task_from_tag(r.read_u32()?)? }
        }
        MSG_SET_LOGIN_PWD => ClientCommand::SetLoginPwd { workspace: WorkspaceId(r.read_u64()?), password: r.read_string()? },
        MSG_FETCH_STATE => ClientCommand::FetchState { workspace: WorkspaceId(r.read_u64()?) },
        MSG_FETCH_EVENT => ClientCommand::FetchEvent { workspace: WorkspaceId(r.read_u64()?), event_id: r.read_u64()? },
        MSG_CHECK_EVENT_UUID => ClientCommand::CheckEventUuid { workspace: WorkspaceId(r.read_u64()?), uuid: r.read_string()? },
        MSG_INVITE => ClientCommand::Invite { workspace: WorkspaceId(r.read_u64()?), email: r.read_string()? },
        MSG_LOOKUP_RECIPIENT => ClientCommand::LookupRecipientAddress { workspace: WorkspaceId(r.read_u64()?), email: r.read_string()? },
        MSG_POST_CHAT => {
            let workspace = WorkspaceId(r.read_u64()?);
            let ns = r.read_string()?;
            let app = App::from_namespace(&ns).ok_or_else(|| CoreError::Decode(format!("unknown app namespace {ns}")))?;
            ClientCommand::PostChatMessage { workspace, app, payload: r.read_bin()? }
        }
        MSG_ACCEPT_CHAT_REQUEST => ClientCommand::AcceptChatRequest { workspace: WorkspaceId(r.read_u64()?) },
        MSG_START_SCREEN_SHARE => ClientCommand::StartScreenShareSession { workspace: WorkspaceId(r.read_u64()?) },
        MSG_JOIN_SCREEN_SHARE => ClientCommand::JoinScreenShareSession { workspace: WorkspaceId(r.read_u64()?), session_id: r.read_u64()? },
        MSG_EXPORT_KWS => ClientCommand::ExportKws { workspace: WorkspaceId(r.read_u64()?) },
        MSG_IMPORT_KWS => ClientCommand::ImportKws { xml: r.read_string()? },
        MSG_SUBSCRIBE => ClientCommand::Subscribe { workspace: WorkspaceId(r.read_u64()?) },
        MSG_UNSUBSCRIBE => ClientCommand::Unsubscribe { workspace: WorkspaceId(r.read_u64()?) },
        other => return Err(CoreError::Protocol(format!("unknown client command type {other}"))),
    })
}

pub fn encode_reply(reply: &ClientReply) -> (u32, Vec<u8>) {
    let mut w = ElementWriter::new();
    let msg_type = match reply {
        ClientReply::Ok => REPLY_OK,
        ClientReply::WorkspaceId(id) => {
            w.write_u64(id.0);
            REPLY_WORKSPACE_ID
        }
        ClientReply::Failure(kind, msg) => {
            w.write_u32(kind.tag()).write_string(msg);
            REPLY_FAILURE
        }
        ClientReply::Recipients(addrs) => {
            w.write_u32(addrs.len() as u32);
            for addr in addrs {
                w.write_string(addr);
            }
            REPLY_RECIPIENTS
        }
        ClientReply::EventBatch(events) => {
            w.write_u32(events.len() as u32);
            for (id, payload) in events {
                w.write_u64(*id).write_bin(payload);
            }
            REPLY_EVENT_BATCH
        }
        ClientReply::State(snap) => {
            w.write_u64(snap.id.0).write_string(&snap.name).write_u32(run_level_tag(snap.run_level)).write_u64(snap.unprocessed_count);
            REPLY_STATE
        }
        ClientReply::ScreenShareSession(id) => {
            w.write_u64(*id);
            REPLY_SCREEN_SHARE_SESSION
        }
        ClientReply::Bool(b) => {
            w.write_u32(*b as u32);
            REPLY_BOOL
        }
        ClientReply::Bundle(xml) => {
            w.write_string(xml);
            REPLY_BUNDLE
        }
    };
    (msg_type, w.into_vec())
}

pub fn decode_reply(msg_type: u32, payload: &[u8]) -> Result<ClientReply, CoreError> {
    let mut r = ElementReader::new(payload);
    Ok(match msg_type {
        REPLY_OK => ClientReply::Ok,
        REPLY_WORKSPACE_ID => ClientReply::WorkspaceId(WorkspaceId(r.read_u64()?)),
        REPLY_FAILURE => ClientReply::Failure(ErrorKind::from_tag(r.read_u32()?), r.read_string()?),
        REPLY_RECIPIENTS => {
            let count = r.read_u32()?;
            let mut addrs = Vec::with_capacity(count as usize);
            for _ in 0..count {
                addrs.push(r.read_string()?);
            }
            ClientReply::Recipients(addrs)
        }
        REPLY_EVENT_BATCH => {
            let count = r.read_u32()?;
            let mut events = Vec::with_capacity(count as usize);
            for _ in 0..count {
                events.push((r.read_u64()?, r.read_bin()?));
            }
            ClientReply::EventBatch(events)
        }
        REPLY_STATE => ClientReply::State(WorkspaceSnapshot {
            id: WorkspaceId(r.read_u64()?),
            name: r.read_string()?,
            run_level: run_level_from_tag(r.read_u32()?),
            unprocessed_count: r.read_u64()?,
        }),
        REPLY_SCREEN_SHARE_SESSION => ClientReply::ScreenShareSession(r.read_u64()?),
        REPLY_BOOL => ClientReply::Bool(r.read_u32()? != 0),
        REPLY_BUNDLE => ClientReply::Bundle(r.read_string()?),
        other => return Err(CoreError::Protocol(format!("unknown client reply type {other}"))),
    })
}

pub fn encode_event(event: &ClientEvent) -> (u32, Vec<u8>) {
    let mut w = ElementWriter::new();
    let msg_type = match event {
        ClientEvent::FetchStateHint(id) => {
            w.write_u64(id.0);
            EVENT_FETCH_STATE_HINT
        }
        ClientEvent::ChatMsgReceived { workspace, payload } => {
            w.write_u64(workspace.0).write_bin(payload);
            EVENT_CHAT_MSG_RECEIVED
        }
        ClientEvent::WorkspaceCreated(id) => {
            w.write_u64(id.0);
            EVENT_WORKSPACE_CREATED
        }
        ClientEvent::LocalScreenShareSession { workspace, session_id } => {
            w.write_u64(workspace.0).write_u64(*session_id);
            EVENT_LOCAL_SCREEN_SHARE_SESSION
        }
    };
    (msg_type, w.into_vec())
}

pub fn decode_event(msg_type: u32, payload: &[u8]) -> Result<ClientEvent, CoreError> {
    let mut r = ElementReader::new(payload);
    Ok(match msg_type {
        EVENT_FETCH_STATE_HINT => ClientEvent::FetchStateHint(WorkspaceId(r.read_u64()?)),
        EVENT_CHAT_MSG_RECEIVED => ClientEvent::ChatMsgReceived { workspace: WorkspaceId(r.read_u64()?), payload: r.read_bin()? },
        EVENT_WORKSPACE_CREATED => ClientEvent::WorkspaceCreated(WorkspaceId(r.read_u64()?)),
        EVENT_LOCAL_SCREEN_SHARE_SESSION => {
            let workspace = WorkspaceId(r.read_u64()?);
            ClientEvent::LocalScreenShareSession { workspace, session_id: r.read_u64()? }
        }
        other => return Err(CoreError::Protocol(format!("unknown client event type {other}"))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_workspace_command_roundtrips() {
        let cmd = ClientCommand::CreateWorkspace {
            name: "Acme".to_string(),
            host: "kcd.example".to_string(),
            port: 443,
            external_kws_id: "kws-1".to_string(),
            user_email_id: "user@example.com".to_string(),
        };
        let (msg_type, payload) = encode_command(&cmd);
        let decoded = decode_command(msg_type, &payload).unwrap();
        assert!(matches!(decoded, ClientCommand::CreateWorkspace { port: 443, .. }));
    }

    #[test]
    fn post_chat_message_roundtrips_app_namespace() {
        let cmd = ClientCommand::PostChatMessage { workspace: WorkspaceId(7), app: App::Chat, payload: vec![1, 2, 3] };
        let (msg_type, payload) = encode_command(&cmd);
        let decoded = decode_command(msg_type, &payload).unwrap();
        assert!(matches!(decoded, ClientCommand::PostChatMessage { app: App::Chat, .. }));
    }

    #[test]
    fn failure_reply_roundtrips_error_kind() {
        let reply = ClientReply::Failure(ErrorKind::BadCredentials, "nope".to_string());
        let (msg_type, payload) = encode_reply(&reply);
        let decoded = decode_reply(msg_type, &payload).unwrap();
        assert!(matches!(decoded, ClientReply::Failure(ErrorKind::BadCredentials, _)));
    }

    #[test]
    fn unknown_command_type_is_protocol_error() {
        assert!(decode_command(9999, &[]).is_err());
    }

    #[test]
    fn bundle_reply_roundtrips_xml() {
        let reply = ClientReply::Bundle("<TeamboxExport version=\"5\"/>".to_string());
        let (msg_type, payload) = encode_reply(&reply);
        let decoded = decode_reply(msg_type, &payload).unwrap();
        assert!(matches!(decoded, ClientReply::Bundle(xml) if xml.contains("TeamboxExport")));
    }

    #[test]
    fn event_batch_reply_roundtrips() {
        let reply = ClientReply::EventBatch(vec![(1, vec![9, 9]), (2, vec![])]);
        let (msg_type, payload) = encode_reply(&reply);
        let decoded = decode_reply(msg_type, &payload).unwrap();
        match decoded {
            ClientReply::EventBatch(events) => assert_eq!(events.len(), 2),
            _ => panic!("wrong variant"),
        }
    }
}
