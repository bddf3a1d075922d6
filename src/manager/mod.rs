//! Workspace-manager state machine (§4.6).
//!
//! `WorkspaceManager` is the single-threaded coordinator: it owns the
//! workspace and server arenas, talks to the two broker workers only
//! through their `std::sync::mpsc` queues, and exposes a `pass` the host
//! process drives from a timer loop. It never blocks on I/O itself.

pub mod quench;

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::client::command::WorkspaceSnapshot;
use crate::client::{ChannelId, ClientBrokerToManager, ClientCommand, ClientEvent, ClientReply, ErrorKind, ManagerToClientBroker, RequestId};
use crate::codec::helper::HelperElement;
use crate::codec::rpc::{self, ElementReader, ElementWriter, Frame, FrameHeader, SUPPORTED_MAJOR};
use crate::constants::{self, HELPER_INSTR_GET_TICKET};
use crate::config::RuntimeConfig;
use crate::credentials::{self, CredentialBundle, KwsEntry};
use crate::error::{CoreError, LoginResult, SemanticError};
use crate::helper::broker::{HelperToManager, ManagerToHelper};
use crate::helper::transaction::{HelperCommand, Transaction, TransactionId};
use crate::ids::{IdAllocator, QueryId, ServerId, WorkspaceId};
use crate::manager::quench::QuenchTracker;
use crate::operations::{CoreOp, CreateWorkspaceOp, CreateWorkspaceStep, DeleteRemotelyOp, OpId, OpOrigin};
use crate::persistence::{Direction, EventLog, PersistenceStore};
use crate::server::broker::{BrokerToManager, ManagerToBroker, Quench as BrokerQuench};
use crate::server::handle::{ConnStatus, ServerHandle};
use crate::server::query::{QueryMap, ServerQuery};
use crate::tunnel::TunnelTarget;
use crate::workspace::machine::{self, Actions};
use crate::workspace::notify::{Notification, NotificationQueue, QueuedNotification, ServerConnState};
use crate::workspace::state::{CurrentTask, DeleteRemotelyStep, UserTask, Workspace};

/// Overall process lifecycle (§4.6 shutdown cascade).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MainStatus {
    Running,
    Stopping,
    Stopped,
}

/// The result of a server RPC issued through `send_server_command`, handed
/// back to whichever caller (a core operation, typically) registered it.
/// Login replies and inbound events bypass this path entirely — they are
/// workspace-addressed pushes the manager dispatches on its own (§4.5).
#[derive(Debug)]
pub struct CompletedQuery {
    pub query_id: QueryId,
    pub server_id: ServerId,
    pub msg_type: u32,
    pub result: Result<Frame, CoreError>,
}

pub struct WorkspaceManager {
    config: RuntimeConfig,
    store: Box<dyn PersistenceStore>,

    workspaces: HashMap<WorkspaceId, Workspace>,
    notify_queues: HashMap<WorkspaceId, NotificationQueue>,
    servers: HashMap<ServerId, ServerHandle>,
    server_lookup: HashMap<(String, u16), ServerId>,
    query_maps: HashMap<ServerId, QueryMap>,
    decoders: HashMap<ServerId, rpc::FrameDecoder>,

    ws_ids: IdAllocator,
    server_ids: IdAllocator,
    query_ids: IdAllocator,
    msg_ids: IdAllocator,
    txn_ids: IdAllocator,

    /// In-flight "get a fresh ticket" helper transactions, keyed by the
    /// transaction id the helper broker will echo back, mapped to the
    /// workspace whose login cascade is waiting on it (§4.5 login cascade).
    ticket_requests: HashMap<TransactionId, WorkspaceId>,

    removal_set: HashSet<WorkspaceId>,
    completed_queries: Vec<CompletedQuery>,
    outbox: Vec<QueuedNotification>,

    /// Core operations (§4.8) in flight, keyed by the id the manager
    /// allocated for them, plus a reverse index so a workspace's
    /// notifications can be fanned out to whichever ops are watching it.
    ops: HashMap<OpId, CoreOp>,
    ops_by_workspace: HashMap<WorkspaceId, Vec<OpId>>,
    op_ids: IdAllocator,

    /// Channels subscribed to a workspace's change hints (§4.7
    /// `Subscribe`/`Unsubscribe`).
    subscriptions: HashMap<WorkspaceId, Vec<ChannelId>>,
    session_ids: IdAllocator,

    quench: QuenchTracker,
    current_quench: BrokerQuench,

    main_status: MainStatus,
    last_serialization: Instant,
    next_run_date: Instant,

    to_broker: std::sync::mpsc::Sender<ManagerToBroker>,
    from_broker: std::sync::mpsc::Receiver<BrokerToManager>,
    to_helper: std::sync::mpsc::Sender<ManagerToHelper>,
    from_helper: std::sync::mpsc::Receiver<HelperToManager>,
    to_client: std::sync::mpsc::Sender<ManagerToClientBroker>,
    from_client: std::sync::mpsc::Receiver<ClientBrokerToManager>,
}

impl WorkspaceManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: RuntimeConfig,
        store: Box<dyn PersistenceStore>,
        to_broker: std::sync::mpsc::Sender<ManagerToBroker>,
        from_broker: std::sync::mpsc::Receiver<BrokerToManager>,
        to_helper: std::sync::mpsc::Sender<ManagerToHelper>,
        from_helper: std::sync::mpsc::Receiver<HelperToManager>,
        to_client: std::sync::mpsc::Sender<ManagerToClientBroker>,
        from_client: std::sync::mpsc::Receiver<ClientBrokerToManager>,
    ) -> Self {
        let quench = QuenchTracker::new(config.queue_quench_max, constants::QUENCH_BATCH, constants::PROCESS_RATE);
        let now = Instant::now();
        Self {
            config,
            store,
            workspaces: HashMap::new(),
            notify_queues: HashMap::new(),
            servers: HashMap::new(),
            server_lookup: HashMap::new(),
            query_maps: HashMap::new(),
            decoders: HashMap::new(),
            ws_ids: IdAllocator::new(),
            server_ids: IdAllocator::new(),
            query_ids: IdAllocator::new(),
            msg_ids: IdAllocator::new(),
            txn_ids: IdAllocator::new(),
            ticket_requests: HashMap::new(),
            removal_set: HashSet::new(),
            completed_queries: Vec::new(),
            outbox: Vec::new(),
            ops: HashMap::new(),
            ops_by_workspace: HashMap::new(),
            op_ids: IdAllocator::new(),
            subscriptions: HashMap::new(),
            session_ids: IdAllocator::new(),
            quench,
            current_quench: BrokerQuench::None,
            main_status: MainStatus::Running,
            last_serialization: now,
            next_run_date: now,
            to_broker,
            from_broker,
            to_helper,
            from_helper,
            to_client,
            from_client,
        }
    }

    pub fn main_status(&self) -> MainStatus {
        self.main_status
    }

    pub fn workspace(&self, id: WorkspaceId) -> Option<&Workspace> {
        self.workspaces.get(&id)
    }

    pub fn workspace_mut(&mut self, id: WorkspaceId) -> Option<&mut Workspace> {
        self.workspaces.get_mut(&id)
    }

    pub fn notify_queue_mut(&mut self, id: WorkspaceId) -> Option<&mut NotificationQueue> {
        self.notify_queues.get_mut(&id)
    }

    /// Drains notifications delivered since the last call, across every
    /// workspace, in the order the manager observed them.
    pub fn take_outbox(&mut self) -> Vec<QueuedNotification> {
        std::mem::take(&mut self.outbox)
    }

    /// Drains replies to queries issued via `send_server_command` that a
    /// core operation (§4.8) registered interest in.
    pub fn take_completed_queries(&mut self) -> Vec<CompletedQuery> {
        std::mem::take(&mut self.completed_queries)
    }

    fn server_id_for(&mut self, host: &str, port: u16) -> ServerId {
        if let Some(id) = self.server_lookup.get(&(host.to_string(), port)) {
            return *id;
        }
        let id = ServerId(self.server_ids.alloc());
        self.servers.insert(id, ServerHandle::new(host.to_string(), port));
        self.query_maps.insert(id, QueryMap::new());
        self.decoders.insert(id, rpc::FrameDecoder::new());
        self.server_lookup.insert((host.to_string(), port), id);
        id
    }

    /// §4.7 `CreateWorkspace`: allocates a new workspace bound to
    /// `(host, port)`, creating the server handle on first use, and marks it
    /// wanting a connection. The workspace's own `run_pass` drives the rest
    /// of bring-up (connect, login) on subsequent passes.
    pub fn create_workspace(&mut self, name: String, host: String, port: u16, external_kws_id: String, user_email_id: String) -> WorkspaceId {
        let server_id = self.server_id_for(&host, port);
        let id = WorkspaceId(self.ws_ids.alloc());
        let ws = Workspace::new(id, server_id, name, external_kws_id, user_email_id);
        self.workspaces.insert(id, ws);
        self.notify_queues.insert(id, NotificationQueue::new());
        if let Some(server) = self.servers.get_mut(&server_id) {
            server.request_connect(id);
        }
        id
    }

    /// §4.7 `SetWorkspaceTask`. Transitions to `DeleteRemotely`/`DeleteLocally`
    /// are initial steps only; the multi-step orchestration for those lives
    /// in the core-operation framework (§4.8).
    pub fn set_user_task(&mut self, id: WorkspaceId, task: UserTask) {
        let Some(ws) = self.workspaces.get_mut(&id) else { return };
        ws.user_task = task;
        let new_task = match task {
            UserTask::Stop => CurrentTask::Stop,
            UserTask::WorkOffline => CurrentTask::WorkOffline,
            UserTask::WorkOnline => CurrentTask::WorkOnline,
        };
        if ws.current_task != new_task {
            ws.current_task = new_task;
            if let Some(notify) = self.notify_queues.get_mut(&id) {
                notify.push(crate::workspace::notify::Notification::TaskSwitch(new_task, None));
            }
            ws.bump_permanent();
            if new_task == CurrentTask::Stop {
                if let Some(server) = self.servers.get_mut(&ws.server_id) {
                    server.release_connect(id);
                }
            }
        }
    }

    pub fn request_removal(&mut self, id: WorkspaceId) {
        self.removal_set.insert(id);
    }

    /// §4.6 shutdown cascade, step one: ask every workspace to stop and
    /// release its server. `try_stop` (called each pass) completes the
    /// cascade once every server has drained to `Disconnected`.
    pub fn request_stop(&mut self) {
        self.main_status = MainStatus::Stopping;
        let ws_ids: Vec<_> = self.workspaces.keys().copied().collect();
        for id in ws_ids {
            self.set_user_task(id, UserTask::Stop);
        }
        let server_ids: Vec<_> = self.servers.keys().copied().collect();
        for server_id in server_ids {
            let _ = self.to_broker.send(ManagerToBroker::Disconnect(server_id));
        }
    }

    fn try_stop(&mut self, now: Instant) -> bool {
        if self.main_status != MainStatus::Stopping {
            return false;
        }
        let all_disconnected = self.servers.values().all(|s| s.status == ConnStatus::Disconnected);
        let all_stopped = self.workspaces.values().all(|w| w.current_task == CurrentTask::Stop);
        if all_disconnected && all_stopped {
            self.serialize(now);
            self.main_status = MainStatus::Stopped;
            true
        } else {
            false
        }
    }

    /// Issues a framed server RPC and registers it for correlation. The
    /// caller (typically a core operation) keeps the returned `QueryId` and
    /// watches `take_completed_queries` for the reply.
    pub fn send_server_command(&mut self, server_id: ServerId, msg_type: u32, payload: Vec<u8>) -> QueryId {
        let msg_id = self.msg_ids.alloc();
        let query_id = QueryId(self.query_ids.alloc());
        if let Some(qmap) = self.query_maps.get_mut(&server_id) {
            qmap.register(ServerQuery { id: query_id, server_id, msg_id, msg_type });
        }
        let header = FrameHeader { major: SUPPORTED_MAJOR, minor: 0, msg_type, id: msg_id, payload_len: payload.len() as u32 };
        let bytes = rpc::encode(&header, &payload);
        let _ = self.to_broker.send(ManagerToBroker::Send(server_id, bytes));
        query_id
    }

    /// Runs one §4.6 pass and returns the instant the caller should next
    /// wake the manager.
    pub fn pass(&mut self, now: Instant) -> Instant {
        if self.try_stop(now) {
            return now;
        }

        self.maybe_serialize(now);
        let mut next = now + Duration::from_secs(1);

        self.run_workspaces(now);
        self.drain_removal_set();
        next = next.min(self.reconnect_scheduling(now));
        next = next.min(self.recompute_quench(now));
        self.drain_broker_messages(now);
        self.drain_helper_messages();
        self.drain_client_messages();

        self.next_run_date = next;
        next
    }

    fn maybe_serialize(&mut self, now: Instant) {
        if now.duration_since(self.last_serialization) >= self.config.wm_serialization_delay.as_duration() {
            self.serialize(now);
            self.last_serialization = now;
        }
    }

    fn serialize(&mut self, _now: Instant) {
        let summary: Vec<_> = self
            .workspaces
            .values()
            .map(|w| format!("{}:{:?}:{:?}", w.id, w.current_task, w.login_status))
            .collect();
        let _ = self.store.blobs_mut().put("wm_core", summary.join("\n").as_bytes());
        for ws in self.workspaces.values() {
            let blob = serialize_workspace(ws);
            let _ = self.store.blobs_mut().put(&format!("kws_{}_core", ws.id), &blob);
        }
    }

    fn run_workspaces(&mut self, now: Instant) {
        let quench_active = matches!(self.current_quench, BrokerQuench::Forever)
            || matches!(self.current_quench, BrokerQuench::Deadline(t) if now < t);

        let ids: Vec<_> = self.workspaces.keys().copied().collect();
        for id in ids {
            let server_connected = self
                .workspaces
                .get(&id)
                .and_then(|w| self.servers.get(&w.server_id))
                .map(|s| s.status == ConnStatus::Connected)
                .unwrap_or(false);

            let Some(ws) = self.workspaces.get_mut(&id) else { continue };
            let Some(notify) = self.notify_queues.get_mut(&id) else { continue };
            let actions = machine::run_pass(ws, notify, self.store.events_mut(), server_connected, quench_active);
            self.apply_actions(id, actions);
            self.drain_workspace_notifications(id);
        }
    }

    fn apply_actions(&mut self, id: WorkspaceId, actions: Actions) {
        let Some(ws) = self.workspaces.get(&id) else { return };
        let server_id = ws.server_id;

        if let Some(want) = actions.want_server_connected {
            if let Some(server) = self.servers.get_mut(&server_id) {
                if want {
                    server.request_connect(id);
                } else {
                    server.release_connect(id);
                }
            }
        }

        if let Some(step) = actions.send_login {
            self.send_login(id, step);
        }

        if actions.request_ticket {
            self.request_ticket(id);
        }
    }

    fn send_login(&mut self, id: WorkspaceId, step: crate::workspace::state::LoginStep) {
        let Some(ws) = self.workspaces.get(&id) else { return };
        let server_id = ws.server_id;
        let mut w = ElementWriter::new();
        w.write_u64(id.0);
        w.write_u32(step as u32);
        w.write_string(&ws.external_kws_id);
        w.write_string(&ws.user_email_id);
        match step {
            crate::workspace::state::LoginStep::Ticket => {
                w.write_string(ws.credentials.ticket.as_deref().unwrap_or(""));
            }
            crate::workspace::state::LoginStep::Pwd => {
                w.write_string(ws.credentials.cached_password.as_deref().unwrap_or(""));
            }
            crate::workspace::state::LoginStep::Cached => {}
        }
        let payload = w.into_vec();
        let msg_id = self.msg_ids.alloc();
        let header = FrameHeader { major: SUPPORTED_MAJOR, minor: 0, msg_type: constants::MSG_TYPE_LOGIN, id: msg_id, payload_len: payload.len() as u32 };
        let bytes = rpc::encode(&header, &payload);
        let _ = self.to_broker.send(ManagerToBroker::Send(server_id, bytes));
    }

    fn request_ticket(&mut self, id: WorkspaceId) {
        let txn_id = TransactionId(self.txn_ids.alloc());
        self.ticket_requests.insert(txn_id, id);
        let cmd = HelperCommand { instruction: HELPER_INSTR_GET_TICKET, args: vec![HelperElement::Str(id.0.to_be_bytes().to_vec())], expects_result: true };
        let txn = Transaction::new(txn_id, vec![cmd]);
        let _ = self.to_helper.send(ManagerToHelper::Submit(txn));
    }

    /// Drains one workspace's notification queue, in FIFO order, to the
    /// outbox and to whichever core operations (§4.8) and external-client
    /// subscriptions (§4.7) are watching this workspace.
    fn drain_workspace_notifications(&mut self, id: WorkspaceId) {
        let Some(notify) = self.notify_queues.get_mut(&id) else { return };
        let notifications = notify.drain();
        for notification in notifications {
            self.dispatch_to_ops(id, &notification);
            self.hint_subscribers(id);
            self.outbox.push(QueuedNotification { workspace: id, notification });
        }
    }

    /// Feeds one notification to every core op watching `id`, finishing
    /// (and replying to) any op the notification completed or failed.
    fn dispatch_to_ops(&mut self, id: WorkspaceId, notification: &Notification) {
        let Some(op_ids) = self.ops_by_workspace.get(&id).cloned() else { return };
        for op_id in op_ids {
            let Some(op) = self.ops.get_mut(&op_id) else { continue };
            op.on_notification(notification);
            if op.is_done() {
                self.finish_op(op_id);
            }
        }
    }

    /// Removes a finished op and replies to the channel that started it.
    /// A successfully finished `DeleteRemotely` also triggers the local
    /// removal of the workspace it operated on (§4.8).
    fn finish_op(&mut self, op_id: OpId) {
        let Some(op) = self.ops.remove(&op_id) else { return };
        let workspace = op.workspace();
        let origin = op.origin();
        let is_delete_remotely = matches!(op, CoreOp::DeleteRemotely(_));
        let succeeded = op.error().is_none();
        let reply = match op.error() {
            Some(err) => ClientReply::Failure(ErrorKind::from(err), err.to_string()),
            None => match &op {
                CoreOp::CreateWorkspace(o) => ClientReply::WorkspaceId(o.workspace),
                CoreOp::DeleteRemotely(_) => ClientReply::Ok,
            },
        };

        if let Some(ids) = self.ops_by_workspace.get_mut(&workspace) {
            ids.retain(|existing| *existing != op_id);
        }
        if let Some(notify) = self.notify_queues.get_mut(&workspace) {
            notify.unsubscribe(op_id);
        }

        if is_delete_remotely && succeeded {
            if let Some(ws) = self.workspaces.get_mut(&workspace) {
                ws.ready_to_remove = true;
            }
            self.request_removal(workspace);
        }

        let _ = self.to_client.send(ManagerToClientBroker::Reply(origin.channel, origin.request_id, reply));
    }

    /// Tells every channel subscribed to `id` that something changed,
    /// without shipping the state itself — the client re-fetches via
    /// `FetchState`/`FetchEvent` on its own schedule (§4.7).
    fn hint_subscribers(&mut self, id: WorkspaceId) {
        let Some(channels) = self.subscriptions.get(&id) else { return };
        for channel in channels.clone() {
            let _ = self.to_client.send(ManagerToClientBroker::Push(channel, ClientEvent::FetchStateHint(id)));
        }
    }

    fn drain_removal_set(&mut self) {
        let ids: Vec<_> = self.removal_set.iter().copied().collect();
        for id in ids {
            let ready = self.workspaces.get(&id).map(|w| w.ready_to_remove).unwrap_or(true);
            if ready {
                if let Some(ws) = self.workspaces.remove(&id) {
                    if let Some(server) = self.servers.get_mut(&ws.server_id) {
                        server.release_connect(id);
                    }
                }
                self.notify_queues.remove(&id);
                let _ = self.store.events_mut().delete_workspace(id);
                let _ = self.store.blobs_mut().delete(&format!("kws_{id}_core"));
                self.removal_set.remove(&id);
            }
        }
    }

    /// §4.6 step 4: returns the earliest instant the manager should next be
    /// woken because of a pending reconnect deadline.
    fn reconnect_scheduling(&mut self, now: Instant) -> Instant {
        let mut earliest = now + self.config.reconnect_delay.as_duration();
        let ids: Vec<_> = self.servers.keys().copied().collect();
        for server_id in ids {
            let Some(server) = self.servers.get_mut(&server_id) else { continue };
            if server.status != ConnStatus::Disconnected || !server.want_connected() {
                continue;
            }
            if server.reconnect_is_due(now) {
                server.status = ConnStatus::Connecting;
                let target = TunnelTarget { remote_host: server.host.clone(), remote_port: server.port, reconnect_target: None };
                let _ = self.to_broker.send(ManagerToBroker::Connect(server_id, target, self.config.proxy_path.clone()));
            } else if let Some(deadline) = server.reconnect_deadline() {
                earliest = earliest.min(deadline);
            }
        }
        earliest
    }

    /// §4.6 step 5: recompute the directive sent to the server broker.
    fn recompute_quench(&mut self, now: Instant) -> Instant {
        let inbound_len: u64 = self.workspaces.values().map(|w| w.unprocessed_count).sum();
        self.current_quench = self.quench.compute(inbound_len as usize, now);
        let _ = self.to_broker.send(ManagerToBroker::SetQuench(self.current_quench));
        match self.current_quench {
            BrokerQuench::Deadline(t) => t,
            _ => now + Duration::from_secs(1),
        }
    }

    /// §4.6 step 6.
    fn drain_broker_messages(&mut self, now: Instant) {
        while let Ok(msg) = self.from_broker.try_recv() {
            match msg {
                BrokerToManager::Connected(server_id, minor) => self.on_server_connected(server_id, minor),
                BrokerToManager::Disconnected(server_id, reason) => self.on_server_disconnected(server_id, reason, now),
                BrokerToManager::InboundMessage(server_id, bytes) => self.on_inbound_bytes(server_id, bytes),
            }
        }
    }

    fn on_server_connected(&mut self, server_id: ServerId, minor: u16) {
        if let Some(server) = self.servers.get_mut(&server_id) {
            server.on_connected(minor);
        }
        self.fan_out_server_conn_change(server_id, ServerConnState::Connected, None);
    }

    fn on_server_disconnected(&mut self, server_id: ServerId, reason: Option<CoreError>, now: Instant) {
        if let Some(server) = self.servers.get_mut(&server_id) {
            server.on_disconnected(reason.clone(), now);
        }
        if let Some(qmap) = self.query_maps.get_mut(&server_id) {
            for query in qmap.cancel_for_server(server_id) {
                self.completed_queries.push(CompletedQuery {
                    query_id: query.id,
                    server_id,
                    msg_type: query.msg_type,
                    result: Err(CoreError::Interrupted),
                });
            }
        }
        self.fan_out_server_conn_change(server_id, ServerConnState::Disconnected, reason);
    }

    fn fan_out_server_conn_change(&mut self, server_id: ServerId, state: ServerConnState, err: Option<CoreError>) {
        let ids: Vec<_> = self
            .workspaces
            .values()
            .filter(|w| w.server_id == server_id)
            .map(|w| w.id)
            .collect();
        for id in ids {
            if let (Some(ws), Some(notify)) = (self.workspaces.get_mut(&id), self.notify_queues.get_mut(&id)) {
                machine::on_server_conn_change(ws, notify, state, err.clone());
            }
            self.drain_workspace_notifications(id);
        }
    }

    fn on_inbound_bytes(&mut self, server_id: ServerId, bytes: Vec<u8>) {
        let mut frames = Vec::new();
        let mut decode_err = None;

        if let Some(decoder) = self.decoders.get_mut(&server_id) {
            decoder.feed(&bytes);
            loop {
                match decoder.poll() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(err) => {
                        decode_err = Some(err);
                        break;
                    }
                }
            }
        }

        for frame in frames {
            self.dispatch_inbound_frame(server_id, frame);
        }
        // A version mismatch or malformed frame is treated as a transport
        // failure scoped to this server (§7).
        if let Some(err) = decode_err {
            self.on_server_disconnected(server_id, Some(err), Instant::now());
        }
    }

    fn dispatch_inbound_frame(&mut self, server_id: ServerId, frame: Frame) {
        match frame.header.msg_type {
            constants::MSG_TYPE_LOGIN_REPLY => self.handle_login_reply_frame(&frame),
            constants::MSG_TYPE_EVENT => self.handle_event_frame(&frame),
            _ => {
                if let Some(qmap) = self.query_maps.get_mut(&server_id) {
                    if let Some(query) = qmap.take_reply(server_id, frame.header.id) {
                        self.completed_queries.push(CompletedQuery { query_id: query.id, server_id, msg_type: query.msg_type, result: Ok(frame) });
                    }
                }
            }
        }
    }

    fn handle_login_reply_frame(&mut self, frame: &Frame) {
        let mut reader = ElementReader::new(&frame.payload);
        let Ok(ws_id_raw) = reader.read_u64() else { return };
        let Ok(code) = reader.read_u32() else { return };
        let id = WorkspaceId(ws_id_raw);
        let Some(result) = login_result_from_code(code) else { return };

        let Some(ws) = self.workspaces.get_mut(&id) else { return };
        let Some(notify) = self.notify_queues.get_mut(&id) else { return };
        let actions = machine::handle_login_reply(ws, notify, result);
        self.drain_workspace_notifications(id);
        if actions.request_ticket {
            self.request_ticket(id);
        }
    }

    fn handle_event_frame(&mut self, frame: &Frame) {
        let mut reader = ElementReader::new(&frame.payload);
        let Ok(ws_id_raw) = reader.read_u64() else { return };
        let id = WorkspaceId(ws_id_raw);
        let remaining = reader.remaining();
        let body = frame.payload[frame.payload.len() - remaining..].to_vec();

        if self.workspaces.get(&id).is_none() {
            return;
        }
        if self.store.events_mut().insert(id, Direction::Inbound, body).is_err() {
            return;
        }
        self.quench.note_ingested(Instant::now());
        if let Some(ws) = self.workspaces.get_mut(&id) {
            ws.unprocessed_count += 1;
            ws.events_up_to_date = false;
            ws.bump_transient();
        }
    }

    fn drain_helper_messages(&mut self) {
        while let Ok(msg) = self.from_helper.try_recv() {
            match msg {
                HelperToManager::Result(txn_id, elements) => self.on_ticket_result(txn_id, elements),
                HelperToManager::Failed(txn_id, err) => self.on_ticket_failure(txn_id, err),
            }
        }
    }

    fn on_ticket_result(&mut self, txn_id: TransactionId, elements: Vec<HelperElement>) {
        let Some(id) = self.ticket_requests.remove(&txn_id) else { return };
        let ticket = elements.into_iter().find_map(|e| match e {
            HelperElement::Str(bytes) => String::from_utf8(bytes).ok(),
            _ => None,
        });
        let Some(ws) = self.workspaces.get_mut(&id) else { return };
        ws.credentials.ticket = ticket;
        self.send_login(id, crate::workspace::state::LoginStep::Ticket);
    }

    fn on_ticket_failure(&mut self, txn_id: TransactionId, _err: CoreError) {
        let Some(id) = self.ticket_requests.remove(&txn_id) else { return };
        if let (Some(ws), Some(notify)) = (self.workspaces.get_mut(&id), self.notify_queues.get_mut(&id)) {
            machine::handle_login_reply(ws, notify, LoginResult::CannotGetTicket);
        }
        self.drain_workspace_notifications(id);
    }

    /// §4.6 step 7: drains commands from the external-client broker.
    fn drain_client_messages(&mut self) {
        while let Ok(msg) = self.from_client.try_recv() {
            match msg {
                ClientBrokerToManager::ChannelConnected(_) => {}
                ClientBrokerToManager::ChannelDisconnected(channel) => self.on_channel_disconnected(channel),
                ClientBrokerToManager::Command(channel, request_id, cmd) => self.handle_client_command(channel, request_id, cmd),
            }
        }
    }

    /// A channel going away cancels every core op it started (§4.8) and
    /// drops its subscriptions — there is no one left to reply to or push
    /// hints toward.
    fn on_channel_disconnected(&mut self, channel: ChannelId) {
        for channels in self.subscriptions.values_mut() {
            channels.retain(|c| *c != channel);
        }
        let op_ids: Vec<OpId> = self.ops.iter().filter(|(_, op)| op.origin().channel == channel).map(|(id, _)| *id).collect();
        for op_id in op_ids {
            if let Some(op) = self.ops.get_mut(&op_id) {
                op.cancel();
            }
            if let Some(op) = self.ops.remove(&op_id) {
                let workspace = op.workspace();
                if let Some(ids) = self.ops_by_workspace.get_mut(&workspace) {
                    ids.retain(|existing| *existing != op_id);
                }
                if let Some(notify) = self.notify_queues.get_mut(&workspace) {
                    notify.unsubscribe(op_id);
                }
            }
        }
    }

    fn reply(&mut self, channel: ChannelId, request_id: RequestId, reply: ClientReply) {
        let _ = self.to_client.send(ManagerToClientBroker::Reply(channel, request_id, reply));
    }

    fn fail(&mut self, channel: ChannelId, request_id: RequestId, kind: ErrorKind, msg: impl Into<String>) {
        self.reply(channel, request_id, ClientReply::Failure(kind, msg.into()));
    }

    /// §4.7: dispatches one decoded command to the operation it names.
    /// Commands with a trivial, synchronous outcome reply immediately;
    /// `CreateWorkspace` and a remote `DeleteWorkspace` instead spawn a
    /// core operation (§4.8) and reply once it finishes.
    fn handle_client_command(&mut self, channel: ChannelId, request_id: RequestId, cmd: ClientCommand) {
        match cmd {
            ClientCommand::CreateWorkspace { name, host, port, external_kws_id, user_email_id } => {
                let id = self.create_workspace(name, host, port, external_kws_id, user_email_id);
                self.spawn_create_workspace_op(id, channel, request_id);
            }
            ClientCommand::DeleteWorkspace { workspace, remotely } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                if remotely {
                    self.start_delete_remotely(workspace);
                    self.spawn_delete_remotely_op(workspace, channel, request_id);
                } else {
                    self.delete_workspace_locally(workspace);
                    self.reply(channel, request_id, ClientReply::Ok);
                }
            }
            ClientCommand::SetWorkspaceTask { workspace, task } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                self.set_user_task(workspace, task);
                self.reply(channel, request_id, ClientReply::Ok);
            }
            ClientCommand::SetLoginPwd { workspace, password } => match self.supply_password(workspace, password) {
                Ok(()) => self.reply(channel, request_id, ClientReply::Ok),
                Err(()) => self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace"),
            },
            ClientCommand::FetchState { workspace } => match self.workspaces.get(&workspace) {
                Some(ws) => {
                    let snapshot = WorkspaceSnapshot { id: ws.id, name: ws.name.clone(), run_level: ws.run_level(), unprocessed_count: ws.unprocessed_count };
                    self.reply(channel, request_id, ClientReply::State(snapshot));
                }
                None => self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace"),
            },
            ClientCommand::FetchEvent { workspace, event_id } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                let records = self.store.events().fetch_range(workspace, Direction::Inbound, event_id, event_id);
                let batch = records.into_iter().map(|r| (r.event_id, r.payload)).collect();
                self.reply(channel, request_id, ClientReply::EventBatch(batch));
            }
            ClientCommand::CheckEventUuid { workspace, uuid } => {
                // This core's event log keys records by id, not by a
                // separate uuid; the decimal id doubles as the uuid a
                // client compares against when deciding whether it has
                // already seen the workspace's most recent event.
                let matches = self.store.events().fetch_last(workspace, Direction::Inbound).map(|r| r.event_id.to_string()) == Some(uuid);
                self.reply(channel, request_id, ClientReply::Bool(matches));
            }
            ClientCommand::Invite { workspace, email } => {
                match self.queue_outbound_app_event(workspace, "workspace", format!("invite:{email}").into_bytes()) {
                    Ok(_) => self.reply(channel, request_id, ClientReply::Ok),
                    Err(_) => self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace"),
                }
            }
            ClientCommand::LookupRecipientAddress { workspace, email: _ } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                // Address-book lookup is application-layer business logic
                // (§1 non-goal); this core always reports no matches.
                self.reply(channel, request_id, ClientReply::Recipients(Vec::new()));
            }
            ClientCommand::PostChatMessage { workspace, app, payload } => match self.queue_outbound_app_event(workspace, app.namespace(), payload) {
                Ok(_) => self.reply(channel, request_id, ClientReply::Ok),
                Err(_) => self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace"),
            },
            ClientCommand::AcceptChatRequest { workspace } => {
                match self.queue_outbound_app_event(workspace, crate::workspace::apps::App::Chat.namespace(), Vec::new()) {
                    Ok(_) => self.reply(channel, request_id, ClientReply::Ok),
                    Err(_) => self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace"),
                }
            }
            ClientCommand::StartScreenShareSession { workspace } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                let session_id = self.session_ids.alloc();
                self.reply(channel, request_id, ClientReply::ScreenShareSession(session_id));
            }
            ClientCommand::JoinScreenShareSession { workspace, session_id: _ } => {
                if !self.workspaces.contains_key(&workspace) {
                    self.fail(channel, request_id, ErrorKind::BadWorkspace, "unknown workspace");
                    return;
                }
                self.reply(channel, request_id, ClientReply::Ok);
            }
            ClientCommand::ExportKws { workspace } => match self.export_kws(workspace) {
                Ok(xml) => self.reply(channel, request_id, ClientReply::Bundle(xml)),
                Err(err) => self.fail(channel, request_id, ErrorKind::from(&err), err.to_string()),
            },
            ClientCommand::ImportKws { xml } => match self.import_kws(&xml, channel) {
                Ok(()) => self.reply(channel, request_id, ClientReply::Ok),
                Err(err) => self.fail(channel, request_id, ErrorKind::from(&err), err.to_string()),
            },
            ClientCommand::Subscribe { workspace } => {
                let channels = self.subscriptions.entry(workspace).or_default();
                if !channels.contains(&channel) {
                    channels.push(channel);
                }
                self.reply(channel, request_id, ClientReply::Ok);
            }
            ClientCommand::Unsubscribe { workspace } => {
                if let Some(channels) = self.subscriptions.get_mut(&workspace) {
                    channels.retain(|c| *c != channel);
                }
                self.reply(channel, request_id, ClientReply::Ok);
            }
        }
    }

    fn spawn_create_workspace_op(&mut self, workspace: WorkspaceId, channel: ChannelId, request_id: RequestId) {
        let op_id = self.op_ids.alloc();
        let op = CoreOp::CreateWorkspace(CreateWorkspaceOp {
            id: op_id,
            workspace,
            origin: OpOrigin { channel, request_id },
            step: CreateWorkspaceStep::Initial,
            done: false,
            error: None,
        });
        self.register_op(op_id, workspace, op);
    }

    fn spawn_delete_remotely_op(&mut self, workspace: WorkspaceId, channel: ChannelId, request_id: RequestId) {
        let op_id = self.op_ids.alloc();
        let op = CoreOp::DeleteRemotely(DeleteRemotelyOp { id: op_id, workspace, origin: OpOrigin { channel, request_id }, done: false, error: None });
        self.register_op(op_id, workspace, op);
    }

    fn register_op(&mut self, op_id: OpId, workspace: WorkspaceId, op: CoreOp) {
        self.ops.insert(op_id, op);
        self.ops_by_workspace.entry(workspace).or_default().push(op_id);
        if let Some(notify) = self.notify_queues.get_mut(&workspace) {
            notify.subscribe(op_id);
        }
    }

    /// §4.7/§4.8: begins the `DeleteRemotely` orchestration on a workspace
    /// that isn't already running it. Idempotent re-entry from a second
    /// `DeleteWorkspace{remotely: true}` command just joins the existing walk.
    fn start_delete_remotely(&mut self, id: WorkspaceId) {
        let Some(ws) = self.workspaces.get_mut(&id) else { return };
        if ws.current_task != CurrentTask::DeleteRemotely {
            ws.current_task = CurrentTask::DeleteRemotely;
            ws.delete_remotely_step = DeleteRemotelyStep::NotStarted;
            if let Some(notify) = self.notify_queues.get_mut(&id) {
                notify.push(Notification::TaskSwitch(CurrentTask::DeleteRemotely, None));
            }
            ws.bump_permanent();
        }
    }

    /// §4.7 `DeleteWorkspace{remotely: false}`: no server round trip, just
    /// stop the workspace and let the next pass's removal sweep clear it.
    fn delete_workspace_locally(&mut self, id: WorkspaceId) {
        let Some(ws) = self.workspaces.get_mut(&id) else { return };
        ws.current_task = CurrentTask::DeleteLocally;
        ws.ready_to_remove = true;
        ws.bump_permanent();
        if let Some(server) = self.servers.get_mut(&ws.server_id) {
            server.release_connect(id);
        }
        self.request_removal(id);
    }

    fn supply_password(&mut self, workspace: WorkspaceId, password: String) -> Result<(), ()> {
        if !self.workspaces.contains_key(&workspace) {
            return Err(());
        }
        let actions = {
            let ws = self.workspaces.get_mut(&workspace).unwrap();
            machine::supply_password(ws, password)
        };
        self.apply_actions(workspace, actions);
        self.drain_workspace_notifications(workspace);
        Ok(())
    }

    /// Persists an application-namespaced payload to the outbound event log
    /// for a workspace (§4.7 `PostChatMessage`/`Invite`/etc.). Shipping
    /// outbound events to the server over the wire is application-layer
    /// business logic this core does not implement (§1 non-goal); queuing
    /// them durably is as far as the coordinator's job goes.
    fn queue_outbound_app_event(&mut self, workspace: WorkspaceId, namespace: &str, body: Vec<u8>) -> Result<u64, CoreError> {
        if !self.workspaces.contains_key(&workspace) {
            return Err(CoreError::Semantic(SemanticError::BadKwsId));
        }
        let mut w = ElementWriter::new();
        w.write_string(namespace);
        w.write_bin(&body);
        self.store.events_mut().insert(workspace, Direction::Outbound, w.into_vec())
    }

    fn export_kws(&self, workspace: WorkspaceId) -> Result<String, CoreError> {
        let ws = self.workspaces.get(&workspace).ok_or_else(|| CoreError::Semantic(SemanticError::BadKwsId))?;
        let server = self.servers.get(&ws.server_id).ok_or_else(|| CoreError::internal("workspace has no server handle"))?;
        let bundle = CredentialBundle {
            workspaces: vec![KwsEntry {
                name: ws.name.clone(),
                external_kws_id: ws.external_kws_id.clone(),
                user_email_id: ws.user_email_id.clone(),
                host: server.host.clone(),
                port: server.port,
            }],
        };
        credentials::export_bundle(&bundle)
    }

    /// §4.12 `ImportKws`: seeds one workspace per bundle entry. These are
    /// plain synchronous creations, not `CreateWorkspace` core operations —
    /// a bulk import's caller wants every workspace seeded, not to block on
    /// each one's login cascade.
    fn import_kws(&mut self, xml: &str, channel: ChannelId) -> Result<(), CoreError> {
        let bundle = credentials::import_bundle(xml)?;
        for entry in bundle.workspaces {
            let id = self.create_workspace(entry.name, entry.host, entry.port, entry.external_kws_id, entry.user_email_id);
            let _ = self.to_client.send(ManagerToClientBroker::Push(channel, ClientEvent::WorkspaceCreated(id)));
        }
        Ok(())
    }
}

fn login_result_from_code(code: u32) -> Option<LoginResult> {
    Some(match code {
        0 => LoginResult::Accepted,
        1 => LoginResult::BadSecurityCreds,
        2 => LoginResult::Oos,
        3 => LoginResult::BadKwsId,
        4 => LoginResult::BadEmailId,
        5 => LoginResult::DeletedKws,
        6 => LoginResult::AccountLocked,
        7 => LoginResult::Banned,
        8 => LoginResult::CannotGetTicket,
        9 => LoginResult::MiscError,
        _ => return None,
    })
}

/// Hand-rolled durable snapshot of a workspace (§4.6 step 1, §4.9). A
/// dependency-free tag encoding keeps this independent of whether the
/// workspace's in-memory enums derive `serde` traits.
fn serialize_workspace(ws: &Workspace) -> Vec<u8> {
    let mut w = ElementWriter::new();
    w.write_u64(ws.id.0);
    w.write_u64(ws.server_id.0);
    w.write_string(&ws.name);
    w.write_string(&ws.external_kws_id);
    w.write_string(&ws.user_email_id);
    w.write_u32(current_task_tag(ws.current_task));
    w.write_u32(user_task_tag(ws.user_task));
    w.write_u64(ws.last_received_event_id);
    w.write_u32(ws.enabled_apps.len() as u32);
    for app in &ws.enabled_apps {
        w.write_string(app.namespace());
    }
    w.into_vec()
}

fn current_task_tag(t: CurrentTask) -> u32 {
    match t {
        CurrentTask::Stop => 0,
        CurrentTask::Spawn => 1,
        CurrentTask::Rebuild => 2,
        CurrentTask::WorkOffline => 3,
        CurrentTask::WorkOnline => 4,
        CurrentTask::DeleteLocally => 5,
        CurrentTask::DeleteRemotely => 6,
    }
}

fn user_task_tag(t: UserTask) -> u32 {
    match t {
        UserTask::Stop => 0,
        UserTask::WorkOffline => 1,
        UserTask::WorkOnline => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    fn make_manager() -> (WorkspaceManager, std::sync::mpsc::Receiver<ManagerToBroker>, std::sync::mpsc::Sender<BrokerToManager>) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RuntimeConfig::default();
        config.data_dir = dir.path().to_path_buf();
        let store = Box::new(crate::persistence::FileStore::open(&config.data_dir, "pw").unwrap());

        let (tx_broker, rx_broker) = channel();
        let (tx_to_mgr, rx_to_mgr) = channel();
        let (tx_helper, _rx_helper) = channel();
        let (_tx_helper_reply, rx_helper_reply) = channel();
        let (tx_client, _rx_client) = channel();
        let (_tx_client_cmd, rx_client_cmd) = channel();

        let manager = WorkspaceManager::new(config, store, tx_broker, rx_to_mgr, tx_helper, rx_helper_reply, tx_client, rx_client_cmd);
        (manager, rx_broker, tx_to_mgr)
    }

    #[test]
    fn create_workspace_requests_server_connect() {
        let (mut mgr, _rx_broker, _tx) = make_manager();
        let id = mgr.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());
        assert!(mgr.workspace(id).is_some());
        let server_id = mgr.workspace(id).unwrap().server_id;
        assert!(mgr.servers.get(&server_id).unwrap().want_connected());
    }

    #[test]
    fn reusing_host_port_reuses_the_same_server() {
        let (mut mgr, _rx_broker, _tx) = make_manager();
        let a = mgr.create_workspace("A".to_string(), "kcd.example".to_string(), 443, "kws-a".to_string(), "a@example.com".to_string());
        let b = mgr.create_workspace("B".to_string(), "kcd.example".to_string(), 443, "kws-b".to_string(), "b@example.com".to_string());
        assert_eq!(mgr.workspace(a).unwrap().server_id, mgr.workspace(b).unwrap().server_id);
    }

    #[test]
    fn pass_requests_a_connect_when_reconnect_is_due() {
        let (mut mgr, rx_broker, _tx) = make_manager();
        mgr.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());
        mgr.pass(Instant::now());
        let mut saw_connect = false;
        while let Ok(msg) = rx_broker.try_recv() {
            if matches!(msg, ManagerToBroker::Connect(..)) {
                saw_connect = true;
            }
        }
        assert!(saw_connect);
    }

    #[test]
    fn set_user_task_stop_releases_server_connect_interest() {
        let (mut mgr, _rx_broker, _tx) = make_manager();
        let id = mgr.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());
        let server_id = mgr.workspace(id).unwrap().server_id;
        mgr.set_user_task(id, UserTask::Stop);
        assert!(!mgr.servers.get(&server_id).unwrap().want_connected());
    }

    #[test]
    fn request_removal_clears_workspace_once_ready() {
        let (mut mgr, _rx_broker, _tx) = make_manager();
        let id = mgr.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());
        mgr.workspace_mut(id).unwrap().ready_to_remove = true;
        mgr.request_removal(id);
        mgr.drain_removal_set();
        assert!(mgr.workspace(id).is_none());
    }

    #[test]
    fn server_connected_notice_fans_out_to_every_workspace_on_it() {
        let (mut mgr, _rx_broker, _tx) = make_manager();
        let id = mgr.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());
        let server_id = mgr.workspace(id).unwrap().server_id;
        mgr.on_server_connected(server_id, 3);
        let outbox = mgr.take_outbox();
        assert!(outbox.iter().any(|n| matches!(n.notification, crate::workspace::notify::Notification::ServerConnChange(ServerConnState::Connected, None))));
    }
}
