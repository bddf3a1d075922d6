//! Tokio-hosted Unix-domain-socket accept loop (§4.7, §5).
//!
//! Grounded on the teacher's `socket::server`/`socket::client_conn`
//! accept-loop and per-connection read/write task-pair pattern, adapted
//! from its JSON framing and string client ids to the binary `codec::rpc`
//! frame and numeric `ChannelId`s.

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc as tokio_mpsc;

use crate::client::command::{self, ChannelId, RequestId};
use crate::client::{ClientBrokerToManager, ManagerToClientBroker};
use crate::codec::rpc::{self, FrameHeader, SUPPORTED_MAJOR};

/// Conservative across macOS (104) and Linux (108) `sun_path` limits.
const MAX_SOCKET_PATH: usize = 104;
const READ_CHUNK: usize = 65536;
/// Outbound frames queued per channel before it is judged unable to drain
/// and closed outright (§4.7 back-pressure policy: no retry).
const WRITE_QUEUE_DEPTH: usize = 256;

type SendMap = Arc<Mutex<HashMap<ChannelId, tokio_mpsc::Sender<Vec<u8>>>>>;

/// Owns the listening socket's path; `run` binds it and blocks the calling
/// thread for the broker's lifetime. Intended to be spawned on its own
/// `std::thread`, the same shape as `ServerConnectionBroker`/
/// `CryptoHelperBroker`, except the loop here is tokio's rather than an
/// explicit `run_once` call site.
pub struct ExternalClientBroker {
    socket_path: PathBuf,
}

impl ExternalClientBroker {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn run(
        self,
        to_manager: std_mpsc::Sender<ClientBrokerToManager>,
        from_manager: std_mpsc::Receiver<ManagerToClientBroker>,
    ) -> std::io::Result<()> {
        let rt = tokio::runtime::Builder::new_multi_thread().worker_threads(2).enable_all().build()?;
        rt.block_on(self.run_async(to_manager, from_manager))
    }

    async fn run_async(
        self,
        to_manager: std_mpsc::Sender<ClientBrokerToManager>,
        from_manager: std_mpsc::Receiver<ManagerToClientBroker>,
    ) -> std::io::Result<()> {
        let listener = bind_listener(&self.socket_path)?;
        let channels: SendMap = Arc::new(Mutex::new(HashMap::new()));
        let next_channel = Arc::new(AtomicU64::new(1));

        let forwarder_channels = channels.clone();
        let forwarder_to_manager = to_manager.clone();
        let forwarder = tokio::task::spawn_blocking(move || {
            forward_manager_commands(from_manager, forwarder_channels, forwarder_to_manager);
        });

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    let channel_id = ChannelId(next_channel.fetch_add(1, Ordering::Relaxed));
                    let (frame_tx, frame_rx) = tokio_mpsc::channel(WRITE_QUEUE_DEPTH);
                    channels.lock().unwrap().insert(channel_id, frame_tx);
                    if to_manager.send(ClientBrokerToManager::ChannelConnected(channel_id)).is_err() {
                        break;
                    }
                    let to_manager = to_manager.clone();
                    let channels = channels.clone();
                    tokio::spawn(run_connection(channel_id, stream, frame_rx, to_manager, channels));
                }
                Err(_) if !self.socket_path.exists() => break,
                Err(e) => {
                    log::error!("external-client accept error: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        forwarder.abort();
        Ok(())
    }
}

fn bind_listener(socket_path: &Path) -> std::io::Result<UnixListener> {
    let path_len = socket_path.as_os_str().len();
    if path_len >= MAX_SOCKET_PATH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("socket path too long ({path_len} bytes, max {})", MAX_SOCKET_PATH - 1),
        ));
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let std_listener = std::os::unix::net::UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    std_listener.set_nonblocking(true)?;
    UnixListener::from_std(std_listener)
}

/// Drains `ManagerToClientBroker` directives onto the right connection's
/// write queue. Runs on a blocking tokio task since its receive end is a
/// plain `std::sync::mpsc::Receiver`, matching the other brokers' channel
/// type so the coordinator's side is uniform across all three workers.
fn forward_manager_commands(
    from_manager: std_mpsc::Receiver<ManagerToClientBroker>,
    channels: SendMap,
    to_manager: std_mpsc::Sender<ClientBrokerToManager>,
) {
    while let Ok(msg) = from_manager.recv() {
        match msg {
            ManagerToClientBroker::Shutdown => break,
            ManagerToClientBroker::CloseChannel(id) => {
                channels.lock().unwrap().remove(&id);
            }
            ManagerToClientBroker::Reply(id, request_id, reply) => {
                let (msg_type, payload) = command::encode_reply(&reply);
                dispatch_frame(&channels, &to_manager, id, msg_type, request_id.0, payload);
            }
            ManagerToClientBroker::Push(id, event) => {
                let (msg_type, payload) = command::encode_event(&event);
                dispatch_frame(&channels, &to_manager, id, msg_type, 0, payload);
            }
        }
    }
}

fn dispatch_frame(channels: &SendMap, to_manager: &std_mpsc::Sender<ClientBrokerToManager>, id: ChannelId, msg_type: u32, req_id: u64, payload: Vec<u8>) {
    let header = FrameHeader { major: SUPPORTED_MAJOR, minor: 0, msg_type, id: req_id, payload_len: payload.len() as u32 };
    let bytes = rpc::encode(&header, &payload);
    let sender = channels.lock().unwrap().get(&id).cloned();
    let Some(sender) = sender else { return };
    // A full queue means the client isn't draining; close rather than
    // buffer unboundedly or retry (§4.7).
    if sender.try_send(bytes).is_err() {
        channels.lock().unwrap().remove(&id);
        let _ = to_manager.send(ClientBrokerToManager::ChannelDisconnected(id));
    }
}

async fn run_connection(
    id: ChannelId,
    stream: UnixStream,
    mut frame_rx: tokio_mpsc::Receiver<Vec<u8>>,
    to_manager: std_mpsc::Sender<ClientBrokerToManager>,
    channels: SendMap,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let write_task = tokio::spawn(async move {
        while let Some(bytes) = frame_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let mut decoder = rpc::FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    'read: loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break 'read,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.poll() {
                        Ok(Some(frame)) => {
                            let request_id = RequestId(frame.header.id);
                            match command::decode_command(frame.header.msg_type, &frame.payload) {
                                Ok(cmd) => {
                                    if to_manager.send(ClientBrokerToManager::Command(id, request_id, cmd)).is_err() {
                                        break 'read;
                                    }
                                }
                                // A malformed command is judged unrecoverable for this
                                // channel — close it rather than guess at resync (§4.7).
                                Err(_) => break 'read,
                            }
                        }
                        Ok(None) => break,
                        Err(_) => break 'read,
                    }
                }
            }
        }
    }

    channels.lock().unwrap().remove(&id);
    write_task.abort();
    let _ = to_manager.send(ClientBrokerToManager::ChannelDisconnected(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn socket_path_over_limit_is_rejected() {
        let long = "a".repeat(MAX_SOCKET_PATH);
        let path = PathBuf::from(format!("/tmp/{long}.sock"));
        assert!(bind_listener(&path).is_err());
    }

    #[test]
    fn dispatch_frame_with_no_channel_is_a_silent_noop() {
        let channels: SendMap = Arc::new(Mutex::new(HashMap::new()));
        let (to_manager, rx) = channel();
        dispatch_frame(&channels, &to_manager, ChannelId(1), command::REPLY_OK, 0, Vec::new());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_frame_closes_channel_when_queue_is_full() {
        let channels: SendMap = Arc::new(Mutex::new(HashMap::new()));
        let (frame_tx, _frame_rx) = tokio_mpsc::channel(1);
        // Fill the one slot without a receiver draining it.
        frame_tx.try_send(Vec::new()).unwrap();
        channels.lock().unwrap().insert(ChannelId(1), frame_tx);
        let (to_manager, rx) = channel();
        dispatch_frame(&channels, &to_manager, ChannelId(1), command::REPLY_OK, 0, Vec::new());
        assert!(channels.lock().unwrap().get(&ChannelId(1)).is_none());
        assert!(matches!(rx.try_recv(), Ok(ClientBrokerToManager::ChannelDisconnected(ChannelId(1)))));
    }
}
