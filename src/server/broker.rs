//! Server-connection broker worker (§4.3).
//!
//! A dedicated OS thread, not a tokio task: it owns a `mio::Poll` readiness
//! multiplexer over every live server transport plus a wake-up notifier, so
//! it never depends on an async runtime. The manager thread talks to it
//! exclusively through two `std::sync::mpsc` queues.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::mpsc::{Receiver, Sender};
use std::time::{Duration, Instant};

use mio::net::TcpStream as MioTcpStream;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::constants::SERVER_TRANSFER_BUDGET;
use crate::error::CoreError;
use crate::ids::ServerId;
use crate::tunnel::{Tunnel, TunnelTarget};

const WAKE_TOKEN: Token = Token(usize::MAX);

#[derive(Debug)]
pub enum ManagerToBroker {
    Connect(ServerId, TunnelTarget, std::path::PathBuf),
    Disconnect(ServerId),
    Send(ServerId, Vec<u8>),
    SetQuench(Quench),
    WakeUp,
}

#[derive(Debug)]
pub enum BrokerToManager {
    Connected(ServerId, u16),
    Disconnected(ServerId, Option<CoreError>),
    InboundMessage(ServerId, Vec<u8>),
}

/// Flow-control directive recomputed by the manager each pass (§4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Quench {
    /// No quench: proceed normally.
    None,
    /// Suspend all reads until the manager clears quench.
    Forever,
    /// Sleep until `min(deadline, socket_ready)`.
    Deadline(Instant),
}

struct Conn {
    token: Token,
    tunnel_stream: MioTcpStream,
    _tunnel: Tunnel,
    outbound: std::collections::VecDeque<Vec<u8>>,
    connected: bool,
}

/// The broker itself. Runs on its own thread via `run`.
pub struct ServerConnectionBroker {
    poll: Poll,
    waker: std::sync::Arc<Waker>,
    inbound: Receiver<ManagerToBroker>,
    outbound: Sender<BrokerToManager>,
    conns: HashMap<ServerId, Conn>,
    next_token: usize,
    quench: Quench,
}

impl ServerConnectionBroker {
    pub fn new(inbound: Receiver<ManagerToBroker>, outbound: Sender<BrokerToManager>) -> std::io::Result<Self> {
        let poll = Poll::new()?;
        let waker = std::sync::Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            waker,
            inbound,
            outbound,
            conns: HashMap::new(),
            next_token: 0,
            quench: Quench::None,
        })
    }

    /// A clonable handle the manager can use to interrupt a blocking poll
    /// (e.g. after pushing a new `Send`) without waiting for the next
    /// timeout.
    pub fn waker(&self) -> std::sync::Arc<Waker> {
        self.waker.clone()
    }

    /// Drains manager commands, services ready sockets, and returns once a
    /// quiescence point is reached. Intended to be called in a loop from
    /// the worker thread's `fn main`.
    pub fn run_once(&mut self) -> std::io::Result<()> {
        self.drain_manager_commands();

        let timeout = match self.quench {
            Quench::Forever => None,
            Quench::Deadline(t) => Some(t.saturating_duration_since(Instant::now()).min(Duration::from_millis(300))),
            Quench::None => Some(Duration::from_millis(100)),
        };

        let mut events = Events::with_capacity(128);
        // `timeout = None` already means "block until the waker fires" —
        // under `Forever` quench that's exactly what we want, so the poll
        // always runs; skipping it here would busy-spin the thread.
        self.poll.poll(&mut events, timeout)?;

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            self.service_ready_socket(event.token());
        }
        Ok(())
    }

    fn drain_manager_commands(&mut self) {
        while let Ok(cmd) = self.inbound.try_recv() {
            match cmd {
                ManagerToBroker::Connect(id, target, proxy_path) => self.handle_connect(id, target, &proxy_path),
                ManagerToBroker::Disconnect(id) => self.handle_disconnect(id, None),
                ManagerToBroker::Send(id, bytes) => {
                    if let Some(conn) = self.conns.get_mut(&id) {
                        conn.outbound.push_back(bytes);
                    }
                }
                ManagerToBroker::SetQuench(q) => self.quench = q,
                ManagerToBroker::WakeUp => {}
            }
        }
    }

    fn handle_connect(&mut self, id: ServerId, target: TunnelTarget, proxy_path: &std::path::Path) {
        match Tunnel::launch(proxy_path, &target) {
            Ok(tunnel) => {
                let std_stream = match tunnel.stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = self.outbound.send(BrokerToManager::Disconnected(id, Some(CoreError::from(e))));
                        return;
                    }
                };
                let mut mio_stream = MioTcpStream::from_std(std_stream);
                let token = Token(self.next_token);
                self.next_token += 1;
                if self
                    .poll
                    .registry()
                    .register(&mut mio_stream, token, Interest::READABLE | Interest::WRITABLE)
                    .is_err()
                {
                    let _ = self.outbound.send(BrokerToManager::Disconnected(
                        id,
                        Some(CoreError::internal("failed to register socket with poller")),
                    ));
                    return;
                }
                self.conns.insert(
                    id,
                    Conn { token, tunnel_stream: mio_stream, _tunnel: tunnel, outbound: Default::default(), connected: false },
                );
            }
            Err(e) => {
                let _ = self.outbound.send(BrokerToManager::Disconnected(id, Some(e)));
            }
        }
    }

    fn handle_disconnect(&mut self, id: ServerId, reason: Option<CoreError>) {
        if let Some(mut conn) = self.conns.remove(&id) {
            let _ = self.poll.registry().deregister(&mut conn.tunnel_stream);
        }
        let _ = self.outbound.send(BrokerToManager::Disconnected(id, reason));
    }

    fn service_ready_socket(&mut self, token: Token) {
        let id = match self.conns.iter().find(|(_, c)| c.token == token).map(|(id, _)| *id) {
            Some(id) => id,
            None => return,
        };

        // §4.3 per-server transfer budget: at most SERVER_TRANSFER_BUDGET
        // send/receive step pairs before releasing the socket, so busy
        // servers cannot starve the others.
        for _ in 0..SERVER_TRANSFER_BUDGET {
            let mut progressed = false;

            if let Some(conn) = self.conns.get_mut(&id) {
                if !conn.connected {
                    conn.connected = true;
                    let negotiated_minor = 0;
                    let _ = self.outbound.send(BrokerToManager::Connected(id, negotiated_minor));
                }

                let mut buf = [0u8; 4096];
                match conn.tunnel_stream.read(&mut buf) {
                    Ok(0) => {
                        self.handle_disconnect(id, None);
                        return;
                    }
                    Ok(n) => {
                        progressed = true;
                        let _ = self.outbound.send(BrokerToManager::InboundMessage(id, buf[..n].to_vec()));
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        self.handle_disconnect(id, Some(CoreError::from(e)));
                        return;
                    }
                }

                if let Some(msg) = conn.outbound.pop_front() {
                    match conn.tunnel_stream.write_all(&msg) {
                        Ok(()) => progressed = true,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            conn.outbound.push_front(msg);
                        }
                        Err(e) => {
                            self.handle_disconnect(id, Some(CoreError::from(e)));
                            return;
                        }
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn broker_starts_with_no_quench() {
        let (_tx_in, rx_in) = channel();
        let (tx_out, _rx_out) = channel();
        let broker = ServerConnectionBroker::new(rx_in, tx_out).unwrap();
        assert_eq!(broker.quench, Quench::None);
    }

    #[test]
    fn unknown_disconnect_is_harmless() {
        let (_tx_in, rx_in) = channel();
        let (tx_out, rx_out) = channel();
        let mut broker = ServerConnectionBroker::new(rx_in, tx_out).unwrap();
        broker.handle_disconnect(ServerId(99), None);
        assert!(matches!(rx_out.try_recv().unwrap(), BrokerToManager::Disconnected(ServerId(99), None)));
    }
}
