//! Crypto-helper broker worker (§4.4).
//!
//! Drives the sub-process's lifecycle and the single active transaction.
//! Structured the same way as the server-connection broker
//! (`server::broker`): a plain OS thread talking to the coordinator over
//! `std::sync::mpsc` queues, never touching workspace state directly.

use std::collections::VecDeque;
use std::io::{BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{Receiver, Sender};

use crate::codec::helper::{write_elements, HelperDecoder, HelperElement};
use crate::constants::SUBPROCESS_POLL_INTERVAL;
use crate::error::CoreError;
use crate::helper::transaction::{Transaction, TransactionId, TransactionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelperState {
    Idle,
    Connecting,
    Ready,
    InFlight,
    Draining,
}

pub enum ManagerToHelper {
    Submit(Transaction),
    Cancel(TransactionId),
}

pub enum HelperToManager {
    Result(TransactionId, Vec<HelperElement>),
    Failed(TransactionId, CoreError),
}

pub struct CryptoHelperBroker {
    helper_path: std::path::PathBuf,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    decoder: HelperDecoder,
    state: HelperState,
    queue: VecDeque<Transaction>,
    active: Option<Transaction>,
    inbound: Receiver<ManagerToHelper>,
    outbound: Sender<HelperToManager>,
    /// Bytes from the sub-process's stdout, forwarded by the background
    /// reader thread `spawn_stdout_reader` started. `None` whenever no
    /// sub-process is currently alive.
    stdout_rx: Option<Receiver<Vec<u8>>>,
}

impl CryptoHelperBroker {
    pub fn new(
        helper_path: std::path::PathBuf,
        inbound: Receiver<ManagerToHelper>,
        outbound: Sender<HelperToManager>,
    ) -> Self {
        Self {
            helper_path,
            child: None,
            stdin: None,
            decoder: HelperDecoder::new(),
            state: HelperState::Idle,
            queue: VecDeque::new(),
            active: None,
            inbound,
            outbound,
            stdout_rx: None,
        }
    }

    fn spawn_subprocess(&mut self) -> Result<(), CoreError> {
        let mut child = Command::new(&self.helper_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CoreError::Transport(format!("failed to spawn crypto helper: {e}")))?;
        self.stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("helper spawned with Stdio::piped() stdout");
        let (byte_tx, byte_rx) = std::sync::mpsc::channel();
        spawn_stdout_reader(stdout, byte_tx);
        self.stdout_rx = Some(byte_rx);
        self.child = Some(child);
        self.state = HelperState::Ready;
        Ok(())
    }

    fn restart_subprocess(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.stdin = None;
        self.stdout_rx = None;
        self.decoder = HelperDecoder::new();
        self.state = HelperState::Idle;
    }

    /// One iteration of the worker loop: drain manager commands, advance
    /// the active transaction, drain any sub-process output, and poll the
    /// sub-process for liveness. Intended to be called in a loop with
    /// `SUBPROCESS_POLL_INTERVAL` pacing by the caller.
    pub fn run_once(&mut self) {
        self.drain_manager_commands();

        if self.state == HelperState::Idle {
            if self.spawn_subprocess().is_err() {
                return;
            }
        }

        if self.active.is_none() {
            if let Some(next) = self.queue.pop_front() {
                self.active = Some(next);
                self.state = HelperState::InFlight;
                self.write_current_command();
            }
        }

        self.drain_stdout();
        self.poll_subprocess_liveness();
    }

    /// Drains whatever bytes the background stdout-reader thread has
    /// forwarded since the last pass, feeding them through the decoder so
    /// `HelperToManager::Result` actually becomes reachable.
    fn drain_stdout(&mut self) {
        let Some(rx) = &self.stdout_rx else { return };
        let mut chunks = Vec::new();
        while let Ok(bytes) = rx.try_recv() {
            chunks.push(bytes);
        }
        for bytes in chunks {
            self.feed_stdout_bytes(&bytes);
        }
    }

    fn drain_manager_commands(&mut self) {
        while let Ok(cmd) = self.inbound.try_recv() {
            match cmd {
                ManagerToHelper::Submit(txn) => self.queue.push_back(txn),
                ManagerToHelper::Cancel(id) => {
                    if matches!(&self.active, Some(t) if t.id == id) {
                        // In-flight results cannot be disambiguated after
                        // cancellation, so the only safe response is to
                        // restart the sub-process (§4.4).
                        let txn = self.active.take().unwrap();
                        let _ = self.outbound.send(HelperToManager::Failed(txn.id, CoreError::Cancelled));
                        self.restart_subprocess();
                    } else {
                        self.queue.retain(|t| t.id != id);
                    }
                }
            }
        }
    }

    fn write_current_command(&mut self) {
        let Some(txn) = &self.active else { return };
        let Some(cmd) = txn.current_command() else { return };
        let mut elements = vec![HelperElement::Ins(cmd.instruction)];
        elements.extend(cmd.args.clone());
        let bytes = write_elements(&elements);

        if let Some(stdin) = &mut self.stdin {
            if stdin.write_all(&bytes).is_err() {
                self.fail_active(CoreError::Transport("crypto helper stdin closed".to_string()));
            }
        }
    }

    fn poll_subprocess_liveness(&mut self) {
        if let Some(child) = &mut self.child {
            match child.try_wait() {
                Ok(Some(_status)) => {
                    self.fail_active(CoreError::Transport("crypto helper process exited".to_string()));
                    self.restart_subprocess();
                }
                Ok(None) => {}
                Err(_) => {}
            }
        }
        let _ = SUBPROCESS_POLL_INTERVAL;
    }

    /// Feeds sub-process stdout bytes into the decoder and completes the
    /// active transaction's current command once a full result element has
    /// arrived. Called by the worker's stdout-reading loop.
    pub fn feed_stdout_bytes(&mut self, bytes: &[u8]) {
        self.decoder.feed(bytes);
        while let Ok(Some(element)) = self.decoder.poll() {
            self.on_helper_element(element);
        }
    }

    fn on_helper_element(&mut self, element: HelperElement) {
        let Some(txn) = &mut self.active else { return };
        let Some(cmd) = txn.current_command() else { return };
        if !cmd.expects_result {
            // Commands without results may be batched; keep draining.
            txn.advance();
            if txn.current_command().is_some() {
                self.write_current_command();
            }
            return;
        }

        let is_final = txn.is_final_command();
        let result_element = element;
        txn.advance();

        if is_final {
            let txn = self.active.take().unwrap();
            let _ = self.outbound.send(HelperToManager::Result(txn.id, vec![result_element]));
            self.state = HelperState::Ready;
        } else {
            self.write_current_command();
        }
    }

    fn fail_active(&mut self, err: CoreError) {
        if let Some(txn) = self.active.take() {
            let _ = self.outbound.send(HelperToManager::Failed(txn.id, err));
        }
        for txn in self.queue.drain(..) {
            let _ = self.outbound.send(HelperToManager::Failed(txn.id, CoreError::Interrupted));
        }
    }

    pub fn state(&self) -> HelperState {
        self.state
    }
}

/// Reads sub-process stdout on a blocking background thread and forwards
/// bytes into the broker via a byte channel, mirroring how the server
/// broker treats its transport: the broker's own loop never blocks on I/O.
pub fn spawn_stdout_reader(stdout: ChildStdout, byte_tx: Sender<Vec<u8>>) -> std::thread::JoinHandle<()> {
    use std::io::Read;
    std::thread::spawn(move || {
        let mut reader = BufReader::new(stdout);
        let mut buf = [0u8; 4096];
        loop {
            match reader.get_mut().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if byte_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::transaction::HelperCommand;
    use std::sync::mpsc::channel;

    fn make_broker() -> (CryptoHelperBroker, Sender<ManagerToHelper>, Receiver<HelperToManager>) {
        let (tx_in, rx_in) = channel();
        let (tx_out, rx_out) = channel();
        let broker = CryptoHelperBroker::new(std::path::PathBuf::from("/nonexistent/kwm-crypto-helper"), rx_in, tx_out);
        (broker, tx_in, rx_out)
    }

    #[test]
    fn cancel_of_non_active_transaction_just_drops_it_from_queue() {
        let (mut broker, tx_in, _rx_out) = make_broker();
        let txn = Transaction::new(TransactionId(1), vec![HelperCommand { instruction: 1, args: vec![], expects_result: true }]);
        tx_in.send(ManagerToHelper::Submit(txn)).unwrap();
        broker.drain_manager_commands();
        assert_eq!(broker.queue.len(), 1);

        tx_in.send(ManagerToHelper::Cancel(TransactionId(1))).unwrap();
        broker.drain_manager_commands();
        assert_eq!(broker.queue.len(), 0);
    }

    #[test]
    fn starts_idle() {
        let (broker, _tx_in, _rx_out) = make_broker();
        assert_eq!(broker.state(), HelperState::Idle);
    }
}
