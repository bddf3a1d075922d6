//! Integration tests for the coordinator's end-to-end lifecycle.
//!
//! Unlike the per-module unit tests (which exercise one state machine in
//! isolation), these drive `WorkspaceManager` the way `main.rs` does: a
//! real `FileStore` on a temp dir, real broker channel pairs, and a
//! `pass()` loop — without spawning the mio/tokio brokers themselves,
//! since no real server or client process is available in this harness.

use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::Instant;

use kwmd::config::RuntimeConfig;
use kwmd::persistence::FileStore;
use kwmd::server::broker::{BrokerToManager, ManagerToBroker};
use kwmd::workspace::{CurrentTask, UserTask};
use kwmd::{MainStatus, WorkspaceManager};

/// Everything the test needs to keep alive alongside the manager: the temp
/// data dir, the receiving end of the server-broker channel (to inspect what
/// the manager asked the broker to do), and the sending end of the
/// manager-inbound broker channel (to simulate the broker's replies).
struct Harness {
    manager: WorkspaceManager,
    to_broker_rx: Receiver<ManagerToBroker>,
    from_broker_tx: Sender<BrokerToManager>,
    _dir: tempfile::TempDir,
}

fn make_manager() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RuntimeConfig::default();
    config.data_dir = dir.path().to_path_buf();
    let store = Box::new(FileStore::open(&config.data_dir, "test-passphrase").unwrap());

    let (to_broker, to_broker_rx) = channel();
    let (from_broker_tx, from_broker) = channel();
    let (to_helper, from_manager_helper) = channel();
    let (_to_manager_helper, from_helper) = channel();
    let (to_client, from_manager_client) = channel();
    let (_to_manager_client, from_client) = channel();

    // Nobody drives the helper/client broker sides in this harness, so the
    // manager's sends there would otherwise fail once their receiver drops.
    std::mem::forget(from_manager_helper);
    std::mem::forget(from_manager_client);

    let manager = WorkspaceManager::new(config, store, to_broker, from_broker, to_helper, from_helper, to_client, from_client);
    Harness { manager, to_broker_rx, from_broker_tx, _dir: dir }
}

#[test]
fn newly_created_workspace_requests_a_connection_on_the_first_pass() {
    let mut h = make_manager();
    let id = h.manager.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());

    h.manager.pass(Instant::now());

    assert!(h.manager.workspace(id).is_some());
}

#[test]
fn stopping_a_workspace_and_running_request_stop_eventually_reaches_stopped() {
    let mut h = make_manager();
    h.manager.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());

    h.manager.request_stop();
    assert_eq!(h.manager.main_status(), MainStatus::Stopping);

    // request_stop() asks the broker to disconnect every server it knows
    // about; since nothing drives the real broker in this harness, the
    // disconnect has to be reported back by hand before the stop cascade
    // can actually complete.
    let ManagerToBroker::Disconnect(server_id) = h.to_broker_rx.recv().unwrap() else {
        panic!("expected a Disconnect request to the server broker");
    };
    h.from_broker_tx.send(BrokerToManager::Disconnected(server_id, None)).unwrap();

    h.manager.pass(Instant::now());
    assert_eq!(h.manager.main_status(), MainStatus::Stopped);
}

#[test]
fn set_user_task_round_trips_through_a_pass() {
    let mut h = make_manager();
    let id = h.manager.create_workspace("Acme".to_string(), "kcd.example".to_string(), 443, "kws-1".to_string(), "user@example.com".to_string());

    h.manager.set_user_task(id, UserTask::Stop);
    h.manager.pass(Instant::now());

    assert_eq!(h.manager.workspace(id).unwrap().current_task, CurrentTask::Stop);
}
