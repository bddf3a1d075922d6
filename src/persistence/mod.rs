//! Local persistence facade (§4.9).
//!
//! Defined as a trait so the coordinator never depends on a concrete SQL
//! engine. `FileStore` is the file-backed implementation shipped with this
//! repo for standalone operation and testing: append-only write-ahead
//! segment files per workspace plus a small in-memory index rebuilt on
//! open, mirroring the production SQL-backed store's observable contract.

pub mod blobstore;
pub mod crypto;
pub mod event_log;

pub use blobstore::{BlobStore, FileBlobStore};
pub use event_log::{Direction, EventLog, EventRecord, EventStatus, FileEventLog};

use std::path::Path;

use crate::error::CoreError;

/// Combines the event log and blob store into the one facade the
/// coordinator holds. A long-running transaction, in the sense of §4.9,
/// spans the interval between two serialization passes: the coordinator
/// calls `blobs_mut().put(...)` once per pass rather than per mutation, so
/// a crash between passes reverts cleanly to the last committed snapshot.
pub trait PersistenceStore: Send {
    fn events(&self) -> &dyn EventLog;
    fn events_mut(&mut self) -> &mut dyn EventLog;
    fn blobs(&self) -> &dyn BlobStore;
    fn blobs_mut(&mut self) -> &mut dyn BlobStore;
}

/// File-backed `PersistenceStore`: `<data_dir>/events/` holds the event log
/// segments, `<data_dir>/blobs/` holds the encrypted serialization blobs.
pub struct FileStore {
    events: FileEventLog,
    blobs: FileBlobStore,
}

impl FileStore {
    pub fn open(data_dir: &Path, encryption_passphrase: &str) -> Result<Self, CoreError> {
        let events = FileEventLog::open(data_dir.join("events"))?;
        let blobs = FileBlobStore::open(data_dir.join("blobs"), encryption_passphrase)?;
        Ok(Self { events, blobs })
    }
}

impl PersistenceStore for FileStore {
    fn events(&self) -> &dyn EventLog {
        &self.events
    }
    fn events_mut(&mut self) -> &mut dyn EventLog {
        &mut self.events
    }
    fn blobs(&self) -> &dyn BlobStore {
        &self.blobs
    }
    fn blobs_mut(&mut self) -> &mut dyn BlobStore {
        &mut self.blobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::WorkspaceId;

    #[test]
    fn file_store_opens_both_subsystems() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), "pw").unwrap();

        let ws = WorkspaceId(1);
        store.events_mut().insert(ws, Direction::Inbound, b"evt".to_vec()).unwrap();
        store.blobs_mut().put("wm_core", b"blob").unwrap();

        assert!(store.events().fetch_last(ws, Direction::Inbound).is_some());
        assert_eq!(store.blobs().get("wm_core").unwrap().unwrap(), b"blob");
    }
}
