//! Append-only per-workspace event log (§3, §4.9).
//!
//! Two logical tables per workspace — inbound (events received from the
//! server) and outbound (events queued to send) — each addressed the same
//! way: `(workspace_id, event_id, payload, status)` with `event_id` strictly
//! increasing per workspace and direction. The monotone invariant this
//! module must preserve: the first `Unprocessed` row, if any, has the
//! smallest `event_id` in its (workspace, direction) partition.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::WorkspaceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Unprocessed,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: u64,
    pub payload: Vec<u8>,
    pub status: EventStatus,
}

/// Append-only, per-(workspace, direction) event log.
pub trait EventLog: Send {
    fn insert(&mut self, workspace: WorkspaceId, dir: Direction, payload: Vec<u8>) -> Result<u64, CoreError>;
    fn mark_status(&mut self, workspace: WorkspaceId, dir: Direction, event_id: u64, status: EventStatus) -> Result<(), CoreError>;
    fn fetch_first_unprocessed(&self, workspace: WorkspaceId, dir: Direction) -> Option<EventRecord>;
    fn fetch_last(&self, workspace: WorkspaceId, dir: Direction) -> Option<EventRecord>;
    fn fetch_range(&self, workspace: WorkspaceId, dir: Direction, from: u64, to: u64) -> Vec<EventRecord>;
    /// Drops every record for a workspace in both directions and resets its
    /// id counters to 0 (used by OOS rebuild, §8 scenario 2).
    fn delete_workspace(&mut self, workspace: WorkspaceId) -> Result<(), CoreError>;
}

#[derive(Default)]
struct Partition {
    records: BTreeMap<u64, EventRecord>,
    next_id: u64,
}

/// File-backed event log: one append-only segment file per (workspace,
/// direction) partition, plus an in-memory index rebuilt by replaying the
/// segment on open. Mirrors the production SQL-backed store's observable
/// contract (§4.9) without depending on a database engine.
pub struct FileEventLog {
    root: PathBuf,
    partitions: BTreeMap<(WorkspaceId, Direction), Partition>,
}

impl FileEventLog {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err)?;
        let mut log = Self { root, partitions: BTreeMap::new() };
        log.replay_existing()?;
        Ok(log)
    }

    fn replay_existing(&mut self) -> Result<(), CoreError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some((ws, dir)) = parse_segment_name(&name) {
                let partition = self.load_partition(&entry.path())?;
                self.partitions.insert((ws, dir), partition);
            }
        }
        Ok(())
    }

    fn load_partition(&self, path: &Path) -> Result<Partition, CoreError> {
        let mut partition = Partition::default();
        let file = File::open(path).map_err(io_err)?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map_err(io_err)?;

        let mut offset = 0;
        while offset + 4 <= buf.len() {
            let len = u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap()) as usize;
            offset += 4;
            if offset + len > buf.len() {
                break; // truncated tail record from a crash mid-write; ignore
            }
            let record: EventRecord = serde_json::from_slice(&buf[offset..offset + len])
                .map_err(|e| CoreError::Decode(format!("corrupt event log record: {e}")))?;
            offset += len;
            partition.next_id = partition.next_id.max(record.event_id + 1);
            partition.records.insert(record.event_id, record);
        }
        Ok(partition)
    }

    fn segment_path(&self, workspace: WorkspaceId, dir: Direction) -> PathBuf {
        self.root.join(segment_name(workspace, dir))
    }

    fn append_record(&self, workspace: WorkspaceId, dir: Direction, record: &EventRecord) -> Result<(), CoreError> {
        let path = self.segment_path(workspace, dir);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        let bytes = serde_json::to_vec(record)
            .map_err(|e| CoreError::internal(format!("failed to serialize event record: {e}")))?;
        file.write_all(&(bytes.len() as u32).to_be_bytes()).map_err(io_err)?;
        file.write_all(&bytes).map_err(io_err)?;
        file.sync_data().map_err(io_err)?;
        Ok(())
    }

    fn rewrite_segment(&self, workspace: WorkspaceId, dir: Direction, partition: &Partition) -> Result<(), CoreError> {
        let path = self.segment_path(workspace, dir);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(io_err)?;
        for record in partition.records.values() {
            let bytes = serde_json::to_vec(record)
                .map_err(|e| CoreError::internal(format!("failed to serialize event record: {e}")))?;
            file.write_all(&(bytes.len() as u32).to_be_bytes()).map_err(io_err)?;
            file.write_all(&bytes).map_err(io_err)?;
        }
        file.sync_data().map_err(io_err)?;
        Ok(())
    }
}

impl EventLog for FileEventLog {
    fn insert(&mut self, workspace: WorkspaceId, dir: Direction, payload: Vec<u8>) -> Result<u64, CoreError> {
        let partition = self.partitions.entry((workspace, dir)).or_default();
        let event_id = partition.next_id;
        partition.next_id += 1;
        let record = EventRecord { event_id, payload, status: EventStatus::Unprocessed };
        self.append_record(workspace, dir, &record)?;
        partition.records.insert(event_id, record);
        Ok(event_id)
    }

    fn mark_status(&mut self, workspace: WorkspaceId, dir: Direction, event_id: u64, status: EventStatus) -> Result<(), CoreError> {
        let partition = self.partitions.entry((workspace, dir)).or_default();
        match partition.records.get_mut(&event_id) {
            Some(record) => {
                record.status = status;
                let snapshot = partition.records.get(&event_id).unwrap().clone();
                self.append_record(workspace, dir, &snapshot)
            }
            None => Err(CoreError::internal(format!(
                "mark_status on unknown event_id {event_id} for workspace {workspace}"
            ))),
        }
    }

    fn fetch_first_unprocessed(&self, workspace: WorkspaceId, dir: Direction) -> Option<EventRecord> {
        self.partitions
            .get(&(workspace, dir))?
            .records
            .values()
            .find(|r| r.status == EventStatus::Unprocessed)
            .cloned()
    }

    fn fetch_last(&self, workspace: WorkspaceId, dir: Direction) -> Option<EventRecord> {
        self.partitions.get(&(workspace, dir))?.records.values().next_back().cloned()
    }

    fn fetch_range(&self, workspace: WorkspaceId, dir: Direction, from: u64, to: u64) -> Vec<EventRecord> {
        match self.partitions.get(&(workspace, dir)) {
            Some(p) => p.records.range(from..=to).map(|(_, r)| r.clone()).collect(),
            None => Vec::new(),
        }
    }

    fn delete_workspace(&mut self, workspace: WorkspaceId) -> Result<(), CoreError> {
        for dir in [Direction::Inbound, Direction::Outbound] {
            let path = self.segment_path(workspace, dir);
            if path.exists() {
                fs::remove_file(&path).map_err(io_err)?;
            }
            self.partitions.remove(&(workspace, dir));
        }
        Ok(())
    }
}

fn segment_name(workspace: WorkspaceId, dir: Direction) -> String {
    let tag = match dir {
        Direction::Inbound => "in",
        Direction::Outbound => "out",
    };
    format!("kws_{}.{}.log", workspace.0, tag)
}

fn parse_segment_name(name: &str) -> Option<(WorkspaceId, Direction)> {
    let rest = name.strip_prefix("kws_")?;
    let (id_str, tag) = if let Some(s) = rest.strip_suffix(".in.log") {
        (s, Direction::Inbound)
    } else if let Some(s) = rest.strip_suffix(".out.log") {
        (s, Direction::Outbound)
    } else {
        return None;
    };
    let id: u64 = id_str.parse().ok()?;
    Some((WorkspaceId(id), tag))
}

fn io_err(e: io::Error) -> CoreError {
    CoreError::from(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn event_ids_strictly_increase_per_workspace_direction() {
        let dir = tmp();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let ws = WorkspaceId(1);
        let a = log.insert(ws, Direction::Inbound, b"a".to_vec()).unwrap();
        let b = log.insert(ws, Direction::Inbound, b"b".to_vec()).unwrap();
        assert!(b > a);
    }

    #[test]
    fn first_unprocessed_has_smallest_id() {
        let dir = tmp();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let ws = WorkspaceId(1);
        let a = log.insert(ws, Direction::Inbound, b"a".to_vec()).unwrap();
        let b = log.insert(ws, Direction::Inbound, b"b".to_vec()).unwrap();
        log.mark_status(ws, Direction::Inbound, a, EventStatus::Processed).unwrap();
        let first = log.fetch_first_unprocessed(ws, Direction::Inbound).unwrap();
        assert_eq!(first.event_id, b);
    }

    #[test]
    fn reopen_observes_committed_rows() {
        let dir = tmp();
        let ws = WorkspaceId(7);
        {
            let mut log = FileEventLog::open(dir.path()).unwrap();
            log.insert(ws, Direction::Outbound, b"payload".to_vec()).unwrap();
        }
        let reopened = FileEventLog::open(dir.path()).unwrap();
        let last = reopened.fetch_last(ws, Direction::Outbound).unwrap();
        assert_eq!(last.payload, b"payload");
    }

    #[test]
    fn delete_workspace_clears_both_directions() {
        let dir = tmp();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let ws = WorkspaceId(3);
        log.insert(ws, Direction::Inbound, b"x".to_vec()).unwrap();
        log.insert(ws, Direction::Outbound, b"y".to_vec()).unwrap();
        log.delete_workspace(ws).unwrap();
        assert!(log.fetch_last(ws, Direction::Inbound).is_none());
        assert!(log.fetch_last(ws, Direction::Outbound).is_none());
    }

    #[test]
    fn fetch_range_is_inclusive() {
        let dir = tmp();
        let mut log = FileEventLog::open(dir.path()).unwrap();
        let ws = WorkspaceId(9);
        for i in 0..5 {
            log.insert(ws, Direction::Inbound, vec![i]).unwrap();
        }
        let range = log.fetch_range(ws, Direction::Inbound, 1, 3);
        assert_eq!(range.len(), 3);
        assert_eq!(range[0].event_id, 1);
        assert_eq!(range[2].event_id, 3);
    }
}
