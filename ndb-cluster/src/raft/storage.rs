// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::raft::message::{Entry, LogIndex, NodeId, Peer, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Log store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Log store corruption: {0}")]
    Corrupt(String),
    #[error("State serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

fn encode_entry(entry: &Entry) -> Result<Vec<u8>, StorageError> {
    bincode::encode_to_vec(entry, bincode::config::standard())
        .map_err(|err| StorageError::Corrupt(err.to_string()))
}

fn decode_entry(bytes: &[u8]) -> Result<Entry, StorageError> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(entry, _)| entry)
        .map_err(|err| StorageError::Corrupt(err.to_string()))
}

/// Append-only log file with the full suffix (everything after the latest
/// snapshot) mirrored in memory. Records are length-prefixed bincode; a
/// partial trailing record from a crash is discarded on open.
pub struct LogStore {
    path: PathBuf,
    file: File,
    entries: VecDeque<Entry>,
    first_index: LogIndex,
}

impl LogStore {
    pub fn open(path: impl AsRef<Path>, default_first_index: LogIndex) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut entries = VecDeque::new();
        let mut cursor = 0usize;
        let mut valid_len = 0usize;
        while cursor + 4 <= raw.len() {
            let len = u32::from_le_bytes([
                raw[cursor],
                raw[cursor + 1],
                raw[cursor + 2],
                raw[cursor + 3],
            ]) as usize;
            if cursor + 4 + len > raw.len() {
                break;
            }
            match decode_entry(&raw[cursor + 4..cursor + 4 + len]) {
                Ok(entry) => entries.push_back(entry),
                Err(_) => break,
            }
            cursor += 4 + len;
            valid_len = cursor;
        }
        if valid_len < raw.len() {
            warn!(
                path = %path.display(),
                "Discarding {} bytes of partial log tail",
                raw.len() - valid_len
            );
            file.set_len(valid_len as u64)?;
            file.seek(SeekFrom::End(0))?;
        }

        let first_index = entries
            .front()
            .map(|entry| entry.index)
            .unwrap_or(default_first_index);

        Ok(Self {
            path,
            file,
            entries,
            first_index,
        })
    }

    /// Index of the first entry still held in the log (after compaction).
    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries
            .back()
            .map(|entry| entry.index)
            .unwrap_or(self.first_index.saturating_sub(1))
    }

    pub fn last_term(&self) -> Term {
        self.entries.back().map(|entry| entry.term).unwrap_or(0)
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        if index < self.first_index {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|entry| entry.term)
    }

    pub fn entries_from(&self, index: LogIndex, max: usize) -> Vec<Entry> {
        if index < self.first_index {
            return Vec::new();
        }
        self.entries
            .iter()
            .skip((index - self.first_index) as usize)
            .take(max)
            .cloned()
            .collect()
    }

    pub fn append(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        for entry in entries {
            let bytes = encode_entry(entry)?;
            self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
            self.file.write_all(&bytes)?;
            if self.entries.is_empty() {
                self.first_index = entry.index;
            }
            self.entries.push_back(entry.clone());
        }
        self.file.sync_data()?;
        Ok(())
    }

    /// Removes all entries with `index >= from`, rewriting the file.
    pub fn truncate_from(&mut self, from: LogIndex) -> Result<(), StorageError> {
        while self
            .entries
            .back()
            .map(|entry| entry.index >= from)
            .unwrap_or(false)
        {
            self.entries.pop_back();
        }
        self.rewrite()
    }

    /// Drops all entries with `index <= up_to` after a snapshot covers them.
    pub fn compact_to(&mut self, up_to: LogIndex) -> Result<(), StorageError> {
        while self
            .entries
            .front()
            .map(|entry| entry.index <= up_to)
            .unwrap_or(false)
        {
            self.entries.pop_front();
        }
        self.first_index = self
            .entries
            .front()
            .map(|entry| entry.index)
            .unwrap_or(up_to + 1);
        self.rewrite()
    }

    /// Discards the whole log and restarts it after `snapshot_index`.
    pub fn reset_to(&mut self, snapshot_index: LogIndex) -> Result<(), StorageError> {
        self.entries.clear();
        self.first_index = snapshot_index + 1;
        self.rewrite()
    }

    fn rewrite(&mut self) -> Result<(), StorageError> {
        let tmp_path = self.path.with_extension("tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            for entry in &self.entries {
                let bytes = encode_entry(entry)?;
                tmp.write_all(&(bytes.len() as u32).to_le_bytes())?;
                tmp.write_all(&bytes)?;
            }
            tmp.sync_data()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Current term and vote, persisted before answering any RPC that depends on
/// them.
pub struct StableStore {
    path: PathBuf,
    state: HardState,
}

impl StableStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            serde_json::from_slice(&std::fs::read(&path)?)?
        } else {
            HardState::default()
        };
        Ok(Self { path, state })
    }

    pub fn state(&self) -> &HardState {
        &self.state
    }

    pub fn set(&mut self, current_term: Term, voted_for: Option<NodeId>) -> Result<(), StorageError> {
        self.state = HardState {
            current_term,
            voted_for,
        };
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&self.state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: Vec<Peer>,
}

/// One-snapshot store: `snapshot.data` plus `snapshot.meta.json`. The data
/// file is written first; the meta rename is the commit point.
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("snapshot.meta.json")
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join("snapshot.data")
    }

    pub fn latest(&self) -> Result<Option<SnapshotMeta>, StorageError> {
        if !self.meta_path().exists() {
            return Ok(None);
        }
        let meta = serde_json::from_slice(&std::fs::read(self.meta_path())?)?;
        Ok(Some(meta))
    }

    pub fn open_data(&self) -> Result<File, StorageError> {
        Ok(File::open(self.data_path())?)
    }

    pub fn data_len(&self) -> Result<u64, StorageError> {
        Ok(std::fs::metadata(self.data_path())?.len())
    }

    /// Creates a writer for a new snapshot; [`SnapshotWriter::commit`]
    /// publishes it atomically.
    pub fn create(&self, meta: SnapshotMeta) -> Result<SnapshotWriter, StorageError> {
        let tmp_data = self.dir.join("snapshot.data.tmp");
        let file = File::create(&tmp_data)?;
        Ok(SnapshotWriter {
            dir: self.dir.clone(),
            tmp_data,
            file,
            meta,
        })
    }
}

pub struct SnapshotWriter {
    dir: PathBuf,
    tmp_data: PathBuf,
    pub file: File,
    meta: SnapshotMeta,
}

impl SnapshotWriter {
    pub fn commit(self) -> Result<SnapshotMeta, StorageError> {
        self.file.sync_data()?;
        drop(self.file);
        std::fs::rename(&self.tmp_data, self.dir.join("snapshot.data"))?;

        let tmp_meta = self.dir.join("snapshot.meta.json.tmp");
        std::fs::write(&tmp_meta, serde_json::to_vec(&self.meta)?)?;
        std::fs::rename(&tmp_meta, self.dir.join("snapshot.meta.json"))?;
        Ok(self.meta)
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::raft::message::EntryPayload;

    fn entry(term: Term, index: LogIndex) -> Entry {
        Entry {
            term,
            index,
            payload: EntryPayload::Command(vec![index as u8]),
        }
    }

    #[test]
    fn log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = LogStore::open(&path, 1).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(2, 3)]).unwrap();
        assert_eq!(log.last_index(), 3);
        drop(log);

        let log = LogStore::open(&path, 1).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(2));
    }

    #[test]
    fn truncate_removes_conflicting_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = LogStore::open(&path, 1).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3)]).unwrap();
        log.truncate_from(2).unwrap();
        assert_eq!(log.last_index(), 1);

        drop(log);
        let log = LogStore::open(&path, 1).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn compaction_moves_first_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = LogStore::open(&path, 1).unwrap();
        log.append(&[entry(1, 1), entry(1, 2), entry(1, 3), entry(1, 4)])
            .unwrap();
        log.compact_to(2).unwrap();
        assert_eq!(log.first_index(), 3);
        assert_eq!(log.last_index(), 4);
        assert!(log.get(2).is_none());
        assert!(log.entries_from(2, 10).is_empty());
        assert_eq!(log.entries_from(3, 10).len(), 2);
    }

    #[test]
    fn partial_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft.log");

        let mut log = LogStore::open(&path, 1).unwrap();
        log.append(&[entry(1, 1)]).unwrap();
        drop(log);

        // simulate a crash mid-record
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let log = LogStore::open(&path, 1).unwrap();
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn stable_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hard_state.json");

        let mut stable = StableStore::open(&path).unwrap();
        stable.set(7, Some(3)).unwrap();
        drop(stable);

        let stable = StableStore::open(&path).unwrap();
        assert_eq!(stable.state().current_term, 7);
        assert_eq!(stable.state().voted_for, Some(3));
    }

    #[test]
    fn snapshot_store_publishes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();
        assert!(store.latest().unwrap().is_none());

        let mut writer = store
            .create(SnapshotMeta {
                last_included_index: 5,
                last_included_term: 2,
                membership: vec![Peer {
                    id: 1,
                    addr: "127.0.0.1:0".to_string(),
                }],
            })
            .unwrap();
        writer.file.write_all(b"snapshot-bytes").unwrap();
        writer.commit().unwrap();

        let meta = store.latest().unwrap().unwrap();
        assert_eq!(meta.last_included_index, 5);
        let mut data = String::new();
        store.open_data().unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "snapshot-bytes");
    }
}
