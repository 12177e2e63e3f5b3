// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Per-node persistent state.
//!
//! Each node keeps one JSON document under the configured folder, named by
//! its node id so gateway processes sharing a folder never collide. Writes
//! go through a temp file and an atomic rename.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::messages::LogEntry;

#[derive(Debug, Serialize, Deserialize)]
pub struct PersistentState {
    pub term: u64,
    pub voted_for: Option<Uuid>,
    pub log: Vec<LogEntry>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NodeStore {
    path: PathBuf,
}

impl NodeStore {
    pub fn new(folder: &Path, node_id: Uuid) -> Self {
        Self {
            path: folder.join(format!("raft-{node_id}.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the persisted state, or `None` when the node has never saved.
    pub fn load(&self) -> Result<Option<PersistentState>, StorageError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, state: &PersistentState) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Removes the persisted state. Missing files are not an error so the
    /// delete is idempotent.
    pub fn delete(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::LogCommand;
    use crate::state_machine::KvInput;

    fn sample_state() -> PersistentState {
        PersistentState {
            term: 3,
            voted_for: Some(Uuid::new_v4()),
            log: vec![LogEntry {
                term: 1,
                command: LogCommand::Input {
                    proposer: Uuid::new_v4(),
                    seq: 1,
                    input: KvInput::Put {
                        key: "foo".into(),
                        value: serde_json::json!(42),
                    },
                },
            }],
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let store = NodeStore::new(dir.path(), id);

        assert!(store.load().unwrap().is_none());

        let state = sample_state();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().expect("state was saved");
        assert_eq!(loaded.term, state.term);
        assert_eq!(loaded.voted_for, state.voted_for);
        assert_eq!(loaded.log.len(), 1);
    }

    #[test]
    fn stores_of_distinct_nodes_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let a = NodeStore::new(dir.path(), Uuid::new_v4());
        let b = NodeStore::new(dir.path(), Uuid::new_v4());

        a.save(&sample_state()).unwrap();
        assert!(b.load().unwrap().is_none());
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn delete_removes_exactly_one_file_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = NodeStore::new(dir.path(), Uuid::new_v4());
        let b = NodeStore::new(dir.path(), Uuid::new_v4());

        a.save(&sample_state()).unwrap();
        b.save(&sample_state()).unwrap();

        a.delete().unwrap();
        assert!(a.load().unwrap().is_none());
        assert!(b.load().unwrap().is_some());

        // repeat delete is a no-op
        a.delete().unwrap();
    }
}
