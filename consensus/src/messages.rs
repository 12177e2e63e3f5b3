// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Wire frames exchanged between cluster members.
//!
//! Frames are serde-encoded JSON so they traverse the object-oriented bus
//! unchanged. Log indices are 1-based; index 0 means "before the first
//! entry".

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::KvInput;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum RaftFrame {
    /// Broadcast by a node that wants to join the cluster.
    Join { node: Uuid },

    /// Sent to the leader by a node leaving the cluster for good.
    Leave { node: Uuid },

    VoteRequest {
        term: u64,
        candidate: Uuid,
        last_log_index: u64,
        last_log_term: u64,
    },

    Vote {
        term: u64,
        from: Uuid,
        granted: bool,
    },

    Append {
        term: u64,
        leader: Uuid,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    },

    AppendAck {
        term: u64,
        from: Uuid,
        success: bool,
        match_index: u64,
    },

    /// An input proposal forwarded to the leader. The proposer resolves it
    /// locally when the entry commits.
    Forward {
        from: Uuid,
        seq: u64,
        input: KvInput,
    },
}

impl RaftFrame {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("raft frames serialize infallibly")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub command: LogCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum LogCommand {
    /// A replicated state-machine input, attributed to its proposer.
    Input {
        proposer: Uuid,
        seq: u64,
        input: KvInput,
    },

    /// A full membership snapshot. The latest Config entry in the log is
    /// the authoritative member set.
    Config { members: BTreeSet<Uuid> },

    /// Barrier appended by a freshly elected leader so entries of prior
    /// terms become committable.
    Noop,
}
