// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Raft consensus over a pluggable message transport.
//!
//! One [`RaftController`] per cluster member, backed by a replicated
//! key-value state machine and a per-node persistent log. Consensus
//! traffic travels through the [`transport::RaftTransport`] seam so the
//! embedding process decides the substrate; an in-memory hub is provided
//! for tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tnc_consensus::{KvInput, RaftController, RaftOptions};
//! use tnc_consensus::transport::LocalRaftNetwork;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), tnc_consensus::RaftError> {
//! let network = LocalRaftNetwork::new();
//! let options = RaftOptions::new(Uuid::new_v4(), "demo", true, "/tmp/raft");
//! let node = RaftController::new(options, network.endpoint());
//!
//! node.connect().await?;
//! let state = node
//!     .propose(KvInput::Put {
//!         key: "foo".into(),
//!         value: serde_json::json!(42),
//!     })
//!     .await?;
//! assert_eq!(state.get("foo"), Some(&serde_json::json!(42)));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod messages;
pub mod node;
pub mod state_machine;
pub mod storage;
pub mod transport;

pub use error::{RaftError, StorageError, TransportError};
pub use node::{RaftController, RaftOptions};
pub use state_machine::{KvInput, KvState, KvStateMachine};
pub use storage::NodeStore;
