// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy of the consensus library.
//!
//! Callers translate these onto their own error surface; the three
//! operational variants carry the semantics the gateway relies on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    /// The proposal queue of this node holds its maximum number of
    /// uncommitted inputs.
    #[error("too many queued up input proposals")]
    TooManyQueuedUpInputProposals,

    /// The node left the cluster network before the operation committed.
    #[error("node disconnected before the operation completed")]
    DisconnectedBeforeOperationComplete,

    /// The operation requires a connection state the node is not in.
    #[error("operation is not supported in the current connection state")]
    OperationNotSupportedInCurrentConnectionState,

    /// Connecting to the cluster did not complete.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is offline")]
    Offline,

    #[error("transport is closed")]
    Closed,

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("node store I/O failed")]
    Io(#[from] std::io::Error),

    #[error("node store encoding failed")]
    Encode(#[from] serde_json::Error),
}
