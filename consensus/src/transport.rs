// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Message transport seam.
//!
//! Consensus traffic rides whatever substrate the embedding process
//! provides; the gateway adapts its bus client, tests use the in-memory
//! hub below. Scopes are flat strings; a subscription ends when its
//! receiver yields `None`, which the node treats as loss of the network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Scope every member of a cluster subscribes to.
pub fn cluster_scope(cluster: &str) -> String {
    format!("raft.{cluster}")
}

/// Scope addressed to a single member.
pub fn node_scope(cluster: &str, node: Uuid) -> String {
    format!("raft.{cluster}.{node}")
}

#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn publish(&self, scope: &str, frame: Vec<u8>) -> Result<(), TransportError>;

    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError>;
}

/// In-memory hub connecting the transports of co-located test nodes.
///
/// Publishes are delivered to every subscriber of the scope, including the
/// publisher itself, in publish order.
#[derive(Default)]
pub struct LocalRaftNetwork {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
}

impl LocalRaftNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport endpoint attached to this hub.
    pub fn endpoint(self: &Arc<Self>) -> Arc<LocalRaftTransport> {
        Arc::new(LocalRaftTransport {
            hub: Arc::clone(self),
        })
    }
}

pub struct LocalRaftTransport {
    hub: Arc<LocalRaftNetwork>,
}

#[async_trait]
impl RaftTransport for LocalRaftTransport {
    async fn publish(&self, scope: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let mut topics = self.hub.topics.lock();
        if let Some(subscribers) = topics.get_mut(scope) {
            subscribers.retain(|tx| tx.send(frame.clone()).is_ok());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .topics
            .lock()
            .entry(scope.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
