// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Consensus gateway.
//!
//! A per-agent registry of Raft nodes, each delegating to a controller of
//! the consensus library over the bus transport adapter. The gateway
//! enforces the connection state machine: transitional states reject
//! overlapping operations, a failed transition restores the prior resting
//! state, and `Disconnected` is terminal.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::info;
use uuid::Uuid;

use tnc_consensus::{KvInput, KvState, RaftController, RaftError, RaftOptions};

use crate::application::bridge::CommunicationBridge;
use crate::infrastructure::bus::raft_transport::{BusClientProvider, BusRaftTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Stopping,
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Disconnected => "disconnected",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("Raft node with this id has not been created")]
    UnknownNode,

    #[error("Raft node is currently {0}")]
    WrongState(ConnectionState),

    #[error("Too many queued up input proposals")]
    ProposalQueueFull,

    #[error("Raft node disconnected before the operation completed")]
    Disconnected,

    #[error("Operation is not supported in the current connection state")]
    NotSupported,

    #[error("Bus is offline")]
    BusOffline,

    #[error("Connecting to the cluster failed: {0}")]
    ConnectFailed(String),

    #[error("Raft value must have exactly one variant set")]
    InvalidValue,

    #[error("Raft operation failed: {0}")]
    Internal(String),
}

fn map_raft_error(error: RaftError) -> ConsensusError {
    match error {
        RaftError::TooManyQueuedUpInputProposals => ConsensusError::ProposalQueueFull,
        RaftError::DisconnectedBeforeOperationComplete => ConsensusError::Disconnected,
        RaftError::OperationNotSupportedInCurrentConnectionState => ConsensusError::NotSupported,
        RaftError::ConnectFailed(message) => ConsensusError::ConnectFailed(message),
        other => ConsensusError::Internal(other.to_string()),
    }
}

/// One replicated input as accepted over the gRPC surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalOperation {
    Put,
    Delete,
}

/// Timing knobs of the underlying controllers; tests tighten these.
#[derive(Debug, Clone)]
pub struct RaftTuning {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub connect_timeout: Duration,
}

impl Default for RaftTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(1200),
            election_timeout_max: Duration::from_millis(2400),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

struct GatewayNode {
    id: Uuid,
    cluster: String,
    state: Mutex<ConnectionState>,
    controller: RaftController,
}

pub struct ConsensusGateway {
    bridge: Arc<CommunicationBridge>,
    db_folder: PathBuf,
    tuning: RaftTuning,
    nodes: Mutex<HashMap<Uuid, Arc<GatewayNode>>>,
}

impl ConsensusGateway {
    pub fn new(bridge: Arc<CommunicationBridge>, db_folder: PathBuf) -> Arc<Self> {
        Self::with_tuning(bridge, db_folder, RaftTuning::default())
    }

    pub fn with_tuning(
        bridge: Arc<CommunicationBridge>,
        db_folder: PathBuf,
        tuning: RaftTuning,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            db_folder,
            tuning,
            nodes: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a node in the `Created` state and returns its fresh id.
    pub fn create(&self, cluster: String, should_create_cluster: bool) -> Uuid {
        let id = Uuid::new_v4();
        let transport = BusRaftTransport::new(
            Arc::clone(&self.bridge) as Arc<dyn BusClientProvider>
        );
        let mut options =
            RaftOptions::new(id, cluster.clone(), should_create_cluster, self.db_folder.clone());
        options.heartbeat_interval = self.tuning.heartbeat_interval;
        options.election_timeout_min = self.tuning.election_timeout_min;
        options.election_timeout_max = self.tuning.election_timeout_max;
        options.connect_timeout = self.tuning.connect_timeout;

        let controller = RaftController::new(options, transport);
        let node = Arc::new(GatewayNode {
            id,
            cluster,
            state: Mutex::new(ConnectionState::Created),
            controller,
        });
        self.nodes.lock().insert(id, node);
        info!(node = %id, "raft node created");
        id
    }

    pub async fn connect(&self, id: Uuid) -> Result<(), ConsensusError> {
        let node = self.node(id)?;
        if !self.bridge.is_online().await {
            return Err(ConsensusError::BusOffline);
        }
        let prior = self.begin(
            &node,
            &[ConnectionState::Created, ConnectionState::Stopped],
            ConnectionState::Connecting,
        )?;
        match node.controller.connect().await {
            Ok(()) => {
                *node.state.lock() = ConnectionState::Connected;
                info!(node = %id, cluster = %node.cluster, "raft node connected");
                Ok(())
            }
            Err(e) => {
                *node.state.lock() = prior;
                Err(map_raft_error(e))
            }
        }
    }

    /// Removes the node from the cluster membership and deletes its
    /// persisted state. Terminal.
    pub async fn disconnect(&self, id: Uuid) -> Result<(), ConsensusError> {
        let node = self.node(id)?;
        let prior = self.begin(
            &node,
            &[ConnectionState::Connected],
            ConnectionState::Disconnecting,
        )?;
        match node.controller.disconnect().await {
            Ok(()) => {
                *node.state.lock() = ConnectionState::Disconnected;
                info!(node = %id, "raft node disconnected");
                Ok(())
            }
            Err(e) => {
                *node.state.lock() = prior;
                Err(map_raft_error(e))
            }
        }
    }

    /// Leaves membership and persisted state intact; the node may later
    /// reconnect under the same id.
    pub async fn stop(&self, id: Uuid) -> Result<(), ConsensusError> {
        let node = self.node(id)?;
        let prior = self.begin(
            &node,
            &[ConnectionState::Connected],
            ConnectionState::Stopping,
        )?;
        match node.controller.stop().await {
            Ok(()) => {
                *node.state.lock() = ConnectionState::Stopped;
                info!(node = %id, "raft node stopped");
                Ok(())
            }
            Err(e) => {
                *node.state.lock() = prior;
                Err(map_raft_error(e))
            }
        }
    }

    pub async fn propose(
        &self,
        id: Uuid,
        operation: ProposalOperation,
        key: String,
        value: Option<prost_types::Value>,
    ) -> Result<KvState, ConsensusError> {
        let node = self.node(id)?;
        self.require_connected(&node)?;
        // An absent value proposes the null value; a present but tagless
        // value is malformed.
        let value = match value {
            None => serde_json::Value::Null,
            Some(v) => decode_value(&v)?,
        };
        let input = match operation {
            ProposalOperation::Put => KvInput::Put { key, value },
            ProposalOperation::Delete => KvInput::Delete { key },
        };
        node.controller.propose(input).await.map_err(map_raft_error)
    }

    /// Returns a state at least as recent as the call by committing an
    /// internal no-op.
    pub async fn state(&self, id: Uuid) -> Result<KvState, ConsensusError> {
        let node = self.node(id)?;
        self.require_connected(&node)?;
        node.controller.state().await.map_err(map_raft_error)
    }

    pub fn observe_state(
        &self,
        id: Uuid,
    ) -> Result<(broadcast::Receiver<KvState>, watch::Receiver<bool>), ConsensusError> {
        let node = self.node(id)?;
        self.require_connected(&node)?;
        let states = node.controller.observe_state().map_err(map_raft_error)?;
        Ok((states, node.controller.alive_watch()))
    }

    pub async fn cluster_configuration(&self, id: Uuid) -> Result<Vec<Uuid>, ConsensusError> {
        let node = self.node(id)?;
        self.require_connected(&node)?;
        node.controller
            .cluster_configuration()
            .await
            .map_err(map_raft_error)
    }

    pub fn observe_cluster_configuration(
        &self,
        id: Uuid,
    ) -> Result<(broadcast::Receiver<Vec<Uuid>>, watch::Receiver<bool>), ConsensusError> {
        let node = self.node(id)?;
        self.require_connected(&node)?;
        let configurations = node
            .controller
            .observe_cluster_configuration()
            .map_err(map_raft_error)?;
        Ok((configurations, node.controller.alive_watch()))
    }

    pub fn connection_state(&self, id: Uuid) -> Result<ConnectionState, ConsensusError> {
        Ok(*self.node(id)?.state.lock())
    }

    /// Best-effort parallel stop of every connected node. Persisted
    /// stores stay on disk; other gateway instances may share them.
    pub async fn shutdown(&self) {
        let nodes: Vec<Arc<GatewayNode>> = self.nodes.lock().values().cloned().collect();
        let stops = nodes.into_iter().filter_map(|node| {
            let connected = *node.state.lock() == ConnectionState::Connected;
            connected.then(|| async move {
                *node.state.lock() = ConnectionState::Stopping;
                let _ = node.controller.stop().await;
                *node.state.lock() = ConnectionState::Stopped;
            })
        });
        futures::future::join_all(stops).await;
    }

    fn node(&self, id: Uuid) -> Result<Arc<GatewayNode>, ConsensusError> {
        self.nodes
            .lock()
            .get(&id)
            .cloned()
            .ok_or(ConsensusError::UnknownNode)
    }

    fn begin(
        &self,
        node: &GatewayNode,
        allowed: &[ConnectionState],
        next: ConnectionState,
    ) -> Result<ConnectionState, ConsensusError> {
        let mut state = node.state.lock();
        if !allowed.contains(&*state) {
            return Err(ConsensusError::WrongState(*state));
        }
        let prior = *state;
        *state = next;
        Ok(prior)
    }

    fn require_connected(&self, node: &GatewayNode) -> Result<(), ConsensusError> {
        let state = *node.state.lock();
        if state != ConnectionState::Connected {
            return Err(ConsensusError::WrongState(state));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// value shaping between the tagged proto form and the replicated JSON
// ---------------------------------------------------------------------

/// Decodes a tagged proto value. A value without exactly one variant set
/// is malformed.
pub fn decode_value(value: &prost_types::Value) -> Result<serde_json::Value, ConsensusError> {
    use prost_types::value::Kind;

    match &value.kind {
        None => Err(ConsensusError::InvalidValue),
        Some(Kind::NullValue(_)) => Ok(serde_json::Value::Null),
        Some(Kind::NumberValue(n)) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .ok_or(ConsensusError::InvalidValue),
        Some(Kind::StringValue(s)) => Ok(serde_json::Value::String(s.clone())),
        Some(Kind::BoolValue(b)) => Ok(serde_json::Value::Bool(*b)),
        Some(Kind::StructValue(s)) => {
            let mut map = serde_json::Map::new();
            for (key, nested) in &s.fields {
                map.insert(key.clone(), decode_value(nested)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        Some(Kind::ListValue(l)) => {
            let mut items = Vec::with_capacity(l.values.len());
            for nested in &l.values {
                items.push(decode_value(nested)?);
            }
            Ok(serde_json::Value::Array(items))
        }
    }
}

/// Encodes a replicated JSON value back into the tagged proto form.
pub fn encode_value(value: &serde_json::Value) -> prost_types::Value {
    use prost_types::value::Kind;

    let kind = match value {
        serde_json::Value::Null => Kind::NullValue(0),
        serde_json::Value::Bool(b) => Kind::BoolValue(*b),
        serde_json::Value::Number(n) => Kind::NumberValue(n.as_f64().unwrap_or(0.0)),
        serde_json::Value::String(s) => Kind::StringValue(s.clone()),
        serde_json::Value::Array(items) => Kind::ListValue(prost_types::ListValue {
            values: items.iter().map(encode_value).collect(),
        }),
        serde_json::Value::Object(map) => Kind::StructValue(prost_types::Struct {
            fields: map
                .iter()
                .map(|(key, nested)| (key.clone(), encode_value(nested)))
                .collect(),
        }),
    };
    prost_types::Value { kind: Some(kind) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_types::value::Kind;

    #[test]
    fn tagless_value_is_malformed() {
        let value = prost_types::Value { kind: None };
        assert!(matches!(
            decode_value(&value),
            Err(ConsensusError::InvalidValue)
        ));
    }

    #[test]
    fn null_number_string_bool_roundtrip() {
        for json in [
            serde_json::Value::Null,
            serde_json::json!(42.0),
            serde_json::json!("text"),
            serde_json::json!(true),
        ] {
            let encoded = encode_value(&json);
            assert_eq!(decode_value(&encoded).unwrap(), json);
        }
    }

    #[test]
    fn null_encodes_with_the_null_variant() {
        let encoded = encode_value(&serde_json::Value::Null);
        assert_eq!(encoded.kind, Some(Kind::NullValue(0)));
    }

    #[test]
    fn nested_structures_roundtrip() {
        let json = serde_json::json!({
            "list": [1.0, "two", null],
            "nested": {"flag": false}
        });
        let encoded = encode_value(&json);
        assert_eq!(decode_value(&encoded).unwrap(), json);
    }

    #[test]
    fn malformed_nested_value_is_rejected() {
        let value = prost_types::Value {
            kind: Some(Kind::StructValue(prost_types::Struct {
                fields: [("bad".to_string(), prost_types::Value { kind: None })]
                    .into_iter()
                    .collect(),
            })),
        };
        assert!(matches!(
            decode_value(&value),
            Err(ConsensusError::InvalidValue)
        ));
    }
}
