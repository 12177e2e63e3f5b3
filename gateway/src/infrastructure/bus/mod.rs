// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Bus connection seam.
//!
//! The bridge and the consensus gateway only ever see [`BusClient`]; the
//! production implementation speaks MQTT, the in-memory one wires
//! multiple clients through a loopback broker for the test suites. Both
//! deliver a client's own publishes back to its matching observations and
//! preserve per-publisher ordering, which the call-return contract relies
//! on.
//!
//! A subscription receiver ends (`None`) when the client stops or is
//! reconfigured; that is the clean-end signal the gRPC streams translate
//! into EOF.

pub mod local;
pub mod mqtt;
pub mod raft_transport;
pub mod topic;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::domain::events::{
    ChannelEvent, IdentityEvent, InboundCall, ReturnBody, ReturnEvent,
};
use crate::domain::identity::AgentIdentity;
use crate::domain::payload::BusPayload;
use crate::infrastructure::config::BusOptions;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is offline")]
    Offline,

    #[error("bus client has no connection url configured")]
    NotConfigured,

    #[error("bus connection url is invalid: {0}")]
    InvalidUrl(String),

    #[error("bus TLS material is invalid: {0}")]
    Tls(String),

    #[error("bus transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait BusClient: Send + Sync {
    fn identity(&self) -> AgentIdentity;

    fn is_online(&self) -> bool;

    fn online_watch(&self) -> watch::Receiver<bool>;

    /// Connects to the bus and announces the identity.
    async fn start(&self) -> Result<(), BusError>;

    /// Retracts the identity, drops the connection and ends every
    /// subscription receiver of this client.
    async fn stop(&self);

    /// Stop followed by start under new transport parameters, keeping the
    /// identity.
    async fn restart(&self, options: BusOptions) -> Result<(), BusError>;

    async fn publish_channel(&self, id: &str, payload: BusPayload) -> Result<(), BusError>;

    async fn observe_channel(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, BusError>;

    /// Publishes a call and yields its stream of returns. The stream is
    /// unbounded in count and time; it ends when the receiver is dropped
    /// or the client stops.
    async fn publish_call(
        &self,
        operation: &str,
        payload: BusPayload,
    ) -> Result<mpsc::UnboundedReceiver<ReturnEvent>, BusError>;

    async fn observe_call(
        &self,
        operation: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundCall>, BusError>;

    /// Publishes one return for a previously observed call.
    async fn publish_return(&self, correlation: Uuid, body: ReturnBody) -> Result<(), BusError>;

    /// Atomic snapshot of the currently known agents plus a delta stream.
    fn observe_identity(&self) -> (Vec<AgentIdentity>, mpsc::UnboundedReceiver<IdentityEvent>);

    fn identity_snapshot(&self) -> Vec<AgentIdentity>;
}

/// Creates clients for the bridge; swapped between MQTT and the loopback
/// broker by composition.
pub trait BusClientFactory: Send + Sync {
    fn create(&self, identity: AgentIdentity, options: &BusOptions) -> Arc<dyn BusClient>;
}
