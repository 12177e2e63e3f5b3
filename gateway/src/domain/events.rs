// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Event model of the gateway.
//!
//! Two families live here: the serde frames that actually travel on the
//! bus (channel id, operation and correlation ride in the topic, the frame
//! carries the rest) and the in-process events handed between the bus
//! client, the bridge and the local routing engine.

use prost_types::Any;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::identity::AgentIdentity;
use super::payload::BusPayload;

// ---------------------------------------------------------------------
// wire frames
// ---------------------------------------------------------------------

/// Frame published for a call. Travels on the call topic of the
/// operation; returns flow back on the return topic of the correlation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub operation: String,
    pub correlation: Uuid,
    pub payload: BusPayload,
}

/// One response to a call; a single correlation can see many of these
/// from many responders over time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnFrame {
    pub correlation: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<Uuid>,
    pub body: ReturnBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReturnBody {
    Data { payload: BusPayload },
    Error { message: String },
}

// ---------------------------------------------------------------------
// in-process events
// ---------------------------------------------------------------------

/// A channel event as surfaced by the bus client.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub id: String,
    pub payload: BusPayload,
}

/// An inbound call as surfaced by the bus client. `correlation` is the
/// bus-side correlation the responder publishes returns to.
#[derive(Debug, Clone)]
pub struct InboundCall {
    pub operation: String,
    pub correlation: Uuid,
    pub payload: BusPayload,
}

/// One return delivered to a caller.
#[derive(Debug, Clone)]
pub struct ReturnEvent {
    pub source_id: Option<Uuid>,
    pub body: ReturnBody,
}

/// Presence change reported by the bus client.
#[derive(Debug, Clone)]
pub enum IdentityEvent {
    Join(AgentIdentity),
    Leave(AgentIdentity),
}

/// Lifecycle event handed to TrackAgents subscribers.
#[derive(Debug, Clone)]
pub struct AgentLifecycleEvent {
    pub identity: AgentIdentity,
    pub joined: bool,
    pub local: bool,
}

// ---------------------------------------------------------------------
// local routing messages
// ---------------------------------------------------------------------

/// One-way event on a push route.
#[derive(Debug, Clone)]
pub struct PushMessage {
    pub route: String,
    pub payload: Option<Any>,
}

/// Two-way event on a request route. `request_id` is assigned by the
/// engine when the event is dispatched to a registration.
#[derive(Debug, Clone)]
pub struct RequestMessage {
    pub route: String,
    pub request_id: u32,
    pub payload: Option<Any>,
}

/// Response correlated with a dispatched request.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub route: String,
    pub request_id: u32,
    pub payload: Option<Any>,
}
