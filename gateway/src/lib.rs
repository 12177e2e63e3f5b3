// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! # TNC agent gateway
//!
//! Per-agent gateway exposing four gRPC services to local application
//! components and bridging them onto the distributed event bus and the
//! consensus substrate layered on it:
//!
//! - **RoutingService** — in-process push and request/response routing
//!   with pluggable dispatch policies.
//! - **CommunicationService** — the channel and call-return patterns of
//!   the bus, with correlation bookkeeping and live reconfiguration.
//! - **LifecycleService** — join/leave tracking of agents matching a
//!   selector, with initial snapshot semantics.
//! - **ConsensusService** — a registry of Raft nodes over a replicated
//!   key-value state machine.

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod presentation;

pub use infrastructure::config::GatewayConfig;
pub use presentation::GatewayServer;
