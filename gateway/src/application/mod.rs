// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

pub mod bridge;
pub mod consensus;
pub mod lifecycle;
pub mod routing;

pub use bridge::{BridgeError, CommunicationBridge, ObservedCall, ReturnOutcome};
pub use consensus::{ConnectionState, ConsensusError, ConsensusGateway, ProposalOperation};
pub use lifecycle::LifecycleTracker;
pub use routing::{RoutingEngine, RoutingError};
