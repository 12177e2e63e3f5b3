// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

pub mod events;
pub mod identity;
pub mod payload;
pub mod route;

pub use events::*;
pub use identity::{AgentIdentity, AgentSelector, SelectorError, DEFAULT_AGENT_NAME, TNC_AGENT_ROLE};
pub use payload::{from_bus, to_bus, BusPayload, PayloadError};
pub use route::{validate_name, NameError, RoutingPolicy};
