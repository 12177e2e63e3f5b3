// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Route, channel and operation names plus the request dispatch policies.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Characters that never appear in a valid channel id or call operation;
/// they collide with the topic syntax of the bus.
const FORBIDDEN: [char; 4] = ['\u{0}', '#', '+', '/'];

#[derive(Debug, Error)]
pub enum NameError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{0} must not contain NUL, '#', '+' or '/'")]
    ForbiddenCharacter(&'static str),
}

/// Validates a channel id, call operation or similar bus-visible name.
pub fn validate_name(kind: &'static str, value: &str) -> Result<(), NameError> {
    if value.is_empty() {
        return Err(NameError::Empty(kind));
    }
    if value.contains(FORBIDDEN) {
        return Err(NameError::ForbiddenCharacter(kind));
    }
    Ok(())
}

/// Dispatch discipline of a request route group. All registrations of one
/// group share the same policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoutingPolicy {
    /// At most one registration; dispatch to it.
    Single,
    /// Always the oldest registration.
    First,
    /// Always the newest registration.
    Last,
    /// Round-robin over the live registrations.
    Next,
    /// Uniformly random registration.
    Random,
}

impl std::fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Single => "SINGLE",
            Self::First => "FIRST",
            Self::Last => "LAST",
            Self::Next => "NEXT",
            Self::Random => "RANDOM",
        };
        f.write_str(name)
    }
}
