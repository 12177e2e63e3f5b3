// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Agent identity and lifecycle selectors.

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Role every gateway announces on the bus. The empty lifecycle selector
/// matches exactly this role.
pub const TNC_AGENT_ROLE: &str = "TNC Agent";

/// Default human label of a gateway identity.
pub const DEFAULT_AGENT_NAME: &str = "FlowPro Agent";

/// The identity a gateway broadcasts onto the bus. `id` is stable across
/// restarts unless reconfigured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    pub id: Uuid,
    pub name: String,
    pub role: String,
}

impl AgentIdentity {
    pub fn new(id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            role: TNC_AGENT_ROLE.to_string(),
        }
    }
}

/// Which agents a lifecycle subscription reports on.
#[derive(Debug, Clone)]
pub enum AgentSelector {
    /// Every agent carrying the TNC agent role.
    All,
    /// Exact identity id.
    Id(Uuid),
    /// Exact identity name.
    Name(String),
    /// Compiled from a `/pattern/` selector; matched against the name.
    NamePattern(Regex),
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector id is not a valid uuid: {0}")]
    InvalidId(#[from] uuid::Error),

    #[error("selector pattern does not compile: {0}")]
    InvalidPattern(#[from] regex::Error),
}

impl AgentSelector {
    pub fn by_id(raw: &str) -> Result<Self, SelectorError> {
        Ok(Self::Id(raw.parse()?))
    }

    /// A value wrapped in slashes compiles as a regular expression, any
    /// other value matches the name exactly. Compilation happens here, at
    /// subscription time, before any event is emitted.
    pub fn by_name(raw: &str) -> Result<Self, SelectorError> {
        if raw.len() >= 2 && raw.starts_with('/') && raw.ends_with('/') {
            let pattern = &raw[1..raw.len() - 1];
            Ok(Self::NamePattern(Regex::new(pattern)?))
        } else {
            Ok(Self::Name(raw.to_string()))
        }
    }

    pub fn matches(&self, identity: &AgentIdentity) -> bool {
        match self {
            Self::All => identity.role == TNC_AGENT_ROLE,
            Self::Id(id) => identity.id == *id,
            Self::Name(name) => identity.name == *name,
            Self::NamePattern(pattern) => pattern.is_match(&identity.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(name: &str) -> AgentIdentity {
        AgentIdentity::new(Uuid::new_v4(), name)
    }

    #[test]
    fn empty_selector_matches_tnc_agents_only() {
        let selector = AgentSelector::All;
        assert!(selector.matches(&agent("FM agent")));

        let mut foreign = agent("other");
        foreign.role = "Observer".into();
        assert!(!selector.matches(&foreign));
    }

    #[test]
    fn id_selector_is_exact() {
        let target = agent("AGV agent 1");
        let selector = AgentSelector::by_id(&target.id.to_string()).unwrap();
        assert!(selector.matches(&target));
        assert!(!selector.matches(&agent("AGV agent 1")));
    }

    #[test]
    fn name_selector_without_slashes_is_exact() {
        let selector = AgentSelector::by_name("AGV agent 1").unwrap();
        assert!(selector.matches(&agent("AGV agent 1")));
        assert!(!selector.matches(&agent("AGV agent 10")));
    }

    #[test]
    fn slash_wrapped_name_compiles_as_regex() {
        let selector = AgentSelector::by_name("/^AGV agent.*$/").unwrap();
        assert!(selector.matches(&agent("AGV agent 1")));
        assert!(selector.matches(&agent("AGV agent 2")));
        assert!(!selector.matches(&agent("FM agent")));
    }

    #[test]
    fn invalid_regex_is_rejected_at_parse_time() {
        assert!(matches!(
            AgentSelector::by_name("/([unclosed/"),
            Err(SelectorError::InvalidPattern(_))
        ));
    }

    #[test]
    fn invalid_id_is_rejected() {
        assert!(matches!(
            AgentSelector::by_id("not-a-uuid"),
            Err(SelectorError::InvalidId(_))
        ));
    }

    #[test]
    fn single_slash_is_a_literal_name() {
        // "/" alone cannot be a pattern delimiter pair.
        let selector = AgentSelector::by_name("/").unwrap();
        assert!(matches!(selector, AgentSelector::Name(_)));
    }
}
