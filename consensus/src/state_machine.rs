// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Replicated key-value state machine.
//!
//! Keys are strings, values arbitrary JSON values. Inputs are applied in
//! log order on every cluster member, so all members converge on the same
//! map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One replicated input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum KvInput {
    Put { key: String, value: serde_json::Value },
    Delete { key: String },
    /// Commits without mutating; used to read a state at least as recent
    /// as the proposal.
    NoOp,
}

/// The materialized state shared with observers.
pub type KvState = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Default, Clone)]
pub struct KvStateMachine {
    entries: KvState,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one input. Returns true when the state changed.
    pub fn apply(&mut self, input: &KvInput) -> bool {
        match input {
            KvInput::Put { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                true
            }
            KvInput::Delete { key } => self.entries.remove(key).is_some(),
            KvInput::NoOp => false,
        }
    }

    pub fn state(&self) -> KvState {
        self.entries.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn put_then_delete_roundtrip() {
        let mut machine = KvStateMachine::new();

        assert!(machine.apply(&KvInput::Put {
            key: "foo".into(),
            value: json!(42),
        }));
        assert_eq!(machine.state().get("foo"), Some(&json!(42)));

        assert!(machine.apply(&KvInput::Delete { key: "foo".into() }));
        assert!(machine.state().is_empty());
    }

    #[test]
    fn delete_of_missing_key_is_not_a_change() {
        let mut machine = KvStateMachine::new();
        assert!(!machine.apply(&KvInput::Delete { key: "foo".into() }));
    }

    #[test]
    fn noop_does_not_mutate() {
        let mut machine = KvStateMachine::new();
        machine.apply(&KvInput::Put {
            key: "a".into(),
            value: json!(null),
        });
        let before = machine.state();

        assert!(!machine.apply(&KvInput::NoOp));
        assert_eq!(machine.state(), before);
    }

    #[test]
    fn put_overwrites_existing_value() {
        let mut machine = KvStateMachine::new();
        machine.apply(&KvInput::Put {
            key: "k".into(),
            value: json!("first"),
        });
        machine.apply(&KvInput::Put {
            key: "k".into(),
            value: json!({"nested": [1, 2]}),
        });

        assert_eq!(machine.state().get("k"), Some(&json!({"nested": [1, 2]})));
    }
}
