// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Lifecycle tracking of agents on the bus.
//!
//! A tracker stream starts with a JOIN for every currently known agent
//! matching the selector (the local one flagged), then follows with
//! deltas. Per-stream presence bookkeeping deduplicates re-announcements
//! after a bus restart and turns an identity mutation into the
//! LEAVE-then-JOIN pair subscribers expect.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use crate::domain::events::{AgentLifecycleEvent, IdentityEvent};
use crate::domain::identity::{AgentIdentity, AgentSelector};

use super::bridge::CommunicationBridge;

pub struct LifecycleTracker {
    bridge: Arc<CommunicationBridge>,
}

impl LifecycleTracker {
    pub fn new(bridge: Arc<CommunicationBridge>) -> Self {
        Self { bridge }
    }

    /// Streams lifecycle events for agents matching the selector until
    /// the receiver is dropped. Survives bus reconfiguration.
    pub fn track(&self, selector: AgentSelector) -> mpsc::UnboundedReceiver<AgentLifecycleEvent> {
        let (local, snapshot, mut hub) = self.bridge.subscribe_lifecycle();
        let bridge = Arc::clone(&self.bridge);
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut present: HashSet<Uuid> = HashSet::new();

            for identity in std::iter::once(local).chain(snapshot) {
                if !selector.matches(&identity) || !present.insert(identity.id) {
                    continue;
                }
                if send_event(&tx, &bridge, identity, true).is_err() {
                    return;
                }
            }

            loop {
                let event = match hub.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "lifecycle stream lagged behind identity events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let delivered = match event {
                    IdentityEvent::Join(identity) => {
                        if selector.matches(&identity) && present.insert(identity.id) {
                            send_event(&tx, &bridge, identity, true)
                        } else {
                            Ok(())
                        }
                    }
                    IdentityEvent::Leave(identity) => {
                        if present.remove(&identity.id) {
                            send_event(&tx, &bridge, identity, false)
                        } else {
                            Ok(())
                        }
                    }
                };
                if delivered.is_err() {
                    return;
                }
            }
        });

        rx
    }
}

fn send_event(
    tx: &mpsc::UnboundedSender<AgentLifecycleEvent>,
    bridge: &CommunicationBridge,
    identity: AgentIdentity,
    joined: bool,
) -> Result<(), ()> {
    let local = identity.id == bridge.local_identity().id;
    tx.send(AgentLifecycleEvent {
        identity,
        joined,
        local,
    })
    .map_err(|_| ())
}
