// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Adapter carrying consensus traffic over the bus.
//!
//! Raft frames travel as opaque channel payloads under their scope name,
//! so consensus rides the same substrate as every other event. The
//! provider indirection resolves the current bus client per operation;
//! after a reconfigure the old client's subscriptions simply end and the
//! node task reports the loss through its operation results.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tokio::sync::mpsc;
use tnc_consensus::transport::RaftTransport;
use tnc_consensus::TransportError;
use tracing::debug;

use crate::domain::payload::BusPayload;

use super::BusClient;

/// Object type of a raft frame on the bus.
pub const RAFT_FRAME_TYPE: &str = "tnc.consensus.RaftFrame";

/// Resolves the bus client consensus traffic should ride on.
#[async_trait]
pub trait BusClientProvider: Send + Sync {
    async fn bus_client(&self) -> Arc<dyn BusClient>;
}

pub struct BusRaftTransport {
    provider: Arc<dyn BusClientProvider>,
}

impl BusRaftTransport {
    pub fn new(provider: Arc<dyn BusClientProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

#[async_trait]
impl RaftTransport for BusRaftTransport {
    async fn publish(&self, scope: &str, frame: Vec<u8>) -> Result<(), TransportError> {
        let client = self.provider.bus_client().await;
        if !client.is_online() {
            return Err(TransportError::Offline);
        }
        let payload = BusPayload {
            object_type: RAFT_FRAME_TYPE.to_string(),
            value: BASE64.encode(frame),
            source_id: Some(client.identity().id),
        };
        client
            .publish_channel(scope, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(
        &self,
        scope: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, TransportError> {
        let client = self.provider.bus_client().await;
        let mut events = client
            .observe_channel(scope)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let scope = scope.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match BASE64.decode(&event.payload.value) {
                    Ok(bytes) => {
                        if tx.send(bytes).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        debug!(scope = %scope, error = %e, "discarding undecodable raft payload");
                    }
                }
            }
        });
        Ok(rx)
    }
}
