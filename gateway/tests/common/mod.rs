// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Shared fixtures for the scenario suites: gateway components wired to
//! the in-memory loopback broker, plus small payload helpers.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prost_types::Any;
use tokio::sync::mpsc;
use uuid::Uuid;

use tnc_gateway::application::bridge::CommunicationBridge;
use tnc_gateway::domain::identity::AgentIdentity;
use tnc_gateway::infrastructure::bus::local::LocalBroker;
use tnc_gateway::infrastructure::bus::BusClientFactory;
use tnc_gateway::infrastructure::config::GatewayConfig;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

pub fn test_config(name: &str, db_folder: &Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.identity = AgentIdentity::new(Uuid::new_v4(), name);
    config.bus.connection_url = Some("mqtt://loopback".into());
    config.consensus_db_folder = db_folder.to_path_buf();
    config
}

pub fn local_factory(broker: &Arc<LocalBroker>) -> Arc<dyn BusClientFactory> {
    Arc::new(Arc::clone(broker))
}

pub async fn started_bridge(
    broker: &Arc<LocalBroker>,
    name: &str,
    db_folder: &Path,
) -> Arc<CommunicationBridge> {
    let bridge = CommunicationBridge::new(test_config(name, db_folder), local_factory(broker));
    bridge.start().await.expect("bridge starts on loopback");
    bridge
}

/// Waits until the bridge knows `count` remote agents.
pub async fn wait_for_remote_agents(bridge: &CommunicationBridge, count: usize) {
    for _ in 0..200 {
        let (_, snapshot, _) = bridge.subscribe_lifecycle();
        if snapshot.len() == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("bridge never learned about {count} remote agents");
}

pub fn any_payload(body: serde_json::Value) -> Any {
    Any {
        type_url: "type.flowpro.tnc/flowpro.icc.TestBody".into(),
        value: serde_json::to_vec(&body).expect("test body serializes"),
    }
}

pub fn decode_any(any: &Any) -> serde_json::Value {
    serde_json::from_slice(&any.value).expect("test body deserializes")
}

pub async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("stream ended unexpectedly")
}
