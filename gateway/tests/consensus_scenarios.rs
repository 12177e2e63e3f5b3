// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Consensus gateway scenarios over the loopback bus.

mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use prost_types::value::Kind;
use serde_json::json;
use uuid::Uuid;

use tnc_gateway::application::bridge::CommunicationBridge;
use tnc_gateway::application::consensus::{
    ConnectionState, ConsensusError, ConsensusGateway, ProposalOperation, RaftTuning,
};
use tnc_gateway::infrastructure::bus::local::LocalBroker;

use common::{local_factory, started_bridge, test_config};

fn fast_tuning() -> RaftTuning {
    RaftTuning {
        heartbeat_interval: Duration::from_millis(50),
        election_timeout_min: Duration::from_millis(800),
        election_timeout_max: Duration::from_millis(1600),
        connect_timeout: Duration::from_secs(10),
    }
}

async fn consensus_agent(
    broker: &Arc<LocalBroker>,
    name: &str,
    db_folder: &Path,
) -> (Arc<CommunicationBridge>, Arc<ConsensusGateway>) {
    let bridge = started_bridge(broker, name, db_folder).await;
    let gateway =
        ConsensusGateway::with_tuning(Arc::clone(&bridge), db_folder.to_path_buf(), fast_tuning());
    (bridge, gateway)
}

fn number(value: f64) -> prost_types::Value {
    prost_types::Value {
        kind: Some(Kind::NumberValue(value)),
    }
}

async fn wait_for_configuration(gateway: &ConsensusGateway, node: Uuid, expected: usize) {
    for _ in 0..200 {
        let members = gateway.cluster_configuration(node).await.unwrap();
        if members.len() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("cluster configuration never reached {expected} members");
}

#[tokio::test]
async fn replicated_state_is_visible_on_every_member() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();

    let (_b1, g1) = consensus_agent(&broker, "agent-1", dir.path()).await;
    let (_b2, g2) = consensus_agent(&broker, "agent-2", dir.path()).await;
    let (_b3, g3) = consensus_agent(&broker, "agent-3", dir.path()).await;

    let n1 = g1.create("ftf-cluster".into(), true);
    let n2 = g2.create("ftf-cluster".into(), false);
    let n3 = g3.create("ftf-cluster".into(), false);

    g1.connect(n1).await.unwrap();
    g2.connect(n2).await.unwrap();
    g3.connect(n3).await.unwrap();

    // Every member reports the same three-node configuration.
    for (gateway, node) in [(&g1, n1), (&g2, n2), (&g3, n3)] {
        wait_for_configuration(gateway, node, 3).await;
        let members = gateway.cluster_configuration(node).await.unwrap();
        for expected in [n1, n2, n3] {
            assert!(members.contains(&expected));
        }
    }

    // A put through any member becomes visible to every other member.
    g2.propose(n2, ProposalOperation::Put, "foo".into(), Some(number(42.0)))
        .await
        .unwrap();
    for (gateway, node) in [(&g1, n1), (&g2, n2), (&g3, n3)] {
        let state = gateway.state(node).await.unwrap();
        assert_eq!(state.get("foo"), Some(&json!(42.0)));
    }

    for (gateway, node) in [(&g1, n1), (&g2, n2), (&g3, n3)] {
        let _ = gateway.stop(node).await;
    }
}

#[tokio::test]
async fn disconnect_removes_membership_and_store_while_stop_retains_them() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();

    let (_b1, g1) = consensus_agent(&broker, "agent-1", dir.path()).await;
    let (_b2, g2) = consensus_agent(&broker, "agent-2", dir.path()).await;
    let (_b3, g3) = consensus_agent(&broker, "agent-3", dir.path()).await;

    let n1 = g1.create("ftf-cluster".into(), true);
    let n2 = g2.create("ftf-cluster".into(), false);
    let n3 = g3.create("ftf-cluster".into(), false);
    g1.connect(n1).await.unwrap();
    g2.connect(n2).await.unwrap();
    g3.connect(n3).await.unwrap();
    wait_for_configuration(&g1, n1, 3).await;

    let store_n2 = dir.path().join(format!("raft-{n2}.json"));
    let store_n3 = dir.path().join(format!("raft-{n3}.json"));
    assert!(store_n2.exists());
    assert!(store_n3.exists());

    // Stop keeps the stopped node in the configuration and on disk.
    g3.stop(n3).await.unwrap();
    assert_eq!(g3.connection_state(n3).unwrap(), ConnectionState::Stopped);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let members = g1.cluster_configuration(n1).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.contains(&n3));
    assert!(store_n3.exists());

    // Disconnect removes the node from the configuration and deletes
    // exactly its persisted store.
    g2.disconnect(n2).await.unwrap();
    assert_eq!(g2.connection_state(n2).unwrap(), ConnectionState::Disconnected);
    wait_for_configuration(&g1, n1, 2).await;
    let members = g1.cluster_configuration(n1).await.unwrap();
    assert!(!members.contains(&n2));
    assert!(members.contains(&n3));
    assert!(!store_n2.exists());
    assert!(store_n3.exists());

    let _ = g1.stop(n1).await;
}

#[tokio::test]
async fn unset_value_proposes_null_and_tagless_values_are_malformed() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, gateway) = consensus_agent(&broker, "agent", dir.path()).await;

    let node = gateway.create("kv".into(), true);
    gateway.connect(node).await.unwrap();

    // Unset value: treated as the null value.
    let state = gateway
        .propose(node, ProposalOperation::Put, "foo".into(), None)
        .await
        .unwrap();
    assert_eq!(state.get("foo"), Some(&serde_json::Value::Null));

    // Present but tagless: malformed.
    let error = gateway
        .propose(
            node,
            ProposalOperation::Put,
            "foo".into(),
            Some(prost_types::Value { kind: None }),
        )
        .await
        .expect_err("tagless value rejected");
    assert!(matches!(error, ConsensusError::InvalidValue));

    // Delete through the same surface.
    let state = gateway
        .propose(node, ProposalOperation::Delete, "foo".into(), None)
        .await
        .unwrap();
    assert!(state.get("foo").is_none());

    gateway.stop(node).await.unwrap();
}

#[tokio::test]
async fn connection_state_machine_gates_operations() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, gateway) = consensus_agent(&broker, "agent", dir.path()).await;

    // Unknown ids are a caller bug.
    let error = gateway.state(Uuid::new_v4()).await.expect_err("unknown id");
    assert_eq!(
        error.to_string(),
        "Raft node with this id has not been created"
    );

    let node = gateway.create("kv".into(), true);
    assert_eq!(gateway.connection_state(node).unwrap(), ConnectionState::Created);

    // Operations on a created-but-unconnected node are unavailable.
    let error = gateway.state(node).await.expect_err("not connected");
    assert_eq!(error.to_string(), "Raft node is currently created");

    gateway.connect(node).await.unwrap();
    assert_eq!(gateway.connection_state(node).unwrap(), ConnectionState::Connected);

    // Connect is not valid while connected.
    let error = gateway.connect(node).await.expect_err("already connected");
    assert_eq!(error.to_string(), "Raft node is currently connected");

    // Stop and reconnect under the same id.
    gateway.stop(node).await.unwrap();
    let error = gateway.state(node).await.expect_err("stopped");
    assert_eq!(error.to_string(), "Raft node is currently stopped");

    gateway.connect(node).await.unwrap();
    let state = gateway.state(node).await.unwrap();
    assert!(state.is_empty());

    gateway.stop(node).await.unwrap();
}

#[tokio::test]
async fn connect_fails_fast_while_the_bus_is_offline() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();

    // Bridge without a connection url: the bus stays down.
    let mut config = test_config("agent", dir.path());
    config.bus.connection_url = None;
    let bridge = CommunicationBridge::new(config, local_factory(&broker));
    bridge.start().await.unwrap();
    let gateway =
        ConsensusGateway::with_tuning(Arc::clone(&bridge), dir.path().to_path_buf(), fast_tuning());

    let node = gateway.create("kv".into(), true);
    let error = gateway.connect(node).await.expect_err("bus offline");
    assert!(matches!(error, ConsensusError::BusOffline));
    assert_eq!(gateway.connection_state(node).unwrap(), ConnectionState::Created);
}

#[tokio::test]
async fn observers_follow_commits_and_end_on_stop() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, gateway) = consensus_agent(&broker, "agent", dir.path()).await;

    let node = gateway.create("kv".into(), true);
    gateway.connect(node).await.unwrap();

    let (mut states, mut alive) = gateway.observe_state(node).unwrap();
    assert!(*alive.borrow());

    gateway
        .propose(node, ProposalOperation::Put, "a".into(), Some(number(1.0)))
        .await
        .unwrap();
    let observed = states.recv().await.unwrap();
    assert_eq!(observed.get("a"), Some(&json!(1.0)));

    gateway.stop(node).await.unwrap();
    alive.changed().await.unwrap();
    assert!(!*alive.borrow(), "observers learn the node left Connected");
}

#[tokio::test]
async fn gateway_shutdown_stops_connected_nodes_but_keeps_stores() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let (_bridge, gateway) = consensus_agent(&broker, "agent", dir.path()).await;

    let node = gateway.create("kv".into(), true);
    gateway.connect(node).await.unwrap();
    let store = dir.path().join(format!("raft-{node}.json"));
    assert!(store.exists());

    gateway.shutdown().await;

    assert_eq!(gateway.connection_state(node).unwrap(), ConnectionState::Stopped);
    assert!(store.exists(), "shutdown never deletes persisted state");
}
