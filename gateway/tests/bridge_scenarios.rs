// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Channel and call-return scenarios over the loopback bus.

mod common;

use std::time::Duration;

use serde_json::json;

use tnc_gateway::application::bridge::{BridgeError, CommunicationBridge, ReturnOutcome};
use tnc_gateway::domain::events::ReturnBody;
use tnc_gateway::domain::payload::{from_bus, to_bus};
use tnc_gateway::infrastructure::bus::local::LocalBroker;
use tnc_gateway::infrastructure::config::ConfigureUpdate;

use common::{any_payload, decode_any, local_factory, recv_timeout, started_bridge, test_config};

#[tokio::test]
async fn channel_publish_is_delivered_to_all_observers_including_self() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let publisher = started_bridge(&broker, "publisher", dir.path()).await;
    let observer = started_bridge(&broker, "observer", dir.path()).await;

    let mut own = publisher
        .observe_channel("flowpro.icc.ftf.FtfStatus")
        .await
        .unwrap();
    let mut remote = observer
        .observe_channel("flowpro.icc.ftf.FtfStatus")
        .await
        .unwrap();

    let payload = any_payload(json!({"seqId": 1, "value": 11}));
    publisher
        .publish_channel("flowpro.icc.ftf.FtfStatus", Some(&payload))
        .await
        .unwrap();

    for rx in [&mut own, &mut remote] {
        let event = recv_timeout(rx).await;
        // source identity rides inside the bus object
        assert_eq!(event.payload.source_id, Some(publisher.local_identity().id));
        let any = from_bus(&event.payload).unwrap();
        assert_eq!(decode_any(&any)["value"], 11);
    }
}

#[tokio::test]
async fn invalid_channel_ids_are_rejected() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let bridge = started_bridge(&broker, "agent", dir.path()).await;

    for id in ["", "a/b", "a#b", "a+b", "a\u{0}b"] {
        let result = bridge.publish_channel(id, None).await;
        assert!(
            matches!(result, Err(BridgeError::InvalidName(_))),
            "{id:?} must be rejected"
        );
        let result = bridge.observe_channel(id).await;
        assert!(matches!(result, Err(BridgeError::InvalidName(_))));
    }
}

#[tokio::test]
async fn call_return_streams_many_results_and_complete_releases_the_sink() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let caller = started_bridge(&broker, "caller", dir.path()).await;
    let responder = started_bridge(&broker, "responder", dir.path()).await;

    let mut observed = responder
        .observe_call("flowpro.icc.ftf.Transport")
        .await
        .unwrap();
    let request = any_payload(json!({"job": 7}));
    let mut returns = caller
        .publish_call("flowpro.icc.ftf.Transport", Some(&request))
        .await
        .unwrap();

    let call = recv_timeout(&mut observed).await;
    assert_eq!(decode_any(&from_bus(&call.payload).unwrap())["job"], 7);
    assert_eq!(responder.sink_count(), 1);

    // An error first, then a data return, then complete.
    let outcome = responder
        .publish_return(
            call.correlation,
            ReturnBody::Error {
                message: "still busy".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReturnOutcome::Delivered);

    let data = to_bus(Some(&any_payload(json!({"value": 2}))), None);
    responder
        .publish_return(call.correlation, ReturnBody::Data { payload: data })
        .await
        .unwrap();

    responder.publish_complete(call.correlation);
    assert_eq!(responder.sink_count(), 0);

    // Returns arrive in the responder's emission order.
    match recv_timeout(&mut returns).await.body {
        ReturnBody::Error { message } => assert_eq!(message, "still busy"),
        other => panic!("expected the error first, got {other:?}"),
    }
    match recv_timeout(&mut returns).await.body {
        ReturnBody::Data { payload } => {
            assert_eq!(decode_any(&from_bus(&payload).unwrap())["value"], 2);
        }
        other => panic!("expected the data return, got {other:?}"),
    }

    // Complete releases the sink but does not end the caller's stream.
    let idle = tokio::time::timeout(Duration::from_millis(200), returns.recv()).await;
    assert!(idle.is_err(), "stream stays open until the caller cancels");
}

#[tokio::test]
async fn returns_after_complete_are_silently_discarded() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let caller = started_bridge(&broker, "caller", dir.path()).await;
    let responder = started_bridge(&broker, "responder", dir.path()).await;

    let mut observed = responder.observe_call("op").await.unwrap();
    let _returns = caller.publish_call("op", None).await.unwrap();
    let call = recv_timeout(&mut observed).await;

    responder.publish_complete(call.correlation);
    // repeat completes are a no-op
    responder.publish_complete(call.correlation);

    let outcome = responder
        .publish_return(
            call.correlation,
            ReturnBody::Error {
                message: "late".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ReturnOutcome::Discarded);
}

#[tokio::test]
async fn fail_fast_rejects_operations_while_offline() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();

    // No connection url: the bus never autostarts.
    let mut config = test_config("offline", dir.path());
    config.bus.connection_url = None;
    let bridge = CommunicationBridge::new(config, local_factory(&broker));
    bridge.start().await.unwrap();

    assert!(matches!(
        bridge.publish_channel("ch", None).await,
        Err(BridgeError::Offline)
    ));
    assert!(matches!(
        bridge.observe_channel("ch").await,
        Err(BridgeError::Offline)
    ));
    assert!(matches!(
        bridge.publish_call("op", None).await,
        Err(BridgeError::Offline)
    ));
}

#[tokio::test]
async fn without_fail_fast_offline_publishes_are_queued() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let observer = started_bridge(&broker, "observer", dir.path()).await;
    let mut events = observer.observe_channel("ch").await.unwrap();

    let mut config = test_config("sender", dir.path());
    config.fail_fast_if_offline = false;
    let sender = CommunicationBridge::new(config, local_factory(&broker));
    // not started: offline, but the publish is accepted and queued
    sender.publish_channel("ch", None).await.unwrap();

    sender.start().await.unwrap();
    let event = recv_timeout(&mut events).await;
    assert_eq!(event.id, "ch");
}

#[tokio::test]
async fn configure_cleanly_ends_outstanding_streams() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let bridge = started_bridge(&broker, "agent", dir.path()).await;
    let responder = started_bridge(&broker, "responder", dir.path()).await;

    let mut channel = bridge.observe_channel("ch").await.unwrap();
    let mut returns = bridge.publish_call("op", None).await.unwrap();
    let mut observed = responder.observe_call("op").await.unwrap();
    let _call = recv_timeout(&mut observed).await;
    assert_eq!(responder.sink_count(), 1);

    bridge.configure(ConfigureUpdate::default()).await.unwrap();
    responder.configure(ConfigureUpdate::default()).await.unwrap();

    // Observation and publish-call streams end with EOF, not an error.
    assert!(channel.recv().await.is_none());
    assert!(returns.recv().await.is_none());

    // The responder's sinks are released with its ended subscription.
    for _ in 0..100 {
        if responder.sink_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(responder.sink_count(), 0);
}

#[tokio::test]
async fn configure_with_identical_options_is_idempotent() {
    let broker = LocalBroker::new();
    let dir = tempfile::tempdir().unwrap();
    let bridge = started_bridge(&broker, "agent", dir.path()).await;

    let before = bridge.config().await;
    bridge.configure(ConfigureUpdate::default()).await.unwrap();
    let after = bridge.config().await;

    assert_eq!(before, after);
    assert!(bridge.is_online().await, "bus restarted and came back");
}
