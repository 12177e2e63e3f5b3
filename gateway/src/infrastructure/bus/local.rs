// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! In-memory loopback bus.
//!
//! A [`LocalBroker`] plays the role of the external broker: retained
//! presence, channel fan-out, call routing and per-publisher ordering,
//! with self-delivery exactly like the real bus. Multiple [`LocalBus`]
//! clients attach to one broker, which lets the integration suites run
//! multi-agent scenarios in one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::domain::events::{
    ChannelEvent, IdentityEvent, InboundCall, ReturnBody, ReturnEvent,
};
use crate::domain::identity::AgentIdentity;
use crate::domain::payload::BusPayload;
use crate::infrastructure::config::BusOptions;

use super::{BusClient, BusClientFactory, BusError};

struct Sub<T> {
    owner: Uuid,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct BrokerInner {
    identities: HashMap<Uuid, AgentIdentity>,
    channels: HashMap<String, Vec<Sub<ChannelEvent>>>,
    calls: HashMap<String, Vec<Sub<InboundCall>>>,
    returns: HashMap<Uuid, Vec<Sub<ReturnEvent>>>,
    identity_subs: Vec<Sub<IdentityEvent>>,
}

/// The in-process stand-in for the external broker.
#[derive(Default)]
pub struct LocalBroker {
    inner: Mutex<BrokerInner>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attaches a new client with the given identity.
    pub fn client(self: &Arc<Self>, identity: AgentIdentity) -> Arc<LocalBus> {
        let (online, _) = watch::channel(false);
        Arc::new(LocalBus {
            broker: Arc::clone(self),
            identity,
            session: Uuid::new_v4(),
            online: Arc::new(online),
            offline_queue: Mutex::new(Vec::new()),
        })
    }

    fn announce(&self, identity: AgentIdentity) {
        let mut inner = self.inner.lock();
        inner.identities.insert(identity.id, identity.clone());
        inner
            .identity_subs
            .retain(|sub| sub.tx.send(IdentityEvent::Join(identity.clone())).is_ok());
    }

    fn retract(&self, id: Uuid) {
        let mut inner = self.inner.lock();
        if let Some(identity) = inner.identities.remove(&id) {
            inner
                .identity_subs
                .retain(|sub| sub.tx.send(IdentityEvent::Leave(identity.clone())).is_ok());
        }
    }

    fn publish_channel(&self, id: &str, event: ChannelEvent) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.channels.get_mut(id) {
            subs.retain(|sub| sub.tx.send(event.clone()).is_ok());
            if subs.is_empty() {
                inner.channels.remove(id);
            }
        }
    }

    fn publish_call(&self, operation: &str, call: InboundCall) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.calls.get_mut(operation) {
            subs.retain(|sub| sub.tx.send(call.clone()).is_ok());
            if subs.is_empty() {
                inner.calls.remove(operation);
            }
        }
    }

    fn publish_return(&self, correlation: Uuid, event: ReturnEvent) {
        let mut inner = self.inner.lock();
        if let Some(subs) = inner.returns.get_mut(&correlation) {
            subs.retain(|sub| sub.tx.send(event.clone()).is_ok());
            if subs.is_empty() {
                inner.returns.remove(&correlation);
            }
        }
    }

    fn subscribe_channel(&self, owner: Uuid, id: &str) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .channels
            .entry(id.to_string())
            .or_default()
            .push(Sub { owner, tx });
        rx
    }

    fn subscribe_call(&self, owner: Uuid, operation: &str) -> mpsc::UnboundedReceiver<InboundCall> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .calls
            .entry(operation.to_string())
            .or_default()
            .push(Sub { owner, tx });
        rx
    }

    fn subscribe_return(&self, owner: Uuid, correlation: Uuid) -> mpsc::UnboundedReceiver<ReturnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .returns
            .entry(correlation)
            .or_default()
            .push(Sub { owner, tx });
        rx
    }

    fn subscribe_identity(
        &self,
        owner: Uuid,
    ) -> (Vec<AgentIdentity>, mpsc::UnboundedReceiver<IdentityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let snapshot = inner.identities.values().cloned().collect();
        inner.identity_subs.push(Sub { owner, tx });
        (snapshot, rx)
    }

    fn snapshot(&self) -> Vec<AgentIdentity> {
        self.inner.lock().identities.values().cloned().collect()
    }

    /// Drops every subscription of one client session; their receivers
    /// end cleanly.
    fn drop_session(&self, owner: Uuid) {
        let mut inner = self.inner.lock();
        for subs in inner.channels.values_mut() {
            subs.retain(|sub| sub.owner != owner);
        }
        inner.channels.retain(|_, subs| !subs.is_empty());
        for subs in inner.calls.values_mut() {
            subs.retain(|sub| sub.owner != owner);
        }
        inner.calls.retain(|_, subs| !subs.is_empty());
        for subs in inner.returns.values_mut() {
            subs.retain(|sub| sub.owner != owner);
        }
        inner.returns.retain(|_, subs| !subs.is_empty());
        inner.identity_subs.retain(|sub| sub.owner != owner);
    }
}

impl BusClientFactory for Arc<LocalBroker> {
    fn create(&self, identity: AgentIdentity, _options: &BusOptions) -> Arc<dyn BusClient> {
        self.client(identity)
    }
}

enum QueuedPublish {
    Channel { id: String, payload: BusPayload },
    Call { call: InboundCall },
    Return { correlation: Uuid, event: ReturnEvent },
}

/// One agent's attachment to the loopback broker.
pub struct LocalBus {
    broker: Arc<LocalBroker>,
    identity: AgentIdentity,
    session: Uuid,
    online: Arc<watch::Sender<bool>>,
    /// Publishes issued while offline, applied on the next start.
    offline_queue: Mutex<Vec<QueuedPublish>>,
}

impl LocalBus {
    fn flush_queue(&self) {
        let queued: Vec<QueuedPublish> = self.offline_queue.lock().drain(..).collect();
        for publish in queued {
            match publish {
                QueuedPublish::Channel { id, payload } => {
                    self.broker
                        .publish_channel(&id.clone(), ChannelEvent { id, payload });
                }
                QueuedPublish::Call { call } => {
                    let operation = call.operation.clone();
                    self.broker.publish_call(&operation, call);
                }
                QueuedPublish::Return { correlation, event } => {
                    self.broker.publish_return(correlation, event);
                }
            }
        }
    }
}

#[async_trait]
impl BusClient for LocalBus {
    fn identity(&self) -> AgentIdentity {
        self.identity.clone()
    }

    fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    fn online_watch(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    async fn start(&self) -> Result<(), BusError> {
        self.broker.announce(self.identity());
        self.online.send_replace(true);
        self.flush_queue();
        Ok(())
    }

    async fn stop(&self) {
        self.online.send_replace(false);
        self.broker.retract(self.identity().id);
        self.broker.drop_session(self.session);
    }

    async fn restart(&self, _options: BusOptions) -> Result<(), BusError> {
        self.stop().await;
        self.start().await
    }

    async fn publish_channel(&self, id: &str, payload: BusPayload) -> Result<(), BusError> {
        if !self.is_online() {
            self.offline_queue.lock().push(QueuedPublish::Channel {
                id: id.to_string(),
                payload,
            });
            return Ok(());
        }
        self.broker.publish_channel(
            id,
            ChannelEvent {
                id: id.to_string(),
                payload,
            },
        );
        Ok(())
    }

    async fn observe_channel(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, BusError> {
        Ok(self.broker.subscribe_channel(self.session, id))
    }

    async fn publish_call(
        &self,
        operation: &str,
        payload: BusPayload,
    ) -> Result<mpsc::UnboundedReceiver<ReturnEvent>, BusError> {
        let correlation = Uuid::new_v4();
        let returns = self.broker.subscribe_return(self.session, correlation);
        let call = InboundCall {
            operation: operation.to_string(),
            correlation,
            payload,
        };
        if self.is_online() {
            self.broker.publish_call(operation, call);
        } else {
            self.offline_queue.lock().push(QueuedPublish::Call { call });
        }
        Ok(returns)
    }

    async fn observe_call(
        &self,
        operation: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundCall>, BusError> {
        Ok(self.broker.subscribe_call(self.session, operation))
    }

    async fn publish_return(&self, correlation: Uuid, body: ReturnBody) -> Result<(), BusError> {
        let event = ReturnEvent {
            source_id: Some(self.identity().id),
            body,
        };
        if self.is_online() {
            self.broker.publish_return(correlation, event);
        } else {
            self.offline_queue
                .lock()
                .push(QueuedPublish::Return { correlation, event });
        }
        Ok(())
    }

    fn observe_identity(&self) -> (Vec<AgentIdentity>, mpsc::UnboundedReceiver<IdentityEvent>) {
        self.broker.subscribe_identity(self.session)
    }

    fn identity_snapshot(&self) -> Vec<AgentIdentity> {
        self.broker.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::payload::BusPayload;

    fn payload(marker: &str) -> BusPayload {
        BusPayload {
            object_type: "test".into(),
            value: marker.into(),
            source_id: None,
        }
    }

    fn agent(broker: &Arc<LocalBroker>, name: &str) -> Arc<LocalBus> {
        broker.client(AgentIdentity::new(Uuid::new_v4(), name))
    }

    #[tokio::test]
    async fn channel_publish_reaches_all_observers_including_self() {
        let broker = LocalBroker::new();
        let a = agent(&broker, "a");
        let b = agent(&broker, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        let mut rx_a = a.observe_channel("ch").await.unwrap();
        let mut rx_b = b.observe_channel("ch").await.unwrap();

        a.publish_channel("ch", payload("x")).await.unwrap();

        assert_eq!(rx_a.recv().await.unwrap().payload.value, "x");
        assert_eq!(rx_b.recv().await.unwrap().payload.value, "x");
    }

    #[tokio::test]
    async fn call_and_return_are_correlated() {
        let broker = LocalBroker::new();
        let caller = agent(&broker, "caller");
        let responder = agent(&broker, "responder");
        caller.start().await.unwrap();
        responder.start().await.unwrap();

        let mut calls = responder.observe_call("op").await.unwrap();
        let mut returns = caller.publish_call("op", payload("req")).await.unwrap();

        let call = calls.recv().await.unwrap();
        assert_eq!(call.payload.value, "req");

        responder
            .publish_return(
                call.correlation,
                ReturnBody::Data {
                    payload: payload("res"),
                },
            )
            .await
            .unwrap();

        let ret = returns.recv().await.unwrap();
        assert_eq!(ret.source_id, Some(responder.identity().id));
        match ret.body {
            ReturnBody::Data { payload } => assert_eq!(payload.value, "res"),
            other => panic!("expected data return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_ends_subscriptions_and_retracts_presence() {
        let broker = LocalBroker::new();
        let a = agent(&broker, "a");
        let b = agent(&broker, "b");
        a.start().await.unwrap();
        b.start().await.unwrap();

        let (_, mut identity_rx) = b.observe_identity();
        let mut rx = a.observe_channel("ch").await.unwrap();

        a.stop().await;

        // subscription of the stopped client ends cleanly
        assert!(rx.recv().await.is_none());

        // the other client sees the leave
        match identity_rx.recv().await.unwrap() {
            IdentityEvent::Leave(identity) => assert_eq!(identity.name, "a"),
            other => panic!("expected leave, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn snapshot_contains_started_agents() {
        let broker = LocalBroker::new();
        let a = agent(&broker, "FM agent");
        let b = agent(&broker, "AGV agent 1");
        a.start().await.unwrap();
        b.start().await.unwrap();

        let names: Vec<String> = a
            .identity_snapshot()
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"FM agent".to_string()));
        assert!(names.contains(&"AGV agent 1".to_string()));
    }

    #[tokio::test]
    async fn offline_publishes_are_queued_until_start() {
        let broker = LocalBroker::new();
        let a = agent(&broker, "a");
        let b = agent(&broker, "b");
        b.start().await.unwrap();
        let mut rx = b.observe_channel("ch").await.unwrap();

        // a is not started yet; the publish is queued
        a.publish_channel("ch", payload("queued")).await.unwrap();
        assert!(rx.try_recv().is_err());

        a.start().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().payload.value, "queued");
    }
}
