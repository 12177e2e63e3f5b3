// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Bus communication bridge.
//!
//! Owns the live bus client and the configuration it was built from.
//! `configure` stops the client (which cleanly ends every observation and
//! publish-call stream), merges the update, and either restarts the same
//! client with new transport parameters or replaces it when the agent
//! identity changed.
//!
//! For the call pattern the bridge keeps a registry of response sinks:
//! one fresh UUID per observed inbound call, mapping back to the bus-side
//! correlation. `PublishReturn` resolves through that registry,
//! `PublishComplete` releases the entry, and a call subscription that
//! ends releases everything it owned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use prost_types::Any;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::events::{ChannelEvent, IdentityEvent, ReturnBody, ReturnEvent};
use crate::domain::identity::AgentIdentity;
use crate::domain::payload::{to_bus, BusPayload};
use crate::domain::route::{validate_name, NameError};
use crate::infrastructure::bus::raft_transport::BusClientProvider;
use crate::infrastructure::bus::{BusClient, BusClientFactory, BusError};
use crate::infrastructure::config::{ConfigError, ConfigureUpdate, GatewayConfig};

const IDENTITY_HUB_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    InvalidName(#[from] NameError),

    #[error("Bus is offline")]
    Offline,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// An inbound call surfaced to a local observer; `correlation` is the
/// fresh gateway-side id the observer responds with.
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub operation: String,
    pub correlation: Uuid,
    pub payload: BusPayload,
}

/// Whether a return was handed to the bus or silently discarded because
/// no sink exists for its correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnOutcome {
    Delivered,
    Discarded,
}

struct ResponseSink {
    bus_correlation: Uuid,
    owner: u64,
}

struct BridgeState {
    config: GatewayConfig,
    client: Arc<dyn BusClient>,
    pump: Option<JoinHandle<()>>,
}

/// The lifecycle view of the world: the live local identity and every
/// known remote agent, guarded together. Mutations publish their hub
/// events while still holding the lock, so a subscriber sees a change
/// either in its snapshot or on its receiver, never both.
struct IdentityRegistry {
    local: AgentIdentity,
    remote: HashMap<Uuid, AgentIdentity>,
}

pub struct CommunicationBridge {
    factory: Arc<dyn BusClientFactory>,
    state: RwLock<BridgeState>,
    identities: Arc<Mutex<IdentityRegistry>>,
    identity_hub: broadcast::Sender<IdentityEvent>,
    sinks: Arc<Mutex<HashMap<Uuid, ResponseSink>>>,
    next_owner: AtomicU64,
}

impl CommunicationBridge {
    pub fn new(config: GatewayConfig, factory: Arc<dyn BusClientFactory>) -> Arc<Self> {
        let client = factory.create(config.identity.clone(), &config.bus);
        let (identity_hub, _) = broadcast::channel(IDENTITY_HUB_CAPACITY);
        Arc::new(Self {
            factory,
            identities: Arc::new(Mutex::new(IdentityRegistry {
                local: config.identity.clone(),
                remote: HashMap::new(),
            })),
            state: RwLock::new(BridgeState {
                config,
                client,
                pump: None,
            }),
            identity_hub,
            sinks: Arc::new(Mutex::new(HashMap::new())),
            next_owner: AtomicU64::new(0),
        })
    }

    /// Starts the bus client when a connection URL is configured; without
    /// one the bus stays down until a `configure` supplies it.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut state = self.state.write().await;
        if state.config.bus.connection_url.is_none() {
            info!("bus autostart suppressed: no connection url configured");
            return Ok(());
        }
        state.client.start().await?;
        state.pump = Some(self.spawn_identity_pump(Arc::clone(&state.client)));
        Ok(())
    }

    /// Applies a partial configuration: stop, merge, restart. A changed
    /// identity tears the client down and creates a new one; otherwise
    /// the existing client restarts with the new transport parameters.
    pub async fn configure(&self, update: ConfigureUpdate) -> Result<(), BridgeError> {
        let mut state = self.state.write().await;

        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.client.stop().await;

        let old_identity = state.config.identity.clone();
        let identity_changed = state.config.apply(update)?;

        if identity_changed {
            {
                // Registry update and hub publication are one atomic
                // step; see subscribe_lifecycle.
                let mut identities = self.identities.lock();
                identities.local = state.config.identity.clone();
                let _ = self.identity_hub.send(IdentityEvent::Leave(old_identity));
                let _ = self
                    .identity_hub
                    .send(IdentityEvent::Join(state.config.identity.clone()));
            }
            state.client = self
                .factory
                .create(state.config.identity.clone(), &state.config.bus);
            if state.config.bus.connection_url.is_some() {
                state.client.start().await?;
            }
        } else if state.config.bus.connection_url.is_some() {
            state.client.restart(state.config.bus.clone()).await?;
        }

        if state.config.bus.connection_url.is_some() {
            state.pump = Some(self.spawn_identity_pump(Arc::clone(&state.client)));
        }
        info!(identity_changed, "bus reconfigured");
        Ok(())
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.client.stop().await;
    }

    // ------------------------------------------------------------------
    // channel pattern
    // ------------------------------------------------------------------

    pub async fn publish_channel(
        &self,
        id: &str,
        payload: Option<&Any>,
    ) -> Result<(), BridgeError> {
        validate_name("Channel id", id)?;
        let state = self.state.read().await;
        self.check_online(&state)?;
        let bus_payload = to_bus(payload, Some(state.config.identity.id));
        state.client.publish_channel(id, bus_payload).await?;
        Ok(())
    }

    pub async fn observe_channel(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, BridgeError> {
        validate_name("Channel id", id)?;
        let state = self.state.read().await;
        self.check_online(&state)?;
        Ok(state.client.observe_channel(id).await?)
    }

    // ------------------------------------------------------------------
    // call pattern
    // ------------------------------------------------------------------

    pub async fn publish_call(
        &self,
        operation: &str,
        payload: Option<&Any>,
    ) -> Result<mpsc::UnboundedReceiver<ReturnEvent>, BridgeError> {
        validate_name("Operation", operation)?;
        let state = self.state.read().await;
        self.check_online(&state)?;
        let bus_payload = to_bus(payload, Some(state.config.identity.id));
        Ok(state.client.publish_call(operation, bus_payload).await?)
    }

    pub async fn observe_call(
        &self,
        operation: &str,
    ) -> Result<mpsc::UnboundedReceiver<ObservedCall>, BridgeError> {
        validate_name("Operation", operation)?;
        let state = self.state.read().await;
        self.check_online(&state)?;
        let mut calls = state.client.observe_call(operation).await?;

        let owner = self.next_owner.fetch_add(1, Ordering::Relaxed) + 1;
        let sinks = Arc::clone(&self.sinks);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(call) = calls.recv().await {
                let correlation = Uuid::new_v4();
                sinks.lock().insert(
                    correlation,
                    ResponseSink {
                        bus_correlation: call.correlation,
                        owner,
                    },
                );
                let observed = ObservedCall {
                    operation: call.operation,
                    correlation,
                    payload: call.payload,
                };
                if tx.send(observed).is_err() {
                    break;
                }
            }
            // Subscription over (bus stopped or observer cancelled):
            // everything this observer owned is released.
            sinks.lock().retain(|_, sink| sink.owner != owner);
        });
        Ok(rx)
    }

    /// Sends one return for an observed call. An unknown correlation is
    /// silently discarded; that is the expected late-response path.
    pub async fn publish_return(
        &self,
        correlation: Uuid,
        body: ReturnBody,
    ) -> Result<ReturnOutcome, BridgeError> {
        let bus_correlation = match self.sinks.lock().get(&correlation) {
            None => return Ok(ReturnOutcome::Discarded),
            Some(sink) => sink.bus_correlation,
        };
        let state = self.state.read().await;
        self.check_online(&state)?;
        state.client.publish_return(bus_correlation, body).await?;
        Ok(ReturnOutcome::Delivered)
    }

    /// Releases the response sink of a correlation. Idempotent.
    pub fn publish_complete(&self, correlation: Uuid) {
        self.sinks.lock().remove(&correlation);
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.lock().len()
    }

    // ------------------------------------------------------------------
    // identity
    // ------------------------------------------------------------------

    /// Atomic view for a lifecycle subscription. The registry lock is
    /// held across the hub subscribe and both reads, and every mutation
    /// publishes its events under the same lock, so a concurrent
    /// identity change lands either in the snapshot or on the receiver,
    /// never as a duplicate.
    pub fn subscribe_lifecycle(
        &self,
    ) -> (
        AgentIdentity,
        Vec<AgentIdentity>,
        broadcast::Receiver<IdentityEvent>,
    ) {
        let identities = self.identities.lock();
        let receiver = self.identity_hub.subscribe();
        let local = identities.local.clone();
        let snapshot = identities.remote.values().cloned().collect();
        (local, snapshot, receiver)
    }

    pub fn local_identity(&self) -> AgentIdentity {
        self.identities.lock().local.clone()
    }

    pub async fn is_online(&self) -> bool {
        self.state.read().await.client.is_online()
    }

    pub async fn config(&self) -> GatewayConfig {
        self.state.read().await.config.clone()
    }

    pub async fn current_client(&self) -> Arc<dyn BusClient> {
        Arc::clone(&self.state.read().await.client)
    }

    fn check_online(&self, state: &BridgeState) -> Result<(), BridgeError> {
        if state.config.fail_fast_if_offline && !state.client.is_online() {
            return Err(BridgeError::Offline);
        }
        Ok(())
    }

    /// Forwards the client's identity events into the bridge-level hub so
    /// lifecycle streams survive reconfiguration. On (re)start the fresh
    /// snapshot is diffed against the persistent registry. Hub sends stay
    /// under the registry lock (see subscribe_lifecycle).
    fn spawn_identity_pump(&self, client: Arc<dyn BusClient>) -> JoinHandle<()> {
        let identities = Arc::clone(&self.identities);
        let hub = self.identity_hub.clone();
        let local_id = client.identity().id;

        tokio::spawn(async move {
            let (snapshot, mut events) = client.observe_identity();
            {
                let mut registry = identities.lock();
                let fresh: HashMap<Uuid, AgentIdentity> = snapshot
                    .into_iter()
                    .filter(|identity| identity.id != local_id)
                    .map(|identity| (identity.id, identity))
                    .collect();
                let gone: Vec<AgentIdentity> = registry
                    .remote
                    .values()
                    .filter(|identity| !fresh.contains_key(&identity.id))
                    .cloned()
                    .collect();
                for identity in gone {
                    registry.remote.remove(&identity.id);
                    let _ = hub.send(IdentityEvent::Leave(identity));
                }
                for (id, identity) in fresh {
                    match registry.remote.get(&id) {
                        Some(existing) if *existing == identity => {}
                        Some(existing) => {
                            let _ = hub.send(IdentityEvent::Leave(existing.clone()));
                            registry.remote.insert(id, identity.clone());
                            let _ = hub.send(IdentityEvent::Join(identity));
                        }
                        None => {
                            registry.remote.insert(id, identity.clone());
                            let _ = hub.send(IdentityEvent::Join(identity));
                        }
                    }
                }
            }

            while let Some(event) = events.recv().await {
                match event {
                    IdentityEvent::Join(identity) if identity.id != local_id => {
                        let mut registry = identities.lock();
                        match registry.remote.get(&identity.id) {
                            Some(existing) if *existing == identity => {}
                            Some(existing) => {
                                // Same id, new name: a leave/join pair.
                                let old = existing.clone();
                                registry.remote.insert(identity.id, identity.clone());
                                let _ = hub.send(IdentityEvent::Leave(old));
                                let _ = hub.send(IdentityEvent::Join(identity));
                            }
                            None => {
                                registry.remote.insert(identity.id, identity.clone());
                                let _ = hub.send(IdentityEvent::Join(identity));
                            }
                        }
                    }
                    IdentityEvent::Leave(identity) if identity.id != local_id => {
                        let mut registry = identities.lock();
                        if registry.remote.remove(&identity.id).is_some() {
                            let _ = hub.send(IdentityEvent::Leave(identity));
                        }
                    }
                    _ => {}
                }
            }
            warn!("identity subscription ended");
        })
    }
}

#[async_trait]
impl BusClientProvider for CommunicationBridge {
    async fn bus_client(&self) -> Arc<dyn BusClient> {
        self.current_client().await
    }
}
