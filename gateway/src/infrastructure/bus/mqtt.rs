// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! MQTT implementation of the bus client.
//!
//! Presence uses retained identity messages plus a Last Will that clears
//! them, so join/leave and the initial snapshot fall out of the broker's
//! retained-message semantics. Per-publisher-per-topic ordering of MQTT
//! carries the FIFO guarantee of the call-return pattern, and the broker
//! echoing our own publishes provides self-delivery.
//!
//! Publishes issued while the connection is down sit in the client's
//! request queue and go out on reconnect; the fail-fast gate lives above
//! this layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, Event, LastWill, MqttOptions, Packet, QoS, TlsConfiguration, Transport,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::events::{
    CallFrame, ChannelEvent, IdentityEvent, InboundCall, ReturnBody, ReturnEvent, ReturnFrame,
};
use crate::domain::identity::AgentIdentity;
use crate::domain::payload::BusPayload;
use crate::infrastructure::config::BusOptions;

use super::topic::{self, TopicKind};
use super::{BusClient, BusClientFactory, BusError};

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(30);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

pub struct MqttBusFactory;

impl BusClientFactory for MqttBusFactory {
    fn create(&self, identity: AgentIdentity, options: &BusOptions) -> Arc<dyn BusClient> {
        Arc::new(MqttBus::new(identity, options.clone()))
    }
}

struct Inner {
    options: BusOptions,
    client: Option<AsyncClient>,
    pump: Option<JoinHandle<()>>,
}

/// Shared between the client surface and the event-loop pump.
#[derive(Default)]
struct SubscriptionTable {
    channels: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChannelEvent>>>>,
    calls: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<InboundCall>>>>,
    returns: Mutex<HashMap<Uuid, Vec<mpsc::UnboundedSender<ReturnEvent>>>>,
    identity_subs: Mutex<Vec<mpsc::UnboundedSender<IdentityEvent>>>,
    known: Mutex<HashMap<Uuid, AgentIdentity>>,
}

impl SubscriptionTable {
    /// Dropping every sender ends the subscription receivers, which is
    /// the clean-end signal for the streams above.
    fn clear(&self) {
        self.channels.lock().clear();
        self.calls.lock().clear();
        self.returns.lock().clear();
        self.identity_subs.lock().clear();
        self.known.lock().clear();
    }
}

pub struct MqttBus {
    identity: AgentIdentity,
    inner: Mutex<Inner>,
    subs: Arc<SubscriptionTable>,
    online: Arc<watch::Sender<bool>>,
}

impl MqttBus {
    pub fn new(identity: AgentIdentity, options: BusOptions) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            identity,
            inner: Mutex::new(Inner {
                options,
                client: None,
                pump: None,
            }),
            subs: Arc::new(SubscriptionTable::default()),
            online: Arc::new(online),
        }
    }

    fn client(&self) -> Result<(AsyncClient, String), BusError> {
        let inner = self.inner.lock();
        match &inner.client {
            Some(client) => Ok((client.clone(), inner.options.namespace.clone())),
            None => Err(BusError::Offline),
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
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
        let (client, eventloop, namespace) = {
            let mut inner = self.inner.lock();
            if inner.client.is_some() {
                return Ok(());
            }
            let mqtt_options = build_mqtt_options(&self.identity, &inner.options)?;
            let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);
            inner.client = Some(client.clone());
            (client, eventloop, inner.options.namespace.clone())
        };

        let pump = tokio::spawn(run_event_loop(
            eventloop,
            client,
            self.identity.clone(),
            namespace,
            Arc::clone(&self.subs),
            Arc::clone(&self.online),
        ));
        self.inner.lock().pump = Some(pump);
        Ok(())
    }

    async fn stop(&self) {
        let (client, pump, namespace) = {
            let mut inner = self.inner.lock();
            (
                inner.client.take(),
                inner.pump.take(),
                inner.options.namespace.clone(),
            )
        };
        if let Some(client) = client {
            // Retract presence before dropping the connection; the Last
            // Will only covers ungraceful loss.
            let _ = client
                .publish(
                    topic::identity(&namespace, self.identity.id),
                    QoS::AtLeastOnce,
                    true,
                    Vec::new(),
                )
                .await;
            let _ = client.disconnect().await;
        }
        if let Some(pump) = pump {
            pump.abort();
        }
        self.online.send_replace(false);
        self.subs.clear();
        info!(agent = %self.identity.id, "bus client stopped");
    }

    async fn restart(&self, options: BusOptions) -> Result<(), BusError> {
        self.stop().await;
        self.inner.lock().options = options;
        self.start().await
    }

    async fn publish_channel(&self, id: &str, payload: BusPayload) -> Result<(), BusError> {
        let (client, namespace) = self.client()?;
        let frame = serde_json::to_vec(&payload).expect("bus payloads serialize infallibly");
        client
            .publish(topic::channel(&namespace, id), QoS::AtLeastOnce, false, frame)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    async fn observe_channel(
        &self,
        id: &str,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .channels
            .lock()
            .entry(id.to_string())
            .or_default()
            .push(tx);
        if let Ok((client, namespace)) = self.client() {
            client
                .subscribe(topic::channel(&namespace, id), QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;
        }
        Ok(rx)
    }

    async fn publish_call(
        &self,
        operation: &str,
        payload: BusPayload,
    ) -> Result<mpsc::UnboundedReceiver<ReturnEvent>, BusError> {
        let (client, namespace) = self.client()?;
        let correlation = Uuid::new_v4();

        let (tx, rx) = mpsc::unbounded_channel();
        self.subs.returns.lock().insert(correlation, vec![tx]);
        client
            .subscribe(topic::call_return(&namespace, correlation), QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let frame = CallFrame {
            operation: operation.to_string(),
            correlation,
            payload,
        };
        client
            .publish(
                topic::call(&namespace, operation),
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(&frame).expect("call frames serialize infallibly"),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;
        Ok(rx)
    }

    async fn observe_call(
        &self,
        operation: &str,
    ) -> Result<mpsc::UnboundedReceiver<InboundCall>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subs
            .calls
            .lock()
            .entry(operation.to_string())
            .or_default()
            .push(tx);
        if let Ok((client, namespace)) = self.client() {
            client
                .subscribe(topic::call(&namespace, operation), QoS::AtLeastOnce)
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;
        }
        Ok(rx)
    }

    async fn publish_return(&self, correlation: Uuid, body: ReturnBody) -> Result<(), BusError> {
        let (client, namespace) = self.client()?;
        let frame = ReturnFrame {
            correlation,
            source_id: Some(self.identity.id),
            body,
        };
        client
            .publish(
                topic::call_return(&namespace, correlation),
                QoS::AtLeastOnce,
                false,
                serde_json::to_vec(&frame).expect("return frames serialize infallibly"),
            )
            .await
            .map_err(|e| BusError::Transport(e.to_string()))
    }

    fn observe_identity(&self) -> (Vec<AgentIdentity>, mpsc::UnboundedReceiver<IdentityEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let known = self.subs.known.lock();
        let snapshot = known.values().cloned().collect();
        self.subs.identity_subs.lock().push(tx);
        (snapshot, rx)
    }

    fn identity_snapshot(&self) -> Vec<AgentIdentity> {
        self.subs.known.lock().values().cloned().collect()
    }
}

async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    identity: AgentIdentity,
    namespace: String,
    subs: Arc<SubscriptionTable>,
    online: Arc<watch::Sender<bool>>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(agent = %identity.id, "bus connection established");
                online.send_replace(true);
                resubscribe(&client, &namespace, &subs).await;
                let presence =
                    serde_json::to_vec(&identity).expect("identities serialize infallibly");
                let _ = client
                    .publish(
                        topic::identity(&namespace, identity.id),
                        QoS::AtLeastOnce,
                        true,
                        presence,
                    )
                    .await;
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let stale_returns = dispatch(&namespace, &subs, &publish.topic, &publish.payload);
                for correlation in stale_returns {
                    let _ = client
                        .unsubscribe(topic::call_return(&namespace, correlation))
                        .await;
                }
            }
            Ok(_) => {}
            Err(e) => {
                if *online.borrow() {
                    warn!(agent = %identity.id, error = %e, "bus connection lost");
                }
                online.send_replace(false);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
            }
        }
    }
}

/// Re-issues every live subscription after (re)connecting; the broker
/// does not carry them across MQTT sessions.
async fn resubscribe(client: &AsyncClient, namespace: &str, subs: &SubscriptionTable) {
    let _ = client
        .subscribe(topic::identity_wildcard(namespace), QoS::AtLeastOnce)
        .await;
    let channels: Vec<String> = subs.channels.lock().keys().cloned().collect();
    for id in channels {
        let _ = client
            .subscribe(topic::channel(namespace, &id), QoS::AtLeastOnce)
            .await;
    }
    let calls: Vec<String> = subs.calls.lock().keys().cloned().collect();
    for operation in calls {
        let _ = client
            .subscribe(topic::call(namespace, &operation), QoS::AtLeastOnce)
            .await;
    }
    let returns: Vec<Uuid> = subs.returns.lock().keys().copied().collect();
    for correlation in returns {
        let _ = client
            .subscribe(topic::call_return(namespace, correlation), QoS::AtLeastOnce)
            .await;
    }
}

/// Routes one inbound publish to the matching subscription senders.
/// Returns correlations whose last return observer is gone, so the pump
/// can unsubscribe their topics.
fn dispatch(
    namespace: &str,
    subs: &SubscriptionTable,
    topic_name: &str,
    payload: &[u8],
) -> Vec<Uuid> {
    let mut stale = Vec::new();
    match topic::parse(namespace, topic_name) {
        Some(TopicKind::Channel(id)) => {
            let event: BusPayload = match serde_json::from_slice(payload) {
                Ok(p) => p,
                Err(e) => {
                    debug!(topic = topic_name, error = %e, "discarding undecodable channel event");
                    return stale;
                }
            };
            let mut channels = subs.channels.lock();
            if let Some(senders) = channels.get_mut(id) {
                let event = ChannelEvent {
                    id: id.to_string(),
                    payload: event,
                };
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                if senders.is_empty() {
                    channels.remove(id);
                }
            }
        }
        Some(TopicKind::Call(operation)) => {
            let frame: CallFrame = match serde_json::from_slice(payload) {
                Ok(f) => f,
                Err(e) => {
                    debug!(topic = topic_name, error = %e, "discarding undecodable call frame");
                    return stale;
                }
            };
            let mut calls = subs.calls.lock();
            if let Some(senders) = calls.get_mut(operation) {
                let call = InboundCall {
                    operation: operation.to_string(),
                    correlation: frame.correlation,
                    payload: frame.payload,
                };
                senders.retain(|tx| tx.send(call.clone()).is_ok());
                if senders.is_empty() {
                    calls.remove(operation);
                }
            }
        }
        Some(TopicKind::Return(correlation)) => {
            let frame: ReturnFrame = match serde_json::from_slice(payload) {
                Ok(f) => f,
                Err(e) => {
                    debug!(topic = topic_name, error = %e, "discarding undecodable return frame");
                    return stale;
                }
            };
            let mut returns = subs.returns.lock();
            if let Some(senders) = returns.get_mut(&correlation) {
                let event = ReturnEvent {
                    source_id: frame.source_id,
                    body: frame.body,
                };
                senders.retain(|tx| tx.send(event.clone()).is_ok());
                if senders.is_empty() {
                    returns.remove(&correlation);
                    stale.push(correlation);
                }
            }
        }
        Some(TopicKind::Identity(agent)) => {
            if payload.is_empty() {
                let removed = subs.known.lock().remove(&agent);
                if let Some(identity) = removed {
                    let mut identity_subs = subs.identity_subs.lock();
                    identity_subs.retain(|tx| tx.send(IdentityEvent::Leave(identity.clone())).is_ok());
                }
            } else {
                let identity: AgentIdentity = match serde_json::from_slice(payload) {
                    Ok(i) => i,
                    Err(e) => {
                        debug!(topic = topic_name, error = %e, "discarding undecodable identity");
                        return stale;
                    }
                };
                subs.known.lock().insert(agent, identity.clone());
                let mut identity_subs = subs.identity_subs.lock();
                identity_subs.retain(|tx| tx.send(IdentityEvent::Join(identity.clone())).is_ok());
            }
        }
        None => {}
    }
    stale
}

/// Splits a connection URL into its transport parameters.
fn build_mqtt_options(
    identity: &AgentIdentity,
    options: &BusOptions,
) -> Result<MqttOptions, BusError> {
    let url = options
        .connection_url
        .as_deref()
        .ok_or(BusError::NotConfigured)?;
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| BusError::InvalidUrl(url.to_string()))?;

    let client_id = format!("tnc-agent-{}", identity.id);
    let mut mqtt_options = match scheme {
        "mqtt" | "tcp" => {
            let (host, port) = split_host_port(rest, 1883)?;
            MqttOptions::new(client_id, host, port)
        }
        "mqtts" | "ssl" => {
            let (host, port) = split_host_port(rest, 8883)?;
            let mut opts = MqttOptions::new(client_id, host, port);
            opts.set_transport(Transport::Tls(tls_configuration(options)?));
            opts
        }
        "ws" => {
            let (_, port) = split_host_port(rest, 80)?;
            let mut opts = MqttOptions::new(client_id, url, port);
            opts.set_transport(Transport::Ws);
            opts
        }
        "wss" => {
            let (_, port) = split_host_port(rest, 443)?;
            let mut opts = MqttOptions::new(client_id, url, port);
            opts.set_transport(Transport::Wss(tls_configuration(options)?));
            opts
        }
        _ => return Err(BusError::InvalidUrl(url.to_string())),
    };

    mqtt_options.set_keep_alive(KEEP_ALIVE);
    if let (Some(username), Some(password)) = (&options.username, &options.password) {
        mqtt_options.set_credentials(username.clone(), password.clone());
    }
    mqtt_options.set_last_will(LastWill::new(
        topic::identity(&options.namespace, identity.id),
        Vec::new(),
        QoS::AtLeastOnce,
        true,
    ));
    Ok(mqtt_options)
}

fn split_host_port(rest: &str, default_port: u16) -> Result<(String, u16), BusError> {
    // Strip any path component (websocket URLs carry one).
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return Err(BusError::InvalidUrl(rest.to_string()));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .map_err(|_| BusError::InvalidUrl(rest.to_string()))?;
            Ok((host.to_string(), port))
        }
        None => Ok((authority.to_string(), default_port)),
    }
}

/// rustls client configuration for mqtts/wss, honoring the client
/// certificate material and the server verification toggle.
fn tls_configuration(options: &BusOptions) -> Result<TlsConfiguration, BusError> {
    let client_auth = match (&options.tls_cert, &options.tls_key) {
        (Some(cert), Some(key)) => Some((load_pem(cert)?, load_pem(key)?)),
        _ => None,
    };

    let builder = rustls::ClientConfig::builder();
    let config = if options.verify_server_cert {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs()
            .map_err(|e| BusError::Tls(e.to_string()))?;
        for cert in native {
            let _ = roots.add(cert);
        }
        let builder = builder.with_root_certificates(roots);
        match client_auth {
            Some((cert_pem, key_pem)) => builder
                .with_client_auth_cert(parse_certs(&cert_pem)?, parse_key(&key_pem)?)
                .map_err(|e| BusError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    } else {
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification));
        match client_auth {
            Some((cert_pem, key_pem)) => builder
                .with_client_auth_cert(parse_certs(&cert_pem)?, parse_key(&key_pem)?)
                .map_err(|e| BusError::Tls(e.to_string()))?,
            None => builder.with_no_client_auth(),
        }
    };

    Ok(TlsConfiguration::Rustls(Arc::new(config)))
}

/// Accepts inline PEM or a path to a PEM file.
fn load_pem(value: &str) -> Result<Vec<u8>, BusError> {
    if value.contains("-----BEGIN") {
        Ok(value.as_bytes().to_vec())
    } else {
        std::fs::read(value).map_err(|e| BusError::Tls(format!("{value}: {e}")))
    }
}

fn parse_certs(
    pem: &[u8],
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, BusError> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| BusError::Tls(e.to_string()))
}

fn parse_key(pem: &[u8]) -> Result<rustls::pki_types::PrivateKeyDer<'static>, BusError> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| BusError::Tls(e.to_string()))?
        .ok_or_else(|| BusError::Tls("no private key in PEM material".into()))
}

/// Verifier used when server certificate verification is switched off.
#[derive(Debug)]
struct NoVerification;

impl rustls::client::danger::ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentIdentity {
        AgentIdentity::new(Uuid::new_v4(), "test")
    }

    #[test]
    fn plain_mqtt_url() {
        let mut options = BusOptions::default();
        options.connection_url = Some("mqtt://broker.local:1883".into());
        let mqtt = build_mqtt_options(&agent(), &options).unwrap();
        assert_eq!(mqtt.broker_address(), ("broker.local".to_string(), 1883));
    }

    #[test]
    fn default_port_is_filled_in() {
        let mut options = BusOptions::default();
        options.connection_url = Some("mqtt://broker.local".into());
        let mqtt = build_mqtt_options(&agent(), &options).unwrap();
        assert_eq!(mqtt.broker_address().1, 1883);
    }

    #[test]
    fn missing_url_is_not_configured() {
        let options = BusOptions::default();
        assert!(matches!(
            build_mqtt_options(&agent(), &options),
            Err(BusError::NotConfigured)
        ));
    }

    #[test]
    fn unknown_scheme_is_invalid() {
        let mut options = BusOptions::default();
        options.connection_url = Some("amqp://broker:5672".into());
        assert!(matches!(
            build_mqtt_options(&agent(), &options),
            Err(BusError::InvalidUrl(_))
        ));
    }

    #[test]
    fn host_port_split_handles_paths() {
        assert_eq!(
            split_host_port("broker:9001/mqtt", 80).unwrap(),
            ("broker".to_string(), 9001)
        );
        assert_eq!(
            split_host_port("broker/mqtt", 80).unwrap(),
            ("broker".to_string(), 80)
        );
    }
}
