// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Local routing engine.
//!
//! Multiplexes one-way push and two-way request/response flows between
//! local streaming calls, keyed by route strings. Push and request routes
//! live in independent namespaces. Registrations are owned by handles
//! whose drop is the single cleanup path: when a stream ends for any
//! reason its handle goes away, the tables shrink, and every pending
//! request bound to a departing registration is cancelled.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use prost_types::Any;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::domain::events::{PushMessage, RequestMessage, ResponseMessage};
use crate::domain::route::RoutingPolicy;

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("No registration available")]
    NoRegistration,

    #[error("Additional registration is not allowed on route '{0}' with SINGLE policy")]
    SingleRegistrationRoute(String),

    #[error("Policy {requested} conflicts with policy {existing} established for route '{route}'")]
    PolicyMismatch {
        route: String,
        existing: RoutingPolicy,
        requested: RoutingPolicy,
    },

    #[error("Response event discarded as no correlated registration exists")]
    UnknownResponse,

    #[error("Correlated registration deregistered before response")]
    RegistrationDeregistered,

    #[error("Request cancelled before a response was delivered")]
    Cancelled,
}

struct PushRegistration {
    id: u64,
    tx: mpsc::UnboundedSender<PushMessage>,
}

struct RequestRegistration {
    id: u64,
    tx: mpsc::UnboundedSender<RequestMessage>,
}

struct RequestGroup {
    policy: RoutingPolicy,
    registrations: Vec<RequestRegistration>,
    next_request_id: u32,
    cursor: usize,
}

impl RequestGroup {
    fn new(policy: RoutingPolicy, registration: RequestRegistration) -> Self {
        Self {
            policy,
            registrations: vec![registration],
            next_request_id: 0,
            cursor: 0,
        }
    }

    /// Ids run 1..=u32::MAX and wrap back to 1; 0 is never issued.
    fn allocate_request_id(&mut self) -> u32 {
        self.next_request_id = if self.next_request_id == u32::MAX {
            1
        } else {
            self.next_request_id + 1
        };
        self.next_request_id
    }

    fn select(&mut self) -> usize {
        let len = self.registrations.len();
        match self.policy {
            RoutingPolicy::Single | RoutingPolicy::First => 0,
            RoutingPolicy::Last => len - 1,
            RoutingPolicy::Next => {
                let index = self.cursor % len;
                self.cursor = (index + 1) % len;
                index
            }
            RoutingPolicy::Random => rand::thread_rng().gen_range(0..len),
        }
    }
}

struct PendingRequest {
    registration: u64,
    reply: oneshot::Sender<Result<ResponseMessage, RoutingError>>,
}

#[derive(Default)]
pub struct RoutingEngine {
    push_table: Mutex<HashMap<String, Vec<PushRegistration>>>,
    request_table: Mutex<HashMap<String, RequestGroup>>,
    pending: Mutex<HashMap<(String, u32), PendingRequest>>,
    next_registration_id: AtomicU64,
}

impl RoutingEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(&self) -> u64 {
        self.next_registration_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ------------------------------------------------------------------
    // push routes
    // ------------------------------------------------------------------

    pub fn register_push(self: &Arc<Self>, route: &str) -> PushRegistrationHandle {
        let id = self.next_id();
        let (tx, receiver) = mpsc::unbounded_channel();
        self.push_table
            .lock()
            .entry(route.to_string())
            .or_default()
            .push(PushRegistration { id, tx });
        PushRegistrationHandle {
            engine: Arc::clone(self),
            route: route.to_string(),
            id,
            receiver,
        }
    }

    /// Delivers to every registration of the route in registration order
    /// and reports how many writes happened.
    pub fn push(&self, message: PushMessage) -> u32 {
        let mut table = self.push_table.lock();
        let Some(registrations) = table.get_mut(&message.route) else {
            return 0;
        };
        let mut count = 0;
        registrations.retain(|registration| match registration.tx.send(message.clone()) {
            Ok(()) => {
                count += 1;
                true
            }
            Err(_) => false,
        });
        if registrations.is_empty() {
            table.remove(&message.route);
        }
        count
    }

    fn deregister_push(&self, route: &str, id: u64) {
        let mut table = self.push_table.lock();
        if let Some(registrations) = table.get_mut(route) {
            registrations.retain(|registration| registration.id != id);
            if registrations.is_empty() {
                table.remove(route);
            }
        }
    }

    // ------------------------------------------------------------------
    // request routes
    // ------------------------------------------------------------------

    pub fn register_request(
        self: &Arc<Self>,
        route: &str,
        policy: RoutingPolicy,
    ) -> Result<RequestRegistrationHandle, RoutingError> {
        let id = self.next_id();
        let (tx, receiver) = mpsc::unbounded_channel();
        let registration = RequestRegistration { id, tx };

        let mut table = self.request_table.lock();
        match table.get_mut(route) {
            Some(group) => {
                if group.policy == RoutingPolicy::Single {
                    return Err(RoutingError::SingleRegistrationRoute(route.to_string()));
                }
                if group.policy != policy {
                    return Err(RoutingError::PolicyMismatch {
                        route: route.to_string(),
                        existing: group.policy,
                        requested: policy,
                    });
                }
                group.registrations.push(registration);
            }
            None => {
                table.insert(route.to_string(), RequestGroup::new(policy, registration));
            }
        }
        Ok(RequestRegistrationHandle {
            engine: Arc::clone(self),
            route: route.to_string(),
            id,
            receiver,
        })
    }

    /// Dispatches one request to a registration chosen by the group
    /// policy and resolves with the correlated response.
    pub async fn request(
        self: &Arc<Self>,
        route: &str,
        payload: Option<Any>,
    ) -> Result<ResponseMessage, RoutingError> {
        let (request_id, reply_rx) = {
            let mut table = self.request_table.lock();
            let group = table.get_mut(route).ok_or(RoutingError::NoRegistration)?;
            let request_id = group.allocate_request_id();
            let index = group.select();
            let registration = &group.registrations[index];

            let (reply_tx, reply_rx) = oneshot::channel();
            self.pending.lock().insert(
                (route.to_string(), request_id),
                PendingRequest {
                    registration: registration.id,
                    reply: reply_tx,
                },
            );

            let message = RequestMessage {
                route: route.to_string(),
                request_id,
                payload,
            };
            if registration.tx.send(message).is_err() {
                self.pending.lock().remove(&(route.to_string(), request_id));
                return Err(RoutingError::NoRegistration);
            }
            (request_id, reply_rx)
        };

        // The guard removes the pending entry if this future is dropped
        // (requester cancel or deadline) before a response arrived.
        let mut guard = PendingGuard {
            engine: self.as_ref(),
            route,
            request_id,
            armed: true,
        };
        let outcome = reply_rx.await;
        guard.armed = false;
        match outcome {
            Ok(result) => result,
            Err(_) => Err(RoutingError::Cancelled),
        }
    }

    /// Delivers a response to the requester correlated by
    /// `(route, request_id)`. The correlation id is stripped before
    /// delivery. Returns the number of writes: 0 when the requester is
    /// already gone.
    pub fn respond(&self, mut message: ResponseMessage) -> Result<u32, RoutingError> {
        let key = (message.route.clone(), message.request_id);
        let Some(entry) = self.pending.lock().remove(&key) else {
            return Err(RoutingError::UnknownResponse);
        };
        message.request_id = 0;
        match entry.reply.send(Ok(message)) {
            Ok(()) => Ok(1),
            Err(_) => Ok(0),
        }
    }

    fn deregister_request(&self, route: &str, id: u64) {
        {
            let mut table = self.request_table.lock();
            if let Some(group) = table.get_mut(route) {
                group.registrations.retain(|registration| registration.id != id);
                let empty = group.registrations.is_empty();
                if !empty {
                    // Re-bound the round-robin cursor after removal.
                    group.cursor %= group.registrations.len();
                } else {
                    table.remove(route);
                }
            }
        }

        // Cascade: every pending request bound to the departing
        // registration fails now instead of hanging forever.
        let mut pending = self.pending.lock();
        let cancelled: Vec<(String, u32)> = pending
            .iter()
            .filter(|((r, _), p)| r == route && p.registration == id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in cancelled {
            if let Some(entry) = pending.remove(&key) {
                let _ = entry.reply.send(Err(RoutingError::RegistrationDeregistered));
            }
        }
    }

    // ------------------------------------------------------------------
    // introspection (tests and diagnostics)
    // ------------------------------------------------------------------

    pub fn has_push_route(&self, route: &str) -> bool {
        self.push_table.lock().contains_key(route)
    }

    pub fn has_request_route(&self, route: &str) -> bool {
        self.request_table.lock().contains_key(route)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

struct PendingGuard<'a> {
    engine: &'a RoutingEngine,
    route: &'a str,
    request_id: u32,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.engine
                .pending
                .lock()
                .remove(&(self.route.to_string(), self.request_id));
        }
    }
}

/// Live push registration; dropping it removes the table entry.
pub struct PushRegistrationHandle {
    engine: Arc<RoutingEngine>,
    route: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<PushMessage>,
}

impl PushRegistrationHandle {
    pub async fn recv(&mut self) -> Option<PushMessage> {
        self.receiver.recv().await
    }
}

impl Drop for PushRegistrationHandle {
    fn drop(&mut self) {
        self.engine.deregister_push(&self.route, self.id);
    }
}

/// Live request registration; dropping it cancels every pending request
/// dispatched to it.
pub struct RequestRegistrationHandle {
    engine: Arc<RoutingEngine>,
    route: String,
    id: u64,
    receiver: mpsc::UnboundedReceiver<RequestMessage>,
}

impl RequestRegistrationHandle {
    pub async fn recv(&mut self) -> Option<RequestMessage> {
        self.receiver.recv().await
    }
}

impl Drop for RequestRegistrationHandle {
    fn drop(&mut self) {
        self.engine.deregister_request(&self.route, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(route: &str) -> PushMessage {
        PushMessage {
            route: route.to_string(),
            payload: None,
        }
    }

    #[tokio::test]
    async fn push_fans_out_in_registration_order() {
        let engine = RoutingEngine::new();
        let mut first = engine.register_push("r");
        let mut second = engine.register_push("r");

        assert_eq!(engine.push(message("r")), 2);
        assert!(first.recv().await.is_some());
        assert!(second.recv().await.is_some());

        drop(first);
        assert_eq!(engine.push(message("r")), 1);

        drop(second);
        assert_eq!(engine.push(message("r")), 0);
        assert!(!engine.has_push_route("r"));
    }

    #[tokio::test]
    async fn push_on_unknown_route_counts_zero() {
        let engine = RoutingEngine::new();
        assert_eq!(engine.push(message("missing")), 0);
        assert!(!engine.has_push_route("missing"));
    }

    #[test]
    fn single_policy_rejects_any_second_registration() {
        let engine = RoutingEngine::new();
        let _first = engine
            .register_request("r", RoutingPolicy::Single)
            .unwrap();

        assert!(matches!(
            engine.register_request("r", RoutingPolicy::Single),
            Err(RoutingError::SingleRegistrationRoute(_))
        ));
        assert!(matches!(
            engine.register_request("r", RoutingPolicy::Next),
            Err(RoutingError::SingleRegistrationRoute(_))
        ));
    }

    #[test]
    fn conflicting_policies_are_rejected() {
        let engine = RoutingEngine::new();
        let _first = engine.register_request("r", RoutingPolicy::First).unwrap();

        assert!(matches!(
            engine.register_request("r", RoutingPolicy::Last),
            Err(RoutingError::PolicyMismatch { .. })
        ));
        // matching policy is fine
        let _second = engine.register_request("r", RoutingPolicy::First).unwrap();
    }

    #[test]
    fn group_is_destroyed_when_it_empties() {
        let engine = RoutingEngine::new();
        let first = engine.register_request("r", RoutingPolicy::Next).unwrap();
        let second = engine.register_request("r", RoutingPolicy::Next).unwrap();

        drop(first);
        assert!(engine.has_request_route("r"));
        drop(second);
        assert!(!engine.has_request_route("r"));

        // a fresh group may pick a different policy
        let _third = engine.register_request("r", RoutingPolicy::Single).unwrap();
    }

    #[tokio::test]
    async fn request_without_registration_is_unavailable() {
        let engine = RoutingEngine::new();
        assert!(matches!(
            engine.request("r", None).await,
            Err(RoutingError::NoRegistration)
        ));
    }

    #[tokio::test]
    async fn next_policy_round_robins_and_ids_increment() {
        let engine = RoutingEngine::new();
        let mut first = engine.register_request("r", RoutingPolicy::Next).unwrap();
        let mut second = engine.register_request("r", RoutingPolicy::Next).unwrap();

        // Responder loops echo the request id back through respond().
        let responder_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(request) = first.recv().await {
                responder_engine
                    .respond(ResponseMessage {
                        route: request.route,
                        request_id: request.request_id,
                        payload: None,
                    })
                    .unwrap();
            }
        });
        let responder_engine = Arc::clone(&engine);
        tokio::spawn(async move {
            while let Some(request) = second.recv().await {
                responder_engine
                    .respond(ResponseMessage {
                        route: request.route,
                        request_id: request.request_id,
                        payload: None,
                    })
                    .unwrap();
            }
        });

        for _ in 0..3 {
            let response = engine.request("r", None).await.unwrap();
            // the correlation id is stripped before delivery
            assert_eq!(response.request_id, 0);
        }
        assert_eq!(engine.pending_count(), 0);
    }

    #[test]
    fn request_ids_wrap_to_one_and_never_zero() {
        let registration = RequestRegistration {
            id: 1,
            tx: mpsc::unbounded_channel().0,
        };
        let mut group = RequestGroup::new(RoutingPolicy::First, registration);

        assert_eq!(group.allocate_request_id(), 1);
        assert_eq!(group.allocate_request_id(), 2);

        group.next_request_id = u32::MAX - 1;
        assert_eq!(group.allocate_request_id(), u32::MAX);
        assert_eq!(group.allocate_request_id(), 1);
    }

    #[test]
    fn next_cursor_is_rebounded_on_removal() {
        let engine = RoutingEngine::new();
        let _a = engine.register_request("r", RoutingPolicy::Next).unwrap();
        let b = engine.register_request("r", RoutingPolicy::Next).unwrap();

        // advance the cursor to the second slot
        engine.request_table.lock().get_mut("r").unwrap().select();

        drop(b);
        let mut table = engine.request_table.lock();
        let group = table.get_mut("r").unwrap();
        assert!(group.cursor < group.registrations.len());
        assert_eq!(group.select(), 0);
    }

    #[tokio::test]
    async fn respond_for_unknown_correlation_is_a_caller_bug() {
        let engine = RoutingEngine::new();
        let result = engine.respond(ResponseMessage {
            route: "r".into(),
            request_id: 7,
            payload: None,
        });
        assert!(matches!(result, Err(RoutingError::UnknownResponse)));
    }

    #[tokio::test]
    async fn deregistration_cancels_pending_requests() {
        let engine = RoutingEngine::new();
        let mut registration = engine.register_request("r", RoutingPolicy::Single).unwrap();

        let request_engine = Arc::clone(&engine);
        let request =
            tokio::spawn(async move { request_engine.request("r", None).await });

        // wait until the request is dispatched, then drop the responder
        let dispatched = registration.recv().await.unwrap();
        assert_eq!(dispatched.request_id, 1);
        drop(registration);

        let result = request.await.unwrap();
        assert!(matches!(
            result,
            Err(RoutingError::RegistrationDeregistered)
        ));
        assert_eq!(engine.pending_count(), 0);

        // a late respond for that correlation is a caller bug
        let late = engine.respond(ResponseMessage {
            route: "r".into(),
            request_id: 1,
            payload: None,
        });
        assert!(matches!(late, Err(RoutingError::UnknownResponse)));
    }

    #[tokio::test]
    async fn requester_cancellation_removes_the_pending_entry() {
        let engine = RoutingEngine::new();
        let mut registration = engine.register_request("r", RoutingPolicy::Single).unwrap();

        let request_engine = Arc::clone(&engine);
        let request =
            tokio::spawn(async move { request_engine.request("r", None).await });

        let dispatched = registration.recv().await.unwrap();
        request.abort();
        let _ = request.await;

        assert_eq!(engine.pending_count(), 0);
        let late = engine.respond(ResponseMessage {
            route: "r".into(),
            request_id: dispatched.request_id,
            payload: None,
        });
        assert!(matches!(late, Err(RoutingError::UnknownResponse)));
    }
}
