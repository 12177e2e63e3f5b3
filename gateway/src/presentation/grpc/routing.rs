// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! RoutingService implementation over the local routing engine.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::application::routing::{RoutingEngine, RoutingError};
use crate::domain::events::{PushMessage, ResponseMessage};
use crate::domain::route::RoutingPolicy;

use super::routing_v1::routing_service_server::{RoutingService, RoutingServiceServer};
use super::routing_v1::{
    PushEvent, PushRoute, RequestEvent, RequestRoute, ResponseEvent, RouteEventAck,
    RoutingPolicy as ProtoPolicy,
};

const STREAM_BUFFER: usize = 32;

pub struct RoutingGrpc {
    engine: Arc<RoutingEngine>,
}

impl RoutingGrpc {
    pub fn new(engine: Arc<RoutingEngine>) -> Self {
        Self { engine }
    }

    pub fn into_server(self) -> RoutingServiceServer<Self> {
        RoutingServiceServer::new(self)
    }
}

fn routing_status(error: RoutingError) -> Status {
    match &error {
        RoutingError::NoRegistration => Status::unavailable(error.to_string()),
        RoutingError::SingleRegistrationRoute(_)
        | RoutingError::PolicyMismatch { .. }
        | RoutingError::UnknownResponse => Status::invalid_argument(error.to_string()),
        RoutingError::RegistrationDeregistered | RoutingError::Cancelled => {
            Status::cancelled(error.to_string())
        }
    }
}

fn domain_policy(raw: i32) -> Result<RoutingPolicy, Status> {
    let policy = ProtoPolicy::try_from(raw)
        .map_err(|_| Status::invalid_argument("Unknown routing policy"))?;
    Ok(match policy {
        ProtoPolicy::Single => RoutingPolicy::Single,
        ProtoPolicy::First => RoutingPolicy::First,
        ProtoPolicy::Last => RoutingPolicy::Last,
        ProtoPolicy::Next => RoutingPolicy::Next,
        ProtoPolicy::Random => RoutingPolicy::Random,
    })
}

#[tonic::async_trait]
impl RoutingService for RoutingGrpc {
    type RegisterPushRouteStream = ReceiverStream<Result<PushEvent, Status>>;
    type RegisterRequestRouteStream = ReceiverStream<Result<RequestEvent, Status>>;

    async fn register_push_route(
        &self,
        request: Request<PushRoute>,
    ) -> Result<Response<Self::RegisterPushRouteStream>, Status> {
        let route = request.into_inner().route;
        let mut handle = self.engine.register_push(&route);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = handle.recv() => match message {
                        Some(message) => {
                            let event = PushEvent {
                                route: message.route,
                                payload: message.payload,
                            };
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    // Client cancel or deadline; the handle drop below is
                    // the cleanup action that removes the registration.
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn register_request_route(
        &self,
        request: Request<RequestRoute>,
    ) -> Result<Response<Self::RegisterRequestRouteStream>, Status> {
        let request = request.into_inner();
        let policy = domain_policy(request.policy)?;
        let mut handle = self
            .engine
            .register_request(&request.route, policy)
            .map_err(routing_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = handle.recv() => match message {
                        Some(message) => {
                            let event = RequestEvent {
                                route: message.route,
                                request_id: message.request_id,
                                payload: message.payload,
                            };
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn push(
        &self,
        request: Request<PushEvent>,
    ) -> Result<Response<RouteEventAck>, Status> {
        let event = request.into_inner();
        let routing_count = self.engine.push(PushMessage {
            route: event.route,
            payload: event.payload,
        });
        Ok(Response::new(RouteEventAck { routing_count }))
    }

    async fn request(
        &self,
        request: Request<RequestEvent>,
    ) -> Result<Response<ResponseEvent>, Status> {
        let event = request.into_inner();
        let response = self
            .engine
            .request(&event.route, event.payload)
            .await
            .map_err(routing_status)?;
        Ok(Response::new(ResponseEvent {
            route: response.route,
            request_id: response.request_id,
            payload: response.payload,
        }))
    }

    async fn respond(
        &self,
        request: Request<ResponseEvent>,
    ) -> Result<Response<RouteEventAck>, Status> {
        let event = request.into_inner();
        let routing_count = self
            .engine
            .respond(ResponseMessage {
                route: event.route,
                request_id: event.request_id,
                payload: event.payload,
            })
            .map_err(routing_status)?;
        Ok(Response::new(RouteEventAck { routing_count }))
    }
}
