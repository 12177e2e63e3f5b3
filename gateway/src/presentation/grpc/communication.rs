// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! CommunicationService implementation over the bus bridge.
//!
//! All long-lived streams follow the uniform clean-end rule: when the bus
//! stops or is reconfigured the underlying receivers end and the gRPC
//! streams complete with EOF, never with an error status.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use crate::application::bridge::{BridgeError, CommunicationBridge};
use crate::domain::events::{ReturnBody, ReturnEvent as DomainReturn};
use crate::domain::payload::{from_bus, to_bus};
use crate::infrastructure::config::ConfigureUpdate;

use super::communication_v1::communication_service_server::{
    CommunicationService, CommunicationServiceServer,
};
use super::communication_v1::{
    return_event, CallEvent, CallFilter, ChannelEvent, ChannelFilter, CompleteEvent,
    ConfigureOptions, EventAck, ReturnError, ReturnEvent,
};

const STREAM_BUFFER: usize = 32;

pub struct CommunicationGrpc {
    bridge: Arc<CommunicationBridge>,
}

impl CommunicationGrpc {
    pub fn new(bridge: Arc<CommunicationBridge>) -> Self {
        Self { bridge }
    }

    pub fn into_server(self) -> CommunicationServiceServer<Self> {
        CommunicationServiceServer::new(self)
    }
}

fn bridge_status(error: BridgeError) -> Status {
    match &error {
        BridgeError::InvalidName(_) | BridgeError::Config(_) => {
            Status::invalid_argument(error.to_string())
        }
        BridgeError::Offline | BridgeError::Bus(_) => Status::unavailable(error.to_string()),
    }
}

fn parse_correlation(raw: &str) -> Result<Uuid, Status> {
    raw.parse()
        .map_err(|_| Status::invalid_argument("Correlation id is not a valid uuid"))
}

fn proto_return(domain: DomainReturn) -> Result<ReturnEvent, Status> {
    let result = match domain.body {
        ReturnBody::Data { payload } => {
            let any = from_bus(&payload)
                .map_err(|e| Status::invalid_argument(e.to_string()))?;
            return_event::Result::Data(any)
        }
        ReturnBody::Error { message } => return_event::Result::Error(ReturnError { message }),
    };
    Ok(ReturnEvent {
        // The bus-internal correlation never leaks to the caller.
        correlation_id: String::new(),
        result: Some(result),
        source_id: domain
            .source_id
            .map(|id| id.to_string())
            .unwrap_or_default(),
    })
}

#[tonic::async_trait]
impl CommunicationService for CommunicationGrpc {
    type ObserveChannelStream = ReceiverStream<Result<ChannelEvent, Status>>;
    type PublishCallStream = ReceiverStream<Result<ReturnEvent, Status>>;
    type ObserveCallStream = ReceiverStream<Result<CallEvent, Status>>;

    async fn configure(
        &self,
        request: Request<ConfigureOptions>,
    ) -> Result<Response<EventAck>, Status> {
        let options = request.into_inner();
        let update = ConfigureUpdate {
            connection_url: options.connection_url,
            namespace: options.namespace,
            identity_name: options.identity_name,
            identity_id: options.identity_id,
            username: options.username,
            password: options.password,
            tls_cert: options.tls_cert,
            tls_key: options.tls_key,
            verify_server_cert: options.verify_server_cert,
            not_fail_fast_if_offline: options.not_fail_fast_if_offline,
        };
        self.bridge.configure(update).await.map_err(bridge_status)?;
        Ok(Response::new(EventAck {}))
    }

    async fn publish_channel(
        &self,
        request: Request<ChannelEvent>,
    ) -> Result<Response<EventAck>, Status> {
        let event = request.into_inner();
        self.bridge
            .publish_channel(&event.id, event.payload.as_ref())
            .await
            .map_err(bridge_status)?;
        Ok(Response::new(EventAck {}))
    }

    async fn observe_channel(
        &self,
        request: Request<ChannelFilter>,
    ) -> Result<Response<Self::ObserveChannelStream>, Status> {
        let filter = request.into_inner();
        let mut events = self
            .bridge
            .observe_channel(&filter.id)
            .await
            .map_err(bridge_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            let outbound = match from_bus(&event.payload) {
                                Ok(any) => Ok(ChannelEvent {
                                    id: event.id,
                                    payload: Some(any),
                                    source_id: event
                                        .payload
                                        .source_id
                                        .map(|id| id.to_string())
                                        .unwrap_or_default(),
                                }),
                                Err(e) => Err(Status::invalid_argument(e.to_string())),
                            };
                            let failed = outbound.is_err();
                            if tx.send(outbound).await.is_err() || failed {
                                break;
                            }
                        }
                        // Bus stopped or reconfigured: clean EOF.
                        None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn publish_call(
        &self,
        request: Request<CallEvent>,
    ) -> Result<Response<Self::PublishCallStream>, Status> {
        let event = request.into_inner();
        let mut returns = self
            .bridge
            .publish_call(&event.operation, event.payload.as_ref())
            .await
            .map_err(bridge_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = returns.recv() => match event {
                        Some(event) => {
                            let outbound = proto_return(event);
                            let failed = outbound.is_err();
                            if tx.send(outbound).await.is_err() || failed {
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

    async fn observe_call(
        &self,
        request: Request<CallFilter>,
    ) -> Result<Response<Self::ObserveCallStream>, Status> {
        let filter = request.into_inner();
        let mut calls = self
            .bridge
            .observe_call(&filter.operation)
            .await
            .map_err(bridge_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    call = calls.recv() => match call {
                        Some(call) => {
                            let outbound = match from_bus(&call.payload) {
                                Ok(any) => Ok(CallEvent {
                                    operation: call.operation,
                                    payload: Some(any),
                                    correlation_id: call.correlation.to_string(),
                                    source_id: call
                                        .payload
                                        .source_id
                                        .map(|id| id.to_string())
                                        .unwrap_or_default(),
                                }),
                                Err(e) => Err(Status::invalid_argument(e.to_string())),
                            };
                            let failed = outbound.is_err();
                            if tx.send(outbound).await.is_err() || failed {
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

    async fn publish_return(
        &self,
        request: Request<ReturnEvent>,
    ) -> Result<Response<EventAck>, Status> {
        let event = request.into_inner();
        let correlation = parse_correlation(&event.correlation_id)?;
        let body = match event.result {
            Some(return_event::Result::Data(any)) => ReturnBody::Data {
                payload: to_bus(Some(&any), None),
            },
            Some(return_event::Result::Error(error)) => ReturnBody::Error {
                message: error.message,
            },
            None => ReturnBody::Data {
                payload: to_bus(None, None),
            },
        };
        self.bridge
            .publish_return(correlation, body)
            .await
            .map_err(bridge_status)?;
        Ok(Response::new(EventAck {}))
    }

    async fn publish_complete(
        &self,
        request: Request<CompleteEvent>,
    ) -> Result<Response<EventAck>, Status> {
        let event = request.into_inner();
        let correlation = parse_correlation(&event.correlation_id)?;
        self.bridge.publish_complete(correlation);
        Ok(Response::new(EventAck {}))
    }
}
