// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! ConsensusService implementation over the node registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use uuid::Uuid;

use tnc_consensus::KvState;

use crate::application::consensus::{
    encode_value, ConsensusError, ConsensusGateway, ProposalOperation,
};

use super::consensus_v1::consensus_service_server::{ConsensusService, ConsensusServiceServer};
use super::consensus_v1::{
    ClusterConfiguration, ConsensusAck, CreateOptions, InputOperation, NodeRef, ProposalInput,
    StateSnapshot,
};

const STREAM_BUFFER: usize = 32;

pub struct ConsensusGrpc {
    gateway: Arc<ConsensusGateway>,
}

impl ConsensusGrpc {
    pub fn new(gateway: Arc<ConsensusGateway>) -> Self {
        Self { gateway }
    }

    pub fn into_server(self) -> ConsensusServiceServer<Self> {
        ConsensusServiceServer::new(self)
    }
}

fn consensus_status(error: ConsensusError) -> Status {
    match &error {
        ConsensusError::UnknownNode => Status::invalid_argument(error.to_string()),
        ConsensusError::WrongState(_)
        | ConsensusError::Disconnected
        | ConsensusError::NotSupported
        | ConsensusError::BusOffline
        | ConsensusError::ConnectFailed(_) => Status::unavailable(error.to_string()),
        ConsensusError::ProposalQueueFull => Status::out_of_range(error.to_string()),
        ConsensusError::InvalidValue | ConsensusError::Internal(_) => {
            Status::internal(error.to_string())
        }
    }
}

fn parse_node(raw: &str) -> Result<Uuid, Status> {
    raw.parse()
        .map_err(|_| consensus_status(ConsensusError::UnknownNode))
}

fn snapshot(state: KvState) -> StateSnapshot {
    let key_value_pairs: HashMap<String, prost_types::Value> = state
        .iter()
        .map(|(key, value)| (key.clone(), encode_value(value)))
        .collect();
    StateSnapshot { key_value_pairs }
}

fn configuration(ids: Vec<Uuid>) -> ClusterConfiguration {
    ClusterConfiguration {
        ids: ids.into_iter().map(|id| id.to_string()).collect(),
    }
}

#[tonic::async_trait]
impl ConsensusService for ConsensusGrpc {
    type ObserveStateStream = ReceiverStream<Result<StateSnapshot, Status>>;
    type ObserveClusterConfigurationStream =
        ReceiverStream<Result<ClusterConfiguration, Status>>;

    async fn create(
        &self,
        request: Request<CreateOptions>,
    ) -> Result<Response<NodeRef>, Status> {
        let options = request.into_inner();
        let id = self
            .gateway
            .create(options.cluster, options.should_create_cluster);
        Ok(Response::new(NodeRef { id: id.to_string() }))
    }

    async fn connect(&self, request: Request<NodeRef>) -> Result<Response<ConsensusAck>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        self.gateway.connect(id).await.map_err(consensus_status)?;
        Ok(Response::new(ConsensusAck {}))
    }

    async fn disconnect(
        &self,
        request: Request<NodeRef>,
    ) -> Result<Response<ConsensusAck>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        self.gateway.disconnect(id).await.map_err(consensus_status)?;
        Ok(Response::new(ConsensusAck {}))
    }

    async fn stop(&self, request: Request<NodeRef>) -> Result<Response<ConsensusAck>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        self.gateway.stop(id).await.map_err(consensus_status)?;
        Ok(Response::new(ConsensusAck {}))
    }

    async fn propose(
        &self,
        request: Request<ProposalInput>,
    ) -> Result<Response<StateSnapshot>, Status> {
        let input = request.into_inner();
        let id = parse_node(&input.node_id)?;
        let operation = match InputOperation::try_from(input.operation) {
            Ok(InputOperation::Put) => ProposalOperation::Put,
            Ok(InputOperation::Delete) => ProposalOperation::Delete,
            Err(_) => return Err(Status::invalid_argument("Unknown input operation")),
        };
        let state = self
            .gateway
            .propose(id, operation, input.key, input.value)
            .await
            .map_err(consensus_status)?;
        Ok(Response::new(snapshot(state)))
    }

    async fn get_state(
        &self,
        request: Request<NodeRef>,
    ) -> Result<Response<StateSnapshot>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        let state = self.gateway.state(id).await.map_err(consensus_status)?;
        Ok(Response::new(snapshot(state)))
    }

    async fn observe_state(
        &self,
        request: Request<NodeRef>,
    ) -> Result<Response<Self::ObserveStateStream>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        let (mut states, mut alive) =
            self.gateway.observe_state(id).map_err(consensus_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    state = states.recv() => match state {
                        Ok(state) => {
                            if tx.send(Ok(snapshot(state))).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    // Ends the stream when the node leaves Connected.
                    changed = alive.changed() => {
                        if changed.is_err() || !*alive.borrow() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_cluster_configuration(
        &self,
        request: Request<NodeRef>,
    ) -> Result<Response<ClusterConfiguration>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        let ids = self
            .gateway
            .cluster_configuration(id)
            .await
            .map_err(consensus_status)?;
        Ok(Response::new(configuration(ids)))
    }

    async fn observe_cluster_configuration(
        &self,
        request: Request<NodeRef>,
    ) -> Result<Response<Self::ObserveClusterConfigurationStream>, Status> {
        let id = parse_node(&request.into_inner().id)?;
        let (mut configurations, mut alive) = self
            .gateway
            .observe_cluster_configuration(id)
            .map_err(consensus_status)?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    ids = configurations.recv() => match ids {
                        Ok(ids) => {
                            if tx.send(Ok(configuration(ids))).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = alive.changed() => {
                        if changed.is_err() || !*alive.borrow() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
