// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Gateway server: wires the four services and serves them on one port.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use crate::application::bridge::CommunicationBridge;
use crate::application::consensus::ConsensusGateway;
use crate::application::lifecycle::LifecycleTracker;
use crate::application::routing::RoutingEngine;
use crate::infrastructure::bus::BusClientFactory;
use crate::infrastructure::config::GatewayConfig;

use super::communication::CommunicationGrpc;
use super::consensus::ConsensusGrpc;
use super::lifecycle::LifecycleGrpc;
use super::routing::RoutingGrpc;

pub struct GatewayServer {
    pub engine: Arc<RoutingEngine>,
    pub bridge: Arc<CommunicationBridge>,
    pub consensus: Arc<ConsensusGateway>,
    grpc_port: u16,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig, factory: Arc<dyn BusClientFactory>) -> Self {
        let grpc_port = config.grpc_port;
        let db_folder = config.consensus_db_folder.clone();
        let engine = RoutingEngine::new();
        let bridge = CommunicationBridge::new(config, factory);
        let consensus = ConsensusGateway::new(Arc::clone(&bridge), db_folder);
        Self {
            engine,
            bridge,
            consensus,
            grpc_port,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.grpc_port))
    }

    /// Starts the bus (when configured) and serves the four services
    /// until the shutdown future resolves; then stops every connected
    /// consensus node and the bus client.
    pub async fn serve(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.bridge.start().await?;

        let addr = self.local_addr();
        info!(%addr, "gateway listening");

        Server::builder()
            .add_service(RoutingGrpc::new(Arc::clone(&self.engine)).into_server())
            .add_service(CommunicationGrpc::new(Arc::clone(&self.bridge)).into_server())
            .add_service(
                LifecycleGrpc::new(LifecycleTracker::new(Arc::clone(&self.bridge))).into_server(),
            )
            .add_service(ConsensusGrpc::new(Arc::clone(&self.consensus)).into_server())
            .serve_with_shutdown(addr, shutdown)
            .await?;

        info!("gateway shutting down");
        self.consensus.shutdown().await;
        self.bridge.shutdown().await;
        Ok(())
    }
}
