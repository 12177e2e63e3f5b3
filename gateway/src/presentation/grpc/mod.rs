// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Generated service stubs and their implementations.

pub mod communication;
pub mod consensus;
pub mod lifecycle;
pub mod routing;
pub mod server;

pub mod routing_v1 {
    tonic::include_proto!("tnc.routing.v1");
}

pub mod communication_v1 {
    tonic::include_proto!("tnc.communication.v1");
}

pub mod lifecycle_v1 {
    tonic::include_proto!("tnc.lifecycle.v1");
}

pub mod consensus_v1 {
    tonic::include_proto!("tnc.consensus.v1");
}
