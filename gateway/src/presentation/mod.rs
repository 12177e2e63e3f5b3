// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

pub mod grpc;

pub use grpc::server::GatewayServer;
