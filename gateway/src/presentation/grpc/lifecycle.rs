// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! LifecycleService implementation over the agent tracker.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::application::lifecycle::LifecycleTracker;
use crate::domain::identity::AgentSelector;

use super::lifecycle_v1::lifecycle_service_server::{LifecycleService, LifecycleServiceServer};
use super::lifecycle_v1::{
    agent_selector, AgentIdentity, AgentLifecycleEvent, AgentSelector as ProtoSelector,
    LifecycleState,
};

const STREAM_BUFFER: usize = 32;

pub struct LifecycleGrpc {
    tracker: LifecycleTracker,
}

impl LifecycleGrpc {
    pub fn new(tracker: LifecycleTracker) -> Self {
        Self { tracker }
    }

    pub fn into_server(self) -> LifecycleServiceServer<Self> {
        LifecycleServiceServer::new(self)
    }
}

fn domain_selector(selector: ProtoSelector) -> Result<AgentSelector, Status> {
    let parsed = match selector.selector {
        None => Ok(AgentSelector::All),
        Some(agent_selector::Selector::IdentityId(id)) => AgentSelector::by_id(&id),
        Some(agent_selector::Selector::IdentityName(name)) => AgentSelector::by_name(&name),
    };
    parsed.map_err(|e| Status::invalid_argument(e.to_string()))
}

#[tonic::async_trait]
impl LifecycleService for LifecycleGrpc {
    type TrackAgentsStream = ReceiverStream<Result<AgentLifecycleEvent, Status>>;

    async fn track_agents(
        &self,
        request: Request<ProtoSelector>,
    ) -> Result<Response<Self::TrackAgentsStream>, Status> {
        // Selector (and any regex) is resolved before the first event.
        let selector = domain_selector(request.into_inner())?;
        let mut events = self.tracker.track(selector);

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(event) => {
                            let state = if event.joined {
                                LifecycleState::Join
                            } else {
                                LifecycleState::Leave
                            };
                            let outbound = AgentLifecycleEvent {
                                identity: Some(AgentIdentity {
                                    id: event.identity.id.to_string(),
                                    name: event.identity.name,
                                    role: event.identity.role,
                                    local: event.local,
                                }),
                                state: state as i32,
                            };
                            if tx.send(Ok(outbound)).await.is_err() {
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
}
