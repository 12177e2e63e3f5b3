// Copyright (c) 2026 FlowPro
// SPDX-License-Identifier: AGPL-3.0

//! Raft node controller.
//!
//! Each controller owns one cluster member: a single actor task that holds
//! the log, the state machine and the replication state, fed by a command
//! channel and by two transport subscriptions (the cluster broadcast scope
//! and the node's direct scope). Proposals resolve when the proposing node
//! applies its own committed entry, so no result frames travel back.
//!
//! Membership is replicated through the log itself: the latest `Config`
//! entry is the authoritative member set. A node joins by broadcasting
//! `Join` until the leader appends a config including it, and leaves by
//! asking the leader for a config without it.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RaftError;
use crate::messages::{LogCommand, LogEntry, RaftFrame};
use crate::state_machine::{KvInput, KvState, KvStateMachine};
use crate::storage::{NodeStore, PersistentState};
use crate::transport::{cluster_scope, node_scope, RaftTransport};

/// Construction parameters of one node.
#[derive(Debug, Clone)]
pub struct RaftOptions {
    pub id: Uuid,
    pub cluster: String,
    pub should_create_cluster: bool,
    pub db_folder: PathBuf,
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub connect_timeout: Duration,
    pub proposal_queue_limit: usize,
}

impl RaftOptions {
    pub fn new(
        id: Uuid,
        cluster: impl Into<String>,
        should_create_cluster: bool,
        db_folder: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id,
            cluster: cluster.into(),
            should_create_cluster,
            db_folder: db_folder.into(),
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(1200),
            election_timeout_max: Duration::from_millis(2400),
            connect_timeout: Duration::from_secs(30),
            proposal_queue_limit: 1000,
        }
    }
}

enum Command {
    Propose {
        input: KvInput,
        reply: oneshot::Sender<Result<KvState, RaftError>>,
    },
    Configuration {
        reply: oneshot::Sender<Vec<Uuid>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    Leave {
        reply: oneshot::Sender<Result<(), RaftError>>,
    },
}

/// Handle on one cluster member.
///
/// The controller survives stop/connect cycles; the underlying actor task
/// is created per connection.
pub struct RaftController {
    options: RaftOptions,
    transport: Arc<dyn RaftTransport>,
    store: NodeStore,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    state_events: broadcast::Sender<KvState>,
    config_events: broadcast::Sender<Vec<Uuid>>,
    alive: Arc<watch::Sender<bool>>,
}

impl RaftController {
    pub fn new(options: RaftOptions, transport: Arc<dyn RaftTransport>) -> Self {
        let store = NodeStore::new(&options.db_folder, options.id);
        let (state_events, _) = broadcast::channel(256);
        let (config_events, _) = broadcast::channel(64);
        let (alive, _) = watch::channel(false);
        Self {
            options,
            transport,
            store,
            commands: Mutex::new(None),
            state_events,
            config_events,
            alive: Arc::new(alive),
        }
    }

    /// Tracks whether the node task is running. Observers use this to end
    /// their streams when the node leaves the cluster network.
    pub fn alive_watch(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    pub fn id(&self) -> Uuid {
        self.options.id
    }

    pub fn cluster(&self) -> &str {
        &self.options.cluster
    }

    fn command_sender(&self) -> Result<mpsc::UnboundedSender<Command>, RaftError> {
        self.commands
            .lock()
            .as_ref()
            .filter(|tx| !tx.is_closed())
            .cloned()
            .ok_or(RaftError::OperationNotSupportedInCurrentConnectionState)
    }

    /// Joins (or bootstraps) the cluster. Resolves once this node has a
    /// leader and is part of the member set.
    pub async fn connect(&self) -> Result<(), RaftError> {
        if self.command_sender().is_ok() {
            return Err(RaftError::OperationNotSupportedInCurrentConnectionState);
        }

        let direct_rx = self
            .transport
            .subscribe(&node_scope(&self.options.cluster, self.options.id))
            .await?;
        let cluster_rx = self
            .transport
            .subscribe(&cluster_scope(&self.options.cluster))
            .await?;

        let persisted = self.store.load()?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();

        let actor = Actor::new(
            &self.options,
            Arc::clone(&self.transport),
            self.store.clone(),
            persisted,
            connected_tx,
            self.state_events.clone(),
            self.config_events.clone(),
            Arc::clone(&self.alive),
        );
        self.alive.send_replace(true);
        tokio::spawn(actor.run(cmd_rx, direct_rx, cluster_rx));
        *self.commands.lock() = Some(cmd_tx.clone());

        match tokio::time::timeout(self.options.connect_timeout, connected_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                *self.commands.lock() = None;
                Err(RaftError::ConnectFailed(
                    "node task ended before joining the cluster".into(),
                ))
            }
            Err(_) => {
                let (reply, _) = oneshot::channel();
                let _ = cmd_tx.send(Command::Stop { reply });
                *self.commands.lock() = None;
                Err(RaftError::ConnectFailed("joining the cluster timed out".into()))
            }
        }
    }

    /// Proposes one input and resolves with the state right after it was
    /// applied on this node.
    pub async fn propose(&self, input: KvInput) -> Result<KvState, RaftError> {
        let tx = self.command_sender()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Propose { input, reply })
            .map_err(|_| RaftError::DisconnectedBeforeOperationComplete)?;
        rx.await
            .map_err(|_| RaftError::DisconnectedBeforeOperationComplete)?
    }

    /// Commits a no-op and returns the resulting state; the result is at
    /// least as recent as the call.
    pub async fn state(&self) -> Result<KvState, RaftError> {
        self.propose(KvInput::NoOp).await
    }

    pub fn observe_state(&self) -> Result<broadcast::Receiver<KvState>, RaftError> {
        self.command_sender()?;
        Ok(self.state_events.subscribe())
    }

    pub async fn cluster_configuration(&self) -> Result<Vec<Uuid>, RaftError> {
        let tx = self.command_sender()?;
        let (reply, rx) = oneshot::channel();
        tx.send(Command::Configuration { reply })
            .map_err(|_| RaftError::DisconnectedBeforeOperationComplete)?;
        rx.await
            .map_err(|_| RaftError::DisconnectedBeforeOperationComplete)
    }

    pub fn observe_cluster_configuration(
        &self,
    ) -> Result<broadcast::Receiver<Vec<Uuid>>, RaftError> {
        self.command_sender()?;
        Ok(self.config_events.subscribe())
    }

    /// Leaves the cluster network but keeps membership and the persisted
    /// log, so the node can reconnect later under the same id.
    pub async fn stop(&self) -> Result<(), RaftError> {
        let tx = self
            .commands
            .lock()
            .take()
            .ok_or(RaftError::OperationNotSupportedInCurrentConnectionState)?;
        let (reply, rx) = oneshot::channel();
        if tx.send(Command::Stop { reply }).is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }

    /// Removes this node from the cluster membership and deletes its
    /// persisted state. Best-effort: if the membership change cannot be
    /// confirmed in time the node still shuts down and the store is
    /// removed.
    pub async fn disconnect(&self) -> Result<(), RaftError> {
        let tx = self
            .commands
            .lock()
            .take()
            .ok_or(RaftError::OperationNotSupportedInCurrentConnectionState)?;
        let (reply, rx) = oneshot::channel();
        if tx.send(Command::Leave { reply }).is_ok() {
            match tokio::time::timeout(Duration::from_secs(10), rx).await {
                Ok(Ok(result)) => result?,
                Ok(Err(_)) => {}
                Err(_) => {
                    warn!(node = %self.options.id, "leave was not confirmed in time");
                    let (stop_reply, _) = oneshot::channel();
                    let _ = tx.send(Command::Stop { reply: stop_reply });
                }
            }
        }
        self.store.delete()?;
        Ok(())
    }
}

enum Role {
    Follower,
    Candidate {
        votes: HashSet<Uuid>,
    },
    Leader {
        next_index: HashMap<Uuid, u64>,
        match_index: HashMap<Uuid, u64>,
    },
}

struct Actor {
    id: Uuid,
    cluster: String,
    transport: Arc<dyn RaftTransport>,
    store: NodeStore,
    should_create: bool,
    heartbeat_interval: Duration,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    proposal_queue_limit: usize,

    term: u64,
    voted_for: Option<Uuid>,
    log: Vec<LogEntry>,

    commit_index: u64,
    applied_index: u64,
    machine: KvStateMachine,
    role: Role,
    leader: Option<Uuid>,

    next_seq: u64,
    pending: HashMap<u64, oneshot::Sender<Result<KvState, RaftError>>>,
    backlog: VecDeque<(u64, KvInput)>,

    election_deadline: Instant,
    announce_at: Option<Instant>,
    shutdown: bool,

    connected_tx: Option<oneshot::Sender<()>>,
    leave_reply: Option<oneshot::Sender<Result<(), RaftError>>>,
    state_events: broadcast::Sender<KvState>,
    config_events: broadcast::Sender<Vec<Uuid>>,
    alive: Arc<watch::Sender<bool>>,
}

impl Actor {
    #[allow(clippy::too_many_arguments)]
    fn new(
        options: &RaftOptions,
        transport: Arc<dyn RaftTransport>,
        store: NodeStore,
        persisted: Option<PersistentState>,
        connected_tx: oneshot::Sender<()>,
        state_events: broadcast::Sender<KvState>,
        config_events: broadcast::Sender<Vec<Uuid>>,
        alive: Arc<watch::Sender<bool>>,
    ) -> Self {
        let (term, voted_for, log) = match persisted {
            Some(state) => (state.term, state.voted_for, state.log),
            None => (0, None, Vec::new()),
        };
        Self {
            id: options.id,
            cluster: options.cluster.clone(),
            transport,
            store,
            should_create: options.should_create_cluster,
            heartbeat_interval: options.heartbeat_interval,
            election_timeout_min: options.election_timeout_min,
            election_timeout_max: options.election_timeout_max,
            proposal_queue_limit: options.proposal_queue_limit,
            term,
            voted_for,
            log,
            commit_index: 0,
            applied_index: 0,
            machine: KvStateMachine::new(),
            role: Role::Follower,
            leader: None,
            next_seq: 0,
            pending: HashMap::new(),
            backlog: VecDeque::new(),
            election_deadline: Instant::now(),
            announce_at: None,
            shutdown: false,
            connected_tx: Some(connected_tx),
            leave_reply: None,
            state_events,
            config_events,
            alive,
        }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut direct_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        mut cluster_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        if self.should_create && self.log.is_empty() && self.term == 0 {
            self.bootstrap().await;
        } else if self.latest_membership().contains(&self.id) {
            // Rejoining with a persisted log: wait for the leader, or win
            // the election ourselves.
            self.reset_election_timer();
        } else {
            self.announce_at = Some(Instant::now());
            self.reset_election_timer();
        }

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.shutdown {
            let announce_deadline = self.announce_at.unwrap_or_else(far_future);
            let is_leader = matches!(self.role, Role::Leader { .. });

            tokio::select! {
                command = cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                frame = direct_rx.recv() => match frame {
                    Some(frame) => self.handle_raw(&frame).await,
                    None => {
                        debug!(node = %self.id, "direct subscription ended; leaving cluster network");
                        break;
                    }
                },
                frame = cluster_rx.recv() => match frame {
                    Some(frame) => self.handle_raw(&frame).await,
                    None => {
                        debug!(node = %self.id, "cluster subscription ended; leaving cluster network");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(self.election_deadline), if !is_leader => {
                    self.on_election_timeout().await;
                }
                _ = tokio::time::sleep_until(announce_deadline), if self.announce_at.is_some() => {
                    self.announce_join().await;
                }
                _ = heartbeat.tick(), if is_leader => {
                    self.send_heartbeats().await;
                }
            }
        }

        // Committed removals are propagated before the task ends so the
        // remaining members learn the new commit index promptly.
        if matches!(self.role, Role::Leader { .. }) {
            self.send_heartbeats().await;
        }
        self.fail_pending();
        self.persist();
        if let Some(reply) = self.leave_reply.take() {
            let _ = reply.send(Ok(()));
        }
        self.alive.send_replace(false);
        info!(node = %self.id, cluster = %self.cluster, "raft node task ended");
    }

    // ------------------------------------------------------------------
    // commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Propose { input, reply } => self.local_propose(input, reply).await,
            Command::Configuration { reply } => {
                let mut members: Vec<Uuid> =
                    self.committed_membership().into_iter().collect();
                members.sort();
                let _ = reply.send(members);
            }
            Command::Stop { reply } => {
                self.shutdown = true;
                let _ = reply.send(());
            }
            Command::Leave { reply } => self.begin_leave(reply).await,
        }
    }

    async fn local_propose(
        &mut self,
        input: KvInput,
        reply: oneshot::Sender<Result<KvState, RaftError>>,
    ) {
        if self.pending.len() >= self.proposal_queue_limit {
            let _ = reply.send(Err(RaftError::TooManyQueuedUpInputProposals));
            return;
        }
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.insert(seq, reply);

        if matches!(self.role, Role::Leader { .. }) {
            self.append_entry(LogCommand::Input {
                proposer: self.id,
                seq,
                input,
            });
            self.advance_commit().await;
            self.send_heartbeats().await;
        } else if let Some(leader) = self.leader {
            self.send_to(
                leader,
                &RaftFrame::Forward {
                    from: self.id,
                    seq,
                    input,
                },
            )
            .await;
        } else {
            self.backlog.push_back((seq, input));
        }
    }

    async fn begin_leave(&mut self, reply: oneshot::Sender<Result<(), RaftError>>) {
        self.leave_reply = Some(reply);
        if matches!(self.role, Role::Leader { .. }) {
            let mut members = self.latest_membership();
            members.remove(&self.id);
            self.append_entry(LogCommand::Config { members });
            self.advance_commit().await;
            self.send_heartbeats().await;
        } else if let Some(leader) = self.leader {
            self.send_to(leader, &RaftFrame::Leave { node: self.id }).await;
        } else {
            // Nobody to tell; shut down and let the caller clean up.
            self.shutdown = true;
        }
    }

    // ------------------------------------------------------------------
    // inbound frames
    // ------------------------------------------------------------------

    async fn handle_raw(&mut self, bytes: &[u8]) {
        let frame = match RaftFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(node = %self.id, error = %e, "discarding undecodable raft frame");
                return;
            }
        };
        match frame {
            RaftFrame::Join { node } => self.handle_join(node).await,
            RaftFrame::Leave { node } => self.handle_leave(node).await,
            RaftFrame::VoteRequest {
                term,
                candidate,
                last_log_index,
                last_log_term,
            } => {
                self.handle_vote_request(term, candidate, last_log_index, last_log_term)
                    .await
            }
            RaftFrame::Vote { term, from, granted } => {
                self.handle_vote(term, from, granted).await
            }
            RaftFrame::Append {
                term,
                leader,
                prev_index,
                prev_term,
                entries,
                commit_index,
            } => {
                self.handle_append(term, leader, prev_index, prev_term, entries, commit_index)
                    .await
            }
            RaftFrame::AppendAck {
                term,
                from,
                success,
                match_index,
            } => self.handle_append_ack(term, from, success, match_index).await,
            RaftFrame::Forward { from, seq, input } => {
                self.handle_forward(from, seq, input).await
            }
        }
    }

    async fn handle_join(&mut self, node: Uuid) {
        if node == self.id || !matches!(self.role, Role::Leader { .. }) {
            return;
        }
        if self.latest_membership().contains(&node) {
            // Rejoining member; the heartbeat loop already covers it.
            return;
        }
        let mut members = self.latest_membership();
        members.insert(node);
        info!(node = %self.id, joined = %node, "admitting member to cluster");
        self.append_entry(LogCommand::Config { members });
        self.advance_commit().await;
        self.send_heartbeats().await;
    }

    async fn handle_leave(&mut self, node: Uuid) {
        if !matches!(self.role, Role::Leader { .. }) {
            return;
        }
        let mut members = self.latest_membership();
        if !members.remove(&node) {
            return;
        }
        info!(node = %self.id, removed = %node, "removing member from cluster");
        self.append_entry(LogCommand::Config { members });
        self.advance_commit().await;
        self.send_heartbeats().await;
    }

    async fn handle_vote_request(
        &mut self,
        term: u64,
        candidate: Uuid,
        last_log_index: u64,
        last_log_term: u64,
    ) {
        if candidate == self.id {
            return;
        }
        if term > self.term {
            self.become_follower(term);
        }
        let up_to_date = (last_log_term, last_log_index)
            >= (self.last_log_term(), self.log.len() as u64);
        let granted = term == self.term
            && up_to_date
            && self.voted_for.map_or(true, |v| v == candidate);
        if granted {
            self.voted_for = Some(candidate);
            self.persist();
            self.reset_election_timer();
        }
        let reply = RaftFrame::Vote {
            term: self.term,
            from: self.id,
            granted,
        };
        self.send_to(candidate, &reply).await;
    }

    async fn handle_vote(&mut self, term: u64, from: Uuid, granted: bool) {
        if term > self.term {
            self.become_follower(term);
            return;
        }
        let majority = self.majority();
        let won = match &mut self.role {
            Role::Candidate { votes } if granted && term == self.term => {
                votes.insert(from);
                votes.len() >= majority
            }
            _ => false,
        };
        if won {
            self.become_leader().await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_append(
        &mut self,
        term: u64,
        leader: Uuid,
        prev_index: u64,
        prev_term: u64,
        entries: Vec<LogEntry>,
        commit_index: u64,
    ) {
        if term < self.term {
            let reply = RaftFrame::AppendAck {
                term: self.term,
                from: self.id,
                success: false,
                match_index: 0,
            };
            self.send_to(leader, &reply).await;
            return;
        }

        if term > self.term {
            self.become_follower(term);
        } else if !matches!(self.role, Role::Follower) {
            self.role = Role::Follower;
        }
        self.leader = Some(leader);
        self.announce_at = None;
        self.reset_election_timer();
        self.flush_backlog().await;

        // Log consistency check against the entry preceding the batch.
        if prev_index > 0 {
            let local_prev_term = self
                .log
                .get(prev_index as usize - 1)
                .map(|e| e.term);
            if local_prev_term != Some(prev_term) {
                let reply = RaftFrame::AppendAck {
                    term: self.term,
                    from: self.id,
                    success: false,
                    match_index: 0,
                };
                self.send_to(leader, &reply).await;
                return;
            }
        }

        let mut changed = false;
        let mut index = prev_index;
        for entry in entries.iter() {
            index += 1;
            let slot = index as usize - 1;
            match self.log.get(slot) {
                Some(existing) if existing.term == entry.term => {}
                Some(_) => {
                    self.log.truncate(slot);
                    self.log.push(entry.clone());
                    changed = true;
                }
                None => {
                    self.log.push(entry.clone());
                    changed = true;
                }
            }
        }
        if changed {
            self.persist();
        }

        let new_commit = commit_index.min(self.log.len() as u64);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed();
        }
        self.maybe_connected();

        let reply = RaftFrame::AppendAck {
            term: self.term,
            from: self.id,
            success: true,
            match_index: prev_index + entries.len() as u64,
        };
        self.send_to(leader, &reply).await;
    }

    async fn handle_append_ack(&mut self, term: u64, from: Uuid, success: bool, acked: u64) {
        if term > self.term {
            self.become_follower(term);
            return;
        }
        let Role::Leader {
            next_index,
            match_index,
        } = &mut self.role
        else {
            return;
        };
        if success {
            let current = match_index.entry(from).or_insert(0);
            if acked > *current {
                *current = acked;
            }
            next_index.insert(from, acked + 1);
            self.advance_commit().await;
        } else {
            let slot = next_index.entry(from).or_insert(1);
            *slot = (*slot).saturating_sub(1).max(1);
        }
    }

    async fn handle_forward(&mut self, from: Uuid, seq: u64, input: KvInput) {
        if matches!(self.role, Role::Leader { .. }) {
            self.append_entry(LogCommand::Input {
                proposer: from,
                seq,
                input,
            });
            self.advance_commit().await;
            self.send_heartbeats().await;
        } else if let Some(leader) = self.leader {
            // Stale forward; pass it along to the leader we know.
            self.send_to(leader, &RaftFrame::Forward { from, seq, input })
                .await;
        }
    }

    // ------------------------------------------------------------------
    // roles and elections
    // ------------------------------------------------------------------

    async fn bootstrap(&mut self) {
        let mut members = BTreeSet::new();
        members.insert(self.id);
        self.term = 1;
        self.log.push(LogEntry {
            term: 1,
            command: LogCommand::Config { members },
        });
        self.role = Role::Leader {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        };
        self.leader = Some(self.id);
        self.commit_index = 1;
        self.apply_committed();
        self.persist();
        self.maybe_connected();
        info!(node = %self.id, cluster = %self.cluster, "bootstrapped cluster");
    }

    fn become_follower(&mut self, term: u64) {
        if term > self.term {
            self.term = term;
            self.voted_for = None;
            self.persist();
        }
        self.role = Role::Follower;
        self.reset_election_timer();
    }

    async fn become_leader(&mut self) {
        let next = self.log.len() as u64 + 1;
        let members = self.latest_membership();
        let next_index = members
            .iter()
            .filter(|m| **m != self.id)
            .map(|m| (*m, next))
            .collect();
        self.role = Role::Leader {
            next_index,
            match_index: HashMap::new(),
        };
        self.leader = Some(self.id);
        info!(node = %self.id, term = self.term, "elected leader");

        // Barrier entry so prior-term entries become committable.
        self.append_entry(LogCommand::Noop);
        self.flush_backlog().await;
        self.advance_commit().await;
        self.send_heartbeats().await;
        self.maybe_connected();
    }

    async fn on_election_timeout(&mut self) {
        let members = self.latest_membership();
        if !members.contains(&self.id) {
            // Still joining; keep announcing instead of electing.
            self.reset_election_timer();
            return;
        }
        self.term += 1;
        self.voted_for = Some(self.id);
        self.persist();
        let mut votes = HashSet::new();
        votes.insert(self.id);
        self.role = Role::Candidate { votes };
        self.leader = None;
        self.reset_election_timer();
        debug!(node = %self.id, term = self.term, "starting election");

        if self.majority() <= 1 {
            self.become_leader().await;
            return;
        }
        let request = RaftFrame::VoteRequest {
            term: self.term,
            candidate: self.id,
            last_log_index: self.log.len() as u64,
            last_log_term: self.last_log_term(),
        };
        self.broadcast(&request).await;
    }

    async fn announce_join(&mut self) {
        self.broadcast(&RaftFrame::Join { node: self.id }).await;
        self.announce_at = Some(Instant::now() + Duration::from_millis(500));
    }

    // ------------------------------------------------------------------
    // log and commit
    // ------------------------------------------------------------------

    fn append_entry(&mut self, command: LogCommand) {
        self.log.push(LogEntry {
            term: self.term,
            command,
        });
        self.persist();
    }

    async fn advance_commit(&mut self) {
        // Quorum over the union of the committed and the latest member
        // set: an addition needs the grown cluster, a removal still
        // counts the leaving member until its removal commits.
        let mut members = self.latest_membership();
        members.extend(self.committed_membership());
        let Role::Leader { match_index, .. } = &self.role else {
            return;
        };
        if members.is_empty() {
            return;
        }
        let mut replicated: Vec<u64> = members
            .iter()
            .map(|m| {
                if *m == self.id {
                    self.log.len() as u64
                } else {
                    match_index.get(m).copied().unwrap_or(0)
                }
            })
            .collect();
        replicated.sort_unstable_by(|a, b| b.cmp(a));
        let majority_match = replicated[members.len() / 2];

        if majority_match > self.commit_index {
            // Only entries of the current term commit by counting.
            let entry_term = self.log[majority_match as usize - 1].term;
            if entry_term == self.term {
                let before = self.committed_membership();
                self.commit_index = majority_match;
                self.apply_committed();
                self.maybe_connected();
                // Push the new commit index out immediately; members the
                // commit just removed get this one last append so they
                // observe their own removal.
                let mut targets = before;
                targets.extend(self.latest_membership());
                self.send_append_to(targets).await;
            }
        }
    }

    fn apply_committed(&mut self) {
        while self.applied_index < self.commit_index {
            self.applied_index += 1;
            let entry = self.log[self.applied_index as usize - 1].clone();
            match entry.command {
                LogCommand::Input {
                    proposer,
                    seq,
                    input,
                } => {
                    let changed = self.machine.apply(&input);
                    if proposer == self.id {
                        if let Some(reply) = self.pending.remove(&seq) {
                            let _ = reply.send(Ok(self.machine.state()));
                        }
                    }
                    if changed {
                        let _ = self.state_events.send(self.machine.state());
                    }
                }
                LogCommand::Config { members } => {
                    let mut ids: Vec<Uuid> = members.iter().copied().collect();
                    ids.sort();
                    let _ = self.config_events.send(ids);
                    if !members.contains(&self.id) {
                        if let Some(reply) = self.leave_reply.take() {
                            let _ = reply.send(Ok(()));
                        }
                        info!(node = %self.id, "removed from cluster membership");
                        self.shutdown = true;
                        return;
                    }
                }
                LogCommand::Noop => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // helpers
    // ------------------------------------------------------------------

    fn latest_membership(&self) -> BTreeSet<Uuid> {
        self.membership_up_to(self.log.len() as u64)
    }

    fn committed_membership(&self) -> BTreeSet<Uuid> {
        self.membership_up_to(self.commit_index)
    }

    fn membership_up_to(&self, index: u64) -> BTreeSet<Uuid> {
        self.log[..index as usize]
            .iter()
            .rev()
            .find_map(|entry| match &entry.command {
                LogCommand::Config { members } => Some(members.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn majority(&self) -> usize {
        self.latest_membership().len() / 2 + 1
    }

    fn last_log_term(&self) -> u64 {
        self.log.last().map_or(0, |e| e.term)
    }

    fn reset_election_timer(&mut self) {
        let jitter = rand::thread_rng().gen_range(
            self.election_timeout_min.as_millis() as u64
                ..=self.election_timeout_max.as_millis() as u64,
        );
        self.election_deadline = Instant::now() + Duration::from_millis(jitter);
    }

    fn maybe_connected(&mut self) {
        if self.connected_tx.is_some()
            && self.leader.is_some()
            && self.latest_membership().contains(&self.id)
        {
            if let Some(tx) = self.connected_tx.take() {
                let _ = tx.send(());
            }
        }
    }

    async fn flush_backlog(&mut self) {
        if self.backlog.is_empty() {
            return;
        }
        let Some(leader) = self.leader else { return };
        let queued: Vec<(u64, KvInput)> = self.backlog.drain(..).collect();
        if leader == self.id {
            for (seq, input) in queued {
                self.append_entry(LogCommand::Input {
                    proposer: self.id,
                    seq,
                    input,
                });
            }
            self.advance_commit().await;
            self.send_heartbeats().await;
        } else {
            for (seq, input) in queued {
                self.send_to(
                    leader,
                    &RaftFrame::Forward {
                        from: self.id,
                        seq,
                        input,
                    },
                )
                .await;
            }
        }
    }

    async fn send_heartbeats(&mut self) {
        // Members leaving the cluster stay heartbeat targets until the
        // removal entry is committed, so they observe their own removal.
        let mut targets = self.latest_membership();
        targets.extend(self.committed_membership());
        self.send_append_to(targets).await;
    }

    async fn send_append_to(&mut self, members: BTreeSet<Uuid>) {
        let Role::Leader { next_index, .. } = &mut self.role else {
            return;
        };
        let log_len = self.log.len() as u64;
        let mut outbound = Vec::new();
        for member in members.iter().filter(|m| **m != self.id) {
            let next = *next_index.entry(*member).or_insert(log_len + 1);
            let prev_index = next.saturating_sub(1).min(log_len);
            let prev_term = if prev_index == 0 {
                0
            } else {
                self.log[prev_index as usize - 1].term
            };
            let entries = self.log[prev_index as usize..].to_vec();
            outbound.push((
                *member,
                RaftFrame::Append {
                    term: self.term,
                    leader: self.id,
                    prev_index,
                    prev_term,
                    entries,
                    commit_index: self.commit_index,
                },
            ));
        }
        for (member, frame) in outbound {
            self.send_to(member, &frame).await;
        }
    }

    async fn send_to(&self, node: Uuid, frame: &RaftFrame) {
        let scope = node_scope(&self.cluster, node);
        if let Err(e) = self.transport.publish(&scope, frame.encode()).await {
            debug!(node = %self.id, to = %node, error = %e, "raft frame publish failed");
        }
    }

    async fn broadcast(&self, frame: &RaftFrame) {
        let scope = cluster_scope(&self.cluster);
        if let Err(e) = self.transport.publish(&scope, frame.encode()).await {
            debug!(node = %self.id, error = %e, "raft broadcast failed");
        }
    }

    fn fail_pending(&mut self) {
        for (_, reply) in self.pending.drain() {
            let _ = reply.send(Err(RaftError::DisconnectedBeforeOperationComplete));
        }
        self.backlog.clear();
    }

    fn persist(&self) {
        let state = PersistentState {
            term: self.term,
            voted_for: self.voted_for,
            log: self.log.clone(),
            saved_at: chrono::Utc::now(),
        };
        if let Err(e) = self.store.save(&state) {
            warn!(node = %self.id, error = %e, "persisting raft state failed");
        }
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}
