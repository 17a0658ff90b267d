// Copyright 2024-2025 Golem Cloud
//
// Licensed under the Golem Source License v1.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://license.golem.cloud/LICENSE
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::fsm::StateMachine;
use crate::raft::message::*;
use crate::raft::storage::{LogStore, SnapshotMeta, SnapshotStore, StableStore, StorageError};
use crate::raft::transport::{self, IncomingRpc};
use crate::raft::RaftError;
use rand::Rng;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub heartbeat_interval: Duration,
    pub election_timeout_min: Duration,
    pub election_timeout_max: Duration,
    pub rpc_timeout: Duration,
    /// Number of applied entries kept in the log before a snapshot compacts
    /// them. Zero disables automatic snapshots.
    pub snapshot_threshold: u64,
    pub max_entries_per_append: usize,
    pub snapshot_chunk_size: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(50),
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            rpc_timeout: Duration::from_secs(1),
            snapshot_threshold: 4096,
            max_entries_per_append: 64,
            snapshot_chunk_size: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct RaftState {
    pub id: NodeId,
    pub term: Term,
    pub role: RaftRole,
    pub leader: Option<Peer>,
    pub last_log_index: LogIndex,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub snapshot_index: LogIndex,
    pub membership: Vec<Peer>,
}

enum NodeMsg {
    Rpc(IncomingRpc),
    Propose {
        payload: EntryPayload,
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    ForceSnapshot {
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    },
    GetState {
        reply: oneshot::Sender<RaftState>,
    },
    VoteResult {
        term: Term,
        peer: NodeId,
        response: RequestVoteResponse,
    },
    AppendResult {
        term: Term,
        peer: NodeId,
        prev_log_index: LogIndex,
        sent: u64,
        result: Option<AppendEntriesResponse>,
    },
    SnapshotSendResult {
        term: Term,
        peer: NodeId,
        last_included_index: LogIndex,
        result: Option<Term>,
    },
}

/// Handle to a running raft node; cloneable and cheap to share.
#[derive(Clone)]
pub struct RaftHandle {
    msg_tx: mpsc::Sender<NodeMsg>,
    shutdown: CancellationToken,
}

impl RaftHandle {
    pub async fn client_write(&self, command: Vec<u8>) -> Result<LogIndex, RaftError> {
        self.propose(EntryPayload::Command(command)).await
    }

    pub async fn change_membership(&self, membership: Vec<Peer>) -> Result<LogIndex, RaftError> {
        self.propose(EntryPayload::Membership(membership)).await
    }

    async fn propose(&self, payload: EntryPayload) -> Result<LogIndex, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.msg_tx
            .send(NodeMsg::Propose {
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn force_snapshot(&self) -> Result<LogIndex, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.msg_tx
            .send(NodeMsg::ForceSnapshot { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn state(&self) -> Result<RaftState, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.msg_tx
            .send(NodeMsg::GetState { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

pub struct RaftNodeParams {
    pub id: NodeId,
    pub advertised_addr: String,
    pub data_dir: PathBuf,
    pub listener: TcpListener,
    /// When set, a brand-new node seeds itself as the sole cluster member.
    pub bootstrap: bool,
    pub config: RaftConfig,
    pub fsm: Arc<dyn StateMachine>,
}

/// Starts the raft core task plus the transport accept loop and returns the
/// shared handle.
pub fn start(params: RaftNodeParams) -> Result<(RaftHandle, JoinHandle<()>), RaftError> {
    let shutdown = CancellationToken::new();
    let (msg_tx, msg_rx) = mpsc::channel(1024);

    let (rpc_tx, mut rpc_rx) = mpsc::channel::<IncomingRpc>(1024);

    // Funnel transport RPCs into the core mailbox
    {
        let msg_tx = msg_tx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    rpc = rpc_rx.recv() => match rpc {
                        Some(rpc) => {
                            if msg_tx.send(NodeMsg::Rpc(rpc)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });
    }

    let core = RaftCore::open(&params, msg_tx.clone(), shutdown.clone())?;
    transport::spawn_server(params.listener, rpc_tx, shutdown.clone());
    let core_task = tokio::spawn(core.run(msg_rx));

    Ok((RaftHandle { msg_tx, shutdown }, core_task))
}

struct PendingSnapshot {
    writer: Option<crate::raft::storage::SnapshotWriter>,
    next_offset: u64,
    last_included_index: LogIndex,
    last_included_term: Term,
    membership: Vec<Peer>,
}

struct RaftCore {
    id: NodeId,
    advertised_addr: String,
    config: RaftConfig,
    fsm: Arc<dyn StateMachine>,
    log: LogStore,
    stable: StableStore,
    snapshots: SnapshotStore,
    snapshot_last_index: LogIndex,
    snapshot_last_term: Term,
    membership: Vec<Peer>,
    membership_index: LogIndex,
    role: RaftRole,
    leader_id: Option<NodeId>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    last_applied_term: Term,
    votes: HashSet<NodeId>,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    inflight_append: HashSet<NodeId>,
    inflight_snapshot: HashSet<NodeId>,
    last_contact: HashMap<NodeId, Instant>,
    waiters: BTreeMap<LogIndex, Vec<oneshot::Sender<Result<LogIndex, RaftError>>>>,
    pending_snapshot: Option<PendingSnapshot>,
    election_deadline: Instant,
    msg_tx: mpsc::Sender<NodeMsg>,
    shutdown: CancellationToken,
}

impl RaftCore {
    fn open(
        params: &RaftNodeParams,
        msg_tx: mpsc::Sender<NodeMsg>,
        shutdown: CancellationToken,
    ) -> Result<Self, RaftError> {
        std::fs::create_dir_all(&params.data_dir)
            .map_err(|err| RaftError::Internal(err.to_string()))?;

        let stable = StableStore::open(params.data_dir.join("hard_state.json"))
            .map_err(storage_error)?;
        let snapshots =
            SnapshotStore::open(params.data_dir.join("snapshots")).map_err(storage_error)?;

        let snapshot_meta = snapshots.latest().map_err(storage_error)?;
        let (snapshot_last_index, snapshot_last_term, mut membership) = match &snapshot_meta {
            Some(meta) => (
                meta.last_included_index,
                meta.last_included_term,
                meta.membership.clone(),
            ),
            None => (0, 0, Vec::new()),
        };

        let log = LogStore::open(
            params.data_dir.join("raft.log"),
            snapshot_last_index + 1,
        )
        .map_err(storage_error)?;

        // Rebuild the state machine from the latest snapshot; the log suffix
        // is re-applied once a leader advances the commit index.
        if let Some(meta) = &snapshot_meta {
            let mut data = snapshots.open_data().map_err(storage_error)?;
            params
                .fsm
                .restore(meta.last_included_index, &mut data)
                .map_err(|err| RaftError::SnapshotFailed(err.to_string()))?;
        }

        let mut membership_index = snapshot_last_index;
        for entry in log.entries_from(log.first_index(), usize::MAX) {
            if let EntryPayload::Membership(peers) = &entry.payload {
                membership = peers.clone();
                membership_index = entry.index;
            }
        }

        let mut core = Self {
            id: params.id,
            advertised_addr: params.advertised_addr.clone(),
            config: params.config.clone(),
            fsm: params.fsm.clone(),
            log,
            stable,
            snapshots,
            snapshot_last_index,
            snapshot_last_term,
            membership,
            membership_index,
            role: RaftRole::Follower,
            leader_id: None,
            commit_index: snapshot_last_index,
            last_applied: snapshot_last_index,
            last_applied_term: snapshot_last_term,
            votes: HashSet::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            inflight_append: HashSet::new(),
            inflight_snapshot: HashSet::new(),
            last_contact: HashMap::new(),
            waiters: BTreeMap::new(),
            pending_snapshot: None,
            election_deadline: Instant::now(),
            msg_tx,
            shutdown,
        };

        if params.bootstrap && core.log.last_index() == 0 && core.membership.is_empty() {
            info!(id = core.id, "Bootstrapping single-node raft cluster");
            core.stable.set(1, None).map_err(storage_error)?;
            let entry = Entry {
                term: 1,
                index: 1,
                payload: EntryPayload::Membership(vec![Peer {
                    id: core.id,
                    addr: core.advertised_addr.clone(),
                }]),
            };
            core.log.append(&[entry.clone()]).map_err(storage_error)?;
            core.apply_membership_entry(&entry);
        }

        core.reset_election_deadline();
        Ok(core)
    }

    async fn run(mut self, mut msg_rx: mpsc::Receiver<NodeMsg>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(20));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => self.tick(),
                msg = msg_rx.recv() => match msg {
                    Some(msg) => self.handle_msg(msg),
                    None => break,
                }
            }
        }

        self.fail_waiters(|| RaftError::Shutdown);
        debug!(id = self.id, "Raft core stopped");
    }

    fn current_term(&self) -> Term {
        self.stable.state().current_term
    }

    fn is_voter(&self, id: NodeId) -> bool {
        self.membership.iter().any(|peer| peer.id == id)
    }

    fn peers(&self) -> Vec<Peer> {
        self.membership
            .iter()
            .filter(|peer| peer.id != self.id)
            .cloned()
            .collect()
    }

    fn quorum(&self) -> usize {
        self.membership.len() / 2 + 1
    }

    fn leader_peer(&self) -> Option<Peer> {
        self.leader_id
            .and_then(|id| self.membership.iter().find(|peer| peer.id == id).cloned())
    }

    fn effective_last_term(&self) -> Term {
        if self.log.last_index() > self.snapshot_last_index {
            self.log.last_term()
        } else {
            self.snapshot_last_term
        }
    }

    fn reset_election_deadline(&mut self) {
        let min = self.config.election_timeout_min.as_millis() as u64;
        let max = self.config.election_timeout_max.as_millis() as u64;
        let timeout = rand::rng().random_range(min..=max.max(min + 1));
        self.election_deadline = Instant::now() + Duration::from_millis(timeout);
    }

    fn handle_msg(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::Rpc(rpc) => {
                let response = self.handle_rpc(rpc.request);
                let _ = rpc.reply.send(response);
            }
            NodeMsg::Propose { payload, reply } => self.handle_propose(payload, reply),
            NodeMsg::ForceSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
            NodeMsg::GetState { reply } => {
                let _ = reply.send(RaftState {
                    id: self.id,
                    term: self.current_term(),
                    role: self.role,
                    leader: self.leader_peer(),
                    last_log_index: self.log.last_index(),
                    commit_index: self.commit_index,
                    last_applied: self.last_applied,
                    snapshot_index: self.snapshot_last_index,
                    membership: self.membership.clone(),
                });
            }
            NodeMsg::VoteResult {
                term,
                peer,
                response,
            } => self.handle_vote_result(term, peer, response),
            NodeMsg::AppendResult {
                term,
                peer,
                prev_log_index,
                sent,
                result,
            } => self.handle_append_result(term, peer, prev_log_index, sent, result),
            NodeMsg::SnapshotSendResult {
                term,
                peer,
                last_included_index,
                result,
            } => self.handle_snapshot_send_result(term, peer, last_included_index, result),
        }
    }

    fn tick(&mut self) {
        match self.role {
            RaftRole::Leader => self.replicate_all(false),
            RaftRole::Follower | RaftRole::Candidate => {
                if self.is_voter(self.id) && Instant::now() >= self.election_deadline {
                    self.start_election();
                }
            }
        }
    }

    // ---- elections -------------------------------------------------------

    fn start_election(&mut self) {
        let term = self.current_term() + 1;
        if self.stable.set(term, Some(self.id)).is_err() {
            return;
        }
        self.role = RaftRole::Candidate;
        self.leader_id = None;
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        debug!(id = self.id, term, "Starting election");

        if self.votes.len() >= self.quorum() {
            self.become_leader();
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.log.last_index(),
            last_log_term: self.effective_last_term(),
        };

        for peer in self.peers() {
            let request = request.clone();
            let msg_tx = self.msg_tx.clone();
            let rpc_timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                if let Ok(crate::raft::message::Response::RequestVote(response)) =
                    transport::call(&peer.addr, &Request::RequestVote(request.clone()), rpc_timeout)
                        .await
                {
                    let _ = msg_tx
                        .send(NodeMsg::VoteResult {
                            term: request.term,
                            peer: peer.id,
                            response,
                        })
                        .await;
                }
            });
        }
    }

    fn handle_vote_result(&mut self, term: Term, peer: NodeId, response: RequestVoteResponse) {
        if response.term > self.current_term() {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != RaftRole::Candidate || term != self.current_term() {
            return;
        }
        if response.vote_granted {
            self.votes.insert(peer);
            if self.votes.len() >= self.quorum() {
                self.become_leader();
            }
        }
    }

    fn become_leader(&mut self) {
        info!(id = self.id, term = self.current_term(), "Became raft leader");
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.id);
        self.next_index.clear();
        self.match_index.clear();
        self.inflight_append.clear();
        self.inflight_snapshot.clear();
        self.last_contact.clear();
        let next = self.log.last_index() + 1;
        for peer in self.peers() {
            self.next_index.insert(peer.id, next);
            self.match_index.insert(peer.id, 0);
        }

        // Commit entries from earlier terms by appending one in ours.
        let noop = Entry {
            term: self.current_term(),
            index: self.log.last_index() + 1,
            payload: EntryPayload::Noop,
        };
        if let Err(err) = self.log.append(std::slice::from_ref(&noop)) {
            warn!(id = self.id, "Failed to append no-op entry: {err}");
            return;
        }
        self.advance_commit();
        self.replicate_all(true);
    }

    fn become_follower(&mut self, term: Term, leader: Option<NodeId>) {
        if term > self.current_term() {
            let _ = self.stable.set(term, None);
        }
        let was_leader = self.role == RaftRole::Leader;
        self.role = RaftRole::Follower;
        self.leader_id = leader;
        self.votes.clear();
        self.inflight_append.clear();
        self.inflight_snapshot.clear();
        if was_leader {
            let leader_peer = self.leader_peer();
            self.fail_waiters(|| RaftError::NotLeader(leader_peer.clone()));
        }
        self.reset_election_deadline();
    }

    // ---- proposals -------------------------------------------------------

    fn handle_propose(
        &mut self,
        payload: EntryPayload,
        reply: oneshot::Sender<Result<LogIndex, RaftError>>,
    ) {
        if self.role != RaftRole::Leader {
            let _ = reply.send(Err(RaftError::NotLeader(self.leader_peer())));
            return;
        }
        if matches!(payload, EntryPayload::Membership(_)) && self.membership_change_in_flight() {
            let _ = reply.send(Err(RaftError::MembershipChangeInFlight));
            return;
        }

        let entry = Entry {
            term: self.current_term(),
            index: self.log.last_index() + 1,
            payload,
        };
        if let Err(err) = self.log.append(std::slice::from_ref(&entry)) {
            let _ = reply.send(Err(storage_error(err)));
            return;
        }
        if let EntryPayload::Membership(_) = &entry.payload {
            self.apply_membership_entry(&entry);
        }
        self.waiters.entry(entry.index).or_default().push(reply);
        self.advance_commit();
        self.replicate_all(true);
    }

    fn membership_change_in_flight(&self) -> bool {
        self.membership_index > self.commit_index
    }

    fn apply_membership_entry(&mut self, entry: &Entry) {
        let EntryPayload::Membership(peers) = &entry.payload else {
            return;
        };
        self.membership = peers.clone();
        self.membership_index = entry.index;

        if self.role == RaftRole::Leader {
            let next = self.log.last_index() + 1;
            for peer in self.peers() {
                self.next_index.entry(peer.id).or_insert(next);
                self.match_index.entry(peer.id).or_insert(0);
            }
            let member_ids: HashSet<NodeId> = self.membership.iter().map(|p| p.id).collect();
            self.next_index.retain(|id, _| member_ids.contains(id));
            self.match_index.retain(|id, _| member_ids.contains(id));
            self.inflight_append.retain(|id| member_ids.contains(id));
            self.inflight_snapshot.retain(|id| member_ids.contains(id));
        }
    }

    // ---- replication (leader side) ---------------------------------------

    fn replicate_all(&mut self, force: bool) {
        for peer in self.peers() {
            self.replicate_to(&peer, force);
        }
    }

    fn replicate_to(&mut self, peer: &Peer, force: bool) {
        if self.role != RaftRole::Leader
            || self.inflight_append.contains(&peer.id)
            || self.inflight_snapshot.contains(&peer.id)
        {
            return;
        }

        let next = *self
            .next_index
            .get(&peer.id)
            .unwrap_or(&(self.log.last_index() + 1));

        if next <= self.snapshot_last_index {
            self.send_snapshot_to(peer);
            return;
        }

        let entries = self
            .log
            .entries_from(next, self.config.max_entries_per_append);
        let heartbeat_due = self
            .last_contact
            .get(&peer.id)
            .map(|at| at.elapsed() >= self.config.heartbeat_interval)
            .unwrap_or(true);
        if entries.is_empty() && !heartbeat_due && !force {
            return;
        }

        let prev_log_index = next - 1;
        let prev_log_term = if prev_log_index == 0 {
            0
        } else if prev_log_index == self.snapshot_last_index {
            self.snapshot_last_term
        } else {
            self.log.term_at(prev_log_index).unwrap_or(0)
        };

        let request = AppendEntriesRequest {
            term: self.current_term(),
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };
        let sent = request.entries.len() as u64;

        self.inflight_append.insert(peer.id);
        self.last_contact.insert(peer.id, Instant::now());

        let msg_tx = self.msg_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let peer = peer.clone();
        tokio::spawn(async move {
            let result = match transport::call(
                &peer.addr,
                &Request::AppendEntries(request.clone()),
                rpc_timeout,
            )
            .await
            {
                Ok(crate::raft::message::Response::AppendEntries(response)) => Some(response),
                _ => None,
            };
            let _ = msg_tx
                .send(NodeMsg::AppendResult {
                    term: request.term,
                    peer: peer.id,
                    prev_log_index: request.prev_log_index,
                    sent,
                    result,
                })
                .await;
        });
    }

    fn handle_append_result(
        &mut self,
        term: Term,
        peer: NodeId,
        prev_log_index: LogIndex,
        sent: u64,
        result: Option<AppendEntriesResponse>,
    ) {
        self.inflight_append.remove(&peer);
        let Some(response) = result else { return };

        if response.term > self.current_term() {
            self.become_follower(response.term, None);
            return;
        }
        if self.role != RaftRole::Leader || term != self.current_term() {
            return;
        }

        let Some(peer_info) = self.membership.iter().find(|p| p.id == peer).cloned() else {
            return;
        };

        if response.success {
            let matched = prev_log_index + sent;
            let entry = self.match_index.entry(peer).or_insert(0);
            *entry = (*entry).max(matched);
            self.next_index.insert(peer, matched + 1);
            self.advance_commit();
            if self.next_index.get(&peer).copied().unwrap_or(0) <= self.log.last_index() {
                self.replicate_to(&peer_info, true);
            }
        } else {
            let rewind = response
                .match_index
                .saturating_add(1)
                .min(prev_log_index.max(1));
            self.next_index.insert(peer, rewind.max(1));
            self.replicate_to(&peer_info, true);
        }
    }

    fn advance_commit(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }

        let mut candidate = self.log.last_index();
        while candidate > self.commit_index {
            if self.log.term_at(candidate) == Some(self.current_term()) {
                let mut replicated = if self.is_voter(self.id) { 1 } else { 0 };
                for peer in self.peers() {
                    if self.match_index.get(&peer.id).copied().unwrap_or(0) >= candidate {
                        replicated += 1;
                    }
                }
                if replicated >= self.quorum() {
                    self.commit_index = candidate;
                    break;
                }
            }
            candidate -= 1;
        }

        self.apply_committed();

        // A committed membership change that no longer contains this node
        // demotes it; it keeps serving local reads but takes no more writes.
        if self.role == RaftRole::Leader
            && self.membership_index <= self.commit_index
            && !self.is_voter(self.id)
        {
            info!(id = self.id, "Removed from membership, stepping down");
            let term = self.current_term();
            self.become_follower(term, None);
        }
    }

    // ---- log application -------------------------------------------------

    fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let Some(entry) = self.log.get(index).cloned() else {
                break;
            };

            let apply_result = match &entry.payload {
                EntryPayload::Command(bytes) => self.fsm.apply(index, Some(bytes)),
                _ => self.fsm.apply(index, None),
            };

            self.last_applied = index;
            self.last_applied_term = entry.term;

            if let Some(waiters) = self.waiters.remove(&index) {
                for waiter in waiters {
                    let outcome = match &apply_result {
                        Ok(()) => Ok(index),
                        Err(err) => Err(RaftError::ApplyFailed(err.to_string())),
                    };
                    let _ = waiter.send(outcome);
                }
            }

            if let Err(err) = apply_result {
                warn!(id = self.id, index, "State machine apply failed: {err}");
            }
        }

        if self.config.snapshot_threshold > 0
            && self.last_applied - self.snapshot_last_index >= self.config.snapshot_threshold
        {
            if let Err(err) = self.take_snapshot() {
                warn!(id = self.id, "Automatic snapshot failed: {err}");
            }
        }
    }

    fn fail_waiters(&mut self, error: impl Fn() -> RaftError) {
        for (_, waiters) in std::mem::take(&mut self.waiters) {
            for waiter in waiters {
                let _ = waiter.send(Err(error()));
            }
        }
    }

    // ---- snapshots -------------------------------------------------------

    fn take_snapshot(&mut self) -> Result<LogIndex, RaftError> {
        if self.last_applied <= self.snapshot_last_index {
            return Ok(self.snapshot_last_index);
        }

        let meta = SnapshotMeta {
            last_included_index: self.last_applied,
            last_included_term: self.last_applied_term,
            membership: self.membership.clone(),
        };
        let mut writer = self.snapshots.create(meta).map_err(storage_error)?;
        self.fsm
            .snapshot(&mut writer.file)
            .map_err(|err| RaftError::SnapshotFailed(err.to_string()))?;
        let meta = writer.commit().map_err(storage_error)?;

        self.snapshot_last_index = meta.last_included_index;
        self.snapshot_last_term = meta.last_included_term;
        self.log
            .compact_to(self.snapshot_last_index)
            .map_err(storage_error)?;

        info!(
            id = self.id,
            index = self.snapshot_last_index,
            "Snapshot taken and log compacted"
        );
        Ok(self.snapshot_last_index)
    }

    fn send_snapshot_to(&mut self, peer: &Peer) {
        let Ok(Some(meta)) = self.snapshots.latest() else {
            return;
        };
        let Ok(data) = self.snapshots.open_data() else {
            return;
        };
        let Ok(data_len) = self.snapshots.data_len() else {
            return;
        };

        self.inflight_snapshot.insert(peer.id);
        debug!(id = self.id, peer = peer.id, "Shipping snapshot to follower");

        let request_template = InstallSnapshotRequest {
            term: self.current_term(),
            leader_id: self.id,
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            membership: meta.membership.clone(),
            offset: 0,
            data: Vec::new(),
            done: false,
        };
        let msg_tx = self.msg_tx.clone();
        let rpc_timeout = self.config.rpc_timeout;
        let chunk_size = self.config.snapshot_chunk_size;
        let peer = peer.clone();

        tokio::spawn(async move {
            let result = ship_snapshot(
                &peer,
                request_template.clone(),
                data,
                data_len,
                chunk_size,
                rpc_timeout,
            )
            .await;
            let _ = msg_tx
                .send(NodeMsg::SnapshotSendResult {
                    term: request_template.term,
                    peer: peer.id,
                    last_included_index: request_template.last_included_index,
                    result,
                })
                .await;
        });
    }

    fn handle_snapshot_send_result(
        &mut self,
        term: Term,
        peer: NodeId,
        last_included_index: LogIndex,
        result: Option<Term>,
    ) {
        self.inflight_snapshot.remove(&peer);
        let Some(peer_term) = result else { return };

        if peer_term > self.current_term() {
            self.become_follower(peer_term, None);
            return;
        }
        if self.role != RaftRole::Leader || term != self.current_term() {
            return;
        }

        let entry = self.match_index.entry(peer).or_insert(0);
        *entry = (*entry).max(last_included_index);
        self.next_index.insert(peer, last_included_index + 1);
        self.advance_commit();
        if let Some(peer_info) = self.membership.iter().find(|p| p.id == peer).cloned() {
            self.replicate_to(&peer_info, true);
        }
    }

    // ---- rpc handlers (follower side) ------------------------------------

    fn handle_rpc(&mut self, request: Request) -> Response {
        match request {
            Request::RequestVote(req) => Response::RequestVote(self.handle_request_vote(req)),
            Request::AppendEntries(req) => Response::AppendEntries(self.handle_append_entries(req)),
            Request::InstallSnapshot(req) => {
                Response::InstallSnapshot(self.handle_install_snapshot(req))
            }
        }
    }

    fn handle_request_vote(&mut self, req: RequestVoteRequest) -> RequestVoteResponse {
        if req.term > self.current_term() {
            self.become_follower(req.term, None);
        }

        let term = self.current_term();
        if req.term < term {
            return RequestVoteResponse {
                term,
                vote_granted: false,
            };
        }

        let can_vote = match self.stable.state().voted_for {
            None => true,
            Some(candidate) => candidate == req.candidate_id,
        };
        let log_up_to_date = req.last_log_term > self.effective_last_term()
            || (req.last_log_term == self.effective_last_term()
                && req.last_log_index >= self.log.last_index());

        let vote_granted = can_vote && log_up_to_date;
        if vote_granted {
            if self.stable.set(term, Some(req.candidate_id)).is_err() {
                return RequestVoteResponse {
                    term,
                    vote_granted: false,
                };
            }
            self.reset_election_deadline();
        }
        RequestVoteResponse { term, vote_granted }
    }

    fn handle_append_entries(&mut self, req: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut term = self.current_term();
        if req.term < term {
            return AppendEntriesResponse {
                term,
                success: false,
                match_index: 0,
            };
        }
        if req.term > term || self.role != RaftRole::Follower {
            self.become_follower(req.term, Some(req.leader_id));
            term = self.current_term();
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_deadline();

        let prev_ok = if req.prev_log_index == 0 {
            true
        } else if req.prev_log_index <= self.snapshot_last_index {
            // Everything up to the snapshot is known committed state.
            req.prev_log_index < self.snapshot_last_index
                || req.prev_log_term == self.snapshot_last_term
        } else {
            self.log.term_at(req.prev_log_index) == Some(req.prev_log_term)
        };

        if !prev_ok {
            return AppendEntriesResponse {
                term,
                success: false,
                match_index: self.log.last_index().min(req.prev_log_index.saturating_sub(1)),
            };
        }

        for entry in &req.entries {
            if entry.index <= self.snapshot_last_index {
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    if self.log.truncate_from(entry.index).is_err()
                        || self.log.append(std::slice::from_ref(entry)).is_err()
                    {
                        return AppendEntriesResponse {
                            term,
                            success: false,
                            match_index: self.log.last_index(),
                        };
                    }
                }
                None => {
                    if self.log.append(std::slice::from_ref(entry)).is_err() {
                        return AppendEntriesResponse {
                            term,
                            success: false,
                            match_index: self.log.last_index(),
                        };
                    }
                }
            }
            if let EntryPayload::Membership(_) = &entry.payload {
                self.apply_membership_entry(entry);
            }
        }

        let match_index = req.prev_log_index + req.entries.len() as u64;
        if req.leader_commit > self.commit_index {
            self.commit_index = req.leader_commit.min(self.log.last_index());
            self.apply_committed();
        }

        AppendEntriesResponse {
            term,
            success: true,
            match_index,
        }
    }

    fn handle_install_snapshot(&mut self, req: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let term = self.current_term();
        if req.term < term {
            return InstallSnapshotResponse { term };
        }
        if req.term > term || self.role != RaftRole::Follower {
            self.become_follower(req.term, Some(req.leader_id));
        }
        self.leader_id = Some(req.leader_id);
        self.reset_election_deadline();

        if req.offset == 0 {
            let meta = SnapshotMeta {
                last_included_index: req.last_included_index,
                last_included_term: req.last_included_term,
                membership: req.membership.clone(),
            };
            match self.snapshots.create(meta) {
                Ok(writer) => {
                    self.pending_snapshot = Some(PendingSnapshot {
                        writer: Some(writer),
                        next_offset: 0,
                        last_included_index: req.last_included_index,
                        last_included_term: req.last_included_term,
                        membership: req.membership.clone(),
                    });
                }
                Err(err) => {
                    warn!(id = self.id, "Failed to start snapshot reception: {err}");
                    return InstallSnapshotResponse {
                        term: self.current_term(),
                    };
                }
            }
        }

        let Some(pending) = self.pending_snapshot.as_mut() else {
            return InstallSnapshotResponse {
                term: self.current_term(),
            };
        };
        if pending.next_offset != req.offset || pending.last_included_index != req.last_included_index
        {
            // Out-of-sequence chunk; drop the transfer, the leader restarts it.
            self.pending_snapshot = None;
            return InstallSnapshotResponse {
                term: self.current_term(),
            };
        }

        if let Some(writer) = pending.writer.as_mut() {
            if writer.file.write_all(&req.data).is_err() {
                self.pending_snapshot = None;
                return InstallSnapshotResponse {
                    term: self.current_term(),
                };
            }
        }
        pending.next_offset += req.data.len() as u64;

        if req.done {
            if let Some(pending) = self.pending_snapshot.take() {
                if let Err(err) = self.install_pending_snapshot(pending) {
                    warn!(id = self.id, "Snapshot install failed: {err}");
                }
            }
        }

        InstallSnapshotResponse {
            term: self.current_term(),
        }
    }

    fn install_pending_snapshot(&mut self, mut pending: PendingSnapshot) -> Result<(), RaftError> {
        let writer = pending
            .writer
            .take()
            .ok_or_else(|| RaftError::SnapshotFailed("missing snapshot writer".to_string()))?;
        let meta = writer.commit().map_err(storage_error)?;

        let mut data = self.snapshots.open_data().map_err(storage_error)?;
        data.seek(SeekFrom::Start(0))
            .map_err(|err| RaftError::SnapshotFailed(err.to_string()))?;
        self.fsm
            .restore(meta.last_included_index, &mut data)
            .map_err(|err| RaftError::SnapshotFailed(err.to_string()))?;

        self.snapshot_last_index = pending.last_included_index;
        self.snapshot_last_term = pending.last_included_term;
        self.membership = pending.membership;
        self.membership_index = pending.last_included_index;
        self.commit_index = self.commit_index.max(pending.last_included_index);
        self.last_applied = pending.last_included_index;
        self.last_applied_term = pending.last_included_term;
        self.log
            .reset_to(pending.last_included_index)
            .map_err(storage_error)?;

        info!(
            id = self.id,
            index = self.snapshot_last_index,
            "Restored state machine from shipped snapshot"
        );
        Ok(())
    }
}

async fn ship_snapshot(
    peer: &Peer,
    template: InstallSnapshotRequest,
    mut data: std::fs::File,
    data_len: u64,
    chunk_size: usize,
    rpc_timeout: Duration,
) -> Option<Term> {
    use std::io::Read;

    let mut offset = 0u64;
    loop {
        let remaining = (data_len - offset) as usize;
        let mut chunk = vec![0u8; remaining.min(chunk_size)];
        if !chunk.is_empty() {
            if data.read_exact(&mut chunk).is_err() {
                return None;
            }
        }
        let done = offset + chunk.len() as u64 >= data_len;

        let mut request = template.clone();
        request.offset = offset;
        request.data = chunk;
        request.done = done;
        let sent = request.data.len() as u64;

        match transport::call(&peer.addr, &Request::InstallSnapshot(request), rpc_timeout).await {
            Ok(crate::raft::message::Response::InstallSnapshot(response)) => {
                if response.term > template.term || done {
                    return Some(response.term);
                }
                offset += sent;
            }
            _ => return None,
        }
    }
}

fn storage_error(err: impl std::fmt::Display) -> RaftError {
    RaftError::Internal(err.to_string())
}

impl From<StorageError> for RaftError {
    fn from(err: StorageError) -> Self {
        RaftError::Internal(err.to_string())
    }
}
