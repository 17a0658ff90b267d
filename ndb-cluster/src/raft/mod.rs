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

pub mod message;
pub mod node;
pub mod storage;
pub mod transport;

pub use message::{Entry, EntryPayload, LogIndex, NodeId, Peer, Term};
pub use node::{RaftConfig, RaftHandle, RaftState};

#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("Not the leader{}", leader_hint(.0))]
    NotLeader(Option<Peer>),
    #[error("A membership change is already in flight")]
    MembershipChangeInFlight,
    #[error("Node {0} is not a cluster member")]
    UnknownReplica(NodeId),
    #[error("Apply failed: {0}")]
    ApplyFailed(String),
    #[error("Snapshot failed: {0}")]
    SnapshotFailed(String),
    #[error("Raft node is shut down")]
    Shutdown,
    #[error("Raft internal error: {0}")]
    Internal(String),
}

fn leader_hint(leader: &Option<Peer>) -> String {
    match leader {
        Some(peer) => format!(", current leader is {} at {}", peer.id, peer.addr),
        None => String::new(),
    }
}
