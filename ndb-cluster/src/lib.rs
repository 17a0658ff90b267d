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

//! Replicated retrieval engine: a raft group whose state machine is a local
//! neural document database. Writes go through the leader and are applied in
//! log order on every replica; reads are served from the local engine.

pub mod dndb;
pub mod fsm;
pub mod ndb;
pub mod raft;
pub mod snapshot;

pub use dndb::{DistributedNdb, DndbConfig, DndbError, NdbOp, UpdateResult};
pub use ndb::{Constraint, LocalNdb, Ndb, NdbError, QueryHit, Source};
pub use raft::{NodeId, Peer, RaftError};

#[cfg(test)]
test_r::enable!();
