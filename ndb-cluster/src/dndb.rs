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

use crate::fsm::{StateMachine, StateMachineError};
use crate::ndb::{Constraint, LocalNdb, Ndb, NdbError, QueryHit, Source};
use crate::raft::node::{self, RaftConfig, RaftHandle, RaftNodeParams, RaftRole, RaftState};
use crate::raft::{transport, NodeId, Peer, RaftError};
use crate::snapshot;
use bincode::{Decode, Encode};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DndbError {
    #[error("Not the leader; writes must go to the current leader")]
    NotLeader { leader: Option<Peer> },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Engine(#[from] NdbError),
    #[error(transparent)]
    Raft(RaftError),
    #[error("Timed out waiting for index {0}")]
    WaitTimeout(u64),
    #[error("Replica I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RaftError> for DndbError {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader(leader) => DndbError::NotLeader { leader },
            other => DndbError::Raft(other),
        }
    }
}

/// Replicated log entry; applied exactly once in log order on every replica.
#[derive(Encode, Decode, Debug, Clone, PartialEq)]
pub enum NdbOp {
    Insert {
        document: String,
        doc_id: String,
        chunks: Vec<String>,
        metadata: Vec<HashMap<String, String>>,
    },
    Delete {
        doc_id: String,
        keep_latest_version: bool,
    },
    Upvote {
        query: String,
        label: u64,
    },
    Associate {
        source: String,
        target: String,
        strength: u32,
    },
}

impl NdbOp {
    /// Leader-side precondition validation, run before the op is appended to
    /// the log so the caller sees simple mistakes synchronously.
    pub fn validate(&self) -> Result<(), DndbError> {
        match self {
            NdbOp::Insert {
                doc_id,
                chunks,
                metadata,
                ..
            } => {
                if doc_id.is_empty() {
                    return Err(DndbError::InvalidArgument(
                        "doc_id must not be empty".to_string(),
                    ));
                }
                if chunks.is_empty() {
                    return Err(DndbError::InvalidArgument(
                        "at least one chunk is required".to_string(),
                    ));
                }
                if !metadata.is_empty() && metadata.len() != chunks.len() {
                    return Err(DndbError::InvalidArgument(
                        "metadata must be empty or match the number of chunks".to_string(),
                    ));
                }
                Ok(())
            }
            NdbOp::Delete { doc_id, .. } => {
                if doc_id.is_empty() {
                    return Err(DndbError::InvalidArgument(
                        "doc_id must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            NdbOp::Upvote { query, .. } => {
                if query.is_empty() {
                    return Err(DndbError::InvalidArgument(
                        "query must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            NdbOp::Associate { source, target, .. } => {
                if source.is_empty() || target.is_empty() {
                    return Err(DndbError::InvalidArgument(
                        "source and target must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
        }
    }

    fn encode(&self) -> Result<Vec<u8>, DndbError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|err| DndbError::InvalidArgument(err.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StateMachineError> {
        bincode::decode_from_slice(bytes, bincode::config::standard())
            .map(|(op, _)| op)
            .map_err(|err| StateMachineError::Apply(format!("undecodable op: {err}")))
    }
}

pub type NdbFactory = Box<dyn Fn(&Path) -> Result<Box<dyn Ndb>, NdbError> + Send + Sync>;

struct EngineCell {
    ndb: Box<dyn Ndb>,
}

/// The raft state machine: one local NDB per replica. The `RwLock` separates
/// mutation from snapshotting; raft itself serializes applies, so `apply`
/// only needs the read side to exclude the snapshotter. `snapshot` and
/// `restore` hold the write side.
pub struct NdbStateMachine {
    cell: RwLock<EngineCell>,
    engine_dir: PathBuf,
    factory: NdbFactory,
    last_applied_tx: watch::Sender<u64>,
}

impl NdbStateMachine {
    pub fn new(ndb: Box<dyn Ndb>, factory: NdbFactory, engine_dir: PathBuf) -> Self {
        let (last_applied_tx, _) = watch::channel(0);
        Self {
            cell: RwLock::new(EngineCell { ndb }),
            engine_dir,
            factory,
            last_applied_tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.last_applied_tx.subscribe()
    }

    pub fn query(
        &self,
        query: &str,
        top_k: usize,
        constraints: &[Constraint],
    ) -> Result<Vec<QueryHit>, NdbError> {
        let guard = self.cell.read();
        guard.ndb.query(query, top_k, constraints)
    }

    pub fn sources(&self) -> Result<Vec<Source>, NdbError> {
        let guard = self.cell.read();
        guard.ndb.sources()
    }
}

impl StateMachine for NdbStateMachine {
    fn apply(&self, index: u64, command: Option<&[u8]>) -> Result<(), StateMachineError> {
        let result = match command {
            None => Ok(()),
            Some(bytes) => {
                let op = NdbOp::decode(bytes)?;
                let guard = self.cell.read();
                let applied = match op {
                    NdbOp::Insert {
                        document,
                        doc_id,
                        chunks,
                        metadata,
                    } => guard.ndb.insert(&document, &doc_id, chunks, metadata),
                    NdbOp::Delete {
                        doc_id,
                        keep_latest_version,
                    } => guard.ndb.delete(&doc_id, keep_latest_version),
                    NdbOp::Upvote { query, label } => {
                        guard.ndb.finetune(vec![query], vec![label])
                    }
                    NdbOp::Associate {
                        source,
                        target,
                        strength,
                    } => guard.ndb.associate(&source, &target, strength),
                };
                applied.map_err(|err| StateMachineError::Apply(err.to_string()))
            }
        };
        self.last_applied_tx.send_replace(index);
        result
    }

    fn snapshot(&self, writer: &mut dyn std::io::Write) -> Result<(), StateMachineError> {
        let staging =
            tempfile::tempdir().map_err(|err| StateMachineError::Snapshot(err.to_string()))?;

        // Pause applies only while the engine saves itself; the tar walk of
        // the saved directory runs outside the lock.
        {
            let guard = self.cell.write();
            guard
                .ndb
                .save(staging.path())
                .map_err(|err| StateMachineError::Snapshot(err.to_string()))?;
        }

        snapshot::pack_dir(staging.path(), writer)
            .map_err(|err| StateMachineError::Snapshot(err.to_string()))
    }

    fn restore(&self, index: u64, reader: &mut dyn std::io::Read) -> Result<(), StateMachineError> {
        let staging = self.engine_dir.with_extension("restore");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)
                .map_err(|err| StateMachineError::Restore(err.to_string()))?;
        }
        snapshot::unpack_to(reader, &staging)
            .map_err(|err| StateMachineError::Restore(err.to_string()))?;

        {
            let mut guard = self.cell.write();
            if self.engine_dir.exists() {
                std::fs::remove_dir_all(&self.engine_dir)
                    .map_err(|err| StateMachineError::Restore(err.to_string()))?;
            }
            std::fs::rename(&staging, &self.engine_dir)
                .map_err(|err| StateMachineError::Restore(err.to_string()))?;
            let fresh = (self.factory)(&self.engine_dir)
                .map_err(|err| StateMachineError::Restore(err.to_string()))?;
            guard.ndb.free();
            guard.ndb = fresh;
        }

        self.last_applied_tx.send_replace(index);
        Ok(())
    }

    fn last_applied(&self) -> u64 {
        *self.last_applied_tx.borrow()
    }
}

#[derive(Debug, Clone)]
pub struct DndbConfig {
    pub replica_id: NodeId,
    pub data_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Address other replicas use to reach this one; defaults to the bound
    /// address (useful with port 0 in tests).
    pub advertised_addr: Option<String>,
    /// Seed a brand-new cluster with this replica as the sole member.
    pub bootstrap: bool,
    pub raft: RaftConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateResult {
    pub index: u64,
}

/// A replica of the distributed NDB. Writes are linearized through the raft
/// leader; reads are served locally and are eventually consistent — callers
/// wanting read-your-writes wait for the index returned by the write.
pub struct DistributedNdb {
    replica_id: NodeId,
    local_addr: SocketAddr,
    raft: RaftHandle,
    fsm: Arc<NdbStateMachine>,
}

impl DistributedNdb {
    pub async fn start(config: DndbConfig) -> Result<Self, DndbError> {
        Self::start_with_factory(
            config,
            Box::new(|dir| LocalNdb::open(dir).map(|ndb| Box::new(ndb) as Box<dyn Ndb>)),
        )
        .await
    }

    pub async fn start_with_factory(
        config: DndbConfig,
        factory: NdbFactory,
    ) -> Result<Self, DndbError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let engine_dir = config.data_dir.join("ndb");
        std::fs::create_dir_all(&engine_dir)?;

        let ndb = factory(&engine_dir)?;
        let fsm = Arc::new(NdbStateMachine::new(ndb, factory, engine_dir));

        let (listener, local_addr) = transport::bind(config.bind_addr).await?;
        let advertised_addr = config
            .advertised_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let (raft, _core_task) = node::start(RaftNodeParams {
            id: config.replica_id,
            advertised_addr,
            data_dir: config.data_dir.join("raft"),
            listener,
            bootstrap: config.bootstrap,
            config: config.raft.clone(),
            fsm: fsm.clone(),
        })?;

        info!(
            replica = config.replica_id,
            addr = %local_addr,
            "Distributed NDB replica started"
        );

        Ok(Self {
            replica_id: config.replica_id,
            local_addr,
            raft,
            fsm,
        })
    }

    pub fn replica_id(&self) -> NodeId {
        self.replica_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    // ---- write path ------------------------------------------------------

    pub async fn insert(
        &self,
        document: &str,
        doc_id: &str,
        chunks: Vec<String>,
        metadata: Vec<HashMap<String, String>>,
    ) -> Result<UpdateResult, DndbError> {
        self.submit(NdbOp::Insert {
            document: document.to_string(),
            doc_id: doc_id.to_string(),
            chunks,
            metadata,
        })
        .await
    }

    pub async fn delete(
        &self,
        doc_id: &str,
        keep_latest_version: bool,
    ) -> Result<UpdateResult, DndbError> {
        self.submit(NdbOp::Delete {
            doc_id: doc_id.to_string(),
            keep_latest_version,
        })
        .await
    }

    pub async fn upvote(&self, query: &str, label: u64) -> Result<UpdateResult, DndbError> {
        self.submit(NdbOp::Upvote {
            query: query.to_string(),
            label,
        })
        .await
    }

    pub async fn associate(
        &self,
        source: &str,
        target: &str,
        strength: u32,
    ) -> Result<UpdateResult, DndbError> {
        self.submit(NdbOp::Associate {
            source: source.to_string(),
            target: target.to_string(),
            strength,
        })
        .await
    }

    async fn submit(&self, op: NdbOp) -> Result<UpdateResult, DndbError> {
        op.validate()?;
        let index = self.raft.client_write(op.encode()?).await?;
        Ok(UpdateResult { index })
    }

    // ---- read path -------------------------------------------------------

    pub fn query(
        &self,
        query: &str,
        top_k: usize,
        constraints: &[Constraint],
    ) -> Result<Vec<QueryHit>, DndbError> {
        Ok(self.fsm.query(query, top_k, constraints)?)
    }

    pub fn sources(&self) -> Result<Vec<Source>, DndbError> {
        Ok(self.fsm.sources()?)
    }

    pub fn last_applied_index(&self) -> u64 {
        self.fsm.last_applied()
    }

    /// Blocks until this replica has applied at least `index`; the
    /// read-your-writes primitive.
    pub async fn wait_for(&self, index: u64, timeout: Duration) -> Result<(), DndbError> {
        let mut receiver = self.fsm.subscribe();
        let waited = tokio::time::timeout(timeout, receiver.wait_for(|applied| *applied >= index));
        let result = match waited.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(DndbError::Raft(RaftError::Shutdown)),
            Err(_) => Err(DndbError::WaitTimeout(index)),
        };
        result
    }

    // ---- cluster management ----------------------------------------------

    pub async fn add_replica(&self, id: NodeId, addr: &str) -> Result<UpdateResult, DndbError> {
        let state = self.raft.state().await?;
        let mut membership: Vec<Peer> = state
            .membership
            .into_iter()
            .filter(|peer| peer.id != id)
            .collect();
        membership.push(Peer {
            id,
            addr: addr.to_string(),
        });
        let index = self.raft.change_membership(membership).await?;
        Ok(UpdateResult { index })
    }

    pub async fn remove_replica(&self, id: NodeId) -> Result<UpdateResult, DndbError> {
        let state = self.raft.state().await?;
        if !state.membership.iter().any(|peer| peer.id == id) {
            return Err(DndbError::Raft(RaftError::UnknownReplica(id)));
        }
        let membership: Vec<Peer> = state
            .membership
            .into_iter()
            .filter(|peer| peer.id != id)
            .collect();
        let index = self.raft.change_membership(membership).await?;
        Ok(UpdateResult { index })
    }

    pub async fn force_snapshot(&self) -> Result<u64, DndbError> {
        Ok(self.raft.force_snapshot().await?)
    }

    pub async fn raft_state(&self) -> Result<RaftState, DndbError> {
        Ok(self.raft.state().await?)
    }

    pub async fn is_leader(&self) -> bool {
        matches!(
            self.raft.state().await,
            Ok(RaftState {
                role: RaftRole::Leader,
                ..
            })
        )
    }

    pub async fn leader(&self) -> Option<Peer> {
        self.raft.state().await.ok().and_then(|state| state.leader)
    }

    pub fn shutdown(&self) {
        self.raft.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn op_validation_rejects_bad_inserts() {
        let op = NdbOp::Insert {
            document: "doc".to_string(),
            doc_id: String::new(),
            chunks: vec!["chunk".to_string()],
            metadata: vec![],
        };
        assert!(matches!(op.validate(), Err(DndbError::InvalidArgument(_))));

        let op = NdbOp::Insert {
            document: "doc".to_string(),
            doc_id: "a".to_string(),
            chunks: vec![],
            metadata: vec![],
        };
        assert!(matches!(op.validate(), Err(DndbError::InvalidArgument(_))));
    }

    #[test]
    fn op_roundtrips_through_bincode() {
        let op = NdbOp::Associate {
            source: "tortoise".to_string(),
            target: "turtle".to_string(),
            strength: 4,
        };
        let bytes = op.encode().unwrap();
        let decoded = NdbOp::decode(&bytes).unwrap();
        assert_eq!(op, decoded);
    }

    #[test]
    fn state_machine_applies_in_order_and_tracks_index() {
        let dir = tempfile::tempdir().unwrap();
        let engine_dir = dir.path().join("ndb");
        let fsm = NdbStateMachine::new(
            Box::new(LocalNdb::new()),
            Box::new(|dir| LocalNdb::open(dir).map(|ndb| Box::new(ndb) as Box<dyn Ndb>)),
            engine_dir,
        );

        let op = NdbOp::Insert {
            document: "doc".to_string(),
            doc_id: "a".to_string(),
            chunks: vec!["hello world".to_string()],
            metadata: vec![],
        };
        fsm.apply(1, Some(&op.encode().unwrap())).unwrap();
        fsm.apply(2, None).unwrap();

        assert_eq!(fsm.last_applied(), 2);
        assert_eq!(fsm.sources().unwrap().len(), 1);
    }

    #[test]
    fn snapshot_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let fsm = NdbStateMachine::new(
            Box::new(LocalNdb::new()),
            Box::new(|dir| LocalNdb::open(dir).map(|ndb| Box::new(ndb) as Box<dyn Ndb>)),
            dir.path().join("ndb"),
        );
        let op = NdbOp::Insert {
            document: "doc".to_string(),
            doc_id: "a".to_string(),
            chunks: vec!["hello world".to_string()],
            metadata: vec![],
        };
        fsm.apply(1, Some(&op.encode().unwrap())).unwrap();

        let mut snapshot_bytes = Vec::new();
        fsm.snapshot(&mut snapshot_bytes).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let other = NdbStateMachine::new(
            Box::new(LocalNdb::new()),
            Box::new(|dir| LocalNdb::open(dir).map(|ndb| Box::new(ndb) as Box<dyn Ndb>)),
            other_dir.path().join("ndb"),
        );
        other.restore(1, &mut snapshot_bytes.as_slice()).unwrap();

        assert_eq!(other.last_applied(), 1);
        assert_eq!(other.sources().unwrap(), fsm.sources().unwrap());
    }
}
