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

test_r::enable!();

use ndb_cluster::raft::RaftConfig;
use ndb_cluster::{DistributedNdb, DndbConfig, DndbError, NodeId};
use std::path::Path;
use std::time::Duration;
use test_r::test;

const LEADER_TIMEOUT: Duration = Duration::from_secs(10);
const APPLY_TIMEOUT: Duration = Duration::from_secs(10);

fn test_raft_config() -> RaftConfig {
    RaftConfig {
        heartbeat_interval: Duration::from_millis(30),
        election_timeout_min: Duration::from_millis(100),
        election_timeout_max: Duration::from_millis(250),
        rpc_timeout: Duration::from_secs(1),
        // snapshots only when a test forces them
        snapshot_threshold: 0,
        max_entries_per_append: 16,
        snapshot_chunk_size: 1024,
    }
}

async fn start_replica(id: NodeId, base_dir: &Path, bootstrap: bool) -> DistributedNdb {
    DistributedNdb::start(DndbConfig {
        replica_id: id,
        data_dir: base_dir.join(format!("replica-{id}")),
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        advertised_addr: None,
        bootstrap,
        raft: test_raft_config(),
    })
    .await
    .unwrap()
}

async fn wait_for_leader(replicas: &[DistributedNdb]) -> usize {
    let deadline = tokio::time::Instant::now() + LEADER_TIMEOUT;
    loop {
        for (position, replica) in replicas.iter().enumerate() {
            if replica.is_leader().await {
                return position;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no leader elected within {LEADER_TIMEOUT:?}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

async fn start_cluster(size: u64, base_dir: &Path) -> Vec<DistributedNdb> {
    let mut replicas = vec![start_replica(1, base_dir, true).await];
    wait_for_leader(&replicas).await;

    for id in 2..=size {
        let replica = start_replica(id, base_dir, false).await;
        replicas[0]
            .add_replica(id, &replica.local_addr().to_string())
            .await
            .unwrap();
        replicas.push(replica);
    }
    replicas
}

async fn insert_doc(leader: &DistributedNdb, doc_id: &str, text: &str) -> u64 {
    leader
        .insert(doc_id, doc_id, vec![text.to_string()], vec![])
        .await
        .unwrap()
        .index
}

#[test]
async fn writes_replicate_and_converge() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader = &replicas[wait_for_leader(&replicas).await];

    insert_doc(leader, "a", "the quick brown fox").await;
    insert_doc(leader, "b", "jumps over the lazy dog").await;
    let last = insert_doc(leader, "c", "slow green turtle").await;

    let leader_sources = leader.sources().unwrap();
    let leader_hits = leader.query("quick fox", 3, &[]).unwrap();
    assert_eq!(leader_sources.len(), 3);

    for replica in &replicas {
        replica.wait_for(last, APPLY_TIMEOUT).await.unwrap();
        assert_eq!(replica.sources().unwrap(), leader_sources);
        assert_eq!(replica.query("quick fox", 3, &[]).unwrap(), leader_hits);
    }

    for replica in &replicas {
        replica.shutdown();
    }
}

#[test]
async fn writes_against_follower_are_redirected() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader_position = wait_for_leader(&replicas).await;

    let follower = replicas
        .iter()
        .enumerate()
        .find(|(position, _)| *position != leader_position)
        .map(|(_, replica)| replica)
        .unwrap();

    let result = follower
        .insert("doc", "doc", vec!["text".to_string()], vec![])
        .await;
    assert!(matches!(result, Err(DndbError::NotLeader { .. })));

    for replica in &replicas {
        replica.shutdown();
    }
}

#[test]
async fn leader_validates_before_appending() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(1, dir.path()).await;
    let leader = &replicas[0];

    let before = leader.last_applied_index();
    let result = leader.insert("doc", "", vec!["text".to_string()], vec![]).await;
    assert!(matches!(result, Err(DndbError::InvalidArgument(_))));
    assert_eq!(leader.last_applied_index(), before);

    leader.shutdown();
}

#[test]
async fn joining_replica_catches_up_from_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader = &replicas[wait_for_leader(&replicas).await];

    // pre-populated engine with one source
    let mut last = insert_doc(leader, "seed", "initial seed document").await;
    for i in 0..10 {
        last = insert_doc(leader, &format!("doc-{i}"), &format!("payload number {i}")).await;
    }
    leader.wait_for(last, APPLY_TIMEOUT).await.unwrap();
    leader.force_snapshot().await.unwrap();

    let joiner = start_replica(4, dir.path(), false).await;
    leader
        .add_replica(4, &joiner.local_addr().to_string())
        .await
        .unwrap();

    let leader_last = leader.raft_state().await.unwrap().last_log_index;
    joiner.wait_for(leader_last, APPLY_TIMEOUT).await.unwrap();

    assert_eq!(joiner.sources().unwrap().len(), 11);
    assert_eq!(joiner.sources().unwrap(), leader.sources().unwrap());
    assert_eq!(
        joiner.query("payload number 7", 3, &[]).unwrap(),
        leader.query("payload number 7", 3, &[]).unwrap()
    );

    for replica in &replicas {
        replica.shutdown();
    }
    joiner.shutdown();
}

#[test]
async fn read_your_writes_after_wait() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader_position = wait_for_leader(&replicas).await;
    let leader = &replicas[leader_position];

    let index = insert_doc(leader, "rw", "read your writes").await;

    for (position, replica) in replicas.iter().enumerate() {
        if position == leader_position {
            continue;
        }
        replica.wait_for(index, APPLY_TIMEOUT).await.unwrap();
        let hits = replica.query("read your writes", 1, &[]).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "rw");
    }

    for replica in &replicas {
        replica.shutdown();
    }
}

#[test]
async fn upvote_and_associate_replicate() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader = &replicas[wait_for_leader(&replicas).await];

    insert_doc(leader, "a", "alpha document text").await;
    insert_doc(leader, "b", "beta document text").await;

    let beta_chunk = leader.query("beta", 1, &[]).unwrap()[0].id;
    leader.upvote("document", beta_chunk).await.unwrap();
    let last = leader.associate("report", "document", 4).await.unwrap().index;

    for replica in &replicas {
        replica.wait_for(last, APPLY_TIMEOUT).await.unwrap();
        let hits = replica.query("document", 2, &[]).unwrap();
        assert_eq!(hits[0].id, beta_chunk, "upvoted chunk ranks first");
        assert!(!replica.query("report", 2, &[]).unwrap().is_empty());
    }

    for replica in &replicas {
        replica.shutdown();
    }
}

#[test]
async fn removing_the_leader_forces_an_election() {
    let dir = tempfile::tempdir().unwrap();
    let replicas = start_cluster(3, dir.path()).await;
    let leader_position = wait_for_leader(&replicas).await;
    let old_leader = &replicas[leader_position];

    let last = insert_doc(old_leader, "doc", "shared state").await;
    for replica in &replicas {
        replica.wait_for(last, APPLY_TIMEOUT).await.unwrap();
    }

    let old_leader_id = old_leader.replica_id();
    old_leader.remove_replica(old_leader_id).await.unwrap();

    let remaining: Vec<&DistributedNdb> = replicas
        .iter()
        .filter(|replica| replica.replica_id() != old_leader_id)
        .collect();

    let deadline = tokio::time::Instant::now() + LEADER_TIMEOUT;
    let new_leader = loop {
        let mut found = None;
        for replica in &remaining {
            if replica.is_leader().await {
                found = Some(*replica);
                break;
            }
        }
        if let Some(leader) = found {
            break leader;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no new leader after removing the old one"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    // the removed replica keeps serving local reads
    assert_eq!(old_leader.sources().unwrap().len(), 1);

    // and the new leader accepts writes
    let index = insert_doc(new_leader, "after", "written after the election").await;
    new_leader.wait_for(index, APPLY_TIMEOUT).await.unwrap();
    assert_eq!(new_leader.sources().unwrap().len(), 2);

    for replica in &replicas {
        replica.shutdown();
    }
}

#[test]
async fn replica_recovers_from_disk_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let replica = start_replica(1, dir.path(), true).await;
        wait_for_leader(std::slice::from_ref(&replica)).await;
        insert_doc(&replica, "a", "persisted text one").await;
        let last = insert_doc(&replica, "b", "persisted text two").await;
        replica.wait_for(last, APPLY_TIMEOUT).await.unwrap();
        replica.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let restarted = start_replica(1, dir.path(), true).await;
    wait_for_leader(std::slice::from_ref(&restarted)).await;

    let last_log_index = restarted.raft_state().await.unwrap().last_log_index;
    restarted
        .wait_for(last_log_index, APPLY_TIMEOUT)
        .await
        .expect("log replay after restart");
    let sources = restarted.sources().unwrap();
    assert_eq!(sources.len(), 2);

    restarted.shutdown();
}

#[test]
async fn snapshot_survives_engine_directory_loss() {
    let dir = tempfile::tempdir().unwrap();

    {
        let replica = start_replica(1, dir.path(), true).await;
        wait_for_leader(std::slice::from_ref(&replica)).await;
        let last = insert_doc(&replica, "a", "snapshotted text").await;
        replica.wait_for(last, APPLY_TIMEOUT).await.unwrap();
        replica.force_snapshot().await.unwrap();
        replica.shutdown();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // lose the replica-local engine directory, keep raft state
    std::fs::remove_dir_all(dir.path().join("replica-1").join("ndb")).unwrap();

    let restarted = start_replica(1, dir.path(), true).await;
    wait_for_leader(std::slice::from_ref(&restarted)).await;

    let last_log_index = restarted.raft_state().await.unwrap().last_log_index;
    restarted.wait_for(last_log_index, APPLY_TIMEOUT).await.unwrap();
    assert_eq!(restarted.sources().unwrap().len(), 1);

    restarted.shutdown();
}
