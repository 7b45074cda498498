use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use raft_core::core::State;

mod fixtures;
use fixtures::RaftRouter;

async fn wait_for_leader(router: &RaftRouter) -> u64 {
    loop {
        if let Some(id) = router.leader().await {
            return id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A 3-node cluster elects a single leader, commits writes to a majority,
/// and the resulting metrics agree across nodes on term and log position.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn cluster_converges_on_one_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config("leader-metrics");
    let node_ids: BTreeSet<u64> = btreeset! {0, 1, 2};
    let router = RaftRouter::new_cluster(config, node_ids.clone()).await;

    let leader = wait_for_leader(&router).await;
    router.client_write_many(leader, "payload", 5).await;
    router.wait_for_log(&node_ids, 6, "followers caught up on 5 writes + 1 blank entry").await?;

    router.assert_stable_cluster(None, None).await;

    let metrics = router.latest_metrics().await;
    let leader_metrics = metrics.iter().find(|m| m.id == leader).expect("leader metrics present");
    assert_eq!(leader_metrics.state, State::Leader);
    assert_eq!(leader_metrics.current_leader, Some(leader));

    Ok(())
}

/// When the leader is partitioned away, the remaining majority elects a new
/// leader in a higher term; once the partition heals, the old leader steps
/// down and catches its log up to the new leader's.
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn isolated_leader_steps_down_after_partition_heals() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config("leader-partition");
    let node_ids: BTreeSet<u64> = btreeset! {0, 1, 2};
    let router = RaftRouter::new_cluster(config, node_ids.clone()).await;

    let original_leader = wait_for_leader(&router).await;
    router.client_write(original_leader, "before-partition".to_string()).await;
    router.wait_for_log(&node_ids, 2, "all caught up before partition").await?;

    tracing::info!(original_leader, "--- isolating the current leader");
    router.isolate_node(original_leader).await;

    let remaining: BTreeSet<u64> = node_ids.iter().copied().filter(|id| *id != original_leader).collect();
    let new_leader = loop {
        if let Some(id) = router.leader().await {
            if id != original_leader {
                break id;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_ne!(new_leader, original_leader, "a different node must win the election while the old leader is isolated");

    router.client_write(new_leader, "during-partition".to_string()).await;
    router.wait_for_log(&remaining, 4, "remaining majority caught up during the partition").await?;

    tracing::info!(original_leader, "--- healing the partition");
    router.restore_node(original_leader).await;

    router.wait_for_log(&node_ids, 4, "former leader catches up after rejoining").await?;
    router.wait_for_state(&btreeset! {original_leader}, State::Follower, "former leader steps down").await?;

    router.assert_stable_cluster(None, None).await;
    let metrics = router.latest_metrics().await;
    let leader_count = metrics.iter().filter(|m| m.state == State::Leader).count();
    assert_eq!(leader_count, 1, "exactly one leader once the cluster has stabilized");

    Ok(())
}
