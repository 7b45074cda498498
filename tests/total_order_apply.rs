use std::collections::BTreeSet;

use anyhow::Result;
use maplit::btreeset;

mod fixtures;
use fixtures::RaftRouter;

/// Single-leader cluster: every write submitted to the leader is applied to
/// every node's state machine, in the same order, once `last_applied` catches
/// up to `last_log_index`.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config("total-order");
    let node_ids: BTreeSet<u64> = btreeset! {0, 1, 2};
    let router = RaftRouter::new_cluster(config, node_ids.clone()).await;

    tracing::info!("--- waiting for a leader to be elected");
    let leader = loop {
        if let Some(id) = router.leader().await {
            break id;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };

    tracing::info!("--- submitting writes to the leader");
    for i in 0..10u64 {
        router.client_write(leader, format!("cmd-{}", i)).await;
    }

    router.wait_for_log(&node_ids, 10 + 1, "all nodes caught up").await?;
    router.assert_stable_cluster(None, None).await;

    tracing::info!("--- checking every node applied the same commands in the same order");
    let mut reference: Option<Vec<(u64, String)>> = None;
    for id in node_ids.iter() {
        let sm = router.get_state_machine_handle(id).await?;
        let applied = sm.applied_commands().await;
        match &reference {
            None => reference = Some(applied),
            Some(r) => assert_eq!(r, &applied, "node {} applied a different sequence of commands", id),
        }
    }
    let reference = reference.expect("at least one node");
    assert_eq!(reference.len(), 10, "all 10 writes should have been applied");
    for (i, (_, cmd)) in reference.iter().enumerate() {
        assert_eq!(cmd, &format!("cmd-{}", i));
    }

    Ok(())
}

/// A client write submitted to a follower is rejected with
/// `ForwardToLeader`, never silently accepted.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_to_follower_is_forwarded() -> Result<()> {
    fixtures::init_tracing();

    let config = fixtures::test_config("forward");
    let node_ids: BTreeSet<u64> = btreeset! {0, 1, 2};
    let router = RaftRouter::new_cluster(config, node_ids.clone()).await;

    let leader = loop {
        if let Some(id) = router.leader().await {
            break id;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    };
    let follower = *node_ids.iter().find(|id| **id != leader).unwrap();

    let err = router
        .try_client_write(follower, "should-fail")
        .await
        .expect_err("a write to a follower must be rejected, not silently applied");
    assert!(
        err.to_string().contains("not the leader"),
        "expected a ForwardToLeader rejection, got: {}",
        err
    );

    Ok(())
}
