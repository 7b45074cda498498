//! Fixtures for testing Raft: an in-process router implementing
//! [`RaftNetwork`] by dispatching directly to other in-process [`Raft`]
//! handles, plus `MemStorage`/`MemStateMachine`-backed node construction.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use raft_core::config::Config;
use raft_core::core::State;
use raft_core::metrics::RaftMetrics;
use raft_core::metrics::Wait;
use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendEntriesResponse;
use raft_core::raft::ClientWriteRequest;
use raft_core::raft::InstallSnapshotRequest;
use raft_core::raft::InstallSnapshotResponse;
use raft_core::raft::VoteRequest;
use raft_core::raft::VoteResponse;
use raft_core::storage::MemStateMachine;
use raft_core::storage::MemStorage;
use raft_core::NodeId;
use raft_core::Raft;
use raft_core::RaftNetwork;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
#[allow(unused_imports)]
use pretty_assertions::assert_ne;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

/// The application command type used by every test in this suite: an opaque
/// label, applied by [`MemStateMachine`] by simply recording it.
pub type TestNode = (MemTestRaft, Arc<MemStorage<String>>, Arc<MemStateMachine<String>>);
pub type MemTestRaft = Raft<String, String, RaftRouter, MemStorage<String>, MemStateMachine<String>>;

/// Initialize the tracing subscriber for test output. Safe to call more than
/// once; later calls are no-ops.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NONE)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// An in-process network transport: routes RPCs directly to other nodes'
/// `Raft` handles rather than over a socket, and can simulate partitions by
/// isolating a node.
pub struct RaftRouter {
    config: Arc<Config>,
    routing_table: RwLock<BTreeMap<NodeId, TestNode>>,
    isolated_nodes: RwLock<HashSet<NodeId>>,
    send_delay: u64,
}

impl RaftRouter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config, routing_table: Default::default(), isolated_nodes: Default::default(), send_delay: 0 }
    }

    pub fn with_send_delay(mut self, ms: u64) -> Self {
        self.send_delay = ms;
        self
    }

    async fn rand_send_delay(&self) {
        if self.send_delay == 0 {
            return;
        }
        let r = rand::random::<u64>() % self.send_delay;
        tokio::time::sleep(Duration::from_millis(r)).await;
    }

    /// Build and register a cluster of `node_ids.len()` nodes, each peered
    /// with every other, and return the router that hosts them.
    pub async fn new_cluster(config: Arc<Config>, node_ids: BTreeSet<NodeId>) -> Arc<Self> {
        let router = Arc::new(Self::new(config));
        for id in node_ids.iter().copied() {
            let peers: BTreeSet<NodeId> = node_ids.iter().copied().filter(|p| *p != id).collect();
            router.new_raft_node(id, peers).await;
        }
        router
    }

    /// Create and register a new Raft node bearing the given ID and peer set.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId, peers: BTreeSet<NodeId>) {
        let storage = Arc::new(MemStorage::<String>::new());
        let state_machine = Arc::new(MemStateMachine::<String>::new());
        let node = Raft::new(id, peers, self.config.clone(), self.clone(), storage.clone(), state_machine.clone());
        self.routing_table.write().await.insert(id, (node, storage, state_machine));
    }

    /// Remove the target node from the routing table.
    pub async fn remove_node(&self, id: NodeId) -> Option<TestNode> {
        let removed = self.routing_table.write().await.remove(&id);
        self.isolated_nodes.write().await.remove(&id);
        removed
    }

    /// Isolate the network of the specified node, so it neither sends nor
    /// receives RPCs until [`Self::restore_node`] is called.
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    pub async fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.remove(&id);
    }

    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        rt.values().map(|(node, _, _)| node.metrics().borrow().clone()).collect()
    }

    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStorage<String>>> {
        let rt = self.routing_table.read().await;
        let entry = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(entry.1.clone())
    }

    pub async fn get_state_machine_handle(&self, node_id: &NodeId) -> Result<Arc<MemStateMachine<String>>> {
        let rt = self.routing_table.read().await;
        let entry = rt.get(node_id).with_context(|| format!("node {} not found in routing table", node_id))?;
        Ok(entry.2.clone())
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(&self, node_ids: &BTreeSet<NodeId>, want_log: u64, msg: &str) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, None).await?.log(want_log, msg).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(&self, node_ids: &BTreeSet<NodeId>, want_state: State, msg: &str) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, None).await?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// The id of the node that every non-isolated metric snapshot agrees is
    /// the leader, or `None` if there is no such agreement yet.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics()
            .await
            .into_iter()
            .find(|m| m.current_leader == Some(m.id) && !isolated.contains(&m.id))
            .map(|m| m.id)
    }

    /// Send a client write request to the target node, panicking on error.
    pub async fn client_write(&self, target: NodeId, payload: impl Into<String>) -> u64 {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node {} not found in routing table", target));
        let resp = node
            .0
            .client_write(ClientWriteRequest::new(payload.into()))
            .await
            .unwrap_or_else(|err| panic!("client_write failed: {}", err));
        resp.index
    }

    pub async fn client_write_many(&self, target: NodeId, prefix: &str, count: usize) {
        for i in 0..count {
            self.client_write(target, format!("{}-{}", prefix, i)).await;
        }
    }

    /// Like [`Self::client_write`], but returns the raw `Result` instead of
    /// panicking, so callers can assert on a `ForwardToLeader` rejection.
    pub async fn try_client_write(
        &self,
        target: NodeId,
        payload: impl Into<String>,
    ) -> Result<raft_core::raft::ClientWriteResponse<String>> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).with_context(|| format!("node {} not found in routing table", target))?;
        node.0.client_write(ClientWriteRequest::new(payload.into())).await.map_err(|e| anyhow!(e.to_string()))
    }

    /// Assert that the cluster has converged on a single leader, with every
    /// non-isolated node agreeing on term and last-applied index.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;
        let non_isolated: Vec<_> = nodes.iter().filter(|n| !isolated.contains(&n.id)).collect();
        let leader = non_isolated
            .iter()
            .find(|n| n.state == State::Leader)
            .unwrap_or_else(|| panic!("expected to find a cluster leader among {:?}", non_isolated));
        let followers: Vec<_> = non_isolated.iter().filter(|n| n.state == State::Follower).collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated.len(),
            "expected exactly one leader and the rest followers, got {} followers of {} nodes",
            followers.len(),
            non_isolated.len(),
        );

        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);

        for node in non_isolated.iter() {
            assert_eq!(node.current_leader, Some(leader.id), "node {} disagrees on the current leader", node.id);
            assert_eq!(node.current_term, expected_term, "node {} has an unexpected term", node.id);
            assert_eq!(node.last_applied, expected_last_log, "node {} has an unexpected last_applied", node.id);
            assert_eq!(node.last_log_index, expected_last_log, "node {} has an unexpected last_log_index", node.id);
        }
    }
}

#[async_trait]
impl RaftNetwork<String> for RaftRouter {
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest<String>) -> Result<AppendEntriesResponse> {
        self.rand_send_delay().await;
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        Ok(node.0.append_entries(rpc).await?)
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        self.rand_send_delay().await;
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        Ok(node.0.vote(rpc).await?)
    }

    async fn send_install_snapshot(&self, target: NodeId, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.rand_send_delay().await;
        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let node = rt.get(&target).ok_or_else(|| anyhow!("target node {} not found in routing table", target))?;
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node {} is isolated", target));
        }
        Ok(node.0.install_snapshot(rpc).await?)
    }
}

pub fn test_config(name: &str) -> Arc<Config> {
    Arc::new(
        Config::build(name.to_string())
            .storage_path(format!("/tmp/raft-core-tests/{}-{}", name, rand::random::<u64>()))
            .election_timeout_min(200)
            .election_timeout_max(400)
            .heartbeat_interval(50)
            .validate()
            .expect("valid test config"),
    )
}
