//! The Role State Machine (`spec.md` §4.4): term monotonicity, election and
//! heartbeat timers, the follower/candidate/leader run loops, and the glue
//! that ties the Log, Durable Store, Snapshot Manager, and Peer Coordinator
//! together.

mod client;
mod install_snapshot;
mod leader;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::SnapshotPolicy;
use crate::error::RaftError;
use crate::log::Log;
use crate::metrics::RaftMetrics;
use crate::raft::AppendEntriesResponse;
use crate::raft::ConflictOpt;
use crate::raft::RaftMsg;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::snapshot::SnapshotManager;
use crate::storage::AppStateMachine;
use crate::storage::HardState;
use crate::AppData;
use crate::AppDataResponse;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

pub(crate) use client::ClientRequestEntry;

/// The role a node currently occupies (`spec.md` §3, Role).
///
/// No `NonVoter` or joint-consensus intermediate states: this implementation
/// has no runtime membership-change API, so every node is always either
/// participating fully or shutting down.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
    Shutdown,
}

impl Default for State {
    fn default() -> Self {
        State::Follower
    }
}

/// The core type implementing the Raft protocol.
pub struct RaftCore<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    id: NodeId,
    peers: BTreeSet<NodeId>,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,
    state_machine: Arc<M>,

    role: State,
    log: Log<D>,
    current_term: u64,
    voted_for: Option<NodeId>,
    current_leader: Option<NodeId>,

    commit_index: u64,
    last_applied: u64,

    snapshot_last_included_index: u64,
    snapshot_last_included_term: u64,
    entries_applied_since_snapshot: u64,

    last_heartbeat: Option<Instant>,
    next_election_timeout: Option<Instant>,

    /// Client writes awaiting their entry's commitment, keyed by log index.
    awaiting_commit: std::collections::BTreeMap<u64, ClientRequestEntry<R>>,

    /// Per-peer replication tasks, live only while `role == State::Leader`.
    replication_streams: std::collections::BTreeMap<NodeId, ReplicationStream<D>>,
    /// The leader's view of each peer's next entry to send / highest known
    /// matched index (`spec.md` §4.4, `nextIndex[]`/`matchIndex[]`). Reset on
    /// every transition into `State::Leader`.
    next_index: std::collections::BTreeMap<NodeId, u64>,
    match_index: std::collections::BTreeMap<NodeId, u64>,
    /// Receives [`ReplicaEvent`]s from every spawned replication task; `None`
    /// outside of `State::Leader`.
    rx_replica_events: Option<mpsc::UnboundedReceiver<ReplicaEvent>>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<D, R, N, S, M> RaftCore<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        peers: BTreeSet<NodeId>,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        state_machine: Arc<M>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<D, R>, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<anyhow::Result<()>> {
        let this = Self {
            id,
            peers,
            config,
            network,
            storage,
            state_machine,
            role: State::Follower,
            log: Log::new(),
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: 0,
            last_applied: 0,
            snapshot_last_included_index: 0,
            snapshot_last_included_term: 0,
            entries_applied_since_snapshot: 0,
            last_heartbeat: None,
            next_election_timeout: None,
            awaiting_commit: Default::default(),
            replication_streams: Default::default(),
            next_index: Default::default(),
            match_index: Default::default(),
            rx_replica_events: None,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop: load durable state, then dispatch to the run loop of
    /// whichever role is current until shutdown.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, cluster = %self.config.cluster_name))]
    async fn main(mut self) -> anyhow::Result<()> {
        tracing::debug!("raft node is initializing");

        if let Some(hs) = self.storage.load_term_and_vote().await.map_err(|e| self.map_fatal_storage_error(e))? {
            self.current_term = hs.current_term;
            self.voted_for = hs.voted_for;
        }

        let restored = SnapshotManager::restore(self.storage.as_ref(), self.state_machine.as_ref())
            .await
            .map_err(|e| self.map_fatal_storage_error(e))?;
        let (last_included_index, last_included_term) = match restored {
            Some(r) => (r.last_included_index, r.last_included_term),
            None => (0, 0),
        };
        self.snapshot_last_included_index = last_included_index;
        self.snapshot_last_included_term = last_included_term;
        self.last_applied = last_included_index;

        let persisted_log = self.storage.load_log().await.map_err(|e| self.map_fatal_storage_error(e))?;
        self.log = Log::restore(persisted_log, last_included_index, last_included_term);
        self.commit_index = self.commit_index.max(last_included_index);

        self.update_next_election_timeout(false);
        self.report_metrics(Update::Ignore);

        loop {
            match self.role {
                State::Follower => self.run_follower().await?,
                State::Candidate => self.run_candidate().await?,
                State::Leader => self.run_leader().await?,
                State::Shutdown => {
                    tracing::info!(id = self.id, "raft node has shut down");
                    return Ok(());
                }
            }
        }
    }

    // --- Follower -----------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    async fn run_follower(&mut self) -> anyhow::Result<()> {
        loop {
            if self.role != State::Follower {
                return Ok(());
            }
            let election_timeout = tokio::time::sleep_until(self.get_next_election_timeout());
            tokio::select! {
                _ = election_timeout => {
                    tracing::debug!(id = self.id, "election timeout elapsed, becoming candidate");
                    self.role = State::Candidate;
                    return Ok(());
                }
                Some((msg, span)) = self.rx_api.recv() => {
                    self.handle_rpc_msg(msg).instrument(span).await;
                }
                Ok(_) = &mut self.rx_shutdown => {
                    self.role = State::Shutdown;
                    return Ok(());
                }
            }
        }
    }

    // --- Candidate ------------------------------------------------------

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    async fn run_candidate(&mut self) -> anyhow::Result<()> {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.current_leader = None;
        self.save_hard_state().await?;
        self.update_next_election_timeout(false);
        self.report_metrics(Update::Ignore);

        tracing::info!(id = self.id, term = self.current_term, "starting election");

        let rpc = VoteRequest::new(self.current_term, self.id, self.log.last_index(), self.log.last_term());
        let term_started = self.current_term;

        let mut votes = futures::stream::FuturesUnordered::new();
        for peer in self.peers.iter().copied() {
            let network = self.network.clone();
            let rpc = rpc.clone();
            votes.push(async move { (peer, network.send_vote(peer, rpc).await) });
        }

        let needed = crate::quorum::majority_of(self.peers.len() + 1);
        let mut granted = 1usize; // vote for self
        if granted >= needed {
            self.become_leader();
            return Ok(());
        }

        loop {
            if self.role != State::Candidate || self.current_term != term_started {
                return Ok(());
            }
            let election_timeout = tokio::time::sleep_until(self.get_next_election_timeout());
            tokio::select! {
                Some((peer, res)) = futures::stream::StreamExt::next(&mut votes) => {
                    match res {
                        Ok(VoteResponse { term, .. }) if term > self.current_term => {
                            self.update_current_term(term, None);
                            self.role = State::Follower;
                            self.save_hard_state().await?;
                            self.report_metrics(Update::Ignore);
                            return Ok(());
                        }
                        Ok(VoteResponse { vote_granted, .. }) if vote_granted => {
                            granted += 1;
                            if granted >= needed {
                                self.become_leader();
                                return Ok(());
                            }
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(id = self.id, peer, error = %err, "vote RPC failed"),
                    }
                }
                _ = election_timeout => {
                    tracing::debug!(id = self.id, "election timed out with no winner, starting new term");
                    return Ok(());
                }
                Some((msg, span)) = self.rx_api.recv() => {
                    self.handle_rpc_msg(msg).instrument(span).await;
                }
                Ok(_) = &mut self.rx_shutdown => {
                    self.role = State::Shutdown;
                    return Ok(());
                }
            }
        }
    }

    fn become_leader(&mut self) {
        tracing::info!(id = self.id, term = self.current_term, "won election, becoming leader");
        self.role = State::Leader;
        self.current_leader = Some(self.id);
        self.update_next_election_timeout(true);

        let (tx_events, rx_events) = mpsc::unbounded_channel();
        for peer in self.peers.iter().copied() {
            let stream = ReplicationStream::spawn(self.id, peer, self.network.clone(), tx_events.clone());
            self.replication_streams.insert(peer, stream);
            self.next_index.insert(peer, self.log.last_index() + 1);
            self.match_index.insert(peer, 0);
        }
        self.rx_replica_events = Some(rx_events);
        self.report_metrics(Update::Ignore);
    }

    /// Tear down all per-peer replication tasks and leader-only bookkeeping.
    /// Safe to call even if this node never became leader (no-op).
    fn teardown_leader_state(&mut self) {
        for (_, stream) in self.replication_streams.iter() {
            let _ = stream.tx.send(crate::replication::RaftEvent::Terminate);
        }
        self.replication_streams.clear();
        self.next_index.clear();
        self.match_index.clear();
        self.rx_replica_events = None;
    }

    // --- Shared RPC dispatch --------------------------------------------

    async fn handle_rpc_msg(&mut self, msg: RaftMsg<D, R>) {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let res = self.handle_append_entries_request(rpc).await;
                let _ = tx.send(Ok(res));
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let res = self.handle_vote_request(rpc).await;
                let _ = tx.send(Ok(res));
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let res = self.handle_install_snapshot_request(rpc).await;
                let _ = tx.send(res);
            }
            RaftMsg::ClientWriteRequest { rpc, tx } => {
                self.handle_client_write_request(rpc, tx).await;
            }
            RaftMsg::ClientReadRequest { tx } => {
                self.handle_client_read_request(tx).await;
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, rpc))]
    async fn handle_vote_request(&mut self, rpc: VoteRequest) -> VoteResponse {
        if rpc.term < self.current_term {
            return VoteResponse { term: self.current_term, vote_granted: false };
        }
        if rpc.term > self.current_term {
            if self.role == State::Leader {
                self.teardown_leader_state();
            }
            self.update_current_term(rpc.term, None);
            self.role = State::Follower;
            if let Err(e) = self.save_hard_state().await {
                tracing::error!(error = %e, "failed to persist term on higher-term vote request");
                return VoteResponse { term: self.current_term, vote_granted: false };
            }
            self.report_metrics(Update::Update(None));
        }

        let candidate_up_to_date =
            (rpc.last_log_term, rpc.last_log_index) >= (self.log.last_term(), self.log.last_index());
        let can_vote = matches!(self.voted_for, None) || self.voted_for == Some(rpc.candidate_id);

        if can_vote && candidate_up_to_date {
            self.voted_for = Some(rpc.candidate_id);
            if let Err(e) = self.save_hard_state().await {
                tracing::error!(error = %e, "failed to persist vote grant");
                return VoteResponse { term: self.current_term, vote_granted: false };
            }
            self.update_next_election_timeout(false);
            VoteResponse { term: self.current_term, vote_granted: true }
        } else {
            VoteResponse { term: self.current_term, vote_granted: false }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %crate::MessageSummary::summary(&rpc)))]
    async fn handle_append_entries_request(&mut self, rpc: crate::raft::AppendEntriesRequest<D>) -> AppendEntriesResponse {
        if rpc.term < self.current_term {
            return AppendEntriesResponse { term: self.current_term, success: false, conflict_opt: None };
        }

        if rpc.term > self.current_term || self.role == State::Candidate {
            if self.role == State::Leader {
                self.teardown_leader_state();
            }
            self.update_current_term(rpc.term, None);
            self.role = State::Follower;
            if let Err(e) = self.save_hard_state().await {
                tracing::error!(error = %e, "failed to persist term on append_entries");
                return AppendEntriesResponse { term: self.current_term, success: false, conflict_opt: None };
            }
            self.report_metrics(Update::Update(None));
        }

        self.current_leader = Some(rpc.leader_id);
        self.update_next_election_timeout(true);

        let result = self.log.append_from_leader(rpc.prev_log_index, rpc.prev_log_term, rpc.entries);
        match result {
            crate::log::AppendResult::Accepted { last_new_index } => {
                // A conflicting suffix may have been truncated in-memory
                // above, so the persisted log is rewritten wholesale rather
                // than blindly appended to, to avoid ever persisting a
                // duplicate or since-overwritten entry.
                let full: Vec<_> = self.log.all_entries().cloned().collect();
                if let Err(e) = self.storage.save_log(&full).await {
                    tracing::error!(error = %e, "failed to persist appended entries");
                    return AppendEntriesResponse { term: self.current_term, success: false, conflict_opt: None };
                }
                if rpc.leader_commit > self.commit_index {
                    self.commit_index = rpc.leader_commit.min(last_new_index);
                    self.apply_committed().await;
                }
                AppendEntriesResponse { term: self.current_term, success: true, conflict_opt: None }
            }
            crate::log::AppendResult::Rejected { conflict_index, conflict_term } => AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_opt: Some(ConflictOpt { conflict_index, conflict_term }),
            },
        }
    }

    // --- Shared helpers --------------------------------------------------

    fn report_metrics(&mut self, leader_metrics: Update<Option<crate::metrics::LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v,
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.role,
            current_term: self.current_term,
            last_log_index: self.log.last_index(),
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            leader_metrics,
        });
        if let Err(err) = res {
            tracing::error!(error = %err, id = self.id, "error reporting metrics");
        }
    }

    async fn save_hard_state(&mut self) -> Result<(), RaftError> {
        let hs = HardState { current_term: self.current_term, voted_for: self.voted_for };
        self.storage.save_term_and_vote(hs.current_term, hs.voted_for).await.map_err(|e| self.map_fatal_storage_error(e))
    }

    fn get_next_election_timeout(&mut self) -> Instant {
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();
        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!(error = ?err, id = self.id, "fatal storage error, shutting down");
        self.role = State::Shutdown;
        RaftError::StorageError(err)
    }

    /// Check whether a new snapshot should be triggered, per the configured
    /// [`SnapshotPolicy`] (`spec.md` §4.3, triggered "on explicit request or
    /// on log-size threshold").
    fn should_compact(&self) -> bool {
        match self.config.snapshot_policy {
            SnapshotPolicy::Never => false,
            SnapshotPolicy::EntriesSinceLast(threshold) => self.entries_applied_since_snapshot >= threshold,
        }
    }
}
