//! The leader run loop (`spec.md` §4.4): heartbeats, the Peer Coordinator
//! fan-out, commit-index advancement, and the linearizable-read quorum check.

use std::sync::Arc;

use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::error::RaftError;
use crate::log::EntryPayload;
use crate::log::LogEntry;
use crate::metrics::LeaderMetrics;
use crate::metrics::ReplicationMetrics;
use crate::raft::AppendEntriesRequest;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::storage::AppStateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::LogId;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;
use crate::Update;

use super::RaftCore;
use super::State;

impl<D, R, N, S, M> RaftCore<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id, term = self.current_term))]
    pub(super) async fn run_leader(&mut self) -> anyhow::Result<()> {
        // A new leader commits a blank entry in its own term before serving
        // reads or acking old-term entries as committed (spec.md §4.4, the
        // classic Raft figure 8 safety argument).
        let blank = self.log.append_leader_entry(self.current_term, EntryPayload::Blank);
        if let Err(e) = self.storage.append_log(std::slice::from_ref(&blank)).await {
            self.map_fatal_storage_error(e);
            return Ok(());
        }
        self.replicate_to_all_peers().await;
        // A leader with no peers is its own majority and must commit and
        // apply the blank entry immediately, not wait for a ReplicaEvent
        // that will never arrive (spec.md §8, single-node cluster).
        self.advance_commit_index().await;

        let heartbeat_interval = Duration::from_millis(self.config.heartbeat_interval);
        let mut next_heartbeat = Instant::now() + heartbeat_interval;

        loop {
            if self.role != State::Leader {
                self.teardown_leader_state();
                return Ok(());
            }

            let heartbeat_sleep = tokio::time::sleep_until(next_heartbeat);
            tokio::select! {
                _ = heartbeat_sleep => {
                    next_heartbeat = Instant::now() + heartbeat_interval;
                    self.replicate_to_all_peers().await;
                }
                Some(event) = self.recv_replica_event() => {
                    self.handle_replica_event(event).await?;
                }
                Some((msg, span)) = self.rx_api.recv() => {
                    self.handle_rpc_msg(msg).instrument(span).await;
                }
                Ok(_) = &mut self.rx_shutdown => {
                    self.role = State::Shutdown;
                    self.teardown_leader_state();
                    return Ok(());
                }
            }
        }
    }

    async fn recv_replica_event(&mut self) -> Option<ReplicaEvent> {
        match self.rx_replica_events.as_mut() {
            Some(rx) => rx.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn handle_replica_event(&mut self, event: ReplicaEvent) -> anyhow::Result<()> {
        match event {
            ReplicaEvent::Updated { target, match_index } => {
                self.match_index.insert(target, match_index);
                self.next_index.insert(target, match_index + 1);
                self.advance_commit_index().await;
            }
            ReplicaEvent::Rejected { target, conflict_index, .. } => {
                self.next_index.insert(target, conflict_index.max(1));
            }
            ReplicaEvent::HigherTerm { term, .. } => {
                self.teardown_leader_state();
                self.update_current_term(term, None);
                self.role = State::Follower;
                self.save_hard_state().await.map_err(anyhow::Error::from)?;
                self.report_metrics(Update::Update(None));
            }
            ReplicaEvent::Noop => {}
        }
        Ok(())
    }

    /// `spec.md` §4.4: advance `commitIndex` to the highest index held by a
    /// majority of the cluster (the leader included) whose term equals
    /// `currentTerm`, then apply newly committed entries. Also republishes
    /// per-peer replication progress, since this is the one place that
    /// touches every entry in `match_index`.
    ///
    /// Called both when a peer's match index moves (`handle_replica_event`)
    /// and right after the leader appends its own entry, so a single-node
    /// cluster — where `match_index` is empty and no `ReplicaEvent` will
    /// ever arrive — still commits against its own `lastLogIndex` (`spec.md`
    /// §8).
    pub(super) async fn advance_commit_index(&mut self) {
        let replication = self
            .match_index
            .iter()
            .map(|(&peer, &matched)| {
                let term = self.log.term_at(matched).unwrap_or(0);
                (peer, ReplicationMetrics { matched: LogId::new(term, matched) })
            })
            .collect();
        self.report_metrics(Update::Update(Some(LeaderMetrics { replication })));

        let mut indices: Vec<u64> = self.match_index.values().copied().collect();
        indices.push(self.log.last_index());
        indices.sort_unstable_by(|a, b| b.cmp(a));

        let needed = crate::quorum::majority_of(self.peers.len() + 1);
        if indices.len() < needed {
            return;
        }
        let candidate = indices[needed - 1];
        if candidate > self.commit_index && self.log.term_at(candidate) == Some(self.current_term) {
            self.commit_index = candidate;
            self.apply_committed().await;
        }
    }

    /// Push the latest log suffix (or a snapshot, for peers too far behind)
    /// to every peer. Called on every heartbeat tick and immediately after a
    /// new entry is appended, so client writes don't wait for the next tick.
    pub(super) async fn replicate_to_all_peers(&mut self) {
        let term = self.current_term;
        let commit_index = self.commit_index;
        let targets: Vec<NodeId> = self.replication_streams.keys().copied().collect();

        for target in targets {
            let next_index = *self.next_index.get(&target).unwrap_or(&1);

            if self.log.last_included_index() > 0 && next_index <= self.log.last_included_index() {
                self.send_snapshot_to_peer(target).await;
                continue;
            }

            let prev_log_index = next_index.saturating_sub(1);
            let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
            let mut entries: Vec<LogEntry<D>> = self.log.slice(next_index).into_iter().cloned().collect();
            let max = self.config.max_entries_per_append as usize;
            if entries.len() > max {
                entries.truncate(max);
            }

            if let Some(stream) = self.replication_streams.get(&target) {
                let _ = stream.tx.send(RaftEvent::Replicate {
                    term,
                    prev_log_index,
                    prev_log_term,
                    entries: Arc::new(entries),
                    leader_commit: commit_index,
                });
            }
        }
    }

    async fn send_snapshot_to_peer(&mut self, target: NodeId) {
        let meta = match self.storage.load_snapshot_metadata().await {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(id = self.id, target, error = %e, "failed to load snapshot metadata for InstallSnapshot");
                return;
            }
        };
        let blob = match self.storage.read_snapshot_blob(meta.last_included_index).await {
            Ok(Some(b)) => b,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(id = self.id, target, error = %e, "failed to read snapshot blob for InstallSnapshot");
                return;
            }
        };
        if let Some(stream) = self.replication_streams.get(&target) {
            let _ = stream.tx.send(RaftEvent::InstallSnapshot { term: self.current_term, meta, data: Arc::new(blob) });
        }
    }

    /// `spec.md` §8: confirm leadership against a quorum before serving a
    /// read, so a partitioned ex-leader can't answer with stale data.
    pub(super) async fn confirm_leadership(&mut self) -> Result<bool, RaftError> {
        let term = self.current_term;
        let prev_log_index = self.log.last_index();
        let prev_log_term = self.log.last_term();
        let commit_index = self.commit_index;
        let needed = crate::quorum::majority_of(self.peers.len() + 1);
        let mut acked = 1usize; // the leader counts itself

        if acked >= needed {
            return Ok(true);
        }

        let mut calls = futures::stream::FuturesUnordered::new();
        for peer in self.peers.iter().copied() {
            let network = self.network.clone();
            let rpc = AppendEntriesRequest {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries: vec![],
                leader_commit: commit_index,
            };
            calls.push(async move { network.send_append_entries(peer, rpc).await });
        }

        let timeout = tokio::time::sleep(Duration::from_millis(self.config.rpc_timeout));
        tokio::pin!(timeout);

        loop {
            tokio::select! {
                maybe_res = futures::stream::StreamExt::next(&mut calls) => {
                    match maybe_res {
                        Some(Ok(resp)) if resp.term > term => {
                            self.teardown_leader_state();
                            self.update_current_term(resp.term, None);
                            self.role = State::Follower;
                            self.save_hard_state().await?;
                            self.report_metrics(Update::Update(None));
                            return Ok(false);
                        }
                        Some(Ok(_)) => {
                            acked += 1;
                            if acked >= needed {
                                return Ok(true);
                            }
                        }
                        Some(Err(_)) => {}
                        None => return Ok(false),
                    }
                }
                _ = &mut timeout => return Ok(false),
            }
        }
    }
}
