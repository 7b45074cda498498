//! The Peer Coordinator (`spec.md` §4.5): one task per peer, responsible for
//! sending that peer's AppendEntries/InstallSnapshot RPCs and reporting
//! progress back to [`crate::core::RaftCore`].
//!
//! The core remains the single owner of the in-memory log and of
//! `nextIndex`/`matchIndex`; each replication task is handed exactly the
//! entries to send on a given round (computed by the core from its own
//! `Log`) rather than reading storage itself, so there is never a question
//! of which side's view of `nextIndex` is authoritative.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::log::LogEntry;
use crate::raft::AppendEntriesRequest;
use crate::raft::InstallSnapshotRequest;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::NodeId;
use crate::RaftNetwork;

/// Sent by the core to a peer's replication task.
pub(crate) enum RaftEvent<D: AppData> {
    /// Replicate `entries` (possibly empty, i.e. a heartbeat) following
    /// `prev_log_index`/`prev_log_term`.
    Replicate {
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Arc<Vec<LogEntry<D>>>,
        leader_commit: u64,
    },
    /// Send a snapshot blob instead of a log suffix, because `nextIndex` for
    /// this peer has fallen at or below `lastIncludedIndex`
    /// (`spec.md` §4.5).
    InstallSnapshot { term: u64, meta: SnapshotMeta, data: Arc<Vec<u8>> },
    Terminate,
}

/// Sent by a peer's replication task back to the core.
pub(crate) enum ReplicaEvent {
    /// The peer accepted entries through `prev_log_index + entries sent`.
    Updated { target: NodeId, match_index: u64 },
    /// The peer rejected the request; `conflict_index`/`conflict_term` are
    /// the back-off hint if the peer supplied one.
    Rejected { target: NodeId, conflict_index: u64, conflict_term: u64 },
    /// The peer reported a higher term; the leader must step down.
    HigherTerm { target: NodeId, term: u64 },
    /// The RPC could not be completed (timeout, transport error); no
    /// progress was made this round.
    Noop,
}

/// A handle to a spawned per-peer replication task.
pub(crate) struct ReplicationStream<D: AppData> {
    pub tx: mpsc::UnboundedSender<RaftEvent<D>>,
    pub handle: JoinHandle<()>,
}

impl<D: AppData> ReplicationStream<D> {
    pub(crate) fn spawn<N: RaftNetwork<D>>(
        leader_id: NodeId,
        target: NodeId,
        network: Arc<N>,
        tx_events: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = ReplicationCore { leader_id, target, network, rx, tx_events };
        let handle = tokio::spawn(core.run().instrument(tracing::debug_span!("replication", target)));
        Self { tx, handle }
    }
}

struct ReplicationCore<D: AppData, N: RaftNetwork<D>> {
    leader_id: NodeId,
    target: NodeId,
    network: Arc<N>,
    rx: mpsc::UnboundedReceiver<RaftEvent<D>>,
    tx_events: mpsc::UnboundedSender<ReplicaEvent>,
}

impl<D: AppData, N: RaftNetwork<D>> ReplicationCore<D, N> {
    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                RaftEvent::Replicate { term, prev_log_index, prev_log_term, entries, leader_commit } => {
                    self.send_append_entries(term, prev_log_index, prev_log_term, entries, leader_commit).await;
                }
                RaftEvent::InstallSnapshot { term, meta, data } => {
                    self.send_install_snapshot(term, meta, data).await;
                }
                RaftEvent::Terminate => return,
            }
        }
    }

    async fn send_append_entries(
        &mut self,
        term: u64,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Arc<Vec<LogEntry<D>>>,
        leader_commit: u64,
    ) {
        let rpc = AppendEntriesRequest {
            term,
            leader_id: self.leader_id,
            prev_log_index,
            prev_log_term,
            entries: entries.as_ref().clone(),
            leader_commit,
        };
        let n_sent = rpc.entries.len() as u64;

        let res = self.network.send_append_entries(self.target, rpc).await;
        let event = match res {
            Ok(resp) if resp.term > term => ReplicaEvent::HigherTerm { target: self.target, term: resp.term },
            Ok(resp) if resp.success => {
                ReplicaEvent::Updated { target: self.target, match_index: prev_log_index + n_sent }
            }
            Ok(resp) => match resp.conflict_opt {
                Some(c) => ReplicaEvent::Rejected { target: self.target, conflict_index: c.conflict_index, conflict_term: c.conflict_term },
                None => ReplicaEvent::Rejected { target: self.target, conflict_index: prev_log_index.saturating_sub(1).max(1), conflict_term: 0 },
            },
            Err(err) => {
                tracing::warn!(target = self.target, error = %err, "append_entries RPC failed");
                ReplicaEvent::Noop
            }
        };

        if self.tx_events.send(event).is_err() {
            tracing::debug!(target = self.target, "core dropped replication event channel");
        }
    }

    async fn send_install_snapshot(&mut self, term: u64, meta: SnapshotMeta, data: Arc<Vec<u8>>) {
        let rpc = InstallSnapshotRequest {
            term,
            leader_id: self.leader_id,
            meta: meta.clone(),
            offset: 0,
            data: data.as_ref().clone(),
            done: true,
        };

        let res = self.network.send_install_snapshot(self.target, rpc).await;
        let event = match res {
            Ok(resp) if resp.term > term => ReplicaEvent::HigherTerm { target: self.target, term: resp.term },
            Ok(_) => ReplicaEvent::Updated { target: self.target, match_index: meta.last_included_index },
            Err(err) => {
                tracing::warn!(target = self.target, error = %err, "install_snapshot RPC failed");
                ReplicaEvent::Noop
            }
        };

        if self.tx_events.send(event).is_err() {
            tracing::debug!(target = self.target, "core dropped replication event channel");
        }
    }
}
