//! Handling of inbound InstallSnapshot RPCs (`spec.md` §4.3, §4.5): a
//! follower too far behind for log replication to catch up receives a
//! complete application snapshot instead.

use crate::error::RaftError;
use crate::log::Log;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::storage::AppStateMachine;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

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
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        if rpc.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        if rpc.term > self.current_term || self.role == State::Candidate {
            if self.role == State::Leader {
                self.teardown_leader_state();
            }
            self.update_current_term(rpc.term, None);
            self.role = State::Follower;
            self.save_hard_state().await?;
        }
        self.current_leader = Some(rpc.leader_id);
        self.update_next_election_timeout(true);

        if rpc.meta.last_included_index <= self.snapshot_last_included_index {
            // Stale snapshot (already applied an equal-or-newer one); ack
            // without redoing any work.
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }

        // `rpc.data` is the exact byte stream the leader read back from its
        // own durable store via `read_snapshot_blob`, which already
        // transparently decompresses; the wire payload is therefore always
        // the uncompressed snapshot envelope, and this node re-compresses it
        // (if configured to) purely for its own on-disk representation.
        self.storage
            .write_snapshot_blob(rpc.meta.last_included_index, &rpc.data, self.config.snapshot_compress)
            .await
            .map_err(RaftError::StorageError)?;
        self.storage.save_snapshot_metadata(&rpc.meta).await.map_err(RaftError::StorageError)?;

        self.state_machine.restore_from_snapshot(&rpc.data).await.map_err(RaftError::StorageError)?;

        self.apply_snapshot_boundary(&rpc.meta).await?;

        Ok(InstallSnapshotResponse { term: self.current_term })
    }

    /// Bring the in-memory [`Log`] and commit/apply counters in line with a
    /// newly-installed snapshot, replacing the log outright if it predates
    /// the snapshot or merely compacting its prefix otherwise.
    async fn apply_snapshot_boundary(&mut self, meta: &SnapshotMeta) -> Result<(), RaftError> {
        if self.log.last_index() < meta.last_included_index {
            self.storage.save_log(&[]).await.map_err(RaftError::StorageError)?;
            self.log = Log::restore(Vec::new(), meta.last_included_index, meta.last_included_term);
        } else {
            self.storage.truncate_log_prefix(meta.last_included_index).await.map_err(RaftError::StorageError)?;
            self.log.truncate_prefix(meta.last_included_index, meta.last_included_term);
        }

        self.snapshot_last_included_index = meta.last_included_index;
        self.snapshot_last_included_term = meta.last_included_term;
        self.commit_index = self.commit_index.max(meta.last_included_index);
        self.last_applied = self.last_applied.max(meta.last_included_index);
        self.entries_applied_since_snapshot = 0;
        Ok(())
    }
}
