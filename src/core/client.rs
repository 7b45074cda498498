//! Client-facing request handling (`spec.md` §4.4, data flow for writes; §8,
//! linearizable reads).

use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::raft::ClientReadResponseTx;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::storage::AppStateMachine;
use crate::AppData;
use crate::AppDataResponse;
use crate::RaftNetwork;
use crate::RaftStorage;

use super::RaftCore;
use super::State;

/// A client write awaiting its entry's commitment, keyed in
/// [`RaftCore::awaiting_commit`] by the entry's log index.
pub(crate) struct ClientRequestEntry<R: AppDataResponse> {
    pub tx: ClientWriteResponseTx<R>,
}

impl<D, R, N, S, M> RaftCore<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    pub(super) async fn handle_client_write_request(&mut self, rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<R>) {
        if self.role != State::Leader {
            let _ = tx.send(Err(ClientWriteError::ForwardToLeader { leader_id: self.current_leader }));
            return;
        }

        let entry = self.log.append_leader_entry(self.current_term, rpc.payload);
        if let Err(e) = self.storage.append_log(std::slice::from_ref(&entry)).await {
            let err = self.map_fatal_storage_error(e);
            let _ = tx.send(Err(ClientWriteError::RaftError(err)));
            return;
        }

        self.awaiting_commit.insert(entry.index, ClientRequestEntry { tx });
        self.replicate_to_all_peers().await;
        // Mirrors run_leader's blank-entry commit: with zero peers this
        // entry's own index is already a majority, so don't wait for a
        // ReplicaEvent that a peerless leader will never receive.
        self.advance_commit_index().await;
    }

    pub(super) async fn handle_client_read_request(&mut self, tx: ClientReadResponseTx) {
        if self.role != State::Leader {
            let _ = tx.send(Err(ClientReadError::ForwardToLeader { leader_id: self.current_leader }));
            return;
        }
        match self.confirm_leadership().await {
            Ok(true) => {
                let _ = tx.send(Ok(()));
            }
            Ok(false) => {
                let _ = tx.send(Err(ClientReadError::RaftError(RaftError::Timeout)));
            }
            Err(e) => {
                let _ = tx.send(Err(ClientReadError::RaftError(e)));
            }
        }
    }

    /// Apply every committed-but-not-yet-applied entry to the state machine,
    /// in increasing index order (`spec.md` §4.4), resolving any waiting
    /// client write whose entry becomes applied and triggering a snapshot if
    /// the configured policy now calls for one.
    pub(super) async fn apply_committed(&mut self) {
        while self.last_applied < self.commit_index {
            let next_index = self.last_applied + 1;
            let entry = self.log.slice(next_index).into_iter().find(|e| e.index == next_index).cloned();
            let entry = match entry {
                Some(e) => e,
                None => {
                    tracing::error!(id = self.id, next_index, "commit_index advanced past an entry not present in the log");
                    break;
                }
            };

            let result = match &entry.payload {
                crate::log::EntryPayload::Blank => Ok(None),
                crate::log::EntryPayload::Normal(command) => {
                    self.state_machine.apply(entry.index, command).await.map(Some)
                }
            };

            self.last_applied = entry.index;
            self.entries_applied_since_snapshot += 1;

            if let Some(waiter) = self.awaiting_commit.remove(&entry.index) {
                let response = match result {
                    Ok(Some(data)) => Ok(crate::raft::ClientWriteResponse { index: entry.index, data }),
                    Ok(None) => {
                        tracing::error!(id = self.id, index = entry.index, "a blank entry cannot have been awaited by a client");
                        continue;
                    }
                    Err(e) => Err(ClientWriteError::RaftError(RaftError::StorageError(e))),
                };
                let _ = waiter.tx.send(response);
            } else if let Err(e) = result {
                tracing::error!(id = self.id, index = entry.index, error = %e, "error applying committed entry");
            }
        }

        self.report_metrics(crate::Update::Ignore);

        if self.role == State::Leader && self.should_compact() {
            self.compact_log().await;
        }
    }

    async fn compact_log(&mut self) {
        if self.last_applied == 0 {
            return;
        }
        match crate::snapshot::SnapshotManager::create_snapshot(
            self.storage.as_ref(),
            self.state_machine.as_ref(),
            &mut self.log,
            self.last_applied,
            self.config.snapshot_compress,
        )
        .await
        {
            Ok(meta) => {
                self.snapshot_last_included_index = meta.last_included_index;
                self.snapshot_last_included_term = meta.last_included_term;
                self.entries_applied_since_snapshot = 0;
            }
            Err(e) => tracing::error!(id = self.id, error = %e, "failed to create snapshot"),
        }
    }
}
