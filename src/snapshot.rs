//! The Snapshot Manager (`spec.md` §4.3): turns a point-in-time application
//! snapshot into durable storage and compacts the log prefix it supersedes.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::instrument;

use crate::log::Log;
use crate::storage::now_unix_ms;
use crate::storage::AppStateMachine;
use crate::storage::RaftStorage;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;

/// The on-the-wire shape of a snapshot blob: the application's opaque state
/// bytes wrapped with the metadata needed to validate and apply it.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEnvelope {
    last_included_index: u64,
    last_included_term: u64,
    created_at_unix_ms: u128,
    app_state: Vec<u8>,
}

/// Coordinates `RaftStorage`, `Log`, and `AppStateMachine` to create and
/// restore snapshots. Holds no state of its own; every call reads whatever
/// it needs fresh from its collaborators.
pub struct SnapshotManager;

impl SnapshotManager {
    /// `spec.md` §4.3 `createSnapshot(lastIncludedIndex, applicationState,
    /// compress)`.
    #[instrument(level = "debug", skip(storage, state_machine, log))]
    pub async fn create_snapshot<D, R, S, M>(
        storage: &S,
        state_machine: &M,
        log: &mut Log<D>,
        last_included_index: u64,
        compress: bool,
    ) -> Result<SnapshotMeta>
    where
        D: AppData,
        R: AppDataResponse,
        S: RaftStorage<D>,
        M: AppStateMachine<D, R>,
    {
        if last_included_index < 1 || last_included_index > log.last_index() {
            bail!(
                "invalid snapshot index {}: must be in [1, {}]",
                last_included_index,
                log.last_index()
            );
        }
        let last_included_term = log
            .term_at(last_included_index)
            .context("resolving term for snapshot index")?;

        let app_state = state_machine.build_snapshot().await.context("building application snapshot")?;
        let envelope = SnapshotEnvelope {
            last_included_index,
            last_included_term,
            created_at_unix_ms: now_unix_ms(),
            app_state,
        };
        let bytes = bincode::serialize(&envelope).context("serializing snapshot envelope")?;

        // Blob must be durable before metadata is written, and metadata
        // before the log prefix is discarded (spec.md §4.3 failure
        // semantics: a half-written blob is never pointed to by metadata).
        storage
            .write_snapshot_blob(last_included_index, &bytes, compress)
            .await
            .context("writing snapshot blob")?;

        let meta = SnapshotMeta {
            last_included_index,
            last_included_term,
            created_at_unix_ms: envelope.created_at_unix_ms,
        };
        storage.save_snapshot_metadata(&meta).await.context("writing snapshot metadata")?;

        storage.truncate_log_prefix(last_included_index).await.context("truncating log prefix")?;
        log.truncate_prefix(last_included_index, last_included_term);

        tracing::info!(last_included_index, last_included_term, compress, "created snapshot");
        Ok(meta)
    }

    /// `spec.md` §4.3 `restore()` at boot: apply the latest snapshot (if
    /// any) to the state machine and report the `(lastApplied, commitIndex
    /// floor)` the caller should adopt. Remaining log entries are replayed
    /// by the caller through the normal apply path, not here.
    #[instrument(level = "debug", skip(storage, state_machine))]
    pub async fn restore<D, R, S, M>(storage: &S, state_machine: &M) -> Result<Option<RestoredSnapshot>>
    where
        D: AppData,
        R: AppDataResponse,
        S: RaftStorage<D>,
        M: AppStateMachine<D, R>,
    {
        let meta = match storage.load_snapshot_metadata().await.context("loading snapshot metadata")? {
            Some(m) => m,
            None => return Ok(None),
        };

        let blob = match storage
            .read_snapshot_blob(meta.last_included_index)
            .await
            .context("reading snapshot blob")?
        {
            Some(b) => b,
            // Metadata present but blob missing/unreadable: treated as no
            // snapshot, per spec.md §4.3 failure semantics.
            None => {
                tracing::warn!(index = meta.last_included_index, "snapshot metadata present but blob missing; ignoring");
                return Ok(None);
            }
        };

        let envelope: SnapshotEnvelope = match bincode::deserialize(&blob) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(index = meta.last_included_index, error = %e, "snapshot blob failed to deserialize; ignoring");
                return Ok(None);
            }
        };

        state_machine
            .restore_from_snapshot(&envelope.app_state)
            .await
            .context("restoring application state from snapshot")?;

        Ok(Some(RestoredSnapshot {
            last_included_index: envelope.last_included_index,
            last_included_term: envelope.last_included_term,
        }))
    }
}

/// What [`SnapshotManager::restore`] found and applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RestoredSnapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
}
