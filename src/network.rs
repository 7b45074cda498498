//! The RPC Transport collaborator (`spec.md` §6): turns the three Raft RPCs
//! into whatever actually crosses the wire (TCP, gRPC, an in-process router
//! in tests). The core never dials a socket itself; it only calls through
//! this trait.

use async_trait::async_trait;
use anyhow::Result;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// Sends the three Raft RPCs to a named peer and awaits its response.
///
/// Implementations are responsible for their own retry/backoff policy and
/// for enforcing `spec.md`'s `rpcTimeout`; the core treats a returned `Err`
/// the same way regardless of cause (peer unreachable vs. malformed
/// response vs. timeout) — it simply does not advance that peer's state
/// this round and tries again later.
#[async_trait]
pub trait RaftNetwork<D: AppData>: Send + Sync + 'static {
    /// Send an AppendEntries RPC to `target`.
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<D>,
    ) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to `target`.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Send an InstallSnapshot RPC to `target`.
    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}
