//! Error kinds for the Raft core (`spec.md` §7).

use thiserror::Error;

use crate::NodeId;

/// Errors returned while building a [`crate::Config`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("storage_path is required")]
    MissingStoragePath,
    #[error("election_timeout_min ({min}) must be less than election_timeout_max ({max})")]
    InvalidTimeoutRange { min: u64, max: u64 },
    #[error("election_timeout_max ({max}) must be at least twice election_timeout_min ({min})")]
    ElectionTimeoutSpreadTooNarrow { min: u64, max: u64 },
    #[error("heartbeat_interval ({heartbeat_interval}) is too close to election_timeout_min ({election_timeout_min}); a heartbeat must fit at least twice inside a timeout window")]
    HeartbeatTooSlow { heartbeat_interval: u64, election_timeout_min: u64 },
}

/// The five error kinds named in `spec.md` §7.
///
/// `HigherTermObserved` is carried here as a data-bearing variant for callers
/// that need to report it, even though internally the core treats observing
/// a higher term as a control-flow signal (a step-down), not a failure.
#[derive(Debug, Error)]
pub enum RaftError {
    /// The durable store could not complete an operation (disk I/O failure,
    /// corruption detected on read, serialization failure).
    #[error("storage error: {0}")]
    StorageError(#[source] anyhow::Error),

    /// An invariant that durable state is assumed to uphold was violated
    /// (e.g. a persisted log with a gap, or a commit index beyond the last
    /// log entry).
    #[error("consistency error: {0}")]
    ConsistencyError(String),

    /// A caller supplied an argument that violates a documented precondition
    /// (e.g. an RPC referencing a node id that isn't a configured peer).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A peer (or this node, on recovery) reported a higher term than the
    /// caller's view of the world.
    #[error("higher term observed: {higher_term} (was {observed_from_term})")]
    HigherTermObserved { higher_term: u64, observed_from_term: u64 },

    /// An operation did not complete within its allotted time (an RPC, or a
    /// quorum-confirmation round for a linearizable read).
    #[error("operation timed out")]
    Timeout,

    /// The node is shutting down and cannot service the request.
    #[error("raft node is shutting down")]
    ShuttingDown,
}

impl From<ConfigError> for RaftError {
    fn from(e: ConfigError) -> Self {
        RaftError::InvalidArgument(e.to_string())
    }
}

/// Error returned by [`crate::raft::Raft::client_write`].
#[derive(Debug, Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    /// This node is not the leader; if known, the current leader is included
    /// so the caller can redirect its request.
    #[error("node is not the leader; current leader: {leader_id:?}")]
    ForwardToLeader { leader_id: Option<NodeId> },
}

/// Error returned by [`crate::raft::Raft::client_read`].
#[derive(Debug, Error)]
pub enum ClientReadError {
    #[error(transparent)]
    RaftError(#[from] RaftError),

    #[error("node is not the leader; current leader: {leader_id:?}")]
    ForwardToLeader { leader_id: Option<NodeId> },
}

/// Error produced when the RPC transport collaborator cannot reach a peer
/// or the peer's response cannot be interpreted.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("timed out waiting for a response from node {target}")]
    Timeout { target: NodeId },

    #[error("transport error contacting node {target}: {source}")]
    Transport { target: NodeId, #[source] source: anyhow::Error },
}
