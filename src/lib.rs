//! A Rust implementation of the replicated core of the Raft consensus
//! protocol: role/term state machine, durable persistence, log replication
//! and snapshotting.
//!
//! This crate implements the hard, interacting pieces of a Raft node. It
//! deliberately treats the RPC transport, the application state machine, and
//! process/config/logging glue as external collaborators specified only by
//! their interfaces (see [`RaftNetwork`] and [`AppStateMachine`]).
//!
//! Cluster membership reconfiguration (joint consensus), non-voting
//! learners, lease reads and cross-cluster federation are out of scope; the
//! set of peers is a static list supplied at boot.

pub mod config;
pub mod core;
pub mod error;
pub mod log;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod replication;
pub mod snapshot;
pub mod storage;

use std::fmt::Debug;
use std::fmt::Display;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use config::Config;
pub use config::ConfigBuilder;
pub use error::RaftError;
pub use metrics::RaftMetrics;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use storage::AppStateMachine;
pub use storage::RaftStorage;

/// A Raft node identifier. Stable across restarts; persisted by the
/// application alongside the Raft log (see `spec.md` §6, Configuration).
pub type NodeId = u64;

/// A trait that must be implemented by the application-specific command
/// type which is replicated by this Raft implementation.
///
/// The Raft core treats values of this type as opaque: it never interprets
/// their contents, only persists and relays them (see `spec.md` §9, Design
/// Notes on opaque commands).
pub trait AppData: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppData for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// A trait that must be implemented by the application-specific response
/// type returned from applying a command to the state machine.
pub trait AppDataResponse: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> AppDataResponse for T where T: Clone + Debug + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// Identifies a log entry by the term in which it was created and its
/// index. Entries are ordered first by index; `(term, index)` pairs compare
/// lexicographically by `(term, index)` as required for the "up-to-date"
/// comparison in `spec.md` §4.4 and the GLOSSARY.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// Cheap-to-compute, human-readable summaries of RPC payloads for tracing,
/// so that `tracing::instrument` fields don't have to `Debug`-format large
/// payloads on every call.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Distinguishes "replace with a new value" from "leave as-is" when updating
/// optional pieces of [`RaftMetrics`].
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}
