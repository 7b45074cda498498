//! Observability surface for a running Raft node.
//!
//! The core publishes a [`RaftMetrics`] snapshot on every state transition
//! over a `tokio::sync::watch` channel; [`Wait`] gives callers (tests, and
//! any glue code that wants to block until some condition holds) an
//! ergonomic way to await a particular value without polling by hand.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::LogId;
use crate::NodeId;

/// A point-in-time snapshot of a Raft node's externally-visible state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    /// Populated only while this node is the leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

/// Per-peer replication progress, published only by a node currently acting
/// as leader.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationMetrics {
    pub matched: LogId,
}

/// Blocks on a `watch::Receiver<RaftMetrics>` until a caller-supplied
/// predicate holds, or a timeout elapses.
pub struct Wait {
    pub rx: watch::Receiver<RaftMetrics>,
    pub timeout: Duration,
}

impl Wait {
    /// Wait until `current_leader` is `Some`, returning the leader id.
    pub async fn current_leader(&mut self, msg: impl AsRef<str>) -> Result<NodeId, WaitError> {
        self.metrics(|m| m.current_leader, msg).await
    }

    /// Wait until the node's [`State`] equals `want_state`.
    pub async fn state(&mut self, want_state: State, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.until(|m| m.state == want_state, msg).await
    }

    /// Wait until `last_log_index` reaches at least `want_log`.
    pub async fn log(&mut self, want_log: u64, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        self.until(|m| m.last_log_index >= want_log, msg).await
    }

    async fn metrics<T>(&mut self, f: impl Fn(RaftMetrics) -> Option<T>, msg: impl AsRef<str>) -> Result<T, WaitError> {
        let msg = msg.as_ref().to_string();
        let rx = &mut self.rx;
        let fut = async {
            loop {
                let cur = rx.borrow().clone();
                if let Some(t) = f(cur) {
                    return t;
                }
                if rx.changed().await.is_err() {
                    return f(rx.borrow().clone()).unwrap_or_else(|| unreachable!());
                }
            }
        };
        timeout(self.timeout, fut).await.map_err(|_| WaitError::Timeout { msg })
    }

    async fn until(&mut self, f: impl Fn(&RaftMetrics) -> bool, msg: impl AsRef<str>) -> Result<RaftMetrics, WaitError> {
        let msg = msg.as_ref().to_string();
        let rx = &mut self.rx;
        let fut = async {
            loop {
                let cur = rx.borrow().clone();
                if f(&cur) {
                    return cur;
                }
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };
        let result = timeout(self.timeout, fut).await.map_err(|_| WaitError::Timeout { msg: msg.clone() })?;
        if f(&result) {
            Ok(result)
        } else {
            Err(WaitError::ChannelClosed { msg })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for: {msg}")]
    Timeout { msg: String },
    #[error("metrics channel closed while waiting for: {msg}")]
    ChannelClosed { msg: String },
}
