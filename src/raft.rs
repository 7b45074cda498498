//! The public `Raft` handle and the wire message types exchanged between
//! nodes (`spec.md` §6, External Interfaces).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientReadError;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::log::EntryPayload;
use crate::log::LogEntry;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::AppStateMachine;
use crate::storage::SnapshotMeta;
use crate::AppData;
use crate::AppDataResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftStorage;

struct RaftInner<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    tx_api: mpsc::UnboundedSender<(RaftMsg<D, R>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
    _marker: std::marker::PhantomData<(N, S, M)>,
}

/// A handle to a running Raft node.
///
/// This is the interface applications use to submit RPCs and client
/// requests, read metrics, and shut the node down. Internally it is just a
/// channel to the single task (spawned by [`Raft::new`]) that owns all of
/// the node's mutable state ([`crate::core::RaftCore`]); see `spec.md` §5
/// for the concurrency model this implements.
///
/// Cheap to clone: cloning only bumps an `Arc` refcount.
pub struct Raft<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    inner: Arc<RaftInner<D, R, N, S, M>>,
}

impl<D, R, N, S, M> Raft<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    /// Spawn a new Raft node.
    ///
    /// `peers` is the static set of other node ids in the cluster (not
    /// including `id` itself) — this implementation has no runtime
    /// membership-change API; the peer list is fixed at boot.
    #[tracing::instrument(level = "trace", skip(config, network, storage, state_machine), fields(cluster = %config.cluster_name))]
    pub fn new(
        id: NodeId,
        peers: BTreeSet<NodeId>,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        state_machine: Arc<M>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics { id, ..Default::default() });
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(id, peers, config, network, storage, state_machine, rx_api, tx_metrics, rx_shutdown);
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
            _marker: std::marker::PhantomData,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Handle an inbound AppendEntries RPC (`spec.md` §4.4).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc = %rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest<D>) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::AppendEntries { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Handle an inbound RequestVote RPC (`spec.md` §4.4).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::RequestVote { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Handle an inbound InstallSnapshot RPC (`spec.md` §4.3, §4.5).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(last_included_index = rpc.meta.last_included_index))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send((RaftMsg::InstallSnapshot { rpc, tx }, span)).map_err(|_| RaftError::ShuttingDown)?;
        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// The current leader as last reported by metrics. Fine for routing
    /// decisions; use [`Raft::client_read`] to actually guard against a
    /// stale read.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Confirm this node is still the cluster leader before performing an
    /// application-level read, by confirming leadership against a quorum of
    /// peers (`spec.md` §8).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientReadRequest { tx }, span))
            .map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RaftError(RaftError::ShuttingDown)).and_then(|res| res)
    }

    /// Submit a client command to be appended to the log, replicated, and
    /// applied to the state machine (`spec.md` §4.4 data flow).
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn client_write(&self, rpc: ClientWriteRequest<D>) -> Result<ClientWriteResponse<R>, ClientWriteError> {
        let span = tracing::debug_span!("CH");
        let (tx, rx) = oneshot::channel();

        if let Err(e) = self.inner.tx_api.send((RaftMsg::ClientWriteRequest { rpc, tx }, span)) {
            tracing::error!("error submitting client_write: {}", e);
            return Err(ClientWriteError::RaftError(RaftError::ShuttingDown));
        }

        match rx.await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("error awaiting client_write response: {}", e);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// A handle to the metrics channel; see [`RaftMetrics`].
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// A handle for awaiting a condition on the metrics stream.
    ///
    /// ```ignore
    /// raft.wait(Some(Duration::from_millis(500))).log(3, "commit 3").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        Wait { timeout: timeout.unwrap_or_else(|| Duration::from_millis(500)), rx: self.inner.rx_metrics.clone() }
    }

    /// Shut the node down, awaiting its task to finish.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }
}

impl<D, R, N, S, M> Clone for Raft<D, R, N, S, M>
where
    D: AppData,
    R: AppDataResponse,
    N: RaftNetwork<D>,
    S: RaftStorage<D>,
    M: AppStateMachine<D, R>,
{
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

pub(crate) type ClientWriteResponseTx<R> = oneshot::Sender<Result<ClientWriteResponse<R>, ClientWriteError>>;
pub(crate) type ClientReadResponseTx = oneshot::Sender<Result<(), ClientReadError>>;

/// Internal message routed from the `Raft` handle to the `RaftCore` task.
pub(crate) enum RaftMsg<D: AppData, R: AppDataResponse> {
    AppendEntries { rpc: AppendEntriesRequest<D>, tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>> },
    RequestVote { rpc: VoteRequest, tx: oneshot::Sender<Result<VoteResponse, RaftError>> },
    InstallSnapshot { rpc: InstallSnapshotRequest, tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>> },
    ClientWriteRequest { rpc: ClientWriteRequest<D>, tx: ClientWriteResponseTx<R> },
    ClientReadRequest { tx: ClientReadResponseTx },
}

/// An RPC sent by a leader to replicate log entries, and as a heartbeat when
/// `entries` is empty (`spec.md` §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct AppendEntriesRequest<D: AppData> {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry<D>>,
    pub leader_commit: u64,
}

impl<D: AppData> MessageSummary for AppendEntriesRequest<D> {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} prev=({},{}) n_entries={} leader_commit={}",
            self.term,
            self.leader_id,
            self.prev_log_index,
            self.prev_log_term,
            self.entries.len(),
            self.leader_commit
        )
    }
}

/// The response to an [`AppendEntriesRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// Conflict back-off hint, present only when `success` is `false`
    /// (`spec.md` §4.4/§4.5, the conflicting-term optimization).
    pub conflict_opt: Option<ConflictOpt>,
}

/// Conflict back-off hint (`spec.md` §4.2/§4.5): lets the leader jump
/// `nextIndex` back by a whole conflicting term in one round trip instead of
/// decrementing one index at a time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictOpt {
    pub conflict_index: u64,
    pub conflict_term: u64,
}

/// An RPC sent by a candidate to gather votes (`spec.md` §4.4).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self { term, candidate_id, last_log_index, last_log_term }
    }
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

/// An RPC sent by the leader to transfer a snapshot blob to a lagging or new
/// follower (`spec.md` §4.5). The payload is moved in one shot rather than
/// the teacher's arbitrary offset-addressed byte stream, since this spec's
/// snapshot payload is always a single serialized (optionally compressed)
/// buffer; `offset`/`done` are kept so a transport that wants to chunk large
/// blobs still can.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={} leader={} last_included_index={} offset={} len={} done={}",
            self.term,
            self.leader_id,
            self.meta.last_included_index,
            self.offset,
            self.data.len(),
            self.done
        )
    }
}

/// The response to an [`InstallSnapshotRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// An application command submitted for replication (`spec.md` §4.4, client
/// submits a command to the leader).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "D: AppData")]
pub struct ClientWriteRequest<D: AppData> {
    pub(crate) payload: EntryPayload<D>,
}

impl<D: AppData> ClientWriteRequest<D> {
    pub fn new(command: D) -> Self {
        Self { payload: EntryPayload::Normal(command) }
    }
}

/// The response to a [`ClientWriteRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(bound = "R: AppDataResponse")]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub index: u64,
    pub data: R,
}
