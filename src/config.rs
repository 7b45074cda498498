//! Runtime configuration for a Raft node (`spec.md` §6, Configuration).

use rand::Rng;

use crate::error::ConfigError;

/// Runtime config for a Raft node.
///
/// Constructed with [`Config::build`], which returns a [`ConfigBuilder`];
/// call [`ConfigBuilder::validate`] to obtain a checked `Config`.
#[derive(Clone, Debug)]
pub struct Config {
    /// A name for this cluster, used only for tracing/log correlation.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The interval, in milliseconds, at which leaders send heartbeats.
    pub heartbeat_interval: u64,
    /// The timeout, in milliseconds, for an individual outbound RPC.
    pub rpc_timeout: u64,
    /// The maximum number of log entries to send in a single AppendEntries RPC.
    pub max_entries_per_append: u64,
    /// Whether snapshot blobs should be gzip-compressed.
    pub snapshot_compress: bool,
    /// Directory under which durable state is stored.
    pub storage_path: String,
    /// Number of log entries applied since the last snapshot after which a
    /// new snapshot is triggered automatically.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum size, in bytes, of a single InstallSnapshot RPC chunk.
    pub snapshot_max_chunk_size: u64,
    /// If the leader's outstanding buffer for a peer grows past this many
    /// entries, drop back to catch-up mode rather than continuing to stream
    /// at line rate.
    pub replication_lag_threshold: u64,
}

/// Controls when the core triggers automatic log compaction.
#[derive(Clone, Debug)]
pub enum SnapshotPolicy {
    /// Trigger a new snapshot once this many entries have been applied since
    /// the last one.
    EntriesSinceLast(u64),
    /// Never trigger automatically; only explicit `SnapshotRequest` events do.
    Never,
}

impl Config {
    /// Start building a new `Config` for the named cluster, with the
    /// defaults named in `spec.md` §6.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name,
            election_timeout_min: Some(150),
            election_timeout_max: Some(300),
            heartbeat_interval: Some(50),
            rpc_timeout: Some(100),
            max_entries_per_append: Some(64),
            snapshot_compress: Some(true),
            storage_path: None,
            snapshot_policy: Some(SnapshotPolicy::EntriesSinceLast(5000)),
            snapshot_max_chunk_size: Some(4 * 1024 * 1024),
            replication_lag_threshold: Some(1000),
        }
    }

    /// Sample a new randomized election timeout in `[min, max)`, in
    /// milliseconds.
    pub fn new_rand_election_timeout(&self) -> u64 {
        rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max)
    }
}

/// A builder for [`Config`]. Only [`ConfigBuilder::validate`] produces a
/// usable `Config`, so that invariants (e.g. `election_timeout_max >= 2 *
/// election_timeout_min`) are always checked before use.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    cluster_name: String,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    rpc_timeout: Option<u64>,
    max_entries_per_append: Option<u64>,
    snapshot_compress: Option<bool>,
    storage_path: Option<String>,
    snapshot_policy: Option<SnapshotPolicy>,
    snapshot_max_chunk_size: Option<u64>,
    replication_lag_threshold: Option<u64>,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = Some(v);
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = Some(v);
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = Some(v);
        self
    }

    pub fn rpc_timeout(mut self, v: u64) -> Self {
        self.rpc_timeout = Some(v);
        self
    }

    pub fn max_entries_per_append(mut self, v: u64) -> Self {
        self.max_entries_per_append = Some(v);
        self
    }

    pub fn snapshot_compress(mut self, v: bool) -> Self {
        self.snapshot_compress = Some(v);
        self
    }

    pub fn storage_path(mut self, v: impl Into<String>) -> Self {
        self.storage_path = Some(v.into());
        self
    }

    pub fn snapshot_policy(mut self, v: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(v);
        self
    }

    pub fn snapshot_max_chunk_size(mut self, v: u64) -> Self {
        self.snapshot_max_chunk_size = Some(v);
        self
    }

    pub fn replication_lag_threshold(mut self, v: u64) -> Self {
        self.replication_lag_threshold = Some(v);
        self
    }

    /// Check all invariants and produce a usable [`Config`].
    ///
    /// `storagePath` is required per `spec.md` §6; everything else falls
    /// back to the documented defaults.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(150);
        let election_timeout_max = self.election_timeout_max.unwrap_or(300);
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(50);

        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidTimeoutRange {
                min: election_timeout_min,
                max: election_timeout_max,
            });
        }
        if election_timeout_max < election_timeout_min * 2 {
            return Err(ConfigError::ElectionTimeoutSpreadTooNarrow {
                min: election_timeout_min,
                max: election_timeout_max,
            });
        }
        if heartbeat_interval * 2 >= election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat_interval,
                election_timeout_min,
            });
        }

        let storage_path = self.storage_path.ok_or(ConfigError::MissingStoragePath)?;

        Ok(Config {
            cluster_name: self.cluster_name,
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            rpc_timeout: self.rpc_timeout.unwrap_or(100),
            max_entries_per_append: self.max_entries_per_append.unwrap_or(64),
            snapshot_compress: self.snapshot_compress.unwrap_or(true),
            storage_path,
            snapshot_policy: self.snapshot_policy.unwrap_or(SnapshotPolicy::EntriesSinceLast(5000)),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(4 * 1024 * 1024),
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(1000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_successfully() {
        let cfg = Config::build("test".into()).storage_path("/tmp/raft").validate().unwrap();
        assert_eq!(cfg.election_timeout_min, 150);
        assert_eq!(cfg.election_timeout_max, 300);
        assert_eq!(cfg.heartbeat_interval, 50);
    }

    #[test]
    fn missing_storage_path_is_rejected() {
        let res = Config::build("test".into()).validate();
        assert!(matches!(res, Err(ConfigError::MissingStoragePath)));
    }

    #[test]
    fn narrow_election_spread_is_rejected() {
        let res = Config::build("test".into())
            .storage_path("/tmp/raft")
            .election_timeout_min(200)
            .election_timeout_max(250)
            .validate();
        assert!(matches!(res, Err(ConfigError::ElectionTimeoutSpreadTooNarrow { .. })));
    }

    #[test]
    fn slow_heartbeat_is_rejected() {
        let res = Config::build("test".into())
            .storage_path("/tmp/raft")
            .election_timeout_min(100)
            .election_timeout_max(300)
            .heartbeat_interval(60)
            .validate();
        assert!(matches!(res, Err(ConfigError::HeartbeatTooSlow { .. })));
    }

    #[test]
    fn rand_election_timeout_is_within_range() {
        let cfg = Config::build("test".into()).storage_path("/tmp/raft").validate().unwrap();
        for _ in 0..1000 {
            let t = cfg.new_rand_election_timeout();
            assert!(t >= cfg.election_timeout_min && t < cfg.election_timeout_max);
        }
    }
}
