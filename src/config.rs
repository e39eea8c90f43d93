//! Component configuration.
//!
//! Plain serde structs with defaults; durations are millisecond fields.
//! The aggregate [`FsConfig`] is what a deployment loads and hands to the
//! individual services.

use serde::{Deserialize, Serialize};

use crate::constants::*;
pub use crate::kv::KvRetryConfig;

/// Management service timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MgmtdConfig {
  /// Primary lease duration.
  pub lease_ms: u64,
  /// Lease renewal period; must be well below `lease_ms`.
  pub lease_renew_ms: u64,
  /// Control loop tick.
  pub heartbeat_interval_ms: u64,
  /// A node silent this long is marked offline.
  pub node_timeout_ms: u64,
}

impl Default for MgmtdConfig {
  fn default() -> Self {
    MgmtdConfig {
      lease_ms: DEFAULT_LEASE_MS,
      lease_renew_ms: DEFAULT_LEASE_RENEW_MS,
      heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
      node_timeout_ms: DEFAULT_NODE_TIMEOUT_MS,
    }
  }
}

/// Meta distributor timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
  /// Background updater period.
  pub update_interval_ms: u64,
  /// A server whose presence marker has not advanced this long is dead.
  pub failure_timeout_ms: u64,
}

impl Default for DistributorConfig {
  fn default() -> Self {
    DistributorConfig {
      update_interval_ms: DEFAULT_DISTRIBUTOR_UPDATE_MS,
      failure_timeout_ms: DEFAULT_DISTRIBUTOR_FAILURE_TIMEOUT_MS,
    }
  }
}

/// Metadata server tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
  /// Max operations folded into one per-inode transaction.
  pub batch_size: usize,
  /// Default `list` page size.
  pub list_limit: usize,
  /// Chunks removed per storage round during truncate and GC.
  pub remove_chunks_batch_size: usize,
  /// File sessions idle past this are pruned.
  pub session_timeout_ms: u64,
  /// GC worker tick.
  pub gc_interval_ms: u64,
}

impl Default for MetaConfig {
  fn default() -> Self {
    MetaConfig {
      batch_size: DEFAULT_META_BATCH_SIZE,
      list_limit: DEFAULT_LIST_LIMIT,
      remove_chunks_batch_size: DEFAULT_REMOVE_CHUNKS_BATCH,
      session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
      gc_interval_ms: DEFAULT_GC_INTERVAL_MS,
    }
  }
}

/// Which replica a read targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSelection {
  Head,
  Tail,
  #[default]
  RoundRobin,
  Random,
}

/// Storage client tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageClientConfig {
  /// Max sub-operations per RPC batch.
  pub max_batch_size: usize,
  /// Max payload bytes per RPC batch.
  pub max_batch_bytes: usize,
  /// In-flight batches per destination node.
  pub max_concurrent_per_node: usize,
  /// Per-sub-op retry bound.
  pub retry_attempts: u32,
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  pub read_selection: ReadSelection,
}

impl Default for StorageClientConfig {
  fn default() -> Self {
    StorageClientConfig {
      max_batch_size: DEFAULT_MAX_BATCH_SIZE,
      max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
      max_concurrent_per_node: DEFAULT_MAX_CONCURRENT_PER_NODE,
      retry_attempts: DEFAULT_IO_RETRY_ATTEMPTS,
      initial_backoff_ms: 2,
      max_backoff_ms: 500,
      read_selection: ReadSelection::default(),
    }
  }
}

/// Aggregate configuration for a deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsConfig {
  #[serde(default)]
  pub retry: KvRetryConfig,
  #[serde(default)]
  pub mgmtd: MgmtdConfig,
  #[serde(default)]
  pub distributor: DistributorConfig,
  #[serde(default)]
  pub meta: MetaConfig,
  #[serde(default)]
  pub client: StorageClientConfig,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_sane() {
    let config = FsConfig::default();
    assert!(config.mgmtd.lease_renew_ms < config.mgmtd.lease_ms);
    assert!(config.meta.batch_size > 0);
    assert_eq!(config.client.read_selection, ReadSelection::RoundRobin);
  }

  #[test]
  fn test_serde_roundtrip() {
    let config = FsConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    let back: FsConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back.meta.batch_size, config.meta.batch_size);
  }

  #[test]
  fn test_partial_config_fills_defaults() {
    let json = r#"{"meta": {"batch_size": 8, "list_limit": 10, "remove_chunks_batch_size": 4, "session_timeout_ms": 1000, "gc_interval_ms": 50}}"#;
    let config: FsConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.meta.batch_size, 8);
    assert_eq!(config.mgmtd.lease_ms, crate::constants::DEFAULT_LEASE_MS);
  }
}
