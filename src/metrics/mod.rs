//! Metrics and health snapshots.
//!
//! Components own cheap atomic counters; `snapshot()` turns them into
//! plain structs that aggregate into [`FsMetrics`], serializable as JSON
//! for whatever sink the deployment wires up.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::now_ms;

// ============================================================================
// Live counters
// ============================================================================

/// Metadata server counters.
#[derive(Debug, Default)]
pub struct MetaCounters {
  pub ops: AtomicU64,
  pub batches: AtomicU64,
  pub forwards: AtomicU64,
}

impl MetaCounters {
  pub fn snapshot(&self) -> MetaMetrics {
    MetaMetrics {
      ops: self.ops.load(Ordering::Relaxed),
      batches: self.batches.load(Ordering::Relaxed),
      forwards: self.forwards.load(Ordering::Relaxed),
    }
  }
}

/// Storage target / chain counters.
#[derive(Debug, Default)]
pub struct ChainCounters {
  pub writes: AtomicU64,
  pub forwards: AtomicU64,
  pub commits: AtomicU64,
  pub reads: AtomicU64,
  pub version_mismatches: AtomicU64,
  pub resynced_chunks: AtomicU64,
}

impl ChainCounters {
  pub fn snapshot(&self) -> ChainMetrics {
    ChainMetrics {
      writes: self.writes.load(Ordering::Relaxed),
      forwards: self.forwards.load(Ordering::Relaxed),
      commits: self.commits.load(Ordering::Relaxed),
      reads: self.reads.load(Ordering::Relaxed),
      version_mismatches: self.version_mismatches.load(Ordering::Relaxed),
      resynced_chunks: self.resynced_chunks.load(Ordering::Relaxed),
    }
  }
}

/// Storage client counters.
#[derive(Debug, Default)]
pub struct ClientCounters {
  pub bytes_written: AtomicU64,
  pub bytes_read: AtomicU64,
  pub sub_ops: AtomicU64,
  pub retries: AtomicU64,
  pub routing_refreshes: AtomicU64,
}

impl ClientCounters {
  pub fn snapshot(&self) -> ClientMetrics {
    ClientMetrics {
      bytes_written: self.bytes_written.load(Ordering::Relaxed),
      bytes_read: self.bytes_read.load(Ordering::Relaxed),
      sub_ops: self.sub_ops.load(Ordering::Relaxed),
      retries: self.retries.load(Ordering::Relaxed),
      routing_refreshes: self.routing_refreshes.load(Ordering::Relaxed),
    }
  }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetaMetrics {
  pub ops: u64,
  pub batches: u64,
  pub forwards: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GcMetrics {
  pub runs: u64,
  pub inodes_reclaimed: u64,
  pub chunks_removed: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChainMetrics {
  pub writes: u64,
  pub forwards: u64,
  pub commits: u64,
  pub reads: u64,
  pub version_mismatches: u64,
  pub resynced_chunks: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientMetrics {
  pub bytes_written: u64,
  pub bytes_read: u64,
  pub sub_ops: u64,
  pub retries: u64,
  pub routing_refreshes: u64,
}

/// One process's aggregated metrics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FsMetrics {
  pub routing_version: u64,
  pub meta: MetaMetrics,
  pub gc: GcMetrics,
  pub chain: ChainMetrics,
  pub client: ClientMetrics,
  pub collected_at_ms: u64,
}

impl FsMetrics {
  pub fn collect(
    routing_version: u64,
    meta: Option<&MetaCounters>,
    gc: Option<&crate::meta::gc::GcStats>,
    chain: Option<&ChainCounters>,
    client: Option<&ClientCounters>,
  ) -> Self {
    FsMetrics {
      routing_version,
      meta: meta.map(MetaCounters::snapshot).unwrap_or_default(),
      gc: gc
        .map(|stats| GcMetrics {
          runs: stats.runs.load(Ordering::Relaxed),
          inodes_reclaimed: stats.inodes_reclaimed.load(Ordering::Relaxed),
          chunks_removed: stats.chunks_removed.load(Ordering::Relaxed),
        })
        .unwrap_or_default(),
      chain: chain.map(ChainCounters::snapshot).unwrap_or_default(),
      client: client.map(ClientCounters::snapshot).unwrap_or_default(),
      collected_at_ms: now_ms(),
    }
  }

  pub fn to_json(&self) -> String {
    serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_snapshot_reads_counters() {
    let counters = MetaCounters::default();
    counters.ops.fetch_add(3, Ordering::Relaxed);
    counters.batches.fetch_add(1, Ordering::Relaxed);
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.ops, 3);
    assert_eq!(snapshot.batches, 1);
  }

  #[test]
  fn test_collect_serializes() {
    let meta = MetaCounters::default();
    meta.ops.fetch_add(7, Ordering::Relaxed);
    let metrics = FsMetrics::collect(4, Some(&meta), None, None, None);
    assert_eq!(metrics.routing_version, 4);
    let json = metrics.to_json();
    assert!(json.contains("\"ops\": 7"));
  }
}
