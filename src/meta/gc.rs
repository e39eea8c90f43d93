//! Background garbage collection of unreachable inodes.
//!
//! An inode whose link count hit zero with no open sessions sits on the
//! `GCQU` queue. The worker removes its chunks through the storage
//! client, then erases the inode and the queue entry in one transaction.
//! The queue entry is the commit record, so a crash between chunk
//! removal and the final erase just replays an idempotent removal.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::MetaConfig;
use crate::distributor::MetaDistributor;
use crate::error::Result;
use crate::kv::{run_transaction, KvEngine, KvRetryConfig};
use crate::meta::store;
use crate::types::InodeId;
use crate::util::BoxFuture;

/// Removes the chunk records backing an inode. Implemented by the
/// storage client; removal is idempotent and keyed by chunk range.
pub trait ChunkRemover: Send + Sync {
  /// Drop up to `batch_size` chunks of `inode` with index >=
  /// `from_index`. Returns how many were removed; zero means none left.
  fn remove_chunks(
    &self,
    inode: InodeId,
    from_index: u32,
    batch_size: usize,
  ) -> BoxFuture<'_, Result<usize>>;
}

/// GC statistics.
#[derive(Debug, Default)]
pub struct GcStats {
  pub runs: AtomicU64,
  pub inodes_reclaimed: AtomicU64,
  pub chunks_removed: AtomicU64,
}

/// One GC pass reads at most this many queue entries.
const GC_SCAN_LIMIT: usize = 256;

pub struct GcWorker<E: KvEngine> {
  kv: Arc<E>,
  distributor: Arc<MetaDistributor<E>>,
  remover: Arc<dyn ChunkRemover>,
  config: MetaConfig,
  retry: KvRetryConfig,
  stats: GcStats,
  running: AtomicBool,
}

impl<E: KvEngine> GcWorker<E> {
  pub fn new(
    kv: Arc<E>,
    distributor: Arc<MetaDistributor<E>>,
    remover: Arc<dyn ChunkRemover>,
    config: MetaConfig,
    retry: KvRetryConfig,
  ) -> Self {
    GcWorker {
      kv,
      distributor,
      remover,
      config,
      retry,
      stats: GcStats::default(),
      running: AtomicBool::new(false),
    }
  }

  pub fn stats(&self) -> &GcStats {
    &self.stats
  }

  /// Run a single GC cycle. Returns the number of inodes reclaimed; a
  /// cycle already in flight is skipped.
  pub async fn run_gc(&self) -> Result<usize> {
    if self.running.swap(true, Ordering::SeqCst) {
      return Ok(0);
    }
    let result = self.do_gc().await;
    self.running.store(false, Ordering::SeqCst);
    result
  }

  async fn do_gc(&self) -> Result<usize> {
    let doomed = {
      let mut txn = self.kv.begin_read_only();
      store::list_gc_queue(&mut txn, GC_SCAN_LIMIT)?
    };
    if doomed.is_empty() {
      return Ok(0);
    }

    let mut reclaimed = 0usize;
    for inode in doomed {
      // Queue entries are sharded across the meta fleet by ownership.
      if !self.distributor.is_local(inode) {
        continue;
      }
      loop {
        let removed = self
          .remover
          .remove_chunks(inode, 0, self.config.remove_chunks_batch_size)
          .await?;
        self
          .stats
          .chunks_removed
          .fetch_add(removed as u64, Ordering::Relaxed);
        if removed == 0 {
          break;
        }
      }

      run_transaction(&*self.kv, &self.retry, true, |txn| {
        store::clear_inode(txn, inode);
        store::clear_gc_entry(txn, inode);
        Ok(())
      })
      .await?;
      reclaimed += 1;
      tracing::debug!(target: "kitefs::meta", inode = %inode, "inode reclaimed");
    }

    self.stats.runs.fetch_add(1, Ordering::Relaxed);
    self
      .stats
      .inodes_reclaimed
      .fetch_add(reclaimed as u64, Ordering::Relaxed);
    Ok(reclaimed)
  }
}

/// Background GC loop, one per meta server.
pub fn spawn_gc_worker<E: KvEngine>(
  worker: Arc<GcWorker<E>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let period = std::time::Duration::from_millis(worker.config.gc_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(err) = worker.run_gc().await {
            tracing::warn!(target: "kitefs::meta", error = %err, "gc cycle failed");
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}
