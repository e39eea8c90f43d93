//! The storage client: chunk-aware batched I/O.
//!
//! A file I/O splits across chunk boundaries into sub-operations, each
//! addressed to one chain. Writes target the chain head; reads pick any
//! online replica per the configured selection mode. Sub-operations are
//! grouped into one RPC per destination node, bounded by batch size and
//! bytes, with a limited number of batches in flight per node. Retries
//! refresh routing on stale chain versions and back off on transient
//! transport failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use xxhash_rust::xxh3::xxh3_64;

use crate::config::{ReadSelection, StorageClientConfig};
use crate::error::{FsError, Result};
use crate::layout::{split_io, ChunkId, ChunkSpan, Layout};
use crate::meta::gc::ChunkRemover;
use crate::metrics::ClientCounters;
use crate::routing::RoutingInfo;
use crate::storage::{ReadReq, StorageNet, StorageOp, StorageOpResp, WriteReq};
use crate::types::{InodeId, NodeId, RoutingVersion, TargetId, Uuid};
use crate::util::BoxFuture;

/// Where fresh routing snapshots come from (mgmtd, in production).
pub trait RoutingSource: Send + Sync {
  fn fetch(
    &self,
    since: Option<RoutingVersion>,
  ) -> BoxFuture<'_, Result<Option<RoutingInfo>>>;
}

/// What to do with a failed sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
  RefreshAndRetry,
  BackoffAndRetry,
  Surface,
}

fn classify(err: &FsError, is_read: bool) -> Recovery {
  match err {
    FsError::VersionMismatch { .. } | FsError::NotFound(_) => Recovery::RefreshAndRetry,
    FsError::Timeout | FsError::Network(_) | FsError::Throttled | FsError::Busy(_) => {
      Recovery::BackoffAndRetry
    }
    FsError::Corruption if is_read => Recovery::BackoffAndRetry,
    _ => Recovery::Surface,
  }
}

pub struct StorageClient {
  client_id: Uuid,
  config: StorageClientConfig,
  routing: RwLock<RoutingInfo>,
  source: Arc<dyn RoutingSource>,
  net: Arc<dyn StorageNet>,
  counters: ClientCounters,
  rr_cursor: AtomicUsize,
  /// Replicas that served corrupt data; avoided until they resync.
  suspects: Mutex<hashbrown::HashSet<TargetId>>,
  /// Per-node in-flight batch limits.
  inflight: Mutex<hashbrown::HashMap<NodeId, Arc<Semaphore>>>,
}

impl StorageClient {
  pub fn new(
    client_id: Uuid,
    config: StorageClientConfig,
    source: Arc<dyn RoutingSource>,
    net: Arc<dyn StorageNet>,
  ) -> Self {
    StorageClient {
      client_id,
      config,
      routing: RwLock::new(RoutingInfo::default()),
      source,
      net,
      counters: ClientCounters::default(),
      rr_cursor: AtomicUsize::new(0),
      suspects: Mutex::new(hashbrown::HashSet::new()),
      inflight: Mutex::new(hashbrown::HashMap::new()),
    }
  }

  pub fn client_id(&self) -> Uuid {
    self.client_id
  }

  pub fn counters(&self) -> &ClientCounters {
    &self.counters
  }

  pub fn routing_version(&self) -> RoutingVersion {
    self.routing.read().routing_version
  }

  /// Pull a fresh routing snapshot. A version regression is an error on
  /// the mgmtd side; the cached snapshot is kept in that case.
  pub async fn refresh_routing(&self) -> Result<()> {
    let current = {
      let routing = self.routing.read();
      if routing.routing_version == 0 {
        None
      } else {
        Some(routing.routing_version)
      }
    };
    if let Some(fresh) = self.source.fetch(current).await? {
      self
        .counters
        .routing_refreshes
        .fetch_add(1, Ordering::Relaxed);
      let mut routing = self.routing.write();
      if fresh.routing_version < routing.routing_version {
        tracing::warn!(
          target: "kitefs::client",
          cached = routing.routing_version,
          fresh = fresh.routing_version,
          "routing version regressed; keeping cached snapshot"
        );
        return Ok(());
      }
      *routing = fresh;
    }
    Ok(())
  }

  pub fn mark_suspect(&self, target: TargetId) {
    self.suspects.lock().insert(target);
  }

  fn semaphore(&self, node: NodeId) -> Arc<Semaphore> {
    self
      .inflight
      .lock()
      .entry(node)
      .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_concurrent_per_node)))
      .clone()
  }

  /// Stable 64-bit update id for one sub-operation of one logical call.
  fn update_id(&self, call: Uuid, span: &ChunkSpan) -> u64 {
    let mut buf = Vec::with_capacity(40);
    buf.extend_from_slice(self.client_id.as_bytes());
    buf.extend_from_slice(call.as_bytes());
    buf.extend_from_slice(&span.chunk_index.to_be_bytes());
    buf.extend_from_slice(&span.offset.to_be_bytes());
    xxh3_64(&buf)
  }

  // ==========================================================================
  // Target resolution
  // ==========================================================================

  fn resolve_chain(
    &self,
    routing: &RoutingInfo,
    layout: &Layout,
    chunk_index: u32,
  ) -> Result<crate::routing::ChainInfo> {
    let chain_ref = layout.chain_ref(chunk_index)?;
    let chain_id = routing.resolve(
      layout.chain_table_id,
      layout.chain_table_version,
      chain_ref,
    )?;
    routing.chain(chain_id).cloned()
  }

  fn pick_read_replica(
    &self,
    routing: &RoutingInfo,
    chain: &crate::routing::ChainInfo,
  ) -> Result<TargetId> {
    let online = routing.online_replicas(chain.chain_id)?;
    if online.is_empty() {
      return Err(FsError::Busy(format!("{} has no online replica", chain.chain_id)));
    }
    let suspects = self.suspects.lock();
    let candidates: Vec<TargetId> = online
      .iter()
      .copied()
      .filter(|t| !suspects.contains(t))
      .collect();
    let pool = if candidates.is_empty() { &online } else { &candidates };
    let picked = match self.config.read_selection {
      ReadSelection::Head => pool[0],
      ReadSelection::Tail => pool[pool.len() - 1],
      ReadSelection::RoundRobin => {
        pool[self.rr_cursor.fetch_add(1, Ordering::Relaxed) % pool.len()]
      }
      ReadSelection::Random => pool[rand::thread_rng().gen_range(0..pool.len())],
    };
    Ok(picked)
  }

  // ==========================================================================
  // Batched dispatch
  // ==========================================================================

  /// Group `(span_index, target, op)` triples into per-node batches and
  /// run them with bounded concurrency per node. Results land back in
  /// span order.
  async fn dispatch(
    self: &Arc<Self>,
    ops: Vec<(usize, TargetId, StorageOp)>,
    routing: &RoutingInfo,
  ) -> Vec<(usize, Result<StorageOpResp>)> {
    // One RPC per (node, batch); batches respect count and byte bounds.
    let mut batches: Vec<(NodeId, Vec<(usize, TargetId, StorageOp)>)> = Vec::new();
    let mut open: IndexMap<NodeId, (usize, Vec<(usize, TargetId, StorageOp)>)> = IndexMap::new();
    let mut unroutable: Vec<(usize, Result<StorageOpResp>)> = Vec::new();
    for (index, target, op) in ops {
      let node = match routing.target_node(target) {
        Ok(node) => node,
        Err(err) => {
          // Unroutable target: fail the span without an RPC; the caller
          // refreshes routing and retries.
          unroutable.push((index, Err(err)));
          continue;
        }
      };
      let op_bytes = match &op {
        StorageOp::Write(req) => req.data.len(),
        _ => 0,
      };
      let (bytes, batch) = open.entry(node).or_insert_with(|| (0, Vec::new()));
      if batch.len() >= self.config.max_batch_size
        || (!batch.is_empty() && *bytes + op_bytes > self.config.max_batch_bytes)
      {
        batches.push((node, std::mem::take(batch)));
        *bytes = 0;
      }
      batch.push((index, target, op));
      *bytes += op_bytes;
    }
    for (node, (_, batch)) in open {
      if !batch.is_empty() {
        batches.push((node, batch));
      }
    }

    let mut join = JoinSet::new();
    for (node, batch) in batches {
      let client = self.clone();
      join.spawn(async move {
        let semaphore = client.semaphore(node);
        let _permit = semaphore.acquire_owned().await;
        let indices: Vec<usize> = batch.iter().map(|(i, _, _)| *i).collect();
        let wire: Vec<(TargetId, StorageOp)> =
          batch.into_iter().map(|(_, t, op)| (t, op)).collect();
        let results = client.net.send_batch(node, wire).await;
        (indices, results)
      });
    }

    let mut out = unroutable;
    while let Some(joined) = join.join_next().await {
      match joined {
        Ok((indices, results)) => {
          for (index, result) in indices.into_iter().zip(results) {
            out.push((index, result));
          }
        }
        Err(_) => {
          // A panicked batch task surfaces as a network error on retry.
        }
      }
    }
    out
  }

  // ==========================================================================
  // File I/O
  // ==========================================================================

  /// Write `data` at `offset`, striped per the file's layout. Returns the
  /// number of bytes written. Sub-writes are deduplicated server-side by
  /// their stable update ids across retries.
  pub async fn write_file(
    self: &Arc<Self>,
    inode: InodeId,
    layout: &Layout,
    offset: u64,
    data: &[u8],
  ) -> Result<usize> {
    let call = Uuid::generate();
    let spans = split_io(layout, offset, data.len() as u64);
    self
      .counters
      .sub_ops
      .fetch_add(spans.len() as u64, Ordering::Relaxed);

    let mut pending: Vec<ChunkSpan> = spans;
    let mut backoff_ms = self.config.initial_backoff_ms.max(1);
    let mut last_err = FsError::Timeout;

    for attempt in 0..self.config.retry_attempts {
      let routing = self.routing.read().clone();
      let mut ops = Vec::with_capacity(pending.len());
      let mut resolve_failed = false;
      for (index, span) in pending.iter().enumerate() {
        match self.resolve_chain(&routing, layout, span.chunk_index).and_then(|chain| {
          let head = chain
            .head()
            .ok_or_else(|| FsError::Busy(format!("{} has no serving replica", chain.chain_id)))?;
          Ok((chain, head))
        }) {
          Ok((chain, head)) => {
            let req = WriteReq {
              chain: chain.chain_id,
              chain_version: chain.version,
              chunk: ChunkId::new(inode, span.chunk_index),
              offset: span.offset,
              data: data[span.buffer_offset..span.buffer_offset + span.len as usize].to_vec(),
              update_id: self.update_id(call, span),
            };
            ops.push((index, head, StorageOp::Write(req)));
          }
          Err(err) => {
            last_err = err;
            resolve_failed = true;
            break;
          }
        }
      }

      if !resolve_failed {
        let mut by_index: hashbrown::HashMap<usize, Result<StorageOpResp>> =
          self.dispatch(ops, &routing).await.into_iter().collect();
        let mut failed = Vec::new();
        for index in 0..pending.len() {
          let result = by_index
            .remove(&index)
            .unwrap_or_else(|| Err(FsError::Network("batch reply lost".into())));
          match result {
            Ok(StorageOpResp::Write(_)) => {}
            Ok(other) => {
              return Err(FsError::Internal(format!("unexpected response {other:?}")))
            }
            Err(err) => {
              match classify(&err, false) {
                Recovery::Surface => return Err(err),
                Recovery::RefreshAndRetry | Recovery::BackoffAndRetry => {}
              }
              last_err = err;
              failed.push(pending[index]);
            }
          }
        }
        if failed.is_empty() {
          self
            .counters
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::Relaxed);
          return Ok(data.len());
        }
        pending = failed;
        // Stale chain versions, rotated heads and dead links all resolve
        // through the next routing snapshot.
        self.refresh_routing().await?;
      } else {
        self.refresh_routing().await?;
      }

      self.counters.retries.fetch_add(1, Ordering::Relaxed);
      if attempt + 1 < self.config.retry_attempts {
        let sleep_ms = rand::thread_rng().gen_range(1..=backoff_ms);
        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
      }
    }
    Err(last_err)
  }

  /// Read `len` bytes at `offset` into a fresh buffer. Unwritten chunk
  /// ranges read as zeros.
  pub async fn read_file(
    self: &Arc<Self>,
    inode: InodeId,
    layout: &Layout,
    offset: u64,
    len: u64,
  ) -> Result<Vec<u8>> {
    let spans = split_io(layout, offset, len);
    self
      .counters
      .sub_ops
      .fetch_add(spans.len() as u64, Ordering::Relaxed);
    let mut buffer = vec![0u8; len as usize];

    let mut pending: Vec<ChunkSpan> = spans;
    let mut backoff_ms = self.config.initial_backoff_ms.max(1);
    let mut last_err = FsError::Timeout;

    for attempt in 0..self.config.retry_attempts {
      let routing = self.routing.read().clone();
      let mut ops = Vec::with_capacity(pending.len());
      let mut targets_of = Vec::with_capacity(pending.len());
      let mut resolve_failed = false;
      for (index, span) in pending.iter().enumerate() {
        match self.resolve_chain(&routing, layout, span.chunk_index).and_then(|chain| {
          let replica = self.pick_read_replica(&routing, &chain)?;
          Ok((chain, replica))
        }) {
          Ok((chain, replica)) => {
            let req = ReadReq {
              chain: chain.chain_id,
              chain_version: chain.version,
              chunk: ChunkId::new(inode, span.chunk_index),
              offset: span.offset,
              len: span.len,
            };
            targets_of.push(replica);
            ops.push((index, replica, StorageOp::Read(req)));
          }
          Err(err) => {
            last_err = err;
            resolve_failed = true;
            break;
          }
        }
      }

      if !resolve_failed {
        let mut by_index: hashbrown::HashMap<usize, Result<StorageOpResp>> =
          self.dispatch(ops, &routing).await.into_iter().collect();
        let mut failed = Vec::new();
        for index in 0..pending.len() {
          let result = by_index
            .remove(&index)
            .unwrap_or_else(|| Err(FsError::Network("batch reply lost".into())));
          let span = pending[index];
          match result {
            Ok(StorageOpResp::Read(resp)) => {
              let start = span.buffer_offset;
              let end = start + span.len as usize;
              buffer[start..end].copy_from_slice(&resp.data[..span.len as usize]);
            }
            Ok(other) => {
              return Err(FsError::Internal(format!("unexpected response {other:?}")))
            }
            Err(err) => {
              if matches!(err, FsError::Corruption) {
                self.mark_suspect(targets_of[index]);
              }
              match classify(&err, true) {
                Recovery::Surface => return Err(err),
                Recovery::RefreshAndRetry | Recovery::BackoffAndRetry => {}
              }
              last_err = err;
              failed.push(span);
            }
          }
        }
        if failed.is_empty() {
          self
            .counters
            .bytes_read
            .fetch_add(len, Ordering::Relaxed);
          return Ok(buffer);
        }
        pending = failed;
        // Stale chain versions, rotated heads and dead links all resolve
        // through the next routing snapshot.
        self.refresh_routing().await?;
      } else {
        self.refresh_routing().await?;
      }

      self.counters.retries.fetch_add(1, Ordering::Relaxed);
      if attempt + 1 < self.config.retry_attempts {
        let sleep_ms = rand::thread_rng().gen_range(1..=backoff_ms);
        tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
        backoff_ms = (backoff_ms * 2).min(self.config.max_backoff_ms);
      }
    }
    Err(last_err)
  }

  // ==========================================================================
  // Chunk removal
  // ==========================================================================

  /// Remove up to `limit` chunks per target for `inode` at or past
  /// `from_index`, on every target in the cluster. Idempotent; returns
  /// the largest per-target removal count, so zero means no replica holds
  /// anything left.
  pub async fn remove_chunks(
    &self,
    inode: InodeId,
    from_index: u32,
    limit: usize,
  ) -> Result<usize> {
    let routing = self.routing.read().clone();
    let mut per_node: IndexMap<NodeId, Vec<(TargetId, StorageOp)>> = IndexMap::new();
    for (target_id, info) in &routing.targets {
      per_node.entry(info.node_id).or_default().push((
        *target_id,
        StorageOp::RemoveInode {
          inode,
          from_index,
          limit,
        },
      ));
    }

    let mut max_removed = 0usize;
    for (node, batch) in per_node {
      for result in self.net.send_batch(node, batch).await {
        match result {
          Ok(StorageOpResp::RemovedCount(count)) => max_removed = max_removed.max(count),
          Ok(_) => {}
          Err(FsError::NotFound(_)) => {}
          Err(err) => return Err(err),
        }
      }
    }
    Ok(max_removed)
  }
}

impl ChunkRemover for StorageClient {
  fn remove_chunks(
    &self,
    inode: InodeId,
    from_index: u32,
    batch_size: usize,
  ) -> BoxFuture<'_, Result<usize>> {
    Box::pin(StorageClient::remove_chunks(self, inode, from_index, batch_size))
  }
}
