//! Storage targets and chain replication (CRAQ).
//!
//! A target is one replica slot in zero or more chains. Writes enter at
//! the chain head, propagate uncommitted down the chain, commit at the
//! tail, and the commit acknowledgement walks back to the head. Reads go
//! to any online replica: committed records are served locally, and a
//! replica holding only an uncommitted record asks the tail for the
//! authoritative committed version.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{FsError, Result};
use crate::layout::ChunkId;
use crate::metrics::ChainCounters;
use crate::routing::{ChainInfo, RoutingInfo, TargetState};
use crate::storage::chunk_store::{ChunkEngine, ChunkMeta, ChunkRecord};
use crate::types::{ChainId, ChainVersion, ChunkVersion, NodeId, TargetId};
use crate::util::BoxFuture;

// ============================================================================
// Messages
// ============================================================================

/// A chunk update as it travels down a chain. `update_id` stays constant
/// across hops and client retries, so every replica deduplicates replays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReq {
  pub chain: ChainId,
  pub chain_version: ChainVersion,
  pub chunk: ChunkId,
  pub offset: u32,
  pub data: Vec<u8>,
  pub update_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
  pub chunk_version: ChunkVersion,
  pub chain_version: ChainVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReq {
  pub chain: ChainId,
  pub chain_version: ChainVersion,
  pub chunk: ChunkId,
  pub offset: u32,
  pub len: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResp {
  pub data: Vec<u8>,
  pub chunk_version: ChunkVersion,
  pub chain_version: ChainVersion,
}

/// Resync pull: `have` lists the requester's committed versions so the
/// peer ships only records that are ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncReq {
  pub chain: ChainId,
  pub have: Vec<(ChunkId, ChunkVersion)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResyncPage {
  pub records: Vec<ChunkRecord>,
}

/// One sub-operation inside a client batch, addressed to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOp {
  Write(WriteReq),
  Read(ReadReq),
  Remove { chunk: ChunkId },
  /// Remove up to `limit` committed chunks of an inode with index >=
  /// `from_index`. Backs truncate and GC; idempotent.
  RemoveInode {
    inode: crate::types::InodeId,
    from_index: u32,
    limit: usize,
  },
  Query { chunk: ChunkId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageOpResp {
  Write(WriteAck),
  Read(ReadResp),
  Removed(bool),
  RemovedCount(usize),
  Queried(Option<ChunkMeta>),
}

/// Reaches peer targets: chain forwarding, tail consultation, resync and
/// client batches. The wire transport is opaque; tests use an in-process
/// implementation.
pub trait StorageNet: Send + Sync {
  fn forward_update(&self, to: TargetId, req: WriteReq) -> BoxFuture<'_, Result<WriteAck>>;

  fn read_from(&self, to: TargetId, req: ReadReq) -> BoxFuture<'_, Result<ReadResp>>;

  fn fetch_resync(&self, to: TargetId, req: ResyncReq) -> BoxFuture<'_, Result<ResyncPage>>;

  /// One RPC per (node, batch): every op is addressed to a target hosted
  /// by `node`.
  fn send_batch(
    &self,
    node: NodeId,
    batch: Vec<(TargetId, StorageOp)>,
  ) -> BoxFuture<'_, Vec<Result<StorageOpResp>>>;
}

// ============================================================================
// Target
// ============================================================================

pub struct StorageTarget {
  target_id: TargetId,
  node_id: NodeId,
  engine: Arc<dyn ChunkEngine>,
  /// Chains this target serves, keyed by id; refreshed from routing.
  chains: RwLock<hashbrown::HashMap<ChainId, ChainInfo>>,
  state: RwLock<TargetState>,
  net: RwLock<Option<Arc<dyn StorageNet>>>,
  /// Outcomes of updates already applied here, for replay dedup.
  seen_updates: Mutex<hashbrown::HashMap<u64, WriteAck>>,
  counters: ChainCounters,
}

impl StorageTarget {
  pub fn new(target_id: TargetId, node_id: NodeId, engine: Arc<dyn ChunkEngine>) -> Self {
    StorageTarget {
      target_id,
      node_id,
      engine,
      chains: RwLock::new(hashbrown::HashMap::new()),
      state: RwLock::new(TargetState::Online),
      net: RwLock::new(None),
      seen_updates: Mutex::new(hashbrown::HashMap::new()),
      counters: ChainCounters::default(),
    }
  }

  pub fn target_id(&self) -> TargetId {
    self.target_id
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  pub fn counters(&self) -> &ChainCounters {
    &self.counters
  }

  pub fn engine(&self) -> &Arc<dyn ChunkEngine> {
    &self.engine
  }

  pub fn set_net(&self, net: Arc<dyn StorageNet>) {
    *self.net.write() = Some(net);
  }

  pub fn state(&self) -> TargetState {
    *self.state.read()
  }

  pub fn set_state(&self, state: TargetState) {
    *self.state.write() = state;
  }

  /// Adopt the chain views and own state from a routing snapshot.
  pub fn apply_routing(&self, routing: &RoutingInfo) {
    let mut chains = self.chains.write();
    chains.clear();
    for chain in routing.chains.values() {
      if chain.targets.contains(&self.target_id) {
        chains.insert(chain.chain_id, chain.clone());
      }
    }
    if let Some(info) = routing.targets.get(&self.target_id) {
      *self.state.write() = info.state;
    }
  }

  fn chain(&self, chain: ChainId) -> Result<ChainInfo> {
    self
      .chains
      .read()
      .get(&chain)
      .cloned()
      .ok_or_else(|| FsError::NotFound(format!("{chain}")))
  }

  fn check_chain_version(&self, chain: &ChainInfo, version: ChainVersion) -> Result<()> {
    if chain.version != version {
      self
        .counters
        .version_mismatches
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      return Err(FsError::VersionMismatch {
        expected: version as u64,
        found: chain.version as u64,
      });
    }
    Ok(())
  }

  fn net(&self) -> Result<Arc<dyn StorageNet>> {
    self
      .net
      .read()
      .clone()
      .ok_or_else(|| FsError::Network("storage net not wired".into()))
  }

  // ==========================================================================
  // Write path
  // ==========================================================================

  /// Client entry point; this target must be the chain's head.
  pub async fn handle_write(&self, req: WriteReq) -> Result<WriteAck> {
    self
      .counters
      .writes
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let chain = self.chain(req.chain)?;
    self.check_chain_version(&chain, req.chain_version)?;
    if chain.head() != Some(self.target_id) {
      return Err(FsError::VersionMismatch {
        expected: req.chain_version as u64,
        found: chain.version as u64,
      });
    }
    self.apply_and_propagate(chain, req).await
  }

  /// Chain-internal entry point for non-head replicas.
  pub fn handle_forward(&self, req: WriteReq) -> BoxFuture<'_, Result<WriteAck>> {
    Box::pin(async move {
      self
        .counters
        .forwards
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
      let chain = self.chain(req.chain)?;
      self.check_chain_version(&chain, req.chain_version)?;
      self.apply_and_propagate(chain, req).await
    })
  }

  /// Shared body: stage locally, hand to the successor, commit on ack.
  /// The tail commits immediately, which is what starts the ack wave.
  async fn apply_and_propagate(&self, chain: ChainInfo, req: WriteReq) -> Result<WriteAck> {
    if let Some(ack) = self.seen_updates.lock().get(&req.update_id) {
      return Ok(*ack);
    }

    let staged_version =
      self
        .engine
        .write(req.chunk, req.chain, req.chain_version, req.offset, &req.data)?;

    let ack = match chain.successor(self.target_id) {
      Some(next) => {
        let ack = self.net()?.forward_update(next, req.clone()).await?;
        self.engine.commit(req.chunk, staged_version)?;
        if ack.chunk_version != staged_version {
          // A replica that disagrees with the tail has diverged and must
          // resync before serving again.
          tracing::warn!(
            target: "kitefs::storage",
            target_id = %self.target_id,
            chunk = %req.chunk,
            local = staged_version,
            tail = ack.chunk_version,
            "chunk version divergence"
          );
          self.set_state(TargetState::LastSync);
        }
        ack
      }
      None => {
        self.engine.commit(req.chunk, staged_version)?;
        WriteAck {
          chunk_version: staged_version,
          chain_version: req.chain_version,
        }
      }
    };

    self
      .counters
      .commits
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    self.seen_updates.lock().insert(req.update_id, ack);
    Ok(ack)
  }

  // ==========================================================================
  // Read path
  // ==========================================================================

  pub async fn handle_read(&self, req: ReadReq) -> Result<ReadResp> {
    self
      .counters
      .reads
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    if !self.state().serves_reads() {
      return Err(FsError::Busy(format!("{} not online", self.target_id)));
    }
    let chain = self.chain(req.chain)?;
    self.check_chain_version(&chain, req.chain_version)?;

    // A chunk with no record at all reads as zeros (sparse file area).
    let meta = self.engine.query(req.chunk)?;
    match meta {
      None => Ok(ReadResp {
        data: vec![0; req.len as usize],
        chunk_version: 0,
        chain_version: chain.version,
      }),
      Some(meta) if meta.uncommitted => {
        // Apportioned query: serve the last committed version, locally if
        // retained, else from the tail which is authoritative.
        if let Some(data) = self.engine.read_committed(req.chunk, req.offset, req.len)? {
          let committed = self
            .engine
            .query_committed(req.chunk)?
            .ok_or_else(|| FsError::Internal("committed meta vanished".into()))?;
          return Ok(ReadResp {
            data,
            chunk_version: committed.chunk_version,
            chain_version: chain.version,
          });
        }
        let tail = chain
          .tail()
          .ok_or_else(|| FsError::Internal("chain has no tail".into()))?;
        if tail == self.target_id {
          // Tail with only an uncommitted record: committed state is
          // still "absent".
          return Ok(ReadResp {
            data: vec![0; req.len as usize],
            chunk_version: 0,
            chain_version: chain.version,
          });
        }
        self.net()?.read_from(tail, req).await
      }
      Some(_) => {
        let data = self
          .engine
          .read_committed(req.chunk, req.offset, req.len)?
          .ok_or_else(|| FsError::Internal("committed data vanished".into()))?;
        let committed = self
          .engine
          .query_committed(req.chunk)?
          .ok_or_else(|| FsError::Internal("committed meta vanished".into()))?;
        Ok(ReadResp {
          data,
          chunk_version: committed.chunk_version,
          chain_version: chain.version,
        })
      }
    }
  }

  // ==========================================================================
  // Maintenance
  // ==========================================================================

  pub fn handle_remove(&self, chunk: ChunkId) -> Result<bool> {
    self.engine.remove(chunk)
  }

  /// Remove up to `limit` of an inode's chunks at or past `from_index`.
  pub fn handle_remove_inode(
    &self,
    inode: crate::types::InodeId,
    from_index: u32,
    limit: usize,
  ) -> Result<usize> {
    let mut removed = 0usize;
    for (chunk, _) in self.engine.list_inode(inode)? {
      if chunk.index < from_index {
        continue;
      }
      if removed == limit {
        break;
      }
      if self.engine.remove(chunk)? {
        removed += 1;
      }
    }
    Ok(removed)
  }

  pub fn handle_query(&self, chunk: ChunkId) -> Result<Option<ChunkMeta>> {
    self.engine.query(chunk)
  }

  /// Serve a resync pull: every committed record of `chain` the
  /// requester is missing or behind on, in version order.
  pub fn serve_resync(&self, req: &ResyncReq) -> Result<ResyncPage> {
    let have: hashbrown::HashMap<ChunkId, ChunkVersion> = req.have.iter().copied().collect();
    let mut records: Vec<ChunkRecord> = self
      .engine
      .list_chain(req.chain)?
      .into_iter()
      .filter(|record| {
        have
          .get(&record.chunk)
          .map(|v| record.chunk_version > *v)
          .unwrap_or(true)
      })
      .collect();
    records.sort_by_key(|record| record.chunk_version);
    Ok(ResyncPage { records })
  }

  /// Pull missing chunks of `chain` from `peer` and install them in
  /// version order. Returns the number of records applied; the caller
  /// reports `Syncing`/`Online` transitions to mgmtd.
  pub async fn run_resync(&self, chain: ChainId, peer: TargetId) -> Result<usize> {
    let have: Vec<(ChunkId, ChunkVersion)> = self
      .engine
      .list_chain(chain)?
      .into_iter()
      .map(|record| (record.chunk, record.chunk_version))
      .collect();
    let page = self
      .net()?
      .fetch_resync(peer, ResyncReq { chain, have })
      .await?;
    let applied = page.records.len();
    for record in &page.records {
      self.engine.install(record)?;
    }
    self
      .counters
      .resynced_chunks
      .fetch_add(applied as u64, std::sync::atomic::Ordering::Relaxed);
    if applied > 0 {
      tracing::info!(
        target: "kitefs::storage",
        target_id = %self.target_id,
        chain = %chain,
        applied,
        "resync applied"
      );
    }
    Ok(applied)
  }

  /// Dispatch one batched sub-operation.
  pub async fn handle_op(&self, op: StorageOp) -> Result<StorageOpResp> {
    match op {
      StorageOp::Write(req) => self.handle_write(req).await.map(StorageOpResp::Write),
      StorageOp::Read(req) => self.handle_read(req).await.map(StorageOpResp::Read),
      StorageOp::Remove { chunk } => self.handle_remove(chunk).map(StorageOpResp::Removed),
      StorageOp::RemoveInode {
        inode,
        from_index,
        limit,
      } => self
        .handle_remove_inode(inode, from_index, limit)
        .map(StorageOpResp::RemovedCount),
      StorageOp::Query { chunk } => self.handle_query(chunk).map(StorageOpResp::Queried),
    }
  }
}
