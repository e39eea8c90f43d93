//! The stateless metadata server.
//!
//! Dispatch: authenticate, route through the distributor (forwarding at
//! most once), then either answer read operations directly or fold
//! mutations into the owning inode's batch lane. A lane runs one
//! transaction at a time; every queued operation either becomes the
//! lane's runner or waits for its result on a oneshot.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::config::MetaConfig;
use crate::distributor::MetaDistributor;
use crate::error::{FsError, Result};
use crate::kv::{run_transaction, KvEngine, KvRetryConfig};
use crate::meta::gc::ChunkRemover;
use crate::meta::ops::{self, IdSource, MetaOp, MetaResponse, OpCtx, PostAction};
use crate::meta::store::{self, InodeAllocator, StoredResult};
use crate::metrics::MetaCounters;
use crate::routing::RoutingInfo;
use crate::types::{now_ms, InodeId, NodeId, UserInfo, Uuid};
use crate::util::BoxFuture;

// ============================================================================
// Requests and forwarding
// ============================================================================

/// The envelope every metadata request carries.
#[derive(Debug, Clone)]
pub struct MetaRequest {
  pub user: UserInfo,
  pub client_id: Uuid,
  pub request: Uuid,
  /// Set when the request was already forwarded once; a second hop is
  /// refused with `Busy`.
  pub hop: bool,
  pub op: MetaOp,
}

impl MetaRequest {
  pub fn new(user: UserInfo, client_id: Uuid, op: MetaOp) -> Self {
    MetaRequest {
      user,
      client_id,
      request: Uuid::generate(),
      hop: false,
      op,
    }
  }
}

/// Reaches peer meta servers for single-hop forwarding.
pub trait MetaNet: Send + Sync {
  fn forward(&self, to: NodeId, request: MetaRequest) -> BoxFuture<'_, Result<MetaResponse>>;
}

// ============================================================================
// Batch lanes
// ============================================================================

struct Pending {
  user: UserInfo,
  client_id: Uuid,
  request: Uuid,
  op: MetaOp,
  done: oneshot::Sender<Result<MetaResponse>>,
}

#[derive(Default)]
struct Lanes {
  locks: Mutex<hashbrown::HashMap<InodeId, Arc<tokio::sync::Mutex<()>>>>,
  queues: Mutex<hashbrown::HashMap<InodeId, VecDeque<Pending>>>,
}

impl Lanes {
  fn lock_of(&self, inode: InodeId) -> Arc<tokio::sync::Mutex<()>> {
    self.locks.lock().entry(inode).or_default().clone()
  }

  fn enqueue(&self, inode: InodeId, pending: Pending) {
    self.queues.lock().entry(inode).or_default().push_back(pending);
  }

  fn drain(&self, inode: InodeId, max: usize) -> Vec<Pending> {
    let mut queues = self.queues.lock();
    match queues.get_mut(&inode) {
      None => Vec::new(),
      Some(queue) => {
        let take = queue.len().min(max);
        queue.drain(..take).collect()
      }
    }
  }
}

// ============================================================================
// Server
// ============================================================================

pub struct MetaServer<E: KvEngine> {
  kv: Arc<E>,
  node_id: NodeId,
  distributor: Arc<MetaDistributor<E>>,
  allocator: InodeAllocator<E>,
  config: MetaConfig,
  retry: KvRetryConfig,
  routing: Arc<RwLock<RoutingInfo>>,
  lanes: Lanes,
  net: RwLock<Option<Arc<dyn MetaNet>>>,
  remover: RwLock<Option<Arc<dyn ChunkRemover>>>,
  counters: MetaCounters,
}

impl<E: KvEngine> IdSource for InodeAllocator<E> {
  fn take(&self) -> Result<InodeId> {
    InodeAllocator::take(self)
  }
}

impl<E: KvEngine> MetaServer<E> {
  pub fn new(
    kv: Arc<E>,
    node_id: NodeId,
    distributor: Arc<MetaDistributor<E>>,
    config: MetaConfig,
    retry: KvRetryConfig,
  ) -> Self {
    let allocator = InodeAllocator::new(kv.clone(), retry.clone());
    MetaServer {
      kv,
      node_id,
      distributor,
      allocator,
      config,
      retry,
      routing: Arc::new(RwLock::new(RoutingInfo::default())),
      lanes: Lanes::default(),
      net: RwLock::new(None),
      remover: RwLock::new(None),
      counters: MetaCounters::default(),
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  pub fn distributor(&self) -> &Arc<MetaDistributor<E>> {
    &self.distributor
  }

  pub fn counters(&self) -> &MetaCounters {
    &self.counters
  }

  pub fn config(&self) -> &MetaConfig {
    &self.config
  }

  /// Shared routing cache; the deployment refreshes it from mgmtd.
  pub fn routing_handle(&self) -> Arc<RwLock<RoutingInfo>> {
    self.routing.clone()
  }

  pub fn set_net(&self, net: Arc<dyn MetaNet>) {
    *self.net.write() = Some(net);
  }

  pub fn set_chunk_remover(&self, remover: Arc<dyn ChunkRemover>) {
    *self.remover.write() = Some(remover);
  }

  /// Ensure the root directory exists. Runs once per cluster; later calls
  /// are no-ops.
  pub async fn bootstrap_root(&self, layout: crate::layout::Layout) -> Result<()> {
    run_transaction(&*self.kv, &self.retry, true, |txn| {
      if store::try_load_inode(txn, InodeId::ROOT)?.is_some() {
        return Ok(());
      }
      let root = crate::meta::inode::Inode::new_directory(
        InodeId::ROOT,
        InodeId::ROOT,
        b"",
        crate::types::Acl::new(0, 0, 0o755),
        layout.clone(),
      );
      store::save_inode(txn, &root);
      Ok(())
    })
    .await?;
    Ok(())
  }

  // ==========================================================================
  // Dispatch
  // ==========================================================================

  pub async fn handle(&self, request: MetaRequest) -> Result<MetaResponse> {
    self.counters.ops.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    {
      let mut txn = self.kv.begin_read_only();
      store::authenticate(&mut txn, &request.user)?;
    }

    // Route to the owning server; forward at most once.
    if let Some(inode) = request.op.routing_inode() {
      if !self.distributor.is_local(inode) {
        if request.hop {
          return Err(FsError::Busy(format!("{inode} is not local")));
        }
        let owner = self.distributor.owner_of(inode)?;
        let net = self.net.read().clone().ok_or_else(|| {
          FsError::Busy(format!("{inode} is owned by {owner} and no peer link exists"))
        })?;
        self
          .counters
          .forwards
          .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut forwarded = request.clone();
        forwarded.hop = true;
        return net.forward(owner, forwarded).await;
      }
    }

    if !request.op.is_mutation() {
      return self.handle_read(&request);
    }

    match &request.op {
      MetaOp::Rename {
        src_parent,
        src_name,
        dst_parent,
        dst_name,
      } => {
        self
          .run_rename(
            &request,
            *src_parent,
            src_name.clone(),
            *dst_parent,
            dst_name.clone(),
          )
          .await
      }
      // Cluster-wide mutations belong to no inode: no lane, no
      // ownership check.
      MetaOp::PruneSessions | MetaOp::UserAdd { .. } => self.run_unrouted(&request).await,
      _ => self.submit_to_lane(request).await,
    }
  }

  async fn run_unrouted(&self, request: &MetaRequest) -> Result<MetaResponse> {
    let routing = self.routing.read().clone();
    let now = now_ms();
    let (response, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let ctx = OpCtx {
        user: request.user.clone(),
        request: request.request,
        client_id: request.client_id,
        now,
        routing: &routing,
        ids: &self.allocator,
        session_timeout_ms: self.config.session_timeout_ms,
      };
      if let Some(stored) = store::read_idem(txn, ctx.request, request.op.idem_tag())? {
        return self.replay_stored(txn, stored);
      }
      let (response, _) = match &request.op {
        MetaOp::PruneSessions => ops::apply_prune_sessions(&ctx, txn)?,
        MetaOp::UserAdd { record } => ops::apply_user_add(&ctx, txn, record)?,
        other => return Err(FsError::Internal(format!("{other:?} is inode-routed"))),
      };
      store::write_idem(txn, ctx.request, request.op.idem_tag(), &StoredResult::Unit);
      Ok(response)
    })
    .await?;
    Ok(response)
  }

  fn handle_read(&self, request: &MetaRequest) -> Result<MetaResponse> {
    let mut txn = self.kv.begin();
    match &request.op {
      MetaOp::Stat { target } => ops::read_stat(&mut txn, target),
      MetaOp::BatchStat { inodes } => ops::read_batch_stat(&mut txn, inodes),
      MetaOp::List { dir, cursor, limit } => {
        let limit = if *limit == 0 { self.config.list_limit } else { *limit };
        ops::read_list(&mut txn, &request.user, *dir, cursor.as_deref(), limit)
      }
      MetaOp::GetRealPath { inode } => ops::read_real_path(&mut txn, *inode),
      MetaOp::ListXattr { inode } => ops::read_list_xattr(&mut txn, *inode),
      MetaOp::Statfs => Ok(ops::read_statfs(&self.routing.read())),
      other => Err(FsError::Internal(format!("{other:?} is not a read op"))),
    }
  }

  // ==========================================================================
  // Batch execution
  // ==========================================================================

  async fn submit_to_lane(&self, request: MetaRequest) -> Result<MetaResponse> {
    let lane = request
      .op
      .routing_inode()
      .unwrap_or(InodeId::ROOT);

    // Creates consume an id; make sure the local block has one per
    // queued operation before entering the transaction.
    if matches!(
      request.op,
      MetaOp::Create { .. } | MetaOp::Mkdir { .. } | MetaOp::Symlink { .. }
    ) {
      self.allocator.reserve(self.config.batch_size).await?;
    }

    let (done, mut rx) = oneshot::channel();
    self.lanes.enqueue(
      lane,
      Pending {
        user: request.user,
        client_id: request.client_id,
        request: request.request,
        op: request.op,
        done,
      },
    );

    let lock = self.lanes.lock_of(lane);
    tokio::select! {
      result = &mut rx => {
        result.map_err(|_| FsError::Internal("batch runner dropped".into()))?
      }
      guard = lock.lock_owned() => {
        loop {
          let batch = self.lanes.drain(lane, self.config.batch_size);
          if batch.is_empty() {
            break;
          }
          self.execute_batch(lane, batch).await;
        }
        drop(guard);
        rx.await
          .map_err(|_| FsError::Internal("batch runner dropped".into()))?
      }
    }
  }

  /// Run one lane batch in a single transaction. Semantic failures are
  /// per-operation results; a commit conflict fails and retries the whole
  /// batch through the KV retry driver.
  async fn execute_batch(&self, lane: InodeId, batch: Vec<Pending>) {
    self
      .counters
      .batches
      .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let routing = self.routing.read().clone();
    let now = now_ms();

    let outcome = run_transaction(&*self.kv, &self.retry, true, |txn| {
      self.distributor.ensure_responsible(txn, lane)?;
      let mut results: Vec<Result<MetaResponse>> = Vec::with_capacity(batch.len());
      let mut actions: Vec<PostAction> = Vec::new();
      for pending in &batch {
        let ctx = OpCtx {
          user: pending.user.clone(),
          request: pending.request,
          client_id: pending.client_id,
          now,
          routing: &routing,
          ids: &self.allocator,
          session_timeout_ms: self.config.session_timeout_ms,
        };
        results.push(self.apply_one(&ctx, txn, &pending.op, &mut actions));
      }
      Ok((results, actions))
    })
    .await;

    match outcome {
      Ok(((results, actions), _stamp)) => {
        for (pending, result) in batch.into_iter().zip(results) {
          let _ = pending.done.send(result);
        }
        self.run_post_actions(actions).await;
      }
      Err(err) => {
        for pending in batch {
          let _ = pending.done.send(Err(err.clone()));
        }
      }
    }
  }

  fn apply_one<T: crate::kv::Transaction>(
    &self,
    ctx: &OpCtx<'_>,
    txn: &mut T,
    op: &MetaOp,
    actions: &mut Vec<PostAction>,
  ) -> Result<MetaResponse> {
    // Idempotency read-through: a replayed request returns its recorded
    // result without reapplying side effects.
    if let Some(stored) = store::read_idem(txn, ctx.request, op.idem_tag())? {
      return self.replay_stored(txn, stored);
    }

    let (response, mut new_actions) = match op {
      MetaOp::Create {
        parent,
        name,
        mode,
        flags,
        layout,
        session,
      } => ops::apply_create(ctx, txn, *parent, name, *mode, *flags, layout.as_ref(), *session)?,
      MetaOp::Open {
        target,
        flags,
        session,
      } => ops::apply_open(ctx, txn, target, *flags, *session)?,
      MetaOp::Close {
        inode,
        session,
        length,
      } => ops::apply_close(ctx, txn, *inode, *session, *length)?,
      MetaOp::Sync { inode, length } => ops::apply_sync(ctx, txn, *inode, *length)?,
      MetaOp::Mkdir { parent, name, mode } => ops::apply_mkdir(ctx, txn, *parent, name, *mode)?,
      MetaOp::Remove { parent, name } => ops::apply_remove(ctx, txn, *parent, name)?,
      MetaOp::Symlink {
        parent,
        name,
        target,
      } => ops::apply_symlink(ctx, txn, *parent, name, target)?,
      MetaOp::Hardlink {
        parent,
        name,
        target,
      } => ops::apply_hardlink(ctx, txn, *parent, name, *target)?,
      MetaOp::SetAttr { inode, attrs } => ops::apply_setattr(ctx, txn, *inode, attrs)?,
      MetaOp::Truncate { inode, length } => ops::apply_truncate(ctx, txn, *inode, *length)?,
      MetaOp::SetLayout { dir, layout } => ops::apply_set_layout(ctx, txn, *dir, layout)?,
      MetaOp::ExtendSession { inode, session } => {
        ops::apply_extend_session(ctx, txn, *inode, *session)?
      }
      MetaOp::PruneSessions => ops::apply_prune_sessions(ctx, txn)?,
      MetaOp::UserAdd { record } => ops::apply_user_add(ctx, txn, record)?,
      MetaOp::Rename { .. } => {
        return Err(FsError::Internal("rename does not run in a lane".into()))
      }
      other => return Err(FsError::Internal(format!("{other:?} is not a mutation"))),
    };

    let stored = match &response {
      MetaResponse::Inode(inode) => StoredResult::Inode(inode.id),
      _ => StoredResult::Unit,
    };
    store::write_idem(txn, ctx.request, op.idem_tag(), &stored);
    actions.append(&mut new_actions);
    Ok(response)
  }

  fn replay_stored<T: crate::kv::Transaction>(
    &self,
    txn: &mut T,
    stored: StoredResult,
  ) -> Result<MetaResponse> {
    match stored {
      StoredResult::Unit => Ok(MetaResponse::Unit),
      StoredResult::Inode(id) => Ok(MetaResponse::Inode(store::load_inode(txn, id)?)),
    }
  }

  async fn run_rename(
    &self,
    request: &MetaRequest,
    src_parent: InodeId,
    src_name: Vec<u8>,
    dst_parent: InodeId,
    dst_name: Vec<u8>,
  ) -> Result<MetaResponse> {
    // Deterministic lane order: smaller inode id first.
    let mut lanes = vec![src_parent, dst_parent];
    lanes.sort();
    lanes.dedup();
    let mut guards = Vec::with_capacity(lanes.len());
    for lane in lanes {
      guards.push(self.lanes.lock_of(lane).lock_owned().await);
    }

    let routing = self.routing.read().clone();
    let now = now_ms();
    let (response, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      self.distributor.ensure_responsible(txn, src_parent)?;
      let ctx = OpCtx {
        user: request.user.clone(),
        request: request.request,
        client_id: request.client_id,
        now,
        routing: &routing,
        ids: &self.allocator,
        session_timeout_ms: self.config.session_timeout_ms,
      };
      if let Some(stored) = store::read_idem(txn, ctx.request, "rename")? {
        return self.replay_stored(txn, stored);
      }
      let (response, _) =
        ops::apply_rename(&ctx, txn, src_parent, &src_name, dst_parent, &dst_name)?;
      let stored = match &response {
        MetaResponse::Inode(inode) => StoredResult::Inode(inode.id),
        _ => StoredResult::Unit,
      };
      store::write_idem(txn, ctx.request, "rename", &stored);
      Ok(response)
    })
    .await?;
    Ok(response)
  }

  async fn run_post_actions(&self, actions: Vec<PostAction>) {
    if actions.is_empty() {
      return;
    }
    let remover = self.remover.read().clone();
    let Some(remover) = remover else {
      // No storage client wired (metadata-only deployment); GC will
      // reclaim the chunks when the inode dies.
      return;
    };
    for action in actions {
      match action {
        PostAction::RemoveChunks { inode, from_index } => {
          if let Err(err) = remover
            .remove_chunks(inode, from_index, self.config.remove_chunks_batch_size)
            .await
          {
            tracing::warn!(
              target: "kitefs::meta",
              inode = %inode,
              error = %err,
              "post-commit chunk removal failed"
            );
          }
        }
      }
    }
  }
}
