//! In-process transports.
//!
//! The production fabric (RDMA/TCP) is an external collaborator; these
//! registries satisfy the same traits for single-process deployments and
//! tests, with link-cut fault injection for partition scenarios.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::client::RoutingSource;
use crate::error::{FsError, Result};
use crate::kv::KvEngine;
use crate::meta::{MetaNet, MetaRequest, MetaResponse, MetaServer};
use crate::routing::{MgmtdService, RoutingInfo};
use crate::storage::{
  ReadReq, ReadResp, ResyncPage, ResyncReq, StorageNet, StorageOp, StorageOpResp, StorageTarget,
  WriteAck, WriteReq,
};
use crate::types::{NodeId, RoutingVersion, TargetId, Uuid};
use crate::util::BoxFuture;

// ============================================================================
// Meta peer registry
// ============================================================================

/// Type-erased handle to a meta server, so engines of different types
/// could in principle share a fabric.
pub trait MetaPeer: Send + Sync {
  fn handle_request(&self, request: MetaRequest) -> BoxFuture<'_, Result<MetaResponse>>;
}

impl<E: KvEngine> MetaPeer for MetaServer<E> {
  fn handle_request(&self, request: MetaRequest) -> BoxFuture<'_, Result<MetaResponse>> {
    Box::pin(self.handle(request))
  }
}

#[derive(Default)]
pub struct InProcMetaNet {
  peers: RwLock<hashbrown::HashMap<NodeId, Arc<dyn MetaPeer>>>,
  cut: Mutex<hashbrown::HashSet<NodeId>>,
}

impl InProcMetaNet {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn register(&self, node: NodeId, peer: Arc<dyn MetaPeer>) {
    self.peers.write().insert(node, peer);
  }

  pub fn deregister(&self, node: NodeId) {
    self.peers.write().remove(&node);
  }

  /// Sever the link to a node; requests to it fail with `Network`.
  pub fn cut(&self, node: NodeId) {
    self.cut.lock().insert(node);
  }

  pub fn heal(&self, node: NodeId) {
    self.cut.lock().remove(&node);
  }
}

impl MetaNet for InProcMetaNet {
  fn forward(&self, to: NodeId, request: MetaRequest) -> BoxFuture<'_, Result<MetaResponse>> {
    Box::pin(async move {
      if self.cut.lock().contains(&to) {
        return Err(FsError::Network(format!("{to} unreachable")));
      }
      let peer = self
        .peers
        .read()
        .get(&to)
        .cloned()
        .ok_or_else(|| FsError::Network(format!("{to} not registered")))?;
      peer.handle_request(request).await
    })
  }
}

// ============================================================================
// Storage fabric
// ============================================================================

#[derive(Default)]
pub struct InProcStorageNet {
  targets: RwLock<hashbrown::HashMap<TargetId, Arc<StorageTarget>>>,
  cut: Mutex<hashbrown::HashSet<TargetId>>,
}

impl InProcStorageNet {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn register(&self, target: Arc<StorageTarget>) {
    self.targets.write().insert(target.target_id(), target);
  }

  /// Remove a target from the fabric entirely (process kill).
  pub fn deregister(&self, target: TargetId) {
    self.targets.write().remove(&target);
  }

  pub fn cut(&self, target: TargetId) {
    self.cut.lock().insert(target);
  }

  pub fn heal(&self, target: TargetId) {
    self.cut.lock().remove(&target);
  }

  fn lookup(&self, target: TargetId) -> Result<Arc<StorageTarget>> {
    if self.cut.lock().contains(&target) {
      return Err(FsError::Network(format!("{target} unreachable")));
    }
    self
      .targets
      .read()
      .get(&target)
      .cloned()
      .ok_or_else(|| FsError::Network(format!("{target} not registered")))
  }
}

impl StorageNet for InProcStorageNet {
  fn forward_update(&self, to: TargetId, req: WriteReq) -> BoxFuture<'_, Result<WriteAck>> {
    Box::pin(async move {
      let target = self.lookup(to)?;
      target.handle_forward(req).await
    })
  }

  fn read_from(&self, to: TargetId, req: ReadReq) -> BoxFuture<'_, Result<ReadResp>> {
    Box::pin(async move {
      let target = self.lookup(to)?;
      target.handle_read(req).await
    })
  }

  fn fetch_resync(&self, to: TargetId, req: ResyncReq) -> BoxFuture<'_, Result<ResyncPage>> {
    Box::pin(async move {
      let target = self.lookup(to)?;
      target.serve_resync(&req)
    })
  }

  fn send_batch(
    &self,
    _node: NodeId,
    batch: Vec<(TargetId, StorageOp)>,
  ) -> BoxFuture<'_, Vec<Result<StorageOpResp>>> {
    Box::pin(async move {
      let mut out = Vec::with_capacity(batch.len());
      for (target_id, op) in batch {
        match self.lookup(target_id) {
          Ok(target) => out.push(target.handle_op(op).await),
          Err(err) => out.push(Err(err)),
        }
      }
      out
    })
  }
}

// ============================================================================
// Routing source backed by mgmtd
// ============================================================================

pub struct MgmtdRoutingSource<E: KvEngine> {
  svc: Arc<MgmtdService<E>>,
  client_id: Uuid,
  session_ttl_ms: u64,
}

impl<E: KvEngine> MgmtdRoutingSource<E> {
  pub fn new(svc: Arc<MgmtdService<E>>) -> Self {
    MgmtdRoutingSource {
      svc,
      client_id: Uuid::generate(),
      session_ttl_ms: crate::constants::DEFAULT_SESSION_TIMEOUT_MS,
    }
  }
}

impl<E: KvEngine> RoutingSource for MgmtdRoutingSource<E> {
  fn fetch(
    &self,
    since: Option<RoutingVersion>,
  ) -> BoxFuture<'_, Result<Option<RoutingInfo>>> {
    Box::pin(async move {
      // Each fetch doubles as a client-session heartbeat.
      self
        .svc
        .extend_client_session(self.client_id, self.session_ttl_ms);
      self.svc.get_routing_info(since).await
    })
  }
}
