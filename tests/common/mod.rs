//! Shared cluster harness: one mgmtd, N meta servers, M storage targets
//! and a storage client, all wired over the in-process transports.

#![allow(dead_code)]

use std::sync::Arc;

use kitefs::client::StorageClient;
use kitefs::config::{DistributorConfig, MetaConfig, MgmtdConfig, StorageClientConfig};
use kitefs::distributor::MetaDistributor;
use kitefs::kv::{KvRetryConfig, MemKvEngine};
use kitefs::layout::Layout;
use kitefs::meta::{MetaOp, MetaRequest, MetaResponse, MetaServer};
use kitefs::routing::{ChainInfo, MgmtdService, NodeInfo, TargetInfo, TargetState};
use kitefs::storage::{MemChunkEngine, StorageTarget};
use kitefs::types::{ChainId, ChainTableId, InodeId, NodeId, TargetId, UserInfo, Uuid};
use kitefs::wire::{InProcMetaNet, InProcStorageNet, MgmtdRoutingSource};

/// Storage node ids start here; meta servers use 1..=N.
pub const STORAGE_NODE_BASE: u32 = 100;
pub const MGMTD_NODE: u32 = 900;

pub struct Cluster {
  pub kv: Arc<MemKvEngine>,
  pub mgmtd: Arc<MgmtdService<MemKvEngine>>,
  pub meta_net: Arc<InProcMetaNet>,
  pub storage_net: Arc<InProcStorageNet>,
  pub metas: Vec<Arc<MetaServer<MemKvEngine>>>,
  pub targets: Vec<Arc<StorageTarget>>,
  /// The concrete engine behind each target, for direct inspection.
  pub engines: Vec<(TargetId, Arc<MemChunkEngine>)>,
  pub client: Arc<StorageClient>,
  pub client_id: Uuid,
}

impl Cluster {
  /// Build a cluster with `meta_count` meta servers and one chain per
  /// entry of `chains` (each entry lists its replica target ids; each
  /// target lives on its own storage node). Chain table 1 holds all
  /// chains in order.
  pub async fn bootstrap(
    meta_count: u32,
    chains: &[&[u64]],
    chunk_size: u64,
    stripe_size: u32,
  ) -> Cluster {
    let kv = Arc::new(MemKvEngine::new());
    let retry = KvRetryConfig::default();

    let mgmtd = Arc::new(MgmtdService::new(
      kv.clone(),
      NodeId(MGMTD_NODE),
      MgmtdConfig::default(),
      retry.clone(),
    ));
    mgmtd.election().try_acquire().await.unwrap();

    // Register storage topology.
    let mut target_infos = Vec::new();
    let mut chain_infos = Vec::new();
    let mut chain_ids = Vec::new();
    for (chain_index, replicas) in chains.iter().enumerate() {
      let chain_id = ChainId(chain_index as u32 + 1);
      chain_ids.push(chain_id);
      let mut members = Vec::new();
      for target in replicas.iter() {
        let target_id = TargetId(*target);
        members.push(target_id);
        target_infos.push(TargetInfo {
          target_id,
          node_id: NodeId(STORAGE_NODE_BASE + *target as u32),
          disk_index: 0,
          state: TargetState::Online,
        });
      }
      chain_infos.push(ChainInfo::new(chain_id, members));
    }
    for info in &target_infos {
      mgmtd
        .register_node(NodeInfo::new(info.node_id, format!("storage-{}", info.node_id)))
        .await
        .unwrap();
    }
    mgmtd.add_targets(target_infos.clone()).await.unwrap();
    mgmtd.set_chains(chain_infos).await.unwrap();
    mgmtd
      .set_chain_table(ChainTableId(1), chain_ids)
      .await
      .unwrap();

    // Storage targets over in-memory engines.
    let storage_net = InProcStorageNet::new();
    let mut targets = Vec::new();
    let mut engines = Vec::new();
    for info in &target_infos {
      let engine = Arc::new(MemChunkEngine::new());
      engines.push((info.target_id, engine.clone()));
      let target = Arc::new(StorageTarget::new(info.target_id, info.node_id, engine));
      target.set_net(storage_net.clone());
      storage_net.register(target.clone());
      targets.push(target);
    }

    // Meta servers with their distributors.
    let meta_net = InProcMetaNet::new();
    let mut metas = Vec::new();
    for node in 1..=meta_count {
      let distributor = Arc::new(MetaDistributor::new(
        kv.clone(),
        NodeId(node),
        DistributorConfig {
          update_interval_ms: 10,
          failure_timeout_ms: 100,
        },
        retry.clone(),
      ));
      distributor.register().await.unwrap();
      let server = Arc::new(MetaServer::new(
        kv.clone(),
        NodeId(node),
        distributor,
        MetaConfig {
          gc_interval_ms: 10,
          session_timeout_ms: 200,
          ..Default::default()
        },
        retry.clone(),
      ));
      server.set_net(meta_net.clone());
      meta_net.register(NodeId(node), server.clone());
      metas.push(server);
    }
    // Everyone sees the full active set before the first request.
    for server in &metas {
      server.distributor().tick().await.unwrap();
    }

    let root_layout = Layout::template(ChainTableId(1), 1, chunk_size, stripe_size);
    metas[0].bootstrap_root(root_layout).await.unwrap();

    let client_id = Uuid::generate();
    let client = Arc::new(StorageClient::new(
      client_id,
      StorageClientConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 20,
        ..Default::default()
      },
      Arc::new(MgmtdRoutingSource::new(mgmtd.clone())),
      storage_net.clone(),
    ));

    for server in &metas {
      server.set_chunk_remover(client.clone());
    }

    let cluster = Cluster {
      kv,
      mgmtd,
      meta_net,
      storage_net,
      metas,
      targets,
      engines,
      client,
      client_id,
    };
    cluster.refresh_all().await;
    cluster
  }

  /// Push the latest routing snapshot to targets, meta servers and the
  /// client.
  pub async fn refresh_all(&self) {
    let routing = self
      .mgmtd
      .get_routing_info(None)
      .await
      .unwrap()
      .expect("routing snapshot");
    for target in &self.targets {
      target.apply_routing(&routing);
    }
    for server in &self.metas {
      *server.routing_handle().write() = routing.clone();
    }
    self.client.refresh_routing().await.unwrap();
  }

  pub fn target(&self, id: u64) -> &Arc<StorageTarget> {
    self
      .targets
      .iter()
      .find(|t| t.target_id() == TargetId(id))
      .expect("target exists")
  }

  pub fn engine(&self, id: u64) -> &Arc<MemChunkEngine> {
    self
      .engines
      .iter()
      .find(|(t, _)| *t == TargetId(id))
      .map(|(_, e)| e)
      .expect("engine exists")
  }

  /// Issue an op as root through the first meta server.
  pub async fn meta(&self, op: MetaOp) -> kitefs::Result<MetaResponse> {
    self.metas[0]
      .handle(MetaRequest::new(UserInfo::root(), self.client_id, op))
      .await
  }

  /// Issue an op with an explicit request uuid (idempotency tests).
  pub async fn meta_with_uuid(
    &self,
    request: Uuid,
    op: MetaOp,
  ) -> kitefs::Result<MetaResponse> {
    let mut req = MetaRequest::new(UserInfo::root(), self.client_id, op);
    req.request = request;
    self.metas[0].handle(req).await
  }

  /// Convenience: mkdir under root, returning the new inode id.
  pub async fn mkdir_root(&self, name: &str) -> InodeId {
    match self
      .meta(MetaOp::Mkdir {
        parent: InodeId::ROOT,
        name: name.as_bytes().to_vec(),
        mode: 0o755,
      })
      .await
      .unwrap()
    {
      MetaResponse::Inode(inode) => inode.id,
      other => panic!("unexpected response {other:?}"),
    }
  }
}

/// Unwrap an inode response.
pub fn as_inode(resp: MetaResponse) -> kitefs::meta::Inode {
  match resp {
    MetaResponse::Inode(inode) => inode,
    other => panic!("expected inode, got {other:?}"),
  }
}
