//! Cluster management service.
//!
//! The single source of truth for nodes, targets, chains and chain
//! tables. Every state change is one KV transaction that also bumps the
//! monotonic routing version; clients poll `get_routing_info` with the
//! version they hold and receive `None` while current.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::keys;
use crate::config::MgmtdConfig;
use crate::error::{FsError, Result};
use crate::kv::{
  run_transaction, scan_range, KvEngine, KvRetryConfig, ReadTransaction, Transaction,
};
use crate::routing::election::Election;
use crate::routing::state::{
  ChainInfo, ChainTable, NodeInfo, NodeStatus, RoutingInfo, TargetInfo, TargetState,
};
use crate::types::{
  now_ms, ChainId, ChainTableId, ChainTableVersion, NodeId, RoutingVersion, TargetId, UnixMillis,
  Uuid,
};

/// Config key holding the routing version counter.
const ROUTING_VERSION_KEY: &str = "routing_version";

/// Page size for topology scans.
const SCAN_PAGE: usize = 1024;

/// A client's registration with mgmtd, used for lease-based cleanup of
/// its file sessions.
#[derive(Debug, Clone)]
pub struct ClientSession {
  pub client_id: Uuid,
  pub expires_ms: UnixMillis,
}

pub struct MgmtdService<E: KvEngine> {
  kv: Arc<E>,
  config: MgmtdConfig,
  retry: KvRetryConfig,
  election: Election<E>,
  client_sessions: Mutex<hashbrown::HashMap<Uuid, ClientSession>>,
}

impl<E: KvEngine> MgmtdService<E> {
  pub fn new(kv: Arc<E>, node_id: NodeId, config: MgmtdConfig, retry: KvRetryConfig) -> Self {
    let election = Election::new(kv.clone(), node_id, config.lease_ms, retry.clone());
    MgmtdService {
      kv,
      config,
      retry,
      election,
      client_sessions: Mutex::new(hashbrown::HashMap::new()),
    }
  }

  pub fn config(&self) -> &MgmtdConfig {
    &self.config
  }

  pub fn election(&self) -> &Election<E> {
    &self.election
  }

  // ==========================================================================
  // Routing version
  // ==========================================================================

  fn read_routing_version<T: ReadTransaction + ?Sized>(txn: &mut T) -> Result<RoutingVersion> {
    let key = keys::config_key(ROUTING_VERSION_KEY);
    match txn.snapshot_get(&key)? {
      None => Ok(0),
      Some(raw) => {
        let bytes: [u8; 8] = raw
          .as_slice()
          .try_into()
          .map_err(|_| FsError::Fatal("bad routing version width".into()))?;
        Ok(u64::from_be_bytes(bytes))
      }
    }
  }

  /// Bump the routing version inside `txn`. Reads with conflict tracking
  /// so concurrent bumps serialize.
  fn bump_routing_version<T: Transaction>(txn: &mut T) -> Result<RoutingVersion> {
    let key = keys::config_key(ROUTING_VERSION_KEY);
    let current = match txn.get(&key)? {
      None => 0,
      Some(raw) => {
        let bytes: [u8; 8] = raw
          .as_slice()
          .try_into()
          .map_err(|_| FsError::Fatal("bad routing version width".into()))?;
        u64::from_be_bytes(bytes)
      }
    };
    let next = current + 1;
    txn.set(&key, &next.to_be_bytes());
    Ok(next)
  }

  // ==========================================================================
  // Node membership
  // ==========================================================================

  pub async fn register_node(&self, mut info: NodeInfo) -> Result<RoutingVersion> {
    info.last_heartbeat_ms = now_ms();
    info.status = NodeStatus::Online;
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      txn.set(&keys::node_key(info.node_id), &info.encode());
      Self::bump_routing_version(txn)
    })
    .await?;
    tracing::info!(target: "kitefs::mgmtd", node = %info.node_id, "node registered");
    Ok(version)
  }

  pub async fn unregister_node(&self, node_id: NodeId) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      txn.clear(&keys::node_key(node_id));
      Self::bump_routing_version(txn)
    })
    .await?;
    tracing::info!(target: "kitefs::mgmtd", node = %node_id, "node unregistered");
    Ok(version)
  }

  /// Record a heartbeat. Bumps the routing version only when the node
  /// comes back from `Offline`, so steady-state heartbeats stay cheap.
  pub async fn heartbeat(&self, node_id: NodeId) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::node_key(node_id);
      let raw = txn
        .get(&key)?
        .ok_or_else(|| FsError::NotFound(format!("{node_id}")))?;
      let mut info = NodeInfo::decode(&raw)?;
      let came_back = info.status == NodeStatus::Offline;
      info.status = NodeStatus::Online;
      info.last_heartbeat_ms = now_ms();
      txn.set(&key, &info.encode());
      if came_back {
        Self::bump_routing_version(txn)
      } else {
        Self::read_routing_version(txn)
      }
    })
    .await?;
    Ok(version)
  }

  pub async fn set_node_tags(&self, node_id: NodeId, tags: Vec<String>) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::node_key(node_id);
      let raw = txn
        .get(&key)?
        .ok_or_else(|| FsError::NotFound(format!("{node_id}")))?;
      let mut info = NodeInfo::decode(&raw)?;
      info.tags = tags.clone();
      txn.set(&key, &info.encode());
      Self::bump_routing_version(txn)
    })
    .await?;
    Ok(version)
  }

  // ==========================================================================
  // Targets and chains
  // ==========================================================================

  pub async fn add_targets(&self, targets: Vec<TargetInfo>) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      for target in &targets {
        txn.set(&keys::target_info_key(target.target_id), &target.encode());
      }
      Self::bump_routing_version(txn)
    })
    .await?;
    Ok(version)
  }

  /// Upload chain definitions. A chain that already exists keeps its
  /// version counter monotonic: the stored record only adopts the new
  /// membership with `version = old + 1`.
  pub async fn set_chains(&self, chains: Vec<ChainInfo>) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      for chain in &chains {
        let key = keys::chain_info_key(chain.chain_id);
        let mut record = chain.clone();
        if let Some(raw) = txn.get(&key)? {
          let old = ChainInfo::decode(&raw)?;
          record.version = old.version + 1;
        }
        txn.set(&key, &record.encode());
      }
      Self::bump_routing_version(txn)
    })
    .await?;
    Ok(version)
  }

  /// Publish the next version of a chain table. Older versions stay
  /// readable because file layouts pin them.
  pub async fn set_chain_table(
    &self,
    table_id: ChainTableId,
    chains: Vec<ChainId>,
  ) -> Result<ChainTableVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let (begin, end) = keys::chain_table_range(table_id);
      let existing = scan_range(txn, &begin, &end, SCAN_PAGE)?;
      let next_version = existing
        .last()
        .map(|kv| ChainTable::decode(&kv.value).map(|t| t.version + 1))
        .transpose()?
        .unwrap_or(1);
      let table = ChainTable {
        table_id,
        version: next_version,
        chains: chains.clone(),
      };
      txn.set(&keys::chain_table_key(table_id, next_version), &table.encode());
      Self::bump_routing_version(txn)?;
      Ok(next_version)
    })
    .await?;
    tracing::info!(
      target: "kitefs::mgmtd",
      table = table_id.0,
      version,
      "chain table published"
    );
    Ok(version)
  }

  pub async fn rotate_as_preferred_order(&self, chain_id: ChainId) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::chain_info_key(chain_id);
      let raw = txn
        .get(&key)?
        .ok_or_else(|| FsError::NotFound(format!("{chain_id}")))?;
      let mut chain = ChainInfo::decode(&raw)?;
      chain.rotate();
      txn.set(&key, &chain.encode());
      Self::bump_routing_version(txn)
    })
    .await?;
    Ok(version)
  }

  /// Adopt a target state reported by its storage node and reconcile the
  /// serving order of every chain the target belongs to.
  pub async fn report_target_state(
    &self,
    target_id: TargetId,
    state: TargetState,
  ) -> Result<RoutingVersion> {
    let (version, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::target_info_key(target_id);
      let raw = txn
        .get(&key)?
        .ok_or_else(|| FsError::NotFound(format!("{target_id}")))?;
      let mut info = TargetInfo::decode(&raw)?;
      let old_state = info.state;
      info.state = state;
      txn.set(&key, &info.encode());

      if old_state != state {
        let (begin, end) = keys::all_chains_range();
        for kv in scan_range(txn, &begin, &end, SCAN_PAGE)? {
          let mut chain = ChainInfo::decode(&kv.value)?;
          if !chain.targets.contains(&target_id) {
            continue;
          }
          match state {
            TargetState::Online => chain.restore_to_service(target_id),
            _ => chain.remove_from_service(target_id),
          }
          txn.set(&kv.key, &chain.encode());
        }
      }
      Self::bump_routing_version(txn)
    })
    .await?;
    tracing::info!(
      target: "kitefs::mgmtd",
      target = %target_id,
      state = ?state,
      "target state reported"
    );
    Ok(version)
  }

  // ==========================================================================
  // Routing snapshot
  // ==========================================================================

  /// Assemble the current routing snapshot. Returns `None` when the
  /// caller's version is already current.
  pub async fn get_routing_info(
    &self,
    since: Option<RoutingVersion>,
  ) -> Result<Option<RoutingInfo>> {
    let mut txn = self.kv.begin_read_only();
    let version = Self::read_routing_version(&mut txn)?;
    if since == Some(version) {
      return Ok(None);
    }

    let mut routing = RoutingInfo {
      routing_version: version,
      ..Default::default()
    };

    let (begin, end) = keys::all_nodes_range();
    for kv in scan_range(&mut txn, &begin, &end, SCAN_PAGE)? {
      let info = NodeInfo::decode(&kv.value)?;
      routing.nodes.insert(info.node_id, info);
    }
    let (begin, end) = keys::all_targets_range();
    for kv in scan_range(&mut txn, &begin, &end, SCAN_PAGE)? {
      let info = TargetInfo::decode(&kv.value)?;
      routing.targets.insert(info.target_id, info);
    }
    let (begin, end) = keys::all_chains_range();
    for kv in scan_range(&mut txn, &begin, &end, SCAN_PAGE)? {
      let info = ChainInfo::decode(&kv.value)?;
      routing.chains.insert(info.chain_id, info);
    }
    let (begin, end) = crate::kv::prefix_range(crate::constants::PREFIX_CHAIN_TABLE);
    for kv in scan_range(&mut txn, &begin, &end, SCAN_PAGE)? {
      let table = ChainTable::decode(&kv.value)?;
      routing.chain_tables.insert((table.table_id, table.version), table);
    }
    Ok(Some(routing))
  }

  /// Targets persisted in the target table but absent from every chain.
  pub async fn list_orphan_targets(&self) -> Result<Vec<TargetId>> {
    let routing = self
      .get_routing_info(None)
      .await?
      .unwrap_or_default();
    let mut orphans = Vec::new();
    for target_id in routing.targets.keys() {
      let referenced = routing
        .chains
        .values()
        .any(|chain| chain.targets.contains(target_id));
      if !referenced {
        orphans.push(*target_id);
      }
    }
    Ok(orphans)
  }

  // ==========================================================================
  // Dynamic config
  // ==========================================================================

  pub async fn set_config(&self, name: &str, value: &str) -> Result<()> {
    if name == ROUTING_VERSION_KEY {
      return Err(FsError::InvalidArgument(
        "routing_version is managed internally".into(),
      ));
    }
    run_transaction(&*self.kv, &self.retry, true, |txn| {
      txn.set(&keys::config_key(name), value.as_bytes());
      Ok(())
    })
    .await?;
    Ok(())
  }

  pub async fn get_config(&self, name: &str) -> Result<Option<String>> {
    let mut txn = self.kv.begin_read_only();
    match txn.snapshot_get(&keys::config_key(name))? {
      None => Ok(None),
      Some(raw) => String::from_utf8(raw)
        .map(Some)
        .map_err(|_| FsError::Fatal(format!("config {name} is not utf8"))),
    }
  }

  // ==========================================================================
  // Client sessions
  // ==========================================================================

  pub fn get_client_session(&self, client_id: Uuid) -> Option<ClientSession> {
    self.client_sessions.lock().get(&client_id).cloned()
  }

  pub fn extend_client_session(&self, client_id: Uuid, ttl_ms: u64) -> ClientSession {
    let session = ClientSession {
      client_id,
      expires_ms: now_ms() + ttl_ms,
    };
    self
      .client_sessions
      .lock()
      .insert(client_id, session.clone());
    session
  }

  /// Drop expired client sessions; returns how many were removed.
  pub fn prune_client_sessions(&self) -> usize {
    let now = now_ms();
    let mut sessions = self.client_sessions.lock();
    let before = sessions.len();
    sessions.retain(|_, s| s.expires_ms > now);
    before - sessions.len()
  }

  // ==========================================================================
  // Membership checking (heartbeat loop body)
  // ==========================================================================

  /// One pass of the heartbeat checker: nodes silent past the timeout go
  /// `Offline`, their targets leave chain service, and any chain they
  /// headed rotates to a live head. Primary-only.
  pub async fn check_node_liveness(&self) -> Result<usize> {
    if !self.election.is_primary() {
      return Ok(0);
    }
    let timeout = self.config.node_timeout_ms;
    let (marked, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let now = now_ms();
      let mut marked = 0usize;
      let (begin, end) = keys::all_nodes_range();
      let mut dead_nodes = Vec::new();
      for kv in scan_range(txn, &begin, &end, SCAN_PAGE)? {
        let mut info = NodeInfo::decode(&kv.value)?;
        if info.status == NodeStatus::Online
          && now.saturating_sub(info.last_heartbeat_ms) > timeout
        {
          info.status = NodeStatus::Offline;
          txn.set(&kv.key, &info.encode());
          dead_nodes.push(info.node_id);
          marked += 1;
        }
      }
      if dead_nodes.is_empty() {
        return Ok(0);
      }

      // Demote every target living on a dead node and pull it out of
      // chain service.
      let mut dead_targets = Vec::new();
      let (begin, end) = keys::all_targets_range();
      for kv in scan_range(txn, &begin, &end, SCAN_PAGE)? {
        let mut info = TargetInfo::decode(&kv.value)?;
        if dead_nodes.contains(&info.node_id) && info.state != TargetState::Offline {
          info.state = TargetState::Offline;
          txn.set(&kv.key, &info.encode());
          dead_targets.push(info.target_id);
        }
      }
      let (begin, end) = keys::all_chains_range();
      for kv in scan_range(txn, &begin, &end, SCAN_PAGE)? {
        let mut chain = ChainInfo::decode(&kv.value)?;
        let before = chain.version;
        for target in &dead_targets {
          chain.remove_from_service(*target);
        }
        if chain.version != before {
          txn.set(&kv.key, &chain.encode());
        }
      }
      Self::bump_routing_version(txn)?;
      Ok(marked)
    })
    .await?;
    if marked > 0 {
      tracing::warn!(target: "kitefs::mgmtd", nodes = marked, "marked nodes offline");
    }
    Ok(marked)
  }
}
