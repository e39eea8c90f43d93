//! Cluster topology records: nodes, targets, chains, chain tables, and the
//! versioned routing snapshot served to clients.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};

use crate::codec::{FieldReader, FieldWriter};
use crate::error::{FsError, Result};
use crate::types::{
  ChainId, ChainTableId, ChainTableVersion, ChainVersion, NodeId, RoutingVersion, TargetId,
  UnixMillis,
};

// ============================================================================
// Target state
// ============================================================================

/// Local state of one storage target. Recovery walks the staircase
/// `LastSync -> Syncing -> Online`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetState {
  Online,
  Offline,
  LastSync,
  Syncing,
}

impl TargetState {
  fn to_u8(self) -> u8 {
    match self {
      TargetState::Online => 0,
      TargetState::Offline => 1,
      TargetState::LastSync => 2,
      TargetState::Syncing => 3,
    }
  }

  fn from_u8(v: u8) -> Result<Self> {
    match v {
      0 => Ok(TargetState::Online),
      1 => Ok(TargetState::Offline),
      2 => Ok(TargetState::LastSync),
      3 => Ok(TargetState::Syncing),
      other => Err(FsError::Fatal(format!("unknown target state {other}"))),
    }
  }

  pub fn serves_reads(self) -> bool {
    matches!(self, TargetState::Online)
  }
}

/// Role of a target within a chain's serving order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
  Head,
  Middle,
  Tail,
}

// ============================================================================
// Node info
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
  Online,
  Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
  pub node_id: NodeId,
  /// Transport address, opaque to routing.
  pub address: String,
  pub tags: Vec<String>,
  pub status: NodeStatus,
  pub last_heartbeat_ms: UnixMillis,
}

const TAG_NODE_ID: u8 = 1;
const TAG_ADDRESS: u8 = 2;
const TAG_NODE_TAG: u8 = 3;
const TAG_STATUS: u8 = 4;
const TAG_HEARTBEAT: u8 = 5;

impl NodeInfo {
  pub fn new(node_id: NodeId, address: impl Into<String>) -> Self {
    NodeInfo {
      node_id,
      address: address.into(),
      tags: Vec::new(),
      status: NodeStatus::Online,
      last_heartbeat_ms: 0,
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_NODE_ID, self.node_id.0)
      .put_str(TAG_ADDRESS, &self.address)
      .put_u8(
        TAG_STATUS,
        match self.status {
          NodeStatus::Online => 0,
          NodeStatus::Offline => 1,
        },
      )
      .put_u64(TAG_HEARTBEAT, self.last_heartbeat_ms);
    for tag in &self.tags {
      w.put_str(TAG_NODE_TAG, tag);
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let tags = r
      .get_all(TAG_NODE_TAG)
      .map(|payload| {
        std::str::from_utf8(payload)
          .map(str::to_owned)
          .map_err(|_| FsError::Fatal("invalid node tag".into()))
      })
      .collect::<Result<Vec<String>>>()?;
    Ok(NodeInfo {
      node_id: NodeId(r.u32(TAG_NODE_ID)?),
      address: r.str(TAG_ADDRESS)?.to_owned(),
      tags,
      status: match r.u8(TAG_STATUS)? {
        0 => NodeStatus::Online,
        _ => NodeStatus::Offline,
      },
      last_heartbeat_ms: r.u64(TAG_HEARTBEAT)?,
    })
  }
}

// ============================================================================
// Target info
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
  pub target_id: TargetId,
  pub node_id: NodeId,
  pub disk_index: u32,
  pub state: TargetState,
}

const TAG_TARGET_ID: u8 = 1;
const TAG_TARGET_NODE: u8 = 2;
const TAG_DISK_INDEX: u8 = 3;
const TAG_TARGET_STATE: u8 = 4;

impl TargetInfo {
  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u64(TAG_TARGET_ID, self.target_id.0)
      .put_u32(TAG_TARGET_NODE, self.node_id.0)
      .put_u32(TAG_DISK_INDEX, self.disk_index)
      .put_u8(TAG_TARGET_STATE, self.state.to_u8());
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    Ok(TargetInfo {
      target_id: TargetId(r.u64(TAG_TARGET_ID)?),
      node_id: NodeId(r.u32(TAG_TARGET_NODE)?),
      disk_index: r.u32(TAG_DISK_INDEX)?,
      state: TargetState::from_u8(r.u8(TAG_TARGET_STATE)?)?,
    })
  }
}

// ============================================================================
// Chain info
// ============================================================================

/// One replication chain: an ordered replica set. `preferred_order` is the
/// current serving order; position 0 is HEAD, the last position is TAIL.
/// The order may rotate when members fail, always together with a version
/// bump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainInfo {
  pub chain_id: ChainId,
  pub version: ChainVersion,
  /// Full membership, including replicas currently out of service.
  pub targets: Vec<TargetId>,
  /// Serving order over the in-service subset of `targets`.
  pub preferred_order: Vec<TargetId>,
}

const TAG_CHAIN_ID: u8 = 1;
const TAG_CHAIN_VERSION: u8 = 2;
const TAG_CHAIN_TARGET: u8 = 3;
const TAG_PREFERRED: u8 = 4;

impl ChainInfo {
  pub fn new(chain_id: ChainId, targets: Vec<TargetId>) -> Self {
    ChainInfo {
      chain_id,
      version: 1,
      preferred_order: targets.clone(),
      targets,
    }
  }

  pub fn head(&self) -> Option<TargetId> {
    self.preferred_order.first().copied()
  }

  pub fn tail(&self) -> Option<TargetId> {
    self.preferred_order.last().copied()
  }

  /// The serving successor of `target`, if any.
  pub fn successor(&self, target: TargetId) -> Option<TargetId> {
    let pos = self.preferred_order.iter().position(|t| *t == target)?;
    self.preferred_order.get(pos + 1).copied()
  }

  /// The serving predecessor of `target`, if any.
  pub fn predecessor(&self, target: TargetId) -> Option<TargetId> {
    let pos = self.preferred_order.iter().position(|t| *t == target)?;
    pos.checked_sub(1).and_then(|p| self.preferred_order.get(p)).copied()
  }

  pub fn role_of(&self, target: TargetId) -> Option<ChainRole> {
    let pos = self.preferred_order.iter().position(|t| *t == target)?;
    Some(if pos == 0 {
      ChainRole::Head
    } else if pos + 1 == self.preferred_order.len() {
      ChainRole::Tail
    } else {
      ChainRole::Middle
    })
  }

  /// Rotate the serving order so the current head moves last. Bumps the
  /// chain version; clients carrying the old version get
  /// `VersionMismatch` and refresh.
  pub fn rotate(&mut self) {
    if self.preferred_order.len() > 1 {
      self.preferred_order.rotate_left(1);
    }
    self.version += 1;
  }

  /// Drop `target` from the serving order (membership is kept). Bumps the
  /// version when the order changed.
  pub fn remove_from_service(&mut self, target: TargetId) {
    let before = self.preferred_order.len();
    self.preferred_order.retain(|t| *t != target);
    if self.preferred_order.len() != before {
      self.version += 1;
    }
  }

  /// Return a recovered member to the end of the serving order (it caught
  /// up via resync, so it must not immediately head the chain).
  pub fn restore_to_service(&mut self, target: TargetId) {
    if self.targets.contains(&target) && !self.preferred_order.contains(&target) {
      self.preferred_order.push(target);
      self.version += 1;
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_CHAIN_ID, self.chain_id.0)
      .put_u32(TAG_CHAIN_VERSION, self.version);
    for t in &self.targets {
      w.put_u64(TAG_CHAIN_TARGET, t.0);
    }
    for t in &self.preferred_order {
      w.put_u64(TAG_PREFERRED, t.0);
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let read_targets = |tag: u8| -> Result<Vec<TargetId>> {
      r.get_all(tag)
        .map(|payload| {
          if payload.len() != 8 {
            return Err(FsError::Fatal("bad target id width".into()));
          }
          Ok(TargetId(BigEndian::read_u64(payload)))
        })
        .collect()
    };
    Ok(ChainInfo {
      chain_id: ChainId(r.u32(TAG_CHAIN_ID)?),
      version: r.u32(TAG_CHAIN_VERSION)?,
      targets: read_targets(TAG_CHAIN_TARGET)?,
      preferred_order: read_targets(TAG_PREFERRED)?,
    })
  }
}

// ============================================================================
// Chain table
// ============================================================================

/// Versioned mapping of logical slots to chain ids. Layouts reference a
/// table by id and version, so every published version stays readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTable {
  pub table_id: ChainTableId,
  pub version: ChainTableVersion,
  pub chains: Vec<ChainId>,
}

const TAG_TABLE_ID: u8 = 1;
const TAG_TABLE_VERSION: u8 = 2;
const TAG_TABLE_CHAIN: u8 = 3;

impl ChainTable {
  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_TABLE_ID, self.table_id.0)
      .put_u32(TAG_TABLE_VERSION, self.version);
    for c in &self.chains {
      w.put_u32(TAG_TABLE_CHAIN, c.0);
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let chains = r
      .get_all(TAG_TABLE_CHAIN)
      .map(|payload| {
        if payload.len() != 4 {
          return Err(FsError::Fatal("bad chain id width".into()));
        }
        Ok(ChainId(BigEndian::read_u32(payload)))
      })
      .collect::<Result<Vec<ChainId>>>()?;
    Ok(ChainTable {
      table_id: ChainTableId(r.u32(TAG_TABLE_ID)?),
      version: r.u32(TAG_TABLE_VERSION)?,
      chains,
    })
  }
}

// ============================================================================
// Routing snapshot
// ============================================================================

/// A monotonically versioned snapshot of the whole topology, assembled by
/// mgmtd and cached by clients. Version regression observed by a client is
/// an error.
#[derive(Debug, Clone, Default)]
pub struct RoutingInfo {
  pub routing_version: RoutingVersion,
  pub nodes: BTreeMap<NodeId, NodeInfo>,
  pub targets: BTreeMap<TargetId, TargetInfo>,
  pub chains: BTreeMap<ChainId, ChainInfo>,
  /// Every published chain table version, keyed `(table, version)`.
  pub chain_tables: BTreeMap<(ChainTableId, ChainTableVersion), ChainTable>,
}

impl RoutingInfo {
  /// Resolve a layout's chain reference through a pinned table version.
  pub fn resolve(
    &self,
    table: ChainTableId,
    version: ChainTableVersion,
    chain_ref: u32,
  ) -> Result<ChainId> {
    let table = self
      .chain_tables
      .get(&(table, version))
      .ok_or_else(|| FsError::NotFound(format!("chain table {}@{version}", table.0)))?;
    table
      .chains
      .get(chain_ref as usize)
      .copied()
      .ok_or_else(|| FsError::InvalidArgument(format!("chain ref {chain_ref} out of range")))
  }

  pub fn chain(&self, chain_id: ChainId) -> Result<&ChainInfo> {
    self
      .chains
      .get(&chain_id)
      .ok_or_else(|| FsError::NotFound(format!("{chain_id}")))
  }

  /// Latest version of a chain table, for layout creation.
  pub fn latest_chain_table(&self, table: ChainTableId) -> Option<&ChainTable> {
    self
      .chain_tables
      .range((table, 0)..=(table, ChainTableVersion::MAX))
      .next_back()
      .map(|(_, t)| t)
  }

  pub fn target_node(&self, target: TargetId) -> Result<NodeId> {
    self
      .targets
      .get(&target)
      .map(|t| t.node_id)
      .ok_or_else(|| FsError::NotFound(format!("{target}")))
  }

  /// Replicas of a chain currently serving reads, in preferred order.
  pub fn online_replicas(&self, chain_id: ChainId) -> Result<Vec<TargetId>> {
    let chain = self.chain(chain_id)?;
    Ok(
      chain
        .preferred_order
        .iter()
        .copied()
        .filter(|t| {
          self
            .targets
            .get(t)
            .map(|info| info.state.serves_reads())
            .unwrap_or(false)
        })
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_node_info_roundtrip() {
    let mut info = NodeInfo::new(NodeId(3), "10.0.0.3:9000");
    info.tags = vec!["ssd".into(), "rack-a".into()];
    info.last_heartbeat_ms = 123;
    assert_eq!(NodeInfo::decode(&info.encode()).unwrap(), info);
  }

  #[test]
  fn test_target_info_roundtrip() {
    let info = TargetInfo {
      target_id: TargetId(10),
      node_id: NodeId(2),
      disk_index: 4,
      state: TargetState::LastSync,
    };
    assert_eq!(TargetInfo::decode(&info.encode()).unwrap(), info);
  }

  #[test]
  fn test_chain_roles_and_rotation() {
    let mut chain = ChainInfo::new(ChainId(1), vec![TargetId(1), TargetId(2), TargetId(3)]);
    assert_eq!(chain.role_of(TargetId(1)), Some(ChainRole::Head));
    assert_eq!(chain.role_of(TargetId(2)), Some(ChainRole::Middle));
    assert_eq!(chain.role_of(TargetId(3)), Some(ChainRole::Tail));
    assert_eq!(chain.successor(TargetId(1)), Some(TargetId(2)));
    assert_eq!(chain.predecessor(TargetId(1)), None);

    let v = chain.version;
    chain.rotate();
    assert_eq!(chain.version, v + 1);
    assert_eq!(chain.head(), Some(TargetId(2)));
    assert_eq!(chain.tail(), Some(TargetId(1)));
  }

  #[test]
  fn test_chain_service_membership() {
    let mut chain = ChainInfo::new(ChainId(1), vec![TargetId(1), TargetId(2), TargetId(3)]);
    chain.remove_from_service(TargetId(1));
    assert_eq!(chain.head(), Some(TargetId(2)));
    assert_eq!(chain.version, 2);
    // Recovered member rejoins at the tail end.
    chain.restore_to_service(TargetId(1));
    assert_eq!(chain.tail(), Some(TargetId(1)));
    assert_eq!(chain.version, 3);
    // Unknown member is ignored.
    chain.restore_to_service(TargetId(9));
    assert_eq!(chain.version, 3);
  }

  #[test]
  fn test_chain_info_roundtrip() {
    let mut chain = ChainInfo::new(ChainId(7), vec![TargetId(4), TargetId(5)]);
    chain.rotate();
    assert_eq!(ChainInfo::decode(&chain.encode()).unwrap(), chain);
  }

  #[test]
  fn test_routing_resolve() {
    let mut routing = RoutingInfo::default();
    routing.chain_tables.insert(
      (ChainTableId(1), 2),
      ChainTable {
        table_id: ChainTableId(1),
        version: 2,
        chains: vec![ChainId(10), ChainId(11)],
      },
    );
    assert_eq!(routing.resolve(ChainTableId(1), 2, 1).unwrap(), ChainId(11));
    assert!(routing.resolve(ChainTableId(1), 1, 0).is_err());
    assert!(routing.resolve(ChainTableId(1), 2, 5).is_err());
    assert_eq!(
      routing.latest_chain_table(ChainTableId(1)).unwrap().version,
      2
    );
  }

  #[test]
  fn test_online_replicas_filters_state() {
    let mut routing = RoutingInfo::default();
    let chain = ChainInfo::new(ChainId(1), vec![TargetId(1), TargetId(2)]);
    routing.chains.insert(ChainId(1), chain);
    routing.targets.insert(
      TargetId(1),
      TargetInfo {
        target_id: TargetId(1),
        node_id: NodeId(1),
        disk_index: 0,
        state: TargetState::Offline,
      },
    );
    routing.targets.insert(
      TargetId(2),
      TargetInfo {
        target_id: TargetId(2),
        node_id: NodeId(2),
        disk_index: 0,
        state: TargetState::Online,
      },
    );
    assert_eq!(routing.online_replicas(ChainId(1)).unwrap(), vec![TargetId(2)]);
  }
}
