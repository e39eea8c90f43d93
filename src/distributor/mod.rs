//! Decentralized meta-server assignment.
//!
//! A cluster of identical meta-servers shares its membership in the KV
//! under the `META` prefix; there is no dedicated coordinator. Liveness
//! rides on versionstamped presence markers: a server whose marker stamp
//! stops advancing is dead. Ownership of an inode is pure consistent
//! hashing over the active set, so membership changes reassign only the
//! dead server's share.

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::codec::keys;
use crate::codec::{FieldReader, FieldWriter};
use crate::config::DistributorConfig;
use crate::error::{FsError, Result};
use crate::kv::{
  run_transaction, scan_range, KvEngine, KvRetryConfig, ReadTransaction, Transaction,
};
use crate::types::{now_ms, InodeId, NodeId, UnixMillis, Versionstamp};

/// Seed for the placement hash. Changing it reshuffles every assignment,
/// so it is fixed for the life of a cluster.
const PLACEMENT_SEED: u64 = 0x6b69_7465_6673_0001;

const SCAN_PAGE: usize = 1024;

// ============================================================================
// Server map
// ============================================================================

const TAG_STAMP: u8 = 1;
const TAG_ACTIVE: u8 = 2;

/// Byte offset of the stamp payload inside an encoded map/marker record:
/// one tag byte plus the four-byte length.
const STAMP_PAYLOAD_OFFSET: usize = 5;

/// The shared membership record. `stamp` is assigned by the KV engine at
/// the commit that last rewrote the map.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerMap {
  pub active: Vec<NodeId>,
  pub stamp: Versionstamp,
}

impl ServerMap {
  /// Encoded form with a zeroed stamp placeholder at
  /// [`STAMP_PAYLOAD_OFFSET`], for `set_versionstamped_value`.
  fn encode_template(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_bytes(TAG_STAMP, &[0u8; Versionstamp::ENCODED_LEN]);
    for node in &self.active {
      w.put_u32(TAG_ACTIVE, node.0);
    }
    w.finish()
  }

  fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let stamp_raw = r.bytes(TAG_STAMP)?;
    let stamp = Versionstamp::from_bytes(stamp_raw)
      .ok_or_else(|| FsError::Fatal("bad server map stamp".into()))?;
    let active = r
      .get_all(TAG_ACTIVE)
      .map(|payload| {
        if payload.len() != 4 {
          return Err(FsError::Fatal("bad node id width".into()));
        }
        Ok(NodeId(BigEndian::read_u32(payload)))
      })
      .collect::<Result<Vec<NodeId>>>()?;
    Ok(ServerMap { active, stamp })
  }
}

/// Placement weight of one server for one inode.
fn weight(node: NodeId, inode: InodeId) -> u128 {
  let mut buf = [0u8; 12];
  BigEndian::write_u32(&mut buf[..4], node.0);
  BigEndian::write_u64(&mut buf[4..], inode.0);
  xxh3_128_with_seed(&buf, PLACEMENT_SEED)
}

/// `argmax` of the placement hash over `active`; ties go to the smaller
/// node id. Pure in `(active, inode)`.
pub fn responsible_server(active: &[NodeId], inode: InodeId) -> Option<NodeId> {
  active
    .iter()
    .copied()
    .max_by_key(|node| (weight(*node, inode), std::cmp::Reverse(node.0)))
}

// ============================================================================
// Distributor
// ============================================================================

#[derive(Debug, Default)]
struct CachedView {
  map: ServerMap,
  /// Stamp of the metadata-version key when the cache was refreshed.
  meta_stamp: Versionstamp,
  /// Last observed marker stamp and when it last advanced, per server.
  liveness: hashbrown::HashMap<NodeId, (Versionstamp, UnixMillis)>,
}

/// One meta-server's view of the shared assignment state.
pub struct MetaDistributor<E: KvEngine> {
  kv: Arc<E>,
  node_id: NodeId,
  config: DistributorConfig,
  retry: KvRetryConfig,
  cached: Mutex<CachedView>,
}

impl<E: KvEngine> MetaDistributor<E> {
  pub fn new(kv: Arc<E>, node_id: NodeId, config: DistributorConfig, retry: KvRetryConfig) -> Self {
    MetaDistributor {
      kv,
      node_id,
      config,
      retry,
      cached: Mutex::new(CachedView::default()),
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  /// The cached active set.
  pub fn active_servers(&self) -> Vec<NodeId> {
    self.cached.lock().map.active.clone()
  }

  /// Owner of `inode` per the cached map.
  pub fn owner_of(&self, inode: InodeId) -> Result<NodeId> {
    responsible_server(&self.cached.lock().map.active, inode)
      .ok_or_else(|| FsError::Busy("no active meta servers".into()))
  }

  /// Whether this server owns `inode` per the cached map.
  pub fn is_local(&self, inode: InodeId) -> bool {
    self.owner_of(inode).map(|o| o == self.node_id).unwrap_or(false)
  }

  /// Join the cluster: write our presence marker and add ourselves to the
  /// shared map in one transaction.
  pub async fn register(&self) -> Result<()> {
    let node_id = self.node_id;
    run_transaction(&*self.kv, &self.retry, true, |txn| {
      let raw = txn.get(&keys::server_map_key())?;
      let mut map = raw
        .map(|raw| ServerMap::decode(&raw))
        .transpose()?
        .unwrap_or_default();

      let marker = [0u8; Versionstamp::ENCODED_LEN];
      txn.set_versionstamped_value(&keys::presence_key(node_id), &marker, 0);

      if !map.active.contains(&node_id) {
        map.active.push(node_id);
        map.active.sort();
        txn.set_versionstamped_value(
          &keys::server_map_key(),
          &map.encode_template(),
          STAMP_PAYLOAD_OFFSET,
        );
        txn.set_versionstamped_value(
          &keys::metadata_version_key(),
          &[0u8; Versionstamp::ENCODED_LEN],
          0,
        );
      }
      Ok(())
    })
    .await?;
    tracing::info!(target: "kitefs::distributor", node = %self.node_id, "meta server registered");
    self.refresh_cache().await?;
    Ok(())
  }

  /// One background-updater round: refresh our own marker, derive the
  /// live set from everyone's markers, correct the shared map if it
  /// drifted, and refresh the local cache only when the metadata version
  /// advanced.
  pub async fn tick(&self) -> Result<()> {
    let node_id = self.node_id;

    // Heartbeat: advance our marker stamp.
    run_transaction(&*self.kv, &self.retry, true, |txn| {
      txn.set_versionstamped_value(
        &keys::presence_key(node_id),
        &[0u8; Versionstamp::ENCODED_LEN],
        0,
      );
      Ok(())
    })
    .await?;

    // Observe everyone's markers and the shared map.
    let (map, markers) = {
      let mut txn = self.kv.begin_read_only();
      let map = txn
        .snapshot_get(&keys::server_map_key())?
        .map(|raw| ServerMap::decode(&raw))
        .transpose()?
        .unwrap_or_default();
      let (begin, end) = keys::presence_range();
      let mut markers = Vec::new();
      for kv in scan_range(&mut txn, &begin, &end, SCAN_PAGE)? {
        if let Some(node) = keys::parse_presence_key(&kv.key) {
          let stamp = Versionstamp::from_bytes(&kv.value)
            .ok_or_else(|| FsError::Fatal("bad presence marker".into()))?;
          markers.push((node, stamp));
        }
      }
      (map, markers)
    };

    // Fold marker stamps into the liveness table.
    let now = now_ms();
    let timeout = self.config.failure_timeout_ms;
    let derived_active: Vec<NodeId> = {
      let mut cached = self.cached.lock();
      for (node, stamp) in &markers {
        let entry = cached
          .liveness
          .entry(*node)
          .or_insert((*stamp, now));
        if *stamp > entry.0 {
          *entry = (*stamp, now);
        }
      }
      let liveness = &cached.liveness;
      let mut active: Vec<NodeId> = markers
        .iter()
        .map(|(node, _)| *node)
        .filter(|node| {
          liveness
            .get(node)
            .map(|(_, last_advanced)| now.saturating_sub(*last_advanced) <= timeout)
            .unwrap_or(false)
        })
        .collect();
      active.sort();
      active
    };

    // Correct the shared map when it drifted from the derived live set.
    if derived_active != map.active && !derived_active.is_empty() {
      let corrected = derived_active.clone();
      let result = run_transaction(&*self.kv, &self.retry, true, |txn| {
        // Re-read under conflict so concurrent correctors serialize.
        let current = txn
          .get(&keys::server_map_key())?
          .map(|raw| ServerMap::decode(&raw))
          .transpose()?
          .unwrap_or_default();
        if current.active == corrected {
          return Ok(false);
        }
        let map = ServerMap {
          active: corrected.clone(),
          stamp: Versionstamp::default(),
        };
        txn.set_versionstamped_value(
          &keys::server_map_key(),
          &map.encode_template(),
          STAMP_PAYLOAD_OFFSET,
        );
        txn.set_versionstamped_value(
          &keys::metadata_version_key(),
          &[0u8; Versionstamp::ENCODED_LEN],
          0,
        );
        Ok(true)
      })
      .await;
      match result {
        Ok((true, _)) => {
          tracing::info!(
            target: "kitefs::distributor",
            active = ?derived_active,
            "server map corrected"
          );
        }
        Ok((false, _)) => {}
        Err(err) => {
          tracing::warn!(target: "kitefs::distributor", error = %err, "map correction failed");
        }
      }
    }

    self.refresh_cache().await
  }

  /// Reload the cached map only when the metadata-version stamp advanced,
  /// so a fleet of servers does not stampede the map key.
  async fn refresh_cache(&self) -> Result<()> {
    let mut txn = self.kv.begin_read_only();
    let meta_stamp = txn
      .snapshot_get(&keys::metadata_version_key())?
      .and_then(|raw| Versionstamp::from_bytes(&raw))
      .unwrap_or_default();
    {
      let cached = self.cached.lock();
      if meta_stamp <= cached.meta_stamp && !cached.map.active.is_empty() {
        return Ok(());
      }
    }
    let map = txn
      .snapshot_get(&keys::server_map_key())?
      .map(|raw| ServerMap::decode(&raw))
      .transpose()?
      .unwrap_or_default();
    let mut cached = self.cached.lock();
    cached.map = map;
    cached.meta_stamp = meta_stamp;
    Ok(())
  }

  /// In-transaction ownership check for metadata batches: reads the map
  /// with conflict tracking and pins the inode key into the read set, so
  /// a reassignment between read and commit fails the transaction.
  pub fn ensure_responsible<T: Transaction>(&self, txn: &mut T, inode: InodeId) -> Result<()> {
    let map = txn
      .get(&keys::server_map_key())?
      .map(|raw| ServerMap::decode(&raw))
      .transpose()?
      .unwrap_or_default();
    let owner = responsible_server(&map.active, inode)
      .ok_or_else(|| FsError::Busy("no active meta servers".into()))?;
    if owner != self.node_id {
      return Err(FsError::Busy(format!("{inode} is owned by {owner}")));
    }
    txn.add_read_conflict(&keys::inode_key(inode));
    Ok(())
  }
}

/// Background updater loop, one per meta server.
pub fn spawn_distributor_updater<E: KvEngine>(
  distributor: Arc<MetaDistributor<E>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let period = std::time::Duration::from_millis(distributor.config.update_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(err) = distributor.tick().await {
            tracing::warn!(target: "kitefs::distributor", error = %err, "updater tick failed");
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}
