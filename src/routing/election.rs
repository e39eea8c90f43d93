//! Lease-based primary election over the shared KV.
//!
//! One lease key selects a single primary mgmtd. Followers keep trying to
//! acquire; they only succeed after the incumbent's lease expires. Renewal
//! runs at a period well below the lease duration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::codec::keys;
use crate::codec::{FieldReader, FieldWriter};
use crate::error::Result;
use crate::kv::{run_transaction, KvEngine, KvRetryConfig, Transaction};
use crate::types::{now_ms, NodeId, UnixMillis};

const LEASE_KEY: &str = "mgmtd_lease";

const TAG_HOLDER: u8 = 1;
const TAG_EXPIRES: u8 = 2;

/// The persisted lease document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseInfo {
  pub holder: NodeId,
  pub expires_ms: UnixMillis,
}

impl LeaseInfo {
  fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_HOLDER, self.holder.0)
      .put_u64(TAG_EXPIRES, self.expires_ms);
    w.finish()
  }

  fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    Ok(LeaseInfo {
      holder: NodeId(r.u32(TAG_HOLDER)?),
      expires_ms: r.u64(TAG_EXPIRES)?,
    })
  }
}

pub struct Election<E: KvEngine> {
  kv: Arc<E>,
  node_id: NodeId,
  lease_ms: u64,
  retry: KvRetryConfig,
  primary: AtomicBool,
}

impl<E: KvEngine> Election<E> {
  pub fn new(kv: Arc<E>, node_id: NodeId, lease_ms: u64, retry: KvRetryConfig) -> Self {
    Election {
      kv,
      node_id,
      lease_ms,
      retry,
      primary: AtomicBool::new(false),
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  /// Whether the last acquire/renew round held the lease.
  pub fn is_primary(&self) -> bool {
    self.primary.load(Ordering::Acquire)
  }

  /// Acquire or renew the lease. Succeeds when the lease is free, expired,
  /// or already ours; otherwise leaves the incumbent in place.
  pub async fn try_acquire(&self) -> Result<bool> {
    let node_id = self.node_id;
    let lease_ms = self.lease_ms;
    let (won, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::config_key(LEASE_KEY);
      let now = now_ms();
      let current = txn.get(&key)?.map(|raw| LeaseInfo::decode(&raw)).transpose()?;
      let free = match current {
        None => true,
        Some(lease) => lease.holder == node_id || lease.expires_ms <= now,
      };
      if !free {
        return Ok(false);
      }
      let lease = LeaseInfo {
        holder: node_id,
        expires_ms: now + lease_ms,
      };
      txn.set(&key, &lease.encode());
      Ok(true)
    })
    .await?;

    let was = self.primary.swap(won, Ordering::AcqRel);
    if won && !was {
      tracing::info!(target: "kitefs::mgmtd", node = %self.node_id, "became primary");
    } else if !won && was {
      tracing::warn!(target: "kitefs::mgmtd", node = %self.node_id, "lost primary lease");
    }
    Ok(won)
  }

  /// Give up the lease if we hold it.
  pub async fn release(&self) -> Result<()> {
    let node_id = self.node_id;
    run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::config_key(LEASE_KEY);
      if let Some(raw) = txn.get(&key)? {
        if LeaseInfo::decode(&raw)?.holder == node_id {
          txn.clear(&key);
        }
      }
      Ok(())
    })
    .await?;
    self.primary.store(false, Ordering::Release);
    Ok(())
  }

  /// The current lease document, if any.
  pub async fn current_lease(&self) -> Result<Option<LeaseInfo>> {
    use crate::kv::ReadTransaction;
    let mut txn = self.kv.begin_read_only();
    txn
      .snapshot_get(&keys::config_key(LEASE_KEY))?
      .map(|raw| LeaseInfo::decode(&raw))
      .transpose()
  }
}
