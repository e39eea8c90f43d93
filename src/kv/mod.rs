//! Transactional key-value engine abstraction.
//!
//! The whole metadata plane runs on this contract: serializable read-write
//! transactions with optimistic conflict detection, snapshot-isolated
//! read-only transactions, and commit versionstamps. Any engine providing
//! ACID plus versionstamps satisfies it; [`mem::MemKvEngine`] is the
//! in-process implementation used by tests and single-node deployments.

pub mod mem;
pub mod retry;

pub use mem::MemKvEngine;
pub use retry::{run_transaction, KvRetryConfig};

use crate::error::Result;
use crate::types::Versionstamp;

// ============================================================================
// Selectors and results
// ============================================================================

/// A range boundary: a key plus whether the boundary includes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySelector {
  pub key: Vec<u8>,
  pub inclusive: bool,
}

impl KeySelector {
  pub fn inclusive(key: impl Into<Vec<u8>>) -> Self {
    KeySelector {
      key: key.into(),
      inclusive: true,
    }
  }

  pub fn exclusive(key: impl Into<Vec<u8>>) -> Self {
    KeySelector {
      key: key.into(),
      inclusive: false,
    }
  }
}

/// One key/value pair returned by a range read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
  pub key: Vec<u8>,
  pub value: Vec<u8>,
}

/// An ordered page of range results.
#[derive(Debug, Clone, Default)]
pub struct RangeResult {
  pub entries: Vec<KeyValue>,
  /// True when the range holds more entries past `limit`.
  pub has_more: bool,
}

// ============================================================================
// Transaction handles
// ============================================================================

/// Read surface shared by both handle kinds. Snapshot reads never record
/// conflict points.
pub trait ReadTransaction {
  /// Read a key at the transaction's snapshot without conflict tracking.
  fn snapshot_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

  /// Range read `[begin, end)` honoring selector inclusivity, without
  /// conflict tracking. `limit == 0` means engine default.
  fn snapshot_get_range(
    &mut self,
    begin: &KeySelector,
    end: &KeySelector,
    limit: usize,
  ) -> Result<RangeResult>;

  /// Pin the snapshot to an explicit engine version.
  fn set_read_version(&mut self, version: u64);

  /// The version this transaction reads at.
  fn read_version(&self) -> u64;
}

/// A read-write transaction. Reads via `get`/`get_range` record conflict
/// points; `commit` fails with `Conflict` when any of those keys changed
/// between the read version and the commit version.
pub trait Transaction: ReadTransaction {
  /// Read a key and record a read-conflict point on it.
  fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>>;

  /// Range read recording a read-conflict range `[begin, end)`.
  fn get_range(
    &mut self,
    begin: &KeySelector,
    end: &KeySelector,
    limit: usize,
  ) -> Result<RangeResult>;

  fn set(&mut self, key: &[u8], value: &[u8]);

  fn clear(&mut self, key: &[u8]);

  fn clear_range(&mut self, begin: &[u8], end: &[u8]);

  /// Stage a write whose key receives the 10-byte commit versionstamp at
  /// `stamp_offset`. The template must reserve those bytes.
  fn set_versionstamped_key(&mut self, key_template: &[u8], stamp_offset: usize, value: &[u8]);

  /// Stage a write whose value receives the commit versionstamp at
  /// `stamp_offset`.
  fn set_versionstamped_value(&mut self, key: &[u8], value_template: &[u8], stamp_offset: usize);

  /// Explicitly add a read-conflict point.
  fn add_read_conflict(&mut self, key: &[u8]);

  /// Explicitly add a read-conflict range `[begin, end)`.
  fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]);

  /// Atomically apply the staged writes. Returns the commit versionstamp.
  fn commit(&mut self) -> Result<Versionstamp>;

  /// Abandon the transaction; staged writes are dropped.
  fn cancel(&mut self);

  /// Clear all state and start over at a fresh read version.
  fn reset(&mut self);
}

/// An engine that can mint transaction handles.
pub trait KvEngine: Send + Sync + 'static {
  type ReadTxn: ReadTransaction + Send;
  type Txn: Transaction + Send;

  fn begin_read_only(&self) -> Self::ReadTxn;

  fn begin(&self) -> Self::Txn;
}

/// Drain an entire `[begin, end)` range through paged snapshot reads.
pub fn scan_range<T: ReadTransaction + ?Sized>(
  txn: &mut T,
  begin: &[u8],
  end: &[u8],
  page: usize,
) -> Result<Vec<KeyValue>> {
  let mut out = Vec::new();
  let mut cursor = KeySelector::inclusive(begin.to_vec());
  let end_sel = KeySelector::exclusive(end.to_vec());
  loop {
    let result = txn.snapshot_get_range(&cursor, &end_sel, page)?;
    let more = result.has_more;
    let last_key = result.entries.last().map(|kv| kv.key.clone());
    out.extend(result.entries);
    match (more, last_key) {
      (true, Some(key)) => cursor = KeySelector::exclusive(key),
      _ => return Ok(out),
    }
  }
}

/// `[key, key+1)` scan bounds covering every key with the given prefix.
pub fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
  let begin = prefix.to_vec();
  let mut end = prefix.to_vec();
  for i in (0..end.len()).rev() {
    if end[i] != 0xff {
      end[i] += 1;
      end.truncate(i + 1);
      return (begin, end);
    }
  }
  // All-0xff prefix: scan to the end of keyspace.
  end.push(0xff);
  (begin, end)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_prefix_range_simple() {
    let (b, e) = prefix_range(b"INOD");
    assert_eq!(b, b"INOD".to_vec());
    assert_eq!(e, b"INOE".to_vec());
  }

  #[test]
  fn test_prefix_range_carry() {
    let (b, e) = prefix_range(&[0x41, 0xff]);
    assert_eq!(b, vec![0x41, 0xff]);
    assert_eq!(e, vec![0x42]);
  }
}
