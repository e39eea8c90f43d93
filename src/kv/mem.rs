//! In-memory KV engine.
//!
//! A sorted map guarded by a coarse lock plus a global commit counter.
//! Serializable isolation comes from optimistic validation at commit: the
//! engine tracks the last-modified version of every key (including
//! clears), and a transaction whose read set intersects versions newer
//! than its read version fails with `Conflict`.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{FsError, Result};
use crate::kv::{KeySelector, KeyValue, KvEngine, RangeResult, ReadTransaction, Transaction};
use crate::types::Versionstamp;

/// Page size used when a range read passes `limit == 0`.
const DEFAULT_RANGE_LIMIT: usize = 4096;

// ============================================================================
// Shared store
// ============================================================================

#[derive(Debug, Default)]
struct FaultPlan {
  /// Apply the next commit but report `MaybeCommitted`.
  maybe_committed_once: bool,
  /// Fail the next commit with `Conflict` without applying.
  conflict_once: bool,
  /// Fail the next commit with `Throttled` without applying.
  throttled_once: bool,
}

#[derive(Debug, Default)]
struct Store {
  map: BTreeMap<Vec<u8>, Vec<u8>>,
  /// Last commit version that modified each key. Clears are recorded here
  /// too so they participate in conflict detection.
  versions: BTreeMap<Vec<u8>, u64>,
  commit_version: u64,
  faults: FaultPlan,
}

impl Store {
  fn range_bounds(begin: &KeySelector, end: &KeySelector) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let lo = if begin.inclusive {
      Bound::Included(begin.key.clone())
    } else {
      Bound::Excluded(begin.key.clone())
    };
    let hi = if end.inclusive {
      Bound::Included(end.key.clone())
    } else {
      Bound::Excluded(end.key.clone())
    };
    (lo, hi)
  }

  fn get_range(&self, begin: &KeySelector, end: &KeySelector, limit: usize) -> RangeResult {
    let limit = if limit == 0 { DEFAULT_RANGE_LIMIT } else { limit };
    let mut entries = Vec::new();
    let mut has_more = false;
    for (k, v) in self.map.range(Self::range_bounds(begin, end)) {
      if entries.len() == limit {
        has_more = true;
        break;
      }
      entries.push(KeyValue {
        key: k.clone(),
        value: v.clone(),
      });
    }
    RangeResult { entries, has_more }
  }

  /// Any key in `[begin, end)` modified after `read_version`?
  fn range_dirty_since(&self, begin: &[u8], end: &[u8], read_version: u64) -> bool {
    self
      .versions
      .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
      .any(|(_, v)| *v > read_version)
  }
}

/// The in-process engine. Cloning shares the underlying store.
#[derive(Debug, Clone, Default)]
pub struct MemKvEngine {
  store: Arc<Mutex<Store>>,
}

impl MemKvEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// Latest committed version.
  pub fn current_version(&self) -> u64 {
    self.store.lock().commit_version
  }

  /// Number of live keys, for tests and metrics.
  pub fn key_count(&self) -> usize {
    self.store.lock().map.len()
  }

  /// The next commit applies fully but reports `MaybeCommitted`.
  pub fn inject_maybe_committed_once(&self) {
    self.store.lock().faults.maybe_committed_once = true;
  }

  /// The next commit fails with `Conflict` without applying.
  pub fn inject_conflict_once(&self) {
    self.store.lock().faults.conflict_once = true;
  }

  /// The next commit fails with `Throttled` without applying.
  pub fn inject_throttled_once(&self) {
    self.store.lock().faults.throttled_once = true;
  }
}

impl KvEngine for MemKvEngine {
  type ReadTxn = MemTransaction;
  type Txn = MemTransaction;

  fn begin_read_only(&self) -> MemTransaction {
    MemTransaction::new(self.store.clone(), true)
  }

  fn begin(&self) -> MemTransaction {
    MemTransaction::new(self.store.clone(), false)
  }
}

// ============================================================================
// Transaction
// ============================================================================

#[derive(Debug, Clone)]
enum Mutation {
  Set(Vec<u8>, Vec<u8>),
  Clear(Vec<u8>),
  ClearRange(Vec<u8>, Vec<u8>),
  StampedKey {
    template: Vec<u8>,
    offset: usize,
    value: Vec<u8>,
  },
  StampedValue {
    key: Vec<u8>,
    template: Vec<u8>,
    offset: usize,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
  Active,
  Committed,
  Cancelled,
}

/// One transaction handle. A single type backs both the read-only and the
/// read-write contract; mutating calls on a read-only handle fail at
/// commit.
#[derive(Debug)]
pub struct MemTransaction {
  store: Arc<Mutex<Store>>,
  read_only: bool,
  read_version: u64,
  state: TxnState,
  mutations: Vec<Mutation>,
  /// Read-your-writes overlay for plain set/clear.
  overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
  read_keys: Vec<Vec<u8>>,
  read_ranges: Vec<(Vec<u8>, Vec<u8>)>,
}

impl MemTransaction {
  fn new(store: Arc<Mutex<Store>>, read_only: bool) -> Self {
    let read_version = store.lock().commit_version;
    MemTransaction {
      store,
      read_only,
      read_version,
      state: TxnState::Active,
      mutations: Vec::new(),
      overlay: BTreeMap::new(),
      read_keys: Vec::new(),
      read_ranges: Vec::new(),
    }
  }

  fn ensure_active(&self) -> Result<()> {
    match self.state {
      TxnState::Active => Ok(()),
      _ => Err(FsError::Internal("transaction is not active".into())),
    }
  }

  fn read(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    self.ensure_active()?;
    if let Some(staged) = self.overlay.get(key) {
      return Ok(staged.clone());
    }
    Ok(self.store.lock().map.get(key).cloned())
  }

  fn read_range(
    &self,
    begin: &KeySelector,
    end: &KeySelector,
    limit: usize,
  ) -> Result<RangeResult> {
    self.ensure_active()?;
    let mut result = self.store.lock().get_range(begin, end, limit);
    if !self.overlay.is_empty() {
      // Overlay staged writes onto the committed page. Range pagination
      // under an overlay stays correct because entries are re-sorted and
      // re-truncated to the limit.
      let limit = if limit == 0 { DEFAULT_RANGE_LIMIT } else { limit };
      let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = result
        .entries
        .into_iter()
        .map(|kv| (kv.key, kv.value))
        .collect();
      let (lo, hi) = Store::range_bounds(begin, end);
      for (k, v) in self
        .overlay
        .range((lo, hi))
      {
        match v {
          Some(v) => {
            merged.insert(k.clone(), v.clone());
          }
          None => {
            merged.remove(k);
          }
        }
      }
      let mut entries: Vec<KeyValue> = merged
        .into_iter()
        .map(|(key, value)| KeyValue { key, value })
        .collect();
      if entries.len() > limit {
        entries.truncate(limit);
        result.has_more = true;
      }
      result.entries = entries;
    }
    Ok(result)
  }

  fn splice_stamp(template: &[u8], offset: usize, stamp: &Versionstamp) -> Result<Vec<u8>> {
    let bytes = stamp.to_bytes();
    if offset + Versionstamp::ENCODED_LEN > template.len() {
      return Err(FsError::InvalidArgument(
        "versionstamp offset out of bounds".into(),
      ));
    }
    let mut out = template.to_vec();
    out[offset..offset + Versionstamp::ENCODED_LEN].copy_from_slice(&bytes);
    Ok(out)
  }
}

impl ReadTransaction for MemTransaction {
  fn snapshot_get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    self.read(key)
  }

  fn snapshot_get_range(
    &mut self,
    begin: &KeySelector,
    end: &KeySelector,
    limit: usize,
  ) -> Result<RangeResult> {
    self.read_range(begin, end, limit)
  }

  fn set_read_version(&mut self, version: u64) {
    self.read_version = version;
  }

  fn read_version(&self) -> u64 {
    self.read_version
  }
}

impl Transaction for MemTransaction {
  fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
    self.read_keys.push(key.to_vec());
    self.read(key)
  }

  fn get_range(
    &mut self,
    begin: &KeySelector,
    end: &KeySelector,
    limit: usize,
  ) -> Result<RangeResult> {
    self.read_ranges.push((begin.key.clone(), end.key.clone()));
    self.read_range(begin, end, limit)
  }

  fn set(&mut self, key: &[u8], value: &[u8]) {
    self.overlay.insert(key.to_vec(), Some(value.to_vec()));
    self.mutations.push(Mutation::Set(key.to_vec(), value.to_vec()));
  }

  fn clear(&mut self, key: &[u8]) {
    self.overlay.insert(key.to_vec(), None);
    self.mutations.push(Mutation::Clear(key.to_vec()));
  }

  fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
    self
      .mutations
      .push(Mutation::ClearRange(begin.to_vec(), end.to_vec()));
  }

  fn set_versionstamped_key(&mut self, key_template: &[u8], stamp_offset: usize, value: &[u8]) {
    self.mutations.push(Mutation::StampedKey {
      template: key_template.to_vec(),
      offset: stamp_offset,
      value: value.to_vec(),
    });
  }

  fn set_versionstamped_value(&mut self, key: &[u8], value_template: &[u8], stamp_offset: usize) {
    self.mutations.push(Mutation::StampedValue {
      key: key.to_vec(),
      template: value_template.to_vec(),
      offset: stamp_offset,
    });
  }

  fn add_read_conflict(&mut self, key: &[u8]) {
    self.read_keys.push(key.to_vec());
  }

  fn add_read_conflict_range(&mut self, begin: &[u8], end: &[u8]) {
    self.read_ranges.push((begin.to_vec(), end.to_vec()));
  }

  fn commit(&mut self) -> Result<Versionstamp> {
    self.ensure_active()?;
    if self.read_only {
      return Err(FsError::Internal("commit on read-only transaction".into()));
    }

    let mut store = self.store.lock();

    if store.faults.throttled_once {
      store.faults.throttled_once = false;
      return Err(FsError::Throttled);
    }
    if store.faults.conflict_once {
      store.faults.conflict_once = false;
      self.state = TxnState::Cancelled;
      return Err(FsError::Conflict);
    }

    // Optimistic validation: any read point/range touched after our read
    // version loses.
    for key in &self.read_keys {
      if store.versions.get(key).copied().unwrap_or(0) > self.read_version {
        self.state = TxnState::Cancelled;
        return Err(FsError::Conflict);
      }
    }
    for (begin, end) in &self.read_ranges {
      if store.range_dirty_since(begin, end, self.read_version) {
        self.state = TxnState::Cancelled;
        return Err(FsError::Conflict);
      }
    }

    let commit_version = store.commit_version + 1;
    store.commit_version = commit_version;
    let mut seq: u16 = 0;

    for mutation in &self.mutations {
      match mutation {
        Mutation::Set(k, v) => {
          store.map.insert(k.clone(), v.clone());
          store.versions.insert(k.clone(), commit_version);
        }
        Mutation::Clear(k) => {
          store.map.remove(k);
          store.versions.insert(k.clone(), commit_version);
        }
        Mutation::ClearRange(begin, end) => {
          let doomed: Vec<Vec<u8>> = store
            .map
            .range::<[u8], _>((Bound::Included(begin.as_slice()), Bound::Excluded(end.as_slice())))
            .map(|(k, _)| k.clone())
            .collect();
          for k in doomed {
            store.map.remove(&k);
            store.versions.insert(k, commit_version);
          }
        }
        Mutation::StampedKey {
          template,
          offset,
          value,
        } => {
          let stamp = Versionstamp::new(commit_version, seq);
          seq = seq.wrapping_add(1);
          let key = Self::splice_stamp(template, *offset, &stamp)?;
          store.map.insert(key.clone(), value.clone());
          store.versions.insert(key, commit_version);
        }
        Mutation::StampedValue {
          key,
          template,
          offset,
        } => {
          let stamp = Versionstamp::new(commit_version, seq);
          seq = seq.wrapping_add(1);
          let value = Self::splice_stamp(template, *offset, &stamp)?;
          store.map.insert(key.clone(), value);
          store.versions.insert(key.clone(), commit_version);
        }
      }
    }

    self.state = TxnState::Committed;

    if store.faults.maybe_committed_once {
      store.faults.maybe_committed_once = false;
      return Err(FsError::MaybeCommitted);
    }

    Ok(Versionstamp::new(commit_version, 0))
  }

  fn cancel(&mut self) {
    self.state = TxnState::Cancelled;
  }

  fn reset(&mut self) {
    let read_version = self.store.lock().commit_version;
    self.read_version = read_version;
    self.state = TxnState::Active;
    self.mutations.clear();
    self.overlay.clear();
    self.read_keys.clear();
    self.read_ranges.clear();
  }
}
