//! KV access helpers for the metadata plane.
//!
//! Thin free functions over a transaction handle, one per record type,
//! plus the inode id allocator. Conflict-tracked loads go through
//! `Transaction::get`; snapshot loads through `snapshot_get`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::keys;
use crate::codec::{FieldReader, FieldWriter};
use crate::error::{FsError, Result};
use crate::kv::{
  run_transaction, scan_range, KeySelector, KvEngine, KvRetryConfig, RangeResult, ReadTransaction,
  Transaction,
};
use crate::meta::dirent::DirEntry;
use crate::meta::inode::Inode;
use crate::meta::session::{FileSession, UserRecord};
use crate::types::{InodeId, UserInfo, Uuid};

// ============================================================================
// Inodes
// ============================================================================

pub fn load_inode<T: Transaction>(txn: &mut T, id: InodeId) -> Result<Inode> {
  try_load_inode(txn, id)?.ok_or_else(|| FsError::NotFound(format!("{id}")))
}

pub fn try_load_inode<T: Transaction>(txn: &mut T, id: InodeId) -> Result<Option<Inode>> {
  txn
    .get(&keys::inode_key(id))?
    .map(|raw| Inode::decode(&raw))
    .transpose()
}

pub fn load_inode_snapshot<T: ReadTransaction + ?Sized>(
  txn: &mut T,
  id: InodeId,
) -> Result<Option<Inode>> {
  txn
    .snapshot_get(&keys::inode_key(id))?
    .map(|raw| Inode::decode(&raw))
    .transpose()
}

pub fn save_inode<T: Transaction>(txn: &mut T, inode: &Inode) {
  txn.set(&keys::inode_key(inode.id), &inode.encode());
}

pub fn clear_inode<T: Transaction>(txn: &mut T, id: InodeId) {
  txn.clear(&keys::inode_key(id));
}

/// Stage a file inode whose length update must carry the commit
/// versionstamp as its version tag.
pub fn save_file_inode_stamped<T: Transaction>(txn: &mut T, inode: &Inode) -> Result<()> {
  let (template, offset) = inode.encode_with_length_stamp_template()?;
  txn.set_versionstamped_value(&keys::inode_key(inode.id), &template, offset);
  Ok(())
}

// ============================================================================
// Directory entries
// ============================================================================

pub fn load_dentry<T: Transaction>(
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
) -> Result<Option<DirEntry>> {
  txn
    .get(&keys::dentry_key(parent, name))?
    .map(|raw| DirEntry::decode(&raw))
    .transpose()
}

pub fn save_dentry<T: Transaction>(txn: &mut T, entry: &DirEntry) {
  txn.set(&keys::dentry_key(entry.parent, &entry.name), &entry.encode());
}

pub fn clear_dentry<T: Transaction>(txn: &mut T, parent: InodeId, name: &[u8]) {
  txn.clear(&keys::dentry_key(parent, name));
}

/// Whether a directory has any entry at all (snapshot read).
pub fn dir_is_empty<T: ReadTransaction + ?Sized>(txn: &mut T, dir: InodeId) -> Result<bool> {
  let (begin, end) = keys::dentry_range(dir);
  let page = txn.snapshot_get_range(
    &KeySelector::inclusive(begin),
    &KeySelector::exclusive(end),
    1,
  )?;
  Ok(page.entries.is_empty())
}

/// One page of a directory listing. The cursor is the last returned name;
/// pass it back to continue.
pub fn list_dir_page<T: ReadTransaction + ?Sized>(
  txn: &mut T,
  dir: InodeId,
  cursor: Option<&[u8]>,
  limit: usize,
) -> Result<(Vec<DirEntry>, bool)> {
  let (begin, end) = keys::dentry_range(dir);
  let begin_sel = match cursor {
    None => KeySelector::inclusive(begin),
    Some(name) => KeySelector::exclusive(keys::dentry_key(dir, name)),
  };
  let RangeResult { entries, has_more } =
    txn.snapshot_get_range(&begin_sel, &KeySelector::exclusive(end), limit)?;
  let entries = entries
    .iter()
    .map(|kv| DirEntry::decode(&kv.value))
    .collect::<Result<Vec<DirEntry>>>()?;
  Ok((entries, has_more))
}

// ============================================================================
// Sessions
// ============================================================================

pub fn save_session<T: Transaction>(txn: &mut T, session: &FileSession) {
  txn.set(
    &keys::session_key(session.inode, session.session_id),
    &session.encode(),
  );
}

pub fn clear_session<T: Transaction>(txn: &mut T, inode: InodeId, session: Uuid) {
  txn.clear(&keys::session_key(inode, session));
}

pub fn load_session<T: Transaction>(
  txn: &mut T,
  inode: InodeId,
  session: Uuid,
) -> Result<Option<FileSession>> {
  txn
    .get(&keys::session_key(inode, session))?
    .map(|raw| FileSession::decode(&raw))
    .transpose()
}

/// Every session currently open on an inode (snapshot read).
pub fn load_sessions<T: ReadTransaction + ?Sized>(
  txn: &mut T,
  inode: InodeId,
) -> Result<Vec<FileSession>> {
  let (begin, end) = keys::session_range(inode);
  scan_range(txn, &begin, &end, 256)?
    .iter()
    .map(|kv| FileSession::decode(&kv.value))
    .collect()
}

/// Whether an inode has any open session. Conflict-tracked so a deletion
/// decision races correctly with a concurrent open.
pub fn has_sessions<T: Transaction>(txn: &mut T, inode: InodeId) -> Result<bool> {
  let (begin, end) = keys::session_range(inode);
  txn.add_read_conflict_range(&begin, &end);
  let page = txn.snapshot_get_range(
    &KeySelector::inclusive(begin),
    &KeySelector::exclusive(end),
    1,
  )?;
  Ok(!page.entries.is_empty())
}

// ============================================================================
// GC queue
// ============================================================================

/// Move an unreachable inode onto the deletion queue. The queue entry is
/// the commit record: the background worker removes chunks first and the
/// entry last.
pub fn enqueue_gc<T: Transaction>(txn: &mut T, inode: InodeId) {
  txn.set(&keys::gc_queue_key(inode), &[]);
}

pub fn clear_gc_entry<T: Transaction>(txn: &mut T, inode: InodeId) {
  txn.clear(&keys::gc_queue_key(inode));
}

pub fn list_gc_queue<T: ReadTransaction + ?Sized>(
  txn: &mut T,
  limit: usize,
) -> Result<Vec<InodeId>> {
  let (begin, end) = keys::gc_queue_range();
  let page = txn.snapshot_get_range(
    &KeySelector::inclusive(begin),
    &KeySelector::exclusive(end),
    limit,
  )?;
  Ok(
    page
      .entries
      .iter()
      .filter_map(|kv| keys::parse_gc_queue_key(&kv.key))
      .collect(),
  )
}

// ============================================================================
// Users and authentication
// ============================================================================

pub fn save_user<T: Transaction>(txn: &mut T, user: &UserRecord) {
  txn.set(&keys::user_key(&UserRecord::key_name(user.uid)), &user.encode());
}

pub fn load_user<T: ReadTransaction + ?Sized>(txn: &mut T, uid: u32) -> Result<Option<UserRecord>> {
  txn
    .snapshot_get(&keys::user_key(&UserRecord::key_name(uid)))?
    .map(|raw| UserRecord::decode(&raw))
    .transpose()
}

/// Token check against the `USER` table. An entirely empty table means
/// the cluster has not been provisioned yet and authentication is off.
pub fn authenticate<T: ReadTransaction + ?Sized>(txn: &mut T, user: &UserInfo) -> Result<()> {
  match load_user(txn, user.uid)? {
    Some(record) => {
      if record.token == user.token {
        Ok(())
      } else {
        Err(FsError::NoPermission)
      }
    }
    None => {
      let (begin, end) = crate::kv::prefix_range(crate::constants::PREFIX_USER);
      let page = txn.snapshot_get_range(
        &KeySelector::inclusive(begin),
        &KeySelector::exclusive(end),
        1,
      )?;
      if page.entries.is_empty() {
        Ok(())
      } else {
        Err(FsError::NoPermission)
      }
    }
  }
}

// ============================================================================
// Idempotency records
// ============================================================================

/// The replayable result of a mutating operation, stored under `IDEM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredResult {
  Unit,
  Inode(InodeId),
}

const TAG_RESULT_KIND: u8 = 1;
const TAG_RESULT_INODE: u8 = 2;

impl StoredResult {
  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    match self {
      StoredResult::Unit => {
        w.put_u8(TAG_RESULT_KIND, 0);
      }
      StoredResult::Inode(id) => {
        w.put_u8(TAG_RESULT_KIND, 1).put_u64(TAG_RESULT_INODE, id.0);
      }
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    match r.u8(TAG_RESULT_KIND)? {
      0 => Ok(StoredResult::Unit),
      1 => Ok(StoredResult::Inode(InodeId(r.u64(TAG_RESULT_INODE)?))),
      other => Err(FsError::Fatal(format!("unknown stored result {other}"))),
    }
  }
}

pub fn read_idem<T: Transaction>(
  txn: &mut T,
  request: Uuid,
  op_tag: &str,
) -> Result<Option<StoredResult>> {
  txn
    .get(&keys::idempotency_key(request, op_tag))?
    .map(|raw| StoredResult::decode(&raw))
    .transpose()
}

pub fn write_idem<T: Transaction>(
  txn: &mut T,
  request: Uuid,
  op_tag: &str,
  result: &StoredResult,
) {
  txn.set(&keys::idempotency_key(request, op_tag), &result.encode());
}

// ============================================================================
// Inode id allocation
// ============================================================================

const ALLOC_KEY: &str = "inode_alloc_next";
const ALLOC_BLOCK: u64 = 1024;

/// Dense inode id allocator. Each server grabs blocks from a shared
/// counter, then deals ids locally without touching the KV. Ids from an
/// abandoned block are never reused, which is exactly the generation
/// guarantee inodes need.
pub struct InodeAllocator<E: KvEngine> {
  kv: Arc<E>,
  retry: KvRetryConfig,
  block: Mutex<(u64, u64)>,
}

impl<E: KvEngine> InodeAllocator<E> {
  pub fn new(kv: Arc<E>, retry: KvRetryConfig) -> Self {
    InodeAllocator {
      kv,
      retry,
      block: Mutex::new((0, 0)),
    }
  }

  /// Make at least `count` ids available locally.
  pub async fn reserve(&self, count: usize) -> Result<()> {
    {
      let block = self.block.lock();
      if block.1 - block.0 >= count as u64 {
        return Ok(());
      }
    }
    let want = (count as u64).max(ALLOC_BLOCK);
    let (range, _) = run_transaction(&*self.kv, &self.retry, true, |txn| {
      let key = keys::config_key(ALLOC_KEY);
      let next = match txn.get(&key)? {
        None => crate::constants::FIRST_ALLOCATED_INODE,
        Some(raw) => {
          let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| FsError::Fatal("bad inode allocator state".into()))?;
          u64::from_be_bytes(bytes)
        }
      };
      txn.set(&key, &(next + want).to_be_bytes());
      Ok((next, next + want))
    })
    .await?;
    *self.block.lock() = range;
    Ok(())
  }

  /// Deal the next id from the local block.
  pub fn take(&self) -> Result<InodeId> {
    let mut block = self.block.lock();
    if block.0 >= block.1 {
      return Err(FsError::Internal("inode allocator block exhausted".into()));
    }
    let id = InodeId(block.0);
    block.0 += 1;
    Ok(id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kv::MemKvEngine;
  use crate::layout::Layout;
  use crate::types::Acl;

  #[tokio::test]
  async fn test_inode_store_roundtrip() {
    let kv = MemKvEngine::new();
    let inode = Inode::new_file(InodeId(5), Acl::new(0, 0, 0o644), Layout::default());
    let mut txn = kv.begin();
    save_inode(&mut txn, &inode);
    assert_eq!(load_inode(&mut txn, InodeId(5)).unwrap(), inode);
    txn.commit().unwrap();

    let mut txn = kv.begin();
    assert!(matches!(
      load_inode(&mut txn, InodeId(6)),
      Err(FsError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_allocator_blocks_are_disjoint() {
    let kv = Arc::new(MemKvEngine::new());
    let a = InodeAllocator::new(kv.clone(), KvRetryConfig::default());
    let b = InodeAllocator::new(kv.clone(), KvRetryConfig::default());
    a.reserve(1).await.unwrap();
    b.reserve(1).await.unwrap();

    let mut seen = std::collections::HashSet::new();
    for _ in 0..100 {
      assert!(seen.insert(a.take().unwrap()));
      assert!(seen.insert(b.take().unwrap()));
    }
    assert!(seen.iter().all(|id| id.0 >= crate::constants::FIRST_ALLOCATED_INODE));
  }

  #[tokio::test]
  async fn test_list_dir_pagination() {
    let kv = MemKvEngine::new();
    let mut txn = kv.begin();
    for i in 0..5u8 {
      let entry = DirEntry {
        parent: InodeId(1),
        name: vec![b'f', b'0' + i],
        target: InodeId(10 + i as u64),
        entry_type: crate::meta::dirent::EntryType::File,
        uuid: Uuid::generate(),
      };
      save_dentry(&mut txn, &entry);
    }
    txn.commit().unwrap();

    let mut ro = kv.begin_read_only();
    let (page, more) = list_dir_page(&mut ro, InodeId(1), None, 2).unwrap();
    assert_eq!(page.len(), 2);
    assert!(more);
    let (rest, more) = list_dir_page(&mut ro, InodeId(1), Some(&page[1].name), 10).unwrap();
    assert_eq!(rest.len(), 3);
    assert!(!more);
    assert!(dir_is_empty(&mut ro, InodeId(2)).unwrap());
  }

  #[tokio::test]
  async fn test_authenticate_bootstrap_and_token() {
    let kv = MemKvEngine::new();
    let user = UserInfo {
      uid: 1000,
      gid: 100,
      token: "tok".into(),
      ..Default::default()
    };
    // Empty table: open access.
    let mut txn = kv.begin();
    assert!(authenticate(&mut txn, &user).is_ok());

    save_user(
      &mut txn,
      &UserRecord {
        uid: 1000,
        gid: 100,
        token: "tok".into(),
        admin: false,
      },
    );
    txn.commit().unwrap();

    let mut txn = kv.begin();
    assert!(authenticate(&mut txn, &user).is_ok());
    let wrong = UserInfo {
      token: "bad".into(),
      ..user.clone()
    };
    assert_eq!(authenticate(&mut txn, &wrong), Err(FsError::NoPermission));
    // Provisioned table: unknown uid refused.
    let unknown = UserInfo {
      uid: 2000,
      ..user.clone()
    };
    assert_eq!(authenticate(&mut txn, &unknown), Err(FsError::NoPermission));
  }

  #[tokio::test]
  async fn test_idempotency_roundtrip() {
    let kv = MemKvEngine::new();
    let request = Uuid::generate();
    let mut txn = kv.begin();
    assert_eq!(read_idem(&mut txn, request, "create").unwrap(), None);
    write_idem(&mut txn, request, "create", &StoredResult::Inode(InodeId(9)));
    txn.commit().unwrap();

    let mut txn = kv.begin();
    assert_eq!(
      read_idem(&mut txn, request, "create").unwrap(),
      Some(StoredResult::Inode(InodeId(9)))
    );
    // Same uuid, different op tag: distinct record.
    assert_eq!(read_idem(&mut txn, request, "remove").unwrap(), None);
  }
}
