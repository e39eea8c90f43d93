//! Key builders and parsers, one set per table.
//!
//! Component widths: inode 8 BE, chain id 4 BE, chain table id 4 BE,
//! target id 8 BE, node id 4 BE, uuid 16 raw, names as trailing bytes.
//! Sequential components produce lexicographically sequential keys.

use byteorder::{BigEndian, ByteOrder};

use crate::constants::*;
use crate::kv::prefix_range;
use crate::types::{ChainId, ChainTableId, ChainTableVersion, InodeId, NodeId, TargetId, Uuid};

fn with_prefix(prefix: &[u8; 4], body_len: usize) -> Vec<u8> {
  let mut key = Vec::with_capacity(4 + body_len);
  key.extend_from_slice(prefix);
  key
}

// ============================================================================
// Inodes (INOD)
// ============================================================================

pub fn inode_key(inode: InodeId) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_INODE, 8);
  key.extend_from_slice(&inode.0.to_be_bytes());
  key
}

pub fn parse_inode_key(key: &[u8]) -> Option<InodeId> {
  let body = key.strip_prefix(&PREFIX_INODE[..])?;
  if body.len() != 8 {
    return None;
  }
  Some(InodeId(BigEndian::read_u64(body)))
}

// ============================================================================
// Directory entries (DENT)
// ============================================================================

pub fn dentry_key(parent: InodeId, name: &[u8]) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_DENTRY, 8 + name.len());
  key.extend_from_slice(&parent.0.to_be_bytes());
  key.extend_from_slice(name);
  key
}

/// Scan bounds covering every entry of one directory.
pub fn dentry_range(parent: InodeId) -> (Vec<u8>, Vec<u8>) {
  prefix_range(&dentry_key(parent, b""))
}

pub fn parse_dentry_key(key: &[u8]) -> Option<(InodeId, &[u8])> {
  let body = key.strip_prefix(&PREFIX_DENTRY[..])?;
  if body.len() < 8 {
    return None;
  }
  Some((InodeId(BigEndian::read_u64(&body[..8])), &body[8..]))
}

// ============================================================================
// File sessions (INOS)
// ============================================================================

pub fn session_key(inode: InodeId, session: Uuid) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_SESSION, 8 + Uuid::ENCODED_LEN);
  key.extend_from_slice(&inode.0.to_be_bytes());
  key.extend_from_slice(session.as_bytes());
  key
}

/// Scan bounds covering every session on one inode.
pub fn session_range(inode: InodeId) -> (Vec<u8>, Vec<u8>) {
  let mut prefix = with_prefix(PREFIX_SESSION, 8);
  prefix.extend_from_slice(&inode.0.to_be_bytes());
  prefix_range(&prefix)
}

/// Scan bounds covering every session in the system.
pub fn all_sessions_range() -> (Vec<u8>, Vec<u8>) {
  prefix_range(PREFIX_SESSION)
}

pub fn parse_session_key(key: &[u8]) -> Option<(InodeId, Uuid)> {
  let body = key.strip_prefix(&PREFIX_SESSION[..])?;
  if body.len() != 8 + Uuid::ENCODED_LEN {
    return None;
  }
  let inode = InodeId(BigEndian::read_u64(&body[..8]));
  let uuid = Uuid::from_bytes(&body[8..])?;
  Some((inode, uuid))
}

// ============================================================================
// Chain tables (CHIT), chains (CHIF), targets (TGIF), nodes (NODE)
// ============================================================================

pub fn chain_table_key(table: ChainTableId, version: ChainTableVersion) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_CHAIN_TABLE, 8);
  key.extend_from_slice(&table.0.to_be_bytes());
  key.extend_from_slice(&version.to_be_bytes());
  key
}

/// Scan bounds covering every version of one chain table, ascending.
pub fn chain_table_range(table: ChainTableId) -> (Vec<u8>, Vec<u8>) {
  let mut prefix = with_prefix(PREFIX_CHAIN_TABLE, 4);
  prefix.extend_from_slice(&table.0.to_be_bytes());
  prefix_range(&prefix)
}

pub fn chain_info_key(chain: ChainId) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_CHAIN_INFO, 4);
  key.extend_from_slice(&chain.0.to_be_bytes());
  key
}

pub fn all_chains_range() -> (Vec<u8>, Vec<u8>) {
  prefix_range(PREFIX_CHAIN_INFO)
}

pub fn parse_chain_info_key(key: &[u8]) -> Option<ChainId> {
  let body = key.strip_prefix(&PREFIX_CHAIN_INFO[..])?;
  if body.len() != 4 {
    return None;
  }
  Some(ChainId(BigEndian::read_u32(body)))
}

pub fn target_info_key(target: TargetId) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_TARGET_INFO, 8);
  key.extend_from_slice(&target.0.to_be_bytes());
  key
}

pub fn all_targets_range() -> (Vec<u8>, Vec<u8>) {
  prefix_range(PREFIX_TARGET_INFO)
}

pub fn node_key(node: NodeId) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_NODE, 4);
  key.extend_from_slice(&node.0.to_be_bytes());
  key
}

pub fn all_nodes_range() -> (Vec<u8>, Vec<u8>) {
  prefix_range(PREFIX_NODE)
}

pub fn parse_node_key(key: &[u8]) -> Option<NodeId> {
  let body = key.strip_prefix(&PREFIX_NODE[..])?;
  if body.len() != 4 {
    return None;
  }
  Some(NodeId(BigEndian::read_u32(body)))
}

// ============================================================================
// Meta distributor (META)
// ============================================================================

/// The shared server map.
pub fn server_map_key() -> Vec<u8> {
  PREFIX_META.to_vec()
}

/// Per-server presence marker: `META-{node_id:08}`.
pub fn presence_key(node: NodeId) -> Vec<u8> {
  let mut key = PREFIX_META.to_vec();
  key.extend_from_slice(format!("-{:08}", node.0).as_bytes());
  key
}

/// Scan bounds covering every presence marker.
pub fn presence_range() -> (Vec<u8>, Vec<u8>) {
  let mut prefix = PREFIX_META.to_vec();
  prefix.push(b'-');
  prefix_range(&prefix)
}

pub fn parse_presence_key(key: &[u8]) -> Option<NodeId> {
  let body = key.strip_prefix(&PREFIX_META[..])?;
  let digits = body.strip_prefix(b"-")?;
  if digits.len() != 8 {
    return None;
  }
  let text = std::str::from_utf8(digits).ok()?;
  text.parse::<u32>().ok().map(NodeId)
}

/// Global metadata-version key, stamped on every membership change for
/// cache invalidation. Sorts before the `META-` markers.
pub fn metadata_version_key() -> Vec<u8> {
  let mut key = PREFIX_META.to_vec();
  key.extend_from_slice(b"!ver");
  key
}

// ============================================================================
// Idempotency (IDEM), users (USER), config (CONF), GC queue (GCQU)
// ============================================================================

pub fn idempotency_key(request: Uuid, op_tag: &str) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_IDEMPOTENT, Uuid::ENCODED_LEN + op_tag.len());
  key.extend_from_slice(request.as_bytes());
  key.extend_from_slice(op_tag.as_bytes());
  key
}

pub fn user_key(name: &str) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_USER, name.len());
  key.extend_from_slice(name.as_bytes());
  key
}

pub fn config_key(name: &str) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_CONFIG, name.len());
  key.extend_from_slice(name.as_bytes());
  key
}

pub fn gc_queue_key(inode: InodeId) -> Vec<u8> {
  let mut key = with_prefix(PREFIX_GC_QUEUE, 8);
  key.extend_from_slice(&inode.0.to_be_bytes());
  key
}

pub fn gc_queue_range() -> (Vec<u8>, Vec<u8>) {
  prefix_range(PREFIX_GC_QUEUE)
}

pub fn parse_gc_queue_key(key: &[u8]) -> Option<InodeId> {
  let body = key.strip_prefix(&PREFIX_GC_QUEUE[..])?;
  if body.len() != 8 {
    return None;
  }
  Some(InodeId(BigEndian::read_u64(body)))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_inode_key_roundtrip() {
    let key = inode_key(InodeId(0xdead_beef));
    assert_eq!(key.len(), 12);
    assert_eq!(parse_inode_key(&key), Some(InodeId(0xdead_beef)));
    assert_eq!(parse_inode_key(b"DENTxxxxxxxx"), None);
  }

  #[test]
  fn test_inode_keys_sort_by_id() {
    assert!(inode_key(InodeId(1)) < inode_key(InodeId(2)));
    assert!(inode_key(InodeId(255)) < inode_key(InodeId(256)));
  }

  #[test]
  fn test_dentry_range_contains_only_parent() {
    let (begin, end) = dentry_range(InodeId(7));
    let inside = dentry_key(InodeId(7), b"zzz");
    let outside = dentry_key(InodeId(8), b"aaa");
    assert!(begin <= inside && inside < end);
    assert!(outside >= end);
  }

  #[test]
  fn test_dentry_key_roundtrip() {
    let key = dentry_key(InodeId(42), b"hello.txt");
    let (parent, name) = parse_dentry_key(&key).unwrap();
    assert_eq!(parent, InodeId(42));
    assert_eq!(name, b"hello.txt");
  }

  #[test]
  fn test_session_key_roundtrip() {
    let uuid = Uuid::generate();
    let key = session_key(InodeId(3), uuid);
    assert_eq!(parse_session_key(&key), Some((InodeId(3), uuid)));
  }

  #[test]
  fn test_presence_key_format() {
    let key = presence_key(NodeId(42));
    assert_eq!(key, b"META-00000042".to_vec());
    assert_eq!(parse_presence_key(&key), Some(NodeId(42)));
    assert_eq!(parse_presence_key(b"META!ver"), None);
  }

  #[test]
  fn test_metadata_version_outside_presence_range() {
    let (begin, end) = presence_range();
    let ver = metadata_version_key();
    assert!(ver < begin || ver >= end);
    let map = server_map_key();
    assert!(map < begin || map >= end);
  }

  #[test]
  fn test_chain_table_versions_sort() {
    let a = chain_table_key(ChainTableId(1), 1);
    let b = chain_table_key(ChainTableId(1), 2);
    let c = chain_table_key(ChainTableId(2), 1);
    assert!(a < b && b < c);
  }
}
