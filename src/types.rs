//! Core identifier and attribute types shared across the crate.
//!
//! Identity is expressed by small copyable handles (inode id, chain id,
//! target id), never by back-pointers between records, so the metadata
//! graph stays acyclic. Lookups always go through the KV key schema.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifier newtypes
// ============================================================================

/// 64-bit inode identifier. Densely allocated, never reused within a
/// generation.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InodeId(pub u64);

impl InodeId {
  /// The root directory inode.
  pub const ROOT: InodeId = InodeId(1);
}

impl fmt::Display for InodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ino:{}", self.0)
  }
}

/// 32-bit replication chain identifier.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChainId(pub u32);

impl fmt::Display for ChainId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "chain:{}", self.0)
  }
}

/// 32-bit chain table identifier. Layouts reference a chain table by id
/// plus version.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChainTableId(pub u32);

/// 64-bit storage target identifier. A target is one disk replica owned by
/// a storage node.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct TargetId(pub u64);

impl fmt::Display for TargetId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "target:{}", self.0)
  }
}

/// 32-bit cluster node identifier (meta, storage or mgmtd process).
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "node:{}", self.0)
  }
}

// ============================================================================
// Version counters
// ============================================================================

/// Monotonic revision of the cluster topology.
pub type RoutingVersion = u64;

/// Monotonic version of a single chain's membership/order.
pub type ChainVersion = u32;

/// Per-chunk committed version, bumped once per committed update.
pub type ChunkVersion = u32;

/// Version of a chain table.
pub type ChainTableVersion = u32;

// ============================================================================
// Versionstamp
// ============================================================================

/// 10-byte commit stamp assigned by the KV engine: an 8-byte big-endian
/// commit version plus a 2-byte intra-transaction sequence. Strictly
/// monotonic across committed transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Versionstamp {
  pub commit_version: u64,
  pub seq: u16,
}

impl Versionstamp {
  pub const ENCODED_LEN: usize = 10;

  pub fn new(commit_version: u64, seq: u16) -> Self {
    Self {
      commit_version,
      seq,
    }
  }

  /// Big-endian wire form; byte order equals stamp order.
  pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
    let mut out = [0u8; Self::ENCODED_LEN];
    out[..8].copy_from_slice(&self.commit_version.to_be_bytes());
    out[8..].copy_from_slice(&self.seq.to_be_bytes());
    out
  }

  pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
    if bytes.len() != Self::ENCODED_LEN {
      return None;
    }
    let mut cv = [0u8; 8];
    cv.copy_from_slice(&bytes[..8]);
    let mut seq = [0u8; 2];
    seq.copy_from_slice(&bytes[8..]);
    Some(Self {
      commit_version: u64::from_be_bytes(cv),
      seq: u16::from_be_bytes(seq),
    })
  }
}

impl fmt::Display for Versionstamp {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "vs:{}.{}", self.commit_version, self.seq)
  }
}

// ============================================================================
// Uuid
// ============================================================================

/// 16-byte request/session/dentry identifier. Enables request idempotency:
/// a replayed mutation with the same uuid short-circuits to the recorded
/// result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
  pub const ENCODED_LEN: usize = 16;

  /// A fresh random uuid.
  pub fn generate() -> Self {
    Uuid(rand::random())
  }

  pub fn is_zero(&self) -> bool {
    self.0 == [0u8; 16]
  }

  pub fn as_bytes(&self) -> &[u8; 16] {
    &self.0
  }

  pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
    let arr: [u8; 16] = bytes.try_into().ok()?;
    Some(Uuid(arr))
  }
}

impl fmt::Display for Uuid {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for b in &self.0 {
      write!(f, "{b:02x}")?;
    }
    Ok(())
  }
}

// ============================================================================
// Time
// ============================================================================

/// Milliseconds since the unix epoch, the crate's timestamp unit.
pub type UnixMillis = u64;

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> UnixMillis {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_millis() as u64)
    .unwrap_or(0)
}

// ============================================================================
// Permissions
// ============================================================================

/// Permission bit for execute/search.
pub const PERM_EXEC: u32 = 1;
/// Permission bit for write.
pub const PERM_WRITE: u32 = 2;
/// Permission bit for read.
pub const PERM_READ: u32 = 4;

bitflags::bitflags! {
  /// Immutable/append attribute flags carried on each inode.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct IFlags: u32 {
    const IMMUTABLE = 1 << 0;
    const APPEND_ONLY = 1 << 1;
  }
}

bitflags::bitflags! {
  /// Open flags understood by the metadata server. Access mode is carried
  /// separately by `WRITE`; the POSIX shim maps `O_*` onto these.
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct OpenFlags: u32 {
    const WRITE = 1 << 0;
    const CREATE = 1 << 1;
    const EXCL = 1 << 2;
    const TRUNC = 1 << 3;
    const APPEND = 1 << 4;
    const DIRECTORY = 1 << 5;
  }
}

/// Caller identity attached to every metadata request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
  pub uid: u32,
  pub gid: u32,
  pub groups: Vec<u32>,
  pub token: String,
}

impl UserInfo {
  pub fn root() -> Self {
    UserInfo {
      uid: 0,
      gid: 0,
      groups: Vec::new(),
      token: String::new(),
    }
  }

  pub fn is_root(&self) -> bool {
    self.uid == 0
  }

  pub fn in_group(&self, gid: u32) -> bool {
    self.gid == gid || self.groups.contains(&gid)
  }
}

/// Owner/group/other permission record held on each inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Acl {
  pub uid: u32,
  pub gid: u32,
  /// Lower nine bits are rwxrwxrwx.
  pub mode: u32,
  pub iflags: IFlags,
}

impl Acl {
  pub fn new(uid: u32, gid: u32, mode: u32) -> Self {
    Acl {
      uid,
      gid,
      mode,
      iflags: IFlags::empty(),
    }
  }

  /// Check `want` (a mask of `PERM_*` bits) against the acl for `user`.
  /// Root bypasses the mode bits but not the immutable flag for writes.
  pub fn check(&self, user: &UserInfo, want: u32) -> crate::error::Result<()> {
    if want & PERM_WRITE != 0 && self.iflags.contains(IFlags::IMMUTABLE) {
      return Err(crate::error::FsError::NoPermission);
    }
    if user.is_root() {
      return Ok(());
    }
    let granted = if user.uid == self.uid {
      (self.mode >> 6) & 7
    } else if user.in_group(self.gid) {
      (self.mode >> 3) & 7
    } else {
      self.mode & 7
    };
    if granted & want == want {
      Ok(())
    } else {
      Err(crate::error::FsError::NoPermission)
    }
  }
}

/// Common timestamps carried on every inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InodeTimes {
  pub atime: UnixMillis,
  pub ctime: UnixMillis,
  pub mtime: UnixMillis,
}

impl InodeTimes {
  pub fn now() -> Self {
    let now = now_ms();
    InodeTimes {
      atime: now,
      ctime: now,
      mtime: now,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_versionstamp_roundtrip_and_order() {
    let a = Versionstamp::new(7, 1);
    let b = Versionstamp::new(7, 2);
    let c = Versionstamp::new(8, 0);
    assert!(a < b && b < c);
    // Byte order must agree with value order.
    assert!(a.to_bytes() < b.to_bytes());
    assert!(b.to_bytes() < c.to_bytes());
    assert_eq!(Versionstamp::from_bytes(&a.to_bytes()), Some(a));
  }

  #[test]
  fn test_uuid_generate_distinct() {
    let a = Uuid::generate();
    let b = Uuid::generate();
    assert_ne!(a, b);
    assert!(!a.is_zero());
  }

  #[test]
  fn test_acl_owner_group_other() {
    let acl = Acl::new(1000, 100, 0o640);
    let owner = UserInfo {
      uid: 1000,
      gid: 1,
      ..Default::default()
    };
    let group = UserInfo {
      uid: 2000,
      gid: 100,
      ..Default::default()
    };
    let other = UserInfo {
      uid: 3000,
      gid: 3,
      ..Default::default()
    };
    assert!(acl.check(&owner, PERM_READ | PERM_WRITE).is_ok());
    assert!(acl.check(&group, PERM_READ).is_ok());
    assert!(acl.check(&group, PERM_WRITE).is_err());
    assert!(acl.check(&other, PERM_READ).is_err());
  }

  #[test]
  fn test_acl_root_bypass_except_immutable() {
    let mut acl = Acl::new(1000, 100, 0o000);
    let root = UserInfo::root();
    assert!(acl.check(&root, PERM_READ | PERM_WRITE | PERM_EXEC).is_ok());
    acl.iflags = IFlags::IMMUTABLE;
    assert!(acl.check(&root, PERM_READ).is_ok());
    assert!(acl.check(&root, PERM_WRITE).is_err());
  }
}
