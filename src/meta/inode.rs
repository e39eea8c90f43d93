//! Inode records.
//!
//! An inode is a tagged union (file, directory, symlink) plus common
//! attributes. Operations dispatch on the tag; adding a new kind is a
//! schema change, not a type-hierarchy extension.

use crate::codec::{FieldReader, FieldWriter};
use crate::error::{FsError, Result};
use crate::layout::Layout;
use crate::types::{Acl, IFlags, InodeId, InodeTimes, UnixMillis, Uuid, Versionstamp};

// ============================================================================
// Kind payloads
// ============================================================================

/// File payload. `length` only grows under writes; truncate resets it and
/// bumps `truncate_version`. `length_stamp` is the commit versionstamp of
/// the last length update, the version tag that keeps concurrent
/// extensions monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInode {
  pub layout: Layout,
  pub length: u64,
  pub truncate_version: u64,
  pub length_stamp: Versionstamp,
  pub flags: u32,
  /// Stripe slots grow on demand up to `layout.stripe_size` for files
  /// that start small.
  pub dyn_stripe: u32,
}

/// Directory payload. Holds its own name and parent for upward path
/// reconstruction, the layout template children inherit, and the counter
/// that deals chain slots to newly created striped files.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirInode {
  pub parent: InodeId,
  pub name: Vec<u8>,
  pub layout: Layout,
  pub chain_alloc_counter: u32,
  /// Optional advisory lock holder.
  pub lock: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SymlinkInode {
  pub target: Vec<u8>,
}

/// The tagged union.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeKind {
  File(FileInode),
  Directory(DirInode),
  Symlink(SymlinkInode),
}

impl InodeKind {
  pub fn tag(&self) -> u8 {
    match self {
      InodeKind::File(_) => 0,
      InodeKind::Directory(_) => 1,
      InodeKind::Symlink(_) => 2,
    }
  }
}

// ============================================================================
// Inode
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
  pub id: InodeId,
  pub kind: InodeKind,
  pub acl: Acl,
  /// Count of dentries referencing this inode. Directories hold exactly
  /// one except transiently during rename.
  pub nlink: u32,
  pub times: InodeTimes,
}

const TAG_ID: u8 = 1;
const TAG_KIND: u8 = 2;
const TAG_UID: u8 = 3;
const TAG_GID: u8 = 4;
const TAG_MODE: u8 = 5;
const TAG_IFLAGS: u8 = 6;
const TAG_NLINK: u8 = 7;
const TAG_ATIME: u8 = 8;
const TAG_CTIME: u8 = 9;
const TAG_MTIME: u8 = 10;
// File fields
const TAG_LAYOUT: u8 = 16;
const TAG_LENGTH: u8 = 17;
const TAG_TRUNCATE_VERSION: u8 = 18;
const TAG_LENGTH_STAMP: u8 = 19;
const TAG_FILE_FLAGS: u8 = 20;
const TAG_DYN_STRIPE: u8 = 21;
// Directory fields
const TAG_PARENT: u8 = 24;
const TAG_NAME: u8 = 25;
const TAG_CHAIN_COUNTER: u8 = 26;
const TAG_DIR_LOCK: u8 = 27;
// Symlink fields
const TAG_SYMLINK_TARGET: u8 = 28;

impl Inode {
  pub fn new_file(id: InodeId, acl: Acl, layout: Layout) -> Self {
    Inode {
      id,
      kind: InodeKind::File(FileInode {
        layout,
        ..Default::default()
      }),
      acl,
      nlink: 1,
      times: InodeTimes::now(),
    }
  }

  pub fn new_directory(id: InodeId, parent: InodeId, name: &[u8], acl: Acl, layout: Layout) -> Self {
    Inode {
      id,
      kind: InodeKind::Directory(DirInode {
        parent,
        name: name.to_vec(),
        layout,
        chain_alloc_counter: 0,
        lock: None,
      }),
      acl,
      nlink: 1,
      times: InodeTimes::now(),
    }
  }

  pub fn new_symlink(id: InodeId, acl: Acl, target: &[u8]) -> Self {
    Inode {
      id,
      kind: InodeKind::Symlink(SymlinkInode {
        target: target.to_vec(),
      }),
      acl,
      nlink: 1,
      times: InodeTimes::now(),
    }
  }

  pub fn is_file(&self) -> bool {
    matches!(self.kind, InodeKind::File(_))
  }

  pub fn is_directory(&self) -> bool {
    matches!(self.kind, InodeKind::Directory(_))
  }

  pub fn as_file(&self) -> Result<&FileInode> {
    match &self.kind {
      InodeKind::File(f) => Ok(f),
      _ => Err(FsError::InvalidArgument(format!("{} is not a file", self.id))),
    }
  }

  pub fn as_file_mut(&mut self) -> Result<&mut FileInode> {
    match &mut self.kind {
      InodeKind::File(f) => Ok(f),
      _ => Err(FsError::InvalidArgument(format!("{} is not a file", self.id))),
    }
  }

  pub fn as_directory(&self) -> Result<&DirInode> {
    match &self.kind {
      InodeKind::Directory(d) => Ok(d),
      _ => Err(FsError::InvalidArgument(format!(
        "{} is not a directory",
        self.id
      ))),
    }
  }

  pub fn as_directory_mut(&mut self) -> Result<&mut DirInode> {
    match &mut self.kind {
      InodeKind::Directory(d) => Ok(d),
      _ => Err(FsError::InvalidArgument(format!(
        "{} is not a directory",
        self.id
      ))),
    }
  }

  pub fn touch_mtime(&mut self, now: UnixMillis) {
    self.times.mtime = now;
    self.times.ctime = now;
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u64(TAG_ID, self.id.0)
      .put_u8(TAG_KIND, self.kind.tag())
      .put_u32(TAG_UID, self.acl.uid)
      .put_u32(TAG_GID, self.acl.gid)
      .put_u32(TAG_MODE, self.acl.mode)
      .put_u32(TAG_IFLAGS, self.acl.iflags.bits())
      .put_u32(TAG_NLINK, self.nlink)
      .put_u64(TAG_ATIME, self.times.atime)
      .put_u64(TAG_CTIME, self.times.ctime)
      .put_u64(TAG_MTIME, self.times.mtime);
    match &self.kind {
      InodeKind::File(f) => {
        w.put_bytes(TAG_LAYOUT, &f.layout.encode())
          .put_u64(TAG_LENGTH, f.length)
          .put_u64(TAG_TRUNCATE_VERSION, f.truncate_version)
          .put_bytes(TAG_LENGTH_STAMP, &f.length_stamp.to_bytes())
          .put_u32(TAG_FILE_FLAGS, f.flags)
          .put_u32(TAG_DYN_STRIPE, f.dyn_stripe);
      }
      InodeKind::Directory(d) => {
        w.put_u64(TAG_PARENT, d.parent.0)
          .put_bytes(TAG_NAME, &d.name)
          .put_bytes(TAG_LAYOUT, &d.layout.encode())
          .put_u32(TAG_CHAIN_COUNTER, d.chain_alloc_counter);
        if let Some(lock) = d.lock {
          w.put_bytes(TAG_DIR_LOCK, lock.as_bytes());
        }
      }
      InodeKind::Symlink(s) => {
        w.put_bytes(TAG_SYMLINK_TARGET, &s.target);
      }
    }
    w.finish()
  }

  /// Encoded form with the length stamp zeroed plus the stamp payload's
  /// byte offset, for `set_versionstamped_value`. The commit stamp lands
  /// in the record at commit time, tagging the length update. File
  /// inodes only.
  pub fn encode_with_length_stamp_template(&self) -> Result<(Vec<u8>, usize)> {
    let mut copy = self.clone();
    copy.as_file_mut()?.length_stamp = Versionstamp::default();
    let buf = copy.encode();
    let mut pos = 0;
    while pos + 5 <= buf.len() {
      let tag = buf[pos];
      let len = u32::from_be_bytes([buf[pos + 1], buf[pos + 2], buf[pos + 3], buf[pos + 4]]) as usize;
      let payload = pos + 5;
      if tag == TAG_LENGTH_STAMP {
        return Ok((buf, payload));
      }
      pos = payload + len;
    }
    Err(FsError::Internal("length stamp field missing".into()))
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let kind = match r.u8(TAG_KIND)? {
      0 => InodeKind::File(FileInode {
        layout: Layout::decode(r.bytes(TAG_LAYOUT)?)?,
        length: r.u64(TAG_LENGTH)?,
        truncate_version: r.u64(TAG_TRUNCATE_VERSION)?,
        length_stamp: Versionstamp::from_bytes(r.bytes(TAG_LENGTH_STAMP)?)
          .ok_or_else(|| FsError::Fatal("bad length stamp".into()))?,
        flags: r.u32(TAG_FILE_FLAGS)?,
        dyn_stripe: r.u32(TAG_DYN_STRIPE)?,
      }),
      1 => InodeKind::Directory(DirInode {
        parent: InodeId(r.u64(TAG_PARENT)?),
        name: r.bytes(TAG_NAME)?.to_vec(),
        layout: Layout::decode(r.bytes(TAG_LAYOUT)?)?,
        chain_alloc_counter: r.u32(TAG_CHAIN_COUNTER)?,
        lock: r.opt_bytes(TAG_DIR_LOCK).and_then(Uuid::from_bytes),
      }),
      2 => InodeKind::Symlink(SymlinkInode {
        target: r.bytes(TAG_SYMLINK_TARGET)?.to_vec(),
      }),
      other => return Err(FsError::Fatal(format!("unknown inode kind {other}"))),
    };
    Ok(Inode {
      id: InodeId(r.u64(TAG_ID)?),
      kind,
      acl: Acl {
        uid: r.u32(TAG_UID)?,
        gid: r.u32(TAG_GID)?,
        mode: r.u32(TAG_MODE)?,
        iflags: IFlags::from_bits_truncate(r.u32(TAG_IFLAGS)?),
      },
      nlink: r.u32(TAG_NLINK)?,
      times: InodeTimes {
        atime: r.u64(TAG_ATIME)?,
        ctime: r.u64(TAG_CTIME)?,
        mtime: r.u64(TAG_MTIME)?,
      },
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ChainTableId;

  fn file_layout() -> Layout {
    Layout {
      chain_table_id: ChainTableId(1),
      chain_table_version: 2,
      chunk_size: crate::constants::DEFAULT_CHUNK_SIZE,
      stripe_size: 4,
      seed: 3,
      chain_slots: vec![0, 1, 2, 3],
    }
  }

  #[test]
  fn test_file_inode_roundtrip() {
    let mut inode = Inode::new_file(InodeId(9), Acl::new(1000, 100, 0o644), file_layout());
    let file = inode.as_file_mut().unwrap();
    file.length = 4096;
    file.truncate_version = 2;
    file.length_stamp = Versionstamp::new(11, 3);
    assert_eq!(Inode::decode(&inode.encode()).unwrap(), inode);
  }

  #[test]
  fn test_directory_inode_roundtrip() {
    let mut inode = Inode::new_directory(
      InodeId(5),
      InodeId(1),
      b"data",
      Acl::new(0, 0, 0o755),
      Layout::template(ChainTableId(1), 1, crate::constants::DEFAULT_CHUNK_SIZE, 4),
    );
    inode.as_directory_mut().unwrap().chain_alloc_counter = 12;
    inode.as_directory_mut().unwrap().lock = Some(Uuid::generate());
    assert_eq!(Inode::decode(&inode.encode()).unwrap(), inode);
  }

  #[test]
  fn test_symlink_roundtrip() {
    let inode = Inode::new_symlink(InodeId(7), Acl::new(1, 1, 0o777), b"/target/path");
    assert_eq!(Inode::decode(&inode.encode()).unwrap(), inode);
  }

  #[test]
  fn test_kind_accessors() {
    let inode = Inode::new_symlink(InodeId(7), Acl::default(), b"x");
    assert!(inode.as_file().is_err());
    assert!(inode.as_directory().is_err());
    assert!(!inode.is_file() && !inode.is_directory());
  }
}
