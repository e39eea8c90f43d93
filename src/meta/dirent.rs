//! Directory entries.

use crate::codec::{FieldReader, FieldWriter};
use crate::error::{FsError, Result};
use crate::types::{InodeId, Uuid};

/// Kind tag carried on a dentry so `list` can report types without
/// loading every child inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
  File,
  Directory,
  Symlink,
}

impl EntryType {
  pub fn to_u8(self) -> u8 {
    match self {
      EntryType::File => 0,
      EntryType::Directory => 1,
      EntryType::Symlink => 2,
    }
  }

  pub fn from_u8(v: u8) -> Result<Self> {
    match v {
      0 => Ok(EntryType::File),
      1 => Ok(EntryType::Directory),
      2 => Ok(EntryType::Symlink),
      other => Err(FsError::Fatal(format!("unknown entry type {other}"))),
    }
  }
}

/// One name in one directory. The `uuid` is the creating request's uuid,
/// which lets a replayed create recognize its own entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
  pub parent: InodeId,
  pub name: Vec<u8>,
  pub target: InodeId,
  pub entry_type: EntryType,
  pub uuid: Uuid,
}

const TAG_PARENT: u8 = 1;
const TAG_NAME: u8 = 2;
const TAG_TARGET: u8 = 3;
const TAG_TYPE: u8 = 4;
const TAG_UUID: u8 = 5;

impl DirEntry {
  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u64(TAG_PARENT, self.parent.0)
      .put_bytes(TAG_NAME, &self.name)
      .put_u64(TAG_TARGET, self.target.0)
      .put_u8(TAG_TYPE, self.entry_type.to_u8())
      .put_bytes(TAG_UUID, self.uuid.as_bytes());
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    Ok(DirEntry {
      parent: InodeId(r.u64(TAG_PARENT)?),
      name: r.bytes(TAG_NAME)?.to_vec(),
      target: InodeId(r.u64(TAG_TARGET)?),
      entry_type: EntryType::from_u8(r.u8(TAG_TYPE)?)?,
      uuid: Uuid::from_bytes(r.bytes(TAG_UUID)?)
        .ok_or_else(|| FsError::Fatal("bad dentry uuid".into()))?,
    })
  }
}
