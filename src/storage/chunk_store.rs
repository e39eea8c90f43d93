//! Local chunk store contract and the in-memory engine.
//!
//! The on-disk engine is opaque to the data path: anything that stores
//! `(chunk id -> versioned, checksummed bytes)` with a one-slot staging
//! area per chunk satisfies [`ChunkEngine`]. Each chunk carries the chain
//! it belongs to, its chain version at last write, a per-update chunk
//! version, and a crc32 checksum verified on read.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::error::{FsError, Result};
use crate::layout::ChunkId;
use crate::types::{ChainId, ChainVersion, ChunkVersion, InodeId};

/// Per-chunk record metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkMeta {
  pub chain: ChainId,
  pub chain_version: ChainVersion,
  pub chunk_version: ChunkVersion,
  pub checksum: u32,
  pub len: u32,
  pub uncommitted: bool,
}

/// A fully materialized committed record, as shipped during resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
  pub chunk: ChunkId,
  pub chain: ChainId,
  pub chain_version: ChainVersion,
  pub chunk_version: ChunkVersion,
  pub data: Vec<u8>,
}

/// The local storage engine owned by one target.
pub trait ChunkEngine: Send + Sync + 'static {
  /// Stage an update as the uncommitted next version of the chunk.
  /// Returns the tentative chunk version.
  fn write(
    &self,
    chunk: ChunkId,
    chain: ChainId,
    chain_version: ChainVersion,
    offset: u32,
    data: &[u8],
  ) -> Result<ChunkVersion>;

  /// Promote the staged record with the given version to committed.
  fn commit(&self, chunk: ChunkId, version: ChunkVersion) -> Result<()>;

  /// Read from the committed record, checksum-verified. `None` when the
  /// chunk has no committed data.
  fn read_committed(&self, chunk: ChunkId, offset: u32, len: u32) -> Result<Option<Vec<u8>>>;

  /// Metadata for the newest record (staged if present, else committed).
  fn query(&self, chunk: ChunkId) -> Result<Option<ChunkMeta>>;

  /// Metadata for the committed record only.
  fn query_committed(&self, chunk: ChunkId) -> Result<Option<ChunkMeta>>;

  /// Drop a chunk entirely. Returns false when it was already absent.
  fn remove(&self, chunk: ChunkId) -> Result<bool>;

  /// Committed metadata for every chunk of one inode, ascending.
  fn list_inode(&self, inode: InodeId) -> Result<Vec<(ChunkId, ChunkMeta)>>;

  /// Committed records of one chain, for resync streaming.
  fn list_chain(&self, chain: ChainId) -> Result<Vec<ChunkRecord>>;

  /// Install a committed record verbatim (resync apply).
  fn install(&self, record: &ChunkRecord) -> Result<()>;

  /// Flush engine state; a no-op for memory engines.
  fn checkpoint(&self) -> Result<()>;
}

// ============================================================================
// In-memory engine
// ============================================================================

#[derive(Debug, Clone)]
struct Slot {
  chain: ChainId,
  chain_version: ChainVersion,
  chunk_version: ChunkVersion,
  data: Vec<u8>,
  checksum: u32,
}

impl Slot {
  fn meta(&self, uncommitted: bool) -> ChunkMeta {
    ChunkMeta {
      chain: self.chain,
      chain_version: self.chain_version,
      chunk_version: self.chunk_version,
      checksum: self.checksum,
      len: self.data.len() as u32,
      uncommitted,
    }
  }
}

#[derive(Debug, Default)]
struct Entry {
  committed: Option<Slot>,
  staged: Option<Slot>,
}

/// Checksummed in-memory chunk engine, the test and single-node backend.
#[derive(Debug, Default)]
pub struct MemChunkEngine {
  chunks: RwLock<BTreeMap<[u8; 16], Entry>>,
}

fn crc(data: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(data);
  hasher.finalize()
}

impl MemChunkEngine {
  pub fn new() -> Self {
    Self::default()
  }

  /// Number of chunks holding a committed record.
  pub fn committed_count(&self) -> usize {
    self
      .chunks
      .read()
      .values()
      .filter(|entry| entry.committed.is_some())
      .count()
  }

  /// Flip a committed byte without updating the checksum, so the next
  /// read fails verification. Test hook for the corruption path.
  pub fn corrupt(&self, chunk: ChunkId) -> bool {
    let mut chunks = self.chunks.write();
    if let Some(slot) = chunks
      .get_mut(&chunk.encode())
      .and_then(|entry| entry.committed.as_mut())
    {
      if let Some(byte) = slot.data.first_mut() {
        *byte = byte.wrapping_add(1);
        return true;
      }
    }
    false
  }
}

impl ChunkEngine for MemChunkEngine {
  fn write(
    &self,
    chunk: ChunkId,
    chain: ChainId,
    chain_version: ChainVersion,
    offset: u32,
    data: &[u8],
  ) -> Result<ChunkVersion> {
    let mut chunks = self.chunks.write();
    let entry = chunks.entry(chunk.encode()).or_default();

    // Start from the committed image and patch the written range.
    let base = entry
      .committed
      .as_ref()
      .map(|slot| slot.data.clone())
      .unwrap_or_default();
    let end = offset as usize + data.len();
    let mut image = base;
    if image.len() < end {
      image.resize(end, 0);
    }
    image[offset as usize..end].copy_from_slice(data);

    let version = entry
      .committed
      .as_ref()
      .map(|slot| slot.chunk_version)
      .unwrap_or(0)
      + 1;
    entry.staged = Some(Slot {
      chain,
      chain_version,
      chunk_version: version,
      checksum: crc(&image),
      data: image,
    });
    Ok(version)
  }

  fn commit(&self, chunk: ChunkId, version: ChunkVersion) -> Result<()> {
    let mut chunks = self.chunks.write();
    let entry = chunks
      .get_mut(&chunk.encode())
      .ok_or_else(|| FsError::NotFound(format!("{chunk}")))?;
    match entry.staged.take() {
      Some(slot) if slot.chunk_version == version => {
        entry.committed = Some(slot);
        Ok(())
      }
      Some(slot) => {
        // Stale commit ack; put the newer staged record back.
        let staged_version = slot.chunk_version;
        entry.staged = Some(slot);
        Err(FsError::VersionMismatch {
          expected: version as u64,
          found: staged_version as u64,
        })
      }
      None => {
        // Replayed commit for a record that already landed.
        match &entry.committed {
          Some(slot) if slot.chunk_version >= version => Ok(()),
          _ => Err(FsError::NotFound(format!("staged {chunk}"))),
        }
      }
    }
  }

  fn read_committed(&self, chunk: ChunkId, offset: u32, len: u32) -> Result<Option<Vec<u8>>> {
    let chunks = self.chunks.read();
    let Some(slot) = chunks
      .get(&chunk.encode())
      .and_then(|entry| entry.committed.as_ref())
    else {
      return Ok(None);
    };
    if crc(&slot.data) != slot.checksum {
      return Err(FsError::Corruption);
    }
    let start = (offset as usize).min(slot.data.len());
    let end = (offset as usize + len as usize).min(slot.data.len());
    let mut out = slot.data[start..end].to_vec();
    // Reads past the written extent return zeros.
    out.resize(len as usize, 0);
    Ok(Some(out))
  }

  fn query(&self, chunk: ChunkId) -> Result<Option<ChunkMeta>> {
    let chunks = self.chunks.read();
    Ok(chunks.get(&chunk.encode()).and_then(|entry| {
      entry
        .staged
        .as_ref()
        .map(|slot| slot.meta(true))
        .or_else(|| entry.committed.as_ref().map(|slot| slot.meta(false)))
    }))
  }

  fn query_committed(&self, chunk: ChunkId) -> Result<Option<ChunkMeta>> {
    let chunks = self.chunks.read();
    Ok(
      chunks
        .get(&chunk.encode())
        .and_then(|entry| entry.committed.as_ref().map(|slot| slot.meta(false))),
    )
  }

  fn remove(&self, chunk: ChunkId) -> Result<bool> {
    Ok(self.chunks.write().remove(&chunk.encode()).is_some())
  }

  fn list_inode(&self, inode: InodeId) -> Result<Vec<(ChunkId, ChunkMeta)>> {
    let begin = ChunkId::first_for_inode(inode).encode();
    let end = ChunkId::first_for_inode(InodeId(inode.0 + 1)).encode();
    let chunks = self.chunks.read();
    let mut out = Vec::new();
    for (raw, entry) in chunks.range(begin..end) {
      if let Some(slot) = &entry.committed {
        out.push((ChunkId::decode(raw)?, slot.meta(false)));
      }
    }
    Ok(out)
  }

  fn list_chain(&self, chain: ChainId) -> Result<Vec<ChunkRecord>> {
    let chunks = self.chunks.read();
    let mut out = Vec::new();
    for (raw, entry) in chunks.iter() {
      if let Some(slot) = &entry.committed {
        if slot.chain == chain {
          out.push(ChunkRecord {
            chunk: ChunkId::decode(raw)?,
            chain: slot.chain,
            chain_version: slot.chain_version,
            chunk_version: slot.chunk_version,
            data: slot.data.clone(),
          });
        }
      }
    }
    Ok(out)
  }

  fn install(&self, record: &ChunkRecord) -> Result<()> {
    let mut chunks = self.chunks.write();
    let entry = chunks.entry(record.chunk.encode()).or_default();
    // Never step a replica backwards.
    if let Some(committed) = &entry.committed {
      if committed.chunk_version >= record.chunk_version {
        return Ok(());
      }
    }
    entry.committed = Some(Slot {
      chain: record.chain,
      chain_version: record.chain_version,
      chunk_version: record.chunk_version,
      checksum: crc(&record.data),
      data: record.data.clone(),
    });
    Ok(())
  }

  fn checkpoint(&self) -> Result<()> {
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn chunk(index: u32) -> ChunkId {
    ChunkId::new(InodeId(7), index)
  }

  #[test]
  fn test_write_commit_read() {
    let engine = MemChunkEngine::new();
    let version = engine.write(chunk(0), ChainId(1), 1, 0, b"hello").unwrap();
    assert_eq!(version, 1);
    // Uncommitted data is not readable.
    assert_eq!(engine.read_committed(chunk(0), 0, 5).unwrap(), None);
    engine.commit(chunk(0), version).unwrap();
    assert_eq!(
      engine.read_committed(chunk(0), 0, 5).unwrap(),
      Some(b"hello".to_vec())
    );
    // Offset read past extent zero-fills.
    assert_eq!(
      engine.read_committed(chunk(0), 3, 4).unwrap(),
      Some(vec![b'l', b'o', 0, 0])
    );
  }

  #[test]
  fn test_versions_increment_per_update() {
    let engine = MemChunkEngine::new();
    let v1 = engine.write(chunk(0), ChainId(1), 1, 0, b"a").unwrap();
    engine.commit(chunk(0), v1).unwrap();
    let v2 = engine.write(chunk(0), ChainId(1), 1, 0, b"b").unwrap();
    engine.commit(chunk(0), v2).unwrap();
    assert_eq!((v1, v2), (1, 2));
    let meta = engine.query(chunk(0)).unwrap().unwrap();
    assert_eq!(meta.chunk_version, 2);
    assert!(!meta.uncommitted);
  }

  #[test]
  fn test_staged_overlay_preserves_committed_base() {
    let engine = MemChunkEngine::new();
    let v1 = engine.write(chunk(0), ChainId(1), 1, 0, b"abcdef").unwrap();
    engine.commit(chunk(0), v1).unwrap();
    // Patch two bytes in the middle; the staged image keeps the rest.
    let v2 = engine.write(chunk(0), ChainId(1), 1, 2, b"XY").unwrap();
    engine.commit(chunk(0), v2).unwrap();
    assert_eq!(
      engine.read_committed(chunk(0), 0, 6).unwrap(),
      Some(b"abXYef".to_vec())
    );
  }

  #[test]
  fn test_replayed_commit_is_noop() {
    let engine = MemChunkEngine::new();
    let v1 = engine.write(chunk(0), ChainId(1), 1, 0, b"x").unwrap();
    engine.commit(chunk(0), v1).unwrap();
    engine.commit(chunk(0), v1).unwrap();
  }

  #[test]
  fn test_corruption_detected() {
    let engine = MemChunkEngine::new();
    let v1 = engine.write(chunk(0), ChainId(1), 1, 0, b"data").unwrap();
    engine.commit(chunk(0), v1).unwrap();
    assert!(engine.corrupt(chunk(0)));
    assert_eq!(
      engine.read_committed(chunk(0), 0, 4),
      Err(FsError::Corruption)
    );
  }

  #[test]
  fn test_remove_idempotent() {
    let engine = MemChunkEngine::new();
    let v1 = engine.write(chunk(3), ChainId(1), 1, 0, b"x").unwrap();
    engine.commit(chunk(3), v1).unwrap();
    assert!(engine.remove(chunk(3)).unwrap());
    assert!(!engine.remove(chunk(3)).unwrap());
  }

  #[test]
  fn test_list_inode_and_chain() {
    let engine = MemChunkEngine::new();
    for index in 0..3 {
      let v = engine
        .write(chunk(index), ChainId(index % 2 + 1), 1, 0, b"z")
        .unwrap();
      engine.commit(chunk(index), v).unwrap();
    }
    let listed = engine.list_inode(InodeId(7)).unwrap();
    assert_eq!(listed.len(), 3);
    assert!(listed.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(engine.list_chain(ChainId(1)).unwrap().len(), 2);
    assert_eq!(engine.list_inode(InodeId(8)).unwrap().len(), 0);
  }

  #[test]
  fn test_install_never_regresses() {
    let engine = MemChunkEngine::new();
    let record = ChunkRecord {
      chunk: chunk(0),
      chain: ChainId(1),
      chain_version: 2,
      chunk_version: 5,
      data: b"newer".to_vec(),
    };
    engine.install(&record).unwrap();
    let stale = ChunkRecord {
      chunk_version: 3,
      data: b"older".to_vec(),
      ..record.clone()
    };
    engine.install(&stale).unwrap();
    assert_eq!(
      engine.read_committed(chunk(0), 0, 5).unwrap(),
      Some(b"newer".to_vec())
    );
  }
}
