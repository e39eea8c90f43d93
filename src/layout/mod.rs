//! Chunk addressing and file layout.
//!
//! A file's bytes are split into fixed-size chunks; chunk `i` lives on the
//! chain referenced by slot `(seed + i) % stripe_size` of the file's
//! layout. Chunk ids are position-based (inode + index), which permits
//! in-place updates without metadata rewrites, and their encoding is
//! big-endian so sequential offsets produce sequential keys.

use byteorder::{BigEndian, ByteOrder};

use crate::codec::{FieldReader, FieldWriter};
use crate::constants::{
  CHUNK_ID_LEN, DEFAULT_TENANT, DEFAULT_TRACK, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
use crate::error::{FsError, Result};
use crate::types::{ChainTableId, ChainTableVersion, InodeId};

// ============================================================================
// ChunkId
// ============================================================================

/// 16-byte chunk address: `tenant(1) | reserved(1) | inode(8) | track(2) |
/// chunk_index(4)`, big-endian components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId {
  pub tenant: u8,
  pub inode: InodeId,
  pub track: u16,
  pub index: u32,
}

impl ChunkId {
  pub fn new(inode: InodeId, index: u32) -> Self {
    ChunkId {
      tenant: DEFAULT_TENANT,
      inode,
      track: DEFAULT_TRACK,
      index,
    }
  }

  pub fn encode(&self) -> [u8; CHUNK_ID_LEN] {
    let mut out = [0u8; CHUNK_ID_LEN];
    out[0] = self.tenant;
    // out[1] reserved, zero
    BigEndian::write_u64(&mut out[2..10], self.inode.0);
    BigEndian::write_u16(&mut out[10..12], self.track);
    BigEndian::write_u32(&mut out[12..16], self.index);
    out
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    if raw.len() != CHUNK_ID_LEN {
      return Err(FsError::InvalidArgument("chunk id must be 16 bytes".into()));
    }
    Ok(ChunkId {
      tenant: raw[0],
      inode: InodeId(BigEndian::read_u64(&raw[2..10])),
      track: BigEndian::read_u16(&raw[10..12]),
      index: BigEndian::read_u32(&raw[12..16]),
    })
  }

  /// Smallest chunk id of an inode, for range scans over its chunks.
  pub fn first_for_inode(inode: InodeId) -> Self {
    ChunkId::new(inode, 0)
  }
}

impl std::fmt::Display for ChunkId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "chunk:{}.{}.{}", self.inode.0, self.track, self.index)
  }
}

// ============================================================================
// Layout
// ============================================================================

/// How a file's chunks map onto chains. Inherited from the parent
/// directory at create time and frozen in the file inode thereafter: a
/// directory's layout is a template (`chain_slots` empty), a striped
/// file's layout pins its allocated slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
  pub chain_table_id: ChainTableId,
  pub chain_table_version: ChainTableVersion,
  /// Power-of-two byte count.
  pub chunk_size: u64,
  /// Number of chains the file cycles across.
  pub stripe_size: u32,
  /// Rotation offset into the stripe.
  pub seed: u32,
  /// Positions inside the chain table, one per stripe slot. Empty on
  /// directory (template) layouts.
  pub chain_slots: Vec<u32>,
}

impl Default for Layout {
  fn default() -> Self {
    Layout::template(ChainTableId(0), 0, crate::constants::DEFAULT_CHUNK_SIZE, 1)
  }
}

const TAG_TABLE_ID: u8 = 1;
const TAG_TABLE_VERSION: u8 = 2;
const TAG_CHUNK_SIZE: u8 = 3;
const TAG_STRIPE_SIZE: u8 = 4;
const TAG_SEED: u8 = 5;
const TAG_CHAIN_SLOT: u8 = 6;

impl Layout {
  pub fn template(
    chain_table_id: ChainTableId,
    chain_table_version: ChainTableVersion,
    chunk_size: u64,
    stripe_size: u32,
  ) -> Self {
    Layout {
      chain_table_id,
      chain_table_version,
      chunk_size,
      stripe_size,
      seed: 0,
      chain_slots: Vec::new(),
    }
  }

  pub fn validate(&self) -> Result<()> {
    if !self.chunk_size.is_power_of_two()
      || self.chunk_size < MIN_CHUNK_SIZE
      || self.chunk_size > MAX_CHUNK_SIZE
    {
      return Err(FsError::InvalidArgument(format!(
        "chunk size {} must be a power of two in [{MIN_CHUNK_SIZE}, {MAX_CHUNK_SIZE}]",
        self.chunk_size
      )));
    }
    if self.stripe_size == 0 {
      return Err(FsError::InvalidArgument("stripe size must be >= 1".into()));
    }
    if !self.chain_slots.is_empty() && self.chain_slots.len() != self.stripe_size as usize {
      return Err(FsError::InvalidArgument(format!(
        "{} chain slots for stripe size {}",
        self.chain_slots.len(),
        self.stripe_size
      )));
    }
    Ok(())
  }

  /// Whether chain slots have been allocated (file layouts only).
  pub fn is_striped(&self) -> bool {
    !self.chain_slots.is_empty()
  }

  pub fn chunk_index(&self, offset: u64) -> u32 {
    (offset / self.chunk_size) as u32
  }

  /// Stripe slot for a chunk.
  pub fn chain_slot(&self, chunk_index: u32) -> u32 {
    (self.seed.wrapping_add(chunk_index)) % self.stripe_size
  }

  /// Position inside the chain table holding this chunk.
  pub fn chain_ref(&self, chunk_index: u32) -> Result<u32> {
    let slot = self.chain_slot(chunk_index) as usize;
    self
      .chain_slots
      .get(slot)
      .copied()
      .ok_or_else(|| FsError::Internal("layout has no chain slots".into()))
  }

  /// Number of chunks needed to hold `length` bytes.
  pub fn chunk_count(&self, length: u64) -> u32 {
    length.div_ceil(self.chunk_size) as u32
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_TABLE_ID, self.chain_table_id.0)
      .put_u32(TAG_TABLE_VERSION, self.chain_table_version)
      .put_u64(TAG_CHUNK_SIZE, self.chunk_size)
      .put_u32(TAG_STRIPE_SIZE, self.stripe_size)
      .put_u32(TAG_SEED, self.seed);
    for slot in &self.chain_slots {
      w.put_u32(TAG_CHAIN_SLOT, *slot);
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let chain_slots = r
      .get_all(TAG_CHAIN_SLOT)
      .map(|payload| {
        if payload.len() != 4 {
          return Err(FsError::Fatal("bad chain slot width".into()));
        }
        Ok(BigEndian::read_u32(payload))
      })
      .collect::<Result<Vec<u32>>>()?;
    Ok(Layout {
      chain_table_id: ChainTableId(r.u32(TAG_TABLE_ID)?),
      chain_table_version: r.u32(TAG_TABLE_VERSION)?,
      chunk_size: r.u64(TAG_CHUNK_SIZE)?,
      stripe_size: r.u32(TAG_STRIPE_SIZE)?,
      seed: r.u32(TAG_SEED)?,
      chain_slots,
    })
  }
}

// ============================================================================
// I/O splitting
// ============================================================================

/// One chunk-aligned piece of a larger file I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
  pub chunk_index: u32,
  /// Byte offset inside the chunk.
  pub offset: u32,
  pub len: u32,
  /// Byte offset inside the caller's buffer.
  pub buffer_offset: usize,
}

/// Split `[offset, offset + len)` across chunk boundaries. Each returned
/// span addresses exactly one chunk (and therefore exactly one chain).
pub fn split_io(layout: &Layout, offset: u64, len: u64) -> Vec<ChunkSpan> {
  let mut spans = Vec::new();
  let mut pos = offset;
  let end = offset + len;
  while pos < end {
    let chunk_index = layout.chunk_index(pos);
    let in_chunk = pos % layout.chunk_size;
    let take = (layout.chunk_size - in_chunk).min(end - pos);
    spans.push(ChunkSpan {
      chunk_index,
      offset: in_chunk as u32,
      len: take as u32,
      buffer_offset: (pos - offset) as usize,
    });
    pos += take;
  }
  spans
}
