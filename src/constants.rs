//! Magic numbers and defaults for KiteFS.

use crate::types::InodeId;

// ============================================================================
// Key schema prefixes (4-byte ASCII, one per table)
// ============================================================================

pub const PREFIX_INODE: &[u8; 4] = b"INOD";
pub const PREFIX_DENTRY: &[u8; 4] = b"DENT";
pub const PREFIX_SESSION: &[u8; 4] = b"INOS";
pub const PREFIX_CHAIN_TABLE: &[u8; 4] = b"CHIT";
pub const PREFIX_CHAIN_INFO: &[u8; 4] = b"CHIF";
pub const PREFIX_TARGET_INFO: &[u8; 4] = b"TGIF";
pub const PREFIX_NODE: &[u8; 4] = b"NODE";
pub const PREFIX_META: &[u8; 4] = b"META";
pub const PREFIX_IDEMPOTENT: &[u8; 4] = b"IDEM";
pub const PREFIX_USER: &[u8; 4] = b"USER";
pub const PREFIX_CONFIG: &[u8; 4] = b"CONF";
pub const PREFIX_GC_QUEUE: &[u8; 4] = b"GCQU";

// ============================================================================
// Chunk addressing
// ============================================================================

/// Encoded chunk id width: tenant(1) | reserved(1) | inode(8) | track(2) |
/// chunk_index(4), all big-endian.
pub const CHUNK_ID_LEN: usize = 16;

/// Single-tenant deployments use tenant 0.
pub const DEFAULT_TENANT: u8 = 0;

/// Track 0 for single-track files.
pub const DEFAULT_TRACK: u16 = 0;

/// Default chunk size (512 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// Smallest accepted chunk size (4 KiB).
pub const MIN_CHUNK_SIZE: u64 = 4096;

/// Largest accepted chunk size (64 MiB).
pub const MAX_CHUNK_SIZE: u64 = 64 * 1024 * 1024;

// ============================================================================
// Initial ids (0 is reserved/null, root inode is 1)
// ============================================================================

pub const ROOT_INODE: InodeId = InodeId::ROOT;
pub const FIRST_ALLOCATED_INODE: u64 = 2;

// ============================================================================
// Metadata plane defaults
// ============================================================================

/// Largest dentry name accepted.
pub const MAX_NAME_LEN: usize = 255;

/// Largest symlink target accepted.
pub const MAX_SYMLINK_LEN: usize = 4096;

/// Per-inode operation batch cap.
pub const DEFAULT_META_BATCH_SIZE: usize = 64;

/// Default page size for `list`.
pub const DEFAULT_LIST_LIMIT: usize = 512;

/// Chunks removed per storage round during truncate/GC.
pub const DEFAULT_REMOVE_CHUNKS_BATCH: usize = 32;

// ============================================================================
// Membership timing defaults (milliseconds)
// ============================================================================

pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_NODE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_LEASE_MS: u64 = 10_000;
pub const DEFAULT_LEASE_RENEW_MS: u64 = 2_000;
pub const DEFAULT_DISTRIBUTOR_UPDATE_MS: u64 = 1_000;
pub const DEFAULT_DISTRIBUTOR_FAILURE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_GC_INTERVAL_MS: u64 = 1_000;

// ============================================================================
// Storage client defaults
// ============================================================================

pub const DEFAULT_MAX_BATCH_SIZE: usize = 128;
pub const DEFAULT_MAX_BATCH_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_PER_NODE: usize = 4;
pub const DEFAULT_IO_RETRY_ATTEMPTS: u32 = 8;
