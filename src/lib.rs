//! KiteFS - Disaggregated distributed file system core
//!
//! KiteFS stripes file data across replication chains of storage targets
//! and keeps all metadata in a transactional key-value store.
//!
//! # Architecture
//!
//! - **KV**: serializable transactions with versionstamps; the metadata
//!   plane's only concurrency primitive
//! - **Metadata**: stateless servers, per-inode operation batching,
//!   decentralized ownership via consistent hashing over a shared map
//! - **Data**: 16-byte position-based chunk ids, striped layouts, chain
//!   replication with apportioned queries (CRAQ)
//! - **Routing**: one monotonically versioned cluster map, lease-elected
//!   primary mgmtd, cooperative control loops
//!
//! # Features
//!
//! - Snapshot reads everywhere; optimistic conflicts only at commit
//! - Idempotent mutations keyed by request uuid
//! - Version-checked reads from any replica
//! - Crash-safe deletion through a persisted GC queue

// Core modules
pub mod constants;
pub mod error;
pub mod types;
pub mod util;

// Transaction/KV engine
pub mod kv;

// Key schema and value codec
pub mod codec;

// Chunk addressing and layouts
pub mod layout;

// Cluster routing and membership
pub mod routing;

// Decentralized meta-server assignment
pub mod distributor;

// Metadata plane
pub mod meta;

// Storage data path
pub mod storage;

// Chunk I/O client
pub mod client;

// Wire envelope and transports
pub mod wire;

// Configuration and metrics
pub mod config;
pub mod metrics;

// Re-export commonly used items
pub use error::{FsError, Result};

pub use client::StorageClient;
pub use config::FsConfig;
pub use distributor::MetaDistributor;
pub use kv::MemKvEngine;
pub use layout::{ChunkId, Layout};
pub use meta::{MetaRequest, MetaResponse, MetaServer};
pub use routing::{MgmtdService, RoutingInfo};
pub use storage::{MemChunkEngine, StorageTarget};
pub use types::{ChainId, InodeId, NodeId, TargetId, Uuid, Versionstamp};

/// Crate version.
pub fn version() -> &'static str {
  env!("CARGO_PKG_VERSION")
}
