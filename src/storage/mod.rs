//! The storage data path: local chunk engines, targets, and chain
//! replication.

pub mod chunk_store;
pub mod target;

pub use chunk_store::{ChunkEngine, ChunkMeta, ChunkRecord, MemChunkEngine};
pub use target::{
  ReadReq, ReadResp, ResyncPage, ResyncReq, StorageNet, StorageOp, StorageOpResp, StorageTarget,
  WriteAck, WriteReq,
};
