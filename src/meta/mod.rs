//! The metadata plane: inodes, directory entries, sessions, the
//! stateless server with per-inode batching, and background GC.

pub mod dirent;
pub mod gc;
pub mod inode;
pub mod ops;
pub mod server;
pub mod session;
pub mod store;

pub use dirent::{DirEntry, EntryType};
pub use gc::{ChunkRemover, GcWorker};
pub use inode::{DirInode, FileInode, Inode, InodeKind, SymlinkInode};
pub use ops::{FsStats, MetaOp, MetaResponse, PathTarget, SetAttrs};
pub use server::{MetaNet, MetaRequest, MetaServer};
pub use session::{FileSession, UserRecord};
