//! Striped write/read-back over replicated chains.

mod common;

use common::{as_inode, Cluster};
use kitefs::layout::{ChunkId, Layout};
use kitefs::meta::{MetaOp, PathTarget};
use kitefs::storage::ChunkEngine;
use kitefs::types::{ChainTableId, OpenFlags, Uuid};

const MIB: u64 = 1024 * 1024;

fn pattern(len: usize) -> Vec<u8> {
  (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_striped_write_and_read_back() {
  // Four single-replica chains, 1 MiB chunks, stripe 4.
  let cluster = Cluster::bootstrap(1, &[&[1], &[2], &[3], &[4]], MIB, 4).await;

  let dir = cluster.mkdir_root("d").await;
  cluster
    .meta(MetaOp::SetLayout {
      dir,
      layout: Layout::template(ChainTableId(1), 1, MIB, 4),
    })
    .await
    .unwrap();

  let session = Uuid::generate();
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"f".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(session),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();
  assert_eq!(layout.stripe_size, 4);
  assert_eq!(layout.chain_slots.len(), 4);

  // Write 4 MiB of b[i] = i % 251 at offset 0.
  let data = pattern((4 * MIB) as usize);
  let written = cluster
    .client
    .write_file(file.id, &layout, 0, &data)
    .await
    .unwrap();
  assert_eq!(written, data.len());

  // Close and reopen.
  cluster
    .meta(MetaOp::Close {
      inode: file.id,
      session,
      length: Some(4 * MIB),
    })
    .await
    .unwrap();
  let reopened = as_inode(
    cluster
      .meta(MetaOp::Open {
        target: PathTarget::Name {
          parent: dir,
          name: b"f".to_vec(),
        },
        flags: OpenFlags::empty(),
        session: None,
      })
      .await
      .unwrap(),
  );
  assert_eq!(reopened.as_file().unwrap().length, 4 * MIB);

  let read = cluster
    .client
    .read_file(file.id, &layout, 0, 4 * MIB)
    .await
    .unwrap();
  assert_eq!(read, data);

  // Per-chunk placement: chunk i lives on chain i+1, i.e. on target i+1.
  for index in 0..4u32 {
    let target = cluster.target(index as u64 + 1);
    let meta = target
      .engine()
      .query_committed(ChunkId::new(file.id, index))
      .unwrap()
      .expect("chunk resides on its stripe chain");
    assert_eq!(meta.len as u64, MIB);
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_boundary_write_spans_three_chunks() {
  let chunk = 4096u64;
  let cluster = Cluster::bootstrap(1, &[&[1], &[2]], chunk, 2).await;
  let dir = cluster.mkdir_root("b").await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"edge".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(Uuid::generate()),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();

  // offset = chunk_size - 1, len = chunk_size + 2: exactly three chunks.
  let data = pattern((chunk + 2) as usize);
  cluster
    .client
    .write_file(file.id, &layout, chunk - 1, &data)
    .await
    .unwrap();

  let read = cluster
    .client
    .read_file(file.id, &layout, chunk - 1, chunk + 2)
    .await
    .unwrap();
  assert_eq!(read, data);

  let mut touched = 0;
  for index in 0..3u32 {
    for target in &cluster.targets {
      if target
        .engine()
        .query_committed(ChunkId::new(file.id, index))
        .unwrap()
        .is_some()
      {
        touched += 1;
      }
    }
  }
  assert_eq!(touched, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_truncate_shrinks_and_removes_chunks() {
  let chunk = 4096u64;
  let cluster = Cluster::bootstrap(1, &[&[1]], chunk, 1).await;
  let dir = cluster.mkdir_root("t").await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"f".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(Uuid::generate()),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();
  cluster
    .client
    .write_file(file.id, &layout, 0, &pattern((3 * chunk) as usize))
    .await
    .unwrap();
  cluster
    .meta(MetaOp::Sync {
      inode: file.id,
      length: 3 * chunk,
    })
    .await
    .unwrap();
  assert_eq!(cluster.engine(1).committed_count(), 3);

  // Shrink into the middle of chunk 1: chunk 2 is dropped post-commit.
  let truncated = as_inode(
    cluster
      .meta(MetaOp::Truncate {
        inode: file.id,
        length: chunk + 1,
      })
      .await
      .unwrap(),
  );
  let f = truncated.as_file().unwrap();
  assert_eq!(f.length, chunk + 1);
  assert_eq!(f.truncate_version, 1);
  assert_eq!(cluster.engine(1).committed_count(), 2);

  // Growing truncate extends sparsely without touching chunks.
  let grown = as_inode(
    cluster
      .meta(MetaOp::Truncate {
        inode: file.id,
        length: 4 * chunk,
      })
      .await
      .unwrap(),
  );
  assert_eq!(grown.as_file().unwrap().length, 4 * chunk);
  assert_eq!(cluster.engine(1).committed_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sparse_read_returns_zeros() {
  let chunk = 4096u64;
  let cluster = Cluster::bootstrap(1, &[&[1]], chunk, 1).await;
  let dir = cluster.mkdir_root("s").await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"sparse".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(Uuid::generate()),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();

  // Write only the second chunk; the first reads back as zeros.
  cluster
    .client
    .write_file(file.id, &layout, chunk, b"tail")
    .await
    .unwrap();
  let read = cluster
    .client
    .read_file(file.id, &layout, 0, chunk + 4)
    .await
    .unwrap();
  assert!(read[..chunk as usize].iter().all(|b| *b == 0));
  assert_eq!(&read[chunk as usize..], b"tail");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replicated_chain_write_lands_on_all_replicas() {
  let chunk = 4096u64;
  let cluster = Cluster::bootstrap(1, &[&[1, 2, 3]], chunk, 1).await;
  let dir = cluster.mkdir_root("r").await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"f".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(Uuid::generate()),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();
  cluster
    .client
    .write_file(file.id, &layout, 0, b"replicated bytes")
    .await
    .unwrap();

  // Every committed replica stores the same (version, data).
  let chunk_id = ChunkId::new(file.id, 0);
  for target_id in [1u64, 2, 3] {
    let engine = cluster.target(target_id).engine();
    let meta = engine.query_committed(chunk_id).unwrap().expect("replica");
    assert_eq!(meta.chunk_version, 1);
    assert!(!meta.uncommitted);
    assert_eq!(
      engine.read_committed(chunk_id, 0, 16).unwrap().unwrap(),
      b"replicated bytes".to_vec()
    );
  }
}
