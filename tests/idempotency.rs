//! Request replay and MaybeCommitted handling.

mod common;

use common::{as_inode, Cluster};
use kitefs::codec::keys;
use kitefs::kv::{prefix_range, scan_range, KvEngine};
use kitefs::meta::{MetaOp, MetaResponse};
use kitefs::types::{InodeId, OpenFlags, Uuid};

const CHUNK: u64 = 4096;

fn create_op(name: &[u8]) -> MetaOp {
  MetaOp::Create {
    parent: InodeId::ROOT,
    name: name.to_vec(),
    mode: 0o644,
    flags: OpenFlags::CREATE | OpenFlags::EXCL,
    layout: None,
    session: None,
  }
}

fn count_inodes(cluster: &Cluster) -> usize {
  let (begin, end) = prefix_range(kitefs::constants::PREFIX_INODE);
  let mut txn = cluster.kv.begin_read_only();
  scan_range(&mut txn, &begin, &end, 1024).unwrap().len()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_maybe_committed_create_applies_once() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  // Warm the inode allocator so the injected fault hits the create
  // transaction itself, not the allocator's block grab.
  cluster.meta(create_op(b"warmup")).await.unwrap();
  let before = count_inodes(&cluster);

  // One-shot fault: the commit applies but reports MaybeCommitted. The
  // server-side retry replays with the same request uuid and the
  // idempotency record short-circuits the second application.
  cluster.kv.inject_maybe_committed_once();
  let request = Uuid::generate();
  let first = as_inode(
    cluster
      .meta_with_uuid(request, create_op(b"once"))
      .await
      .unwrap(),
  );

  assert_eq!(count_inodes(&cluster), before + 1);
  assert_eq!(first.nlink, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_create_returns_same_inode() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  let request = Uuid::generate();

  let first = as_inode(
    cluster
      .meta_with_uuid(request, create_op(b"f"))
      .await
      .unwrap(),
  );
  let before = count_inodes(&cluster);

  // Client-side replay with the same uuid: same result, no side effects,
  // even though the create carries O_EXCL.
  let second = as_inode(
    cluster
      .meta_with_uuid(request, create_op(b"f"))
      .await
      .unwrap(),
  );
  assert_eq!(second.id, first.id);
  assert_eq!(count_inodes(&cluster), before);

  // A different uuid for the same name is a genuine collision.
  let other = cluster.meta(create_op(b"f")).await;
  assert!(matches!(other, Err(kitefs::FsError::AlreadyExists(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_replayed_remove_is_noop() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  cluster.meta(create_op(b"victim")).await.unwrap();

  let request = Uuid::generate();
  let op = MetaOp::Remove {
    parent: InodeId::ROOT,
    name: b"victim".to_vec(),
  };
  let first = cluster.meta_with_uuid(request, op.clone()).await;
  assert!(matches!(first, Ok(MetaResponse::Unit)));
  // Replay succeeds idempotently; a fresh uuid sees NotFound.
  let replay = cluster.meta_with_uuid(request, op.clone()).await;
  assert!(matches!(replay, Ok(MetaResponse::Unit)));
  let fresh = cluster.meta(op).await;
  assert!(matches!(fresh, Err(kitefs::FsError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_chunks_idempotent() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: InodeId::ROOT,
        name: b"data".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(Uuid::generate()),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();
  let bytes = vec![7u8; (2 * CHUNK) as usize];
  cluster
    .client
    .write_file(file.id, &layout, 0, &bytes)
    .await
    .unwrap();
  assert_eq!(cluster.engine(1).committed_count(), 2);

  let removed = cluster.client.remove_chunks(file.id, 0, 16).await.unwrap();
  assert_eq!(removed, 2);
  // Reapplication is a no-op.
  let again = cluster.client.remove_chunks(file.id, 0, 16).await.unwrap();
  assert_eq!(again, 0);
  assert_eq!(cluster.engine(1).committed_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idem_records_written_per_mutation() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  let request = Uuid::generate();
  cluster
    .meta_with_uuid(request, create_op(b"tracked"))
    .await
    .unwrap();

  let key = keys::idempotency_key(request, "create");
  let mut txn = cluster.kv.begin_read_only();
  use kitefs::kv::ReadTransaction;
  assert!(txn.snapshot_get(&key).unwrap().is_some());
}
