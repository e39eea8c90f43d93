//! Crash-safe deletion: unlinked inodes and their chunks disappear.

mod common;

use common::{as_inode, Cluster};
use kitefs::codec::keys;
use kitefs::kv::{KvEngine, KvRetryConfig, ReadTransaction};
use kitefs::meta::{GcWorker, MetaOp};
use kitefs::types::{InodeId, OpenFlags, Uuid};

const CHUNK: u64 = 4096;

fn gc_worker(cluster: &Cluster) -> GcWorker<kitefs::MemKvEngine> {
  GcWorker::new(
    cluster.kv.clone(),
    cluster.metas[0].distributor().clone(),
    cluster.client.clone(),
    cluster.metas[0].config().clone(),
    KvRetryConfig::default(),
  )
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unlinked_file_fully_reclaimed() {
  let cluster = Cluster::bootstrap(1, &[&[1, 2]], CHUNK, 1).await;
  let session = Uuid::generate();
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: InodeId::ROOT,
        name: b"doomed".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(session),
      })
      .await
      .unwrap(),
  );
  let layout = file.as_file().unwrap().layout.clone();
  cluster
    .client
    .write_file(file.id, &layout, 0, &vec![9u8; (3 * CHUNK) as usize])
    .await
    .unwrap();
  assert_eq!(cluster.engine(1).committed_count(), 3);
  assert_eq!(cluster.engine(2).committed_count(), 3);

  cluster
    .meta(MetaOp::Close {
      inode: file.id,
      session,
      length: Some(3 * CHUNK),
    })
    .await
    .unwrap();
  cluster
    .meta(MetaOp::Remove {
      parent: InodeId::ROOT,
      name: b"doomed".to_vec(),
    })
    .await
    .unwrap();

  // The inode sits on the GC queue until the worker runs.
  {
    let mut txn = cluster.kv.begin_read_only();
    assert!(txn
      .snapshot_get(&keys::gc_queue_key(file.id))
      .unwrap()
      .is_some());
    assert!(txn.snapshot_get(&keys::inode_key(file.id)).unwrap().is_some());
  }

  let worker = gc_worker(&cluster);
  let reclaimed = worker.run_gc().await.unwrap();
  assert_eq!(reclaimed, 1);

  // Inode record, queue entry and every replica's chunks are gone.
  let mut txn = cluster.kv.begin_read_only();
  assert!(txn.snapshot_get(&keys::inode_key(file.id)).unwrap().is_none());
  assert!(txn
    .snapshot_get(&keys::gc_queue_key(file.id))
    .unwrap()
    .is_none());
  assert_eq!(cluster.engine(1).committed_count(), 0);
  assert_eq!(cluster.engine(2).committed_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_open_session_defers_deletion() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  let session = Uuid::generate();
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: InodeId::ROOT,
        name: b"held".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(session),
      })
      .await
      .unwrap(),
  );

  // Unlink while a writer still holds the file open.
  cluster
    .meta(MetaOp::Remove {
      parent: InodeId::ROOT,
      name: b"held".to_vec(),
    })
    .await
    .unwrap();
  {
    let mut txn = cluster.kv.begin_read_only();
    assert!(
      txn
        .snapshot_get(&keys::gc_queue_key(file.id))
        .unwrap()
        .is_none(),
      "open session must defer GC"
    );
  }

  // The last close hands it to GC.
  cluster
    .meta(MetaOp::Close {
      inode: file.id,
      session,
      length: None,
    })
    .await
    .unwrap();
  let worker = gc_worker(&cluster);
  assert_eq!(worker.run_gc().await.unwrap(), 1);
  let mut txn = cluster.kv.begin_read_only();
  assert!(txn.snapshot_get(&keys::inode_key(file.id)).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_session_pruning_unblocks_gc() {
  let cluster = Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await;
  let session = Uuid::generate();
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: InodeId::ROOT,
        name: b"leaked".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE | OpenFlags::WRITE,
        layout: None,
        session: Some(session),
      })
      .await
      .unwrap(),
  );
  cluster
    .meta(MetaOp::Remove {
      parent: InodeId::ROOT,
      name: b"leaked".to_vec(),
    })
    .await
    .unwrap();

  // The client dies without closing; its session goes stale past the
  // configured timeout (200ms in the harness) and pruning enqueues GC.
  tokio::time::sleep(std::time::Duration::from_millis(250)).await;
  cluster.meta(MetaOp::PruneSessions).await.unwrap();

  let worker = gc_worker(&cluster);
  assert_eq!(worker.run_gc().await.unwrap(), 1);
  let mut txn = cluster.kv.begin_read_only();
  assert!(txn.snapshot_get(&keys::inode_key(file.id)).unwrap().is_none());
}
