//! Metadata operation scenarios: creates, renames, listing, permissions.

mod common;

use common::{as_inode, Cluster};
use kitefs::error::FsError;
use kitefs::meta::{MetaOp, MetaRequest, MetaResponse, PathTarget, SetAttrs};
use kitefs::types::{InodeId, OpenFlags, UserInfo, Uuid};

const CHUNK: u64 = 4096;

async fn small_cluster() -> Cluster {
  Cluster::bootstrap(1, &[&[1]], CHUNK, 1).await
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_excl_create_single_winner() {
  let cluster = std::sync::Arc::new(small_cluster().await);

  let op = |name: Vec<u8>| MetaOp::Create {
    parent: InodeId::ROOT,
    name,
    mode: 0o644,
    flags: OpenFlags::CREATE | OpenFlags::EXCL | OpenFlags::WRITE,
    layout: None,
    session: Some(Uuid::generate()),
  };

  let a = {
    let cluster = cluster.clone();
    tokio::spawn(async move { cluster.meta(op(b"x".to_vec())).await })
  };
  let b = {
    let cluster = cluster.clone();
    tokio::spawn(async move { cluster.meta(op(b"x".to_vec())).await })
  };
  let results = [a.await.unwrap(), b.await.unwrap()];

  let winners = results.iter().filter(|r| r.is_ok()).count();
  let losers = results
    .iter()
    .filter(|r| matches!(r, Err(FsError::AlreadyExists(_))))
    .count();
  assert_eq!((winners, losers), (1, 1));

  // The surviving inode answers stat with nlink 1.
  let inode = as_inode(
    cluster
      .meta(MetaOp::Stat {
        target: PathTarget::Name {
          parent: InodeId::ROOT,
          name: b"x".to_vec(),
        },
      })
      .await
      .unwrap(),
  );
  assert_eq!(inode.nlink, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rename_across_directories() {
  let cluster = small_cluster().await;
  let dir_a = cluster.mkdir_root("a").await;
  let dir_b = cluster.mkdir_root("b").await;

  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir_a,
        name: b"f".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE,
        layout: None,
        session: None,
      })
      .await
      .unwrap(),
  );

  cluster
    .meta(MetaOp::Rename {
      src_parent: dir_a,
      src_name: b"f".to_vec(),
      dst_parent: dir_b,
      dst_name: b"f".to_vec(),
    })
    .await
    .unwrap();

  // Source directory no longer lists f.
  match cluster
    .meta(MetaOp::List {
      dir: dir_a,
      cursor: None,
      limit: 10,
    })
    .await
    .unwrap()
  {
    MetaResponse::Entries { entries, .. } => assert!(entries.is_empty()),
    other => panic!("unexpected {other:?}"),
  }
  // Destination lists f pointing at the same inode, nlink unchanged.
  match cluster
    .meta(MetaOp::List {
      dir: dir_b,
      cursor: None,
      limit: 10,
    })
    .await
    .unwrap()
  {
    MetaResponse::Entries { entries, .. } => {
      assert_eq!(entries.len(), 1);
      assert_eq!(entries[0].name, b"f".to_vec());
      assert_eq!(entries[0].target, file.id);
    }
    other => panic!("unexpected {other:?}"),
  }
  let stat = as_inode(
    cluster
      .meta(MetaOp::Stat {
        target: PathTarget::Name {
          parent: dir_b,
          name: b"f".to_vec(),
        },
      })
      .await
      .unwrap(),
  );
  assert_eq!(stat.id, file.id);
  assert_eq!(stat.nlink, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rename_onto_itself_is_noop() {
  let cluster = small_cluster().await;
  let dir = cluster.mkdir_root("d").await;
  cluster
    .meta(MetaOp::Create {
      parent: dir,
      name: b"same".to_vec(),
      mode: 0o644,
      flags: OpenFlags::CREATE,
      layout: None,
      session: None,
    })
    .await
    .unwrap();

  let result = cluster
    .meta(MetaOp::Rename {
      src_parent: dir,
      src_name: b"same".to_vec(),
      dst_parent: dir,
      dst_name: b"same".to_vec(),
    })
    .await;
  assert!(result.is_ok());
  let stat = cluster
    .meta(MetaOp::Stat {
      target: PathTarget::Name {
        parent: dir,
        name: b"same".to_vec(),
      },
    })
    .await;
  assert!(stat.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_list_pagination_and_zero_limit() {
  let cluster = small_cluster().await;
  let dir = cluster.mkdir_root("many").await;
  for i in 0..5u8 {
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: vec![b'f', b'0' + i],
        mode: 0o644,
        flags: OpenFlags::CREATE,
        layout: None,
        session: None,
      })
      .await
      .unwrap();
  }

  let (first, has_more) = match cluster
    .meta(MetaOp::List {
      dir,
      cursor: None,
      limit: 2,
    })
    .await
    .unwrap()
  {
    MetaResponse::Entries { entries, has_more } => (entries, has_more),
    other => panic!("unexpected {other:?}"),
  };
  assert_eq!(first.len(), 2);
  assert!(has_more);

  // Continuation cursor is the last returned name.
  let (rest, has_more) = match cluster
    .meta(MetaOp::List {
      dir,
      cursor: Some(first[1].name.clone()),
      limit: 10,
    })
    .await
    .unwrap()
  {
    MetaResponse::Entries { entries, has_more } => (entries, has_more),
    other => panic!("unexpected {other:?}"),
  };
  assert_eq!(rest.len(), 3);
  assert!(!has_more);

  // limit == 0 means "server default page size", never an empty page.
  match cluster
    .meta(MetaOp::List {
      dir,
      cursor: None,
      limit: 0,
    })
    .await
    .unwrap()
  {
    MetaResponse::Entries { entries, has_more } => {
      assert_eq!(entries.len(), 5);
      assert!(!has_more);
    }
    other => panic!("unexpected {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_requires_empty_directory() {
  let cluster = small_cluster().await;
  let outer = cluster.mkdir_root("outer").await;
  cluster
    .meta(MetaOp::Create {
      parent: outer,
      name: b"child".to_vec(),
      mode: 0o644,
      flags: OpenFlags::CREATE,
      layout: None,
      session: None,
    })
    .await
    .unwrap();

  let blocked = cluster
    .meta(MetaOp::Remove {
      parent: InodeId::ROOT,
      name: b"outer".to_vec(),
    })
    .await;
  assert!(matches!(blocked, Err(FsError::InvalidArgument(_))));

  cluster
    .meta(MetaOp::Remove {
      parent: outer,
      name: b"child".to_vec(),
    })
    .await
    .unwrap();
  cluster
    .meta(MetaOp::Remove {
      parent: InodeId::ROOT,
      name: b"outer".to_vec(),
    })
    .await
    .unwrap();
  let gone = cluster
    .meta(MetaOp::Stat {
      target: PathTarget::Name {
        parent: InodeId::ROOT,
        name: b"outer".to_vec(),
      },
    })
    .await;
  assert!(matches!(gone, Err(FsError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_symlink_and_real_path() {
  let cluster = small_cluster().await;
  let dir = cluster.mkdir_root("links").await;
  let sub = match cluster
    .meta(MetaOp::Mkdir {
      parent: dir,
      name: b"sub".to_vec(),
      mode: 0o755,
    })
    .await
    .unwrap()
  {
    MetaResponse::Inode(inode) => inode.id,
    other => panic!("unexpected {other:?}"),
  };

  let link = as_inode(
    cluster
      .meta(MetaOp::Symlink {
        parent: dir,
        name: b"ptr".to_vec(),
        target: b"/links/sub".to_vec(),
      })
      .await
      .unwrap(),
  );
  match &link.kind {
    kitefs::meta::InodeKind::Symlink(s) => assert_eq!(s.target, b"/links/sub".to_vec()),
    other => panic!("unexpected kind {other:?}"),
  }

  match cluster.meta(MetaOp::GetRealPath { inode: sub }).await.unwrap() {
    MetaResponse::Path(path) => assert_eq!(path, "/links/sub"),
    other => panic!("unexpected {other:?}"),
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hardlink_counts_links() {
  let cluster = small_cluster().await;
  let dir = cluster.mkdir_root("h").await;
  let file = as_inode(
    cluster
      .meta(MetaOp::Create {
        parent: dir,
        name: b"orig".to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE,
        layout: None,
        session: None,
      })
      .await
      .unwrap(),
  );

  let linked = as_inode(
    cluster
      .meta(MetaOp::Hardlink {
        parent: dir,
        name: b"alias".to_vec(),
        target: file.id,
      })
      .await
      .unwrap(),
  );
  assert_eq!(linked.id, file.id);
  assert_eq!(linked.nlink, 2);

  cluster
    .meta(MetaOp::Remove {
      parent: dir,
      name: b"orig".to_vec(),
    })
    .await
    .unwrap();
  let remaining = as_inode(
    cluster
      .meta(MetaOp::Stat {
        target: PathTarget::Name {
          parent: dir,
          name: b"alias".to_vec(),
        },
      })
      .await
      .unwrap(),
  );
  assert_eq!(remaining.nlink, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_permission_checks_for_plain_user() {
  let cluster = small_cluster().await;
  // Root creates a 0700 directory owned by uid 1000.
  let dir = cluster.mkdir_root("locked").await;
  cluster
    .meta(MetaOp::SetAttr {
      inode: dir,
      attrs: SetAttrs {
        uid: Some(1000),
        gid: Some(1000),
        mode: Some(0o700),
        ..Default::default()
      },
    })
    .await
    .unwrap();

  let owner = UserInfo {
    uid: 1000,
    gid: 1000,
    ..Default::default()
  };
  let stranger = UserInfo {
    uid: 2000,
    gid: 2000,
    ..Default::default()
  };

  let make = |user: &UserInfo, name: &[u8]| {
    MetaRequest::new(
      user.clone(),
      cluster.client_id,
      MetaOp::Create {
        parent: dir,
        name: name.to_vec(),
        mode: 0o644,
        flags: OpenFlags::CREATE,
        layout: None,
        session: None,
      },
    )
  };

  assert!(cluster.metas[0].handle(make(&owner, b"mine")).await.is_ok());
  assert_eq!(
    cluster.metas[0].handle(make(&stranger, b"theirs")).await,
    Err(FsError::NoPermission)
  );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_statfs_reports_topology() {
  let cluster = Cluster::bootstrap(1, &[&[1, 2], &[3, 4]], CHUNK, 2).await;
  match cluster.meta(MetaOp::Statfs).await.unwrap() {
    MetaResponse::Stats(stats) => {
      assert_eq!(stats.total_chains, 2);
      assert_eq!(stats.total_targets, 4);
      assert_eq!(stats.online_targets, 4);
      assert!(stats.routing_version > 0);
    }
    other => panic!("unexpected {other:?}"),
  }
}
