//! Metadata operation semantics.
//!
//! Each operation is a pure function over one read-write transaction: it
//! loads what it needs (conflict-tracked), applies the semantic rules,
//! stages writes, and reports any post-commit work (chunk removal) for
//! the server to hand to the storage client. The batch runner in
//! `server` decides which operations share a transaction.

use crate::error::{FsError, Result};
use crate::kv::Transaction;
use crate::layout::Layout;
use crate::meta::dirent::{DirEntry, EntryType};
use crate::meta::inode::{Inode, InodeKind};
use crate::meta::session::{FileSession, UserRecord};
use crate::meta::store;
use crate::routing::RoutingInfo;
use crate::types::{
  Acl, IFlags, InodeId, OpenFlags, UnixMillis, UserInfo, Uuid, PERM_EXEC, PERM_READ, PERM_WRITE,
};

// ============================================================================
// Requests
// ============================================================================

/// Either an inode id or a name under a parent directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathTarget {
  Inode(InodeId),
  Name { parent: InodeId, name: Vec<u8> },
}

/// Attribute changes for `setattr`; `None` fields are untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrs {
  pub mode: Option<u32>,
  pub uid: Option<u32>,
  pub gid: Option<u32>,
  pub atime: Option<UnixMillis>,
  pub mtime: Option<UnixMillis>,
  pub iflags: Option<IFlags>,
}

/// The operation menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaOp {
  Stat {
    target: PathTarget,
  },
  BatchStat {
    inodes: Vec<InodeId>,
  },
  Create {
    parent: InodeId,
    name: Vec<u8>,
    mode: u32,
    flags: OpenFlags,
    layout: Option<Layout>,
    session: Option<Uuid>,
  },
  Open {
    target: PathTarget,
    flags: OpenFlags,
    session: Option<Uuid>,
  },
  Close {
    inode: InodeId,
    session: Uuid,
    length: Option<u64>,
  },
  Sync {
    inode: InodeId,
    length: u64,
  },
  Mkdir {
    parent: InodeId,
    name: Vec<u8>,
    mode: u32,
  },
  List {
    dir: InodeId,
    cursor: Option<Vec<u8>>,
    limit: usize,
  },
  Remove {
    parent: InodeId,
    name: Vec<u8>,
  },
  Rename {
    src_parent: InodeId,
    src_name: Vec<u8>,
    dst_parent: InodeId,
    dst_name: Vec<u8>,
  },
  Symlink {
    parent: InodeId,
    name: Vec<u8>,
    target: Vec<u8>,
  },
  Hardlink {
    parent: InodeId,
    name: Vec<u8>,
    target: InodeId,
  },
  SetAttr {
    inode: InodeId,
    attrs: SetAttrs,
  },
  Truncate {
    inode: InodeId,
    length: u64,
  },
  SetLayout {
    dir: InodeId,
    layout: Layout,
  },
  GetRealPath {
    inode: InodeId,
  },
  ListXattr {
    inode: InodeId,
  },
  Statfs,
  ExtendSession {
    inode: InodeId,
    session: Uuid,
  },
  PruneSessions,
  UserAdd {
    record: UserRecord,
  },
}

impl MetaOp {
  /// The inode whose owner processes this operation, or `None` for
  /// operations any server handles locally.
  pub fn routing_inode(&self) -> Option<InodeId> {
    match self {
      MetaOp::Stat { target } | MetaOp::Open { target, .. } => Some(match target {
        PathTarget::Inode(inode) => *inode,
        PathTarget::Name { parent, .. } => *parent,
      }),
      MetaOp::Create { parent, .. }
      | MetaOp::Mkdir { parent, .. }
      | MetaOp::Remove { parent, .. }
      | MetaOp::Symlink { parent, .. }
      | MetaOp::Hardlink { parent, .. } => Some(*parent),
      MetaOp::List { dir, .. } | MetaOp::SetLayout { dir, .. } => Some(*dir),
      MetaOp::Close { inode, .. }
      | MetaOp::Sync { inode, .. }
      | MetaOp::SetAttr { inode, .. }
      | MetaOp::Truncate { inode, .. }
      | MetaOp::ExtendSession { inode, .. } => Some(*inode),
      MetaOp::Rename { src_parent, .. } => Some(*src_parent),
      MetaOp::BatchStat { .. }
      | MetaOp::GetRealPath { .. }
      | MetaOp::ListXattr { .. }
      | MetaOp::Statfs
      | MetaOp::PruneSessions
      | MetaOp::UserAdd { .. } => None,
    }
  }

  /// Whether the operation stages writes and must run under the owning
  /// inode's batch lane with an idempotency record.
  pub fn is_mutation(&self) -> bool {
    !matches!(
      self,
      MetaOp::Stat { .. }
        | MetaOp::BatchStat { .. }
        | MetaOp::List { .. }
        | MetaOp::GetRealPath { .. }
        | MetaOp::ListXattr { .. }
        | MetaOp::Statfs
    )
  }

  /// Short tag namespacing this op's idempotency record.
  pub fn idem_tag(&self) -> &'static str {
    match self {
      MetaOp::Create { .. } => "create",
      MetaOp::Open { .. } => "open",
      MetaOp::Close { .. } => "close",
      MetaOp::Sync { .. } => "sync",
      MetaOp::Mkdir { .. } => "mkdir",
      MetaOp::Remove { .. } => "remove",
      MetaOp::Rename { .. } => "rename",
      MetaOp::Symlink { .. } => "symlink",
      MetaOp::Hardlink { .. } => "hardlink",
      MetaOp::SetAttr { .. } => "setattr",
      MetaOp::Truncate { .. } => "truncate",
      MetaOp::SetLayout { .. } => "setlayout",
      MetaOp::ExtendSession { .. } => "extsess",
      MetaOp::PruneSessions => "prunesess",
      MetaOp::UserAdd { .. } => "useradd",
      _ => "read",
    }
  }
}

// ============================================================================
// Responses
// ============================================================================

/// Cluster-level numbers surfaced through `statfs`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsStats {
  pub routing_version: u64,
  pub total_nodes: usize,
  pub online_nodes: usize,
  pub total_targets: usize,
  pub online_targets: usize,
  pub total_chains: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaResponse {
  Inode(Inode),
  Inodes(Vec<Option<Inode>>),
  Entries { entries: Vec<DirEntry>, has_more: bool },
  Path(String),
  Names(Vec<String>),
  Stats(FsStats),
  Pruned(usize),
  Unit,
}

impl MetaResponse {
  pub fn inode(self) -> Result<Inode> {
    match self {
      MetaResponse::Inode(inode) => Ok(inode),
      other => Err(FsError::Internal(format!("unexpected response {other:?}"))),
    }
  }
}

/// Work the server performs after the transaction commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostAction {
  /// Drop every chunk of `inode` with index >= `from_index`.
  RemoveChunks { inode: InodeId, from_index: u32 },
}

// ============================================================================
// Execution context
// ============================================================================

/// Source of fresh inode ids, pre-reserved outside the transaction.
pub trait IdSource {
  fn take(&self) -> Result<InodeId>;
}

/// Per-batch execution context.
pub struct OpCtx<'a> {
  pub user: UserInfo,
  pub request: Uuid,
  pub client_id: Uuid,
  pub now: UnixMillis,
  pub routing: &'a RoutingInfo,
  pub ids: &'a dyn IdSource,
  pub session_timeout_ms: u64,
}

impl OpCtx<'_> {
  /// Chains available in a pinned chain table version.
  fn chain_count(&self, layout: &Layout) -> Result<usize> {
    let table = self
      .routing
      .chain_tables
      .get(&(layout.chain_table_id, layout.chain_table_version))
      .ok_or_else(|| {
        FsError::InvalidArgument(format!(
          "chain table {}@{} does not exist",
          layout.chain_table_id.0, layout.chain_table_version
        ))
      })?;
    Ok(table.chains.len())
  }
}

fn entry_type_of(inode: &Inode) -> EntryType {
  match inode.kind {
    InodeKind::File(_) => EntryType::File,
    InodeKind::Directory(_) => EntryType::Directory,
    InodeKind::Symlink(_) => EntryType::Symlink,
  }
}

fn check_name(name: &[u8]) -> Result<()> {
  if name.is_empty() || name.len() > crate::constants::MAX_NAME_LEN {
    return Err(FsError::InvalidArgument("bad name length".into()));
  }
  if name.contains(&b'/') || name == b"." || name == b".." {
    return Err(FsError::InvalidArgument("reserved name".into()));
  }
  Ok(())
}

/// Resolve a path target to an inode id (conflict-tracked dentry load).
fn resolve_target<T: Transaction>(txn: &mut T, target: &PathTarget) -> Result<InodeId> {
  match target {
    PathTarget::Inode(inode) => Ok(*inode),
    PathTarget::Name { parent, name } => store::load_dentry(txn, *parent, name)?
      .map(|entry| entry.target)
      .ok_or_else(|| FsError::NotFound(String::from_utf8_lossy(name).into_owned())),
  }
}

/// Stage the file-length housekeeping shared by truncate, sync and close.
fn apply_length(file: &mut Inode, new_len: u64, shrink: bool) -> Result<Option<u32>> {
  let f = file.as_file_mut()?;
  if shrink && new_len < f.length {
    f.truncate_version += 1;
    let keep = new_len.div_ceil(f.layout.chunk_size) as u32;
    f.length = new_len;
    Ok(Some(keep))
  } else {
    f.length = f.length.max(new_len);
    Ok(None)
  }
}

// ============================================================================
// Mutating operations
// ============================================================================

pub fn apply_create<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
  mode: u32,
  flags: OpenFlags,
  layout_override: Option<&Layout>,
  session: Option<Uuid>,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  check_name(name)?;
  let mut parent_inode = store::load_inode(txn, parent)?;
  let dir = parent_inode.as_directory()?.clone();
  parent_inode.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;

  if let Some(existing) = store::load_dentry(txn, parent, name)? {
    if flags.contains(OpenFlags::EXCL) {
      return Err(FsError::AlreadyExists(
        String::from_utf8_lossy(name).into_owned(),
      ));
    }
    // O_CREAT without O_EXCL on an existing name degrades to open.
    return apply_open(ctx, txn, &PathTarget::Inode(existing.target), flags, session);
  }

  // Build the child's layout: inherit the parent template unless
  // overridden, then deal chain slots from the directory counter.
  let mut layout = layout_override.cloned().unwrap_or_else(|| dir.layout.clone());
  layout.validate()?;
  let chain_count = ctx.chain_count(&layout)?;
  if layout.stripe_size as usize > chain_count {
    return Err(FsError::InvalidArgument(format!(
      "stripe size {} exceeds {} chains in table",
      layout.stripe_size, chain_count
    )));
  }
  if layout.chain_slots.is_empty() {
    let counter = dir.chain_alloc_counter;
    layout.seed = counter % layout.stripe_size.max(1);
    layout.chain_slots = (0..layout.stripe_size)
      .map(|i| (counter.wrapping_add(i)) % chain_count as u32)
      .collect();
    let dir_mut = parent_inode.as_directory_mut()?;
    dir_mut.chain_alloc_counter = counter.wrapping_add(layout.stripe_size);
  }

  let id = ctx.ids.take()?;
  let child = Inode::new_file(id, Acl::new(ctx.user.uid, ctx.user.gid, mode), layout);
  store::save_inode(txn, &child);
  store::save_dentry(
    txn,
    &DirEntry {
      parent,
      name: name.to_vec(),
      target: id,
      entry_type: EntryType::File,
      uuid: ctx.request,
    },
  );
  parent_inode.touch_mtime(ctx.now);
  store::save_inode(txn, &parent_inode);

  if let Some(session_id) = session {
    store::save_session(
      txn,
      &FileSession::new(id, session_id, ctx.client_id, flags.bits()),
    );
  }
  Ok((MetaResponse::Inode(child), Vec::new()))
}

pub fn apply_open<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  target: &PathTarget,
  flags: OpenFlags,
  session: Option<Uuid>,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let id = resolve_target(txn, target)?;
  let mut inode = store::load_inode(txn, id)?;
  let want = if flags.contains(OpenFlags::WRITE) {
    PERM_READ | PERM_WRITE
  } else {
    PERM_READ
  };
  inode.acl.check(&ctx.user, want)?;

  let mut actions = Vec::new();
  if flags.contains(OpenFlags::TRUNC) && flags.contains(OpenFlags::WRITE) && inode.is_file() {
    if let Some(keep) = apply_length(&mut inode, 0, true)? {
      actions.push(PostAction::RemoveChunks {
        inode: id,
        from_index: keep,
      });
    }
  }
  inode.times.atime = ctx.now;
  if actions.is_empty() {
    store::save_inode(txn, &inode);
  } else {
    store::save_file_inode_stamped(txn, &inode)?;
  }

  if flags.contains(OpenFlags::WRITE) {
    let session_id = session.ok_or_else(|| {
      FsError::InvalidArgument("open for write requires a session uuid".into())
    })?;
    store::save_session(
      txn,
      &FileSession::new(id, session_id, ctx.client_id, flags.bits()),
    );
  }
  Ok((MetaResponse::Inode(inode), actions))
}

pub fn apply_close<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  inode: InodeId,
  session: Uuid,
  length: Option<u64>,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut record = store::load_inode(txn, inode)?;
  store::clear_session(txn, inode, session);
  if let Some(length) = length {
    apply_length(&mut record, length, false)?;
    record.touch_mtime(ctx.now);
    store::save_file_inode_stamped(txn, &record)?;
  } else {
    record.times.atime = ctx.now;
    store::save_inode(txn, &record);
  }
  // Last close of an unlinked file hands it to GC.
  if record.nlink == 0 && !store::has_sessions(txn, inode)? {
    store::enqueue_gc(txn, inode);
  }
  Ok((MetaResponse::Inode(record), Vec::new()))
}

pub fn apply_sync<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  inode: InodeId,
  length: u64,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut record = store::load_inode(txn, inode)?;
  apply_length(&mut record, length, false)?;
  record.touch_mtime(ctx.now);
  store::save_file_inode_stamped(txn, &record)?;
  Ok((MetaResponse::Inode(record), Vec::new()))
}

pub fn apply_mkdir<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
  mode: u32,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  check_name(name)?;
  let mut parent_inode = store::load_inode(txn, parent)?;
  let template = parent_inode.as_directory()?.layout.clone();
  parent_inode.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;

  if store::load_dentry(txn, parent, name)?.is_some() {
    return Err(FsError::AlreadyExists(
      String::from_utf8_lossy(name).into_owned(),
    ));
  }

  let id = ctx.ids.take()?;
  let child = Inode::new_directory(
    id,
    parent,
    name,
    Acl::new(ctx.user.uid, ctx.user.gid, mode),
    template,
  );
  store::save_inode(txn, &child);
  store::save_dentry(
    txn,
    &DirEntry {
      parent,
      name: name.to_vec(),
      target: id,
      entry_type: EntryType::Directory,
      uuid: ctx.request,
    },
  );
  parent_inode.touch_mtime(ctx.now);
  store::save_inode(txn, &parent_inode);
  Ok((MetaResponse::Inode(child), Vec::new()))
}

pub fn apply_symlink<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
  target: &[u8],
) -> Result<(MetaResponse, Vec<PostAction>)> {
  check_name(name)?;
  if target.is_empty() || target.len() > crate::constants::MAX_SYMLINK_LEN {
    return Err(FsError::InvalidArgument("bad symlink target".into()));
  }
  let mut parent_inode = store::load_inode(txn, parent)?;
  parent_inode.as_directory()?;
  parent_inode.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;
  if store::load_dentry(txn, parent, name)?.is_some() {
    return Err(FsError::AlreadyExists(
      String::from_utf8_lossy(name).into_owned(),
    ));
  }

  let id = ctx.ids.take()?;
  let child = Inode::new_symlink(id, Acl::new(ctx.user.uid, ctx.user.gid, 0o777), target);
  store::save_inode(txn, &child);
  store::save_dentry(
    txn,
    &DirEntry {
      parent,
      name: name.to_vec(),
      target: id,
      entry_type: EntryType::Symlink,
      uuid: ctx.request,
    },
  );
  parent_inode.touch_mtime(ctx.now);
  store::save_inode(txn, &parent_inode);
  Ok((MetaResponse::Inode(child), Vec::new()))
}

pub fn apply_hardlink<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
  target: InodeId,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  check_name(name)?;
  let mut parent_inode = store::load_inode(txn, parent)?;
  parent_inode.as_directory()?;
  parent_inode.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;
  if store::load_dentry(txn, parent, name)?.is_some() {
    return Err(FsError::AlreadyExists(
      String::from_utf8_lossy(name).into_owned(),
    ));
  }
  let mut target_inode = store::load_inode(txn, target)?;
  if target_inode.is_directory() {
    return Err(FsError::InvalidArgument(
      "hard links to directories are not allowed".into(),
    ));
  }
  target_inode.nlink += 1;
  target_inode.times.ctime = ctx.now;
  store::save_inode(txn, &target_inode);
  store::save_dentry(
    txn,
    &DirEntry {
      parent,
      name: name.to_vec(),
      target,
      entry_type: entry_type_of(&target_inode),
      uuid: ctx.request,
    },
  );
  parent_inode.touch_mtime(ctx.now);
  store::save_inode(txn, &parent_inode);
  Ok((MetaResponse::Inode(target_inode), Vec::new()))
}

/// Unlink `parent/name`. Directories must be empty. When the link count
/// hits zero and nothing holds the file open, the inode goes onto the GC
/// queue; the inode record itself stays until GC finishes chunk removal.
pub fn apply_remove<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  parent: InodeId,
  name: &[u8],
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut parent_inode = store::load_inode(txn, parent)?;
  parent_inode.as_directory()?;
  parent_inode.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;

  let entry = store::load_dentry(txn, parent, name)?
    .ok_or_else(|| FsError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
  let mut target = store::load_inode(txn, entry.target)?;

  if target.is_directory() {
    // Guard emptiness with a conflict range so a concurrent create under
    // this directory fails one of the two transactions.
    let (begin, end) = crate::codec::keys::dentry_range(entry.target);
    txn.add_read_conflict_range(&begin, &end);
    if !store::dir_is_empty(txn, entry.target)? {
      return Err(FsError::InvalidArgument("directory not empty".into()));
    }
  }

  store::clear_dentry(txn, parent, name);
  target.nlink = target.nlink.saturating_sub(1);
  target.times.ctime = ctx.now;

  if target.nlink == 0 {
    if target.is_directory() || !store::has_sessions(txn, entry.target)? {
      store::save_inode(txn, &target);
      store::enqueue_gc(txn, entry.target);
    } else {
      // Open sessions keep the file alive; the last close enqueues it.
      store::save_inode(txn, &target);
    }
  } else {
    store::save_inode(txn, &target);
  }

  parent_inode.touch_mtime(ctx.now);
  store::save_inode(txn, &parent_inode);
  Ok((MetaResponse::Unit, Vec::new()))
}

/// Rename within or across directories in one transaction. The caller
/// holds both parents' batch lanes in inode-id order.
pub fn apply_rename<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  src_parent: InodeId,
  src_name: &[u8],
  dst_parent: InodeId,
  dst_name: &[u8],
) -> Result<(MetaResponse, Vec<PostAction>)> {
  check_name(dst_name)?;
  let mut src_dir = store::load_inode(txn, src_parent)?;
  src_dir.as_directory()?;
  src_dir.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;

  let entry = store::load_dentry(txn, src_parent, src_name)?
    .ok_or_else(|| FsError::NotFound(String::from_utf8_lossy(src_name).into_owned()))?;

  // Rename onto itself is a successful no-op.
  if src_parent == dst_parent && src_name == dst_name {
    let inode = store::load_inode(txn, entry.target)?;
    return Ok((MetaResponse::Inode(inode), Vec::new()));
  }

  let same_parent = src_parent == dst_parent;
  let mut dst_dir = if same_parent {
    None
  } else {
    let dir = store::load_inode(txn, dst_parent)?;
    dir.as_directory()?;
    dir.acl.check(&ctx.user, PERM_WRITE | PERM_EXEC)?;
    Some(dir)
  };

  // Displace an existing destination if allowed.
  if let Some(existing) = store::load_dentry(txn, dst_parent, dst_name)? {
    if existing.target != entry.target {
      let mut displaced = store::load_inode(txn, existing.target)?;
      if displaced.is_directory() {
        let (begin, end) = crate::codec::keys::dentry_range(existing.target);
        txn.add_read_conflict_range(&begin, &end);
        if !store::dir_is_empty(txn, existing.target)? {
          return Err(FsError::InvalidArgument("directory not empty".into()));
        }
      }
      displaced.nlink = displaced.nlink.saturating_sub(1);
      displaced.times.ctime = ctx.now;
      store::save_inode(txn, &displaced);
      if displaced.nlink == 0
        && (displaced.is_directory() || !store::has_sessions(txn, existing.target)?)
      {
        store::enqueue_gc(txn, existing.target);
      }
    }
  }

  store::clear_dentry(txn, src_parent, src_name);
  store::save_dentry(
    txn,
    &DirEntry {
      parent: dst_parent,
      name: dst_name.to_vec(),
      target: entry.target,
      entry_type: entry.entry_type,
      uuid: ctx.request,
    },
  );

  // A moved directory learns its new parent and name.
  let mut moved = store::load_inode(txn, entry.target)?;
  if let InodeKind::Directory(dir) = &mut moved.kind {
    dir.parent = dst_parent;
    dir.name = dst_name.to_vec();
  }
  moved.times.ctime = ctx.now;
  store::save_inode(txn, &moved);

  src_dir.touch_mtime(ctx.now);
  store::save_inode(txn, &src_dir);
  if let Some(dir) = dst_dir.as_mut() {
    dir.touch_mtime(ctx.now);
    store::save_inode(txn, dir);
  }
  Ok((MetaResponse::Inode(moved), Vec::new()))
}

pub fn apply_setattr<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  inode: InodeId,
  attrs: &SetAttrs,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut record = store::load_inode(txn, inode)?;
  let is_owner = ctx.user.is_root() || ctx.user.uid == record.acl.uid;
  if !is_owner {
    return Err(FsError::NoPermission);
  }
  if (attrs.uid.is_some() || attrs.gid.is_some()) && !ctx.user.is_root() {
    return Err(FsError::NoPermission);
  }
  if let Some(mode) = attrs.mode {
    record.acl.mode = mode & 0o7777;
  }
  if let Some(uid) = attrs.uid {
    record.acl.uid = uid;
  }
  if let Some(gid) = attrs.gid {
    record.acl.gid = gid;
  }
  if let Some(iflags) = attrs.iflags {
    record.acl.iflags = iflags;
  }
  if let Some(atime) = attrs.atime {
    record.times.atime = atime;
  }
  if let Some(mtime) = attrs.mtime {
    record.times.mtime = mtime;
  }
  record.times.ctime = ctx.now;
  store::save_inode(txn, &record);
  Ok((MetaResponse::Inode(record), Vec::new()))
}

pub fn apply_truncate<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  inode: InodeId,
  length: u64,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut record = store::load_inode(txn, inode)?;
  record.acl.check(&ctx.user, PERM_WRITE)?;
  record.as_file()?;
  let mut actions = Vec::new();
  if let Some(keep) = apply_length(&mut record, length, true)? {
    actions.push(PostAction::RemoveChunks {
      inode,
      from_index: keep,
    });
  }
  record.touch_mtime(ctx.now);
  store::save_file_inode_stamped(txn, &record)?;
  Ok((MetaResponse::Inode(record), actions))
}

pub fn apply_set_layout<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  dir: InodeId,
  layout: &Layout,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  layout.validate()?;
  let chain_count = ctx.chain_count(layout)?;
  if layout.stripe_size as usize > chain_count {
    return Err(FsError::InvalidArgument(format!(
      "stripe size {} exceeds {} chains in table",
      layout.stripe_size, chain_count
    )));
  }
  let mut record = store::load_inode(txn, dir)?;
  record.acl.check(&ctx.user, PERM_WRITE)?;
  // Changing a directory template never rewrites existing files.
  record.as_directory_mut()?.layout = layout.clone();
  record.times.ctime = ctx.now;
  store::save_inode(txn, &record);
  Ok((MetaResponse::Inode(record), Vec::new()))
}

pub fn apply_extend_session<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  inode: InodeId,
  session: Uuid,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let mut record = store::load_session(txn, inode, session)?
    .ok_or_else(|| FsError::NotFound(format!("session on {inode}")))?;
  record.access_time = ctx.now;
  store::save_session(txn, &record);
  Ok((MetaResponse::Unit, Vec::new()))
}

/// Drop sessions idle past the timeout, cluster-wide. Files left
/// unreachable by a dead client's unlinked-but-open handle move to GC.
pub fn apply_prune_sessions<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let (begin, end) = crate::codec::keys::all_sessions_range();
  let sessions = crate::kv::scan_range(txn, &begin, &end, 1024)?;
  let mut pruned = 0usize;
  for kv in sessions {
    let session = FileSession::decode(&kv.value)?;
    if session.is_stale(ctx.now, ctx.session_timeout_ms) {
      txn.clear(&kv.key);
      pruned += 1;
      if let Some(inode) = store::try_load_inode(txn, session.inode)? {
        if inode.nlink == 0 && !store::has_sessions(txn, session.inode)? {
          store::enqueue_gc(txn, session.inode);
        }
      }
    }
  }
  Ok((MetaResponse::Pruned(pruned), Vec::new()))
}

pub fn apply_user_add<T: Transaction>(
  ctx: &OpCtx<'_>,
  txn: &mut T,
  record: &UserRecord,
) -> Result<(MetaResponse, Vec<PostAction>)> {
  let caller = store::load_user(txn, ctx.user.uid)?;
  let is_admin = ctx.user.is_root() || caller.map(|u| u.admin).unwrap_or(false);
  if !is_admin {
    return Err(FsError::NoPermission);
  }
  store::save_user(txn, record);
  Ok((MetaResponse::Unit, Vec::new()))
}

// ============================================================================
// Read-only operations
// ============================================================================

pub fn read_stat<T: Transaction>(
  txn: &mut T,
  target: &PathTarget,
) -> Result<MetaResponse> {
  let id = match target {
    PathTarget::Inode(inode) => *inode,
    PathTarget::Name { parent, name } => store::load_dentry(txn, *parent, name)?
      .map(|entry| entry.target)
      .ok_or_else(|| FsError::NotFound(String::from_utf8_lossy(name).into_owned()))?,
  };
  Ok(MetaResponse::Inode(store::load_inode(txn, id)?))
}

pub fn read_batch_stat<T: Transaction>(txn: &mut T, inodes: &[InodeId]) -> Result<MetaResponse> {
  let mut out = Vec::with_capacity(inodes.len());
  for inode in inodes {
    out.push(store::try_load_inode(txn, *inode)?);
  }
  Ok(MetaResponse::Inodes(out))
}

pub fn read_list<T: Transaction>(
  txn: &mut T,
  user: &UserInfo,
  dir: InodeId,
  cursor: Option<&[u8]>,
  limit: usize,
) -> Result<MetaResponse> {
  if limit == 0 {
    return Err(FsError::InvalidArgument("list limit must be >= 1".into()));
  }
  let record = store::load_inode(txn, dir)?;
  record.as_directory()?;
  record.acl.check(user, PERM_READ | PERM_EXEC)?;
  let (entries, has_more) = store::list_dir_page(txn, dir, cursor, limit)?;
  Ok(MetaResponse::Entries { entries, has_more })
}

/// Walk directory parents up to the root to rebuild an absolute path.
pub fn read_real_path<T: Transaction>(txn: &mut T, inode: InodeId) -> Result<MetaResponse> {
  let mut components: Vec<Vec<u8>> = Vec::new();
  let mut cursor = inode;
  let mut hops = 0;
  while cursor != InodeId::ROOT {
    let record = store::load_inode(txn, cursor)?;
    let dir = record.as_directory().map_err(|_| {
      FsError::InvalidArgument("real path requires a directory inode".into())
    })?;
    components.push(dir.name.clone());
    cursor = dir.parent;
    hops += 1;
    if hops > 4096 {
      return Err(FsError::Internal("directory parent cycle".into()));
    }
  }
  let mut path = String::new();
  for part in components.iter().rev() {
    path.push('/');
    path.push_str(&String::from_utf8_lossy(part));
  }
  if path.is_empty() {
    path.push('/');
  }
  Ok(MetaResponse::Path(path))
}

pub fn read_list_xattr<T: Transaction>(txn: &mut T, inode: InodeId) -> Result<MetaResponse> {
  // Extended attributes are not stored by the metadata plane; surface an
  // empty set so the shim can answer listxattr.
  store::load_inode(txn, inode)?;
  Ok(MetaResponse::Names(Vec::new()))
}

pub fn read_statfs(routing: &RoutingInfo) -> MetaResponse {
  let stats = FsStats {
    routing_version: routing.routing_version,
    total_nodes: routing.nodes.len(),
    online_nodes: routing
      .nodes
      .values()
      .filter(|n| n.status == crate::routing::NodeStatus::Online)
      .count(),
    total_targets: routing.targets.len(),
    online_targets: routing
      .targets
      .values()
      .filter(|t| t.state.serves_reads())
      .count(),
    total_chains: routing.chains.len(),
  };
  MetaResponse::Stats(stats)
}
