//! Error taxonomy for KiteFS.
//!
//! Every fallible path in the crate returns [`FsError`]. The variants are
//! abstract kinds, not source types: an RPC response carries the kind plus a
//! message, and mapping to POSIX errno is the shim's job.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, FsError>;

/// The error kinds surfaced by every KiteFS component.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsError {
  /// Optimistic concurrency loss at commit. Definitely not committed.
  #[error("transaction conflict")]
  Conflict,

  /// Commit outcome unknown (e.g. network failure after the commit was
  /// sent). Retriable only when the operation is idempotent.
  #[error("commit outcome unknown")]
  MaybeCommitted,

  /// Resource transiently unavailable, e.g. an inode routed to a server
  /// that is no longer responsible for it.
  #[error("busy: {0}")]
  Busy(String),

  /// Deadline exceeded.
  #[error("timeout")]
  Timeout,

  /// Transport failure.
  #[error("network error: {0}")]
  Network(String),

  /// Object absent.
  #[error("not found: {0}")]
  NotFound(String),

  /// Name collision or `O_EXCL` on an existing file.
  #[error("already exists: {0}")]
  AlreadyExists(String),

  /// ACL denied.
  #[error("permission denied")]
  NoPermission,

  /// Bad request.
  #[error("invalid argument: {0}")]
  InvalidArgument(String),

  /// Server-enforced rate limit.
  #[error("throttled")]
  Throttled,

  /// Stale chain, routing or file version.
  #[error("version mismatch: expected {expected}, found {found}")]
  VersionMismatch { expected: u64, found: u64 },

  /// Checksum failure on chunk data.
  #[error("data corruption on chunk")]
  Corruption,

  /// Read version expired in the KV engine.
  #[error("read version too old")]
  TooOld,

  /// Unrecoverable, e.g. a schema mismatch. The process should abort.
  #[error("fatal: {0}")]
  Fatal(String),

  /// An internal invariant was broken.
  #[error("internal error: {0}")]
  Internal(String),
}

impl FsError {
  /// Whether a retry loop may replay the operation unconditionally.
  pub fn is_retriable(&self) -> bool {
    matches!(
      self,
      FsError::Conflict | FsError::Throttled | FsError::TooOld | FsError::Busy(_)
    )
  }

  /// Whether a retry is allowed when the caller can assert idempotency
  /// through a stable request uuid.
  pub fn is_retriable_if_idempotent(&self) -> bool {
    self.is_retriable()
      || matches!(
        self,
        FsError::MaybeCommitted | FsError::Timeout | FsError::Network(_)
      )
  }

  /// Whether the error asks the caller to refresh routing before retrying.
  pub fn needs_routing_refresh(&self) -> bool {
    matches!(self, FsError::VersionMismatch { .. })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_retriable_kinds() {
    assert!(FsError::Conflict.is_retriable());
    assert!(FsError::Throttled.is_retriable());
    assert!(FsError::Busy("not local".into()).is_retriable());
    assert!(!FsError::MaybeCommitted.is_retriable());
    assert!(!FsError::NotFound("x".into()).is_retriable());
  }

  #[test]
  fn test_idempotent_retry_superset() {
    assert!(FsError::MaybeCommitted.is_retriable_if_idempotent());
    assert!(FsError::Timeout.is_retriable_if_idempotent());
    assert!(FsError::Conflict.is_retriable_if_idempotent());
    assert!(!FsError::NoPermission.is_retriable_if_idempotent());
  }

  #[test]
  fn test_version_mismatch_wants_refresh() {
    let err = FsError::VersionMismatch {
      expected: 3,
      found: 2,
    };
    assert!(err.needs_routing_refresh());
    assert!(!FsError::Conflict.needs_routing_refresh());
  }
}
