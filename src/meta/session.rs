//! File sessions and user records.
//!
//! A session records one open-for-write holder of a file, so crashed
//! clients can be detected and file length recovered. Sessions live under
//! `INOS` keyed by `(inode, session_uuid)` and are extended by client
//! heartbeat.

use crate::codec::{FieldReader, FieldWriter};
use crate::error::{FsError, Result};
use crate::types::{now_ms, InodeId, UnixMillis, Uuid};

// ============================================================================
// File session
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSession {
  pub inode: InodeId,
  pub session_id: Uuid,
  pub client_id: Uuid,
  pub flags: u32,
  pub create_time: UnixMillis,
  pub access_time: UnixMillis,
}

const TAG_INODE: u8 = 1;
const TAG_SESSION: u8 = 2;
const TAG_CLIENT: u8 = 3;
const TAG_FLAGS: u8 = 4;
const TAG_CREATED: u8 = 5;
const TAG_ACCESSED: u8 = 6;

impl FileSession {
  pub fn new(inode: InodeId, session_id: Uuid, client_id: Uuid, flags: u32) -> Self {
    let now = now_ms();
    FileSession {
      inode,
      session_id,
      client_id,
      flags,
      create_time: now,
      access_time: now,
    }
  }

  pub fn is_stale(&self, now: UnixMillis, timeout_ms: u64) -> bool {
    now.saturating_sub(self.access_time) > timeout_ms
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u64(TAG_INODE, self.inode.0)
      .put_bytes(TAG_SESSION, self.session_id.as_bytes())
      .put_bytes(TAG_CLIENT, self.client_id.as_bytes())
      .put_u32(TAG_FLAGS, self.flags)
      .put_u64(TAG_CREATED, self.create_time)
      .put_u64(TAG_ACCESSED, self.access_time);
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    Ok(FileSession {
      inode: InodeId(r.u64(TAG_INODE)?),
      session_id: Uuid::from_bytes(r.bytes(TAG_SESSION)?)
        .ok_or_else(|| FsError::Fatal("bad session uuid".into()))?,
      client_id: Uuid::from_bytes(r.bytes(TAG_CLIENT)?)
        .ok_or_else(|| FsError::Fatal("bad client uuid".into()))?,
      flags: r.u32(TAG_FLAGS)?,
      create_time: r.u64(TAG_CREATED)?,
      access_time: r.u64(TAG_ACCESSED)?,
    })
  }
}

// ============================================================================
// User records
// ============================================================================

/// A provisioned user under `USER`, keyed by decimal uid. Requests carry
/// a token that must match. An empty user table disables authentication
/// (bootstrap mode).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
  pub uid: u32,
  pub gid: u32,
  pub token: String,
  pub admin: bool,
}

const TAG_UID: u8 = 1;
const TAG_GID: u8 = 2;
const TAG_TOKEN: u8 = 3;
const TAG_ADMIN: u8 = 4;

impl UserRecord {
  /// Key name under the `USER` prefix.
  pub fn key_name(uid: u32) -> String {
    format!("{uid:010}")
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u32(TAG_UID, self.uid)
      .put_u32(TAG_GID, self.gid)
      .put_str(TAG_TOKEN, &self.token)
      .put_bool(TAG_ADMIN, self.admin);
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    Ok(UserRecord {
      uid: r.u32(TAG_UID)?,
      gid: r.u32(TAG_GID)?,
      token: r.str(TAG_TOKEN)?.to_owned(),
      admin: r.bool(TAG_ADMIN)?,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_session_roundtrip_and_staleness() {
    let session = FileSession::new(InodeId(3), Uuid::generate(), Uuid::generate(), 1);
    assert_eq!(FileSession::decode(&session.encode()).unwrap(), session);
    assert!(!session.is_stale(session.access_time + 10, 100));
    assert!(session.is_stale(session.access_time + 200, 100));
  }

  #[test]
  fn test_user_record_roundtrip() {
    let user = UserRecord {
      uid: 1000,
      gid: 100,
      token: "secret".into(),
      admin: false,
    };
    assert_eq!(UserRecord::decode(&user.encode()).unwrap(), user);
    assert_eq!(UserRecord::key_name(7), "0000000007");
  }
}
