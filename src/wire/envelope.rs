//! Message envelope.
//!
//! Every request/response on the wire carries this header. The transport
//! itself (RDMA or TCP) is an external collaborator; in-process testing
//! routes typed requests directly but keeps the same envelope shape.

use crate::codec::{FieldReader, FieldWriter};
use crate::error::Result;
use crate::types::UnixMillis;

bitflags::bitflags! {
  #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
  pub struct MessageFlags: u16 {
    const IS_REQUEST = 1 << 0;
    const USE_COMPRESSION = 1 << 1;
    const CONTROL_FLOW_RDMA = 1 << 2;
  }
}

/// Service ids carried in the envelope.
pub mod service {
  pub const META: u16 = 1;
  pub const STORAGE: u16 = 2;
  pub const MGMTD: u16 = 3;
}

/// Optional request lifecycle timestamps, filled hop by hop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timestamps {
  pub client_called: UnixMillis,
  pub client_serialized: UnixMillis,
  pub server_received: UnixMillis,
  pub server_processed: UnixMillis,
  pub server_serialized: UnixMillis,
  pub client_received: UnixMillis,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
  pub uuid: u64,
  pub service_id: u16,
  pub method_id: u16,
  pub flags: MessageFlags,
  pub version: u16,
  pub timestamps: Option<Timestamps>,
}

const TAG_UUID: u8 = 1;
const TAG_SERVICE: u8 = 2;
const TAG_METHOD: u8 = 3;
const TAG_FLAGS: u8 = 4;
const TAG_VERSION: u8 = 5;
const TAG_TS_CALLED: u8 = 6;
const TAG_TS_SERIALIZED: u8 = 7;
const TAG_TS_RECEIVED: u8 = 8;
const TAG_TS_PROCESSED: u8 = 9;
const TAG_TS_RESPONDED: u8 = 10;
const TAG_TS_DELIVERED: u8 = 11;

impl Envelope {
  pub fn request(uuid: u64, service_id: u16, method_id: u16) -> Self {
    Envelope {
      uuid,
      service_id,
      method_id,
      flags: MessageFlags::IS_REQUEST,
      version: 1,
      timestamps: None,
    }
  }

  pub fn encode(&self) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.put_u64(TAG_UUID, self.uuid)
      .put_u16(TAG_SERVICE, self.service_id)
      .put_u16(TAG_METHOD, self.method_id)
      .put_u16(TAG_FLAGS, self.flags.bits())
      .put_u16(TAG_VERSION, self.version);
    if let Some(ts) = &self.timestamps {
      w.put_u64(TAG_TS_CALLED, ts.client_called)
        .put_u64(TAG_TS_SERIALIZED, ts.client_serialized)
        .put_u64(TAG_TS_RECEIVED, ts.server_received)
        .put_u64(TAG_TS_PROCESSED, ts.server_processed)
        .put_u64(TAG_TS_RESPONDED, ts.server_serialized)
        .put_u64(TAG_TS_DELIVERED, ts.client_received);
    }
    w.finish()
  }

  pub fn decode(raw: &[u8]) -> Result<Self> {
    let r = FieldReader::parse(raw)?;
    let timestamps = match r.opt_u64(TAG_TS_CALLED)? {
      None => None,
      Some(client_called) => Some(Timestamps {
        client_called,
        client_serialized: r.u64(TAG_TS_SERIALIZED)?,
        server_received: r.u64(TAG_TS_RECEIVED)?,
        server_processed: r.u64(TAG_TS_PROCESSED)?,
        server_serialized: r.u64(TAG_TS_RESPONDED)?,
        client_received: r.u64(TAG_TS_DELIVERED)?,
      }),
    };
    Ok(Envelope {
      uuid: r.u64(TAG_UUID)?,
      service_id: r.u16(TAG_SERVICE)?,
      method_id: r.u16(TAG_METHOD)?,
      flags: MessageFlags::from_bits_truncate(r.u16(TAG_FLAGS)?),
      version: r.u16(TAG_VERSION)?,
      timestamps,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_envelope_roundtrip() {
    let mut env = Envelope::request(42, service::META, 7);
    assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
    env.timestamps = Some(Timestamps {
      client_called: 1,
      client_serialized: 2,
      server_received: 3,
      server_processed: 4,
      server_serialized: 5,
      client_received: 6,
    });
    assert_eq!(Envelope::decode(&env.encode()).unwrap(), env);
  }

  #[test]
  fn test_flags() {
    let env = Envelope::request(1, service::STORAGE, 2);
    assert!(env.flags.contains(MessageFlags::IS_REQUEST));
    assert!(!env.flags.contains(MessageFlags::CONTROL_FLOW_RDMA));
  }
}
