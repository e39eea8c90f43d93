//! Tagged-field value format.
//!
//! A record is a flat sequence of `(tag: u8, len: u32 BE, payload)`
//! fields. Readers pick fields by tag and must ignore tags they do not
//! know, which is what makes appending optional fields forward
//! compatible. Repeated tags encode lists in order.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{FsError, Result};

// ============================================================================
// Writer
// ============================================================================

/// Builds a tagged-field record.
#[derive(Debug, Default)]
pub struct FieldWriter {
  buf: Vec<u8>,
}

impl FieldWriter {
  pub fn new() -> Self {
    Self::default()
  }

  fn field(&mut self, tag: u8, payload: &[u8]) -> &mut Self {
    self.buf.push(tag);
    let mut len = [0u8; 4];
    BigEndian::write_u32(&mut len, payload.len() as u32);
    self.buf.extend_from_slice(&len);
    self.buf.extend_from_slice(payload);
    self
  }

  pub fn put_u8(&mut self, tag: u8, v: u8) -> &mut Self {
    self.field(tag, &[v])
  }

  pub fn put_u16(&mut self, tag: u8, v: u16) -> &mut Self {
    self.field(tag, &v.to_be_bytes())
  }

  pub fn put_u32(&mut self, tag: u8, v: u32) -> &mut Self {
    self.field(tag, &v.to_be_bytes())
  }

  pub fn put_u64(&mut self, tag: u8, v: u64) -> &mut Self {
    self.field(tag, &v.to_be_bytes())
  }

  pub fn put_bool(&mut self, tag: u8, v: bool) -> &mut Self {
    self.field(tag, &[v as u8])
  }

  pub fn put_bytes(&mut self, tag: u8, v: &[u8]) -> &mut Self {
    self.field(tag, v)
  }

  pub fn put_str(&mut self, tag: u8, v: &str) -> &mut Self {
    self.field(tag, v.as_bytes())
  }

  pub fn finish(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buf)
  }
}

// ============================================================================
// Reader
// ============================================================================

/// Parses a tagged-field record. Unknown tags are retained but only
/// surfaced through `get_all`, so decoders skip them naturally.
#[derive(Debug)]
pub struct FieldReader<'a> {
  fields: Vec<(u8, &'a [u8])>,
}

impl<'a> FieldReader<'a> {
  pub fn parse(mut buf: &'a [u8]) -> Result<Self> {
    let mut fields = Vec::new();
    while !buf.is_empty() {
      if buf.len() < 5 {
        return Err(FsError::Fatal("truncated field header".into()));
      }
      let tag = buf[0];
      let len = BigEndian::read_u32(&buf[1..5]) as usize;
      buf = &buf[5..];
      if buf.len() < len {
        return Err(FsError::Fatal("truncated field payload".into()));
      }
      fields.push((tag, &buf[..len]));
      buf = &buf[len..];
    }
    Ok(FieldReader { fields })
  }

  /// First field with the given tag.
  pub fn get(&self, tag: u8) -> Option<&'a [u8]> {
    self
      .fields
      .iter()
      .find(|(t, _)| *t == tag)
      .map(|(_, payload)| *payload)
  }

  /// Every field with the given tag, in record order.
  pub fn get_all(&self, tag: u8) -> impl Iterator<Item = &'a [u8]> + '_ {
    self
      .fields
      .iter()
      .filter(move |(t, _)| *t == tag)
      .map(|(_, payload)| *payload)
  }

  fn required(&self, tag: u8) -> Result<&'a [u8]> {
    self
      .get(tag)
      .ok_or_else(|| FsError::Fatal(format!("missing required field tag {tag}")))
  }

  pub fn u8(&self, tag: u8) -> Result<u8> {
    let raw = self.required(tag)?;
    if raw.len() != 1 {
      return Err(FsError::Fatal(format!("bad u8 width for tag {tag}")));
    }
    Ok(raw[0])
  }

  pub fn u16(&self, tag: u8) -> Result<u16> {
    let raw = self.required(tag)?;
    if raw.len() != 2 {
      return Err(FsError::Fatal(format!("bad u16 width for tag {tag}")));
    }
    Ok(BigEndian::read_u16(raw))
  }

  pub fn u32(&self, tag: u8) -> Result<u32> {
    let raw = self.required(tag)?;
    if raw.len() != 4 {
      return Err(FsError::Fatal(format!("bad u32 width for tag {tag}")));
    }
    Ok(BigEndian::read_u32(raw))
  }

  pub fn u64(&self, tag: u8) -> Result<u64> {
    let raw = self.required(tag)?;
    if raw.len() != 8 {
      return Err(FsError::Fatal(format!("bad u64 width for tag {tag}")));
    }
    Ok(BigEndian::read_u64(raw))
  }

  pub fn bool(&self, tag: u8) -> Result<bool> {
    Ok(self.u8(tag)? != 0)
  }

  pub fn bytes(&self, tag: u8) -> Result<&'a [u8]> {
    self.required(tag)
  }

  pub fn str(&self, tag: u8) -> Result<&'a str> {
    std::str::from_utf8(self.required(tag)?)
      .map_err(|_| FsError::Fatal(format!("invalid utf8 for tag {tag}")))
  }

  pub fn opt_u32(&self, tag: u8) -> Result<Option<u32>> {
    match self.get(tag) {
      None => Ok(None),
      Some(_) => Ok(Some(self.u32(tag)?)),
    }
  }

  pub fn opt_u64(&self, tag: u8) -> Result<Option<u64>> {
    match self.get(tag) {
      None => Ok(None),
      Some(_) => Ok(Some(self.u64(tag)?)),
    }
  }

  pub fn opt_bytes(&self, tag: u8) -> Option<&'a [u8]> {
    self.get(tag)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_roundtrip_scalars() {
    let mut w = FieldWriter::new();
    w.put_u8(1, 7)
      .put_u16(2, 300)
      .put_u32(3, 70_000)
      .put_u64(4, 1 << 40)
      .put_bool(5, true)
      .put_str(6, "hello");
    let buf = w.finish();

    let r = FieldReader::parse(&buf).unwrap();
    assert_eq!(r.u8(1).unwrap(), 7);
    assert_eq!(r.u16(2).unwrap(), 300);
    assert_eq!(r.u32(3).unwrap(), 70_000);
    assert_eq!(r.u64(4).unwrap(), 1 << 40);
    assert!(r.bool(5).unwrap());
    assert_eq!(r.str(6).unwrap(), "hello");
  }

  #[test]
  fn test_unknown_trailing_fields_ignored() {
    let mut w = FieldWriter::new();
    w.put_u32(1, 42);
    w.put_bytes(200, b"future extension");
    let buf = w.finish();

    let r = FieldReader::parse(&buf).unwrap();
    assert_eq!(r.u32(1).unwrap(), 42);
    // Decoders that never ask for tag 200 are unaffected by it.
    assert_eq!(r.opt_u64(7).unwrap(), None);
  }

  #[test]
  fn test_repeated_tags_preserve_order() {
    let mut w = FieldWriter::new();
    w.put_u32(9, 1).put_u32(9, 2).put_u32(9, 3);
    let buf = w.finish();

    let r = FieldReader::parse(&buf).unwrap();
    let values: Vec<u32> = r.get_all(9).map(BigEndian::read_u32).collect();
    assert_eq!(values, vec![1, 2, 3]);
  }

  #[test]
  fn test_truncation_is_fatal() {
    let mut w = FieldWriter::new();
    w.put_u64(1, 99);
    let buf = w.finish();
    assert!(FieldReader::parse(&buf[..buf.len() - 2]).is_err());
    assert!(FieldReader::parse(&buf[..3]).is_err());
  }

  #[test]
  fn test_missing_required_field() {
    let mut w = FieldWriter::new();
    w.put_u32(1, 1);
    let buf = w.finish();
    let r = FieldReader::parse(&buf).unwrap();
    assert!(matches!(r.u32(2), Err(FsError::Fatal(_))));
  }
}
