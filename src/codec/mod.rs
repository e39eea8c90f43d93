//! Key schema and value encoding.
//!
//! Keys are a fixed four-byte ASCII table prefix followed by big-endian
//! fixed-width components and optional trailing variable-width bytes, so
//! lexicographic key order equals component order. Values use a compact
//! tagged-field binary format that tolerates unknown trailing fields.

pub mod keys;
pub mod values;

pub use values::{FieldReader, FieldWriter};
