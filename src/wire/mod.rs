//! Wire envelope and transports.
//!
//! The envelope is the stable header every service request carries. The
//! in-process transports implement the service network traits for tests
//! and single-process deployments; RDMA/TCP fabrics plug in behind the
//! same traits.

pub mod envelope;
pub mod transport;

pub use envelope::{Envelope, MessageFlags, Timestamps};
pub use transport::{InProcMetaNet, InProcStorageNet, MetaPeer, MgmtdRoutingSource};
