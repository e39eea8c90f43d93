//! Routing and cluster membership (mgmtd).
//!
//! The management plane holds the cluster map: nodes, storage targets,
//! replication chains and chain tables, all versioned under a single
//! monotonic routing version. A lease in the KV selects one primary
//! mgmtd; control loops run there and every change is one transaction.

pub mod election;
pub mod loops;
pub mod mgmtd;
pub mod state;

pub use election::{Election, LeaseInfo};
pub use mgmtd::{ClientSession, MgmtdService};
pub use state::{
  ChainInfo, ChainRole, ChainTable, NodeInfo, NodeStatus, RoutingInfo, TargetInfo, TargetState,
};
