//! Small shared helpers.

use std::future::Future;
use std::pin::Pin;

/// Owned, type-erased future, used by the network-facing traits so
/// in-process and wire transports share one shape.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
