//! Membership control loops.
//!
//! Cooperative tokio tasks owned by the mgmtd process: lease renewal,
//! node liveness checking, and client session pruning. Each loop exits
//! when the shutdown signal flips.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::kv::KvEngine;
use crate::routing::mgmtd::MgmtdService;

/// Renew the primary lease at `lease_renew_ms`. A follower that wins the
/// lease starts acting as primary on its next loop iterations.
pub fn spawn_lease_extender<E: KvEngine>(
  svc: Arc<MgmtdService<E>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let period = Duration::from_millis(svc.config().lease_renew_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(err) = svc.election().try_acquire().await {
            tracing::warn!(target: "kitefs::mgmtd", error = %err, "lease renewal failed");
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}

/// Mark silent nodes offline and reconcile their chains. Primary-only;
/// followers tick idly until they win the lease.
pub fn spawn_heartbeat_checker<E: KvEngine>(
  svc: Arc<MgmtdService<E>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let period = Duration::from_millis(svc.config().heartbeat_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          if let Err(err) = svc.check_node_liveness().await {
            tracing::warn!(target: "kitefs::mgmtd", error = %err, "liveness check failed");
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}

/// Drop expired client sessions.
pub fn spawn_session_pruner<E: KvEngine>(
  svc: Arc<MgmtdService<E>>,
  mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let period = Duration::from_millis(svc.config().heartbeat_interval_ms.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
      tokio::select! {
        _ = ticker.tick() => {
          let pruned = svc.prune_client_sessions();
          if pruned > 0 {
            tracing::debug!(target: "kitefs::mgmtd", pruned, "pruned client sessions");
          }
        }
        _ = shutdown.changed() => break,
      }
    }
  })
}
