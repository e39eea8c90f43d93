//! Transaction retry driver.
//!
//! Wraps a transaction body in the standard backoff loop: `Conflict`,
//! `Throttled`, `TooOld` and `Busy` retry unconditionally; `MaybeCommitted`,
//! `Timeout` and network failures retry only when the caller asserts the
//! body is idempotent (a request uuid carried in-band).

use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::{KvEngine, Transaction};
use crate::types::Versionstamp;

/// Backoff bounds for the retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvRetryConfig {
  pub initial_backoff_ms: u64,
  pub max_backoff_ms: u64,
  /// Overall deadline across all attempts.
  pub max_total_ms: u64,
  pub max_attempts: u32,
}

impl Default for KvRetryConfig {
  fn default() -> Self {
    KvRetryConfig {
      initial_backoff_ms: 2,
      max_backoff_ms: 1_000,
      max_total_ms: 30_000,
      max_attempts: 32,
    }
  }
}

/// Run `body` inside a read-write transaction, committing on success and
/// retrying per the config. Returns the body's value and the commit
/// versionstamp.
pub async fn run_transaction<E, T, F>(
  engine: &E,
  config: &KvRetryConfig,
  idempotent: bool,
  mut body: F,
) -> Result<(T, Versionstamp)>
where
  E: KvEngine,
  F: FnMut(&mut E::Txn) -> Result<T>,
{
  let started = Instant::now();
  let mut backoff_ms = config.initial_backoff_ms.max(1);
  let mut attempt: u32 = 0;

  loop {
    attempt += 1;
    let mut txn = engine.begin();
    let err = match body(&mut txn) {
      Ok(value) => match txn.commit() {
        Ok(stamp) => return Ok((value, stamp)),
        Err(err) => err,
      },
      Err(err) => {
        txn.cancel();
        err
      }
    };

    let may_retry =
      err.is_retriable() || (idempotent && err.is_retriable_if_idempotent());
    let within_bounds =
      attempt < config.max_attempts && started.elapsed().as_millis() < config.max_total_ms as u128;
    if !may_retry || !within_bounds {
      return Err(err);
    }

    tracing::debug!(target: "kitefs::kv", attempt, error = %err, "retrying transaction");

    // Full jitter on the current backoff step.
    let sleep_ms = rand::thread_rng().gen_range(1..=backoff_ms);
    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
    backoff_ms = (backoff_ms * 2).min(config.max_backoff_ms);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::FsError;
  use crate::kv::{KvEngine, MemKvEngine, ReadTransaction, Transaction};

  #[tokio::test]
  async fn test_commits_once_on_success() {
    let kv = MemKvEngine::new();
    let (value, stamp) = run_transaction(&kv, &KvRetryConfig::default(), false, |txn| {
      txn.set(b"k", b"v");
      Ok(42u32)
    })
    .await
    .unwrap();
    assert_eq!(value, 42);
    assert_eq!(stamp.commit_version, 1);
  }

  #[tokio::test]
  async fn test_retries_conflict() {
    let kv = MemKvEngine::new();
    kv.inject_conflict_once();
    let mut calls = 0;
    run_transaction(&kv, &KvRetryConfig::default(), false, |txn| {
      calls += 1;
      txn.set(b"k", b"v");
      Ok(())
    })
    .await
    .unwrap();
    assert_eq!(calls, 2);
  }

  #[tokio::test]
  async fn test_maybe_committed_surfaces_without_idempotency() {
    let kv = MemKvEngine::new();
    kv.inject_maybe_committed_once();
    let result = run_transaction(&kv, &KvRetryConfig::default(), false, |txn| {
      txn.set(b"k", b"v");
      Ok(())
    })
    .await;
    assert_eq!(result.err(), Some(FsError::MaybeCommitted));
  }

  #[tokio::test]
  async fn test_maybe_committed_retries_when_idempotent() {
    let kv = MemKvEngine::new();
    kv.inject_maybe_committed_once();
    let mut calls = 0;
    run_transaction(&kv, &KvRetryConfig::default(), true, |txn| {
      calls += 1;
      txn.set(b"k", b"v");
      Ok(())
    })
    .await
    .unwrap();
    assert_eq!(calls, 2);
    // The first (maybe-committed) attempt actually applied; second replay
    // overwrote the same key.
    let mut ro = kv.begin_read_only();
    assert_eq!(ro.snapshot_get(b"k").unwrap(), Some(b"v".to_vec()));
  }

  #[tokio::test]
  async fn test_non_retriable_surfaces() {
    let kv = MemKvEngine::new();
    let result: Result<((), Versionstamp)> =
      run_transaction(&kv, &KvRetryConfig::default(), true, |_txn| {
        Err(FsError::NoPermission)
      })
      .await;
    assert_eq!(result.err(), Some(FsError::NoPermission));
  }

  #[tokio::test]
  async fn test_attempt_bound() {
    let kv = MemKvEngine::new();
    let config = KvRetryConfig {
      max_attempts: 3,
      initial_backoff_ms: 1,
      max_backoff_ms: 2,
      max_total_ms: 10_000,
    };
    let mut calls = 0;
    let result: Result<((), Versionstamp)> = run_transaction(&kv, &config, false, |_txn| {
      calls += 1;
      Err(FsError::Conflict)
    })
    .await;
    assert_eq!(result.err(), Some(FsError::Conflict));
    assert_eq!(calls, 3);
  }
}
