//! Durable FIFO queue of requests issued while offline.
//!
//! Entries are stored under zero-padded sequence keys so the store's key
//! order is insertion order. Appends write a fresh key and removals delete
//! a single key, which means a drain and concurrent enqueues never rewrite
//! each other's rows.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connectivity::Connectivity;
use crate::error::{StorageError, SyncError};
use crate::fingerprint::fingerprint;
use crate::store::KeyValueStore;
use crate::types::{Request, Response};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueuedRequest {
  request: Request,
  fingerprint: String,
  enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
  pub pending: usize,
}

/// Outcome of one drain pass. Every entry read counts as attempted, so
/// `attempted == succeeded + failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  pub failed: usize,
}

pub struct OfflineQueue<S: KeyValueStore> {
  storage: Arc<S>,
  connectivity: Connectivity,
  next_seq: Arc<AtomicU64>,
  draining: Arc<AtomicBool>,
}

impl<S: KeyValueStore> OfflineQueue<S> {
  /// Open the queue, resuming the sequence after any persisted entries.
  pub fn new(storage: S, connectivity: Connectivity) -> Result<Self, StorageError> {
    let next_seq = storage
      .list()?
      .iter()
      .filter_map(|(key, _)| key.parse::<u64>().ok())
      .max()
      .map_or(0, |max| max + 1);

    Ok(Self {
      storage: Arc::new(storage),
      connectivity,
      next_seq: Arc::new(AtomicU64::new(next_seq)),
      draining: Arc::new(AtomicBool::new(false)),
    })
  }

  /// Append a request if it asked to be persisted while offline.
  ///
  /// Returns whether the request was stored. Identical requests are not
  /// deduplicated; each enqueue is replayed separately.
  pub fn enqueue(&self, request: &Request) -> Result<bool, StorageError> {
    if !request.persist_offline {
      return Ok(false);
    }

    let entry = QueuedRequest {
      request: request.clone(),
      fingerprint: fingerprint(request),
      enqueued_at: Utc::now(),
    };
    let bytes = serde_json::to_vec(&entry)?;
    let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
    self.storage.put(&sequence_key(seq), &bytes)?;
    debug!(seq, fingerprint = %entry.fingerprint, "queued offline request");
    Ok(true)
  }

  /// Replay queued requests in FIFO order while connectivity is up.
  ///
  /// An entry is removed only when `executor` returns a successful
  /// response; anything else leaves it queued for the next drain. Failures
  /// never abort the pass and never escape it. A drain started while
  /// another is running returns an empty report.
  pub async fn drain<F, Fut>(&self, mut executor: F) -> DrainReport
  where
    F: FnMut(Request) -> Fut,
    Fut: Future<Output = Result<Response, SyncError>>,
  {
    let mut report = DrainReport::default();
    if !self.connectivity.is_online() {
      debug!("offline, skipping drain");
      return report;
    }
    if self.draining.swap(true, Ordering::AcqRel) {
      debug!("drain already in progress");
      return report;
    }
    let _guard = DrainGuard(&self.draining);

    let entries = match self.storage.list() {
      Ok(entries) => entries,
      Err(e) => {
        warn!(error = %e, "failed to read offline queue");
        return report;
      }
    };

    for (key, bytes) in entries {
      report.attempted += 1;
      let entry: QueuedRequest = match serde_json::from_slice(&bytes) {
        Ok(entry) => entry,
        Err(e) => {
          warn!(%key, error = %e, "skipping undecodable queue entry");
          report.failed += 1;
          continue;
        }
      };

      match executor(entry.request).await {
        Ok(response) if response.is_successful() => match self.storage.delete(&key) {
          Ok(_) => report.succeeded += 1,
          Err(e) => {
            warn!(%key, error = %e, "replayed but failed to dequeue");
            report.failed += 1;
          }
        },
        Ok(response) => {
          warn!(
            %key,
            fingerprint = %entry.fingerprint,
            errors = response.errors().len(),
            "replay returned errors, keeping entry"
          );
          report.failed += 1;
        }
        Err(e) => {
          warn!(%key, fingerprint = %entry.fingerprint, error = %e, "replay failed, keeping entry");
          report.failed += 1;
        }
      }
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      failed = report.failed,
      "offline queue drained"
    );
    report
  }

  pub fn clear(&self) -> Result<(), StorageError> {
    self.storage.clear()
  }

  pub fn stats(&self) -> Result<QueueStats, StorageError> {
    Ok(QueueStats {
      pending: self.storage.len()?,
    })
  }

  /// Queued requests in replay order.
  pub fn pending(&self) -> Result<Vec<Request>, StorageError> {
    Ok(
      self
        .storage
        .list()?
        .into_iter()
        .filter_map(|(_, bytes)| serde_json::from_slice::<QueuedRequest>(&bytes).ok())
        .map(|entry| entry.request)
        .collect(),
    )
  }
}

impl<S: KeyValueStore> Clone for OfflineQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      connectivity: self.connectivity.clone(),
      next_seq: Arc::clone(&self.next_seq),
      draining: Arc::clone(&self.draining),
    }
  }
}

/// Releases the drain flag even if the drain future is dropped mid-pass.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

fn sequence_key(seq: u64) -> String {
  format!("{:020}", seq)
}
