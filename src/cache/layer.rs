use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::fingerprint::fingerprint;
use crate::store::KeyValueStore;
use crate::types::{Request, Response};

/// What is persisted per fingerprint. Response and expiry are written as a
/// single value so a put either lands completely or not at all.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
  response: Response,
  expires_at: Option<DateTime<Utc>>,
}

impl CacheRecord {
  fn is_expired(&self, now: DateTime<Utc>) -> bool {
    matches!(self.expires_at, Some(at) if at <= now)
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub total: usize,
  /// Entries whose expiry has passed but which have not been read since.
  pub expired: usize,
}

/// Cache of serialized responses on top of a [`KeyValueStore`].
pub struct ResponseCache<S: KeyValueStore> {
  storage: Arc<S>,
}

impl<S: KeyValueStore> ResponseCache<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Look up a cached response.
  ///
  /// Expired and undecodable entries are deleted and reported as a miss.
  /// A hit comes back with `from_cache` set.
  pub fn get(&self, request: &Request) -> Result<Option<Response>, StorageError> {
    let key = fingerprint(request);
    let Some(bytes) = self.storage.get(&key)? else {
      return Ok(None);
    };

    let record: CacheRecord = match serde_json::from_slice(&bytes) {
      Ok(record) => record,
      Err(e) => {
        warn!(fingerprint = %key, error = %e, "dropping corrupt cache entry");
        self.storage.delete(&key)?;
        return Ok(None);
      }
    };

    if record.is_expired(Utc::now()) {
      debug!(fingerprint = %key, "cache entry expired");
      self.storage.delete(&key)?;
      return Ok(None);
    }

    let mut response = record.response;
    response.from_cache = true;
    Ok(Some(response))
  }

  /// Store a response, optionally expiring `ttl` from now.
  pub fn put(
    &self,
    request: &Request,
    response: &Response,
    ttl: Option<Duration>,
  ) -> Result<(), StorageError> {
    let key = fingerprint(request);
    let expires_at = ttl.map(|ttl| {
      let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
      Utc::now()
        .checked_add_signed(ttl)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
    });

    let mut stored = response.clone();
    stored.from_cache = false;
    let record = CacheRecord {
      response: stored,
      expires_at,
    };
    let bytes = serde_json::to_vec(&record)?;
    self.storage.put(&key, &bytes)?;
    debug!(fingerprint = %key, ?expires_at, "cached response");
    Ok(())
  }

  pub fn invalidate(&self, request: &Request) -> Result<bool, StorageError> {
    self.storage.delete(&fingerprint(request))
  }

  pub fn clear(&self) -> Result<(), StorageError> {
    self.storage.clear()
  }

  /// Count entries and how many of them are past their expiry.
  pub fn stats(&self) -> Result<CacheStats, StorageError> {
    let now = Utc::now();
    let entries = self.storage.list()?;
    let expired = entries
      .iter()
      .filter_map(|(_, bytes)| serde_json::from_slice::<CacheRecord>(bytes).ok())
      .filter(|record| record.is_expired(now))
      .count();

    Ok(CacheStats {
      total: entries.len(),
      expired,
    })
  }
}

impl<S: KeyValueStore> Clone for ResponseCache<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
