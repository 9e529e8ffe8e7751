//! Error taxonomy shared by the cache, queue, transports and dispatch engine.

use std::time::Duration;

use crate::types::GraphQLError;

/// Failures of the storage layer backing the cache and the offline queue.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
  #[error("lock poisoned: {0}")]
  LockPoisoned(String),
  #[error("invalid table name: {0}")]
  InvalidTable(String),
  #[error("io error: {0}")]
  Io(String),
}

/// Network-level failures. All of these are eligible for retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("http status {status}: {reason}")]
  Status { status: u16, reason: String },
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  #[error("network error: {0}")]
  Network(String),
  #[error("invalid response body: {0}")]
  Decode(String),
  #[error("websocket error: {0}")]
  WebSocket(String),
  #[error("invalid endpoint: {0}")]
  InvalidEndpoint(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
  #[error("transport failure: {0}")]
  Transport(#[from] TransportError),
  /// Only produced by [`crate::Response::into_data`]; the engine returns
  /// GraphQL errors as a non-successful `Response` instead.
  #[error("graphql errors: {}", summarize(.0))]
  GraphQL(Vec<GraphQLError>),
  #[error("no cached response for {fingerprint}")]
  CacheMiss { fingerprint: String },
  #[error("offline and no cached data available")]
  NoDataAvailable,
  /// The request was accepted into the durable offline queue and will be
  /// replayed on the next drain.
  #[error("offline: request {fingerprint} queued for replay")]
  OfflineQueued { fingerprint: String },
  #[error("subscription transport is not connected")]
  NotConnected,
  #[error("subscription connection lost")]
  ConnectionLost,
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),
}

impl SyncError {
  pub fn is_retryable(&self) -> bool {
    matches!(self, SyncError::Transport(_))
  }

  pub fn is_offline_queued(&self) -> bool {
    matches!(self, SyncError::OfflineQueued { .. })
  }
}

fn summarize(errors: &[GraphQLError]) -> String {
  errors
    .iter()
    .map(|e| e.message.as_str())
    .collect::<Vec<_>>()
    .join("; ")
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
