//! Offline-first GraphQL client.
//!
//! Queries go through a per-request [`CachePolicy`] deciding between the
//! response cache and the network; mutations invalidate the cache; requests
//! made while offline can be persisted and replayed later; subscriptions run
//! over a single multiplexed `graphql-ws` connection.

pub mod cache;
pub mod client;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod fingerprint;
pub mod queue;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{CacheStats, ResponseCache};
pub use client::{MetricsSnapshot, SyncClient, SyncClientBuilder};
pub use config::Config;
pub use connectivity::Connectivity;
pub use error::{Result, StorageError, SyncError, TransportError};
pub use fingerprint::fingerprint;
pub use queue::{DrainReport, OfflineQueue, QueueStats};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};
pub use subscription::{SubscriptionHandle, SubscriptionTransport};
pub use types::{
  CachePolicy, GraphQLError, Location, OperationKind, PathSegment, Request, Response, Variables,
};
