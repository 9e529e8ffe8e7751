//! Request dispatch: decides per request between cache, network and the
//! offline queue, and hands subscriptions to the WebSocket transport.
//!
//! | Policy            | Cache read | Network                                   |
//! |-------------------|------------|-------------------------------------------|
//! | `CacheOnly`       | yes        | never                                     |
//! | `CacheFirst`      | yes        | on miss                                   |
//! | `NetworkOnly`     | no         | always                                    |
//! | `NetworkFirst`    | on failure | always, cache fallback on transport error |
//! | `CacheAndNetwork` | yes        | always, in the background when cached     |
//!
//! Every successful network response is written to the cache, including
//! under `NetworkOnly`. Concurrent identical requests are not coalesced.

mod metrics;

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use metrics::{Metrics, MetricsSnapshot};

use crate::cache::{CacheStats, ResponseCache};
use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::error::{SyncError, TransportError};
use crate::fingerprint::fingerprint;
use crate::queue::{DrainReport, OfflineQueue, QueueStats};
use crate::store::{KeyValueStore, MemoryStore, SqliteStore, CACHE_TABLE, QUEUE_TABLE};
use crate::subscription::{SubscriptionHandle, SubscriptionTransport};
use crate::transport::{
  merge_headers, ws_endpoint, HttpTransport, ReqwestTransport, TungsteniteConnector, WsConnector,
};
use crate::types::{CachePolicy, OperationKind, Request, Response, ResultPayload};
use metrics::RequestKind;

/// Builds a [`SyncClient`], opening its stores eagerly.
pub struct SyncClientBuilder {
  config: Config,
  http: Option<Arc<dyn HttpTransport>>,
  ws: Option<Arc<dyn WsConnector>>,
  connectivity: Option<Connectivity>,
}

impl SyncClientBuilder {
  pub fn new(config: Config) -> Self {
    Self {
      config,
      http: None,
      ws: None,
      connectivity: None,
    }
  }

  pub fn http_transport(mut self, http: Arc<dyn HttpTransport>) -> Self {
    self.http = Some(http);
    self
  }

  pub fn ws_connector(mut self, ws: Arc<dyn WsConnector>) -> Self {
    self.ws = Some(ws);
    self
  }

  /// Share a connectivity signal with the application. Defaults to a
  /// private signal that starts online.
  pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
    self.connectivity = Some(connectivity);
    self
  }

  /// Open the SQLite-backed cache and queue at the configured path.
  pub fn open(self) -> Result<SyncClient<SqliteStore>, SyncError> {
    let path = match &self.config.database_path {
      Some(path) => path.clone(),
      None => SqliteStore::default_path()?,
    };
    let cache = SqliteStore::open(&path, CACHE_TABLE)?;
    let queue = SqliteStore::open(&path, QUEUE_TABLE)?;
    self.build(cache, queue)
  }

  /// Non-durable client, mostly for tests.
  pub fn in_memory(self) -> Result<SyncClient<MemoryStore>, SyncError> {
    self.build(MemoryStore::new(), MemoryStore::new())
  }

  pub fn build<S: KeyValueStore + 'static>(
    self,
    cache_store: S,
    queue_store: S,
  ) -> Result<SyncClient<S>, SyncError> {
    let ws_endpoint = ws_endpoint(&self.config.endpoint)?;
    let connectivity = self.connectivity.unwrap_or_default();
    let http: Arc<dyn HttpTransport> = match self.http {
      Some(http) => http,
      None => Arc::new(ReqwestTransport::new()),
    };
    let ws: Arc<dyn WsConnector> = match self.ws {
      Some(ws) => ws,
      None => Arc::new(TungsteniteConnector),
    };

    let mut subscriptions = SubscriptionTransport::new(ws);
    if !self.config.headers.is_empty() {
      subscriptions = subscriptions.with_init_payload(json!({ "headers": self.config.headers }));
    }

    let headers = merge_headers(&self.config.headers);
    let metrics = Metrics::new(self.config.latency_window);
    let queue = OfflineQueue::new(queue_store, connectivity.clone())?;

    Ok(SyncClient {
      http,
      cache: ResponseCache::new(cache_store),
      queue,
      connectivity,
      subscriptions,
      metrics: Arc::new(metrics),
      headers: Arc::new(headers),
      ws_endpoint: Arc::from(ws_endpoint.as_str()),
      config: Arc::new(self.config),
    })
  }
}

/// The offline-first GraphQL client.
///
/// Owns one response cache, one offline queue and one subscription
/// transport. Clones share all of them.
pub struct SyncClient<S: KeyValueStore + 'static> {
  config: Arc<Config>,
  http: Arc<dyn HttpTransport>,
  cache: ResponseCache<S>,
  queue: OfflineQueue<S>,
  connectivity: Connectivity,
  subscriptions: SubscriptionTransport,
  metrics: Arc<Metrics>,
  headers: Arc<Vec<(String, String)>>,
  ws_endpoint: Arc<str>,
}

impl<S: KeyValueStore + 'static> Clone for SyncClient<S> {
  fn clone(&self) -> Self {
    Self {
      config: Arc::clone(&self.config),
      http: Arc::clone(&self.http),
      cache: self.cache.clone(),
      queue: self.queue.clone(),
      connectivity: self.connectivity.clone(),
      subscriptions: self.subscriptions.clone(),
      metrics: Arc::clone(&self.metrics),
      headers: Arc::clone(&self.headers),
      ws_endpoint: Arc::clone(&self.ws_endpoint),
    }
  }
}

impl<S: KeyValueStore + 'static> SyncClient<S> {
  pub fn builder(config: Config) -> SyncClientBuilder {
    SyncClientBuilder::new(config)
  }

  /// Run a query according to its cache policy.
  ///
  /// GraphQL errors come back as a non-successful `Response`, not as `Err`.
  pub async fn query(&self, request: &Request) -> Result<Response, SyncError> {
    self.metrics.record_request(RequestKind::Query);
    let started = Instant::now();
    let request = with_kind(request, OperationKind::Query);

    let result = match request.policy {
      CachePolicy::CacheOnly => self.cache_only(&request),
      CachePolicy::CacheFirst => self.cache_first(&request).await,
      CachePolicy::NetworkOnly => self.network(&request).await,
      CachePolicy::NetworkFirst => self.network_first(&request).await,
      CachePolicy::CacheAndNetwork => self.cache_and_network(&request).await,
    };

    self.record(started, &result);
    result
  }

  /// Run a mutation. Never served from cache; on completion the whole
  /// cache is invalidated, whether or not the server reported errors.
  pub async fn mutate(&self, request: &Request) -> Result<Response, SyncError> {
    self.metrics.record_request(RequestKind::Mutation);
    let started = Instant::now();
    let request = with_kind(request, OperationKind::Mutation);

    let result = if !self.connectivity.is_online() && request.persist_offline {
      Err(self.defer(&request))
    } else {
      self.run_mutation(&request).await
    };

    self.record(started, &result);
    result
  }

  /// Start a subscription, connecting the WebSocket transport on first use.
  pub async fn subscribe(&self, request: &Request) -> Result<SubscriptionHandle, SyncError> {
    self.metrics.record_request(RequestKind::Subscription);
    self.subscriptions.connect(&self.ws_endpoint).await?;
    self.subscriptions.subscribe(request)
  }

  pub fn unsubscribe(&self, id: &str) -> bool {
    self.subscriptions.unsubscribe(id)
  }

  /// Replay the offline queue through this client.
  pub async fn drain_offline_queue(&self) -> DrainReport {
    self
      .queue
      .drain(|request| {
        let client = self.clone();
        async move { client.replay(request).await }
      })
      .await
  }

  /// Drain the queue each time connectivity comes back. The task runs
  /// until aborted; it does not touch subscriptions.
  pub fn spawn_replay_on_reconnect(&self) -> JoinHandle<()> {
    let client = self.clone();
    let mut changes = self.connectivity.changes();
    tokio::spawn(async move {
      while changes.changed().await.is_ok() {
        let online = *changes.borrow_and_update();
        if online {
          let report = client.drain_offline_queue().await;
          debug!(?report, "replayed offline queue after reconnect");
        }
      }
    })
  }

  pub fn invalidate(&self, request: &Request) -> Result<bool, SyncError> {
    Ok(self.cache.invalidate(request)?)
  }

  pub fn clear_cache(&self) -> Result<(), SyncError> {
    Ok(self.cache.clear()?)
  }

  pub fn clear_queue(&self) -> Result<(), SyncError> {
    Ok(self.queue.clear()?)
  }

  pub fn cache_stats(&self) -> Result<CacheStats, SyncError> {
    Ok(self.cache.stats()?)
  }

  pub fn queue_stats(&self) -> Result<QueueStats, SyncError> {
    Ok(self.queue.stats()?)
  }

  pub fn pending_requests(&self) -> Result<Vec<Request>, SyncError> {
    Ok(self.queue.pending()?)
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  pub fn reset_metrics(&self) {
    self.metrics.reset()
  }

  pub fn cache(&self) -> &ResponseCache<S> {
    &self.cache
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn subscriptions(&self) -> &SubscriptionTransport {
    &self.subscriptions
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  fn cache_only(&self, request: &Request) -> Result<Response, SyncError> {
    self.lookup(request)?.ok_or_else(|| SyncError::CacheMiss {
      fingerprint: fingerprint(request),
    })
  }

  async fn cache_first(&self, request: &Request) -> Result<Response, SyncError> {
    if let Some(hit) = self.lookup(request)? {
      return Ok(hit);
    }
    self.network(request).await
  }

  async fn network_first(&self, request: &Request) -> Result<Response, SyncError> {
    match self.network(request).await {
      Err(SyncError::Transport(e)) => match self.lookup(request)? {
        Some(hit) => {
          warn!(error = %e, "network failed, serving cached response");
          Ok(hit)
        }
        None => Err(SyncError::Transport(e)),
      },
      other => other,
    }
  }

  async fn cache_and_network(&self, request: &Request) -> Result<Response, SyncError> {
    let cached = self.lookup(request)?;
    if !self.connectivity.is_online() {
      return match cached {
        Some(hit) => Ok(hit),
        None => Err(self.defer(request)),
      };
    }

    self.spawn_refresh(request.clone());
    match cached {
      Some(hit) => Ok(hit),
      // The background refresh above fetches too; both results get cached
      None => self.network(request).await,
    }
  }

  /// Shared network path: defer when offline, otherwise fetch and cache
  /// successful responses.
  async fn network(&self, request: &Request) -> Result<Response, SyncError> {
    if !self.connectivity.is_online() {
      return Err(self.defer(request));
    }
    let response = self.execute(request).await?;
    self.store(request, &response)?;
    Ok(response)
  }

  fn store(&self, request: &Request, response: &Response) -> Result<(), SyncError> {
    if response.is_successful() {
      self.cache.put(request, response, self.config.cache_ttl())?;
    }
    Ok(())
  }

  async fn run_mutation(&self, request: &Request) -> Result<Response, SyncError> {
    let response = self.execute(request).await?;
    self.cache.clear()?;
    debug!(fingerprint = %fingerprint(request), "mutation completed, cache invalidated");
    Ok(response)
  }

  async fn replay(&self, request: Request) -> Result<Response, SyncError> {
    match request.kind {
      OperationKind::Mutation => self.run_mutation(&request).await,
      OperationKind::Query => {
        let response = self.execute(&request).await?;
        self.store(&request, &response)?;
        Ok(response)
      }
    }
  }

  /// Fire-and-forget cache refresh. Its outcome never reaches the caller.
  fn spawn_refresh(&self, request: Request) {
    let client = self.clone();
    tokio::spawn(async move {
      match client.execute(&request).await {
        Ok(response) if response.is_successful() => {
          if let Err(e) = client
            .cache
            .put(&request, &response, client.config.cache_ttl())
          {
            warn!(error = %e, "background refresh could not update cache");
          }
        }
        Ok(_) => debug!("background refresh returned errors, cache untouched"),
        Err(e) => debug!(error = %e, "background refresh failed"),
      }
    });
  }

  /// Queue the request if it asked for it, otherwise report no data.
  fn defer(&self, request: &Request) -> SyncError {
    if !request.persist_offline {
      return SyncError::NoDataAvailable;
    }
    match self.queue.enqueue(request) {
      Ok(_) => {
        info!(fingerprint = %fingerprint(request), "offline, request queued");
        SyncError::OfflineQueued {
          fingerprint: fingerprint(request),
        }
      }
      Err(e) => e.into(),
    }
  }

  fn lookup(&self, request: &Request) -> Result<Option<Response>, SyncError> {
    let cached = self.cache.get(request)?;
    self.metrics.record_cache(cached.is_some());
    debug!(hit = cached.is_some(), policy = %request.policy, "cache lookup");
    Ok(cached)
  }

  /// One POST with the configured timeout. Non-2xx statuses and
  /// undecodable bodies are transport failures.
  async fn execute(&self, request: &Request) -> Result<Response, TransportError> {
    let body = serde_json::to_vec(&request.payload())
      .map_err(|e| TransportError::Decode(format!("failed to encode request: {e}")))?;
    let timeout = self.config.request_timeout();

    let reply = tokio::time::timeout(
      timeout,
      self
        .http
        .post(&self.config.endpoint, &self.headers, body, timeout),
    )
    .await
    .map_err(|_| TransportError::Timeout(timeout))??;

    if !(200..300).contains(&reply.status) {
      let reason = reqwest::StatusCode::from_u16(reply.status)
        .ok()
        .and_then(|status| status.canonical_reason())
        .unwrap_or("Unknown Status")
        .to_string();
      return Err(TransportError::Status {
        status: reply.status,
        reason,
      });
    }

    let payload: ResultPayload =
      serde_json::from_slice(&reply.body).map_err(|e| TransportError::Decode(e.to_string()))?;
    Ok(Response::from(payload))
  }

  fn record(&self, started: Instant, result: &Result<Response, SyncError>) {
    match result {
      // Deferred, not finished
      Err(SyncError::OfflineQueued { .. }) => {}
      Ok(response) => self
        .metrics
        .record_outcome(response.is_successful(), started.elapsed()),
      Err(_) => self.metrics.record_outcome(false, started.elapsed()),
    }
  }
}

fn with_kind(request: &Request, kind: OperationKind) -> Request {
  Request {
    kind,
    ..request.clone()
  }
}

#[cfg(test)]
mod tests;
