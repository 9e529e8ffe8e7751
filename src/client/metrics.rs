//! Request counters and latency percentiles for the dispatch engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

#[derive(Debug)]
pub struct Metrics {
  requests: AtomicU64,
  queries: AtomicU64,
  mutations: AtomicU64,
  subscriptions: AtomicU64,
  successes: AtomicU64,
  failures: AtomicU64,
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  latencies: Mutex<VecDeque<Duration>>,
  window: usize,
}

/// Point-in-time view of [`Metrics`] with derived rates.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
  pub requests: u64,
  pub queries: u64,
  pub mutations: u64,
  pub subscriptions: u64,
  pub successes: u64,
  pub failures: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  /// Hits over lookups; 0 when nothing was looked up.
  pub hit_rate: f64,
  /// Unsuccessful over completed queries and mutations.
  pub error_rate: f64,
  pub p50: Option<Duration>,
  pub p95: Option<Duration>,
  pub p99: Option<Duration>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum RequestKind {
  Query,
  Mutation,
  Subscription,
}

impl Metrics {
  /// Keep the most recent `window` latency samples.
  pub fn new(window: usize) -> Self {
    Self {
      requests: AtomicU64::new(0),
      queries: AtomicU64::new(0),
      mutations: AtomicU64::new(0),
      subscriptions: AtomicU64::new(0),
      successes: AtomicU64::new(0),
      failures: AtomicU64::new(0),
      cache_hits: AtomicU64::new(0),
      cache_misses: AtomicU64::new(0),
      latencies: Mutex::new(VecDeque::with_capacity(window.min(4096))),
      window: window.max(1),
    }
  }

  pub(crate) fn record_request(&self, kind: RequestKind) {
    self.requests.fetch_add(1, Ordering::Relaxed);
    let counter = match kind {
      RequestKind::Query => &self.queries,
      RequestKind::Mutation => &self.mutations,
      RequestKind::Subscription => &self.subscriptions,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_cache(&self, hit: bool) {
    let counter = if hit { &self.cache_hits } else { &self.cache_misses };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_outcome(&self, success: bool, latency: Duration) {
    let counter = if success { &self.successes } else { &self.failures };
    counter.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut latencies) = self.latencies.lock() {
      if latencies.len() == self.window {
        latencies.pop_front();
      }
      latencies.push_back(latency);
    }
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    let queries = self.queries.load(Ordering::Relaxed);
    let mutations = self.mutations.load(Ordering::Relaxed);
    let successes = self.successes.load(Ordering::Relaxed);
    let failures = self.failures.load(Ordering::Relaxed);
    let cache_hits = self.cache_hits.load(Ordering::Relaxed);
    let cache_misses = self.cache_misses.load(Ordering::Relaxed);

    let mut sorted: Vec<Duration> = self
      .latencies
      .lock()
      .map(|l| l.iter().copied().collect())
      .unwrap_or_default();
    sorted.sort_unstable();

    MetricsSnapshot {
      requests: self.requests.load(Ordering::Relaxed),
      queries,
      mutations,
      subscriptions: self.subscriptions.load(Ordering::Relaxed),
      successes,
      failures,
      cache_hits,
      cache_misses,
      hit_rate: ratio(cache_hits, cache_hits + cache_misses),
      error_rate: ratio(failures, successes + failures),
      p50: percentile(&sorted, 0.50),
      p95: percentile(&sorted, 0.95),
      p99: percentile(&sorted, 0.99),
    }
  }

  pub fn reset(&self) {
    for counter in [
      &self.requests,
      &self.queries,
      &self.mutations,
      &self.subscriptions,
      &self.successes,
      &self.failures,
      &self.cache_hits,
      &self.cache_misses,
    ] {
      counter.store(0, Ordering::Relaxed);
    }
    if let Ok(mut latencies) = self.latencies.lock() {
      latencies.clear();
    }
  }
}

fn ratio(part: u64, whole: u64) -> f64 {
  if whole == 0 {
    0.0
  } else {
    part as f64 / whole as f64
  }
}

/// Nearest-rank percentile of an ascending slice.
fn percentile(sorted: &[Duration], p: f64) -> Option<Duration> {
  if sorted.is_empty() {
    return None;
  }
  let rank = (p * sorted.len() as f64).ceil() as usize;
  Some(sorted[rank.clamp(1, sorted.len()) - 1])
}
