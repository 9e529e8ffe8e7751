use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};

use super::*;
use crate::error::TransportError;
use crate::testing::{json_reply, status_reply, MockHttp, MockWsConnector};

const ENDPOINT: &str = "https://api.example.com/graphql";

fn config() -> Config {
  Config::new(ENDPOINT).with_request_timeout(Duration::from_millis(200))
}

fn client_with(http: MockHttp, connectivity: Connectivity) -> (SyncClient<MemoryStore>, Arc<MockHttp>) {
  let http = Arc::new(http);
  let client = SyncClient::<MemoryStore>::builder(config())
    .http_transport(http.clone())
    .connectivity(connectivity)
    .in_memory()
    .unwrap();
  (client, http)
}

fn user_query(policy: CachePolicy) -> Request {
  Request::new("query User($id: ID!) { user(id: $id) { name } }")
    .variable("id", "1")
    .with_operation_name("User")
    .with_policy(policy)
}

fn data(name: &str) -> Value {
  json!({"data": {"user": {"name": name}}})
}

fn seed(client: &SyncClient<MemoryStore>, request: &Request, name: &str) {
  let response = Response::from_data(json!({"user": {"name": name}}));
  client.cache().put(request, &response, None).unwrap();
}

fn name_of(response: &Response) -> &str {
  response.data.as_ref().unwrap()["user"]["name"].as_str().unwrap()
}

/// Poll until `check` passes or a second elapses.
async fn eventually(mut check: impl FnMut() -> bool) {
  for _ in 0..200 {
    if check() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(5)).await;
  }
  panic!("condition not reached");
}

#[tokio::test]
async fn test_cache_only_miss_never_touches_network() {
  let (client, http) = client_with(MockHttp::new().always(json_reply(data("net"))), Connectivity::online());

  let err = client.query(&user_query(CachePolicy::CacheOnly)).await.unwrap_err();
  assert!(matches!(err, SyncError::CacheMiss { .. }));
  assert_eq!(http.call_count(), 0);
}

#[tokio::test]
async fn test_cache_only_hit_without_transport_call() {
  let (client, http) = client_with(MockHttp::new(), Connectivity::online());
  let request = user_query(CachePolicy::CacheOnly);
  seed(&client, &request, "cached");

  let response = client.query(&request).await.unwrap();
  assert!(response.from_cache);
  assert_eq!(name_of(&response), "cached");
  assert_eq!(http.call_count(), 0);
}

#[tokio::test]
async fn test_cache_first_fetches_once_then_serves_cache() {
  let (client, http) = client_with(MockHttp::new().always(json_reply(data("net"))), Connectivity::online());
  let request = user_query(CachePolicy::CacheFirst);

  let first = client.query(&request).await.unwrap();
  assert!(!first.from_cache);
  assert_eq!(name_of(&first), "net");

  let second = client.query(&request).await.unwrap();
  assert!(second.from_cache);
  assert_eq!(http.call_count(), 1);
}

#[tokio::test]
async fn test_sub_second_ttl_still_serves_from_cache() {
  let http = Arc::new(MockHttp::new().always(json_reply(data("net"))));
  let client = SyncClient::<MemoryStore>::builder(config().with_cache_ttl(Some(Duration::from_millis(500))))
    .http_transport(http.clone())
    .in_memory()
    .unwrap();
  let request = user_query(CachePolicy::CacheFirst);

  client.query(&request).await.unwrap();
  let second = client.query(&request).await.unwrap();
  assert!(second.from_cache);
  assert_eq!(http.call_count(), 1);
}

#[tokio::test]
async fn test_network_only_always_fetches_and_still_writes_cache() {
  let http = MockHttp::new()
    .then(json_reply(data("one")))
    .then(json_reply(data("two")));
  let (client, http) = client_with(http, Connectivity::online());
  let request = user_query(CachePolicy::NetworkOnly);
  seed(&client, &request, "stale");

  assert_eq!(name_of(&client.query(&request).await.unwrap()), "one");
  assert_eq!(name_of(&client.query(&request).await.unwrap()), "two");
  assert_eq!(http.call_count(), 2);

  let cached = client.cache().get(&request).unwrap().unwrap();
  assert_eq!(name_of(&cached), "two");
}

#[tokio::test]
async fn test_network_first_falls_back_to_cache_on_transport_failure() {
  let (client, _http) = client_with(
    MockHttp::new().always(status_reply(503, json!({}))),
    Connectivity::online(),
  );
  let request = user_query(CachePolicy::NetworkFirst);

  let err = client.query(&request).await.unwrap_err();
  assert!(matches!(
    err,
    SyncError::Transport(TransportError::Status { status: 503, ref reason }) if reason == "Service Unavailable"
  ));
  assert!(err.is_retryable());

  seed(&client, &request, "cached");
  let response = client.query(&request).await.unwrap();
  assert!(response.from_cache);
  assert_eq!(name_of(&response), "cached");
}

#[tokio::test]
async fn test_network_first_timeout_is_a_transport_failure() {
  let (client, http) = client_with(
    MockHttp::new()
      .always(json_reply(data("late")))
      .with_delay(Duration::from_secs(5)),
    Connectivity::online(),
  );
  let request = user_query(CachePolicy::NetworkFirst);

  let err = client.query(&request).await.unwrap_err();
  assert!(matches!(err, SyncError::Transport(TransportError::Timeout(_))));

  seed(&client, &request, "cached");
  let response = client.query(&request).await.unwrap();
  assert_eq!(name_of(&response), "cached");
  assert_eq!(http.call_count(), 2);
}

#[tokio::test]
async fn test_network_first_prefers_fresh_network_data() {
  let (client, _http) = client_with(MockHttp::new().always(json_reply(data("net"))), Connectivity::online());
  let request = user_query(CachePolicy::NetworkFirst);
  seed(&client, &request, "cached");

  let response = client.query(&request).await.unwrap();
  assert!(!response.from_cache);
  assert_eq!(name_of(&response), "net");
}

#[tokio::test]
async fn test_graphql_errors_are_data_and_not_cached() {
  let body = json!({"data": null, "errors": [{"message": "forbidden", "path": ["user"]}]});
  let (client, _http) = client_with(MockHttp::new().always(json_reply(body)), Connectivity::online());
  let request = user_query(CachePolicy::CacheFirst);

  let response = client.query(&request).await.unwrap();
  assert!(!response.is_successful());
  assert_eq!(response.errors()[0].message, "forbidden");
  assert!(client.cache().get(&request).unwrap().is_none());
}

#[tokio::test]
async fn test_graphql_errors_do_not_trigger_network_first_fallback() {
  let body = json!({"errors": [{"message": "boom"}]});
  let (client, _http) = client_with(MockHttp::new().always(json_reply(body)), Connectivity::online());
  let request = user_query(CachePolicy::NetworkFirst);
  seed(&client, &request, "cached");

  let response = client.query(&request).await.unwrap();
  assert!(!response.from_cache);
  assert_eq!(response.errors()[0].message, "boom");
}

#[tokio::test]
async fn test_bad_status_and_body_are_transport_failures() {
  let http = MockHttp::new()
    .then(status_reply(404, json!({"data": {"x": 1}})))
    .then(Ok(crate::transport::HttpReply {
      status: 200,
      body: b"<html>".to_vec(),
    }));
  let (client, _http) = client_with(http, Connectivity::online());
  let request = user_query(CachePolicy::NetworkOnly);

  assert!(matches!(
    client.query(&request).await,
    Err(SyncError::Transport(TransportError::Status { status: 404, .. }))
  ));
  assert!(matches!(
    client.query(&request).await,
    Err(SyncError::Transport(TransportError::Decode(_)))
  ));
}

#[tokio::test]
async fn test_cache_and_network_returns_cache_then_refreshes_in_background() {
  let (client, http) = client_with(
    MockHttp::new()
      .always(json_reply(data("fresh")))
      .with_delay(Duration::from_millis(20)),
    Connectivity::online(),
  );
  let request = user_query(CachePolicy::CacheAndNetwork);
  seed(&client, &request, "stale");

  let response = client.query(&request).await.unwrap();
  assert!(response.from_cache);
  assert_eq!(name_of(&response), "stale");

  let cache = client.cache().clone();
  eventually(|| {
    cache
      .get(&request)
      .unwrap()
      .map(|r| name_of(&r) == "fresh")
      .unwrap_or(false)
  })
  .await;
  assert_eq!(http.call_count(), 1);
}

#[tokio::test]
async fn test_cache_and_network_background_failure_is_swallowed() {
  let (client, http) = client_with(
    MockHttp::new().always(Err(TransportError::Network("down".into()))),
    Connectivity::online(),
  );
  let request = user_query(CachePolicy::CacheAndNetwork);
  seed(&client, &request, "stale");

  let response = client.query(&request).await.unwrap();
  assert_eq!(name_of(&response), "stale");

  eventually(|| http.call_count() == 1).await;
  tokio::time::sleep(Duration::from_millis(10)).await;
  assert_eq!(name_of(&client.cache().get(&request).unwrap().unwrap()), "stale");
}

#[tokio::test]
async fn test_cache_and_network_miss_awaits_network_and_fetches_twice() {
  let (client, http) = client_with(MockHttp::new().always(json_reply(data("net"))), Connectivity::online());
  let request = user_query(CachePolicy::CacheAndNetwork);

  let response = client.query(&request).await.unwrap();
  assert!(!response.from_cache);
  assert_eq!(name_of(&response), "net");

  // Foreground fetch plus the detached refresh
  eventually(|| http.call_count() == 2).await;
}

#[tokio::test]
async fn test_cache_and_network_offline_branches() {
  let (client, http) = client_with(MockHttp::new(), Connectivity::offline());
  let request = user_query(CachePolicy::CacheAndNetwork);

  assert!(matches!(
    client.query(&request).await,
    Err(SyncError::NoDataAvailable)
  ));

  let persisted = request.clone().persist_offline(true);
  let err = client.query(&persisted).await.unwrap_err();
  assert!(err.is_offline_queued());
  assert_eq!(client.queue_stats().unwrap().pending, 1);

  seed(&client, &request, "cached");
  let response = client.query(&request).await.unwrap();
  assert_eq!(name_of(&response), "cached");
  assert_eq!(http.call_count(), 0);
}

#[tokio::test]
async fn test_offline_network_path_queues_or_fails() {
  let (client, http) = client_with(MockHttp::new(), Connectivity::offline());

  let plain = user_query(CachePolicy::NetworkOnly);
  assert!(matches!(
    client.query(&plain).await,
    Err(SyncError::NoDataAvailable)
  ));

  let persisted = user_query(CachePolicy::CacheFirst).persist_offline(true);
  match client.query(&persisted).await {
    Err(SyncError::OfflineQueued { fingerprint: fp }) => assert_eq!(fp, fingerprint(&persisted)),
    other => panic!("expected OfflineQueued, got {other:?}"),
  }
  assert_eq!(client.pending_requests().unwrap()[0].kind, OperationKind::Query);
  assert_eq!(http.call_count(), 0);
}

#[tokio::test]
async fn test_mutation_invalidates_cache_on_success_and_on_graphql_error() {
  let http = MockHttp::new()
    .then(json_reply(json!({"data": {"rename": true}})))
    .then(json_reply(json!({"errors": [{"message": "conflict"}]})));
  let (client, _http) = client_with(http, Connectivity::online());
  let cached = user_query(CachePolicy::CacheFirst);
  let mutation = Request::mutation("mutation { rename }");

  seed(&client, &cached, "old");
  let response = client.mutate(&mutation).await.unwrap();
  assert!(response.is_successful());
  assert!(client.cache().get(&cached).unwrap().is_none());

  seed(&client, &cached, "old");
  let response = client.mutate(&mutation).await.unwrap();
  assert!(!response.is_successful());
  assert!(client.cache().get(&cached).unwrap().is_none());
}

#[tokio::test]
async fn test_mutation_transport_failure_keeps_cache() {
  let (client, _http) = client_with(
    MockHttp::new().always(Err(TransportError::Network("down".into()))),
    Connectivity::online(),
  );
  let cached = user_query(CachePolicy::CacheFirst);
  seed(&client, &cached, "old");

  assert!(client.mutate(&Request::mutation("mutation { x }")).await.is_err());
  assert!(client.cache().get(&cached).unwrap().is_some());
}

#[tokio::test]
async fn test_mutation_never_served_from_cache() {
  let (client, http) = client_with(
    MockHttp::new().always(json_reply(json!({"data": {"ok": true}}))),
    Connectivity::online(),
  );
  let mutation = Request::mutation("mutation { ok }").with_policy(CachePolicy::CacheOnly);
  seed(&client, &mutation, "cached");

  let response = client.mutate(&mutation).await.unwrap();
  assert!(!response.from_cache);
  assert_eq!(http.call_count(), 1);
}

#[tokio::test]
async fn test_offline_mutation_is_queued_and_replayed() {
  let connectivity = Connectivity::offline();
  let (client, http) = client_with(
    MockHttp::new().always(json_reply(json!({"data": {"like": true}}))),
    connectivity.clone(),
  );
  let mutation = Request::new("mutation { like }").persist_offline(true);

  let err = client.mutate(&mutation).await.unwrap_err();
  assert!(err.is_offline_queued());
  assert_eq!(client.pending_requests().unwrap()[0].kind, OperationKind::Mutation);

  // Nothing happens while still offline
  assert_eq!(client.drain_offline_queue().await, DrainReport::default());

  connectivity.set_online(true);
  let cached = user_query(CachePolicy::CacheFirst);
  seed(&client, &cached, "old");

  let report = client.drain_offline_queue().await;
  assert_eq!(report.succeeded, 1);
  assert_eq!(client.queue_stats().unwrap().pending, 0);
  assert_eq!(http.call_count(), 1);
  // Replayed mutations invalidate like live ones
  assert!(client.cache().get(&cached).unwrap().is_none());
}

#[tokio::test]
async fn test_replayed_query_populates_cache() {
  let connectivity = Connectivity::offline();
  let (client, _http) = client_with(MockHttp::new().always(json_reply(data("net"))), connectivity.clone());
  let request = user_query(CachePolicy::CacheFirst).persist_offline(true);
  assert!(client.query(&request).await.unwrap_err().is_offline_queued());

  connectivity.set_online(true);
  client.drain_offline_queue().await;
  let cached = client.cache().get(&request).unwrap().unwrap();
  assert_eq!(name_of(&cached), "net");
}

#[tokio::test]
async fn test_replay_on_reconnect() {
  let connectivity = Connectivity::offline();
  let (client, http) = client_with(
    MockHttp::new().always(json_reply(json!({"data": {"ok": true}}))),
    connectivity.clone(),
  );
  for i in 0..3 {
    let mutation = Request::mutation(format!("mutation {{ step{i} }}")).persist_offline(true);
    assert!(client.mutate(&mutation).await.unwrap_err().is_offline_queued());
  }

  let watcher = client.spawn_replay_on_reconnect();
  connectivity.set_online(true);
  eventually(|| client.queue_stats().unwrap().pending == 0).await;
  watcher.abort();

  let order: Vec<String> = http
    .calls()
    .into_iter()
    .map(|c| c.body["query"].as_str().unwrap().to_string())
    .collect();
  assert_eq!(
    order,
    vec!["mutation { step0 }", "mutation { step1 }", "mutation { step2 }"]
  );
}

#[tokio::test]
async fn test_wire_format_and_headers() {
  let http = Arc::new(MockHttp::new().always(json_reply(data("net"))));
  let client = SyncClient::<MemoryStore>::builder(
    config()
      .with_header("Authorization", "Bearer t")
      .with_header("content-type", "application/json; charset=utf-8"),
  )
  .http_transport(http.clone())
  .in_memory()
  .unwrap();

  client.query(&user_query(CachePolicy::NetworkOnly)).await.unwrap();
  let call = &http.calls()[0];
  assert_eq!(call.url, ENDPOINT);
  assert_eq!(call.timeout, Duration::from_millis(200));
  assert_eq!(
    call.body,
    json!({
      "query": "query User($id: ID!) { user(id: $id) { name } }",
      "variables": {"id": "1"},
      "operationName": "User"
    })
  );

  let header = |name: &str| {
    call
      .headers
      .iter()
      .filter(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.clone())
      .collect::<Vec<_>>()
  };
  assert_eq!(header("accept"), vec!["application/json"]);
  assert_eq!(header("content-type"), vec!["application/json; charset=utf-8"]);
  assert_eq!(header("authorization"), vec!["Bearer t"]);
}

#[tokio::test]
async fn test_subscribe_connects_lazily_to_derived_endpoint() {
  let (connector, mut sockets) = MockWsConnector::new();
  let connector = Arc::new(connector);
  let client = SyncClient::<MemoryStore>::builder(config().with_header("Authorization", "Bearer t"))
    .http_transport(Arc::new(MockHttp::new()))
    .ws_connector(connector.clone())
    .in_memory()
    .unwrap();
  assert!(!client.subscriptions().is_connected());

  let subscription = Request::new("subscription { ticks }");
  let mut first = client.subscribe(&subscription).await.unwrap();
  let mut second = client.subscribe(&subscription).await.unwrap();
  assert_eq!(connector.connect_count(), 1);
  assert_eq!(
    client.subscriptions().current_endpoint().as_deref(),
    Some("wss://api.example.com/graphql")
  );

  let mut socket = sockets.recv().await.unwrap();
  let init = socket.next_sent().await;
  assert_eq!(init["type"], "connection_init");
  assert_eq!(init["payload"]["headers"]["Authorization"], "Bearer t");

  socket.push(json!({"type": "data", "id": second.id(), "payload": {"data": {"tick": 2}}}));
  socket.push(json!({"type": "data", "id": first.id(), "payload": {"data": {"tick": 1}}}));
  assert_eq!(first.next().await.unwrap().unwrap().data, Some(json!({"tick": 1})));
  assert_eq!(second.next().await.unwrap().unwrap().data, Some(json!({"tick": 2})));

  assert!(client.unsubscribe(first.id()));
  assert_eq!(client.subscriptions().active_subscription_count(), 1);
  assert_eq!(client.metrics().subscriptions, 2);
}

#[tokio::test]
async fn test_concurrent_first_subscribes_share_the_lazy_connection() {
  let (connector, mut sockets) = MockWsConnector::new();
  let connector = Arc::new(connector.with_connect_delay(Duration::from_millis(20)));
  let client = SyncClient::<MemoryStore>::builder(config())
    .http_transport(Arc::new(MockHttp::new()))
    .ws_connector(connector.clone())
    .in_memory()
    .unwrap();

  let subscription = Request::new("subscription { ticks }");
  let (a, b) = tokio::join!(client.subscribe(&subscription), client.subscribe(&subscription));
  let (a, b) = (a.unwrap(), b.unwrap());
  assert_ne!(a.id(), b.id());
  assert_eq!(connector.connect_count(), 1);
  assert_eq!(client.subscriptions().active_subscription_count(), 2);

  let mut socket = sockets.recv().await.unwrap();
  assert_eq!(socket.next_sent().await["type"], "connection_init");
  assert_eq!(socket.next_sent().await["type"], "start");
  assert_eq!(socket.next_sent().await["type"], "start");
}

#[tokio::test]
async fn test_concurrent_cache_first_misses_are_not_coalesced() {
  // Known limitation: identical in-flight requests each hit the network.
  let (client, http) = client_with(
    MockHttp::new()
      .always(json_reply(data("net")))
      .with_delay(Duration::from_millis(20)),
    Connectivity::online(),
  );
  let request = user_query(CachePolicy::CacheFirst);

  let (a, b) = tokio::join!(client.query(&request), client.query(&request));
  assert!(a.is_ok() && b.is_ok());
  assert_eq!(http.call_count(), 2);
}

#[tokio::test]
async fn test_metrics_track_outcomes() {
  let http = MockHttp::new()
    .then(json_reply(data("net")))
    .then(json_reply(json!({"errors": [{"message": "x"}]})));
  let (client, _http) = client_with(http, Connectivity::online());
  let request = user_query(CachePolicy::CacheFirst);

  client.query(&request).await.unwrap();
  client.query(&request).await.unwrap();
  client.mutate(&Request::mutation("mutation { x }")).await.unwrap();
  let _ = client.query(&user_query(CachePolicy::CacheOnly)).await;

  let snapshot = client.metrics();
  assert_eq!(snapshot.requests, 4);
  assert_eq!(snapshot.queries, 3);
  assert_eq!(snapshot.mutations, 1);
  assert_eq!(snapshot.cache_hits, 1);
  assert_eq!(snapshot.cache_misses, 2);
  assert_eq!(snapshot.successes, 2);
  assert_eq!(snapshot.failures, 2);
  assert_eq!(snapshot.error_rate, 0.5);
  assert!(snapshot.p50.is_some());

  client.reset_metrics();
  assert_eq!(client.metrics(), MetricsSnapshot::default());
}

#[test]
fn test_builder_rejects_non_http_endpoint() {
  let result = SyncClient::<MemoryStore>::builder(Config::new("ftp://example.com/graphql"))
    .http_transport(Arc::new(MockHttp::new()))
    .in_memory();
  assert!(matches!(
    result,
    Err(SyncError::Transport(TransportError::InvalidEndpoint(_)))
  ));
}

#[test]
fn test_open_sqlite_client_persists_queue() {
  let path = std::env::temp_dir().join(format!(
    "gqlsync-client-{}-{}.db",
    std::process::id(),
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
  ));
  let mut config = config();
  config.database_path = Some(path.clone());

  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
    .unwrap();
  runtime.block_on(async {
    let client = SyncClient::<SqliteStore>::builder(config.clone())
      .http_transport(Arc::new(MockHttp::new()))
      .connectivity(Connectivity::offline())
      .open()
      .unwrap();
    let mutation = Request::mutation("mutation { a }").persist_offline(true);
    assert!(client.mutate(&mutation).await.unwrap_err().is_offline_queued());
  });

  let reopened = SyncClient::<SqliteStore>::builder(config)
    .http_transport(Arc::new(MockHttp::new()))
    .open()
    .unwrap();
  assert_eq!(reopened.queue_stats().unwrap().pending, 1);
  drop(reopened);
  let _ = std::fs::remove_file(&path);
}
