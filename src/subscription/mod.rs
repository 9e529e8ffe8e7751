//! Multiplexed GraphQL subscriptions over one WebSocket connection.
//!
//! Connection lifecycle: `Disconnected -> Connecting -> Connected`, back to
//! `Disconnected` on transport error, peer close or [`disconnect`]. Each
//! subscription goes `Pending` (start sent) -> `Active` (first data) and is
//! removed on `complete`, [`unsubscribe`] or teardown.
//!
//! There is no automatic reconnection; callers re-run `connect` and
//! `subscribe` after a `ConnectionLost`.
//!
//! [`disconnect`]: SubscriptionTransport::disconnect
//! [`unsubscribe`]: SubscriptionTransport::unsubscribe

mod protocol;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use protocol::{ClientMessage, ServerMessage};

use crate::error::{SyncError, TransportError};
use crate::transport::{WsConnection, WsConnector};
use crate::types::{Request, Response};

type Output = Result<Response, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
  Disconnected,
  Connecting,
  Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
  /// Start sent, nothing received yet.
  Pending,
  /// At least one data message delivered.
  Active,
}

struct Slot {
  request: Request,
  status: SubscriptionStatus,
  tx: mpsc::UnboundedSender<Output>,
}

struct ConnectionState {
  phase: ConnectionPhase,
  endpoint: Option<String>,
  outbound: Option<mpsc::UnboundedSender<String>>,
  subscriptions: HashMap<String, Slot>,
  next_id: u64,
  /// Bumped on every connect/disconnect so stale reader tasks go inert.
  generation: u64,
  acknowledged: bool,
  last_keep_alive: Option<Instant>,
  reader: Option<JoinHandle<()>>,
}

impl ConnectionState {
  fn new() -> Self {
    Self {
      phase: ConnectionPhase::Disconnected,
      endpoint: None,
      outbound: None,
      subscriptions: HashMap::new(),
      next_id: 0,
      generation: 0,
      acknowledged: false,
      last_keep_alive: None,
      reader: None,
    }
  }

  /// Drop the connection and terminate every subscription with
  /// `ConnectionLost`.
  fn teardown(&mut self) {
    for (id, slot) in self.subscriptions.drain() {
      debug!(%id, "terminating subscription");
      let _ = slot.tx.send(Err(SyncError::ConnectionLost));
    }
    self.outbound = None;
    self.acknowledged = false;
    self.phase = ConnectionPhase::Disconnected;
    if let Some(reader) = self.reader.take() {
      reader.abort();
    }
  }

  fn send(&self, message: &ClientMessage) -> bool {
    match &self.outbound {
      Some(outbound) => outbound.send(message.to_text()).is_ok(),
      None => false,
    }
  }

  /// Handle one inbound frame. Runs under the state lock and never blocks:
  /// subscription outputs are unbounded.
  fn dispatch(&mut self, text: &str) {
    let message: ServerMessage = match serde_json::from_str(text) {
      Ok(message) => message,
      Err(e) => {
        debug!(error = %e, "ignoring malformed subscription message");
        return;
      }
    };

    match message {
      ServerMessage::ConnectionAck => {
        self.acknowledged = true;
        debug!("connection acknowledged");
      }
      ServerMessage::KeepAlive => {
        self.last_keep_alive = Some(Instant::now());
      }
      ServerMessage::Data { id, payload } => {
        if let Some(slot) = self.subscriptions.get_mut(&id) {
          slot.status = SubscriptionStatus::Active;
          self.deliver(&id, Ok(Response::from(payload)));
        } else {
          debug!(%id, "data for unknown subscription");
        }
      }
      ServerMessage::Error { id, payload } => {
        self.deliver(&id, Ok(protocol::error_response(payload)));
      }
      ServerMessage::Complete { id } => {
        if self.subscriptions.remove(&id).is_some() {
          debug!(%id, "subscription completed");
        }
      }
      ServerMessage::Unknown => {}
    }
  }

  /// Push to a subscription's output. If the consumer went away, forget
  /// the subscription and tell the server to stop.
  fn deliver(&mut self, id: &str, item: Output) {
    let Some(slot) = self.subscriptions.get(id) else {
      return;
    };
    if slot.tx.send(item).is_err() {
      debug!(%id, "subscriber dropped, stopping");
      self.subscriptions.remove(id);
      self.send(&ClientMessage::Stop { id: id.to_string() });
    }
  }
}

/// Owns the WebSocket connection and all active subscriptions on it.
#[derive(Clone)]
pub struct SubscriptionTransport {
  connector: Arc<dyn WsConnector>,
  init_payload: Option<Value>,
  state: Arc<Mutex<ConnectionState>>,
  /// Held for the whole of `connect`, including the connector await.
  connecting: Arc<AsyncMutex<()>>,
}

impl SubscriptionTransport {
  pub fn new(connector: Arc<dyn WsConnector>) -> Self {
    Self {
      connector,
      init_payload: None,
      state: Arc::new(Mutex::new(ConnectionState::new())),
      connecting: Arc::new(AsyncMutex::new(())),
    }
  }

  /// Payload sent with `connection_init` (e.g. auth parameters).
  pub fn with_init_payload(mut self, payload: Value) -> Self {
    self.init_payload = Some(payload);
    self
  }

  fn lock(&self) -> MutexGuard<'_, ConnectionState> {
    // A panic while holding the lock leaves the state structurally intact
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Open a connection to `endpoint`.
  ///
  /// No-op if already connected there; otherwise any existing connection
  /// is torn down first. Concurrent calls are serialized, so a caller
  /// arriving while a connect to the same endpoint is in flight waits for
  /// it and then returns without reconnecting. Returns once
  /// `connection_init` is sent, without waiting for the server's
  /// acknowledgment.
  pub async fn connect(&self, endpoint: &str) -> Result<(), SyncError> {
    let _connecting = self.connecting.lock().await;
    let generation = {
      let mut state = self.lock();
      if state.phase == ConnectionPhase::Connected && state.endpoint.as_deref() == Some(endpoint) {
        return Ok(());
      }
      state.teardown();
      state.generation += 1;
      state.phase = ConnectionPhase::Connecting;
      state.endpoint = Some(endpoint.to_string());
      state.generation
    };

    debug!(endpoint, "connecting subscription transport");
    let connection = self.connector.connect(endpoint).await;

    let mut state = self.lock();
    if state.generation != generation {
      // Another connect or a disconnect won the race
      return Err(SyncError::ConnectionLost);
    }

    let WsConnection { outbound, inbound } = match connection {
      Ok(connection) => connection,
      Err(e) => {
        warn!(endpoint, error = %e, "subscription connect failed");
        state.phase = ConnectionPhase::Disconnected;
        state.endpoint = None;
        return Err(e.into());
      }
    };

    state.outbound = Some(outbound);
    let init = ClientMessage::ConnectionInit {
      payload: self.init_payload.clone(),
    };
    if !state.send(&init) {
      state.teardown();
      state.endpoint = None;
      return Err(TransportError::WebSocket("connection closed during init".into()).into());
    }

    state.phase = ConnectionPhase::Connected;
    state.acknowledged = false;
    state.last_keep_alive = None;
    state.reader = Some(tokio::spawn(read_loop(
      Arc::clone(&self.state),
      generation,
      inbound,
    )));
    info!(endpoint, "subscription transport connected");
    Ok(())
  }

  /// Start a subscription on the current connection.
  pub fn subscribe(&self, request: &Request) -> Result<SubscriptionHandle, SyncError> {
    let mut state = self.lock();
    if state.phase != ConnectionPhase::Connected {
      return Err(SyncError::NotConnected);
    }

    state.next_id += 1;
    let id = state.next_id.to_string();
    let start = ClientMessage::Start {
      id: id.clone(),
      payload: request.payload(),
    };
    if !state.send(&start) {
      state.teardown();
      return Err(SyncError::ConnectionLost);
    }

    let (tx, rx) = mpsc::unbounded_channel();
    state.subscriptions.insert(
      id.clone(),
      Slot {
        request: request.clone(),
        status: SubscriptionStatus::Pending,
        tx,
      },
    );
    debug!(%id, "subscription started");

    Ok(SubscriptionHandle {
      id,
      request: request.clone(),
      rx,
    })
  }

  /// Stop a subscription. Local removal always happens; the `stop`
  /// message is best effort. Returns whether the id was active.
  pub fn unsubscribe(&self, id: &str) -> bool {
    let mut state = self.lock();
    let removed = state.subscriptions.remove(id).is_some();
    if state.phase == ConnectionPhase::Connected
      && !state.send(&ClientMessage::Stop { id: id.to_string() })
    {
      debug!(%id, "stop message could not be sent");
    }
    removed
  }

  /// Close the connection, terminating all subscriptions.
  pub fn disconnect(&self) {
    let mut state = self.lock();
    state.generation += 1;
    state.teardown();
    state.endpoint = None;
    info!("subscription transport disconnected");
  }

  pub fn active_subscription_count(&self) -> usize {
    self.lock().subscriptions.len()
  }

  pub fn is_connected(&self) -> bool {
    self.lock().phase == ConnectionPhase::Connected
  }

  pub fn current_endpoint(&self) -> Option<String> {
    self.lock().endpoint.clone()
  }

  pub fn phase(&self) -> ConnectionPhase {
    self.lock().phase
  }

  /// Whether the server has sent `connection_ack` on this connection.
  pub fn is_acknowledged(&self) -> bool {
    self.lock().acknowledged
  }

  pub fn last_keep_alive(&self) -> Option<Instant> {
    self.lock().last_keep_alive
  }

  pub fn subscription_status(&self, id: &str) -> Option<SubscriptionStatus> {
    self.lock().subscriptions.get(id).map(|slot| slot.status)
  }

  /// Requests of all active subscriptions, keyed by id.
  pub fn active_requests(&self) -> Vec<(String, Request)> {
    self
      .lock()
      .subscriptions
      .iter()
      .map(|(id, slot)| (id.clone(), slot.request.clone()))
      .collect()
  }
}

/// Processes one connection's inbound frames strictly in arrival order.
async fn read_loop(
  state: Arc<Mutex<ConnectionState>>,
  generation: u64,
  mut inbound: BoxStream<'static, Result<String, TransportError>>,
) {
  let failure = loop {
    match inbound.next().await {
      Some(Ok(text)) => {
        let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
        if guard.generation != generation {
          return;
        }
        guard.dispatch(&text);
      }
      Some(Err(e)) => break Some(e),
      None => break None,
    }
  };

  let mut guard = state.lock().unwrap_or_else(|e| e.into_inner());
  if guard.generation != generation {
    return;
  }
  match failure {
    Some(e) => warn!(error = %e, "subscription connection failed"),
    None => info!("subscription connection closed by peer"),
  }
  // Detach our own handle so teardown does not abort this task
  guard.reader.take();
  guard.teardown();
}

/// One active subscription: its id, the originating request and the stream
/// of responses addressed to it.
///
/// The stream ends after `complete` or `unsubscribe`; on connection loss
/// it yields a final `Err(SyncError::ConnectionLost)`.
pub struct SubscriptionHandle {
  id: String,
  request: Request,
  rx: mpsc::UnboundedReceiver<Output>,
}

impl SubscriptionHandle {
  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn request(&self) -> &Request {
    &self.request
  }
}

impl Stream for SubscriptionHandle {
  type Item = Output;

  fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
    self.rx.poll_recv(cx)
  }
}
