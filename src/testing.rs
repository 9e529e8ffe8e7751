//! Scripted transports for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{HttpReply, HttpTransport, WsConnection, WsConnector};

/// A 200 reply carrying `body` as JSON.
pub fn json_reply(body: Value) -> Result<HttpReply, TransportError> {
  status_reply(200, body)
}

pub fn status_reply(status: u16, body: Value) -> Result<HttpReply, TransportError> {
  Ok(HttpReply {
    status,
    body: serde_json::to_vec(&body).unwrap(),
  })
}

/// One recorded POST.
#[derive(Debug, Clone)]
pub struct RecordedCall {
  pub url: String,
  pub headers: Vec<(String, String)>,
  pub body: Value,
  pub timeout: Duration,
}

/// HTTP transport that answers from a script.
///
/// Scripted replies are consumed in order; once exhausted every call gets
/// the fallback reply (a network error unless set).
pub struct MockHttp {
  script: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
  fallback: Mutex<Result<HttpReply, TransportError>>,
  calls: Mutex<Vec<RecordedCall>>,
  delay: Mutex<Option<Duration>>,
}

impl MockHttp {
  pub fn new() -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback: Mutex::new(Err(TransportError::Network("no scripted reply".into()))),
      calls: Mutex::new(Vec::new()),
      delay: Mutex::new(None),
    }
  }

  pub fn then(self, reply: Result<HttpReply, TransportError>) -> Self {
    self.script.lock().unwrap().push_back(reply);
    self
  }

  pub fn always(self, reply: Result<HttpReply, TransportError>) -> Self {
    *self.fallback.lock().unwrap() = reply;
    self
  }

  pub fn with_delay(self, delay: Duration) -> Self {
    *self.delay.lock().unwrap() = Some(delay);
    self
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn calls(&self) -> Vec<RecordedCall> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl HttpTransport for MockHttp {
  async fn post(
    &self,
    url: &str,
    headers: &[(String, String)],
    body: Vec<u8>,
    timeout: Duration,
  ) -> Result<HttpReply, TransportError> {
    self.calls.lock().unwrap().push(RecordedCall {
      url: url.to_string(),
      headers: headers.to_vec(),
      body: serde_json::from_slice(&body).unwrap_or(Value::Null),
      timeout,
    });

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    let scripted = self.script.lock().unwrap().pop_front();
    scripted.unwrap_or_else(|| self.fallback.lock().unwrap().clone())
  }
}

/// Server side of one mock WebSocket connection.
pub struct MockSocket {
  /// Frames the client sent.
  pub sent: mpsc::UnboundedReceiver<String>,
  push: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl MockSocket {
  /// Next frame sent by the client, parsed as JSON.
  pub async fn next_sent(&mut self) -> Value {
    let text = self.sent.recv().await.expect("client closed the socket");
    serde_json::from_str(&text).unwrap()
  }

  pub fn push(&self, message: Value) {
    self.push_raw(&message.to_string());
  }

  pub fn push_raw(&self, text: &str) {
    let _ = self.push.send(Ok(text.to_string()));
  }

  /// Fail the connection with a transport error.
  pub fn fail(&self, reason: &str) {
    let _ = self
      .push
      .send(Err(TransportError::WebSocket(reason.to_string())));
  }
}

pub struct MockWsConnector {
  sockets: mpsc::UnboundedSender<MockSocket>,
  connects: AtomicUsize,
  fail_next: AtomicBool,
  delay: Option<Duration>,
}

impl MockWsConnector {
  /// The receiver yields the server side of every accepted connection.
  pub fn new() -> (Self, mpsc::UnboundedReceiver<MockSocket>) {
    let (sockets, rx) = mpsc::unbounded_channel();
    (
      Self {
        sockets,
        connects: AtomicUsize::new(0),
        fail_next: AtomicBool::new(false),
        delay: None,
      },
      rx,
    )
  }

  /// Sleep this long inside every `connect` before answering.
  pub fn with_connect_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  pub fn fail_next_connect(&self) {
    self.fail_next.store(true, Ordering::SeqCst);
  }

  pub fn connect_count(&self) -> usize {
    self.connects.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl WsConnector for MockWsConnector {
  async fn connect(&self, _endpoint: &str) -> Result<WsConnection, TransportError> {
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.fail_next.swap(false, Ordering::SeqCst) {
      return Err(TransportError::WebSocket("connection refused".into()));
    }
    self.connects.fetch_add(1, Ordering::SeqCst);

    let (outbound, sent) = mpsc::unbounded_channel();
    let (push, incoming) = mpsc::unbounded_channel();
    let _ = self.sockets.send(MockSocket { sent, push });

    let inbound = futures::stream::unfold(incoming, |mut rx| async move {
      rx.recv().await.map(|item| (item, rx))
    })
    .boxed();

    Ok(WsConnection { outbound, inbound })
  }
}
