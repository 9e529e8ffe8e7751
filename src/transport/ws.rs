use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::error::TransportError;

/// An open text-frame connection.
///
/// Dropping `outbound` closes the socket; `inbound` ends when the peer
/// closes and yields an error if the connection fails.
pub struct WsConnection {
  pub outbound: mpsc::UnboundedSender<String>,
  pub inbound: BoxStream<'static, Result<String, TransportError>>,
}

#[async_trait]
pub trait WsConnector: Send + Sync {
  async fn connect(&self, endpoint: &str) -> Result<WsConnection, TransportError>;
}

/// `WsConnector` speaking the `graphql-ws` subprotocol over tokio-tungstenite.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
  async fn connect(&self, endpoint: &str) -> Result<WsConnection, TransportError> {
    let mut request = endpoint
      .into_client_request()
      .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
    request
      .headers_mut()
      .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("graphql-ws"));

    let (socket, _) = tokio_tungstenite::connect_async(request)
      .await
      .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    let (mut sink, stream) = socket.split();

    let (outbound, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
      while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(Message::Text(text)).await {
          debug!(error = %e, "websocket write failed");
          break;
        }
      }
      let _ = sink.close().await;
    });

    let inbound = stream
      .filter_map(|message| async move {
        match message {
          Ok(Message::Text(text)) => Some(Ok(text)),
          Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
          Ok(_) => None,
          Err(e) => Some(Err(TransportError::WebSocket(e.to_string()))),
        }
      })
      .boxed();

    Ok(WsConnection { outbound, inbound })
  }
}

/// Derive the subscription endpoint from the HTTP endpoint.
pub fn ws_endpoint(http_endpoint: &str) -> Result<String, TransportError> {
  let mut url = Url::parse(http_endpoint)
    .map_err(|e| TransportError::InvalidEndpoint(format!("{http_endpoint}: {e}")))?;

  let scheme = match url.scheme() {
    "https" => "wss",
    "http" => "ws",
    other => {
      return Err(TransportError::InvalidEndpoint(format!(
        "unsupported scheme '{other}' in {http_endpoint}"
      )))
    }
  };

  url
    .set_scheme(scheme)
    .map_err(|_| TransportError::InvalidEndpoint(http_endpoint.to_string()))?;
  Ok(url.to_string())
}
