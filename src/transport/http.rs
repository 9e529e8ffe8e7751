use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;

use crate::error::TransportError;

/// Raw status and body of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
  pub status: u16,
  pub body: Vec<u8>,
}

/// Sends one POST and returns whatever the server answered.
///
/// Implementations report connection problems and timeouts as
/// `TransportError`; status interpretation is left to the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
  async fn post(
    &self,
    url: &str,
    headers: &[(String, String)],
    body: Vec<u8>,
    timeout: Duration,
  ) -> Result<HttpReply, TransportError>;
}

/// `HttpTransport` backed by a shared `reqwest::Client`.
#[derive(Clone, Default)]
pub struct ReqwestTransport {
  client: Client,
}

impl ReqwestTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_client(client: Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn post(
    &self,
    url: &str,
    headers: &[(String, String)],
    body: Vec<u8>,
    timeout: Duration,
  ) -> Result<HttpReply, TransportError> {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| TransportError::Network(format!("invalid header name {name}: {e}")))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| TransportError::Network(format!("invalid header value for {name}: {e}")))?;
      header_map.insert(name, value);
    }

    let response = self
      .client
      .post(url)
      .headers(header_map)
      .body(body)
      .timeout(timeout)
      .send()
      .await
      .map_err(|e| classify(e, timeout))?;

    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| classify(e, timeout))?
      .to_vec();

    Ok(HttpReply { status, body })
  }
}

fn classify(error: reqwest::Error, timeout: Duration) -> TransportError {
  if error.is_timeout() {
    TransportError::Timeout(timeout)
  } else {
    TransportError::Network(error.to_string())
  }
}

/// Fixed GraphQL headers followed by the caller's defaults.
///
/// Header names compare case-insensitively; a caller header with the same
/// name as a fixed one replaces it, any other caller header is appended.
pub fn merge_headers<'a, I>(defaults: I) -> Vec<(String, String)>
where
  I: IntoIterator<Item = (&'a String, &'a String)>,
{
  let mut merged = vec![
    ("Content-Type".to_string(), "application/json".to_string()),
    ("Accept".to_string(), "application/json".to_string()),
  ];

  for (name, value) in defaults {
    merged.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    merged.push((name.clone(), value.clone()));
  }

  merged
}
