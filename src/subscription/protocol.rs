//! Control messages of the `graphql-ws` subscription protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{GraphQLError, OperationPayload, Response, ResultPayload};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
  ConnectionInit {
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
  },
  Start {
    id: String,
    payload: OperationPayload,
  },
  Stop {
    id: String,
  },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
  ConnectionAck,
  Data {
    id: String,
    #[serde(default)]
    payload: ResultPayload,
  },
  Error {
    id: String,
    #[serde(default)]
    payload: Value,
  },
  Complete {
    id: String,
  },
  #[serde(rename = "ka")]
  KeepAlive,
  #[serde(other)]
  Unknown,
}

impl ClientMessage {
  pub fn to_text(&self) -> String {
    // Plain strings and JSON values always serialize
    serde_json::to_string(self).unwrap_or_default()
  }
}

/// Build the error-only response for an `error` message.
///
/// The payload may be a single error object, a list of them, or something
/// else entirely; anything unrecognised becomes one generic error.
pub fn error_response(payload: Value) -> Response {
  let errors = match payload {
    Value::Array(items) => items
      .into_iter()
      .map(|item| {
        serde_json::from_value::<GraphQLError>(item.clone())
          .unwrap_or_else(|_| GraphQLError::new(item.to_string()))
      })
      .collect(),
    Value::Object(ref map) if map.contains_key("message") => {
      vec![serde_json::from_value::<GraphQLError>(payload.clone())
        .unwrap_or_else(|_| GraphQLError::new(payload.to_string()))]
    }
    Value::Object(ref map) if map.contains_key("errors") => {
      serde_json::from_value::<Vec<GraphQLError>>(map["errors"].clone())
        .unwrap_or_else(|_| vec![GraphQLError::new(payload.to_string())])
    }
    Value::String(message) => vec![GraphQLError::new(message)],
    other => vec![GraphQLError::new(format!("subscription error: {other}"))],
  };

  let errors = if errors.is_empty() {
    vec![GraphQLError::new("subscription error")]
  } else {
    errors
  };
  Response::from_errors(errors)
}
