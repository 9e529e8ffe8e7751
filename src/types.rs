//! Request and response values exchanged with the GraphQL endpoint.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Variables keyed in sorted order so that serialization is canonical.
pub type Variables = BTreeMap<String, Value>;

/// How a query balances the local cache against the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CachePolicy {
  #[default]
  CacheFirst,
  NetworkFirst,
  CacheOnly,
  NetworkOnly,
  CacheAndNetwork,
}

impl CachePolicy {
  pub fn as_str(&self) -> &'static str {
    match self {
      CachePolicy::CacheFirst => "cache-first",
      CachePolicy::NetworkFirst => "network-first",
      CachePolicy::CacheOnly => "cache-only",
      CachePolicy::NetworkOnly => "network-only",
      CachePolicy::CacheAndNetwork => "cache-and-network",
    }
  }
}

impl fmt::Display for CachePolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown cache policy '{0}'")]
pub struct ParsePolicyError(String);

impl FromStr for CachePolicy {
  type Err = ParsePolicyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().replace('_', "-").as_str() {
      "cache-first" => Ok(CachePolicy::CacheFirst),
      "network-first" => Ok(CachePolicy::NetworkFirst),
      "cache-only" => Ok(CachePolicy::CacheOnly),
      "network-only" => Ok(CachePolicy::NetworkOnly),
      "cache-and-network" => Ok(CachePolicy::CacheAndNetwork),
      _ => Err(ParsePolicyError(s.to_string())),
    }
  }
}

/// Whether a queued request is replayed as a query or as a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  #[default]
  Query,
  Mutation,
}

/// An immutable GraphQL request.
///
/// Identity for caching and queueing is the fingerprint of
/// `(query, variables, operation_name)`; the policy, persistence flag and
/// operation kind are dispatch-time concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub query: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub variables: Option<Variables>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub operation_name: Option<String>,
  #[serde(default)]
  pub policy: CachePolicy,
  #[serde(default)]
  pub persist_offline: bool,
  #[serde(default)]
  pub kind: OperationKind,
}

impl Request {
  /// Create a query request with the default `CacheFirst` policy.
  pub fn new(query: impl Into<String>) -> Self {
    Self {
      query: query.into(),
      variables: None,
      operation_name: None,
      policy: CachePolicy::default(),
      persist_offline: false,
      kind: OperationKind::Query,
    }
  }

  /// Create a mutation request. Mutations bypass cache policies entirely.
  pub fn mutation(query: impl Into<String>) -> Self {
    Self {
      kind: OperationKind::Mutation,
      ..Self::new(query)
    }
  }

  pub fn with_variables(mut self, variables: Variables) -> Self {
    self.variables = Some(variables);
    self
  }

  /// Add a single variable, creating the map if needed.
  pub fn variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self
      .variables
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), value.into());
    self
  }

  pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
    self.operation_name = Some(name.into());
    self
  }

  pub fn with_policy(mut self, policy: CachePolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn persist_offline(mut self, persist: bool) -> Self {
    self.persist_offline = persist;
    self
  }

  /// Wire payload `{query, variables, operationName}` shared by HTTP bodies
  /// and subscription `start` messages.
  pub fn payload(&self) -> OperationPayload {
    OperationPayload {
      query: self.query.clone(),
      variables: self.variables.clone(),
      operation_name: self.operation_name.clone(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPayload {
  pub query: String,
  pub variables: Option<Variables>,
  pub operation_name: Option<String>,
}

/// A `(line, column)` position in the query text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
  pub line: u32,
  pub column: u32,
}

/// One element of an error path: a field name or a list index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
  Index(u64),
  Field(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphQLError {
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub locations: Option<Vec<Location>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<Vec<PathSegment>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub extensions: Option<serde_json::Map<String, Value>>,
}

impl GraphQLError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
      locations: None,
      path: None,
      extensions: None,
    }
  }
}

/// The top-level `{data, errors, extensions}` shape of a GraphQL result, as
/// found in HTTP bodies and subscription `data` payloads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResultPayload {
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub errors: Option<Vec<GraphQLError>>,
  #[serde(default)]
  pub extensions: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub data: Option<Value>,
  /// Never `Some` of an empty list.
  pub errors: Option<Vec<GraphQLError>>,
  pub extensions: Option<Value>,
  #[serde(default)]
  pub from_cache: bool,
  pub created_at: DateTime<Utc>,
}

impl Response {
  pub fn new(data: Option<Value>, errors: Option<Vec<GraphQLError>>, extensions: Option<Value>) -> Self {
    Self {
      data,
      errors: errors.filter(|e| !e.is_empty()),
      extensions,
      from_cache: false,
      created_at: Utc::now(),
    }
  }

  pub fn from_data(data: Value) -> Self {
    Self::new(Some(data), None, None)
  }

  pub fn from_errors(errors: Vec<GraphQLError>) -> Self {
    Self::new(None, Some(errors), None)
  }

  /// No errors and non-null data.
  pub fn is_successful(&self) -> bool {
    self.errors.is_none() && matches!(&self.data, Some(d) if !d.is_null())
  }

  pub fn errors(&self) -> &[GraphQLError] {
    self.errors.as_deref().unwrap_or_default()
  }

  /// Turn GraphQL-level errors into `SyncError::GraphQL`.
  pub fn into_data(self) -> Result<Value, SyncError> {
    if let Some(errors) = self.errors {
      return Err(SyncError::GraphQL(errors));
    }
    Ok(self.data.unwrap_or(Value::Null))
  }
}

impl From<ResultPayload> for Response {
  fn from(payload: ResultPayload) -> Self {
    Response::new(payload.data, payload.errors, payload.extensions)
  }
}
