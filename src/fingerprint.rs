//! Stable identity keys for requests.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{Request, Variables};

#[derive(Serialize)]
struct Identity<'a> {
  query: &'a str,
  variables: Option<&'a Variables>,
  operation_name: Option<&'a str>,
}

/// Derive the cache/queue key of a request.
///
/// Hashes the canonical JSON of `(query, variables, operation_name)`.
/// Variables are held in sorted maps, so key order in the caller's input
/// never changes the result. Policy and persistence flags are excluded.
pub fn fingerprint(request: &Request) -> String {
  let identity = Identity {
    query: &request.query,
    variables: request.variables.as_ref(),
    operation_name: request.operation_name.as_deref(),
  };

  // Serializing strings and JSON values into a Vec cannot fail
  let canonical = serde_json::to_vec(&identity).unwrap_or_default();

  // SHA256 hash for stable, fixed-length keys
  let mut hasher = Sha256::new();
  hasher.update(&canonical);
  hex::encode(hasher.finalize())
}
