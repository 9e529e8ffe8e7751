use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// GraphQL-over-HTTP endpoint; the WebSocket endpoint is derived from it
  pub endpoint: String,
  /// Extra headers sent with every request
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default = "default_request_timeout_ms")]
  pub request_timeout_ms: u64,
  /// Cache entry lifetime; `null` keeps entries until invalidated
  #[serde(default = "default_cache_ttl_ms")]
  pub cache_ttl_ms: Option<u64>,
  /// SQLite file for the cache and queue (defaults to the data dir)
  pub database_path: Option<PathBuf>,
  /// Number of recent latencies kept for percentiles
  #[serde(default = "default_latency_window")]
  pub latency_window: usize,
  /// Drain the offline queue whenever connectivity comes back. Read by
  /// applications embedding the client, which own the connectivity signal
  /// and call `SyncClient::spawn_replay_on_reconnect`
  #[serde(default = "default_true")]
  pub replay_on_reconnect: bool,
}

fn default_request_timeout_ms() -> u64 {
  30_000
}

fn default_cache_ttl_ms() -> Option<u64> {
  Some(300_000)
}

fn default_latency_window() -> usize {
  1000
}

fn default_true() -> bool {
  true
}

/// Whole milliseconds, saturating. Non-zero durations never collapse to 0.
fn millis(duration: Duration) -> u64 {
  let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
  if ms == 0 && !duration.is_zero() {
    1
  } else {
    ms
  }
}

impl Config {
  /// Configuration with defaults for everything but the endpoint.
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      headers: BTreeMap::new(),
      request_timeout_ms: default_request_timeout_ms(),
      cache_ttl_ms: default_cache_ttl_ms(),
      database_path: None,
      latency_window: default_latency_window(),
      replay_on_reconnect: true,
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout_ms = millis(timeout);
    self
  }

  pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
    self.cache_ttl_ms = ttl.map(millis);
    self
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }

  pub fn cache_ttl(&self) -> Option<Duration> {
    self.cache_ttl_ms.map(Duration::from_millis)
  }

  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./gqlsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/gqlsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/gqlsync/config.yaml \
           with at least an `endpoint` entry."
        ))
      }
    };

    Ok(config.with_env_token())
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("gqlsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("gqlsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Add `Authorization: Bearer <GQLSYNC_AUTH_TOKEN>` unless the headers
  /// already carry an authorization entry.
  pub fn with_env_token(self) -> Self {
    match std::env::var("GQLSYNC_AUTH_TOKEN") {
      Ok(token) if !token.is_empty() => self.with_bearer_token(&token),
      _ => self,
    }
  }

  fn with_bearer_token(mut self, token: &str) -> Self {
    let has_auth = self
      .headers
      .keys()
      .any(|k| k.eq_ignore_ascii_case("authorization"));
    if !has_auth {
      self
        .headers
        .insert("Authorization".into(), format!("Bearer {}", token));
    }
    self
  }
}
