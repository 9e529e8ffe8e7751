//! Connectivity signal fed by the host application.

use tokio::sync::watch;
use tracing::info;

/// Shared online/offline flag with change notification.
///
/// Cloning yields another handle to the same signal. The platform-specific
/// detector (or a test) calls [`Connectivity::set_online`]; the engine and
/// queue read it through [`Connectivity::is_online`].
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn online() -> Self {
    Self::new(true)
  }

  pub fn offline() -> Self {
    Self::new(false)
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the signal. Subscribers are woken only on an actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  /// Receiver that observes every change after this call.
  pub fn changes(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::online()
  }
}
