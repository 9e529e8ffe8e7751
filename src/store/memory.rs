use std::collections::BTreeMap;
use std::sync::Mutex;

use super::traits::KeyValueStore;
use crate::error::StorageError;

/// Store implementation that lives only as long as the process.
/// Used for tests and for clients that opt out of persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StorageError> {
    self
      .entries
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
    self.lock()?.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<bool, StorageError> {
    Ok(self.lock()?.remove(key).is_some())
  }

  fn list(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    Ok(
      self
        .lock()?
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect(),
    )
  }

  fn clear(&self) -> Result<(), StorageError> {
    self.lock()?.clear();
    Ok(())
  }

  fn len(&self) -> Result<usize, StorageError> {
    Ok(self.lock()?.len())
  }
}
