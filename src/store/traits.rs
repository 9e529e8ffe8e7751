use crate::error::StorageError;

/// Trait for persistent key-value backends.
///
/// Values are opaque bytes; callers serialize with `serde_json`. Every
/// method is a single atomic operation on the backend.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Insert or overwrite.
  fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

  /// Returns whether a value was removed.
  fn delete(&self, key: &str) -> Result<bool, StorageError>;

  /// All entries in ascending key order.
  fn list(&self) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

  fn clear(&self) -> Result<(), StorageError>;

  fn len(&self) -> Result<usize, StorageError>;

  fn is_empty(&self) -> Result<bool, StorageError> {
    Ok(self.len()? == 0)
  }
}
