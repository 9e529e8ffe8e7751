//! Durable string-keyed storage backing the response cache and the offline
//! queue.
//!
//! Each logical store (cache, queue) gets its own instance; they never share
//! a connection or a lock.

mod memory;
mod sqlite;
mod traits;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, CACHE_TABLE, QUEUE_TABLE};
pub use traits::KeyValueStore;
