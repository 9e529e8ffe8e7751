//! Response cache with lazy expiry.
//!
//! Entries are whole-response blobs keyed by request fingerprint. Expired
//! entries are not swept; they are dropped the next time they are read.

mod layer;

pub use layer::{CacheStats, ResponseCache};
