//! Response caching with offline fallback.
//!
//! This module provides:
//! - A response store plus an index of what is cached, written together
//! - Three read strategies (cache-first, stale-while-revalidate, network-then-cache)
//! - Expiry, prefix purge and full clear over the index

mod index;
mod layer;
mod traits;

pub use index::{parse_ttl, CacheIndex, IndexEntry, Meta};
pub use layer::{CacheLayer, CachePolicy};
pub use traits::{cache_key, CacheResult, CacheSource, CacheStrategy, CachedResponse};
