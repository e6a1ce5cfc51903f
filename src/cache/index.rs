//! Catalogue of cached responses with TTL expiry.
//!
//! Every index entry has a matching record in the `responses` partition. Both
//! are written and removed in the same [`WriteBatch`], so a crash can never
//! separate them. `clear_expired` also sweeps up orphans left by stores that
//! predate batched writes.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::traits::CachedResponse;
use crate::db::{Partition, SharedStore, Store, StoreExt, WriteBatch};
use crate::error::StorageError;

/// Free-form metadata attached to an index entry.
pub type Meta = BTreeMap<String, serde_json::Value>;

/// Metadata about one cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
  /// `METHOD URL`, same as the response record key.
  pub key: String,
  pub url: String,
  pub method: String,
  pub cached_at: DateTime<Utc>,
  /// Time-to-live in milliseconds; `None` never expires.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ttl_ms: Option<u64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub meta: Option<Meta>,
}

impl IndexEntry {
  /// Expired once strictly more than `ttl_ms` has elapsed since caching.
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    match self.ttl_ms {
      Some(ttl) => {
        let age = (now - self.cached_at).num_milliseconds();
        age > 0 && age as u64 > ttl
      }
      None => false,
    }
  }
}

/// Parse a duration such as `"500ms"`, `"30s"`, `"5m"`, `"2h"` or `"1d"` into
/// milliseconds. Units are case-insensitive and may be separated from the
/// number by whitespace. Anything else yields `None`, which callers treat as
/// "no TTL" rather than an error.
pub fn parse_ttl(input: &str) -> Option<u64> {
  let input = input.trim();
  let split = input.find(|c: char| !c.is_ascii_digit())?;
  let (digits, unit) = input.split_at(split);
  if digits.is_empty() {
    return None;
  }

  let n: u64 = digits.parse().ok()?;
  let multiplier = match unit.trim_start().to_ascii_lowercase().as_str() {
    "ms" => 1,
    "s" => 1_000,
    "m" => 60_000,
    "h" => 3_600_000,
    "d" => 86_400_000,
    _ => return None,
  };
  n.checked_mul(multiplier)
}

/// Index over the `index` and `responses` partitions.
#[derive(Clone)]
pub struct CacheIndex {
  store: SharedStore,
}

impl CacheIndex {
  pub fn new(store: SharedStore) -> Self {
    Self { store }
  }

  /// Overwrite the entry stored under `entry.key`, leaving the response
  /// record untouched.
  ///
  /// Only the index partition is written. To store an entry together with
  /// its response use [`write`](Self::write); an entry without a response is
  /// treated as half-written and dropped by [`clear_expired`](Self::clear_expired).
  pub async fn upsert(&self, entry: &IndexEntry) -> Result<(), StorageError> {
    self.store.set(Partition::Index, &entry.key, entry).await
  }

  /// Store a response and its index entry together.
  pub async fn write(&self, entry: &IndexEntry, response: &CachedResponse) -> Result<(), StorageError> {
    let mut batch = WriteBatch::new();
    batch.put(Partition::Responses, entry.key.as_str(), response)?;
    batch.put(Partition::Index, entry.key.as_str(), entry)?;
    self.store.apply(batch).await?;
    debug!(key = %entry.key, ttl_ms = ?entry.ttl_ms, "cache write");
    Ok(())
  }

  pub async fn get(&self, key: &str) -> Result<Option<IndexEntry>, StorageError> {
    self.store.get(Partition::Index, key).await
  }

  /// Cached response record for `key`, if any.
  pub async fn response(&self, key: &str) -> Result<Option<CachedResponse>, StorageError> {
    self.store.get(Partition::Responses, key).await
  }

  /// Remove an entry and its response record. No-op if absent.
  pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
    self.remove_keys(std::iter::once(key.to_string())).await
  }

  /// All entries, newest first.
  pub async fn list(&self) -> Result<Vec<IndexEntry>, StorageError> {
    let mut entries: Vec<IndexEntry> = self.store.list_all(Partition::Index).await?;
    entries.sort_by(|a, b| b.cached_at.cmp(&a.cached_at).then_with(|| a.key.cmp(&b.key)));
    Ok(entries)
  }

  /// Drop every entry whose TTL has elapsed at `now`, plus any half-written
  /// pairs. Returns the number of expired entries removed.
  pub async fn clear_expired(&self, now: DateTime<Utc>) -> Result<usize, StorageError> {
    let entries = self.list().await?;
    let indexed: HashSet<String> = entries.iter().map(|e| e.key.clone()).collect();
    let stored: HashSet<String> = self
      .store
      .keys(Partition::Responses)
      .await?
      .into_iter()
      .collect();

    let expired: Vec<String> = entries
      .iter()
      .filter(|e| e.is_expired(now))
      .map(|e| e.key.clone())
      .collect();
    let orphans: Vec<String> = indexed.symmetric_difference(&stored).cloned().collect();
    if !orphans.is_empty() {
      info!(count = orphans.len(), "repairing orphaned cache records");
    }

    let removed = expired.len();
    self.remove_keys(expired.into_iter().chain(orphans)).await?;
    if removed > 0 {
      info!(removed, "cleared expired cache entries");
    }
    Ok(removed)
  }

  /// Drop every entry. Returns the number removed.
  pub async fn clear_all(&self) -> Result<usize, StorageError> {
    let keys = self.store.keys(Partition::Index).await?;
    let stray = self.store.keys(Partition::Responses).await?;
    let removed = keys.len();
    self.remove_keys(keys.into_iter().chain(stray)).await?;
    info!(removed, "cleared cache");
    Ok(removed)
  }

  /// Drop every entry whose URL starts with `prefix`. Returns the number removed.
  pub async fn purge_by_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
    let keys: Vec<String> = self
      .list()
      .await?
      .into_iter()
      .filter(|e| e.url.starts_with(prefix))
      .map(|e| e.key)
      .collect();
    let removed = keys.len();
    self.remove_keys(keys).await?;
    info!(prefix, removed, "purged cache entries");
    Ok(removed)
  }

  async fn remove_keys(&self, keys: impl IntoIterator<Item = String>) -> Result<(), StorageError> {
    let mut batch = WriteBatch::new();
    for key in keys {
      batch.delete(Partition::Responses, key.as_str());
      batch.delete(Partition::Index, key);
    }
    self.store.apply(batch).await
  }
}
