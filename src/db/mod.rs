//! Persistent key-value store with independently namespaced partitions.
//!
//! The store knows nothing about responses or mutations: it maps string keys to
//! opaque JSON blobs inside a [`Partition`]. Ordering of listings is left to
//! callers. Multi-record writes go through a [`WriteBatch`] so that records
//! which must live or die together (a cached response and its index entry) are
//! committed atomically.

mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StorageError;

pub use sqlite::SqliteStore;

/// Shared handle to a store backend.
pub type SharedStore = Arc<dyn Store>;

/// A namespace inside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Raw cached responses, keyed by `METHOD URL`.
  Responses,
  /// Pending mutation envelopes, keyed by envelope id.
  Mutations,
  /// Cache index entries, keyed like `Responses`.
  Index,
  /// Envelopes that exhausted their attempt budget.
  DeadLetters,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Responses,
    Partition::Mutations,
    Partition::Index,
    Partition::DeadLetters,
  ];

  /// Backing table name.
  pub fn table(self) -> &'static str {
    match self {
      Partition::Responses => "responses",
      Partition::Mutations => "mutations",
      Partition::Index => "cache_index",
      Partition::DeadLetters => "dead_letters",
    }
  }
}

impl fmt::Display for Partition {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Partition::Responses => write!(f, "responses"),
      Partition::Mutations => write!(f, "mutations"),
      Partition::Index => write!(f, "index"),
      Partition::DeadLetters => write!(f, "dead-letters"),
    }
  }
}

/// One write inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
  Put {
    partition: Partition,
    key: String,
    value: Vec<u8>,
  },
  Delete {
    partition: Partition,
    key: String,
  },
}

/// A group of writes applied in a single transaction.
#[derive(Debug, Default, Clone)]
pub struct WriteBatch {
  ops: Vec<WriteOp>,
}

impl WriteBatch {
  pub fn new() -> Self {
    Self::default()
  }

  /// Queue a serialized put. Later ops on the same key win.
  pub fn put<T: Serialize + ?Sized>(
    &mut self,
    partition: Partition,
    key: impl Into<String>,
    value: &T,
  ) -> Result<&mut Self, StorageError> {
    let key = key.into();
    let value = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
      partition,
      key: key.clone(),
      source,
    })?;
    self.ops.push(WriteOp::Put {
      partition,
      key,
      value,
    });
    Ok(self)
  }

  /// Queue a delete. Deleting a missing key is a no-op.
  pub fn delete(&mut self, partition: Partition, key: impl Into<String>) -> &mut Self {
    self.ops.push(WriteOp::Delete {
      partition,
      key: key.into(),
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.ops.is_empty()
  }

  pub fn len(&self) -> usize {
    self.ops.len()
  }

  pub fn into_ops(self) -> Vec<WriteOp> {
    self.ops
  }
}

/// Storage backend contract.
///
/// All methods may be called concurrently. Implementations must serialize
/// conflicting writes so the last writer wins, and must create partitions
/// lazily and idempotently on first use.
#[async_trait]
pub trait Store: Send + Sync + 'static {
  /// Fetch the raw value stored under `key`.
  async fn get_raw(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

  /// Every `(key, value)` pair in the partition, in no particular order.
  async fn list_raw(&self, partition: Partition) -> Result<Vec<(String, Vec<u8>)>, StorageError>;

  /// Every key in the partition, in no particular order.
  async fn keys(&self, partition: Partition) -> Result<Vec<String>, StorageError>;

  /// Apply all writes in `batch` atomically.
  async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError>;
}

/// Typed helpers over the raw [`Store`] contract.
#[async_trait]
pub trait StoreExt: Store {
  async fn get<T>(&self, partition: Partition, key: &str) -> Result<Option<T>, StorageError>
  where
    T: DeserializeOwned + Send,
  {
    match self.get_raw(partition, key).await? {
      Some(bytes) => decode(partition, key, &bytes).map(Some),
      None => Ok(None),
    }
  }

  async fn set<T>(&self, partition: Partition, key: &str, value: &T) -> Result<(), StorageError>
  where
    T: Serialize + Sync + ?Sized,
  {
    let mut batch = WriteBatch::new();
    batch.put(partition, key, value)?;
    self.apply(batch).await
  }

  async fn delete(&self, partition: Partition, key: &str) -> Result<(), StorageError> {
    let mut batch = WriteBatch::new();
    batch.delete(partition, key);
    self.apply(batch).await
  }

  /// Decode every value in the partition. Order is unspecified.
  async fn list_all<T>(&self, partition: Partition) -> Result<Vec<T>, StorageError>
  where
    T: DeserializeOwned + Send,
  {
    self
      .list_raw(partition)
      .await?
      .into_iter()
      .map(|(key, bytes)| decode(partition, &key, &bytes))
      .collect()
  }
}

impl<S: Store + ?Sized> StoreExt for S {}

fn decode<T: DeserializeOwned>(partition: Partition, key: &str, bytes: &[u8]) -> Result<T, StorageError> {
  serde_json::from_slice(bytes).map_err(|source| StorageError::Decode {
    partition,
    key: key.to_string(),
    source,
  })
}
