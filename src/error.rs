//! Error types for the data layer.
//!
//! Storage and network failures are kept apart so callers can tell "the local
//! store is broken" from "the remote is unreachable". Plugin failures never
//! surface here; the pipeline logs and swallows them.

use thiserror::Error;

use crate::db::Partition;

/// Result alias used throughout the library.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error for cache, queue and facade operations.
#[derive(Debug, Error)]
pub enum Error {
  /// The persistent store could not complete an operation.
  #[error(transparent)]
  Storage(#[from] StorageError),

  /// The request never produced a response (connect failure, timeout, ...).
  #[error("{method} {url} failed: {source}")]
  Network {
    method: String,
    url: String,
    #[source]
    source: reqwest::Error,
  },

  /// The remote answered with a non-success status.
  #[error("{method} {url} was rejected with status {status}")]
  RemoteRejection {
    method: String,
    url: String,
    status: u16,
  },

  /// The request could not be built (bad URL, method or header).
  #[error("invalid request: {0}")]
  InvalidRequest(String),

  /// A response body declared as JSON did not parse.
  #[error("failed to decode response body: {0}")]
  Decode(#[from] serde_json::Error),
}

impl Error {
  /// True for failures where a stale cached copy is an acceptable answer.
  pub fn is_remote_failure(&self) -> bool {
    matches!(self, Error::Network { .. } | Error::RemoteRejection { .. })
  }
}

/// Failure inside the persistent store.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),

  #[error("failed to encode {partition} record {key}: {source}")]
  Encode {
    partition: Partition,
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to decode {partition} record {key}: {source}")]
  Decode {
    partition: Partition,
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("storage lock poisoned")]
  Poisoned,

  #[error("storage task failed: {0}")]
  Task(#[from] tokio::task::JoinError),

  #[error("failed to prepare storage location: {0}")]
  Io(#[from] std::io::Error),

  #[error("could not determine a data directory")]
  NoDataDir,
}
