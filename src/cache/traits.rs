//! Core types shared by the cache index and the strategy engine.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::net::{Headers, NetworkResponse};

/// Fetch policy for reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheStrategy {
  /// Serve the stored copy whenever there is one; only miss goes to the network.
  CacheFirst,
  /// Serve the stored copy and refresh it in the background.
  StaleWhileRevalidate,
  /// Prefer the network, fall back to the stored copy on failure.
  #[default]
  NetworkThenCache,
}

impl CacheStrategy {
  pub fn as_str(self) -> &'static str {
    match self {
      CacheStrategy::CacheFirst => "cacheFirst",
      CacheStrategy::StaleWhileRevalidate => "staleWhileRevalidate",
      CacheStrategy::NetworkThenCache => "networkThenCache",
    }
  }
}

impl fmt::Display for CacheStrategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for CacheStrategy {
  type Err = String;

  /// Accepts the camelCase names as well as kebab/snake spellings.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized: String = s
      .chars()
      .filter(|c| *c != '-' && *c != '_')
      .map(|c| c.to_ascii_lowercase())
      .collect();
    match normalized.as_str() {
      "cachefirst" => Ok(CacheStrategy::CacheFirst),
      "stalewhilerevalidate" | "swr" => Ok(CacheStrategy::StaleWhileRevalidate),
      "networkthencache" | "networkfirst" => Ok(CacheStrategy::NetworkThenCache),
      _ => Err(format!("unknown cache strategy: {}", s)),
    }
  }
}

/// Composite identity shared by the response store and the index.
pub fn cache_key(method: &str, url: &str) -> String {
  format!("{} {}", method.to_ascii_uppercase(), url)
}

/// A response as captured in the `responses` partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
  pub cached_at: DateTime<Utc>,
  pub status: u16,
  pub headers: Headers,
  pub body: Vec<u8>,
}

impl CachedResponse {
  pub fn capture(response: NetworkResponse, cached_at: DateTime<Utc>) -> Self {
    Self {
      cached_at,
      status: response.status,
      headers: response.headers,
      body: response.body,
    }
  }

  pub fn content_type(&self) -> Option<&str> {
    self.headers.get("content-type").map(String::as_str)
  }

  /// True when the content type declares JSON (`application/json`, `*+json`).
  pub fn is_json(&self) -> bool {
    self
      .content_type()
      .map(|ct| {
        let mime = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        mime == "application/json" || mime.ends_with("+json")
      })
      .unwrap_or(false)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Served from the store without touching the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Served from the store while a background refresh runs.
  pub fn revalidating(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Revalidating,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Stored copy, network not consulted
  Cache,
  /// Stored copy, background refresh in flight
  Revalidating,
  /// Network failed, serving the stored copy
  Offline,
}
