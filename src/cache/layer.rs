//! Cache layer that orchestrates caching logic with network fetching.

use std::sync::Arc;

use tracing::{debug, warn};

use super::index::{parse_ttl, CacheIndex, IndexEntry, Meta};
use super::traits::{cache_key, CacheResult, CacheStrategy, CachedResponse};
use crate::clock::Clock;
use crate::error::Result;
use crate::net::{HttpClient, RequestOptions};
use crate::plugins::{Hook, PluginPipeline};

/// How a single read should be served and stored.
#[derive(Debug, Clone, Default)]
pub struct CachePolicy {
  pub strategy: CacheStrategy,
  /// Duration string; unparseable values mean "never expires".
  pub ttl: Option<String>,
  pub meta: Option<Meta>,
}

impl CachePolicy {
  pub fn new(strategy: CacheStrategy) -> Self {
    Self {
      strategy,
      ..Self::default()
    }
  }

  pub fn with_ttl(mut self, ttl: impl Into<String>) -> Self {
    self.ttl = Some(ttl.into());
    self
  }

  pub fn with_meta(mut self, meta: Meta) -> Self {
    self.meta = Some(meta);
    self
  }
}

/// Cache layer that manages caching logic and network fetching.
///
/// This layer sits between the client facade and the network, serving reads
/// according to a [`CacheStrategy`] and recording every successful fetch in
/// the response store and the index.
#[derive(Clone)]
pub struct CacheLayer {
  index: CacheIndex,
  http: HttpClient,
  plugins: Arc<PluginPipeline>,
  clock: Arc<dyn Clock>,
}

impl CacheLayer {
  pub fn new(
    index: CacheIndex,
    http: HttpClient,
    plugins: Arc<PluginPipeline>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      index,
      http,
      plugins,
      clock,
    }
  }

  pub fn index(&self) -> &CacheIndex {
    &self.index
  }

  /// Serve a read.
  ///
  /// - cache-first: a stored copy is returned without touching the network.
  /// - stale-while-revalidate: a stored copy is returned at once and a
  ///   refresh is started in the background.
  /// - network-then-cache: the network is tried first; on failure the stored
  ///   copy is returned if there is one.
  ///
  /// The first two fall back to network-then-cache when nothing is stored.
  pub async fn fetch(
    &self,
    url: &str,
    request: &RequestOptions,
    policy: &CachePolicy,
  ) -> Result<CacheResult<CachedResponse>> {
    let key = cache_key(&request.method_or("GET"), url);
    let cached = self.index.response(&key).await?;

    match (policy.strategy, cached) {
      (CacheStrategy::CacheFirst, Some(cached)) => {
        debug!(%key, "cache hit");
        let cached_at = cached.cached_at;
        Ok(CacheResult::from_cache(cached, cached_at))
      }
      (CacheStrategy::StaleWhileRevalidate, Some(cached)) => {
        debug!(%key, "cache hit, revalidating");
        self.revalidate_in_background(url, request.clone(), policy.clone());
        let cached_at = cached.cached_at;
        Ok(CacheResult::revalidating(cached, cached_at))
      }
      (_, cached) => self.network_then_cache(url, request, policy, cached).await,
    }
  }

  /// Refresh `url` on a detached task. Failures are logged and dropped.
  pub fn revalidate_in_background(&self, url: &str, request: RequestOptions, policy: CachePolicy) {
    let layer = self.clone();
    let url = url.to_string();
    tokio::spawn(async move {
      if let Err(e) = layer.fetch_and_store(&url, &request, &policy).await {
        warn!(%url, error = %e, "background revalidation failed");
      }
    });
  }

  async fn network_then_cache(
    &self,
    url: &str,
    request: &RequestOptions,
    policy: &CachePolicy,
    cached: Option<CachedResponse>,
  ) -> Result<CacheResult<CachedResponse>> {
    match self.fetch_and_store(url, request, policy).await {
      Ok(fresh) => Ok(CacheResult::from_network(fresh)),
      Err(e) if e.is_remote_failure() => match cached {
        Some(cached) => {
          debug!(%url, error = %e, "network failed, serving cached copy");
          let cached_at = cached.cached_at;
          Ok(CacheResult::offline(cached, cached_at))
        }
        None => Err(e),
      },
      Err(e) => Err(e),
    }
  }

  /// Fetch from the network and record the response. Only successful
  /// responses are stored.
  async fn fetch_and_store(
    &self,
    url: &str,
    request: &RequestOptions,
    policy: &CachePolicy,
  ) -> Result<CachedResponse> {
    let method = request.method_or("GET");
    let response = self.http.send_ok(url, request, "GET").await?;

    let now = self.clock.now();
    let record = CachedResponse::capture(response, now);
    let entry = IndexEntry {
      key: cache_key(&method, url),
      url: url.to_string(),
      method,
      cached_at: now,
      ttl_ms: policy.ttl.as_deref().and_then(parse_ttl),
      meta: policy.meta.clone(),
    };

    self.index.write(&entry, &record).await?;
    self.plugins.trigger(Hook::CacheWrite(&entry)).await;
    Ok(record)
  }
}
