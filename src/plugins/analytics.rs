use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::{Plugin, PluginContext, PluginResult};
use crate::net::{HttpClient, RequestOptions};

/// Counts tracked fetches and reports reconnects to an optional endpoint.
pub struct AnalyticsPlugin {
  endpoint: Option<String>,
  http: HttpClient,
  ctx: OnceLock<PluginContext>,
  fetches: AtomicU64,
}

impl AnalyticsPlugin {
  pub fn new(endpoint: Option<String>, http: HttpClient) -> Self {
    Self {
      endpoint,
      http,
      ctx: OnceLock::new(),
      fetches: AtomicU64::new(0),
    }
  }

  /// Fetches seen since startup.
  pub fn fetches(&self) -> u64 {
    self.fetches.load(Ordering::Relaxed)
  }
}

#[async_trait]
impl Plugin for AnalyticsPlugin {
  fn name(&self) -> &str {
    "AnalyticsPlugin"
  }

  async fn on_init(&self, ctx: &PluginContext) -> PluginResult {
    let _ = self.ctx.set(ctx.clone());
    Ok(())
  }

  async fn on_fetch(&self, url: &str, _request: &RequestOptions) -> PluginResult {
    let total = self.fetches.fetch_add(1, Ordering::Relaxed) + 1;
    info!(plugin = self.name(), %url, total, "fetch tracked");
    Ok(())
  }

  /// Fire-and-forget beacon; delivery failures are only logged.
  async fn on_online(&self) -> PluginResult {
    let (Some(endpoint), Some(ctx)) = (&self.endpoint, self.ctx.get()) else {
      return Ok(());
    };

    let beacon = json!({ "type": "online", "ts": ctx.now().timestamp_millis() });
    let request = RequestOptions::new("POST").with_json(beacon);
    if let Err(e) = self.http.send_ok(endpoint, &request, "POST").await {
      debug!(plugin = self.name(), %endpoint, error = %e, "beacon not delivered");
    }
    Ok(())
  }
}
