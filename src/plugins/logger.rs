use async_trait::async_trait;
use tracing::info;

use super::{Plugin, PluginContext, PluginResult};
use crate::cache::IndexEntry;
use crate::net::RequestOptions;
use crate::queue::MutationEnvelope;

/// Reports every hook at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggerPlugin;

#[async_trait]
impl Plugin for LoggerPlugin {
  fn name(&self) -> &str {
    "LoggerPlugin"
  }

  async fn on_init(&self, _ctx: &PluginContext) -> PluginResult {
    info!(plugin = self.name(), "initialized");
    Ok(())
  }

  async fn on_fetch(&self, url: &str, request: &RequestOptions) -> PluginResult {
    info!(plugin = self.name(), method = %request.method_or("GET"), %url, "fetch");
    Ok(())
  }

  async fn on_cache_write(&self, entry: &IndexEntry) -> PluginResult {
    info!(plugin = self.name(), url = %entry.url, ttl_ms = ?entry.ttl_ms, "cache write");
    Ok(())
  }

  async fn on_mutate_queue(&self, envelope: &MutationEnvelope) -> PluginResult {
    info!(plugin = self.name(), id = %envelope.id, url = %envelope.url, "queued mutation");
    Ok(())
  }

  async fn on_sync(&self, envelope: &MutationEnvelope) -> PluginResult {
    info!(plugin = self.name(), id = %envelope.id, url = %envelope.url, "synced mutation");
    Ok(())
  }

  async fn on_online(&self) -> PluginResult {
    info!(plugin = self.name(), "back online");
    Ok(())
  }
}
