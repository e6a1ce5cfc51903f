use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{Plugin, PluginResult};
use crate::net::{HttpClient, RequestOptions};
use crate::queue::MutationEnvelope;

/// Forwards every delivered mutation to a sync endpoint as
/// `{"mutations": [envelope]}`. Rejections are logged and not retried.
pub struct ServerSyncPlugin {
  endpoint: String,
  http: HttpClient,
}

impl ServerSyncPlugin {
  pub fn new(endpoint: impl Into<String>, http: HttpClient) -> Self {
    Self {
      endpoint: endpoint.into(),
      http,
    }
  }
}

#[async_trait]
impl Plugin for ServerSyncPlugin {
  fn name(&self) -> &str {
    "ServerSyncPlugin"
  }

  async fn on_mutate_queue(&self, envelope: &MutationEnvelope) -> PluginResult {
    info!(plugin = self.name(), method = %envelope.method, url = %envelope.url, "queued mutation");
    Ok(())
  }

  async fn on_sync(&self, envelope: &MutationEnvelope) -> PluginResult {
    let body = json!({ "mutations": [serde_json::to_value(envelope)?] });
    let request = RequestOptions::new("POST")
      .with_header("content-type", "application/json")
      .with_json(body);

    match self.http.send(&self.endpoint, &request, "POST").await {
      Ok(response) if response.is_success() => {}
      Ok(response) => {
        warn!(plugin = self.name(), id = %envelope.id, status = response.status, "server sync rejected");
      }
      Err(e) => {
        warn!(plugin = self.name(), id = %envelope.id, error = %e, "server sync failed");
      }
    }
    Ok(())
  }
}
