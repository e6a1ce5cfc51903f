//! Lifecycle hooks for external observers.
//!
//! Plugins are registered once, in order, when the client is built. Each hook
//! is delivered to every plugin sequentially in registration order, awaiting
//! one before starting the next. A plugin that returns an error or panics is
//! logged and skipped; neither the other plugins nor the operation that fired
//! the hook notice.

mod analytics;
mod logger;
mod server_sync;

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tracing::{info, warn};

use crate::cache::IndexEntry;
use crate::clock::Clock;
use crate::config::Config;
use crate::event::{Event, EventBus};
use crate::net::RequestOptions;
use crate::queue::MutationEnvelope;

pub use analytics::AnalyticsPlugin;
pub use logger::LoggerPlugin;
pub use server_sync::ServerSyncPlugin;

/// What a hook returns. Errors are reported, never propagated.
pub type PluginResult = color_eyre::Result<()>;

/// A named bundle of optional lifecycle callbacks.
///
/// Every hook defaults to a no-op, so implementors only override what they
/// care about.
#[async_trait]
pub trait Plugin: Send + Sync {
  fn name(&self) -> &str;

  /// Called once at registration.
  async fn on_init(&self, _ctx: &PluginContext) -> PluginResult {
    Ok(())
  }

  /// Before a read is handed to the cache.
  async fn on_fetch(&self, _url: &str, _request: &RequestOptions) -> PluginResult {
    Ok(())
  }

  /// After a response and its index entry were stored.
  async fn on_cache_write(&self, _entry: &IndexEntry) -> PluginResult {
    Ok(())
  }

  /// After a failed write was queued for later delivery.
  async fn on_mutate_queue(&self, _envelope: &MutationEnvelope) -> PluginResult {
    Ok(())
  }

  /// After a queued write was delivered.
  async fn on_sync(&self, _envelope: &MutationEnvelope) -> PluginResult {
    Ok(())
  }

  /// Connectivity came back, before the queue is flushed.
  async fn on_online(&self) -> PluginResult {
    Ok(())
  }
}

/// A hook invocation with its arguments.
#[derive(Debug, Clone, Copy)]
pub enum Hook<'a> {
  Fetch {
    url: &'a str,
    request: &'a RequestOptions,
  },
  CacheWrite(&'a IndexEntry),
  MutateQueue(&'a MutationEnvelope),
  Sync(&'a MutationEnvelope),
  Online,
}

impl Hook<'_> {
  pub fn name(&self) -> &'static str {
    match self {
      Hook::Fetch { .. } => "onFetch",
      Hook::CacheWrite(_) => "onCacheWrite",
      Hook::MutateQueue(_) => "onMutateQueue",
      Hook::Sync(_) => "onSync",
      Hook::Online => "onOnline",
    }
  }

  async fn dispatch(self, plugin: &dyn Plugin) -> PluginResult {
    match self {
      Hook::Fetch { url, request } => plugin.on_fetch(url, request).await,
      Hook::CacheWrite(entry) => plugin.on_cache_write(entry).await,
      Hook::MutateQueue(envelope) => plugin.on_mutate_queue(envelope).await,
      Hook::Sync(envelope) => plugin.on_sync(envelope).await,
      Hook::Online => plugin.on_online().await,
    }
  }
}

/// What a plugin gets to see of the client at registration.
#[derive(Clone)]
pub struct PluginContext {
  bus: EventBus,
  config: Arc<Config>,
  clock: Arc<dyn Clock>,
}

impl PluginContext {
  pub fn new(bus: EventBus, config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
    Self { bus, config, clock }
  }

  pub fn emit(&self, event: &Event) {
    self.bus.emit(event);
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn now(&self) -> DateTime<Utc> {
    self.clock.now()
  }
}

impl fmt::Debug for PluginContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PluginContext").finish_non_exhaustive()
  }
}

/// The ordered, immutable plugin list.
#[derive(Default)]
pub struct PluginPipeline {
  plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
  /// A pipeline with no plugins.
  pub fn empty() -> Self {
    Self::default()
  }

  /// Run every plugin's `on_init` in order and freeze the list.
  pub async fn register(plugins: Vec<Arc<dyn Plugin>>, ctx: &PluginContext) -> Self {
    for plugin in &plugins {
      let outcome = AssertUnwindSafe(plugin.on_init(ctx)).catch_unwind().await;
      if report(plugin.name(), "onInit", outcome) {
        info!(plugin = plugin.name(), "plugin initialized");
      }
    }
    Self { plugins }
  }

  /// Deliver `hook` to every plugin, one at a time.
  pub async fn trigger(&self, hook: Hook<'_>) {
    for plugin in &self.plugins {
      let outcome = AssertUnwindSafe(hook.dispatch(plugin.as_ref()))
        .catch_unwind()
        .await;
      report(plugin.name(), hook.name(), outcome);
    }
  }

  pub fn names(&self) -> Vec<&str> {
    self.plugins.iter().map(|p| p.name()).collect()
  }

  pub fn len(&self) -> usize {
    self.plugins.len()
  }

  pub fn is_empty(&self) -> bool {
    self.plugins.is_empty()
  }
}

/// Log a failed hook. Returns true when the hook succeeded.
fn report(plugin: &str, hook: &str, outcome: Result<PluginResult, Box<dyn Any + Send>>) -> bool {
  match outcome {
    Ok(Ok(())) => true,
    Ok(Err(e)) => {
      warn!(plugin, hook, error = %e, "plugin hook failed");
      false
    }
    Err(panic) => {
      let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
      warn!(plugin, hook, panic = %message, "plugin hook panicked");
      false
    }
  }
}


#[cfg(test)]
mod tests {
  use super::testing::{FailingPlugin, RecordingPlugin};
  use super::*;
  use crate::clock::FixedClock;
  use crate::event::EventName;
  use chrono::TimeZone;
  use std::sync::Mutex;

  fn ctx() -> PluginContext {
    let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    PluginContext::new(EventBus::new(), Arc::new(Config::default()), Arc::new(clock))
  }

  fn envelope(id: &str) -> MutationEnvelope {
    MutationEnvelope::new(
      "https://a.test/posts",
      &RequestOptions::new("POST"),
      Some(id.to_string()),
      Utc::now(),
    )
  }

  #[tokio::test]
  async fn test_init_runs_in_order_and_survives_failures() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
      Arc::new(RecordingPlugin::new("a", log.clone())),
      Arc::new(FailingPlugin { panic: false }),
      Arc::new(FailingPlugin { panic: true }),
      Arc::new(RecordingPlugin::new("b", log.clone())),
    ];

    let pipeline = PluginPipeline::register(plugins, &ctx()).await;

    assert_eq!(*log.lock().unwrap(), vec!["a:onInit", "b:onInit"]);
    assert_eq!(pipeline.names(), vec!["a", "failing", "panicking", "b"]);
  }

  #[tokio::test]
  async fn test_trigger_is_sequential_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
      Arc::new(RecordingPlugin::new("first", log.clone())),
      Arc::new(RecordingPlugin::new("second", log.clone())),
    ];
    let pipeline = PluginPipeline::register(plugins, &ctx()).await;
    log.lock().unwrap().clear();

    pipeline.trigger(Hook::Online).await;
    pipeline
      .trigger(Hook::Fetch {
        url: "https://a.test/",
        request: &RequestOptions::default(),
      })
      .await;

    assert_eq!(
      *log.lock().unwrap(),
      vec![
        "first:onOnline",
        "second:onOnline",
        "first:onFetch:https://a.test/",
        "second:onFetch:https://a.test/",
      ]
    );
  }

  #[tokio::test]
  async fn test_failing_on_sync_does_not_block_later_plugins() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let plugins: Vec<Arc<dyn Plugin>> = vec![
      Arc::new(FailingPlugin { panic: false }),
      Arc::new(FailingPlugin { panic: true }),
      Arc::new(RecordingPlugin::new("after", log.clone())),
    ];
    let pipeline = PluginPipeline::register(plugins, &ctx()).await;

    let env = envelope("m1");
    pipeline.trigger(Hook::Sync(&env)).await;

    assert!(log.lock().unwrap().contains(&"after:onSync:m1".to_string()));
  }

  #[tokio::test]
  async fn test_hooks_without_override_are_noops() {
    struct Quiet;

    #[async_trait]
    impl Plugin for Quiet {
      fn name(&self) -> &str {
        "quiet"
      }
    }

    let pipeline = PluginPipeline::register(vec![Arc::new(Quiet)], &ctx()).await;
    let env = envelope("m2");
    pipeline.trigger(Hook::MutateQueue(&env)).await;
    pipeline.trigger(Hook::Online).await;
    assert_eq!(pipeline.len(), 1);
  }

  #[tokio::test]
  async fn test_context_exposes_bus_config_and_clock() {
    struct Greeter;

    #[async_trait]
    impl Plugin for Greeter {
      fn name(&self) -> &str {
        "greeter"
      }

      async fn on_init(&self, ctx: &PluginContext) -> PluginResult {
        assert!(ctx.config().plugins.server_sync.is_none());
        assert_eq!(ctx.now(), Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        ctx.emit(&Event::QueueCount { count: 42 });
        Ok(())
      }
    }

    let ctx = ctx();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ctx.bus.on(EventName::QueueCount, move |e| sink.lock().unwrap().push(e.clone()));

    PluginPipeline::register(vec![Arc::new(Greeter)], &ctx).await;
    assert_eq!(*seen.lock().unwrap(), vec![Event::QueueCount { count: 42 }]);
  }

  #[test]
  fn test_hook_names() {
    assert_eq!(Hook::Online.name(), "onOnline");
    let env = envelope("m3");
    assert_eq!(Hook::Sync(&env).name(), "onSync");
    assert_eq!(Hook::MutateQueue(&env).name(), "onMutateQueue");
  }
}
