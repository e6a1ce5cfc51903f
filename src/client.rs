//! The public entry point.
//!
//! [`Harbor`] owns one store, one event bus and one plugin list. Reads go
//! through the cache layer, writes go straight to the network and fall back to
//! the mutation queue, and two background tasks flush the queue: one reacting
//! to [`SyncTrigger`] signals and one on a fixed interval while the host is
//! online and in the foreground.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::{
  CacheIndex, CacheLayer, CachePolicy, CacheResult, CacheStrategy, CachedResponse, IndexEntry, Meta,
};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::db::{SharedStore, SqliteStore};
use crate::error::{Error, Result};
use crate::event::EventBus;
use crate::host::{BackgroundHost, HostState, NoopHost, SyncSignal, SyncTrigger, PERIODIC_SYNC_TAG, SYNC_TAG};
use crate::net::{HttpClient, NetworkResponse, RequestOptions};
use crate::plugins::{Hook, Plugin, PluginContext, PluginPipeline};
use crate::queue::{MutationEnvelope, MutationQueue};

/// Status reported for a write that was accepted for later delivery.
pub const QUEUED_STATUS: u16 = 202;
pub const QUEUED_STATUS_TEXT: &str = "Queued offline";

/// Per-read overrides. Anything unset comes from the config.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
  pub strategy: Option<CacheStrategy>,
  pub ttl: Option<String>,
  pub meta: Option<Meta>,
  pub request: RequestOptions,
}

impl GetOptions {
  pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
    self.strategy = Some(strategy);
    self
  }

  pub fn ttl(mut self, ttl: impl Into<String>) -> Self {
    self.ttl = Some(ttl.into());
    self
  }

  pub fn meta(mut self, meta: Meta) -> Self {
    self.meta = Some(meta);
    self
  }

  pub fn request(mut self, request: RequestOptions) -> Self {
    self.request = request;
    self
  }
}

/// A write request, optionally with a caller-chosen envelope id.
#[derive(Debug, Clone, Default)]
pub struct MutateOptions {
  pub id: Option<String>,
  pub request: RequestOptions,
}

impl MutateOptions {
  pub fn new(request: RequestOptions) -> Self {
    Self { id: None, request }
  }

  pub fn id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }
}

/// A read body after content negotiation.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  Json(Value),
  Text(String),
}

impl Payload {
  /// JSON when the response declares a JSON content type, text otherwise.
  /// An empty JSON body decodes to `null`.
  pub fn from_response(response: &CachedResponse) -> Result<Self> {
    if !response.is_json() {
      return Ok(Payload::Text(String::from_utf8_lossy(&response.body).into_owned()));
    }
    if response.body.iter().all(u8::is_ascii_whitespace) {
      return Ok(Payload::Json(Value::Null));
    }
    Ok(Payload::Json(serde_json::from_slice(&response.body)?))
  }

  pub fn as_json(&self) -> Option<&Value> {
    match self {
      Payload::Json(value) => Some(value),
      Payload::Text(_) => None,
    }
  }

  pub fn as_text(&self) -> Option<&str> {
    match self {
      Payload::Text(text) => Some(text),
      Payload::Json(_) => None,
    }
  }
}

/// What happened to a write.
#[derive(Debug, Clone)]
pub enum MutationOutcome {
  /// The remote accepted it.
  Delivered(NetworkResponse),
  /// The network was unavailable or refused; it waits in the queue.
  Queued(MutationEnvelope),
}

impl MutationOutcome {
  pub fn status(&self) -> u16 {
    match self {
      MutationOutcome::Delivered(response) => response.status,
      MutationOutcome::Queued(_) => QUEUED_STATUS,
    }
  }

  pub fn status_text(&self) -> &'static str {
    match self {
      MutationOutcome::Delivered(_) => "OK",
      MutationOutcome::Queued(_) => QUEUED_STATUS_TEXT,
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, MutationOutcome::Queued(_))
  }
}

struct Core {
  config: Arc<Config>,
  cache: CacheLayer,
  queue: MutationQueue,
  plugins: Arc<PluginPipeline>,
  bus: EventBus,
  http: HttpClient,
  host: Arc<dyn BackgroundHost>,
  clock: Arc<dyn Clock>,
}

impl Core {
  fn policy_for(&self, url: &str, options: &GetOptions) -> CachePolicy {
    let route = self.config.route_for(url);
    let strategy = options
      .strategy
      .or_else(|| route.map(|r| r.strategy))
      .or(self.config.data.default_policy)
      .unwrap_or_default();
    let ttl = options
      .ttl
      .clone()
      .or_else(|| route.and_then(|r| r.max_age.clone()))
      .or_else(|| self.config.data.default_ttl.clone());

    CachePolicy {
      strategy,
      ttl,
      meta: options.meta.clone(),
    }
  }

  /// Flush, then fire `onSync` for every delivered envelope even when the
  /// pass also hit a storage failure.
  async fn process_queue(&self) -> Result<Vec<MutationEnvelope>> {
    let report = self.queue.flush().await;
    for envelope in &report.synced {
      self.plugins.trigger(Hook::Sync(envelope)).await;
    }
    report.into_result()
  }

  async fn handle_signal(&self, signal: SyncSignal) {
    debug!(?signal, "sync signal received");
    self.plugins.trigger(Hook::Online).await;
    if let Err(e) = self.process_queue().await {
      warn!(?signal, error = %e, "queue flush failed");
    }
  }

  async fn periodic_flush(&self, state: &HostState) {
    if !state.periodic_flush_allowed() {
      return;
    }
    if let Err(e) = self.process_queue().await {
      warn!(error = %e, "periodic queue flush failed");
    }
  }
}

/// Builder for [`Harbor`].
pub struct HarborBuilder {
  config: Config,
  store: Option<SharedStore>,
  plugins: Vec<Arc<dyn Plugin>>,
  host: Arc<dyn BackgroundHost>,
  clock: Arc<dyn Clock>,
  bus: EventBus,
}

impl HarborBuilder {
  /// Use this store instead of opening the configured database.
  pub fn store(mut self, store: SharedStore) -> Self {
    self.store = Some(store);
    self
  }

  pub fn plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
    self.plugins.push(plugin);
    self
  }

  pub fn plugins(mut self, plugins: impl IntoIterator<Item = Arc<dyn Plugin>>) -> Self {
    self.plugins.extend(plugins);
    self
  }

  pub fn host(mut self, host: Arc<dyn BackgroundHost>) -> Self {
    self.host = host;
    self
  }

  pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn event_bus(mut self, bus: EventBus) -> Self {
    self.bus = bus;
    self
  }

  /// Register plugins, wire up the cache and queue, and start the
  /// background flush tasks. Must be called inside a tokio runtime.
  pub async fn build(self) -> Result<Harbor> {
    let config = Arc::new(self.config);
    let store = match self.store {
      Some(store) => store,
      None => {
        let sqlite = match &config.storage.path {
          Some(path) => SqliteStore::open(path)?,
          None => SqliteStore::open_default()?,
        };
        Arc::new(sqlite) as SharedStore
      }
    };
    let http = HttpClient::new(&config.network)?;

    // Plugins are initialized before anything can fire a hook.
    let ctx = PluginContext::new(self.bus.clone(), config.clone(), self.clock.clone());
    let plugins = Arc::new(PluginPipeline::register(self.plugins, &ctx).await);

    let cache = CacheLayer::new(
      CacheIndex::new(store.clone()),
      http.clone(),
      plugins.clone(),
      self.clock.clone(),
    );
    let queue = MutationQueue::new(store, self.bus.clone(), http.clone())
      .with_max_attempts(config.queue.max_attempts);

    let core = Arc::new(Core {
      config,
      cache,
      queue,
      plugins,
      bus: self.bus,
      http,
      host: self.host,
      clock: self.clock,
    });

    let state = HostState::default();
    let (trigger, signals) = SyncTrigger::channel(state.clone());
    let tasks = vec![
      spawn_signal_listener(core.clone(), signals),
      spawn_periodic_flush(core.clone(), state.clone()),
    ];

    let interval = core.config.queue.periodic_interval();
    if let Err(e) = core.host.request_periodic_sync(PERIODIC_SYNC_TAG, interval).await {
      debug!(error = %e, "periodic sync registration refused");
    }

    info!(plugins = core.plugins.len(), "harbor ready");
    Ok(Harbor {
      core,
      trigger,
      state,
      tasks,
    })
  }
}

fn spawn_signal_listener(core: Arc<Core>, mut signals: mpsc::UnboundedReceiver<SyncSignal>) -> JoinHandle<()> {
  tokio::spawn(async move {
    while let Some(signal) = signals.recv().await {
      core.handle_signal(signal).await;
    }
  })
}

fn spawn_periodic_flush(core: Arc<Core>, state: HostState) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(core.config.queue.periodic_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
      ticker.tick().await;
      core.periodic_flush(&state).await;
    }
  })
}

/// Offline-first HTTP data client.
pub struct Harbor {
  core: Arc<Core>,
  trigger: SyncTrigger,
  state: HostState,
  tasks: Vec<JoinHandle<()>>,
}

impl Harbor {
  pub fn builder(config: Config) -> HarborBuilder {
    HarborBuilder {
      config,
      store: None,
      plugins: Vec::new(),
      host: Arc::new(NoopHost),
      clock: Arc::new(SystemClock),
      bus: EventBus::new(),
    }
  }

  /// Read `url`, returning the negotiated body.
  pub async fn get(&self, url: &str, options: GetOptions) -> Result<Payload> {
    let result = self.get_response(url, options).await?;
    Payload::from_response(&result.data)
  }

  /// Read `url` and decode the body as JSON into `T`.
  pub async fn get_json<T: DeserializeOwned>(&self, url: &str, options: GetOptions) -> Result<T> {
    let result = self.get_response(url, options).await?;
    Ok(serde_json::from_slice(&result.data.body)?)
  }

  /// Read `url`, returning the stored response and where it came from.
  pub async fn get_response(&self, url: &str, options: GetOptions) -> Result<CacheResult<CachedResponse>> {
    let policy = self.core.policy_for(url, &options);
    self
      .core
      .plugins
      .trigger(Hook::Fetch {
        url,
        request: &options.request,
      })
      .await;
    self.core.cache.fetch(url, &options.request, &policy).await
  }

  /// Send a write, queueing it when the remote cannot take it now.
  ///
  /// Network failures and non-success statuses queue the write. Requests that
  /// cannot be built at all are returned as errors, as are storage failures
  /// while queueing.
  pub async fn mutate(&self, url: &str, options: MutateOptions) -> Result<MutationOutcome> {
    let envelope = MutationEnvelope::new(url, &options.request, options.id, self.core.clock.now());

    match self
      .core
      .http
      .send_ok(url, &envelope.request_options(), "POST")
      .await
    {
      Ok(response) => Ok(MutationOutcome::Delivered(response)),
      Err(e) if e.is_remote_failure() => {
        debug!(id = %envelope.id, %url, error = %e, "write failed, queueing");
        self.core.queue.enqueue(&envelope).await?;
        self.core.plugins.trigger(Hook::MutateQueue(&envelope)).await;
        if let Err(e) = self.core.host.request_sync(SYNC_TAG).await {
          debug!(error = %e, "sync registration refused");
        }
        Ok(MutationOutcome::Queued(envelope))
      }
      Err(e) => Err(e),
    }
  }

  /// Run one flush pass now. Returns the envelopes delivered.
  pub async fn process_queue_now(&self) -> Result<Vec<MutationEnvelope>> {
    self.core.process_queue().await
  }

  pub async fn pending_mutations(&self) -> Result<Vec<MutationEnvelope>> {
    self.core.queue.pending().await
  }

  pub async fn dead_letters(&self) -> Result<Vec<MutationEnvelope>> {
    self.core.queue.dead_letters().await
  }

  pub async fn list_cache(&self) -> Result<Vec<IndexEntry>> {
    Ok(self.core.cache.index().list().await?)
  }

  pub async fn clear_cache(&self) -> Result<usize> {
    Ok(self.core.cache.index().clear_all().await?)
  }

  /// Drop entries whose TTL has run out by the client's clock.
  pub async fn clear_expired(&self) -> Result<usize> {
    self.clear_expired_at(self.core.clock.now()).await
  }

  pub async fn clear_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
    Ok(self.core.cache.index().clear_expired(now).await?)
  }

  pub async fn purge_cache(&self, prefix: &str) -> Result<usize> {
    Ok(self.core.cache.index().purge_by_prefix(prefix).await?)
  }

  /// Fetch every configured app-shell URL with network-then-cache.
  /// Returns how many were stored; failures are logged.
  pub async fn warm_app_shell(&self) -> Result<usize> {
    let mut warmed = 0;
    for url in &self.core.config.app_shell {
      let options = GetOptions::default().strategy(CacheStrategy::NetworkThenCache);
      match self.get_response(url, options).await {
        Ok(_) => warmed += 1,
        Err(e @ Error::Storage(_)) => return Err(e),
        Err(e) => warn!(%url, error = %e, "app shell fetch failed"),
      }
    }
    Ok(warmed)
  }

  pub fn events(&self) -> &EventBus {
    &self.core.bus
  }

  /// Handle for delivering connectivity and flush signals.
  pub fn trigger(&self) -> SyncTrigger {
    self.trigger.clone()
  }

  pub fn host_state(&self) -> &HostState {
    &self.state
  }

  pub fn config(&self) -> &Config {
    &self.core.config
  }

  pub fn plugin_names(&self) -> Vec<&str> {
    self.core.plugins.names()
  }
}

impl Drop for Harbor {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::FixedClock;
  use crate::db::testing::StickyMutations;
  use crate::event::{Event, EventName};
  use crate::plugins::testing::{FailingPlugin, RecordingPlugin};
  use async_trait::async_trait;
  use chrono::TimeZone;
  use serde_json::json;
  use std::sync::Mutex;
  use std::time::Duration;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[derive(Default)]
  struct RecordingHost {
    requests: Mutex<Vec<String>>,
  }

  #[async_trait]
  impl BackgroundHost for RecordingHost {
    async fn request_sync(&self, tag: &str) -> color_eyre::Result<()> {
      self.requests.lock().unwrap().push(tag.to_string());
      Ok(())
    }

    async fn request_periodic_sync(&self, tag: &str, min_interval: Duration) -> color_eyre::Result<()> {
      self
        .requests
        .lock()
        .unwrap()
        .push(format!("{}@{}s", tag, min_interval.as_secs()));
      Ok(())
    }
  }

  fn memory_store() -> SharedStore {
    Arc::new(SqliteStore::open_in_memory().unwrap())
  }

  fn builder(config: Config) -> HarborBuilder {
    Harbor::builder(config).store(memory_store())
  }

  async fn harbor_with_log(config: Config) -> (Harbor, Arc<Mutex<Vec<String>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let harbor = builder(config)
      .plugin(Arc::new(RecordingPlugin::new("rec", log.clone())))
      .build()
      .await
      .unwrap();
    (harbor, log)
  }

  fn sync_complete_channel(harbor: &Harbor) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    harbor.events().on(EventName::SyncComplete, move |_| {
      let _ = tx.send(());
    });
    rx
  }

  fn response(content_type: Option<&str>, body: &[u8]) -> CachedResponse {
    let mut headers = crate::net::Headers::new();
    if let Some(ct) = content_type {
      headers.insert("content-type".into(), ct.into());
    }
    CachedResponse {
      cached_at: Utc::now(),
      status: 200,
      headers,
      body: body.to_vec(),
    }
  }

  #[test]
  fn test_payload_negotiation() {
    let json = response(Some("application/json"), br#"{"a":1}"#);
    assert_eq!(Payload::from_response(&json).unwrap(), Payload::Json(json!({"a": 1})));

    let empty = response(Some("application/json"), b"");
    assert_eq!(Payload::from_response(&empty).unwrap(), Payload::Json(Value::Null));

    let text = response(Some("text/plain"), b"hello");
    assert_eq!(Payload::from_response(&text).unwrap().as_text(), Some("hello"));

    let untyped = response(None, br#"{"a":1}"#);
    assert!(matches!(Payload::from_response(&untyped).unwrap(), Payload::Text(_)));

    let broken = response(Some("application/json"), b"{nope");
    assert!(matches!(Payload::from_response(&broken), Err(Error::Decode(_))));
  }

  #[tokio::test]
  async fn test_policy_resolution_order() {
    let config = Config::from_yaml(
      r#"
data:
  default_policy: staleWhileRevalidate
  default_ttl: 5m
routes:
  "https://a.test/static/":
    strategy: cacheFirst
    max_age: 1d
"#,
    )
    .unwrap();
    let harbor = builder(config).build().await.unwrap();
    let core = &harbor.core;

    let p = core.policy_for("https://a.test/posts", &GetOptions::default());
    assert_eq!(p.strategy, CacheStrategy::StaleWhileRevalidate);
    assert_eq!(p.ttl.as_deref(), Some("5m"));

    let p = core.policy_for("https://a.test/static/app.js", &GetOptions::default());
    assert_eq!(p.strategy, CacheStrategy::CacheFirst);
    assert_eq!(p.ttl.as_deref(), Some("1d"));

    let explicit = GetOptions::default()
      .strategy(CacheStrategy::NetworkThenCache)
      .ttl("10s");
    let p = core.policy_for("https://a.test/static/app.js", &explicit);
    assert_eq!(p.strategy, CacheStrategy::NetworkThenCache);
    assert_eq!(p.ttl.as_deref(), Some("10s"));

    let bare = builder(Config::default()).build().await.unwrap();
    let p = bare.core.policy_for("https://a.test/", &GetOptions::default());
    assert_eq!(p.strategy, CacheStrategy::NetworkThenCache);
    assert!(p.ttl.is_none());
  }

  #[tokio::test]
  async fn test_get_fires_on_fetch_and_negotiates() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/posts"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
      .mount(&server)
      .await;
    Mock::given(method("GET"))
      .and(path("/about"))
      .respond_with(ResponseTemplate::new(200).set_body_string("plain words"))
      .mount(&server)
      .await;
    let (harbor, log) = harbor_with_log(Config::default()).await;
    let posts = format!("{}/posts", server.uri());

    let payload = harbor.get(&posts, GetOptions::default()).await.unwrap();
    assert_eq!(payload, Payload::Json(json!([{"id": 1}])));

    let about = harbor
      .get(&format!("{}/about", server.uri()), GetOptions::default())
      .await
      .unwrap();
    assert_eq!(about.as_text(), Some("plain words"));

    let typed: Vec<Value> = harbor.get_json(&posts, GetOptions::default()).await.unwrap();
    assert_eq!(typed.len(), 1);

    let log = log.lock().unwrap();
    assert_eq!(log[0], "rec:onInit");
    assert_eq!(log[1], format!("rec:onFetch:{}", posts));
    assert_eq!(log[2], format!("rec:onCacheWrite:GET {}", posts));
  }

  #[tokio::test]
  async fn test_mutate_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/posts"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;
    let (harbor, log) = harbor_with_log(Config::default()).await;

    let outcome = harbor
      .mutate(
        &format!("{}/posts", server.uri()),
        MutateOptions::new(RequestOptions::default().with_json(json!({"t": "x"}))),
      )
      .await
      .unwrap();

    assert!(!outcome.is_queued());
    assert_eq!(outcome.status(), 201);
    assert!(harbor.pending_mutations().await.unwrap().is_empty());
    assert_eq!(log.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_mutate_queues_on_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
      .respond_with(ResponseTemplate::new(503))
      .mount(&server)
      .await;
    let host = Arc::new(RecordingHost::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    let harbor = builder(Config::default())
      .host(host.clone())
      .plugin(Arc::new(RecordingPlugin::new("rec", log.clone())))
      .build()
      .await
      .unwrap();

    let counts = Arc::new(Mutex::new(Vec::new()));
    let sink = counts.clone();
    harbor.events().on(EventName::QueueCount, move |e| {
      if let Event::QueueCount { count } = e {
        sink.lock().unwrap().push(*count);
      }
    });

    let url = format!("{}/posts/1", server.uri());
    let outcome = harbor
      .mutate(
        &url,
        MutateOptions::new(RequestOptions::new("PUT").with_json(json!({"title": "t"}))).id("m-1"),
      )
      .await
      .unwrap();

    assert!(outcome.is_queued());
    assert_eq!(outcome.status(), QUEUED_STATUS);
    assert_eq!(outcome.status_text(), "Queued offline");

    let pending = harbor.pending_mutations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "m-1");
    assert_eq!(pending[0].method, "PUT");
    assert_eq!(pending[0].attempts, 0);

    assert_eq!(*counts.lock().unwrap(), vec![1]);
    assert!(log.lock().unwrap().contains(&"rec:onMutateQueue:m-1".to_string()));
    let requests = host.requests.lock().unwrap();
    assert_eq!(requests[0], format!("{}@300s", PERIODIC_SYNC_TAG));
    assert_eq!(requests[1], SYNC_TAG);
  }

  #[tokio::test]
  async fn test_mutate_invalid_request_is_not_queued() {
    let harbor = builder(Config::default()).build().await.unwrap();

    let err = harbor
      .mutate("not a url", MutateOptions::default())
      .await
      .unwrap_err();

    assert!(matches!(err, Error::InvalidRequest(_)));
    assert!(harbor.pending_mutations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_process_queue_now_fires_on_sync_past_failing_plugin() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500))
      .up_to_n_times(2)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let log = Arc::new(Mutex::new(Vec::new()));
    let harbor = builder(Config::default())
      .plugin(Arc::new(FailingPlugin { panic: false }))
      .plugin(Arc::new(FailingPlugin { panic: true }))
      .plugin(Arc::new(RecordingPlugin::new("rec", log.clone())))
      .build()
      .await
      .unwrap();

    let url = format!("{}/notes", server.uri());
    for id in ["a", "b"] {
      let outcome = harbor
        .mutate(&url, MutateOptions::default().id(id))
        .await
        .unwrap();
      assert!(outcome.is_queued());
    }

    let synced = harbor.process_queue_now().await.unwrap();
    let ids: Vec<_> = synced.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);

    let log = log.lock().unwrap();
    let syncs: Vec<_> = log.iter().filter(|l| l.starts_with("rec:onSync")).collect();
    assert_eq!(syncs, vec!["rec:onSync:a", "rec:onSync:b"]);
    assert!(harbor.process_queue_now().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_storage_failure_mid_pass_still_fires_on_sync() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(500))
      .up_to_n_times(3)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let store: SharedStore = Arc::new(StickyMutations {
      inner: memory_store(),
      sticky: vec!["b".to_string()],
    });
    let log = Arc::new(Mutex::new(Vec::new()));
    let harbor = Harbor::builder(Config::default())
      .store(store)
      .plugin(Arc::new(RecordingPlugin::new("rec", log.clone())))
      .build()
      .await
      .unwrap();

    let url = format!("{}/notes", server.uri());
    for id in ["a", "b", "c"] {
      let outcome = harbor.mutate(&url, MutateOptions::default().id(id)).await.unwrap();
      assert!(outcome.is_queued());
    }

    let err = harbor.process_queue_now().await.unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    let syncs: Vec<_> = log
      .lock()
      .unwrap()
      .iter()
      .filter(|l| l.starts_with("rec:onSync"))
      .cloned()
      .collect();
    assert_eq!(syncs, vec!["rec:onSync:a", "rec:onSync:c"]);
    let pending: Vec<_> = harbor
      .pending_mutations()
      .await
      .unwrap()
      .into_iter()
      .map(|m| m.id)
      .collect();
    assert_eq!(pending, vec!["b"]);
  }

  #[tokio::test]
  async fn test_online_signal_runs_hook_then_flush() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let (harbor, log) = harbor_with_log(Config::default()).await;
    let mut done = sync_complete_channel(&harbor);

    harbor
      .mutate(&server.uri(), MutateOptions::default().id("w"))
      .await
      .unwrap();

    let trigger = harbor.trigger();
    trigger.offline();
    assert!(!harbor.host_state().is_online());
    assert!(trigger.online());

    tokio::time::timeout(Duration::from_secs(5), done.recv())
      .await
      .unwrap()
      .unwrap();

    let log = log.lock().unwrap();
    let online = log.iter().position(|l| l == "rec:onOnline").unwrap();
    let synced = log.iter().position(|l| l == "rec:onSync:w").unwrap();
    assert!(online < synced);
    assert!(harbor.host_state().is_online());
  }

  #[tokio::test]
  async fn test_flush_now_signal_drains_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(204))
      .mount(&server)
      .await;
    let (harbor, log) = harbor_with_log(Config::default()).await;
    let mut done = sync_complete_channel(&harbor);

    harbor.mutate(&server.uri(), MutateOptions::default()).await.unwrap();
    assert!(harbor.trigger().flush_now());

    tokio::time::timeout(Duration::from_secs(5), done.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(harbor.pending_mutations().await.unwrap().is_empty());
    assert!(log.lock().unwrap().contains(&"rec:onOnline".to_string()));
  }

  #[tokio::test]
  async fn test_periodic_flush_only_while_online_and_foreground() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(503))
      .up_to_n_times(1)
      .mount(&server)
      .await;
    Mock::given(method("POST"))
      .respond_with(ResponseTemplate::new(200))
      .mount(&server)
      .await;
    let config = Config::from_yaml("queue:\n  periodic_interval: 20ms\n").unwrap();
    let harbor = builder(config).build().await.unwrap();
    let mut done = sync_complete_channel(&harbor);

    harbor.host_state().set_foreground(false);
    harbor.mutate(&server.uri(), MutateOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harbor.pending_mutations().await.unwrap().len(), 1);

    harbor.host_state().set_foreground(true);
    tokio::time::timeout(Duration::from_secs(5), done.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(harbor.pending_mutations().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_cache_management_passthroughs() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
      .mount(&server)
      .await;
    let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
    let clock = FixedClock::new(start);
    let harbor = builder(Config::default())
      .clock(Arc::new(clock.clone()))
      .build()
      .await
      .unwrap();
    let base = server.uri();

    harbor
      .get(&format!("{}/a/1", base), GetOptions::default().ttl("1m"))
      .await
      .unwrap();
    harbor
      .get(&format!("{}/a/2", base), GetOptions::default())
      .await
      .unwrap();
    harbor
      .get(&format!("{}/b/1", base), GetOptions::default().ttl("1h"))
      .await
      .unwrap();
    assert_eq!(harbor.list_cache().await.unwrap().len(), 3);

    clock.advance(chrono::Duration::minutes(2));
    assert_eq!(harbor.clear_expired().await.unwrap(), 1);

    assert_eq!(harbor.purge_cache(&format!("{}/a/", base)).await.unwrap(), 1);
    let left = harbor.list_cache().await.unwrap();
    assert_eq!(left.len(), 1);
    assert!(left[0].url.ends_with("/b/1"));

    assert_eq!(harbor.clear_cache().await.unwrap(), 1);
    assert!(harbor.list_cache().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_warm_app_shell_counts_successes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/shell.json"))
      .respond_with(ResponseTemplate::new(200).set_body_json(json!({"shell": true})))
      .mount(&server)
      .await;
    let mut config = Config::default();
    config.app_shell = vec![
      format!("{}/shell.json", server.uri()),
      format!("{}/missing.css", server.uri()),
    ];
    let harbor = builder(config).build().await.unwrap();

    assert_eq!(harbor.warm_app_shell().await.unwrap(), 1);

    let cached = harbor
      .get_response(
        &format!("{}/shell.json", server.uri()),
        GetOptions::default().strategy(CacheStrategy::CacheFirst),
      )
      .await
      .unwrap();
    assert_eq!(cached.source, CacheSource::Cache);
  }
}
