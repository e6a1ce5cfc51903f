//! Durable queue of writes waiting for the network.
//!
//! The queue holds no timers. Something outside (a connectivity signal, the
//! periodic flush, an explicit call) asks for a [`flush`](MutationQueue::flush)
//! and every pending envelope gets exactly one attempt in that pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::db::{Partition, SharedStore, Store, StoreExt, WriteBatch};
use crate::error::{Error, Result};
use crate::event::{Event, EventBus};
use crate::net::{Headers, HttpClient, RequestBody, RequestOptions};

/// One pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
  pub id: String,
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub headers: Headers,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub body: Option<RequestBody>,
  pub enqueued_at: DateTime<Utc>,
  /// Failed delivery attempts so far.
  pub attempts: u32,
}

impl MutationEnvelope {
  /// Build an envelope for a write to `url`.
  ///
  /// The method defaults to POST and, when no headers are given, the
  /// content type defaults to JSON. A fresh id is generated unless one is
  /// supplied.
  pub fn new(url: &str, request: &RequestOptions, id: Option<String>, now: DateTime<Utc>) -> Self {
    let mut headers = request.headers.clone();
    if headers.is_empty() {
      headers.insert("content-type".to_string(), "application/json".to_string());
    }

    Self {
      id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
      url: url.to_string(),
      method: request.method_or("POST"),
      headers,
      body: request.body.clone(),
      enqueued_at: now,
      attempts: 0,
    }
  }

  /// The request this envelope replays.
  pub fn request_options(&self) -> RequestOptions {
    RequestOptions {
      method: Some(self.method.clone()),
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Outcome of one flush pass.
#[derive(Debug, Default)]
pub struct FlushReport {
  /// Envelopes delivered and removed, in the order they were processed.
  pub synced: Vec<MutationEnvelope>,
  /// First storage failure hit during the pass.
  pub error: Option<Error>,
}

impl FlushReport {
  fn fail(&mut self, error: Error) {
    warn!(error = %error, "storage failure during flush pass");
    self.error.get_or_insert(error);
  }

  /// The delivered envelopes, or the first storage failure.
  pub fn into_result(self) -> Result<Vec<MutationEnvelope>> {
    match self.error {
      Some(e) => Err(e),
      None => Ok(self.synced),
    }
  }
}

/// The `mutations` partition plus delivery logic.
pub struct MutationQueue {
  store: SharedStore,
  bus: EventBus,
  http: HttpClient,
  /// Failed attempts before an envelope is dead-lettered; `None` retries forever.
  max_attempts: Option<u32>,
  /// Serializes flush passes.
  flushing: Mutex<()>,
}

impl MutationQueue {
  pub fn new(store: SharedStore, bus: EventBus, http: HttpClient) -> Self {
    Self {
      store,
      bus,
      http,
      max_attempts: None,
      flushing: Mutex::new(()),
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
    self.max_attempts = max_attempts.filter(|n| *n > 0);
    self
  }

  /// Persist an envelope and announce the new pending count.
  pub async fn enqueue(&self, envelope: &MutationEnvelope) -> Result<()> {
    self
      .store
      .set(Partition::Mutations, &envelope.id, envelope)
      .await?;
    debug!(id = %envelope.id, method = %envelope.method, url = %envelope.url, "queued mutation");
    self.publish_count().await
  }

  /// Pending envelopes in delivery order (oldest first).
  ///
  /// The store lists in no particular order, so the queue sorts by enqueue time.
  pub async fn pending(&self) -> Result<Vec<MutationEnvelope>> {
    let mut pending: Vec<MutationEnvelope> = self.store.list_all(Partition::Mutations).await?;
    // Stable sort keeps the store's listing order for equal timestamps.
    pending.sort_by_key(|m| m.enqueued_at);
    Ok(pending)
  }

  pub async fn count(&self) -> Result<usize> {
    Ok(self.store.keys(Partition::Mutations).await?.len())
  }

  /// Envelopes that exhausted their attempt budget.
  pub async fn dead_letters(&self) -> Result<Vec<MutationEnvelope>> {
    let mut dead: Vec<MutationEnvelope> = self.store.list_all(Partition::DeadLetters).await?;
    dead.sort_by_key(|m| m.enqueued_at);
    Ok(dead)
  }

  /// Try to deliver every pending envelope once.
  ///
  /// Envelopes are attempted one after another. A delivered envelope is
  /// removed and the new count published; a failed one stays queued with its
  /// attempt counter bumped. A storage failure on one envelope is recorded
  /// in the report and the pass moves on. `sync:complete` is emitted when
  /// this pass leaves the queue empty.
  pub async fn flush(&self) -> FlushReport {
    let _pass = self.flushing.lock().await;
    let mut report = FlushReport::default();

    let pending = match self.pending().await {
      Ok(pending) => pending,
      Err(e) => {
        report.fail(e);
        return report;
      }
    };
    if pending.is_empty() {
      return report;
    }
    info!(pending = pending.len(), "flushing mutation queue");

    for envelope in pending {
      if let Err(e) = self.attempt(envelope, &mut report.synced).await {
        report.fail(e);
      }
    }

    match self.count().await {
      Ok(remaining) => {
        info!(synced = report.synced.len(), remaining, "flush pass finished");
        if remaining == 0 {
          self.bus.emit(&Event::SyncComplete);
        }
      }
      Err(e) => report.fail(e),
    }
    report
  }

  /// Deliver one envelope, pushing it onto `synced` once it has left the queue.
  async fn attempt(&self, mut envelope: MutationEnvelope, synced: &mut Vec<MutationEnvelope>) -> Result<()> {
    match self
      .http
      .send_ok(&envelope.url, &envelope.request_options(), "POST")
      .await
    {
      Ok(_) => {
        self.store.delete(Partition::Mutations, &envelope.id).await?;
        debug!(id = %envelope.id, url = %envelope.url, "delivered mutation");
        synced.push(envelope);
        self.publish_count().await
      }
      Err(e) => {
        envelope.attempts += 1;
        debug!(id = %envelope.id, attempts = envelope.attempts, error = %e, "mutation still pending");
        self.record_failure(&envelope).await
      }
    }
  }

  async fn record_failure(&self, envelope: &MutationEnvelope) -> Result<()> {
    match self.max_attempts {
      Some(max) if envelope.attempts >= max => {
        let mut batch = WriteBatch::new();
        batch.delete(Partition::Mutations, envelope.id.as_str());
        batch.put(Partition::DeadLetters, envelope.id.as_str(), envelope)?;
        self.store.apply(batch).await?;
        warn!(id = %envelope.id, url = %envelope.url, attempts = envelope.attempts, "mutation dead-lettered");
        self.publish_count().await
      }
      _ => {
        self
          .store
          .set(Partition::Mutations, &envelope.id, envelope)
          .await?;
        Ok(())
      }
    }
  }

  async fn publish_count(&self) -> Result<()> {
    let count = self.count().await?;
    self.bus.emit(&Event::QueueCount { count });
    Ok(())
  }
}
