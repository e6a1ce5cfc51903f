//! The environment that wakes the client up when it is not running a request.
//!
//! A [`BackgroundHost`] accepts best-effort "call me back" registrations. The
//! other direction is a [`SyncTrigger`]: the host (or the embedding app) sends
//! connectivity and flush signals through it, and the client reacts on its own
//! task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Tag for the one-shot registration made after a write is queued.
pub const SYNC_TAG: &str = "harbor-sync";
/// Tag for the periodic registration made at startup.
pub const PERIODIC_SYNC_TAG: &str = "harbor-periodic-sync";

/// Something that can schedule work outside the foreground session.
///
/// Both registrations are hints. Failures are logged by the caller and
/// otherwise ignored.
#[async_trait]
pub trait BackgroundHost: Send + Sync {
  /// Ask to be signalled once connectivity allows a flush.
  async fn request_sync(&self, tag: &str) -> color_eyre::Result<()>;

  /// Ask to be signalled roughly every `min_interval`.
  async fn request_periodic_sync(&self, tag: &str, min_interval: Duration) -> color_eyre::Result<()>;
}

/// A host with no background capability.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHost;

#[async_trait]
impl BackgroundHost for NoopHost {
  async fn request_sync(&self, _tag: &str) -> color_eyre::Result<()> {
    Ok(())
  }

  async fn request_periodic_sync(&self, _tag: &str, _min_interval: Duration) -> color_eyre::Result<()> {
    Ok(())
  }
}

/// Signals delivered to the client's listener task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
  /// Connectivity was restored.
  Online,
  /// The host asked for a flush. Handled exactly like `Online`.
  FlushNow,
}

/// Online and foreground flags. The periodic flush only runs while both hold.
#[derive(Debug, Clone)]
pub struct HostState {
  online: Arc<AtomicBool>,
  foreground: Arc<AtomicBool>,
}

impl Default for HostState {
  fn default() -> Self {
    Self {
      online: Arc::new(AtomicBool::new(true)),
      foreground: Arc::new(AtomicBool::new(true)),
    }
  }
}

impl HostState {
  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_foreground(&self) -> bool {
    self.foreground.load(Ordering::SeqCst)
  }

  pub fn set_foreground(&self, foreground: bool) {
    self.foreground.store(foreground, Ordering::SeqCst);
  }

  pub fn periodic_flush_allowed(&self) -> bool {
    self.is_online() && self.is_foreground()
  }
}

/// Sending half of the client's signal channel.
#[derive(Debug, Clone)]
pub struct SyncTrigger {
  tx: mpsc::UnboundedSender<SyncSignal>,
  state: HostState,
}

impl SyncTrigger {
  pub(crate) fn channel(state: HostState) -> (Self, mpsc::UnboundedReceiver<SyncSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx, state }, rx)
  }

  /// Connectivity is back: mark online and request a flush.
  ///
  /// Returns false once the client has shut down.
  pub fn online(&self) -> bool {
    self.state.set_online(true);
    self.tx.send(SyncSignal::Online).is_ok()
  }

  /// Connectivity was lost. Pauses the periodic flush.
  pub fn offline(&self) {
    self.state.set_online(false);
  }

  /// Opaque "flush now" from the background host.
  pub fn flush_now(&self) -> bool {
    self.tx.send(SyncSignal::FlushNow).is_ok()
  }

  pub fn state(&self) -> &HostState {
    &self.state
  }
}
