//! Publish/subscribe bus for queue status events.
//!
//! Delivery is synchronous and in registration order. Nothing is persisted:
//! a listener added after an emission never sees it. Listener panics are not
//! caught; containing them is the listener's job.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::trace;

/// Queue status events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
  /// Number of mutations still pending.
  QueueCount { count: usize },
  /// The queue was drained by a flush pass.
  SyncComplete,
}

impl Event {
  pub fn name(&self) -> EventName {
    match self {
      Event::QueueCount { .. } => EventName::QueueCount,
      Event::SyncComplete => EventName::SyncComplete,
    }
  }
}

/// Reserved event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
  QueueCount,
  SyncComplete,
}

impl EventName {
  pub fn as_str(self) -> &'static str {
    match self {
      EventName::QueueCount => "queue:count",
      EventName::SyncComplete => "sync:complete",
    }
  }
}

impl fmt::Display for EventName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Registry {
  next_id: u64,
  listeners: Vec<(ListenerId, EventName, Listener)>,
}

/// Cheaply cloneable event bus; clones share listeners.
#[derive(Clone, Default)]
pub struct EventBus {
  registry: Arc<Mutex<Registry>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register `listener` for events named `name`.
  pub fn on<F>(&self, name: EventName, listener: F) -> ListenerId
  where
    F: Fn(&Event) + Send + Sync + 'static,
  {
    let mut registry = self.lock();
    registry.next_id += 1;
    let id = ListenerId(registry.next_id);
    registry.listeners.push((id, name, Arc::new(listener)));
    id
  }

  /// Remove a listener. Returns false if it was not registered.
  pub fn off(&self, id: ListenerId) -> bool {
    let mut registry = self.lock();
    let before = registry.listeners.len();
    registry.listeners.retain(|(lid, _, _)| *lid != id);
    registry.listeners.len() != before
  }

  /// Deliver `event` to every listener registered for its name.
  pub fn emit(&self, event: &Event) {
    let name = event.name();
    // Snapshot so listeners may subscribe or unsubscribe while we deliver.
    let targets: Vec<Listener> = self
      .lock()
      .listeners
      .iter()
      .filter(|(_, n, _)| *n == name)
      .map(|(_, _, l)| Arc::clone(l))
      .collect();

    trace!(event = %name, listeners = targets.len(), "emit");
    for listener in targets {
      listener(event);
    }
  }

  pub fn listener_count(&self, name: EventName) -> usize {
    self.lock().listeners.iter().filter(|(_, n, _)| *n == name).count()
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
    // Listeners run outside the lock, so the registry is never left half-updated.
    self.registry.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl fmt::Debug for EventBus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBus")
      .field("listeners", &self.lock().listeners.len())
      .finish()
  }
}
