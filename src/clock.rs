//! Time source shared by the cache, queue and plugins.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

/// Something that can tell the time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FixedClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(now)),
    }
  }

  pub fn set(&self, now: DateTime<Utc>) {
    if let Ok(mut guard) = self.now.lock() {
      *guard = now;
    }
  }

  pub fn advance(&self, by: chrono::Duration) {
    if let Ok(mut guard) = self.now.lock() {
      *guard += by;
    }
  }
}

impl Clock for FixedClock {
  fn now(&self) -> DateTime<Utc> {
    self.now.lock().map(|guard| *guard).unwrap_or_else(|_| Utc::now())
  }
}
