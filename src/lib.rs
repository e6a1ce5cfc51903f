//! Offline-first HTTP data layer.
//!
//! Reads are cached in a local SQLite store and served according to a
//! per-request [`CacheStrategy`]. Writes that cannot reach the network are
//! queued durably and replayed when connectivity returns. Plugins observe the
//! whole lifecycle through a fixed set of hooks.

pub mod cache;
pub mod client;
pub mod clock;
pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod host;
pub mod net;
pub mod plugins;
pub mod queue;

pub use cache::{CacheResult, CacheSource, CacheStrategy, CachedResponse, IndexEntry};
pub use client::{GetOptions, Harbor, HarborBuilder, MutateOptions, MutationOutcome, Payload};
pub use config::Config;
pub use error::{Error, Result, StorageError};
pub use event::{Event, EventBus, EventName, ListenerId};
pub use net::{RequestBody, RequestOptions};
pub use queue::{FlushReport, MutationEnvelope};
