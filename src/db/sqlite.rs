//! SQLite-backed store implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{Partition, Store, WriteBatch, WriteOp};
use crate::error::StorageError;

/// Store that keeps each partition in its own SQLite table.
///
/// Access is serialized through a single connection, which gives same-key
/// writes last-writer-wins semantics. Blocking SQLite calls run on the tokio
/// blocking pool so callers can await them freely.
#[derive(Clone)]
pub struct SqliteStore {
  inner: Arc<Mutex<Inner>>,
}

struct Inner {
  conn: Connection,
  /// Partitions whose table is known to exist.
  opened: HashSet<Partition>,
}

impl Inner {
  fn ensure(&mut self, partition: Partition) -> Result<(), StorageError> {
    if self.opened.contains(&partition) {
      return Ok(());
    }

    self.conn.execute_batch(&format!(
      "CREATE TABLE IF NOT EXISTS {} (
          key TEXT PRIMARY KEY,
          value BLOB NOT NULL,
          updated_at TEXT NOT NULL DEFAULT (datetime('now'))
      );",
      partition.table()
    ))?;
    debug!(%partition, "opened partition");
    self.opened.insert(partition);
    Ok(())
  }
}

impl SqliteStore {
  /// Open (or create) a store at `path`.
  pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
    let path = path.as_ref();

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    let mode: String =
      conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    debug!(path = %path.display(), journal_mode = %mode, "opened sqlite store");
    Self::from_connection(conn)
  }

  /// Open the store at the default location.
  pub fn open_default() -> Result<Self, StorageError> {
    Self::open(Self::default_path()?)
  }

  /// A private, non-persistent store. Mostly useful for tests.
  pub fn open_in_memory() -> Result<Self, StorageError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StorageError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StorageError::NoDataDir)?;

    Ok(data_dir.join("harbor").join("store.db"))
  }

  fn from_connection(conn: Connection) -> Result<Self, StorageError> {
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(Self {
      inner: Arc::new(Mutex::new(Inner {
        conn,
        opened: HashSet::new(),
      })),
    })
  }

  async fn with_inner<R, F>(&self, f: F) -> Result<R, StorageError>
  where
    F: FnOnce(&mut Inner) -> Result<R, StorageError> + Send + 'static,
    R: Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    tokio::task::spawn_blocking(move || {
      let mut guard = inner.lock().map_err(|_| StorageError::Poisoned)?;
      f(&mut guard)
    })
    .await?
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn get_raw(&self, partition: Partition, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
    let key = key.to_string();
    self
      .with_inner(move |inner| {
        inner.ensure(partition)?;
        let value = inner
          .conn
          .query_row(
            &format!("SELECT value FROM {} WHERE key = ?", partition.table()),
            params![key],
            |row| row.get::<_, Vec<u8>>(0),
          )
          .optional()?;
        Ok(value)
      })
      .await
  }

  async fn list_raw(&self, partition: Partition) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
    self
      .with_inner(move |inner| {
        inner.ensure(partition)?;
        let mut stmt = inner
          .conn
          .prepare(&format!("SELECT key, value FROM {} ORDER BY rowid", partition.table()))?;
        let rows = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
          .collect::<Result<Vec<(String, Vec<u8>)>, _>>()?;
        Ok(rows)
      })
      .await
  }

  async fn keys(&self, partition: Partition) -> Result<Vec<String>, StorageError> {
    self
      .with_inner(move |inner| {
        inner.ensure(partition)?;
        let mut stmt = inner
          .conn
          .prepare(&format!("SELECT key FROM {} ORDER BY rowid", partition.table()))?;
        let keys = stmt
          .query_map([], |row| row.get(0))?
          .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
      })
      .await
  }

  async fn apply(&self, batch: WriteBatch) -> Result<(), StorageError> {
    if batch.is_empty() {
      return Ok(());
    }

    let ops = batch.into_ops();
    self
      .with_inner(move |inner| {
        for op in &ops {
          let partition = match op {
            WriteOp::Put { partition, .. } | WriteOp::Delete { partition, .. } => *partition,
          };
          inner.ensure(partition)?;
        }

        let tx = inner.conn.transaction()?;
        for op in ops {
          match op {
            WriteOp::Put {
              partition,
              key,
              value,
            } => {
              // Upsert keeps the first rowid, so listings stay in insertion order.
              tx.execute(
                &format!(
                  "INSERT INTO {} (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                   ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                  partition.table()
                ),
                params![key, value],
              )?;
            }
            WriteOp::Delete { partition, key } => {
              tx.execute(
                &format!("DELETE FROM {} WHERE key = ?", partition.table()),
                params![key],
              )?;
            }
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await
  }
}
