pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Error, Result};

/// Handle to the local store.
///
/// Constructed explicitly and passed to every coordinator. Clones share the
/// same connection.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create database directory: {}", e)))?;
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened local store");
    Self::init(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Self::init(Connection::open_in_memory()?)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("rollcall").join("store.db"))
  }

  fn init(conn: Connection) -> Result<Self> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Cap the store size in pages. Writes past the cap fail with
  /// [`Error::QuotaExceeded`].
  pub fn set_max_pages(&self, pages: u64) -> Result<()> {
    let conn = self.conn()?;
    conn.query_row(&format!("PRAGMA max_page_count = {}", pages), [], |_| Ok(()))?;
    Ok(())
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    self.conn()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Lock the connection for one unit of work.
  pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }

  /// Close the store. Fails if other handles are still alive.
  pub fn close(self) -> Result<()> {
    let mutex = Arc::try_unwrap(self.conn)
      .map_err(|_| Error::Storage("store is still in use by other handles".to_string()))?;
    let conn = mutex
      .into_inner()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))?;
    conn.close().map_err(|(_, e)| Error::from(e))
  }
}
