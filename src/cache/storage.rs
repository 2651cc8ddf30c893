//! Cache storage trait and SQLite implementation.

use std::collections::HashSet;
use std::ops::ControlFlow;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

use super::registry::Collection;
use super::traits::{CachedRecord, Cacheable, RecordKey};
use crate::db::Database;
use crate::error::Result;

/// Outcome of aligning a collection with an authoritative remote set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  /// Local keys removed because the remote no longer returns them.
  pub pruned: usize,
  /// Records written from the remote response.
  pub upserted: usize,
}

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Insert a new record. Fails with a constraint error if the key exists.
  fn insert<T: Cacheable>(&self, entity: &T, now: i64) -> Result<()>;

  /// Insert or replace a record, stamping `now` as its local update time.
  fn put<T: Cacheable>(&self, entity: &T, now: i64) -> Result<()>;

  /// Get a single record by key.
  fn get<T: Cacheable>(&self, key: &RecordKey) -> Result<Option<CachedRecord<T>>>;

  /// All records of `T`'s collection, ordered by key.
  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedRecord<T>>>;

  /// Records of `T`'s collection stored under a scope index value.
  fn get_all_by_index<T: Cacheable>(&self, scope: &str) -> Result<Vec<CachedRecord<T>>>;

  /// Delete a record. Returns whether it existed.
  fn delete(&self, collection: Collection, key: &RecordKey) -> Result<bool>;

  /// Remove every record of a collection. Returns how many were removed.
  fn clear(&self, collection: Collection) -> Result<usize>;

  /// Number of records stored for a collection.
  fn count(&self, collection: Collection) -> Result<usize>;

  /// Newest local update time in a collection, optionally within one scope.
  fn max_cached_at(&self, collection: Collection, scope: Option<&str>) -> Result<Option<i64>>;

  /// Visit records in key order until `visit` breaks.
  fn for_each<T, F>(&self, visit: F) -> Result<()>
  where
    T: Cacheable,
    F: FnMut(CachedRecord<T>) -> ControlFlow<()>;

  /// Prune local keys absent from `entities`, then upsert every entity.
  fn reconcile<T: Cacheable>(&self, entities: &[T], now: i64) -> Result<ReconcileReport>;
}

/// SQLite-based cache storage implementation.
#[derive(Clone)]
pub struct SqliteStorage {
  db: Database,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  fn load_rows<T: Cacheable>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
  ) -> Result<Vec<CachedRecord<T>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(params, |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, Vec<u8>>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })?
      .collect::<rusqlite::Result<Vec<_>>>()?;

    // Undecodable rows are skipped rather than failing the whole read
    Ok(
      rows
        .into_iter()
        .filter_map(|(key, data, cached_at)| match decode_row(key, &data, cached_at) {
          Ok(record) => Some(record),
          Err(e) => {
            warn!(collection = %T::COLLECTION, error = %e, "skipping undecodable cached record");
            None
          }
        })
        .collect(),
    )
  }
}

fn decode_row<T: Cacheable>(key: String, data: &[u8], cached_at: i64) -> Result<CachedRecord<T>> {
  Ok(CachedRecord {
    key: RecordKey::new(key),
    value: serde_json::from_slice(data)?,
    cached_at,
  })
}

fn upsert_row<T: Cacheable>(conn: &Connection, entity: &T, now: i64) -> Result<()> {
  let data = serde_json::to_vec(entity)?;
  conn.execute(
    "INSERT INTO records (collection, record_key, scope, data, cached_at)
     VALUES (?1, ?2, ?3, ?4, ?5)
     ON CONFLICT(collection, record_key) DO UPDATE SET
       scope = excluded.scope,
       data = excluded.data,
       cached_at = MAX(records.cached_at, excluded.cached_at)",
    params![
      T::COLLECTION.store_name(),
      entity.cache_key().as_str(),
      entity.scope(),
      data,
      now
    ],
  )?;
  Ok(())
}

impl CacheStorage for SqliteStorage {
  fn insert<T: Cacheable>(&self, entity: &T, now: i64) -> Result<()> {
    let conn = self.db.conn()?;
    let data = serde_json::to_vec(entity)?;
    conn.execute(
      "INSERT INTO records (collection, record_key, scope, data, cached_at)
       VALUES (?1, ?2, ?3, ?4, ?5)",
      params![
        T::COLLECTION.store_name(),
        entity.cache_key().as_str(),
        entity.scope(),
        data,
        now
      ],
    )?;
    Ok(())
  }

  fn put<T: Cacheable>(&self, entity: &T, now: i64) -> Result<()> {
    let conn = self.db.conn()?;
    upsert_row(&conn, entity, now)
  }

  fn get<T: Cacheable>(&self, key: &RecordKey) -> Result<Option<CachedRecord<T>>> {
    let conn = self.db.conn()?;
    let row: Option<(Vec<u8>, i64)> = conn
      .query_row(
        "SELECT data, cached_at FROM records WHERE collection = ?1 AND record_key = ?2",
        params![T::COLLECTION.store_name(), key.as_str()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    row
      .map(|(data, cached_at)| decode_row(key.as_str().to_string(), &data, cached_at))
      .transpose()
  }

  fn get_all<T: Cacheable>(&self) -> Result<Vec<CachedRecord<T>>> {
    let conn = self.db.conn()?;
    Self::load_rows(
      &conn,
      "SELECT record_key, data, cached_at FROM records
       WHERE collection = ?1 ORDER BY record_key",
      params![T::COLLECTION.store_name()],
    )
  }

  fn get_all_by_index<T: Cacheable>(&self, scope: &str) -> Result<Vec<CachedRecord<T>>> {
    let conn = self.db.conn()?;
    Self::load_rows(
      &conn,
      "SELECT record_key, data, cached_at FROM records
       WHERE collection = ?1 AND scope = ?2 ORDER BY record_key",
      params![T::COLLECTION.store_name(), scope],
    )
  }

  fn delete(&self, collection: Collection, key: &RecordKey) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM records WHERE collection = ?1 AND record_key = ?2",
      params![collection.store_name(), key.as_str()],
    )?;
    Ok(removed > 0)
  }

  fn clear(&self, collection: Collection) -> Result<usize> {
    let conn = self.db.conn()?;
    Ok(conn.execute(
      "DELETE FROM records WHERE collection = ?1",
      params![collection.store_name()],
    )?)
  }

  fn count(&self, collection: Collection) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row(
      "SELECT COUNT(*) FROM records WHERE collection = ?1",
      params![collection.store_name()],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }

  fn max_cached_at(&self, collection: Collection, scope: Option<&str>) -> Result<Option<i64>> {
    let conn = self.db.conn()?;
    let max = match scope {
      Some(scope) => conn.query_row(
        "SELECT MAX(cached_at) FROM records WHERE collection = ?1 AND scope = ?2",
        params![collection.store_name(), scope],
        |row| row.get(0),
      )?,
      None => conn.query_row(
        "SELECT MAX(cached_at) FROM records WHERE collection = ?1",
        params![collection.store_name()],
        |row| row.get(0),
      )?,
    };
    Ok(max)
  }

  fn for_each<T, F>(&self, mut visit: F) -> Result<()>
  where
    T: Cacheable,
    F: FnMut(CachedRecord<T>) -> ControlFlow<()>,
  {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT record_key, data, cached_at FROM records
       WHERE collection = ?1 ORDER BY record_key",
    )?;
    let mut rows = stmt.query(params![T::COLLECTION.store_name()])?;

    while let Some(row) = rows.next()? {
      let key: String = row.get(0)?;
      let data: Vec<u8> = row.get(1)?;
      let cached_at: i64 = row.get(2)?;
      match decode_row::<T>(key, &data, cached_at) {
        Ok(record) => {
          if visit(record).is_break() {
            break;
          }
        }
        Err(e) => warn!(collection = %T::COLLECTION, error = %e, "skipping undecodable cached record"),
      }
    }
    Ok(())
  }

  fn reconcile<T: Cacheable>(&self, entities: &[T], now: i64) -> Result<ReconcileReport> {
    let mut conn = self.db.conn()?;
    let collection = T::COLLECTION.store_name();
    let tx = conn.transaction()?;

    let local_keys: HashSet<String> = {
      let mut stmt = tx.prepare("SELECT record_key FROM records WHERE collection = ?1")?;
      let keys = stmt
        .query_map(params![collection], |row| row.get(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
      keys
    };
    let remote_keys: HashSet<String> = entities
      .iter()
      .map(|e| e.cache_key().as_str().to_string())
      .collect();

    let mut report = ReconcileReport::default();
    for stale in local_keys.difference(&remote_keys) {
      report.pruned += tx.execute(
        "DELETE FROM records WHERE collection = ?1 AND record_key = ?2",
        params![collection, stale],
      )?;
    }

    for entity in entities {
      upsert_row(&tx, entity, now)?;
      report.upserted += 1;
    }

    tx.commit()?;
    Ok(report)
  }
}
