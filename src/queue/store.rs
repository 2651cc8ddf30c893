//! Durable FIFO of writes made while disconnected.
//!
//! Items are ordered by a monotonic `order_number` that is never reused: a
//! persisted high-water mark survives even after the newest item has been
//! delivered. Only the operations on [`WriteQueue`] may mutate queue rows;
//! the ordering is enforced here, not by SQLite.

use std::collections::HashSet;
use std::sync::Arc;

use mockable::Clock;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::clock::now_millis;
use crate::db::Database;
use crate::error::{Error, Result};

/// A pending write.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueItem {
  pub order_number: i64,
  /// Which remote write endpoint this payload targets
  pub kind: String,
  pub payload: Value,
  /// Identifies the remote row affected, used as the idempotency key
  pub correlation: Option<String>,
  /// Epoch ms
  pub enqueued_at: i64,
  /// Failed delivery attempts so far
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// A write to be enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWrite {
  pub kind: String,
  pub payload: Value,
  pub correlation: Option<String>,
}

const ITEM_COLUMNS: &str =
  "order_number, kind, payload, correlation, enqueued_at, attempts, last_error";

type RawItem = (i64, String, Vec<u8>, Option<String>, i64, u32, Option<String>);

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawItem> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn decode_item(raw: RawItem) -> Result<QueueItem> {
  let (order_number, kind, payload, correlation, enqueued_at, attempts, last_error) = raw;
  Ok(QueueItem {
    order_number,
    kind,
    payload: serde_json::from_slice(&payload)?,
    correlation,
    enqueued_at,
    attempts,
    last_error,
  })
}

fn query_one(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Option<QueueItem>> {
  conn
    .query_row(sql, params, read_raw)
    .optional()?
    .map(decode_item)
    .transpose()
}

#[derive(Clone)]
pub struct WriteQueue {
  db: Database,
  clock: Arc<dyn Clock>,
  changed: Arc<Notify>,
}

impl WriteQueue {
  pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
    Self {
      db,
      clock,
      changed: Arc::new(Notify::new()),
    }
  }

  /// Signalled whenever an item is enqueued.
  pub fn changes(&self) -> Arc<Notify> {
    Arc::clone(&self.changed)
  }

  /// Next order number: one past the highest ever issued, or the current
  /// time when the queue has never held an item.
  fn mint_order(&self, conn: &Connection) -> Result<i64> {
    let max: Option<i64> =
      conn.query_row("SELECT MAX(order_number) FROM write_queue", [], |row| row.get(0))?;
    let high_water: Option<i64> = conn
      .query_row(
        "SELECT high_water FROM write_queue_meta WHERE id = 1",
        [],
        |row| row.get(0),
      )
      .optional()?;

    let next = match max.max(high_water) {
      Some(highest) => highest + 1,
      None => now_millis(self.clock.as_ref()),
    };
    conn.execute(
      "INSERT INTO write_queue_meta (id, high_water) VALUES (1, ?1)
       ON CONFLICT(id) DO UPDATE SET high_water = excluded.high_water",
      params![next],
    )?;
    Ok(next)
  }

  /// Persist a write at the back of the queue.
  pub fn enqueue(&self, write: &NewWrite) -> Result<QueueItem> {
    let payload = serde_json::to_vec(&write.payload)?;
    let enqueued_at = now_millis(self.clock.as_ref());

    let order_number = {
      let mut conn = self.db.conn()?;
      let tx = conn.transaction()?;
      let order_number = self.mint_order(&tx)?;
      tx.execute(
        "INSERT INTO write_queue (order_number, kind, payload, correlation, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![order_number, write.kind, payload, write.correlation, enqueued_at],
      )?;
      tx.commit()?;
      order_number
    };

    debug!(order_number, kind = %write.kind, "write enqueued");
    self.changed.notify_one();
    Ok(QueueItem {
      order_number,
      kind: write.kind.clone(),
      payload: write.payload.clone(),
      correlation: write.correlation.clone(),
      enqueued_at,
      attempts: 0,
      last_error: None,
    })
  }

  /// The item with the lowest order number, left in place.
  pub fn peek_front(&self) -> Result<Option<QueueItem>> {
    let conn = self.db.conn()?;
    query_one(
      &conn,
      &format!(
        "SELECT {} FROM write_queue ORDER BY order_number LIMIT 1",
        ITEM_COLUMNS
      ),
      [],
    )
  }

  /// Remove and return the front item.
  pub fn dequeue(&self) -> Result<Option<QueueItem>> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    let front = query_one(
      &tx,
      &format!(
        "SELECT {} FROM write_queue ORDER BY order_number LIMIT 1",
        ITEM_COLUMNS
      ),
      [],
    )?;
    if let Some(item) = &front {
      tx.execute(
        "DELETE FROM write_queue WHERE order_number = ?1",
        params![item.order_number],
      )?;
    }
    tx.commit()?;
    Ok(front)
  }

  /// Defer an item behind everything currently queued. The item is deleted
  /// and re-inserted under a new maximum order number in one transaction;
  /// its attempt history is kept. Returns the new order number.
  pub fn move_to_end(&self, order_number: i64) -> Result<i64> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;
    let item = query_one(
      &tx,
      &format!(
        "SELECT {} FROM write_queue WHERE order_number = ?1",
        ITEM_COLUMNS
      ),
      params![order_number],
    )?
    .ok_or_else(|| Error::NotFound(format!("queue item {}", order_number)))?;

    let new_order = self.mint_order(&tx)?;
    tx.execute(
      "DELETE FROM write_queue WHERE order_number = ?1",
      params![order_number],
    )?;
    tx.execute(
      "INSERT INTO write_queue (order_number, kind, payload, correlation, enqueued_at, attempts, last_error)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
      params![
        new_order,
        item.kind,
        serde_json::to_vec(&item.payload)?,
        item.correlation,
        item.enqueued_at,
        item.attempts,
        item.last_error
      ],
    )?;
    tx.commit()?;

    debug!(from = order_number, to = new_order, "queue item moved to end");
    Ok(new_order)
  }

  /// Cancel a queued write. Returns whether it existed.
  pub fn delete_by_order(&self, order_number: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let removed = conn.execute(
      "DELETE FROM write_queue WHERE order_number = ?1",
      params![order_number],
    )?;
    Ok(removed > 0)
  }

  pub fn count(&self) -> Result<usize> {
    let conn = self.db.conn()?;
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM write_queue", [], |row| row.get(0))?;
    Ok(count as usize)
  }

  pub fn exists_by_order(&self, order_number: i64) -> Result<bool> {
    let conn = self.db.conn()?;
    let exists: bool = conn.query_row(
      "SELECT EXISTS(SELECT 1 FROM write_queue WHERE order_number = ?1)",
      params![order_number],
      |row| row.get(0),
    )?;
    Ok(exists)
  }

  /// Every queued item in order.
  pub fn list(&self) -> Result<Vec<QueueItem>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM write_queue ORDER BY order_number",
      ITEM_COLUMNS
    ))?;
    let raw = stmt
      .query_map([], read_raw)?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(decode_item).collect()
  }

  /// Highest order number currently queued.
  pub fn max_order(&self) -> Result<Option<i64>> {
    let conn = self.db.conn()?;
    Ok(conn.query_row("SELECT MAX(order_number) FROM write_queue", [], |row| row.get(0))?)
  }

  /// Lowest-ordered item at or below `ceiling` that is not in `exclude`.
  ///
  /// Rows whose payload no longer decodes are skipped so they cannot hold
  /// up the items behind them. They stay queued.
  pub fn front_within(&self, ceiling: i64, exclude: &HashSet<i64>) -> Result<Option<QueueItem>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(&format!(
      "SELECT {} FROM write_queue WHERE order_number <= ?1 ORDER BY order_number",
      ITEM_COLUMNS
    ))?;
    let mut rows = stmt.query(params![ceiling])?;
    while let Some(row) = rows.next()? {
      let raw = read_raw(row)?;
      let order_number = raw.0;
      if exclude.contains(&order_number) {
        continue;
      }
      match decode_item(raw) {
        Ok(item) => return Ok(Some(item)),
        Err(e) => warn!(order_number, error = %e, "skipping undecodable queue item"),
      }
    }
    Ok(None)
  }

  /// Count a failed delivery attempt. Returns the new attempt total.
  pub fn record_failure(&self, order_number: i64, error: &str) -> Result<u32> {
    let conn = self.db.conn()?;
    let attempts: Option<u32> = conn
      .query_row(
        "UPDATE write_queue SET attempts = attempts + 1, last_error = ?2
         WHERE order_number = ?1 RETURNING attempts",
        params![order_number, error],
        |row| row.get(0),
      )
      .optional()?;
    attempts.ok_or_else(|| Error::NotFound(format!("queue item {}", order_number)))
  }
}
