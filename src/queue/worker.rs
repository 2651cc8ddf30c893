//! Bounded-concurrency drainer for the write queue.
//!
//! A pass snapshots the highest queued order number and delivers every item
//! at or below it, keeping up to `concurrency` deliveries outstanding. Items
//! that exhaust their retries are moved behind the snapshot, so they wait for
//! the next pass instead of blocking the head. Nothing is ever dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::{QueueItem, WriteQueue};
use crate::error::{Error, Result};
use crate::event::{EventSink, SyncEvent};
use crate::remote::WriteSink;

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Deliveries kept in flight at once.
  pub concurrency: usize,
  /// Retries after the first failed attempt, per pass.
  pub max_retries: u32,
  pub retry_delay: Duration,
  /// Start the background driver on construction.
  pub auto_start: bool,
  /// How long the driver sleeps when the queue is idle.
  pub idle_interval: Duration,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      concurrency: 2,
      max_retries: 3,
      retry_delay: Duration::from_secs(2),
      auto_start: false,
      idle_interval: Duration::from_secs(30),
    }
  }
}

/// Tally of one or more passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
  pub delivered: usize,
  /// Exhausted retries and moved to the tail
  pub deferred: usize,
  /// Aborted through a cancel handle, still queued
  pub cancelled: usize,
  /// Local store failures while handling an item
  pub errors: usize,
}

impl PassReport {
  fn absorb(&mut self, other: PassReport) {
    self.delivered += other.delivered;
    self.deferred += other.deferred;
    self.cancelled += other.cancelled;
    self.errors += other.errors;
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
  Delivered,
  Deferred,
  Cancelled,
}

struct PoolInner {
  queue: WriteQueue,
  processor: Arc<dyn WriteSink>,
  config: PoolConfig,
  events: EventSink,
  in_flight: Mutex<HashMap<i64, CancellationToken>>,
  paused: AtomicBool,
  pass_token: Mutex<CancellationToken>,
  /// Held for the whole of a pass so concurrent passes never share items
  pass_lock: tokio::sync::Mutex<()>,
  shutdown: CancellationToken,
}

/// Cancel handle registration that is removed however the delivery ends.
struct InFlightEntry<'a> {
  map: &'a Mutex<HashMap<i64, CancellationToken>>,
  order_number: i64,
}

impl<'a> InFlightEntry<'a> {
  fn register(
    map: &'a Mutex<HashMap<i64, CancellationToken>>,
    order_number: i64,
    token: &CancellationToken,
  ) -> Self {
    if let Ok(mut in_flight) = map.lock() {
      in_flight.insert(order_number, token.clone());
    }
    Self { map, order_number }
  }
}

impl Drop for InFlightEntry<'_> {
  fn drop(&mut self) {
    if let Ok(mut in_flight) = self.map.lock() {
      in_flight.remove(&self.order_number);
    }
  }
}

pub struct WorkerPool {
  inner: Arc<PoolInner>,
  driver: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
  pub fn new(
    queue: WriteQueue,
    processor: Arc<dyn WriteSink>,
    config: PoolConfig,
    events: EventSink,
  ) -> Self {
    let shutdown = CancellationToken::new();
    let auto_start = config.auto_start;
    let pool = Self {
      inner: Arc::new(PoolInner {
        queue,
        processor,
        config,
        events,
        in_flight: Mutex::new(HashMap::new()),
        paused: AtomicBool::new(false),
        pass_token: Mutex::new(shutdown.child_token()),
        pass_lock: tokio::sync::Mutex::new(()),
        shutdown,
      }),
      driver: Mutex::new(None),
    };
    if auto_start {
      pool.start();
    }
    pool
  }

  /// Spawn the background driver. No-op if already running.
  pub fn start(&self) {
    let Ok(mut driver) = self.driver.lock() else {
      return;
    };
    if driver.as_ref().is_some_and(|h| !h.is_finished()) {
      return;
    }
    let inner = Arc::clone(&self.inner);
    *driver = Some(tokio::spawn(async move { inner.drive().await }));
    info!(concurrency = self.inner.config.concurrency, "write queue worker started");
  }

  /// Run one pass over the items queued right now.
  pub async fn run_pass(&self) -> Result<PassReport> {
    self.inner.run_pass().await
  }

  /// Run passes until the queue is empty or two consecutive passes deliver
  /// nothing.
  pub async fn drain(&self) -> Result<PassReport> {
    let mut total = PassReport::default();
    let mut idle_passes = 0;
    while self.inner.queue.count()? > 0 && idle_passes < 2 {
      let report = self.inner.run_pass().await?;
      if report.delivered == 0 {
        idle_passes += 1;
      } else {
        idle_passes = 0;
      }
      total.absorb(report);
      if self.is_paused() {
        break;
      }
    }
    Ok(total)
  }

  /// Abort one in-flight delivery. The item stays queued.
  pub fn cancel(&self, order_number: i64) -> bool {
    let in_flight = match self.inner.in_flight.lock() {
      Ok(guard) => guard,
      Err(_) => return false,
    };
    match in_flight.get(&order_number) {
      Some(token) => {
        token.cancel();
        true
      }
      None => false,
    }
  }

  /// Abort every in-flight delivery and stop starting new ones until
  /// [`resume`](Self::resume). Queue contents are untouched.
  pub fn pause(&self) {
    self.inner.paused.store(true, Ordering::SeqCst);
    if let Ok(token) = self.inner.pass_token.lock() {
      token.cancel();
    }
    info!("write queue paused");
  }

  pub fn resume(&self) {
    if let Ok(mut token) = self.inner.pass_token.lock() {
      *token = self.inner.shutdown.child_token();
    }
    self.inner.paused.store(false, Ordering::SeqCst);
    self.inner.queue.changes().notify_one();
    info!("write queue resumed");
  }

  pub fn is_paused(&self) -> bool {
    self.inner.paused.load(Ordering::SeqCst)
  }

  /// Order numbers currently being delivered.
  pub fn in_flight(&self) -> Vec<i64> {
    let mut orders: Vec<i64> = self
      .inner
      .in_flight
      .lock()
      .map(|m| m.keys().copied().collect())
      .unwrap_or_default();
    orders.sort_unstable();
    orders
  }

  /// Stop the driver, aborting in-flight deliveries.
  pub async fn shutdown(&self) {
    self.inner.shutdown.cancel();
    let handle = self.driver.lock().ok().and_then(|mut d| d.take());
    if let Some(handle) = handle {
      if let Err(e) = handle.await {
        error!(error = %e, "write queue driver panicked");
      }
    }
  }
}

impl Drop for WorkerPool {
  fn drop(&mut self) {
    self.inner.shutdown.cancel();
  }
}

impl PoolInner {
  fn current_pass_token(&self) -> Option<CancellationToken> {
    if self.paused.load(Ordering::SeqCst) {
      return None;
    }
    self.pass_token.lock().ok().map(|t| t.clone())
  }

  async fn drive(&self) {
    let changes = self.queue.changes();
    loop {
      if self.shutdown.is_cancelled() {
        break;
      }
      match self.run_pass().await {
        Ok(report) if report.delivered > 0 => continue,
        Ok(_) => {}
        Err(e) => error!(error = %e, "write queue pass failed"),
      }
      tokio::select! {
        _ = self.shutdown.cancelled() => break,
        _ = changes.notified() => {}
        _ = tokio::time::sleep(self.config.idle_interval) => {}
      }
    }
    debug!("write queue driver stopped");
  }

  async fn run_pass(&self) -> Result<PassReport> {
    let _pass = self.pass_lock.lock().await;
    let mut report = PassReport::default();
    let Some(token) = self.current_pass_token() else {
      return Ok(report);
    };
    let Some(ceiling) = self.queue.max_order()? else {
      return Ok(report);
    };

    let concurrency = self.config.concurrency.max(1);
    let mut claimed = HashSet::new();
    let mut running = FuturesUnordered::new();

    let mut exhausted = false;

    loop {
      while !exhausted && running.len() < concurrency && !token.is_cancelled() {
        match self.queue.front_within(ceiling, &claimed) {
          Ok(Some(item)) => {
            claimed.insert(item.order_number);
            running.push(self.deliver(item, token.child_token()));
          }
          Ok(None) => exhausted = true,
          Err(e) => {
            // Let in-flight deliveries finish, start nothing new
            error!(error = %e, "failed to read write queue");
            report.errors += 1;
            exhausted = true;
          }
        }
      }

      match running.next().await {
        Some(Ok(Delivery::Delivered)) => report.delivered += 1,
        Some(Ok(Delivery::Deferred)) => report.deferred += 1,
        Some(Ok(Delivery::Cancelled)) => report.cancelled += 1,
        Some(Err(e)) => {
          error!(error = %e, "failed to update write queue");
          report.errors += 1;
        }
        None => break,
      }
    }

    if report != PassReport::default() {
      info!(
        delivered = report.delivered,
        deferred = report.deferred,
        cancelled = report.cancelled,
        "write queue pass finished"
      );
    }
    Ok(report)
  }

  async fn deliver(&self, item: QueueItem, token: CancellationToken) -> Result<Delivery> {
    let _entry = InFlightEntry::register(&self.in_flight, item.order_number, &token);
    self.attempt_delivery(&item, &token).await
  }

  async fn attempt_delivery(&self, item: &QueueItem, token: &CancellationToken) -> Result<Delivery> {
    let order_number = item.order_number;
    let mut retries = 0;

    loop {
      let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled),
        result = self.processor.submit(item) => result,
      };

      match result {
        Ok(()) => {
          self.queue.delete_by_order(order_number)?;
          debug!(order_number, "write delivered");
          self.events.emit(SyncEvent::WriteDelivered { order_number });
          return Ok(Delivery::Delivered);
        }
        Err(Error::Cancelled) => {
          debug!(order_number, "delivery cancelled, item stays queued");
          return Ok(Delivery::Cancelled);
        }
        Err(e) => {
          let attempts = self.queue.record_failure(order_number, &e.to_string())?;
          warn!(order_number, attempts, error = %e, "write delivery failed");
          self.events.emit(SyncEvent::WriteFailed {
            order_number,
            attempts,
            error: e.to_string(),
          });

          if retries >= self.config.max_retries {
            let to = self.queue.move_to_end(order_number)?;
            warn!(from = order_number, to, "retries exhausted, deferring write");
            self.events.emit(SyncEvent::WriteDeferred {
              from: order_number,
              to,
            });
            return Ok(Delivery::Deferred);
          }
          retries += 1;

          tokio::select! {
            _ = token.cancelled() => return Ok(Delivery::Cancelled),
            _ = tokio::time::sleep(self.config.retry_delay) => {}
          }
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use async_trait::async_trait;
  use chrono::{TimeZone, Utc};
  use serde_json::json;

  use super::*;
  use crate::clock::ManualClock;
  use crate::db::Database;
  use crate::queue::NewWrite;
  use crate::remote::mock::MockRemote;

  fn queue() -> WriteQueue {
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap(),
    ));
    WriteQueue::new(Database::open_in_memory().unwrap(), clock)
  }

  fn write(correlation: &str) -> NewWrite {
    NewWrite {
      kind: "attendance_submission".to_string(),
      payload: json!({ "c": correlation }),
      correlation: Some(correlation.to_string()),
    }
  }

  fn config(concurrency: usize, max_retries: u32) -> PoolConfig {
    PoolConfig {
      concurrency,
      max_retries,
      retry_delay: Duration::from_millis(1),
      auto_start: false,
      idle_interval: Duration::from_millis(20),
    }
  }

  #[tokio::test]
  async fn test_offline_writes_drain_after_retries() {
    let q = queue();
    let remote = Arc::new(MockRemote::new());
    remote.go_offline(true);
    for c in ["s1", "s2", "s3"] {
      q.enqueue(&write(c)).unwrap();
      remote.fail_writes(c, 2);
    }
    remote.go_offline(false);

    let pool = WorkerPool::new(q.clone(), remote.clone(), config(2, 3), EventSink::disabled());
    let report = pool.drain().await.unwrap();

    assert_eq!(report.delivered, 3);
    assert_eq!(report.deferred, 0);
    assert_eq!(q.count().unwrap(), 0);
    assert_eq!(remote.write_attempts.lock().unwrap().len(), 9);
    let mut delivered = remote.delivered.lock().unwrap().clone();
    delivered.sort();
    assert_eq!(delivered, vec!["s1", "s2", "s3"]);
  }

  #[tokio::test]
  async fn test_exhausted_item_is_moved_not_dropped() {
    let q = queue();
    let remote = Arc::new(MockRemote::new());
    let bad = q.enqueue(&write("bad")).unwrap();
    q.enqueue(&write("good")).unwrap();
    remote.fail_writes("bad", 100);

    let (sink, mut events) = EventSink::channel();
    let pool = WorkerPool::new(q.clone(), remote.clone(), config(1, 1), sink);
    let report = pool.run_pass().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(report.deferred, 1);
    let left = q.peek_front().unwrap().unwrap();
    assert_eq!(left.correlation.as_deref(), Some("bad"));
    assert!(left.order_number > bad.order_number);
    assert_eq!(left.attempts, 2);
    assert!(events
      .drain()
      .iter()
      .any(|e| matches!(e, SyncEvent::WriteDeferred { from, .. } if *from == bad.order_number)));
  }

  #[tokio::test]
  async fn test_deferred_item_retried_on_next_pass() {
    let q = queue();
    let remote = Arc::new(MockRemote::new());
    q.enqueue(&write("flaky")).unwrap();
    remote.fail_writes("flaky", 2);

    let pool = WorkerPool::new(q.clone(), remote.clone(), config(1, 1), EventSink::disabled());
    let report = pool.drain().await.unwrap();

    assert_eq!(report.deferred, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(q.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_drain_gives_up_on_permanent_failure() {
    let q = queue();
    let remote = Arc::new(MockRemote::new());
    q.enqueue(&write("never")).unwrap();
    remote.fail_writes("never", usize::MAX);

    let pool = WorkerPool::new(q.clone(), remote.clone(), config(1, 0), EventSink::disabled());
    let report = pool.drain().await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(report.deferred, 2);
    assert_eq!(q.count().unwrap(), 1);
  }

  #[derive(Default)]
  struct SlowSink {
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: Mutex<Vec<i64>>,
  }

  #[async_trait]
  impl WriteSink for SlowSink {
    async fn submit(&self, item: &QueueItem) -> Result<()> {
      self.calls.lock().unwrap().push(item.order_number);
      let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(15)).await;
      self.current.fetch_sub(1, Ordering::SeqCst);
      Ok(())
    }
  }

  #[tokio::test]
  async fn test_concurrency_is_bounded() {
    let q = queue();
    for i in 0..6 {
      q.enqueue(&write(&format!("w{}", i))).unwrap();
    }
    let sink = Arc::new(SlowSink::default());

    let pool = WorkerPool::new(q.clone(), sink.clone(), config(2, 0), EventSink::disabled());
    let report = pool.run_pass().await.unwrap();

    assert_eq!(report.delivered, 6);
    assert_eq!(sink.peak.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_drain_alongside_background_driver_delivers_once() {
    let q = queue();
    for i in 0..4 {
      q.enqueue(&write(&format!("w{}", i))).unwrap();
    }
    let sink = Arc::new(SlowSink::default());
    let mut cfg = config(1, 0);
    cfg.auto_start = true;
    let pool = WorkerPool::new(q.clone(), sink.clone(), cfg, EventSink::disabled());

    pool.drain().await.unwrap();
    wait_for(|| q.count().unwrap() == 0).await;
    pool.shutdown().await;

    assert_eq!(sink.peak.load(Ordering::SeqCst), 1);
    let calls = sink.calls.lock().unwrap().clone();
    let mut unique = calls.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(calls.len(), 4);
    assert_eq!(unique.len(), 4);
  }

  #[tokio::test]
  async fn test_undecodable_item_does_not_block_the_rest() {
    let db = Database::open_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap(),
    ));
    let q = WriteQueue::new(db.clone(), clock);
    let broken = q.enqueue(&write("broken")).unwrap();
    q.enqueue(&write("fine")).unwrap();
    db.conn()
      .unwrap()
      .execute(
        "UPDATE write_queue SET payload = x'00ff' WHERE order_number = ?1",
        rusqlite::params![broken.order_number],
      )
      .unwrap();

    let remote = Arc::new(MockRemote::new());
    let pool = WorkerPool::new(q.clone(), remote.clone(), config(2, 0), EventSink::disabled());
    let report = pool.drain().await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(*remote.delivered.lock().unwrap(), vec!["fine"]);
    assert!(q.exists_by_order(broken.order_number).unwrap());
    assert!(pool.in_flight().is_empty());
  }

  struct HangingSink;

  #[async_trait]
  impl WriteSink for HangingSink {
    async fn submit(&self, _item: &QueueItem) -> Result<()> {
      std::future::pending().await
    }
  }

  async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
      if check() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
  }

  #[tokio::test]
  async fn test_pause_cancels_in_flight_without_dequeuing() {
    let q = queue();
    let item = q.enqueue(&write("stuck")).unwrap();
    let mut cfg = config(1, 3);
    cfg.auto_start = true;
    let pool = WorkerPool::new(q.clone(), Arc::new(HangingSink), cfg, EventSink::disabled());

    wait_for(|| pool.in_flight() == vec![item.order_number]).await;
    pool.pause();
    wait_for(|| pool.in_flight().is_empty()).await;

    let still = q.peek_front().unwrap().unwrap();
    assert_eq!(still.order_number, item.order_number);
    assert_eq!(still.attempts, 0);
    assert!(pool.is_paused());
    pool.resume();
    assert!(!pool.is_paused());
    pool.shutdown().await;
  }

  #[tokio::test]
  async fn test_cancel_single_item() {
    let q = queue();
    let item = q.enqueue(&write("stuck")).unwrap();
    let pool = Arc::new(WorkerPool::new(
      q.clone(),
      Arc::new(HangingSink),
      config(1, 0),
      EventSink::disabled(),
    ));

    let runner = {
      let pool = Arc::clone(&pool);
      tokio::spawn(async move { pool.run_pass().await })
    };
    wait_for(|| !pool.in_flight().is_empty()).await;
    assert!(pool.cancel(item.order_number));

    let report = runner.await.unwrap().unwrap();
    assert_eq!(report.cancelled, 1);
    assert!(q.exists_by_order(item.order_number).unwrap());
    assert!(!pool.cancel(item.order_number));
  }

  #[tokio::test]
  async fn test_auto_start_delivers_new_writes() {
    let q = queue();
    let remote = Arc::new(MockRemote::new());
    let mut cfg = config(2, 1);
    cfg.auto_start = true;
    let pool = WorkerPool::new(q.clone(), remote.clone(), cfg, EventSink::disabled());

    q.enqueue(&write("late")).unwrap();
    wait_for(|| q.count().unwrap() == 0).await;
    assert_eq!(*remote.delivered.lock().unwrap(), vec!["late"]);
    pool.shutdown().await;
  }
}
