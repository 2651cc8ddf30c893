//! Offline-first client over the attendance service.
//!
//! Reads go through the sync coordinator, writes through the durable queue,
//! and reports through the job poller. Everything shares one store handle.

use std::sync::{Arc, Mutex};

use mockable::Clock;
use tracing::info;

use super::types::{AttendanceScope, AttendanceSubmission, AttendanceSummary};
use crate::cache::{
  CacheResult, Cacheable, Collection, DateWindow, FrequencyGovernor, QueryPermit, ScopedResult,
  SqliteStorage, SyncCoordinator, Windowed,
};
use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::event::{EventSink, EventStream, SyncEvent};
use crate::jobs::{
  estimate, DurationEstimate, EstimatorConfig, JobPoller, JobRecord, ReportParameters,
};
use crate::queue::{NewWrite, PassReport, QueueItem, WorkerPool, WriteQueue};
use crate::remote::Remote;

/// Snapshot of the write queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
  pub count: usize,
  /// Next item to be delivered
  pub front: Option<QueueItem>,
}

pub struct OfflineClient<R: Remote + 'static> {
  db: Database,
  sync: SyncCoordinator<SqliteStorage, R>,
  queue: WriteQueue,
  pool: WorkerPool,
  jobs: JobPoller<R>,
  estimator: EstimatorConfig,
  events: EventSink,
  event_stream: Mutex<Option<EventStream>>,
}

impl<R: Remote + 'static> OfflineClient<R> {
  /// Wire every coordinator over `db`.
  ///
  /// Must be called inside a Tokio runtime when `queue.auto_start` is set.
  pub fn new(db: Database, remote: Arc<R>, clock: Arc<dyn Clock>, config: &Config) -> Result<Self> {
    if let Some(pages) = config.store.max_pages {
      db.set_max_pages(pages)?;
    }

    let (events, event_stream) = EventSink::channel();
    let storage = Arc::new(SqliteStorage::new(db.clone()));
    let governor = FrequencyGovernor::new(
      Arc::clone(&storage),
      Arc::clone(&clock),
      config.sync.cooldown(),
    );
    let sync = SyncCoordinator::new(
      storage,
      Arc::clone(&remote),
      governor,
      Arc::clone(&clock),
      events.clone(),
    );

    let queue = WriteQueue::new(db.clone(), Arc::clone(&clock));
    let pool = WorkerPool::new(
      queue.clone(),
      remote.clone(),
      config.queue.pool_config(),
      events.clone(),
    );

    let jobs = JobPoller::new(
      db.clone(),
      remote,
      clock,
      config.jobs.poller_config(),
      events.clone(),
    );

    Ok(Self {
      db,
      sync,
      queue,
      pool,
      jobs,
      estimator: config.jobs.estimator_config(),
      events,
      event_stream: Mutex::new(Some(event_stream)),
    })
  }

  /// Take the event stream. Only the first caller gets it.
  pub fn events(&self) -> Option<EventStream> {
    self.event_stream.lock().ok().and_then(|mut s| s.take())
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  pub async fn ensure_fresh_and_get<T: Cacheable>(&self) -> Result<CacheResult<Vec<T>>> {
    self.sync.ensure_fresh_and_get::<T>().await
  }

  pub async fn ensure_fresh_window<T>(&self, window: DateWindow) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable + Windowed,
  {
    self.sync.ensure_fresh_window::<T>(window).await
  }

  /// Whether the attendance roll-up for `scope` may be queried now.
  pub fn can_query(&self, scope: &AttendanceScope) -> Result<QueryPermit> {
    self.sync.governor().can_query(Collection::Attendance, scope)
  }

  pub async fn query_attendance(
    &self,
    scope: &AttendanceScope,
  ) -> Result<ScopedResult<AttendanceSummary>> {
    self.sync.query_scoped::<AttendanceSummary, _>(scope).await
  }

  // ==========================================================================
  // Writes
  // ==========================================================================

  /// Queue a submission for delivery. Returns its order number.
  pub fn enqueue_write(&self, submission: &AttendanceSubmission) -> Result<i64> {
    let item = self.queue.enqueue(&NewWrite {
      kind: AttendanceSubmission::KIND.to_string(),
      payload: serde_json::to_value(submission)?,
      correlation: Some(submission.correlation()),
    })?;
    info!(
      order_number = item.order_number,
      correlation = %submission.correlation(),
      "attendance queued"
    );
    self.events.emit(SyncEvent::WriteQueued {
      order_number: item.order_number,
    });
    Ok(item.order_number)
  }

  pub fn queue_stats(&self) -> Result<QueueStats> {
    Ok(QueueStats {
      count: self.queue.count()?,
      front: self.queue.peek_front()?,
    })
  }

  pub fn pending_writes(&self) -> Result<Vec<QueueItem>> {
    self.queue.list()
  }

  /// Deliver queued writes now, in the foreground.
  pub async fn drain_queue(&self) -> Result<PassReport> {
    self.pool.drain().await
  }

  // ==========================================================================
  // Reports
  // ==========================================================================

  pub async fn create_job(&self, params: &ReportParameters) -> Result<JobRecord> {
    self.jobs.create(params).await
  }

  pub async fn poll_job<F>(&self, params: &ReportParameters, on_update: F) -> Result<JobRecord>
  where
    F: FnMut(&JobRecord, u64),
  {
    self.jobs.poll(params, on_update).await
  }

  pub fn job(&self, params: &ReportParameters) -> Result<Option<JobRecord>> {
    self.jobs.get(params)
  }

  pub fn estimate_duration(&self, params: &ReportParameters) -> DurationEstimate {
    estimate(params, &self.estimator)
  }

  /// Stop the queue worker and release the store.
  pub async fn close(self) -> Result<()> {
    self.pool.shutdown().await;
    let db = self.db.clone();
    drop(self);
    db.close()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::Ordering;

  use chrono::{NaiveDate, TimeZone, Utc};
  use serde_json::json;

  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::ManualClock;
  use crate::jobs::{JobStatus, ReportKind};
  use crate::remote::mock::MockRemote;
  use crate::school::types::{AttendanceStatus, CalendarEvent, Classroom};

  struct Fixture {
    client: OfflineClient<MockRemote>,
    remote: Arc<MockRemote>,
    clock: Arc<ManualClock>,
  }

  fn fixture_with(db: Database, config: Config) -> Fixture {
    let remote = Arc::new(MockRemote::new());
    let clock = Arc::new(ManualClock::new(
      Utc.with_ymd_and_hms(2024, 3, 12, 9, 0, 0).unwrap(),
    ));
    let client = OfflineClient::new(db, remote.clone(), clock.clone(), &config).unwrap();
    Fixture {
      client,
      remote,
      clock,
    }
  }

  fn fast_config() -> Config {
    let mut config = Config::default();
    config.queue.retry_delay_ms = 1;
    config.jobs.min_generation_delay_secs = 0;
    config.jobs.poll_interval_secs = 0;
    config
  }

  fn fixture() -> Fixture {
    fixture_with(Database::open_in_memory().unwrap(), fast_config())
  }

  fn submission(student_id: u64) -> AttendanceSubmission {
    AttendanceSubmission {
      classroom_id: 7,
      student_id,
      date: NaiveDate::from_ymd_opt(2024, 3, 12).unwrap(),
      status: AttendanceStatus::Present,
      recorded_at: 0,
    }
  }

  #[tokio::test]
  async fn test_reads_go_offline_without_losing_cache() {
    let f = fixture();
    f.remote.set_table(
      "classrooms",
      vec![json!({ "id": 1, "name": "1A" }), json!({ "id": 2, "name": "1B" })],
    );

    let first = f.client.ensure_fresh_and_get::<Classroom>().await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data.len(), 2);

    f.remote.go_offline(true);
    let offline = f.client.ensure_fresh_and_get::<Classroom>().await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.data.len(), 2);
  }

  #[tokio::test]
  async fn test_window_reads() {
    let f = fixture();
    f.remote.set_table(
      "calendar_events",
      vec![
        json!({ "id": 1, "title": "Trip", "starts_on": "2024-03-01", "ends_on": "2024-03-02" }),
        json!({ "id": 2, "title": "Fair", "starts_on": "2024-04-10", "ends_on": "2024-04-10" }),
      ],
    );
    let window = DateWindow::month(2024, 3).unwrap();
    let march = f.client.ensure_fresh_window::<CalendarEvent>(window).await.unwrap();
    assert_eq!(march.data.len(), 1);
    assert_eq!(march.data[0].title, "Trip");
  }

  #[tokio::test]
  async fn test_governed_attendance_query() {
    let f = fixture();
    f.remote.set_table(
      "attendance_records",
      vec![json!({
        "classroom_id": 7, "year": 2024, "month": 3, "student_id": 1,
        "present_days": 8, "absent_days": 1
      })],
    );
    let scope = AttendanceScope::new(7, 2024, 3);

    assert!(f.client.can_query(&scope).unwrap().allowed);
    let first = f.client.query_attendance(&scope).await.unwrap();
    assert_eq!(first.result.data.len(), 1);

    f.clock.advance_minutes(1);
    let permit = f.client.can_query(&scope).unwrap();
    assert!(!permit.allowed);
    assert_eq!(permit.wait_minutes, 9);

    let denied = f.client.query_attendance(&scope).await.unwrap();
    assert_eq!(denied.result.data.len(), 1);
    assert_eq!(f.remote.scoped_calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_queued_writes_drain_when_back_online() {
    let f = fixture();
    let mut events = f.client.events().unwrap();
    assert!(f.client.events().is_none());

    let first = f.client.enqueue_write(&submission(1)).unwrap();
    let second = f.client.enqueue_write(&submission(2)).unwrap();
    assert!(second > first);

    let stats = f.client.queue_stats().unwrap();
    assert_eq!(stats.count, 2);
    assert_eq!(stats.front.unwrap().order_number, first);

    f.remote.fail_writes("7/1/2024-03-12", 1);
    let report = f.client.drain_queue().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(f.client.queue_stats().unwrap().count, 0);

    let seen = events.drain();
    assert!(seen.contains(&SyncEvent::WriteQueued { order_number: first }));
    assert!(seen.contains(&SyncEvent::WriteDelivered { order_number: second }));
  }

  #[tokio::test]
  async fn test_report_lifecycle() {
    let f = fixture();
    f.remote.available_on_check.store(2, Ordering::SeqCst);
    let params = ReportParameters::new(
      ReportKind::Monthly,
      NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
      NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
      vec![],
    );

    let estimate = f.client.estimate_duration(&params);
    assert_eq!(estimate.min_seconds, 0);

    f.client.create_job(&params).await.unwrap();
    let mut updates = 0;
    let done = f.client.poll_job(&params, |_, _| updates += 1).await.unwrap();
    assert_eq!(updates, 2);
    assert_eq!(done.status, JobStatus::Available);
    assert!(f.client.job(&params).unwrap().unwrap().is_ready());
  }

  #[tokio::test]
  async fn test_queue_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");

    let f = fixture_with(Database::open(&path).unwrap(), fast_config());
    let order = f.client.enqueue_write(&submission(3)).unwrap();
    f.client.close().await.unwrap();

    let f = fixture_with(Database::open(&path).unwrap(), fast_config());
    let front = f.client.queue_stats().unwrap().front.unwrap();
    assert_eq!(front.order_number, order);
    assert_eq!(front.correlation.as_deref(), Some("7/3/2024-03-12"));
  }
}
