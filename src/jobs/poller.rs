//! Create-and-poll lifecycle for server-side report jobs.
//!
//! Job state is persisted in `report_jobs`, keyed by the parameter hash, so
//! identical requests share one job and a finished result is downloaded once.

use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use rusqlite::{params, OptionalExtension, Row};
use tokio::time::Instant;
use tracing::{debug, info};

use super::types::{JobRecord, JobStatus, ReportParameters};
use crate::clock::now_millis;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::event::{EventSink, SyncEvent};
use crate::remote::{ContentResolver, JobService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
  /// Initial wait before the first status check
  pub min_generation_delay: Duration,
  pub poll_interval: Duration,
  /// Give up with [`Error::JobTimeout`] after this long. `None` polls forever.
  pub max_wait: Option<Duration>,
}

impl Default for PollerConfig {
  fn default() -> Self {
    Self {
      min_generation_delay: Duration::from_secs(20),
      poll_interval: Duration::from_secs(5),
      max_wait: None,
    }
  }
}

pub struct JobPoller<R: JobService + ContentResolver + ?Sized> {
  db: Database,
  remote: Arc<R>,
  clock: Arc<dyn Clock>,
  config: PollerConfig,
  events: EventSink,
}

impl<R: JobService + ContentResolver + ?Sized> JobPoller<R> {
  pub fn new(
    db: Database,
    remote: Arc<R>,
    clock: Arc<dyn Clock>,
    config: PollerConfig,
    events: EventSink,
  ) -> Self {
    Self {
      db,
      remote,
      clock,
      config,
      events,
    }
  }

  /// Locally known state of the job for `params`, if any.
  pub fn get(&self, params: &ReportParameters) -> Result<Option<JobRecord>> {
    self.load(&params.parameter_key())
  }

  /// Start generating a report unless an equivalent job is already pending
  /// or finished with its result cached.
  pub async fn create(&self, params: &ReportParameters) -> Result<JobRecord> {
    let key = params.parameter_key();
    let existing = self.load(&key)?;
    if let Some(record) = &existing {
      if record.is_ready() || record.status == JobStatus::Pending {
        debug!(key = %key, status = %record.status, "reusing existing report job");
        return Ok(record.clone());
      }
    }

    let response = self.remote.create_job(&key, params).await?;
    let now = now_millis(self.clock.as_ref());
    let record = JobRecord {
      parameter_key: key,
      parameters: params.clone(),
      status: response.status,
      result_locator: response.result_locator,
      result_payload: None,
      created_at: existing.map(|r| r.created_at).unwrap_or(now),
      updated_at: now,
    };
    self.save(&record)?;
    info!(key = %record.parameter_key, status = %record.status, "report job created");
    self.emit(&record, 0);
    Ok(record)
  }

  /// Wait for the job to reach a terminal state.
  ///
  /// `on_update` sees every status check along with the seconds elapsed
  /// since polling began. An already downloaded result returns immediately
  /// without touching the remote.
  pub async fn poll<F>(&self, params: &ReportParameters, mut on_update: F) -> Result<JobRecord>
  where
    F: FnMut(&JobRecord, u64),
  {
    let key = params.parameter_key();
    if let Some(record) = self.load(&key)? {
      if record.is_ready() {
        debug!(key = %key, "report result served from cache");
        return Ok(record);
      }
    }

    let started = Instant::now();
    tokio::time::sleep(self.config.min_generation_delay).await;

    loop {
      let response = self.remote.job_status(&key).await?;
      let now = now_millis(self.clock.as_ref());
      let mut record = self.load(&key)?.unwrap_or_else(|| JobRecord {
        parameter_key: key.clone(),
        parameters: params.clone(),
        status: JobStatus::Pending,
        result_locator: None,
        result_payload: None,
        created_at: now,
        updated_at: now,
      });

      record.status = response.status;
      if response.result_locator.is_some() {
        record.result_locator = response.result_locator;
      }
      if record.status == JobStatus::Available && record.result_payload.is_none() {
        let locator = record
          .result_locator
          .clone()
          .ok_or_else(|| Error::Decode(format!("job {} is available without a locator", key)))?;
        record.result_payload = Some(self.remote.resolve(&locator).await?);
        info!(key = %key, locator = %locator, "report result downloaded");
      }
      record.updated_at = now;
      self.save(&record)?;

      let elapsed = started.elapsed();
      on_update(&record, elapsed.as_secs());
      self.emit(&record, elapsed.as_secs());

      if record.is_terminal() {
        return Ok(record);
      }
      if let Some(max_wait) = self.config.max_wait {
        if elapsed >= max_wait {
          return Err(Error::JobTimeout {
            key,
            waited_secs: elapsed.as_secs(),
          });
        }
      }
      tokio::time::sleep(self.config.poll_interval).await;
    }
  }

  fn emit(&self, record: &JobRecord, elapsed_secs: u64) {
    self.events.emit(SyncEvent::JobUpdated {
      parameter_key: record.parameter_key.clone(),
      status: record.status,
      elapsed_secs,
    });
  }

  fn load(&self, key: &str) -> Result<Option<JobRecord>> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        "SELECT parameter_key, parameters, status, result_locator, result_payload, created_at, updated_at
         FROM report_jobs WHERE parameter_key = ?1",
        params![key],
        RawJob::from_row,
      )
      .optional()?;
    raw.map(RawJob::decode).transpose()
  }

  fn save(&self, record: &JobRecord) -> Result<()> {
    let parameters = serde_json::to_vec(&record.parameters)?;
    let payload = record
      .result_payload
      .as_ref()
      .map(serde_json::to_vec)
      .transpose()?;
    let conn = self.db.conn()?;
    conn.execute(
      "INSERT INTO report_jobs
         (parameter_key, parameters, status, result_locator, result_payload, created_at, updated_at)
       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
       ON CONFLICT(parameter_key) DO UPDATE SET
         parameters = excluded.parameters,
         status = excluded.status,
         result_locator = excluded.result_locator,
         result_payload = excluded.result_payload,
         updated_at = excluded.updated_at",
      params![
        record.parameter_key,
        parameters,
        record.status.as_str(),
        record.result_locator,
        payload,
        record.created_at,
        record.updated_at,
      ],
    )?;
    Ok(())
  }
}

struct RawJob {
  parameter_key: String,
  parameters: Vec<u8>,
  status: String,
  result_locator: Option<String>,
  result_payload: Option<Vec<u8>>,
  created_at: i64,
  updated_at: i64,
}

impl RawJob {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      parameter_key: row.get(0)?,
      parameters: row.get(1)?,
      status: row.get(2)?,
      result_locator: row.get(3)?,
      result_payload: row.get(4)?,
      created_at: row.get(5)?,
      updated_at: row.get(6)?,
    })
  }

  fn decode(self) -> Result<JobRecord> {
    Ok(JobRecord {
      parameters: serde_json::from_slice(&self.parameters)?,
      status: self.status.parse().map_err(Error::Decode)?,
      result_payload: self
        .result_payload
        .map(|bytes| serde_json::from_slice(&bytes))
        .transpose()?,
      parameter_key: self.parameter_key,
      result_locator: self.result_locator,
      created_at: self.created_at,
      updated_at: self.updated_at,
    })
  }
}
