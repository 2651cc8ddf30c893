//! In-memory remote used by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use super::{
  CollectionSource, ContentResolver, JobService, JobStatusResponse, Ledger, ModificationRecord,
  WriteSink,
};
use crate::error::{Error, Result};
use crate::jobs::types::{JobStatus, ReportParameters};
use crate::queue::QueueItem;

#[derive(Default)]
pub struct MockRemote {
  pub offline: AtomicBool,
  tables: Mutex<HashMap<String, Vec<Value>>>,
  ledger: Mutex<HashMap<String, i64>>,
  pub fetch_calls: AtomicUsize,
  pub ledger_calls: AtomicUsize,
  pub scoped_calls: AtomicUsize,

  /// Failures to inject per correlation before a write succeeds
  write_failures: Mutex<HashMap<String, usize>>,
  pub write_attempts: Mutex<Vec<String>>,
  pub delivered: Mutex<Vec<String>>,

  /// Status check on which jobs become available (1-based)
  pub available_on_check: AtomicUsize,
  pub status_checks: AtomicUsize,
  pub create_calls: AtomicUsize,
  pub resolve_calls: AtomicUsize,
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_table(&self, table: &str, rows: Vec<Value>) {
    self.tables.lock().unwrap().insert(table.to_string(), rows);
  }

  pub fn touch_ledger(&self, table: &str, millis: i64) {
    self.ledger.lock().unwrap().insert(table.to_string(), millis);
  }

  pub fn fail_writes(&self, correlation: &str, times: usize) {
    self
      .write_failures
      .lock()
      .unwrap()
      .insert(correlation.to_string(), times);
  }

  pub fn go_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  fn check_online(&self) -> Result<()> {
    if self.offline.load(Ordering::SeqCst) {
      Err(Error::Network("connection refused".to_string()))
    } else {
      Ok(())
    }
  }
}

#[async_trait]
impl CollectionSource for MockRemote {
  async fn fetch_all(&self, table: &str) -> Result<Vec<Value>> {
    self.check_online()?;
    self.fetch_calls.fetch_add(1, Ordering::SeqCst);
    Ok(self.tables.lock().unwrap().get(table).cloned().unwrap_or_default())
  }

  async fn fetch_scoped(&self, table: &str, params: &[(String, String)]) -> Result<Vec<Value>> {
    self.check_online()?;
    self.scoped_calls.fetch_add(1, Ordering::SeqCst);
    let rows = self.tables.lock().unwrap().get(table).cloned().unwrap_or_default();
    Ok(
      rows
        .into_iter()
        .filter(|row| {
          params.iter().all(|(k, v)| match &row[k.as_str()] {
            Value::String(s) => s == v,
            other => other.to_string() == *v,
          })
        })
        .collect(),
    )
  }
}

#[async_trait]
impl Ledger for MockRemote {
  async fn last_modified(&self, table: &str) -> Result<Option<ModificationRecord>> {
    self.check_online()?;
    self.ledger_calls.fetch_add(1, Ordering::SeqCst);
    Ok(
      self
        .ledger
        .lock()
        .unwrap()
        .get(table)
        .map(|&millis| ModificationRecord {
          table_name: table.to_string(),
          last_modified_at: millis,
          operation: Some("UPDATE".to_string()),
        }),
    )
  }
}

#[async_trait]
impl WriteSink for MockRemote {
  async fn submit(&self, item: &QueueItem) -> Result<()> {
    let correlation = item.correlation.clone().unwrap_or_default();
    self.write_attempts.lock().unwrap().push(correlation.clone());
    self.check_online()?;

    let mut failures = self.write_failures.lock().unwrap();
    if let Some(left) = failures.get_mut(&correlation) {
      if *left > 0 {
        *left -= 1;
        return Err(Error::Network(format!("503 for {}", correlation)));
      }
    }
    drop(failures);

    self.delivered.lock().unwrap().push(correlation);
    Ok(())
  }
}

#[async_trait]
impl JobService for MockRemote {
  async fn create_job(&self, key: &str, _params: &ReportParameters) -> Result<JobStatusResponse> {
    self.check_online()?;
    self.create_calls.fetch_add(1, Ordering::SeqCst);
    Ok(JobStatusResponse {
      status: JobStatus::Pending,
      result_locator: Some(format!("reports/{}", key)),
    })
  }

  async fn job_status(&self, key: &str) -> Result<JobStatusResponse> {
    self.check_online()?;
    let check = self.status_checks.fetch_add(1, Ordering::SeqCst) + 1;
    let ready_on = self.available_on_check.load(Ordering::SeqCst);
    let status = if ready_on > 0 && check >= ready_on {
      JobStatus::Available
    } else {
      JobStatus::Pending
    };
    Ok(JobStatusResponse {
      status,
      result_locator: Some(format!("reports/{}", key)),
    })
  }
}

#[async_trait]
impl ContentResolver for MockRemote {
  async fn resolve(&self, locator: &str) -> Result<Value> {
    self.check_online()?;
    self.resolve_calls.fetch_add(1, Ordering::SeqCst);
    Ok(serde_json::json!({ "locator": locator, "rows": [[1, 2], [3, 4]] }))
  }
}
