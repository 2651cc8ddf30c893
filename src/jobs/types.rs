use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Lifecycle of a server-side report job. `Available` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
  Pending,
  Available,
  Error,
}

impl JobStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, JobStatus::Available | JobStatus::Error)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      JobStatus::Pending => "pending",
      JobStatus::Available => "available",
      JobStatus::Error => "error",
    }
  }
}

impl fmt::Display for JobStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for JobStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(JobStatus::Pending),
      "available" => Ok(JobStatus::Available),
      "error" => Ok(JobStatus::Error),
      other => Err(format!("unknown job status '{}'", other)),
    }
  }
}

/// Granularity of a generated report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
  /// One row per student per month
  Monthly,
  /// One column per school day
  Daily,
}

/// Parameters of a report request. Their canonical form is the job identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportParameters {
  pub kind: ReportKind,
  pub start: NaiveDate,
  pub end: NaiveDate,
  /// Selected classrooms; empty means every classroom
  #[serde(default)]
  pub classroom_ids: Vec<u64>,
}

impl ReportParameters {
  pub fn new(kind: ReportKind, start: NaiveDate, end: NaiveDate, classroom_ids: Vec<u64>) -> Self {
    let mut params = Self {
      kind,
      start: start.min(end),
      end: end.max(start),
      classroom_ids,
    };
    params.classroom_ids.sort_unstable();
    params.classroom_ids.dedup();
    params
  }

  /// Stable identity: SHA-256 of the canonical JSON form.
  pub fn parameter_key(&self) -> String {
    let mut ids = self.classroom_ids.clone();
    ids.sort_unstable();
    ids.dedup();
    let canonical = serde_json::json!({
      "kind": self.kind,
      "start": self.start,
      "end": self.end,
      "classroom_ids": ids,
    });

    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Calendar months touched by the date range, inclusive.
  pub fn month_count(&self) -> u32 {
    let months = (self.end.year() - self.start.year()) * 12 + self.end.month() as i32
      - self.start.month() as i32;
    (months.max(0) + 1) as u32
  }

  /// Weekdays between start and end, inclusive.
  pub fn business_days(&self) -> u32 {
    self
      .start
      .iter_days()
      .take_while(|d| *d <= self.end)
      .filter(|d| !matches!(d.weekday(), Weekday::Sat | Weekday::Sun))
      .count() as u32
  }

  pub fn is_all_classrooms(&self) -> bool {
    self.classroom_ids.is_empty()
  }
}

/// Locally persisted state of a report job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRecord {
  pub parameter_key: String,
  pub parameters: ReportParameters,
  pub status: JobStatus,
  pub result_locator: Option<String>,
  /// Downloaded once, on first transition to `Available`
  pub result_payload: Option<Value>,
  /// Epoch ms
  pub created_at: i64,
  /// Epoch ms
  pub updated_at: i64,
}

impl JobRecord {
  pub fn is_terminal(&self) -> bool {
    self.status.is_terminal()
  }

  /// Available with a cached payload: nothing left to fetch.
  pub fn is_ready(&self) -> bool {
    self.status == JobStatus::Available && self.result_payload.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  #[test]
  fn test_parameter_key_ignores_classroom_order() {
    let a = ReportParameters::new(ReportKind::Monthly, d(2024, 1, 1), d(2024, 2, 29), vec![3, 1, 2]);
    let mut b = a.clone();
    b.classroom_ids = vec![2, 3, 1, 1];
    assert_eq!(a.parameter_key(), b.parameter_key());
    assert_eq!(a.parameter_key().len(), 64);

    let c = ReportParameters::new(ReportKind::Daily, d(2024, 1, 1), d(2024, 2, 29), vec![1, 2, 3]);
    assert_ne!(a.parameter_key(), c.parameter_key());
  }

  #[test]
  fn test_month_count() {
    let p = ReportParameters::new(ReportKind::Monthly, d(2023, 11, 15), d(2024, 2, 1), vec![]);
    assert_eq!(p.month_count(), 4);
    let single = ReportParameters::new(ReportKind::Monthly, d(2024, 5, 1), d(2024, 5, 31), vec![]);
    assert_eq!(single.month_count(), 1);
  }

  #[test]
  fn test_business_days_skip_weekends() {
    // 2024-03-04 is a Monday
    let week = ReportParameters::new(ReportKind::Daily, d(2024, 3, 4), d(2024, 3, 10), vec![]);
    assert_eq!(week.business_days(), 5);
    let march = ReportParameters::new(ReportKind::Daily, d(2024, 3, 1), d(2024, 3, 31), vec![]);
    assert_eq!(march.business_days(), 21);
  }

  #[test]
  fn test_swapped_range_is_normalized() {
    let p = ReportParameters::new(ReportKind::Monthly, d(2024, 3, 1), d(2024, 1, 1), vec![]);
    assert_eq!(p.start, d(2024, 1, 1));
    assert_eq!(p.month_count(), 3);
  }

  #[test]
  fn test_status_terminality() {
    assert!(!JobStatus::Pending.is_terminal());
    assert!(JobStatus::Available.is_terminal());
    assert!(JobStatus::Error.is_terminal());
    assert_eq!("error".parse(), Ok(JobStatus::Error));
  }
}
