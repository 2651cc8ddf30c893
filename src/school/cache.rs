//! Caching implementations for school types.

use chrono::NaiveDate;

use crate::cache::{Cacheable, Collection, DateWindow, GovernedScope, RecordKey, Windowed};

use super::types::{AttendanceScope, AttendanceSummary, CalendarEvent, Classroom, Student};

// ============================================================================
// Cacheable implementations
// ============================================================================

impl Cacheable for CalendarEvent {
  const COLLECTION: Collection = Collection::Events;

  fn cache_key(&self) -> RecordKey {
    RecordKey::new(self.id.to_string())
  }
}

impl Windowed for CalendarEvent {
  fn starts_on(&self) -> NaiveDate {
    self.starts_on
  }

  fn ends_on(&self) -> NaiveDate {
    self.ends_on
  }
}

impl Cacheable for Classroom {
  const COLLECTION: Collection = Collection::Classrooms;

  fn cache_key(&self) -> RecordKey {
    RecordKey::new(self.id.to_string())
  }
}

impl Cacheable for Student {
  const COLLECTION: Collection = Collection::Students;

  fn cache_key(&self) -> RecordKey {
    RecordKey::compound([self.classroom_id, self.student_id])
  }
}

impl Cacheable for AttendanceSummary {
  const COLLECTION: Collection = Collection::Attendance;

  fn cache_key(&self) -> RecordKey {
    RecordKey::compound([
      self.classroom_id.to_string(),
      format!("{:04}-{:02}", self.year, self.month),
      self.student_id.to_string(),
    ])
  }

  fn scope(&self) -> Option<String> {
    Some(AttendanceScope::new(self.classroom_id, self.year, self.month).index_key())
  }
}

// ============================================================================
// Governed scopes
// ============================================================================

impl AttendanceScope {
  pub fn window(&self) -> Option<DateWindow> {
    DateWindow::month(self.year, self.month)
  }
}

impl GovernedScope for AttendanceScope {
  fn index_key(&self) -> String {
    format!(
      "classroom:{}:{:04}-{:02}",
      self.classroom_id, self.year, self.month
    )
  }

  /// Midnight UTC at the start of the following month. Invalid months never
  /// close, so they stay governed.
  ///
  /// Month boundaries are taken in UTC regardless of the school's timezone,
  /// so a school east of UTC sees its month close a few hours late and one
  /// west of UTC a few hours early.
  fn closes_at(&self) -> i64 {
    self
      .window()
      .and_then(|w| w.end.succ_opt())
      .and_then(|next| next.and_hms_opt(0, 0, 0))
      .map(|midnight| midnight.and_utc().timestamp_millis())
      .unwrap_or(i64::MAX)
  }

  fn query_params(&self) -> Vec<(String, String)> {
    vec![
      ("classroom_id".to_string(), self.classroom_id.to_string()),
      ("year".to_string(), self.year.to_string()),
      ("month".to_string(), self.month.to_string()),
    ]
  }
}
