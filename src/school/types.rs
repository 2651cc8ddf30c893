use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// School calendar event (holiday, trip, exam week)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
  pub id: u64,
  pub title: String,
  pub starts_on: NaiveDate,
  pub ends_on: NaiveDate,
  #[serde(default)]
  pub all_day: bool,
}

/// Classroom summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classroom {
  pub id: u64,
  pub name: String,
  pub grade: Option<String>,
}

/// Student enrolment, keyed by classroom + student
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
  pub classroom_id: u64,
  pub student_id: u64,
  pub name: String,
}

/// Per-student attendance roll-up for one classroom and month
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummary {
  pub classroom_id: u64,
  pub year: i32,
  pub month: u32,
  pub student_id: u64,
  pub present_days: u32,
  pub absent_days: u32,
  #[serde(default)]
  pub late_days: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
  Present,
  Absent,
  Late,
  Excused,
}

impl fmt::Display for AttendanceStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      AttendanceStatus::Present => "present",
      AttendanceStatus::Absent => "absent",
      AttendanceStatus::Late => "late",
      AttendanceStatus::Excused => "excused",
    };
    f.write_str(s)
  }
}

impl FromStr for AttendanceStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "present" | "p" => Ok(AttendanceStatus::Present),
      "absent" | "a" => Ok(AttendanceStatus::Absent),
      "late" | "l" => Ok(AttendanceStatus::Late),
      "excused" | "e" => Ok(AttendanceStatus::Excused),
      other => Err(format!("unknown attendance status '{}'", other)),
    }
  }
}

/// A check-in recorded on the device, delivered through the write queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSubmission {
  pub classroom_id: u64,
  pub student_id: u64,
  pub date: NaiveDate,
  pub status: AttendanceStatus,
  /// When attendance was taken on the device, epoch ms
  pub recorded_at: i64,
}

impl AttendanceSubmission {
  pub const KIND: &'static str = "attendance_submission";

  /// Fields identifying which remote row this write targets.
  pub fn correlation(&self) -> String {
    format!("{}/{}/{}", self.classroom_id, self.student_id, self.date)
  }
}

/// Attendance for one classroom in one calendar month
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttendanceScope {
  pub classroom_id: u64,
  pub year: i32,
  pub month: u32,
}

impl AttendanceScope {
  pub fn new(classroom_id: u64, year: i32, month: u32) -> Self {
    Self {
      classroom_id,
      year,
      month,
    }
  }
}

impl fmt::Display for AttendanceScope {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "classroom {} {:04}-{:02}",
      self.classroom_id, self.year, self.month
    )
  }
}
