//! Serde-deserializable types matching remote API responses.
//!
//! Timestamps arrive either as ISO-8601 strings or as epoch-millisecond
//! integers depending on the endpoint; both are normalized to epoch
//! milliseconds here so every comparison downstream uses one representation.

use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::jobs::types::JobStatus;

/// Ledger entry for one remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModificationRecord {
  #[serde(rename = "tableName", alias = "table_name")]
  pub table_name: String,
  /// Epoch milliseconds
  #[serde(
    rename = "lastModifiedAt",
    alias = "last_modified_at",
    deserialize_with = "deserialize_epoch_millis"
  )]
  pub last_modified_at: i64,
  #[serde(default)]
  pub operation: Option<String>,
}

/// Response of the job create and job status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusResponse {
  pub status: JobStatus,
  #[serde(default, rename = "locator", alias = "result_locator")]
  pub result_locator: Option<String>,
}

/// Full-set responses are either a bare array or wrapped in `{"data": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ApiListResponse {
  Bare(Vec<Value>),
  Wrapped { data: Vec<Value> },
}

impl ApiListResponse {
  pub fn into_items(self) -> Vec<Value> {
    match self {
      ApiListResponse::Bare(items) | ApiListResponse::Wrapped { data: items } => items,
    }
  }
}

/// Parse a timestamp that may be epoch millis, or an ISO-8601 / RFC 3339 string.
pub fn parse_epoch_millis(raw: &str) -> Option<i64> {
  let raw = raw.trim();
  if let Ok(millis) = raw.parse::<i64>() {
    return Some(millis);
  }
  if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
    return Some(dt.timestamp_millis());
  }
  // Naive timestamps without an offset are taken as UTC
  ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
    .iter()
    .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
    .map(|dt| dt.and_utc().timestamp_millis())
}

fn deserialize_epoch_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
  D: Deserializer<'de>,
{
  match Value::deserialize(deserializer)? {
    Value::Number(n) => n
      .as_i64()
      .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", n))),
    Value::String(s) => parse_epoch_millis(&s)
      .ok_or_else(|| serde::de::Error::custom(format!("unrecognized timestamp '{}'", s))),
    other => Err(serde::de::Error::custom(format!(
      "expected timestamp, got {}",
      other
    ))),
  }
}
