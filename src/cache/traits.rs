//! Core traits and types for the caching system.

use std::fmt;

use chrono::NaiveDate;
use serde::{de::DeserializeOwned, Serialize};

use super::registry::Collection;

/// Natural or compound key, unique within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey(String);

impl RecordKey {
  const SEPARATOR: char = '\u{1f}';

  pub fn new(key: impl Into<String>) -> Self {
    Self(key.into())
  }

  /// Key made of several parts, e.g. classroom + student.
  pub fn compound<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: fmt::Display,
  {
    let joined = parts
      .into_iter()
      .map(|p| p.to_string())
      .collect::<Vec<_>>()
      .join(&Self::SEPARATOR.to_string());
    Self(joined)
  }

  pub fn parts(&self) -> impl Iterator<Item = &str> {
    self.0.split(Self::SEPARATOR)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RecordKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.parts().collect::<Vec<_>>().join("/"))
  }
}

/// Trait for entities that can be cached.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Collection this entity belongs to.
  const COLLECTION: Collection;

  /// Unique key for this entity within its collection.
  fn cache_key(&self) -> RecordKey;

  /// Scope index value, for collections queried per scope.
  fn scope(&self) -> Option<String> {
    None
  }
}

/// Entities spanning a date interval, filterable by window.
pub trait Windowed {
  fn starts_on(&self) -> NaiveDate;
  fn ends_on(&self) -> NaiveDate;

  /// Interval-overlap test, inclusive on both ends.
  fn overlaps(&self, window: &DateWindow) -> bool {
    self.starts_on() <= window.end && self.ends_on() >= window.start
  }
}

/// Inclusive date window, e.g. one calendar month.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateWindow {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
    Self { start, end }
  }

  /// The full calendar month `month` of `year`.
  pub fn month(year: i32, month: u32) -> Option<Self> {
    let start = NaiveDate::from_ymd_opt(year, month, 1)?;
    let (ny, nm) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    let end = NaiveDate::from_ymd_opt(ny, nm, 1)?.pred_opt()?;
    Some(Self { start, end })
  }
}

/// An entity as stored locally, with its local update time.
#[derive(Debug, Clone)]
pub struct CachedRecord<T> {
  pub key: RecordKey,
  pub value: T,
  /// Local update time in epoch milliseconds.
  pub cached_at: i64,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Newest local update time of the served records (epoch ms)
  pub cached_at: Option<i64>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, cached_at: i64) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result from cached data that is still current.
  pub fn from_cache(data: T, cached_at: Option<i64>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at,
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: Option<i64>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still current
  CacheFresh,
  /// Data from cache, known stale because the refresh could not be applied
  CacheStale,
  /// Network unavailable, serving possibly stale cached data
  Offline,
}
