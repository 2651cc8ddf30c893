//! Cooldown-based rate limiting for expensive scoped aggregate queries.
//!
//! Independent of ledger staleness: a scope may be queried again only after
//! the cooldown has passed since its newest cached record was written. Scopes
//! whose period has already closed are never throttled because their data
//! can no longer change.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use mockable::Clock;
use tracing::debug;

use super::registry::Collection;
use super::storage::CacheStorage;
use crate::clock::now_millis;
use crate::error::Result;

const MINUTE_MS: i64 = 60_000;

/// A query partition guarded by the governor.
pub trait GovernedScope: fmt::Display + Send + Sync {
  /// Value stored in the records' scope index.
  fn index_key(&self) -> String;

  /// Epoch ms at which the scope's period ends. From then on the data is
  /// immutable.
  fn closes_at(&self) -> i64;

  /// Parameters sent to the remote scoped endpoint.
  fn query_params(&self) -> Vec<(String, String)>;
}

/// Decision returned by [`FrequencyGovernor::can_query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryPermit {
  pub allowed: bool,
  /// Whole minutes until the scope may be queried again, 0 when allowed.
  pub wait_minutes: i64,
  /// The scope's period is closed, so the cooldown was not consulted.
  pub bypassed: bool,
}

impl QueryPermit {
  fn allow() -> Self {
    Self {
      allowed: true,
      wait_minutes: 0,
      bypassed: false,
    }
  }

  fn bypass() -> Self {
    Self {
      allowed: true,
      wait_minutes: 0,
      bypassed: true,
    }
  }

  fn deny(wait_minutes: i64) -> Self {
    Self {
      allowed: false,
      wait_minutes,
      bypassed: false,
    }
  }
}

pub struct FrequencyGovernor<S: CacheStorage> {
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  cooldown: Duration,
}

impl<S: CacheStorage> FrequencyGovernor<S> {
  pub fn new(storage: Arc<S>, clock: Arc<dyn Clock>, cooldown: Duration) -> Self {
    Self {
      storage,
      clock,
      cooldown,
    }
  }

  pub fn cooldown(&self) -> Duration {
    self.cooldown
  }

  /// Whether `scope` of `collection` may be queried remotely right now.
  pub fn can_query(&self, collection: Collection, scope: &dyn GovernedScope) -> Result<QueryPermit> {
    let now = now_millis(self.clock.as_ref());
    if now >= scope.closes_at() {
      debug!(%scope, "closed period, governor bypassed");
      return Ok(QueryPermit::bypass());
    }

    let latest = self
      .storage
      .max_cached_at(collection, Some(&scope.index_key()))?;
    let Some(latest) = latest else {
      return Ok(QueryPermit::allow());
    };

    let cooldown_ms = i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX);
    let elapsed = now - latest;
    if elapsed < cooldown_ms {
      let remaining = cooldown_ms - elapsed;
      let wait_minutes = (remaining + MINUTE_MS - 1) / MINUTE_MS;
      debug!(%scope, wait_minutes, "governed query denied");
      Ok(QueryPermit::deny(wait_minutes))
    } else {
      Ok(QueryPermit::allow())
    }
  }
}

impl<S: CacheStorage> Clone for FrequencyGovernor<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      cooldown: self.cooldown,
    }
  }
}
