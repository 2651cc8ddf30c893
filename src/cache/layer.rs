//! Sync coordinator that decides when the local cache must be refreshed.

use std::sync::Arc;

use mockable::Clock;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::governor::{FrequencyGovernor, GovernedScope, QueryPermit};
use super::storage::CacheStorage;
use super::traits::{CacheResult, CacheSource, Cacheable, DateWindow, Windowed};
use crate::clock::now_millis;
use crate::error::{Error, Result};
use crate::event::{EventSink, SyncEvent};
use crate::remote::{CollectionSource, Ledger};

/// Result of a governed scoped query.
#[derive(Debug, Clone)]
pub struct ScopedResult<T> {
  pub result: CacheResult<Vec<T>>,
  pub permit: QueryPermit,
}

/// Coordinates the local store with the remote collection and ledger
/// endpoints.
///
/// Reads are served locally whenever the ledger shows no newer remote
/// modification; otherwise the collection is refetched in full and
/// reconciled. Network failures fall back to whatever is cached.
pub struct SyncCoordinator<S, R>
where
  S: CacheStorage,
  R: CollectionSource + Ledger + ?Sized,
{
  storage: Arc<S>,
  remote: Arc<R>,
  governor: FrequencyGovernor<S>,
  clock: Arc<dyn Clock>,
  events: EventSink,
}

impl<S, R> SyncCoordinator<S, R>
where
  S: CacheStorage,
  R: CollectionSource + Ledger + ?Sized,
{
  pub fn new(
    storage: Arc<S>,
    remote: Arc<R>,
    governor: FrequencyGovernor<S>,
    clock: Arc<dyn Clock>,
    events: EventSink,
  ) -> Self {
    Self {
      storage,
      remote,
      governor,
      clock,
      events,
    }
  }

  pub fn governor(&self) -> &FrequencyGovernor<S> {
    &self.governor
  }

  fn load<T: Cacheable>(&self) -> Result<Vec<T>> {
    Ok(
      self
        .storage
        .get_all::<T>()?
        .into_iter()
        .map(|r| r.value)
        .collect(),
    )
  }

  fn load_scope<T: Cacheable>(&self, scope: &str) -> Result<Vec<T>> {
    Ok(
      self
        .storage
        .get_all_by_index::<T>(scope)?
        .into_iter()
        .map(|r| r.value)
        .collect(),
    )
  }

  /// Return `T`'s collection, refreshing it first if the ledger says it is
  /// stale.
  ///
  /// 1. Empty collection - stale
  /// 2. Ledger newer than the newest local record - stale
  /// 3. Fresh - served locally, no collection fetch
  /// 4. Stale - full fetch + reconciliation
  /// 5. Network failure - serve existing cache (errors only if nothing cached)
  pub async fn ensure_fresh_and_get<T: Cacheable>(&self) -> Result<CacheResult<Vec<T>>> {
    let collection = T::COLLECTION;
    let Some(local_max) = self.storage.max_cached_at(collection, None)? else {
      debug!(%collection, "no local records, fetching");
      return self.refresh::<T>(None).await;
    };

    match self.remote.last_modified(collection.remote_table()).await {
      Ok(Some(ledger)) if ledger.last_modified_at > local_max => {
        debug!(
          %collection,
          remote = ledger.last_modified_at,
          local = local_max,
          "ledger is newer than cache"
        );
        self.refresh::<T>(Some(local_max)).await
      }
      Ok(_) => {
        debug!(%collection, "cache is current");
        Ok(CacheResult::from_cache(self.load()?, Some(local_max)))
      }
      Err(e) => self.serve_cached::<T>(Some(local_max), e),
    }
  }

  /// Records of `T` overlapping `window`, derived from the reconciled
  /// collection rather than fetched per window.
  pub async fn ensure_fresh_window<T>(&self, window: DateWindow) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable + Windowed,
  {
    let result = self.ensure_fresh_and_get::<T>().await?;
    Ok(result.map(|items| items.into_iter().filter(|i| i.overlaps(&window)).collect()))
  }

  /// Governed query for one scope of `T`'s collection.
  ///
  /// When the governor denies the query the cached scope is returned along
  /// with the remaining wait. Allowed queries upsert every returned record
  /// with a fresh timestamp, which restarts the cooldown.
  pub async fn query_scoped<T, Sc>(&self, scope: &Sc) -> Result<ScopedResult<T>>
  where
    T: Cacheable,
    Sc: GovernedScope,
  {
    let collection = T::COLLECTION;
    let index = scope.index_key();
    let permit = self.governor.can_query(collection, scope)?;

    if !permit.allowed {
      self.events.emit(SyncEvent::QueryDeferred {
        scope: scope.to_string(),
        wait_minutes: permit.wait_minutes,
      });
      let cached_at = self.storage.max_cached_at(collection, Some(&index))?;
      return Ok(ScopedResult {
        result: CacheResult::from_cache(self.load_scope(&index)?, cached_at),
        permit,
      });
    }

    let rows = match self
      .remote
      .fetch_scoped(collection.remote_table(), &scope.query_params())
      .await
    {
      Ok(rows) => rows,
      Err(e) => {
        warn!(%scope, error = %e, "scoped query failed, serving cache");
        self.events.emit(SyncEvent::ServedOffline {
          collection,
          reason: e.to_string(),
        });
        let cached_at = self.storage.max_cached_at(collection, Some(&index))?;
        return Ok(ScopedResult {
          result: CacheResult::offline(self.load_scope(&index)?, cached_at),
          permit,
        });
      }
    };

    let entities = decode_all::<T>(rows)?;
    let now = now_millis(self.clock.as_ref());
    for entity in &entities {
      self.storage.put(entity, now)?;
    }
    info!(%scope, count = entities.len(), "scoped query stored");

    Ok(ScopedResult {
      result: CacheResult::from_network(self.load_scope(&index)?, now),
      permit,
    })
  }

  /// Fetch the full authoritative set and reconcile.
  async fn refresh<T: Cacheable>(&self, local_max: Option<i64>) -> Result<CacheResult<Vec<T>>> {
    let collection = T::COLLECTION;
    self.events.emit(SyncEvent::SyncStarted { collection });

    let outcome = async {
      let rows = self.remote.fetch_all(collection.remote_table()).await?;
      let entities = decode_all::<T>(rows)?;
      let now = now_millis(self.clock.as_ref());
      let report = self.storage.reconcile(&entities, now)?;
      Ok::<_, Error>((report, now))
    }
    .await;

    match outcome {
      Ok((report, now)) => {
        info!(
          %collection,
          pruned = report.pruned,
          upserted = report.upserted,
          "reconciled with remote"
        );
        self.events.emit(SyncEvent::Reconciled {
          collection,
          pruned: report.pruned,
          upserted: report.upserted,
        });
        Ok(CacheResult::from_network(self.load()?, now))
      }
      Err(e) => self.serve_cached::<T>(local_max, e),
    }
  }

  /// Degrade to the existing cache after a failed refresh. The cache is
  /// never cleared here.
  fn serve_cached<T: Cacheable>(
    &self,
    local_max: Option<i64>,
    err: Error,
  ) -> Result<CacheResult<Vec<T>>> {
    let collection = T::COLLECTION;
    if local_max.is_none() {
      return Err(err);
    }

    warn!(%collection, error = %err, "refresh failed, serving cached data");
    self.events.emit(SyncEvent::ServedOffline {
      collection,
      reason: err.to_string(),
    });
    let data = self.load()?;
    Ok(if err.is_network() {
      CacheResult::offline(data, local_max)
    } else {
      CacheResult {
        data,
        source: CacheSource::CacheStale,
        cached_at: local_max,
      }
    })
  }
}

/// Decode a remote response. One bad row fails the whole set, since a
/// partial set would prune valid records during reconciliation.
fn decode_all<T: Cacheable>(rows: Vec<Value>) -> Result<Vec<T>> {
  rows
    .into_iter()
    .map(|row| serde_json::from_value(row).map_err(Error::from))
    .collect()
}

impl<S, R> Clone for SyncCoordinator<S, R>
where
  S: CacheStorage,
  R: CollectionSource + Ledger + ?Sized,
{
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      remote: Arc::clone(&self.remote),
      governor: self.governor.clone(),
      clock: Arc::clone(&self.clock),
      events: self.events.clone(),
    }
  }
}
