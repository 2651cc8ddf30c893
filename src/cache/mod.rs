//! Local caching layer for offline support.
//!
//! This module provides:
//! - A keyed, indexed SQLite record store with compound keys
//! - Ledger-driven staleness detection with full-set reconciliation
//! - Client-side windowed reads over reconciled collections
//! - A cooldown governor for expensive scoped queries
//! - Offline mode (serve cached data when the network is unavailable)

pub mod governor;
mod layer;
pub mod registry;
mod storage;
mod traits;

pub use governor::{FrequencyGovernor, GovernedScope, QueryPermit};
pub use layer::{ScopedResult, SyncCoordinator};
pub use registry::{Collection, CollectionDescriptor};
pub use storage::{CacheStorage, ReconcileReport, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedRecord, Cacheable, DateWindow, RecordKey, Windowed};
