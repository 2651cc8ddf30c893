//! Remote collaborators consumed by the offline layer.
//!
//! Each endpoint family is a separate trait so coordinators only depend on
//! what they call. [`HttpRemote`] implements all of them over HTTP.

pub mod api_types;
mod client;
#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::jobs::types::ReportParameters;
use crate::queue::QueueItem;

pub use api_types::{JobStatusResponse, ModificationRecord};
pub use client::HttpRemote;

/// Full-set and scoped reads of domain collections.
#[async_trait]
pub trait CollectionSource: Send + Sync {
  /// Every active record of a remote table.
  async fn fetch_all(&self, table: &str) -> Result<Vec<Value>>;

  /// Records of a remote table restricted by query parameters.
  async fn fetch_scoped(&self, table: &str, params: &[(String, String)]) -> Result<Vec<Value>>;
}

/// Per-table modification ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
  /// Ledger entry for `table`, or `None` if the remote has never recorded one.
  async fn last_modified(&self, table: &str) -> Result<Option<ModificationRecord>>;
}

/// Accepts one queued write. Must be safe to retry.
#[async_trait]
pub trait WriteSink: Send + Sync {
  async fn submit(&self, item: &QueueItem) -> Result<()>;
}

/// Server-side report generation.
#[async_trait]
pub trait JobService: Send + Sync {
  async fn create_job(&self, key: &str, params: &ReportParameters) -> Result<JobStatusResponse>;

  async fn job_status(&self, key: &str) -> Result<JobStatusResponse>;
}

/// Resolves an opaque storage locator into its JSON content.
#[async_trait]
pub trait ContentResolver: Send + Sync {
  async fn resolve(&self, locator: &str) -> Result<Value>;
}

/// Everything the offline client needs from the remote side.
pub trait Remote: CollectionSource + Ledger + WriteSink + JobService + ContentResolver {}

impl<T> Remote for T where T: CollectionSource + Ledger + WriteSink + JobService + ContentResolver {}
