//! Offline-first data layer for the attendance service.
//!
//! Reads are served from a local SQLite cache kept consistent with the
//! remote through a per-table modification ledger. Writes made while
//! disconnected go into a durable queue drained by a bounded worker pool.
//! Long-running reports are generated server-side and polled to completion.

pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod jobs;
pub mod logging;
pub mod queue;
pub mod remote;
pub mod school;

pub use error::{Error, Result};
pub use school::{OfflineClient, QueueStats};
