//! Attendance domain: cached entity types and the offline client facade.

mod cache;
pub mod offline_client;
pub mod types;

pub use offline_client::{OfflineClient, QueueStats};
