//! Durable write queue and the worker pool that drains it.

mod store;
mod worker;

pub use store::{NewWrite, QueueItem, WriteQueue};
pub use worker::{PassReport, PoolConfig, WorkerPool};
