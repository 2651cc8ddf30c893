//! Server-side report jobs: identity, polling and duration estimates.

pub mod estimate;
mod poller;
pub mod types;

pub use estimate::{estimate, DurationEstimate, EstimatorConfig};
pub use poller::{JobPoller, PollerConfig};
pub use types::{JobRecord, JobStatus, ReportKind, ReportParameters};
