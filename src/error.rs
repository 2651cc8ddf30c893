//! Error taxonomy shared by the store, the coordinators and the remote adapters.

use rusqlite::ErrorCode;

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure returned by every coordinator operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Remote unreachable or responded with a non-success status.
  #[error("network error: {0}")]
  Network(String),

  /// A local or remote key does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// Duplicate key on insert.
  #[error("constraint violation: {0}")]
  Constraint(String),

  /// The local store ran out of space.
  #[error("local store is full: {0}")]
  QuotaExceeded(String),

  /// A cached payload or remote response could not be decoded.
  #[error("malformed payload: {0}")]
  Decode(String),

  /// The remote rejected a write because it conflicts with newer state.
  #[error("write conflicts with newer remote state: {0}")]
  StaleWrite(String),

  /// Any other local store failure.
  #[error("local store error: {0}")]
  Storage(String),

  /// A report job stayed pending past the configured wait bound.
  #[error("job {key} still pending after {waited_secs}s")]
  JobTimeout { key: String, waited_secs: u64 },

  /// In-flight work was aborted through its cancel handle.
  #[error("operation cancelled")]
  Cancelled,
}

impl Error {
  /// Whether this failure came from the remote side rather than local state.
  pub fn is_network(&self) -> bool {
    matches!(self, Error::Network(_))
  }
}

impl From<rusqlite::Error> for Error {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::QueryReturnedNoRows => Error::NotFound(err.to_string()),
      rusqlite::Error::FromSqlConversionFailure(..)
      | rusqlite::Error::IntegralValueOutOfRange(..)
      | rusqlite::Error::InvalidColumnType(..) => Error::Decode(err.to_string()),
      rusqlite::Error::SqliteFailure(code, _) => match code.code {
        ErrorCode::ConstraintViolation => Error::Constraint(err.to_string()),
        ErrorCode::DiskFull => Error::QuotaExceeded(err.to_string()),
        _ => Error::Storage(err.to_string()),
      },
      _ => Error::Storage(err.to_string()),
    }
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Error::Decode(err.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    if err.is_decode() {
      return Error::Decode(err.to_string());
    }
    match err.status() {
      Some(reqwest::StatusCode::NOT_FOUND) => Error::NotFound(err.to_string()),
      Some(reqwest::StatusCode::CONFLICT) => Error::StaleWrite(err.to_string()),
      _ => Error::Network(err.to_string()),
    }
  }
}
