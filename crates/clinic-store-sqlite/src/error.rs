//! Error type for `clinic-store-sqlite`.

use clinic_core::record::RecordId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] clinic_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// Record ids issued by this store are row numbers.
  #[error("not a record id of this store: {0:?}")]
  InvalidRecordId(String),

  #[error("record not found: {0}")]
  RecordNotFound(RecordId),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
