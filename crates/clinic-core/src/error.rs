//! Error types for `clinic-core`.

use thiserror::Error;

use crate::record::DraftId;

#[derive(Debug, Error)]
pub enum Error {
  #[error("draft {0} is persisted and can no longer be edited")]
  DraftClosed(DraftId),

  #[error("unknown discriminator {value:?} for form {form:?}")]
  UnknownDiscriminator { form: String, value: String },

  #[error("unknown form: {0:?}")]
  UnknownForm(String),

  #[error("unknown record status: {0:?}")]
  UnknownStatus(String),

  #[error("invalid date {0:?}, expected YYYY-MM-DD")]
  InvalidDate(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
