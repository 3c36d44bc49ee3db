//! Error types for `clinic-engine`.

use clinic_core::{
  record::{DraftId, RecordId, RecordStatus},
  rules::ValidationResult,
};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
  #[error("validation failed: {0}")]
  ValidationFailed(ValidationResult),

  #[error("{key:?} is already used by record {existing}")]
  UniquenessConflict { key: String, existing: RecordId },

  #[error("{key:?} is already being saved by another submission")]
  KeyClaimed { key: String },

  #[error("record store unreachable: {0}")]
  Unreachable(String),

  #[error("could not reserve a number from sequence {sequence:?}: {source}")]
  SequenceUnavailable {
    sequence: String,
    #[source]
    source:   BoxError,
  },

  #[error("could not save record: {0}")]
  PersistenceFailed(#[source] BoxError),

  #[error("draft {0} is already being submitted")]
  SubmitInFlight(DraftId),

  #[error("draft {0} has already been saved")]
  AlreadyPersisted(DraftId),

  #[error("record {0} not found")]
  RecordNotFound(RecordId),

  #[error("form {0:?} has no date span to renew")]
  NotRenewable(String),

  #[error("record {id} cannot move from {from} to {to}")]
  InvalidStatusTransition {
    id:   RecordId,
    from: RecordStatus,
    to:   RecordStatus,
  },

  #[error("store error: {0}")]
  Store(#[source] BoxError),

  #[error(transparent)]
  Core(#[from] clinic_core::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
