//! Traits for the engine's external collaborators.
//!
//! Backends (e.g. `clinic-store-sqlite`) implement [`RecordStore`] and
//! [`SequenceGenerator`]. The engine depends on these abstractions, not on any
//! concrete backend.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::{
  record::{NewRecord, PersistedRecord, RecordId, RecordUpdate},
  uniqueness::{ExternalRecordSnapshot, KeyDomain},
};

// ─── Record store ────────────────────────────────────────────────────────────

/// Abstraction over the persistence backend for records.
///
/// All methods return `Send` futures so the trait can be used in multi-threaded
/// async runtimes.
pub trait RecordStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Fetch every key currently stored under `domain`.
  fn fetch_keys<'a>(
    &'a self,
    domain: &'a KeyDomain,
  ) -> impl Future<Output = Result<ExternalRecordSnapshot, Self::Error>> + Send + 'a;

  /// Persist a new record. The backend assigns its id and timestamps.
  fn create(
    &self,
    record: NewRecord,
  ) -> impl Future<Output = Result<PersistedRecord, Self::Error>> + Send + '_;

  /// Apply `update` to an existing record. Fields are merged; a blank value
  /// clears the field.
  fn update<'a>(
    &'a self,
    id: &'a RecordId,
    update: RecordUpdate,
  ) -> impl Future<Output = Result<PersistedRecord, Self::Error>> + Send + 'a;

  /// Retrieve a record by id. Returns `None` if not found.
  fn get<'a>(
    &'a self,
    id: &'a RecordId,
  ) -> impl Future<Output = Result<Option<PersistedRecord>, Self::Error>> + Send + 'a;

  /// List the records of one form, oldest first.
  fn list<'a>(
    &'a self,
    form: &'a str,
  ) -> impl Future<Output = Result<Vec<PersistedRecord>, Self::Error>> + Send + 'a;
}

// ─── Sequence generator ──────────────────────────────────────────────────────

/// Issues business keys from named sequences.
pub trait SequenceGenerator: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  /// Reserve the next key in `sequence`. Keys are never reissued.
  fn next<'a>(
    &'a self,
    sequence: &'a str,
  ) -> impl Future<Output = Result<String, Self::Error>> + Send + 'a;
}

// ─── Notifications ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
  Success,
  Info,
  Error,
}

/// A user-facing message, optionally tied to a field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
  pub level:   NoticeLevel,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub field:   Option<String>,
}

impl Notice {
  pub fn success(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Success, message: message.into(), field: None }
  }

  pub fn info(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Info, message: message.into(), field: None }
  }

  pub fn error(message: impl Into<String>) -> Self {
    Self { level: NoticeLevel::Error, message: message.into(), field: None }
  }

  pub fn on_field(mut self, field: impl Into<String>) -> Self {
    self.field = Some(field.into());
    self
  }
}

/// Receives user-facing notices. Delivery is fire-and-forget.
pub trait NotificationSink: Send + Sync {
  fn notify(&self, notice: Notice);
}
