//! Record types: drafts, persisted records, and the values they carry.
//!
//! A [`RecordDraft`] is an in-progress form owned by a UI session. Once the
//! record store accepts it, the store hands back a [`PersistedRecord`] with an
//! opaque [`RecordId`] and a [`RecordStatus`] from a closed set.

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{Error, Result, dates};

// ─── Identities ──────────────────────────────────────────────────────────────

/// Identity of one draft instance. Clones of a draft share it, which is what
/// the engine keys submit serialisation on.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DraftId(Uuid);

impl DraftId {
  pub fn new() -> Self { Self(Uuid::new_v4()) }

  pub fn as_uuid(&self) -> Uuid { self.0 }
}

impl Default for DraftId {
  fn default() -> Self { Self::new() }
}

impl fmt::Display for DraftId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

/// Opaque identity assigned by the record store (a row index or equivalent).
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for RecordId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for RecordId {
  fn from(s: &str) -> Self { Self(s.to_owned()) }
}

impl From<String> for RecordId {
  fn from(s: String) -> Self { Self(s) }
}

// ─── Values ──────────────────────────────────────────────────────────────────

/// A raw field value as entered in a form: either a string or an integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
  Integer(i64),
  Text(String),
}

impl FieldValue {
  /// `true` for text that is empty after trimming. Integers are never blank.
  pub fn is_blank(&self) -> bool {
    match self {
      Self::Integer(_) => false,
      Self::Text(s) => s.trim().is_empty(),
    }
  }

  /// Integer view of the value; numeric text is accepted.
  pub fn as_integer(&self) -> Option<i64> {
    match self {
      Self::Integer(n) => Some(*n),
      Self::Text(s) => s.trim().parse().ok(),
    }
  }

  /// Calendar date view of the value (`YYYY-MM-DD` text only).
  pub fn as_date(&self) -> Option<NaiveDate> {
    match self {
      Self::Integer(_) => None,
      Self::Text(s) => dates::parse_date(s).ok(),
    }
  }
}

impl fmt::Display for FieldValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Integer(n) => fmt::Display::fmt(n, f),
      Self::Text(s) => f.write_str(s),
    }
  }
}

impl From<&str> for FieldValue {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for FieldValue {
  fn from(s: String) -> Self { Self::Text(s) }
}

impl From<i64> for FieldValue {
  fn from(n: i64) -> Self { Self::Integer(n) }
}

impl From<i32> for FieldValue {
  fn from(n: i32) -> Self { Self::Integer(n.into()) }
}

impl From<NaiveDate> for FieldValue {
  fn from(d: NaiveDate) -> Self { Self::Text(dates::format_date(d)) }
}

/// Field name → value. Ordered so that serialised records are stable.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// The value that selects which conditional rules apply to a draft.
#[derive(
  Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Discriminator(String);

impl Discriminator {
  pub fn new(value: impl Into<String>) -> Self {
    Self(value.into().trim().to_lowercase())
  }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for Discriminator {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Status of a persisted record.
#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
  Default,
  Display,
  EnumString,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RecordStatus {
  #[default]
  Active,
  Completed,
  Cancelled,
}

impl RecordStatus {
  pub fn parse(s: &str) -> Result<Self> {
    s.trim()
      .parse()
      .map_err(|_| Error::UnknownStatus(s.to_owned()))
  }

  /// Only active records move; completed and cancelled are final.
  pub fn can_transition_to(self, next: RecordStatus) -> bool {
    matches!(
      (self, next),
      (Self::Active, Self::Completed) | (Self::Active, Self::Cancelled)
    )
  }
}

/// Where a draft is in its lifecycle.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DraftState {
  #[default]
  Draft,
  Validating,
  Submitted,
  Persisted,
  /// Local validation or the uniqueness gate refused the draft.
  Rejected,
  /// A collaborator was unreachable or refused the write.
  Failed,
}

impl DraftState {
  pub fn is_terminal(self) -> bool { matches!(self, Self::Persisted) }
}

// ─── Draft ───────────────────────────────────────────────────────────────────

/// An in-progress record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDraft {
  id:            DraftId,
  form:          String,
  discriminator: Option<Discriminator>,
  fields:        FieldMap,
  touched:       bool,
  state:         DraftState,
  /// Set when the draft edits an existing record in place.
  editing:       Option<RecordId>,
}

impl RecordDraft {
  pub fn new(form: impl Into<String>) -> Self {
    Self {
      id:            DraftId::new(),
      form:          form.into(),
      discriminator: None,
      fields:        FieldMap::new(),
      touched:       false,
      state:         DraftState::Draft,
      editing:       None,
    }
  }

  /// Open an edit draft over an existing record. Submitting it updates the
  /// record instead of creating a new one.
  pub fn from_persisted(record: &PersistedRecord) -> Self {
    Self {
      id:            DraftId::new(),
      form:          record.form.clone(),
      discriminator: record.discriminator.clone(),
      fields:        record.fields.clone(),
      touched:       false,
      state:         DraftState::Draft,
      editing:       Some(record.id.clone()),
    }
  }

  /// Start the draft under `discriminator` without marking it touched.
  pub fn with_discriminator(mut self, discriminator: Discriminator) -> Self {
    self.discriminator = Some(discriminator);
    self
  }

  pub fn id(&self) -> DraftId { self.id }

  pub fn form(&self) -> &str { &self.form }

  pub fn discriminator(&self) -> Option<&Discriminator> {
    self.discriminator.as_ref()
  }

  pub fn fields(&self) -> &FieldMap { &self.fields }

  pub fn get(&self, field: &str) -> Option<&FieldValue> { self.fields.get(field) }

  /// A present, non-blank value for `field`.
  pub fn value(&self, field: &str) -> Option<&FieldValue> {
    self.fields.get(field).filter(|v| !v.is_blank())
  }

  pub fn touched(&self) -> bool { self.touched }

  pub fn state(&self) -> DraftState { self.state }

  pub fn editing(&self) -> Option<&RecordId> { self.editing.as_ref() }

  fn ensure_open(&self) -> Result<()> {
    if self.state.is_terminal() {
      return Err(Error::DraftClosed(self.id));
    }
    Ok(())
  }

  /// Set a field as the user would. Marks the draft touched.
  pub fn set_field(
    &mut self,
    field: impl Into<String>,
    value: impl Into<FieldValue>,
  ) -> Result<()> {
    self.ensure_open()?;
    self.fields.insert(field.into(), value.into());
    self.touched = true;
    Ok(())
  }

  pub fn clear_field(&mut self, field: &str) -> Result<Option<FieldValue>> {
    self.ensure_open()?;
    self.touched = true;
    Ok(self.fields.remove(field))
  }

  /// Switch the discriminator. Field values are kept as entered; only the
  /// rules evaluated against them change.
  pub fn set_discriminator(&mut self, discriminator: Discriminator) -> Result<()> {
    self.ensure_open()?;
    self.discriminator = Some(discriminator);
    self.touched = true;
    Ok(())
  }

  /// Unset the discriminator, as when the user blanks the selection.
  pub fn clear_discriminator(&mut self) -> Result<Option<Discriminator>> {
    self.ensure_open()?;
    self.touched = true;
    Ok(self.discriminator.take())
  }

  /// Fill `field` with a default unless the user already entered something.
  /// Does not mark the draft touched.
  pub fn seed(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
    let field = field.into();
    let present = self.fields.get(&field).is_some_and(|v| !v.is_blank());
    if !present {
      self.fields.insert(field, value.into());
    }
  }

  /// Write or remove a derived value (e.g. a computed end date).
  pub(crate) fn put_derived(&mut self, field: &str, value: Option<FieldValue>) {
    match value {
      Some(v) => {
        self.fields.insert(field.to_owned(), v);
      }
      None => {
        self.fields.remove(field);
      }
    }
  }

  pub(crate) fn put_discriminator(&mut self, discriminator: Discriminator) {
    self.discriminator = Some(discriminator);
  }

  /// Move the draft to `state`. Driven by the lifecycle manager.
  pub fn transition(&mut self, state: DraftState) { self.state = state; }
}

// ─── Persisted ───────────────────────────────────────────────────────────────

/// A record accepted by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
  pub id:            RecordId,
  pub form:          String,
  pub discriminator: Option<Discriminator>,
  pub status:        RecordStatus,
  pub fields:        FieldMap,
  pub created_at:    DateTime<Utc>,
  pub updated_at:    DateTime<Utc>,
}

/// Input to [`crate::store::RecordStore::create`]. Identity and timestamps are
/// assigned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
  pub form:          String,
  pub discriminator: Option<Discriminator>,
  pub status:        RecordStatus,
  pub fields:        FieldMap,
}

impl NewRecord {
  pub fn from_draft(draft: &RecordDraft) -> Self {
    Self {
      form:          draft.form.clone(),
      discriminator: draft.discriminator.clone(),
      status:        RecordStatus::Active,
      fields:        draft.fields.clone(),
    }
  }
}

/// Input to [`crate::store::RecordStore::update`]. `fields` are merged over
/// the stored ones; `None` leaves a column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordUpdate {
  pub fields:        FieldMap,
  pub discriminator: Option<Discriminator>,
  pub status:        Option<RecordStatus>,
}

/// Merge `update` over `fields`. A blank value removes the field.
pub fn merge_fields(fields: &mut FieldMap, update: FieldMap) {
  for (field, value) in update {
    if value.is_blank() {
      fields.remove(&field);
    } else {
      fields.insert(field, value);
    }
  }
}
