//! Renewal: a new draft derived from a persisted record.
//!
//! Everything the source carried is copied except its identity, its date
//! span, and its status. The new span is computed from the supplied start and
//! duration and the status starts over as active.

use serde::{Deserialize, Serialize};

use crate::{
  dates::{self, DateFields},
  forms::Form,
  record::{
    Discriminator, FieldMap, PersistedRecord, RecordDraft, RecordId, RecordStatus,
  },
  rules::{InvalidReason, ValidationResult},
};

/// A draft produced by renewing `source_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalDraft {
  pub draft:     RecordDraft,
  pub source_id: RecordId,
  /// Status the renewed record is created with.
  pub status:    RecordStatus,
}

impl RenewalDraft {
  pub fn into_draft(self) -> RecordDraft { self.draft }
}

/// Derive a renewal of `source`.
///
/// `overrides` replace copied values; the date triple always comes from
/// `new_start` and `new_duration`. An override of the form's discriminator
/// field switches the discriminator. Returns the field failure when the start
/// date does not parse or the duration is below one day.
pub fn renew(
  source: &PersistedRecord,
  form: &Form,
  date_fields: &DateFields,
  new_start: &str,
  new_duration: i64,
  overrides: &FieldMap,
) -> Result<RenewalDraft, ValidationResult> {
  let start = dates::parse_date(new_start).map_err(|_| {
    ValidationResult::rejected(&date_fields.start, InvalidReason::NotDate)
  })?;
  let end = dates::compute_end_date(start, new_duration).ok_or_else(|| {
    ValidationResult::rejected(&date_fields.duration, InvalidReason::BelowMinimum { min: 1 })
  })?;

  let mut draft = RecordDraft::new(&source.form);
  let mut discriminator = source.discriminator.clone();

  for (field, value) in source.fields.iter().chain(overrides) {
    if field == &date_fields.start || field == &date_fields.end {
      continue;
    }
    if field == &form.discriminator_field {
      discriminator = Some(Discriminator::new(value.to_string()));
      continue;
    }
    draft.put_derived(field, Some(value.clone()));
  }

  if let Some(d) = discriminator {
    draft.put_discriminator(d);
  }
  draft.put_derived(&date_fields.start, Some(start.into()));
  draft.put_derived(&date_fields.duration, Some(new_duration.into()));
  draft.put_derived(&date_fields.end, Some(end.into()));

  Ok(RenewalDraft {
    draft,
    source_id: source.id.clone(),
    status: RecordStatus::default(),
  })
}
