//! Date derivation for request forms.
//!
//! All functions here are pure. An impossible derivation (non-positive
//! duration, unparsable start date, calendar overflow) yields `None` so the
//! rule engine can report it as a field error instead of anything panicking.

use chrono::{Datelike, Days, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, record::RecordDraft};

const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn parse_date(s: &str) -> Result<NaiveDate> {
  NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
    .map_err(|_| Error::InvalidDate(s.to_owned()))
}

pub fn format_date(d: NaiveDate) -> String { d.format(DATE_FORMAT).to_string() }

/// Last day of a span that starts on `start` and lasts `duration_days` days,
/// counting the start day itself.
pub fn compute_end_date(start: NaiveDate, duration_days: i64) -> Option<NaiveDate> {
  if duration_days < 1 {
    return None;
  }
  start.checked_add_days(Days::new(duration_days.unsigned_abs() - 1))
}

/// Earliest date on or after `today` that falls on one of `allowed`.
///
/// `today` itself counts when its weekday is allowed.
pub fn next_allowed_date(today: NaiveDate, allowed: &[Weekday]) -> Option<NaiveDate> {
  today
    .iter_days()
    .take(7)
    .find(|d| allowed.contains(&d.weekday()))
}

/// Names of the fields a form uses for a start/duration/end triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateFields {
  pub start:    String,
  pub duration: String,
  pub end:      String,
}

impl DateFields {
  pub fn new(
    start: impl Into<String>,
    duration: impl Into<String>,
    end: impl Into<String>,
  ) -> Self {
    Self { start: start.into(), duration: duration.into(), end: end.into() }
  }

  /// `true` when editing `field` requires the end date to be recomputed.
  pub fn is_input(&self, field: &str) -> bool {
    field == self.start || field == self.duration
  }
}

/// Recompute the end-date field of `draft` from its start and duration.
///
/// When the inputs cannot produce a date the end field is removed, leaving it
/// for the rule engine to flag as missing.
pub fn derive_dates(draft: &mut RecordDraft, fields: &DateFields) -> Option<NaiveDate> {
  let start = draft.get(&fields.start).and_then(|v| v.as_date());
  let duration = draft.get(&fields.duration).and_then(|v| v.as_integer());
  let end = start
    .zip(duration)
    .and_then(|(s, d)| compute_end_date(s, d));
  draft.put_derived(&fields.end, end.map(Into::into));
  end
}
