//! Declarative field rules and their evaluation.
//!
//! A form carries a table of [`FieldRule`]s. Each rule names one field, the
//! [`Predicate`] under which it is required, and optional value constraints.
//! Predicates are a closed set of tagged variants over raw field values and
//! the discriminator; a predicate can never observe another rule's outcome,
//! so evaluation is pure and independent of rule order.

use std::{
  collections::{BTreeMap, BTreeSet},
  fmt,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  forms::Form,
  record::{Discriminator, FieldValue, RecordDraft},
};

// ─── Predicates ──────────────────────────────────────────────────────────────

/// Condition under which a field becomes required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Predicate {
  Always,
  DiscriminatorIs { value: String },
  DiscriminatorIn { values: Vec<String> },
  /// Case-insensitive comparison against the trimmed field text.
  FieldEquals { field: String, value: String },
  FieldPresent { field: String },
  /// Holds when the field is an integer strictly below `bound`.
  FieldBelow { field: String, bound: i64 },
  All { of: Vec<Predicate> },
  Any { of: Vec<Predicate> },
  Not { predicate: Box<Predicate> },
}

impl Predicate {
  pub fn discriminator_is(value: impl Into<String>) -> Self {
    Self::DiscriminatorIs { value: value.into() }
  }

  pub fn field_equals(field: impl Into<String>, value: impl Into<String>) -> Self {
    Self::FieldEquals { field: field.into(), value: value.into() }
  }

  pub fn field_present(field: impl Into<String>) -> Self {
    Self::FieldPresent { field: field.into() }
  }

  pub fn field_below(field: impl Into<String>, bound: i64) -> Self {
    Self::FieldBelow { field: field.into(), bound }
  }

  pub fn holds(&self, draft: &RecordDraft, discriminator: Option<&Discriminator>) -> bool {
    match self {
      Self::Always => true,
      Self::DiscriminatorIs { value } => {
        discriminator.is_some_and(|d| d.as_str().eq_ignore_ascii_case(value))
      }
      Self::DiscriminatorIn { values } => discriminator.is_some_and(|d| {
        values.iter().any(|v| d.as_str().eq_ignore_ascii_case(v))
      }),
      Self::FieldEquals { field, value } => draft
        .value(field)
        .is_some_and(|v| v.to_string().trim().eq_ignore_ascii_case(value.trim())),
      Self::FieldPresent { field } => draft.value(field).is_some(),
      Self::FieldBelow { field, bound } => draft
        .value(field)
        .and_then(FieldValue::as_integer)
        .is_some_and(|n| n < *bound),
      Self::All { of } => of.iter().all(|p| p.holds(draft, discriminator)),
      Self::Any { of } => of.iter().any(|p| p.holds(draft, discriminator)),
      Self::Not { predicate } => !predicate.holds(draft, discriminator),
    }
  }
}

// ─── Rules ───────────────────────────────────────────────────────────────────

/// Expected shape of a field's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
  #[default]
  Text,
  Integer,
  /// `YYYY-MM-DD`.
  Date,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldRule {
  pub field:          String,
  #[serde(default)]
  pub kind:           FieldKind,
  pub required_when:  Predicate,
  /// Case-insensitive allow-list for text values.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub allowed_values: Option<Vec<String>>,
  /// Lower bound for integer values.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub min:            Option<i64>,
}

impl FieldRule {
  pub fn required(field: impl Into<String>) -> Self {
    Self::new(field, Predicate::Always)
  }

  pub fn optional(field: impl Into<String>) -> Self {
    Self::new(field, Predicate::Not { predicate: Box::new(Predicate::Always) })
  }

  pub fn required_when(field: impl Into<String>, predicate: Predicate) -> Self {
    Self::new(field, predicate)
  }

  fn new(field: impl Into<String>, required_when: Predicate) -> Self {
    Self {
      field: field.into(),
      kind: FieldKind::Text,
      required_when,
      allowed_values: None,
      min: None,
    }
  }

  pub fn kind(mut self, kind: FieldKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn one_of<I, V>(mut self, values: I) -> Self
  where
    I: IntoIterator<Item = V>,
    V: Into<String>,
  {
    self.allowed_values = Some(values.into_iter().map(Into::into).collect());
    self
  }

  pub fn min(mut self, min: i64) -> Self {
    self.min = Some(min);
    self
  }

  /// Check a present value against the rule's shape and constraints.
  fn check(&self, value: &FieldValue) -> Result<(), InvalidReason> {
    match self.kind {
      FieldKind::Text => {}
      FieldKind::Integer => {
        let n = value.as_integer().ok_or(InvalidReason::NotInteger)?;
        if let Some(min) = self.min
          && n < min
        {
          return Err(InvalidReason::BelowMinimum { min });
        }
      }
      FieldKind::Date => {
        value.as_date().ok_or(InvalidReason::NotDate)?;
      }
    }

    if let Some(allowed) = &self.allowed_values {
      let text = value.to_string();
      let text = text.trim();
      if !allowed.iter().any(|a| a.eq_ignore_ascii_case(text)) {
        return Err(InvalidReason::NotAllowed { allowed: allowed.clone() });
      }
    }
    Ok(())
  }
}

// ─── Results ─────────────────────────────────────────────────────────────────

/// Why a field failed evaluation. Ordered so that, when several rules address
/// the same field, the reported reason does not depend on rule order.
#[derive(
  Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Error, Serialize, Deserialize,
)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum InvalidReason {
  #[error("required")]
  Missing,
  #[error("unknown option {value:?}")]
  UnknownDiscriminator { value: String },
  #[error("not a whole number")]
  NotInteger,
  #[error("not a date (expected YYYY-MM-DD)")]
  NotDate,
  #[error("must be at least {min}")]
  BelowMinimum { min: i64 },
  #[error("must be one of {}", .allowed.join(", "))]
  NotAllowed { allowed: Vec<String> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
  pub valid_fields:    BTreeSet<String>,
  pub invalid_fields:  BTreeMap<String, InvalidReason>,
  /// Fields required under the current discriminator and values.
  pub required_fields: BTreeSet<String>,
  pub is_valid:        bool,
}

impl ValidationResult {
  /// A result carrying a single field failure.
  pub fn rejected(field: impl Into<String>, reason: InvalidReason) -> Self {
    let mut invalid_fields = BTreeMap::new();
    invalid_fields.insert(field.into(), reason);
    Self { invalid_fields, is_valid: false, ..Self::default() }
  }

  pub fn is_required(&self, field: &str) -> bool {
    self.required_fields.contains(field)
  }

  pub fn reason(&self, field: &str) -> Option<&InvalidReason> {
    self.invalid_fields.get(field)
  }
}

impl fmt::Display for ValidationResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_valid {
      return f.write_str("valid");
    }
    for (i, (field, reason)) in self.invalid_fields.iter().enumerate() {
      if i > 0 {
        f.write_str("; ")?;
      }
      write!(f, "{field}: {reason}")?;
    }
    Ok(())
  }
}

// ─── Evaluation ──────────────────────────────────────────────────────────────

/// Evaluate `form`'s rules against `draft` under `discriminator`.
///
/// Pure: no state is read besides the arguments, so repeated calls on an
/// unchanged draft return equal results.
pub fn evaluate(
  draft: &RecordDraft,
  discriminator: Option<&Discriminator>,
  form: &Form,
) -> ValidationResult {
  let mut outcomes: BTreeMap<String, Option<InvalidReason>> = BTreeMap::new();
  let mut required_fields = BTreeSet::new();

  let mut record = |field: &str, outcome: Option<InvalidReason>| {
    // Failures win over passes; between failures the smallest reason wins.
    let slot = outcomes.entry(field.to_owned()).or_insert(None);
    *slot = match (slot.take(), outcome) {
      (None, o) | (o, None) => o,
      (Some(a), Some(b)) => Some(a.min(b)),
    };
  };

  let disc_field = form.discriminator_field.as_str();
  required_fields.insert(disc_field.to_owned());
  match discriminator {
    None => record(disc_field, Some(InvalidReason::Missing)),
    Some(d) if form.discriminator(d.as_str()).is_none() => record(
      disc_field,
      Some(InvalidReason::UnknownDiscriminator { value: d.to_string() }),
    ),
    Some(_) => record(disc_field, None),
  }

  for rule in &form.rules {
    let required = rule.required_when.holds(draft, discriminator);
    if required {
      required_fields.insert(rule.field.clone());
    }
    let outcome = match draft.value(&rule.field) {
      Some(value) => rule.check(value).err(),
      None if required => Some(InvalidReason::Missing),
      None => None,
    };
    record(&rule.field, outcome);
  }

  let mut result = ValidationResult { required_fields, ..Default::default() };
  for (field, outcome) in outcomes {
    match outcome {
      Some(reason) => {
        result.invalid_fields.insert(field, reason);
      }
      None => {
        result.valid_fields.insert(field);
      }
    }
  }
  result.is_valid = result.invalid_fields.is_empty();
  result
}
