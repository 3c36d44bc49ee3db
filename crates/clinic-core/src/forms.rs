//! Form definitions: discriminators, key policies, and the built-in clinic
//! forms.

use std::collections::BTreeMap;

use chrono::Weekday;
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  dates::DateFields,
  record::{FieldMap, RecordDraft},
  rules::{FieldKind, FieldRule, Predicate, ValidationResult, evaluate},
};

pub const PATIENT_REGISTRATION: &str = "patient_registration";
pub const DIET_REQUEST: &str = "diet_request";
pub const INVESTIGATION_REQUEST: &str = "investigation_request";

// ─── Definitions ─────────────────────────────────────────────────────────────

/// How a draft's business key is obtained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum KeyPolicy {
  /// The user types the key.
  #[default]
  Manual,
  /// The key is reserved from the named sequence when the draft is created.
  Generated { sequence: String },
}

/// Default date for a scheduled field: the next day on an allowed weekday.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
  pub field:    String,
  pub weekdays: Vec<Weekday>,
}

/// One allowed discriminator value and what it implies for a new draft.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscriminatorSpec {
  pub value:      String,
  #[serde(default)]
  pub key_policy: KeyPolicy,
  #[serde(default, skip_serializing_if = "FieldMap::is_empty")]
  pub defaults:   FieldMap,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub schedule:   Option<Schedule>,
}

impl DiscriminatorSpec {
  pub fn new(value: impl Into<String>) -> Self {
    Self {
      value:      value.into(),
      key_policy: KeyPolicy::Manual,
      defaults:   FieldMap::new(),
      schedule:   None,
    }
  }

  pub fn generated_key(mut self, sequence: impl Into<String>) -> Self {
    self.key_policy = KeyPolicy::Generated { sequence: sequence.into() };
    self
  }

  pub fn default_value(
    mut self,
    field: impl Into<String>,
    value: impl Into<crate::record::FieldValue>,
  ) -> Self {
    self.defaults.insert(field.into(), value.into());
    self
  }

  pub fn scheduled_on(mut self, field: impl Into<String>, weekdays: &[Weekday]) -> Self {
    self.schedule = Some(Schedule { field: field.into(), weekdays: weekdays.to_vec() });
    self
  }
}

/// A form: its discriminator, rule table, optional unique business key, and
/// optional start/duration/end date triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
  pub name:                String,
  pub discriminator_field: String,
  pub discriminators:      Vec<DiscriminatorSpec>,
  pub rules:               Vec<FieldRule>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub business_key:        Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub dates:               Option<DateFields>,
}

impl Form {
  /// The definition of discriminator `value`, compared case-insensitively.
  pub fn discriminator(&self, value: &str) -> Option<&DiscriminatorSpec> {
    self
      .discriminators
      .iter()
      .find(|d| d.value.eq_ignore_ascii_case(value.trim()))
  }

  /// Like [`Form::discriminator`] but an unknown value is an error.
  pub fn require_discriminator(&self, value: &str) -> Result<&DiscriminatorSpec> {
    self.discriminator(value).ok_or_else(|| Error::UnknownDiscriminator {
      form:  self.name.clone(),
      value: value.to_owned(),
    })
  }

  /// Evaluate the rules against the draft's own discriminator.
  pub fn evaluate(&self, draft: &RecordDraft) -> ValidationResult {
    evaluate(draft, draft.discriminator(), self)
  }
}

/// Forms by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FormRegistry {
  forms: BTreeMap<String, Form>,
}

impl FormRegistry {
  /// The forms the clinic ships with.
  pub fn builtin() -> Self {
    let mut registry = Self::default();
    registry.insert(patient_registration());
    registry.insert(diet_request());
    registry.insert(investigation_request());
    registry
  }

  pub fn insert(&mut self, form: Form) { self.forms.insert(form.name.clone(), form); }

  pub fn get(&self, name: &str) -> Result<&Form> {
    self.forms.get(name).ok_or_else(|| Error::UnknownForm(name.to_owned()))
  }

  pub fn iter(&self) -> impl Iterator<Item = &Form> { self.forms.values() }
}

// ─── Built-in forms ──────────────────────────────────────────────────────────

/// New patients get a generated `PT-` number; transfers keep the number they
/// arrive with and must name the referring hospital.
pub fn patient_registration() -> Form {
  Form {
    name:                PATIENT_REGISTRATION.into(),
    discriminator_field: "registration_type".into(),
    discriminators:      vec![
      DiscriminatorSpec::new("new").generated_key("PT"),
      DiscriminatorSpec::new("transfer"),
    ],
    rules:               vec![
      FieldRule::required("patient_id"),
      FieldRule::required("name"),
      FieldRule::required("age").kind(FieldKind::Integer).min(0),
      FieldRule::required("gender").one_of(["female", "male", "other"]),
      FieldRule::required("phone"),
      FieldRule::optional("address"),
      FieldRule::required_when(
        "previous_hospital",
        Predicate::discriminator_is("transfer"),
      ),
      FieldRule::required_when("guardian_name", Predicate::field_below("age", 18)),
    ],
    business_key:        Some("patient_id".into()),
    dates:               None,
  }
}

pub fn diet_request() -> Form {
  Form {
    name:                DIET_REQUEST.into(),
    discriminator_field: "diet_type".into(),
    discriminators:      vec![
      DiscriminatorSpec::new("general").default_value("meals_per_day", 3),
      DiscriminatorSpec::new("therapeutic").default_value("meals_per_day", 5),
    ],
    rules:               vec![
      FieldRule::required("patient_id"),
      FieldRule::required("diet"),
      FieldRule::required("meals_per_day").kind(FieldKind::Integer).min(1),
      FieldRule::required("start_date").kind(FieldKind::Date),
      FieldRule::required("duration").kind(FieldKind::Integer).min(1),
      FieldRule::required("end_date").kind(FieldKind::Date),
      FieldRule::required_when("condition", Predicate::discriminator_is("therapeutic")),
      FieldRule::optional("remarks"),
    ],
    business_key:        None,
    dates:               Some(DateFields::new("start_date", "duration", "end_date")),
  }
}

/// Blood draws run Monday to Saturday; ultrasound only on Tuesdays and
/// Thursdays.
pub fn investigation_request() -> Form {
  use Weekday::*;

  Form {
    name:                INVESTIGATION_REQUEST.into(),
    discriminator_field: "investigation".into(),
    discriminators:      vec![
      DiscriminatorSpec::new("blood")
        .scheduled_on("appointment_date", &[Mon, Tue, Wed, Thu, Fri, Sat]),
      DiscriminatorSpec::new("ultrasound").scheduled_on("appointment_date", &[Tue, Thu]),
    ],
    rules:               vec![
      FieldRule::required("patient_id"),
      FieldRule::required("appointment_date").kind(FieldKind::Date),
      FieldRule::required_when("tests", Predicate::discriminator_is("blood")),
      FieldRule::optional("fasting").one_of(["yes", "no"]),
      FieldRule::required_when("region", Predicate::discriminator_is("ultrasound"))
        .one_of(["abdomen", "pelvis", "obstetric", "thyroid"]),
    ],
    business_key:        None,
    dates:               None,
  }
}
