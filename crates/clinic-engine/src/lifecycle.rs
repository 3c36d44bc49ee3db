//! The draft lifecycle: create, edit, validate, submit, renew.
//!
//! A draft moves `Draft → Validating → Submitted → Persisted`. A failed rule
//! or key conflict sends it to `Rejected`; an unreachable collaborator sends
//! it to `Failed`. Both return to `Draft` on the next edit. Only one submit
//! per draft, and one per business key, may be in flight at a time.

use std::{
  collections::HashSet,
  future::Future,
  hash::Hash,
  sync::{Arc, Mutex, PoisonError},
};

use chrono::Local;
use clinic_core::{
  dates::{derive_dates, next_allowed_date},
  forms::{Form, FormRegistry, KeyPolicy},
  record::{
    Discriminator, DraftId, DraftState, FieldMap, FieldValue, NewRecord, PersistedRecord,
    RecordDraft, RecordId, RecordStatus, RecordUpdate,
  },
  renewal::{self, RenewalDraft},
  rules::ValidationResult,
  store::{Notice, NotificationSink, RecordStore, SequenceGenerator},
  uniqueness::{KeyDomain, Verdict, normalize_key},
};

use crate::{
  Error, Result,
  config::{EngineConfig, UnknownPolicy},
  section::{RestoredSection, SectionKey, SectionStateCache},
  uniqueness::{KeyCheck, UniquenessValidator},
};

// ─── Claims ──────────────────────────────────────────────────────────────────

/// Holds `item` in a shared set until dropped.
struct Claim<'a, T: Eq + Hash> {
  set:  &'a Mutex<HashSet<T>>,
  item: T,
}

impl<'a, T: Eq + Hash + Clone> Claim<'a, T> {
  /// `None` if `item` is already claimed.
  fn acquire(set: &'a Mutex<HashSet<T>>, item: T) -> Option<Self> {
    let inserted = set
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(item.clone());
    inserted.then_some(Self { set, item })
  }
}

impl<T: Eq + Hash> Drop for Claim<'_, T> {
  fn drop(&mut self) {
    self
      .set
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(&self.item);
  }
}

/// A business key being confirmed and saved by some submit.
type KeyClaim = (KeyDomain, String);

/// Validator slot for a draft's business key.
fn key_slot(id: DraftId, key_field: &str) -> String { format!("{id}:{key_field}") }

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct RecordLifecycleManager<S, G> {
  store:     Arc<S>,
  sequence:  Arc<G>,
  forms:     Arc<FormRegistry>,
  validator: UniquenessValidator<S>,
  sections:  SectionStateCache,
  notices:   Arc<dyn NotificationSink>,
  config:    EngineConfig,
  in_flight: Mutex<HashSet<DraftId>>,
  keys:      Mutex<HashSet<KeyClaim>>,
}

impl<S, G> RecordLifecycleManager<S, G>
where
  S: RecordStore,
  G: SequenceGenerator,
{
  pub fn new(
    store: Arc<S>,
    sequence: Arc<G>,
    forms: FormRegistry,
    notices: Arc<dyn NotificationSink>,
    config: EngineConfig,
  ) -> Self {
    Self {
      validator: UniquenessValidator::new(Arc::clone(&store), config.clone()),
      store,
      sequence,
      forms: Arc::new(forms),
      sections: SectionStateCache::new(),
      notices,
      config,
      in_flight: Mutex::default(),
      keys: Mutex::default(),
    }
  }

  pub fn forms(&self) -> &FormRegistry { &self.forms }

  pub fn form(&self, name: &str) -> Result<&Form> { Ok(self.forms.get(name)?) }

  pub fn sections(&self) -> &SectionStateCache { &self.sections }

  pub fn validator(&self) -> &UniquenessValidator<S> { &self.validator }

  // ── Drafts ────────────────────────────────────────────────────────────

  /// A fresh, untouched draft of `form`, with the discriminator's defaults
  /// and scheduled dates filled in. No key is reserved.
  pub fn blank_draft(&self, form: &str, discriminator: Option<&str>) -> Result<RecordDraft> {
    let form = self.form(form)?;
    let mut draft = RecordDraft::new(&form.name);
    if let Some(value) = discriminator {
      let spec = form.require_discriminator(value)?;
      draft = draft.with_discriminator(Discriminator::new(&spec.value));
      apply_defaults(&mut draft, form);
    }
    Ok(draft)
  }

  /// A blank draft with its business key reserved when the discriminator
  /// calls for a generated one.
  pub async fn create_draft(
    &self,
    form: &str,
    discriminator: Option<&str>,
  ) -> Result<RecordDraft> {
    let mut draft = self.blank_draft(form, discriminator)?;
    self.reserve_key(&mut draft).await?;
    Ok(draft)
  }

  /// Reserve a generated key for `draft` if its discriminator uses one and
  /// the key field is still blank. Safe to retry after a failure.
  pub async fn reserve_key(&self, draft: &mut RecordDraft) -> Result<Option<String>> {
    let form = self.form(draft.form())?;
    let Some(key_field) = &form.business_key else { return Ok(None) };
    if draft.value(key_field).is_some() {
      return Ok(None);
    }
    let policy = draft
      .discriminator()
      .and_then(|d| form.discriminator(d.as_str()))
      .map(|spec| &spec.key_policy);
    let Some(KeyPolicy::Generated { sequence }) = policy else { return Ok(None) };

    match self.sequence.next(sequence).await {
      Ok(key) => {
        tracing::debug!(draft = %draft.id(), key = %key, "reserved business key");
        draft.seed(key_field, key.as_str());
        Ok(Some(key))
      }
      Err(e) => {
        tracing::warn!(sequence = %sequence, error = %e, "sequence generator unavailable");
        self.notices.notify(
          Notice::error(format!("Could not generate a {key_field}. Try again."))
            .on_field(key_field),
        );
        Err(Error::SequenceUnavailable { sequence: sequence.clone(), source: Box::new(e) })
      }
    }
  }

  /// Apply one user edit and return the draft's new validation.
  ///
  /// Editing the discriminator field switches the discriminator, keeping
  /// entered values and seeding the new one's defaults into blank fields.
  /// A blank value clears it. Editing a date input recomputes the end date.
  ///
  /// This never reserves a generated key; use [`Self::switch_discriminator`]
  /// for that.
  pub fn edit(
    &self,
    draft: &mut RecordDraft,
    field: &str,
    value: impl Into<FieldValue>,
  ) -> Result<ValidationResult> {
    let form = self.form(draft.form())?;
    let value = value.into();

    if field == form.discriminator_field {
      if value.is_blank() {
        draft.clear_discriminator()?;
      } else {
        draft.set_discriminator(Discriminator::new(value.to_string()))?;
        apply_defaults(draft, form);
      }
    } else {
      draft.set_field(field, value)?;
      if let Some(dates) = &form.dates
        && dates.is_input(field)
      {
        derive_dates(draft, dates);
      }
    }

    if matches!(draft.state(), DraftState::Rejected | DraftState::Failed) {
      draft.transition(DraftState::Draft);
    }
    Ok(form.evaluate(draft))
  }

  pub fn set_discriminator(
    &self,
    draft: &mut RecordDraft,
    value: &str,
  ) -> Result<ValidationResult> {
    let field = self.form(draft.form())?.discriminator_field.clone();
    self.edit(draft, &field, value)
  }

  /// Switch the discriminator and reserve a key if the new one generates
  /// its keys and the key field is blank.
  pub async fn switch_discriminator(
    &self,
    draft: &mut RecordDraft,
    value: &str,
  ) -> Result<ValidationResult> {
    self.set_discriminator(draft, value)?;
    self.reserve_key(draft).await?;
    self.validate(draft)
  }

  pub fn validate(&self, draft: &RecordDraft) -> Result<ValidationResult> {
    Ok(self.form(draft.form())?.evaluate(draft))
  }

  // ── Uniqueness ────────────────────────────────────────────────────────

  /// Start a debounced uniqueness check of the draft's business key.
  ///
  /// Returns `None` when the form has no key or the key is blank; a blank key
  /// also cancels any pending check. The future resolves to `None` if a newer
  /// check for the same draft supersedes it.
  pub fn check_key<'a>(
    &'a self,
    draft: &RecordDraft,
  ) -> Result<Option<impl Future<Output = Option<KeyCheck>> + Send + use<'a, S, G>>> {
    let form = self.form(draft.form())?;
    let Some(key_field) = &form.business_key else { return Ok(None) };
    let slot = key_slot(draft.id(), key_field);

    let Some(key) = draft.value(key_field) else {
      self.validator.cancel(&slot);
      return Ok(None);
    };
    Ok(Some(self.validator.check(
      &slot,
      KeyDomain::new(&form.name, key_field),
      &key.to_string(),
      draft.editing().cloned(),
    )))
  }

  /// The last published key check for `draft`.
  pub fn key_status(&self, draft: &RecordDraft) -> Option<KeyCheck> {
    let form = self.form(draft.form()).ok()?;
    let key_field = form.business_key.as_ref()?;
    self.validator.latest(&key_slot(draft.id(), key_field))
  }

  // ── Submit ────────────────────────────────────────────────────────────

  /// Validate, confirm key uniqueness against a fresh snapshot, and persist.
  ///
  /// A draft opened with [`RecordDraft::from_persisted`] updates its record;
  /// any other draft creates one. A second submit of a draft whose first is
  /// still running returns [`Error::SubmitInFlight`] without side effects.
  /// A different draft carrying a key that is still being saved is rejected
  /// with [`Error::KeyClaimed`].
  pub async fn submit(&self, draft: &mut RecordDraft) -> Result<PersistedRecord> {
    if draft.state().is_terminal() {
      return Err(Error::AlreadyPersisted(draft.id()));
    }
    let _in_flight =
      Claim::acquire(&self.in_flight, draft.id()).ok_or(Error::SubmitInFlight(draft.id()))?;
    let form = self.form(draft.form())?;

    draft.transition(DraftState::Validating);
    if let Some(dates) = &form.dates {
      derive_dates(draft, dates);
    }
    let validation = form.evaluate(draft);
    if !validation.is_valid {
      draft.transition(DraftState::Rejected);
      self.notices.notify(Notice::error(format!("Please correct: {validation}")));
      return Err(Error::ValidationFailed(validation));
    }

    let _key = match &form.business_key {
      Some(key_field) => self.confirm_unique(draft, form, key_field).await?,
      None => None,
    };

    draft.transition(DraftState::Submitted);
    let saved = match draft.editing().cloned() {
      Some(id) => {
        let update = RecordUpdate {
          fields:        draft.fields().clone(),
          discriminator: draft.discriminator().cloned(),
          status:        None,
        };
        self.store.update(&id, update).await
      }
      None => self.store.create(NewRecord::from_draft(draft)).await,
    };
    let record = match saved {
      Ok(record) => record,
      Err(e) => {
        draft.transition(DraftState::Failed);
        tracing::error!(draft = %draft.id(), error = %e, "failed to persist record");
        self.notices.notify(Notice::error(format!("Could not save: {e}")));
        return Err(Error::PersistenceFailed(Box::new(e)));
      }
    };

    draft.transition(DraftState::Persisted);
    self.sections.clear_draft(draft.id());
    if let Some(key_field) = &form.business_key {
      self.validator.forget(&key_slot(draft.id(), key_field));
      self.validator.invalidate(&KeyDomain::new(&form.name, key_field));
    }
    tracing::info!(form = %record.form, id = %record.id, "record saved");
    self.notices.notify(Notice::success(format!("Saved {} {}", record.form, record.id)));
    Ok(record)
  }

  /// Claim the draft's key and confirm no saved record uses it.
  ///
  /// The returned claim must be held until the record is written; another
  /// submit carrying the same key meanwhile is rejected as a conflict.
  async fn confirm_unique(
    &self,
    draft: &mut RecordDraft,
    form: &Form,
    key_field: &str,
  ) -> Result<Option<Claim<'_, KeyClaim>>> {
    let Some(key) = draft.value(key_field).map(ToString::to_string) else { return Ok(None) };
    let domain = KeyDomain::new(&form.name, key_field);

    let Some(claim) = Claim::acquire(&self.keys, (domain.clone(), normalize_key(&key))) else {
      draft.transition(DraftState::Rejected);
      tracing::warn!(draft = %draft.id(), key = %key, "key is already being saved");
      self.notices.notify(
        Notice::error(format!("{key} is already being saved by another submission"))
          .on_field(key_field),
      );
      return Err(Error::KeyClaimed { key });
    };

    let exclude = draft.editing().cloned();
    let check = self.validator.check_now(&domain, &key, exclude.as_ref()).await;

    match check.verdict {
      Verdict::Unique => Ok(Some(claim)),
      Verdict::Conflict { existing } => {
        draft.transition(DraftState::Rejected);
        self.notices.notify(
          Notice::error(format!("{key} is already used by record {existing}"))
            .on_field(key_field),
        );
        Err(Error::UniquenessConflict { key, existing })
      }
      Verdict::Unknown { reason } => match self.config.unknown_uniqueness {
        UnknownPolicy::Block => {
          draft.transition(DraftState::Failed);
          self.notices.notify(
            Notice::error(format!("Could not confirm {key} is unused. Try again."))
              .on_field(key_field),
          );
          Err(Error::Unreachable(reason))
        }
        UnknownPolicy::Allow => {
          tracing::warn!(key = %key, reason = %reason, "saving without confirming key uniqueness");
          Ok(Some(claim))
        }
      },
    }
  }

  // ── Existing records ──────────────────────────────────────────────────

  pub async fn fetch(&self, id: &RecordId) -> Result<PersistedRecord> {
    self
      .store
      .get(id)
      .await
      .map_err(|e| Error::Store(Box::new(e)))?
      .ok_or_else(|| Error::RecordNotFound(id.clone()))
  }

  pub async fn list(&self, form: &str) -> Result<Vec<PersistedRecord>> {
    let form = self.form(form)?;
    self
      .store
      .list(&form.name)
      .await
      .map_err(|e| Error::Store(Box::new(e)))
  }

  /// Derive a renewal draft from `source` with a new date span.
  pub fn renew(
    &self,
    source: &PersistedRecord,
    new_start: &str,
    new_duration: i64,
    overrides: &FieldMap,
  ) -> Result<RenewalDraft> {
    let form = self.form(&source.form)?;
    let dates = form
      .dates
      .as_ref()
      .ok_or_else(|| Error::NotRenewable(form.name.clone()))?;
    renewal::renew(source, form, dates, new_start, new_duration, overrides)
      .map_err(Error::ValidationFailed)
  }

  /// Fetch record `id`, renew it, and park the new draft in `section`.
  pub async fn renew_record(
    &self,
    id: &RecordId,
    section: SectionKey,
    new_start: &str,
    new_duration: i64,
    overrides: &FieldMap,
  ) -> Result<RestoredSection> {
    let source = self.fetch(id).await?;
    let renewal = self.renew(&source, new_start, new_duration, overrides)?;
    tracing::info!(source = %renewal.source_id, draft = %renewal.draft.id(), "renewal drafted");
    self.park(section, renewal.into_draft())
  }

  /// Open record `id` for editing in `section`.
  pub async fn open_for_edit(&self, id: &RecordId, section: SectionKey) -> Result<RestoredSection> {
    let record = self.fetch(id).await?;
    self.park(section, RecordDraft::from_persisted(&record))
  }

  fn park(&self, section: SectionKey, draft: RecordDraft) -> Result<RestoredSection> {
    let validation = self.form(draft.form())?.evaluate(&draft);
    self.sections.save(section, draft.clone());
    Ok(RestoredSection { draft, validation })
  }

  /// Enter `section`, restoring its draft or starting a blank one of `form`.
  pub fn enter_section(
    &self,
    section: SectionKey,
    form: &str,
    discriminator: Option<&str>,
  ) -> Result<RestoredSection> {
    self
      .sections
      .enter(section, &self.forms, || self.blank_draft(form, discriminator))
  }

  /// Move record `id` from active to completed or cancelled.
  pub async fn set_status(&self, id: &RecordId, status: RecordStatus) -> Result<PersistedRecord> {
    let record = self.fetch(id).await?;
    if !record.status.can_transition_to(status) {
      return Err(Error::InvalidStatusTransition {
        id:   id.clone(),
        from: record.status,
        to:   status,
      });
    }
    let update = RecordUpdate { status: Some(status), ..Default::default() };
    let updated = self
      .store
      .update(id, update)
      .await
      .map_err(|e| Error::PersistenceFailed(Box::new(e)))?;
    tracing::info!(id = %id, %status, "record status changed");
    self.notices.notify(Notice::info(format!("Record {id} is now {status}")));
    Ok(updated)
  }
}

/// Seed the discriminator's defaults and scheduled date into blank fields.
fn apply_defaults(draft: &mut RecordDraft, form: &Form) {
  let Some(spec) = draft.discriminator().and_then(|d| form.discriminator(d.as_str())) else {
    return;
  };
  for (field, value) in &spec.defaults {
    draft.seed(field, value.clone());
  }
  if let Some(schedule) = &spec.schedule
    && let Some(date) = next_allowed_date(Local::now().date_naive(), &schedule.weekdays)
  {
    draft.seed(&schedule.field, date);
  }
  if let Some(dates) = &form.dates {
    derive_dates(draft, dates);
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::atomic::Ordering, time::Duration};

  use chrono::Datelike;
  use clinic_core::{
    forms::{DIET_REQUEST, INVESTIGATION_REQUEST, PATIENT_REGISTRATION},
    record::FieldValue,
    rules::InvalidReason,
    store::NoticeLevel,
  };

  use super::*;
  use crate::testing::{MemoryStore, RecordingSink};

  struct Harness {
    store:   Arc<MemoryStore>,
    sink:    Arc<RecordingSink>,
    manager: RecordLifecycleManager<MemoryStore, MemoryStore>,
  }

  fn harness_with(config: EngineConfig) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let sink = Arc::new(RecordingSink::default());
    let manager = RecordLifecycleManager::new(
      Arc::clone(&store),
      Arc::clone(&store),
      FormRegistry::builtin(),
      sink.clone(),
      config,
    );
    Harness { store, sink, manager }
  }

  fn harness() -> Harness { harness_with(EngineConfig::default()) }

  async fn registration(h: &Harness) -> RecordDraft {
    let mut draft = h
      .manager
      .create_draft(PATIENT_REGISTRATION, Some("new"))
      .await
      .unwrap();
    for (field, value) in [("name", "Asha"), ("gender", "female"), ("phone", "0712345678")] {
      h.manager.edit(&mut draft, field, value).unwrap();
    }
    h.manager.edit(&mut draft, "age", 34).unwrap();
    draft
  }

  fn diet(h: &Harness) -> RecordDraft {
    let mut draft = h.manager.blank_draft(DIET_REQUEST, Some("general")).unwrap();
    h.manager.edit(&mut draft, "patient_id", "PT-000001").unwrap();
    h.manager.edit(&mut draft, "diet", "soft").unwrap();
    h.manager.edit(&mut draft, "start_date", "2024-01-02").unwrap();
    h.manager.edit(&mut draft, "duration", 7).unwrap();
    draft
  }

  fn registered_fields(key: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert("patient_id".into(), key.into());
    fields.insert("name".into(), "Ravi".into());
    fields.insert("age".into(), 52.into());
    fields.insert("gender".into(), "male".into());
    fields.insert("phone".into(), "0700000000".into());
    fields.insert("previous_hospital".into(), "General".into());
    fields
  }

  fn transfer(h: &Harness, key: &str) -> RecordDraft {
    let mut draft = h.manager.blank_draft(PATIENT_REGISTRATION, Some("transfer")).unwrap();
    for (field, value) in registered_fields(key) {
      h.manager.edit(&mut draft, &field, value).unwrap();
    }
    draft
  }

  // ── Drafts ────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn new_patients_get_a_generated_key() {
    let h = harness();
    let draft = h.manager.create_draft(PATIENT_REGISTRATION, Some("new")).await.unwrap();
    assert_eq!(draft.get("patient_id"), Some(&FieldValue::from("PT-000001")));
    assert!(!draft.touched());
    assert_eq!(draft.state(), DraftState::Draft);

    let transfer = h
      .manager
      .create_draft(PATIENT_REGISTRATION, Some("transfer"))
      .await
      .unwrap();
    assert!(transfer.get("patient_id").is_none());
  }

  #[tokio::test]
  async fn sequence_outage_is_reported_and_retryable() {
    let h = harness();
    h.store.fail_sequence.store(true, Ordering::SeqCst);
    let err = h
      .manager
      .create_draft(PATIENT_REGISTRATION, Some("new"))
      .await
      .unwrap_err();
    assert!(matches!(err, Error::SequenceUnavailable { .. }));
    assert!(h.sink.notices().iter().any(|n| {
      n.level == NoticeLevel::Error && n.field.as_deref() == Some("patient_id")
    }));

    h.store.fail_sequence.store(false, Ordering::SeqCst);
    let mut draft = h.manager.blank_draft(PATIENT_REGISTRATION, Some("new")).unwrap();
    let key = h.manager.reserve_key(&mut draft).await.unwrap();
    assert_eq!(key.as_deref(), Some("PT-000001"));
    assert_eq!(h.manager.reserve_key(&mut draft).await.unwrap(), None);
  }

  #[test]
  fn blanking_the_discriminator_reports_it_missing() {
    let h = harness();
    let mut draft = diet(&h);
    let result = h.manager.edit(&mut draft, "diet_type", " ").unwrap();
    assert!(draft.discriminator().is_none());
    assert_eq!(result.reason("diet_type"), Some(&InvalidReason::Missing));
  }

  #[tokio::test]
  async fn switching_to_a_generated_discriminator_reserves_a_key() {
    let h = harness();
    let mut draft = h.manager.blank_draft(PATIENT_REGISTRATION, Some("transfer")).unwrap();

    h.manager.edit(&mut draft, "registration_type", "new").unwrap();
    assert!(draft.value("patient_id").is_none());
    h.manager.edit(&mut draft, "registration_type", "transfer").unwrap();

    h.manager.switch_discriminator(&mut draft, "new").await.unwrap();
    assert_eq!(draft.get("patient_id"), Some(&FieldValue::from("PT-000001")));

    // A manual key policy leaves the key alone.
    let mut manual = h.manager.blank_draft(PATIENT_REGISTRATION, Some("new")).unwrap();
    h.manager.switch_discriminator(&mut manual, "transfer").await.unwrap();
    assert!(manual.value("patient_id").is_none());
  }

  #[test]
  fn unknown_discriminator_on_blank_draft_is_an_error() {
    let h = harness();
    let err = h.manager.blank_draft(DIET_REQUEST, Some("keto")).unwrap_err();
    assert!(matches!(
      err,
      Error::Core(clinic_core::Error::UnknownDiscriminator { .. })
    ));
  }

  #[test]
  fn scheduled_date_defaults_to_next_allowed_weekday() {
    let h = harness();
    let draft = h.manager.blank_draft(INVESTIGATION_REQUEST, Some("ultrasound")).unwrap();
    let date = draft.get("appointment_date").and_then(FieldValue::as_date).unwrap();
    let today = Local::now().date_naive();
    assert!(matches!(date.weekday(), chrono::Weekday::Tue | chrono::Weekday::Thu));
    assert!(date >= today && date < today + chrono::Days::new(7));
  }

  #[test]
  fn editing_dates_recomputes_end_date() {
    let h = harness();
    let mut draft = diet(&h);
    assert_eq!(draft.get("meals_per_day"), Some(&FieldValue::from(3)));
    assert_eq!(draft.get("end_date"), Some(&FieldValue::from("2024-01-08")));

    let result = h.manager.edit(&mut draft, "duration", 0).unwrap();
    assert!(draft.get("end_date").is_none());
    assert_eq!(
      result.reason("duration"),
      Some(&InvalidReason::BelowMinimum { min: 1 })
    );
  }

  #[test]
  fn switching_discriminator_keeps_entered_values() {
    let h = harness();
    let mut draft = diet(&h);

    let result = h.manager.set_discriminator(&mut draft, "therapeutic").unwrap();
    assert!(result.is_required("condition"));
    assert_eq!(draft.get("diet"), Some(&FieldValue::from("soft")));
    assert_eq!(draft.get("meals_per_day"), Some(&FieldValue::from(3)));

    let result = h.manager.set_discriminator(&mut draft, "general").unwrap();
    assert!(!result.is_required("condition"));
    assert!(result.is_valid, "{result}");
  }

  // ── Submit ────────────────────────────────────────────────────────────

  #[tokio::test]
  async fn valid_draft_is_persisted_once() {
    let h = harness();
    let mut draft = registration(&h).await;

    let record = h.manager.submit(&mut draft).await.unwrap();
    assert_eq!(record.status, RecordStatus::Active);
    assert_eq!(record.fields.get("patient_id"), Some(&FieldValue::from("PT-000001")));
    assert_eq!(draft.state(), DraftState::Persisted);
    assert!(h.sink.notices().iter().any(|n| n.level == NoticeLevel::Success));

    assert!(matches!(
      h.manager.submit(&mut draft).await,
      Err(Error::AlreadyPersisted(_))
    ));
    assert!(h.manager.edit(&mut draft, "name", "Asha K").is_err());
    assert_eq!(h.store.records().len(), 1);
  }

  #[tokio::test]
  async fn invalid_draft_is_rejected_until_edited() {
    let h = harness();
    let mut draft = h.manager.blank_draft(DIET_REQUEST, Some("therapeutic")).unwrap();

    let Err(Error::ValidationFailed(result)) = h.manager.submit(&mut draft).await else {
      panic!("expected validation failure");
    };
    assert_eq!(result.reason("condition"), Some(&InvalidReason::Missing));
    assert_eq!(draft.state(), DraftState::Rejected);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);

    h.manager.edit(&mut draft, "condition", "diabetes").unwrap();
    assert_eq!(draft.state(), DraftState::Draft);
  }

  #[tokio::test]
  async fn duplicate_key_is_rejected() {
    let h = harness();
    h.store.insert(PATIENT_REGISTRATION, Some("transfer"), registered_fields("PT-000001"));

    let mut draft = registration(&h).await;
    assert_eq!(draft.get("patient_id"), Some(&FieldValue::from("PT-000001")));

    let err = h.manager.submit(&mut draft).await.unwrap_err();
    assert!(matches!(
      err,
      Error::UniquenessConflict { ref existing, .. } if existing.as_str() == "1"
    ));
    assert_eq!(draft.state(), DraftState::Rejected);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn unknown_uniqueness_blocks_by_default() {
    let h = harness();
    let mut draft = registration(&h).await;
    h.store.fail_fetch.store(true, Ordering::SeqCst);

    let err = h.manager.submit(&mut draft).await.unwrap_err();
    assert!(matches!(err, Error::Unreachable(_)));
    assert_eq!(draft.state(), DraftState::Failed);
    assert_eq!(h.store.creates.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn unknown_uniqueness_can_be_allowed() {
    let h = harness_with(EngineConfig {
      unknown_uniqueness: UnknownPolicy::Allow,
      ..Default::default()
    });
    let mut draft = registration(&h).await;
    h.store.fail_fetch.store(true, Ordering::SeqCst);

    h.manager.submit(&mut draft).await.unwrap();
    assert_eq!(draft.state(), DraftState::Persisted);
  }

  #[tokio::test]
  async fn store_failure_marks_draft_failed() {
    let h = harness();
    let mut draft = diet(&h);
    h.store.fail_write.store(true, Ordering::SeqCst);

    let err = h.manager.submit(&mut draft).await.unwrap_err();
    assert!(matches!(err, Error::PersistenceFailed(_)));
    assert_eq!(draft.state(), DraftState::Failed);

    h.store.fail_write.store(false, Ordering::SeqCst);
    h.manager.submit(&mut draft).await.unwrap();
    assert_eq!(h.store.records().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_submits_of_one_draft_persist_once() {
    let h = harness();
    h.store.delay_creates(Duration::from_millis(100));
    let mut first = diet(&h);
    let mut second = first.clone();

    let (a, b) = tokio::join!(h.manager.submit(&mut first), h.manager.submit(&mut second));

    assert!(a.is_ok());
    assert!(matches!(b, Err(Error::SubmitInFlight(_))));
    assert_eq!(second.state(), DraftState::Draft);
    assert_eq!(h.store.records().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn concurrent_submits_with_the_same_key_persist_once() {
    let h = harness();
    h.store.delay_creates(Duration::from_millis(100));
    let mut first = transfer(&h, "PT-000500");
    let mut second = transfer(&h, " pt-000500");

    let (a, b) = tokio::join!(h.manager.submit(&mut first), h.manager.submit(&mut second));

    assert!(a.is_ok());
    assert!(matches!(b, Err(Error::KeyClaimed { .. })));
    assert_eq!(second.state(), DraftState::Rejected);
    assert_eq!(h.store.records().len(), 1);

    // Once saved, the key conflicts with the stored record instead.
    h.manager.edit(&mut second, "name", "Ravi S").unwrap();
    let err = h.manager.submit(&mut second).await.unwrap_err();
    assert!(matches!(err, Error::UniquenessConflict { .. }));
  }

  #[tokio::test(start_paused = true)]
  async fn different_keys_submit_concurrently() {
    let h = harness();
    h.store.delay_creates(Duration::from_millis(100));
    let mut first = transfer(&h, "PT-000500");
    let mut second = transfer(&h, "PT-000501");

    let (a, b) = tokio::join!(h.manager.submit(&mut first), h.manager.submit(&mut second));
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(h.store.records().len(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn dropped_submit_releases_the_draft() {
    let h = harness();
    h.store.delay_creates(Duration::from_millis(100));
    let mut draft = diet(&h);

    let abandoned =
      tokio::time::timeout(Duration::from_millis(10), h.manager.submit(&mut draft)).await;
    assert!(abandoned.is_err());

    h.manager.submit(&mut draft).await.unwrap();
    assert_eq!(h.store.records().len(), 1);
  }

  #[tokio::test]
  async fn submit_clears_the_section_holding_the_draft() {
    let h = harness();
    let entered = h
      .manager
      .enter_section("diet".into(), DIET_REQUEST, Some("general"))
      .unwrap();
    let mut draft = entered.draft;
    for (field, value) in [("patient_id", "PT-1"), ("diet", "soft"), ("start_date", "2024-03-01")] {
      h.manager.edit(&mut draft, field, value).unwrap();
    }
    h.manager.edit(&mut draft, "duration", 2).unwrap();
    h.manager.sections().save("diet".into(), draft.clone());

    h.manager.submit(&mut draft).await.unwrap();
    assert!(h.manager.sections().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn submit_forgets_the_drafts_key_check() {
    let h = harness();
    let mut draft = registration(&h).await;
    h.manager.check_key(&draft).unwrap().unwrap().await.unwrap();
    assert_eq!(h.manager.validator().tracked_fields(), 1);

    h.manager.submit(&mut draft).await.unwrap();
    assert_eq!(h.manager.validator().tracked_fields(), 0);
    assert!(h.manager.key_status(&draft).is_none());
  }

  // ── Uniqueness while typing ───────────────────────────────────────────

  #[tokio::test(start_paused = true)]
  async fn key_check_reports_conflicts_while_typing() {
    let h = harness();
    h.store.insert(PATIENT_REGISTRATION, Some("transfer"), registered_fields("PT-000777"));
    let mut draft = registration(&h).await;

    h.manager.edit(&mut draft, "patient_id", "PT-000777").unwrap();
    let check = h.manager.check_key(&draft).unwrap().unwrap().await.unwrap();
    assert_eq!(check.verdict, Verdict::Conflict { existing: "1".into() });
    assert_eq!(h.manager.key_status(&draft), Some(check));

    h.manager.edit(&mut draft, "patient_id", "").unwrap();
    assert!(h.manager.check_key(&draft).unwrap().is_none());
    assert!(h.manager.key_status(&draft).is_none());
  }

  // ── Existing records ──────────────────────────────────────────────────

  #[tokio::test]
  async fn edit_updates_the_record_in_place() {
    let h = harness();
    let existing =
      h.store.insert(PATIENT_REGISTRATION, Some("transfer"), registered_fields("PT-000042"));

    let opened = h.manager.open_for_edit(&existing.id, "edit".into()).await.unwrap();
    assert!(opened.validation.is_valid, "{}", opened.validation);
    let mut draft = opened.draft;
    assert_eq!(draft.editing(), Some(&existing.id));

    h.manager.edit(&mut draft, "phone", "0799999999").unwrap();
    let updated = h.manager.submit(&mut draft).await.unwrap();

    assert_eq!(updated.id, existing.id);
    assert_eq!(updated.fields.get("phone"), Some(&FieldValue::from("0799999999")));
    assert_eq!(h.store.records().len(), 1);
  }

  #[tokio::test]
  async fn renewal_creates_a_new_active_record() {
    let h = harness();
    let mut fields = FieldMap::new();
    fields.insert("patient_id".into(), "P1".into());
    fields.insert("diet".into(), "low salt".into());
    fields.insert("meals_per_day".into(), 5.into());
    fields.insert("condition".into(), "hypertension".into());
    fields.insert("start_date".into(), "2024-01-02".into());
    fields.insert("duration".into(), 7.into());
    fields.insert("end_date".into(), "2024-01-08".into());
    let source = h.store.insert(DIET_REQUEST, Some("therapeutic"), fields);
    h.manager.set_status(&source.id, RecordStatus::Completed).await.unwrap();

    let restored = h
      .manager
      .renew_record(&source.id, "renew".into(), "2024-02-01", 5, &FieldMap::new())
      .await
      .unwrap();
    assert!(restored.validation.is_valid, "{}", restored.validation);
    assert_eq!(h.manager.sections().len(), 1);

    let mut draft = restored.draft;
    let renewed = h.manager.submit(&mut draft).await.unwrap();
    assert_ne!(renewed.id, source.id);
    assert_eq!(renewed.status, RecordStatus::Active);
    assert_eq!(renewed.fields.get("end_date"), Some(&FieldValue::from("2024-02-05")));
    assert_eq!(renewed.fields.get("condition"), Some(&FieldValue::from("hypertension")));
    assert!(h.manager.sections().is_empty());

    let original = h.manager.fetch(&source.id).await.unwrap();
    assert_eq!(original.status, RecordStatus::Completed);
    assert_eq!(original.fields.get("end_date"), Some(&FieldValue::from("2024-01-08")));
  }

  #[tokio::test]
  async fn forms_without_dates_cannot_be_renewed() {
    let h = harness();
    let source =
      h.store.insert(PATIENT_REGISTRATION, Some("transfer"), registered_fields("PT-000001"));
    let err = h
      .manager
      .renew_record(&source.id, "renew".into(), "2024-02-01", 5, &FieldMap::new())
      .await
      .unwrap_err();
    assert!(matches!(err, Error::NotRenewable(_)));
  }

  #[tokio::test]
  async fn missing_record_is_not_found() {
    let h = harness();
    let err = h.manager.open_for_edit(&"99".into(), "edit".into()).await.unwrap_err();
    assert!(matches!(err, Error::RecordNotFound(_)));
  }

  #[tokio::test]
  async fn status_only_leaves_active() {
    let h = harness();
    let record = h.store.insert(DIET_REQUEST, Some("general"), FieldMap::new());

    let done = h.manager.set_status(&record.id, RecordStatus::Cancelled).await.unwrap();
    assert_eq!(done.status, RecordStatus::Cancelled);

    let err = h
      .manager
      .set_status(&record.id, RecordStatus::Completed)
      .await
      .unwrap_err();
    assert!(matches!(err, Error::InvalidStatusTransition { .. }));
  }

  #[tokio::test]
  async fn list_is_scoped_to_a_known_form() {
    let h = harness();
    h.store.insert(DIET_REQUEST, Some("general"), FieldMap::new());
    h.store.insert(PATIENT_REGISTRATION, Some("new"), registered_fields("PT-1"));

    assert_eq!(h.manager.list(DIET_REQUEST).await.unwrap().len(), 1);
    assert!(h.manager.list("x_ray").await.is_err());
  }
}
