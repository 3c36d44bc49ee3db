//! In-memory collaborators for engine tests.

use std::{
  collections::{HashMap, VecDeque},
  sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, AtomicUsize, Ordering},
  },
  time::Duration,
};

use chrono::Utc;
use clinic_core::{
  record::{
    Discriminator, FieldMap, NewRecord, PersistedRecord, RecordId, RecordUpdate, merge_fields,
  },
  store::{Notice, NotificationSink, RecordStore, SequenceGenerator},
  uniqueness::{ExternalRecordSnapshot, KeyDomain, KeyEntry},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
  #[error("store offline")]
  Offline,
  #[error("record {0} not found")]
  NotFound(RecordId),
}

/// A record store and sequence generator backed by a `Vec`.
///
/// Failure flags and per-call delays let tests stage outages and slow
/// responses.
#[derive(Debug, Default)]
pub struct MemoryStore {
  records:           Mutex<Vec<PersistedRecord>>,
  sequences:         Mutex<HashMap<String, u64>>,
  fetch_delays:      Mutex<VecDeque<Duration>>,
  create_delay:      Mutex<Option<Duration>>,
  pub fail_fetch:    AtomicBool,
  pub fail_write:    AtomicBool,
  pub fail_sequence: AtomicBool,
  pub fetches:       AtomicUsize,
  pub creates:       AtomicUsize,
}

impl MemoryStore {
  /// Insert a record directly, bypassing the engine.
  pub fn insert(
    &self,
    form: &str,
    discriminator: Option<&str>,
    fields: FieldMap,
  ) -> PersistedRecord {
    let mut records = self.records.lock().unwrap();
    let record = PersistedRecord {
      id: RecordId::new((records.len() + 1).to_string()),
      form: form.to_owned(),
      discriminator: discriminator.map(Discriminator::new),
      status: Default::default(),
      fields,
      created_at: Utc::now(),
      updated_at: Utc::now(),
    };
    records.push(record.clone());
    record
  }

  /// Delay successive `fetch_keys` calls by these amounts, in order.
  pub fn delay_fetches(&self, delays: impl IntoIterator<Item = Duration>) {
    self.fetch_delays.lock().unwrap().extend(delays);
  }

  pub fn delay_creates(&self, delay: Duration) {
    *self.create_delay.lock().unwrap() = Some(delay);
  }

  pub fn records(&self) -> Vec<PersistedRecord> { self.records.lock().unwrap().clone() }

  fn offline(flag: &AtomicBool) -> Result<(), MemoryError> {
    if flag.load(Ordering::SeqCst) {
      return Err(MemoryError::Offline);
    }
    Ok(())
  }
}

impl RecordStore for MemoryStore {
  type Error = MemoryError;

  async fn fetch_keys(
    &self,
    domain: &KeyDomain,
  ) -> Result<ExternalRecordSnapshot, MemoryError> {
    self.fetches.fetch_add(1, Ordering::SeqCst);
    let delay = self.fetch_delays.lock().unwrap().pop_front();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    Self::offline(&self.fail_fetch)?;
    let entries = self
      .records
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.form == domain.form)
      .filter_map(|r| {
        let key = r.fields.get(&domain.key_field).filter(|v| !v.is_blank())?;
        Some(KeyEntry { id: r.id.clone(), key: key.to_string() })
      })
      .collect();
    Ok(ExternalRecordSnapshot::new(domain.clone(), entries))
  }

  async fn create(&self, record: NewRecord) -> Result<PersistedRecord, MemoryError> {
    self.creates.fetch_add(1, Ordering::SeqCst);
    let delay = *self.create_delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    Self::offline(&self.fail_write)?;
    let mut saved = self.insert(
      &record.form,
      record.discriminator.as_ref().map(Discriminator::as_str),
      record.fields,
    );
    saved.status = record.status;
    Ok(saved)
  }

  async fn update(
    &self,
    id: &RecordId,
    update: RecordUpdate,
  ) -> Result<PersistedRecord, MemoryError> {
    Self::offline(&self.fail_write)?;
    let mut records = self.records.lock().unwrap();
    let record = records
      .iter_mut()
      .find(|r| &r.id == id)
      .ok_or_else(|| MemoryError::NotFound(id.clone()))?;
    merge_fields(&mut record.fields, update.fields);
    if let Some(d) = update.discriminator {
      record.discriminator = Some(d);
    }
    if let Some(status) = update.status {
      record.status = status;
    }
    record.updated_at = Utc::now();
    Ok(record.clone())
  }

  async fn get(&self, id: &RecordId) -> Result<Option<PersistedRecord>, MemoryError> {
    Self::offline(&self.fail_fetch)?;
    Ok(self.records.lock().unwrap().iter().find(|r| &r.id == id).cloned())
  }

  async fn list(&self, form: &str) -> Result<Vec<PersistedRecord>, MemoryError> {
    Self::offline(&self.fail_fetch)?;
    Ok(
      self
        .records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.form == form)
        .cloned()
        .collect(),
    )
  }
}

impl SequenceGenerator for MemoryStore {
  type Error = MemoryError;

  async fn next(&self, sequence: &str) -> Result<String, MemoryError> {
    Self::offline(&self.fail_sequence)?;
    let mut sequences = self.sequences.lock().unwrap();
    let n = sequences.entry(sequence.to_owned()).or_default();
    *n += 1;
    Ok(format!("{sequence}-{n:06}"))
  }
}

/// Collects notices for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink(Mutex<Vec<Notice>>);

impl RecordingSink {
  pub fn notices(&self) -> Vec<Notice> {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
  }
}

impl NotificationSink for RecordingSink {
  fn notify(&self, notice: Notice) {
    self.0.lock().unwrap_or_else(PoisonError::into_inner).push(notice);
  }
}
