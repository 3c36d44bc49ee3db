//! In-memory draft state for form sections.
//!
//! A section is one form screen. Leaving a section saves its draft here;
//! returning restores the exact values and re-runs validation so required
//! markers and field errors are derived from the restored state, never
//! replayed from a stale copy.

use std::{
  collections::HashMap,
  fmt,
  sync::{PoisonError, RwLock},
};

use chrono::{DateTime, Utc};
use clinic_core::{
  forms::FormRegistry,
  record::{DraftId, RecordDraft},
  rules::ValidationResult,
};
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SectionKey(String);

impl SectionKey {
  pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for SectionKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for SectionKey {
  fn from(s: &str) -> Self { Self::new(s) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionStateEntry {
  pub section_key: SectionKey,
  pub draft:       RecordDraft,
  pub touched:     bool,
  pub saved_at:    DateTime<Utc>,
}

/// A draft handed back to a section along with its fresh validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoredSection {
  pub draft:      RecordDraft,
  pub validation: ValidationResult,
}

impl RestoredSection {
  /// Whether the user has edited the draft, i.e. whether errors should show.
  pub fn touched(&self) -> bool { self.draft.touched() }
}

#[derive(Debug, Default)]
pub struct SectionStateCache {
  entries: RwLock<HashMap<SectionKey, SectionStateEntry>>,
}

impl SectionStateCache {
  pub fn new() -> Self { Self::default() }

  /// Save `draft` as the state of `key`, replacing what was there.
  pub fn save(&self, key: SectionKey, draft: RecordDraft) {
    let entry = SectionStateEntry {
      section_key: key.clone(),
      touched: draft.touched(),
      draft,
      saved_at: Utc::now(),
    };
    self.write().insert(key, entry);
  }

  pub fn get(&self, key: &SectionKey) -> Option<SectionStateEntry> {
    self.read().get(key).cloned()
  }

  /// Restore the draft saved for `key` and validate it afresh.
  pub fn restore(
    &self,
    key: &SectionKey,
    forms: &FormRegistry,
  ) -> Result<Option<RestoredSection>> {
    let Some(entry) = self.get(key) else { return Ok(None) };
    let validation = forms.get(entry.draft.form())?.evaluate(&entry.draft);
    Ok(Some(RestoredSection { draft: entry.draft, validation }))
  }

  /// Restore `key`, or start it with the draft produced by `make`.
  pub fn enter(
    &self,
    key: SectionKey,
    forms: &FormRegistry,
    make: impl FnOnce() -> Result<RecordDraft>,
  ) -> Result<RestoredSection> {
    if let Some(restored) = self.restore(&key, forms)? {
      return Ok(restored);
    }
    let draft = make()?;
    let validation = forms.get(draft.form())?.evaluate(&draft);
    self.save(key, draft.clone());
    Ok(RestoredSection { draft, validation })
  }

  pub fn clear(&self, key: &SectionKey) -> Option<RecordDraft> {
    self.write().remove(key).map(|e| e.draft)
  }

  /// Remove every section holding draft `id`. Returns how many were removed.
  pub fn clear_draft(&self, id: DraftId) -> usize {
    let mut entries = self.write();
    let before = entries.len();
    entries.retain(|_, e| e.draft.id() != id);
    before - entries.len()
  }

  pub fn clear_all(&self) { self.write().clear(); }

  pub fn len(&self) -> usize { self.read().len() }

  pub fn is_empty(&self) -> bool { self.read().is_empty() }

  fn read(
    &self,
  ) -> std::sync::RwLockReadGuard<'_, HashMap<SectionKey, SectionStateEntry>> {
    self.entries.read().unwrap_or_else(PoisonError::into_inner)
  }

  fn write(
    &self,
  ) -> std::sync::RwLockWriteGuard<'_, HashMap<SectionKey, SectionStateEntry>> {
    self.entries.write().unwrap_or_else(PoisonError::into_inner)
  }
}
