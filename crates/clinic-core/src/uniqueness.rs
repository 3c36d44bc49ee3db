//! Business-key uniqueness against a snapshot of external records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::record::RecordId;

/// Which records a business key must be unique among: one form's key field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyDomain {
  pub form:      String,
  pub key_field: String,
}

impl KeyDomain {
  pub fn new(form: impl Into<String>, key_field: impl Into<String>) -> Self {
    Self { form: form.into(), key_field: key_field.into() }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
  pub id:  RecordId,
  pub key: String,
}

/// An immutable, timestamped copy of the keys in a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRecordSnapshot {
  pub domain:     KeyDomain,
  pub fetched_at: DateTime<Utc>,
  pub entries:    Vec<KeyEntry>,
}

impl ExternalRecordSnapshot {
  pub fn new(domain: KeyDomain, entries: Vec<KeyEntry>) -> Self {
    Self { domain, fetched_at: Utc::now(), entries }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration { now - self.fetched_at }

  pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    self.age(now) > max_age
  }
}

/// Outcome of a uniqueness check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
  Unique,
  Conflict { existing: RecordId },
  /// No snapshot could be obtained; the caller decides whether to block.
  Unknown { reason: String },
}

impl Verdict {
  /// `Some(true)` for unique, `Some(false)` for a conflict, `None` if unknown.
  pub fn is_valid(&self) -> Option<bool> {
    match self {
      Self::Unique => Some(true),
      Self::Conflict { .. } => Some(false),
      Self::Unknown { .. } => None,
    }
  }
}

pub fn normalize_key(key: &str) -> String { key.trim().to_lowercase() }

/// Check `candidate` against `snapshot`, case-insensitively and ignoring
/// surrounding whitespace.
///
/// `exclude` skips one record by identity, so a record being edited never
/// conflicts with its own key. A blank candidate never conflicts.
pub fn check_unique(
  candidate: &str,
  snapshot: &ExternalRecordSnapshot,
  exclude: Option<&RecordId>,
) -> Verdict {
  let wanted = normalize_key(candidate);
  if wanted.is_empty() {
    return Verdict::Unique;
  }
  snapshot
    .entries
    .iter()
    .filter(|e| Some(&e.id) != exclude)
    .find(|e| normalize_key(&e.key) == wanted)
    .map_or(Verdict::Unique, |e| Verdict::Conflict { existing: e.id.clone() })
}
