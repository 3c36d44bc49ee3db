//! Engine tuning, deserialised from the `[engine]` table of the config file.

use std::time::Duration;

use serde::Deserialize;

/// What to do at submit when uniqueness cannot be determined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownPolicy {
  /// Refuse to persist.
  #[default]
  Block,
  /// Persist anyway and log a warning.
  Allow,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Quiet period before a key check hits the store.
  pub debounce_ms:           u64,
  /// A cached snapshot older than this is refreshed before use.
  pub snapshot_max_age_secs: u64,
  pub unknown_uniqueness:    UnknownPolicy,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      debounce_ms:           300,
      snapshot_max_age_secs: 60,
      unknown_uniqueness:    UnknownPolicy::Block,
    }
  }
}

impl EngineConfig {
  pub fn debounce(&self) -> Duration { Duration::from_millis(self.debounce_ms) }

  pub fn snapshot_max_age(&self) -> chrono::Duration {
    i64::try_from(self.snapshot_max_age_secs)
      .ok()
      .and_then(chrono::Duration::try_seconds)
      .unwrap_or(chrono::Duration::MAX)
  }
}
