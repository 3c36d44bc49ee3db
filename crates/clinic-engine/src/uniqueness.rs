//! Debounced, cancellable business-key checks against a cached snapshot.
//!
//! Every call to [`UniquenessValidator::check`] takes a ticket for its field
//! before it suspends. Only the holder of the newest ticket may publish a
//! result, so a slow response for an old value can never overwrite the
//! verdict for a newer one.

use std::{
  collections::HashMap,
  future::Future,
  sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock,
    atomic::{AtomicU64, Ordering},
  },
};

use chrono::{DateTime, Utc};
use clinic_core::{
  record::RecordId,
  store::RecordStore,
  uniqueness::{ExternalRecordSnapshot, KeyDomain, Verdict, check_unique},
};

use crate::config::EngineConfig;

/// A published uniqueness result for one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCheck {
  pub candidate:   String,
  pub verdict:     Verdict,
  /// When the snapshot the verdict was computed from was fetched.
  pub snapshot_at: Option<DateTime<Utc>>,
  /// The snapshot was past its max age and could not be refreshed.
  pub stale:       bool,
}

#[derive(Debug, Default)]
struct FieldSlot {
  issued:  u64,
  applied: Option<KeyCheck>,
}

pub struct UniquenessValidator<S> {
  store:     Arc<S>,
  config:    EngineConfig,
  snapshots: RwLock<HashMap<KeyDomain, Arc<ExternalRecordSnapshot>>>,
  fields:    Mutex<HashMap<String, FieldSlot>>,
  /// Tickets are unique across fields, so a forgotten slot can be recreated
  /// without an old ticket matching the new one.
  tickets:   AtomicU64,
}

impl<S: RecordStore> UniquenessValidator<S> {
  pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
    Self {
      store,
      config,
      snapshots: RwLock::default(),
      fields: Mutex::default(),
      tickets: AtomicU64::new(0),
    }
  }

  // ─── Tickets ────────────────────────────────────────────────────────────

  fn fields(&self) -> MutexGuard<'_, HashMap<String, FieldSlot>> {
    self.fields.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn next_ticket(&self) -> u64 { self.tickets.fetch_add(1, Ordering::Relaxed) + 1 }

  fn issue(&self, field: &str) -> u64 {
    let ticket = self.next_ticket();
    self.fields().entry(field.to_owned()).or_default().issued = ticket;
    ticket
  }

  fn is_current(&self, field: &str, ticket: u64) -> bool {
    self.fields().get(field).is_some_and(|s| s.issued == ticket)
  }

  /// Publish `check` if `ticket` is still the newest for `field`.
  fn apply(&self, field: &str, ticket: u64, check: KeyCheck) -> Option<KeyCheck> {
    let mut fields = self.fields();
    let slot = fields.get_mut(field).filter(|s| s.issued == ticket)?;
    slot.applied = Some(check.clone());
    Some(check)
  }

  /// Supersede any pending check for `field` and forget its last result.
  pub fn cancel(&self, field: &str) {
    let ticket = self.next_ticket();
    let mut fields = self.fields();
    let slot = fields.entry(field.to_owned()).or_default();
    slot.issued = ticket;
    slot.applied = None;
  }

  /// Drop all state for `field`. A check still pending for it is discarded.
  pub fn forget(&self, field: &str) { self.fields().remove(field); }

  /// Number of fields with a pending or published check.
  pub fn tracked_fields(&self) -> usize { self.fields().len() }

  /// The most recently published result for `field`.
  pub fn latest(&self, field: &str) -> Option<KeyCheck> {
    self.fields().get(field).and_then(|s| s.applied.clone())
  }

  // ─── Checks ─────────────────────────────────────────────────────────────

  /// Check `candidate` after the debounce period.
  ///
  /// The ticket is taken when this is called, not when the future is first
  /// polled. Resolves to `None` when a newer check or a cancel for the same
  /// field arrived in the meantime; the result is then discarded.
  pub fn check<'a>(
    &'a self,
    field: &str,
    domain: KeyDomain,
    candidate: &str,
    exclude: Option<RecordId>,
  ) -> impl Future<Output = Option<KeyCheck>> + Send + use<'a, S> {
    let field = field.to_owned();
    let candidate = candidate.to_owned();
    let ticket = self.issue(&field);

    async move {
      tokio::time::sleep(self.config.debounce()).await;
      if !self.is_current(&field, ticket) {
        tracing::debug!(field = %field, ticket, "key check superseded before fetch");
        return None;
      }

      let check = match self.snapshot(&domain, false).await {
        Ok((snapshot, stale)) => KeyCheck {
          verdict: check_unique(&candidate, &snapshot, exclude.as_ref()),
          snapshot_at: Some(snapshot.fetched_at),
          stale,
          candidate,
        },
        Err(reason) => KeyCheck {
          candidate,
          verdict: Verdict::Unknown { reason },
          snapshot_at: None,
          stale: false,
        },
      };

      let applied = self.apply(&field, ticket, check);
      if applied.is_none() {
        tracing::debug!(field = %field, ticket, "discarding out-of-date key check");
      }
      applied
    }
  }

  /// Check `candidate` immediately against a freshly fetched snapshot.
  ///
  /// Used at submit time: a cached copy is never trusted, and a failed fetch
  /// yields [`Verdict::Unknown`].
  pub async fn check_now(
    &self,
    domain: &KeyDomain,
    candidate: &str,
    exclude: Option<&RecordId>,
  ) -> KeyCheck {
    match self.snapshot(domain, true).await {
      Ok((snapshot, _)) => KeyCheck {
        candidate:   candidate.to_owned(),
        verdict:     check_unique(candidate, &snapshot, exclude),
        snapshot_at: Some(snapshot.fetched_at),
        stale:       false,
      },
      Err(reason) => KeyCheck {
        candidate:   candidate.to_owned(),
        verdict:     Verdict::Unknown { reason },
        snapshot_at: None,
        stale:       false,
      },
    }
  }

  // ─── Snapshots ──────────────────────────────────────────────────────────

  fn cached(&self, domain: &KeyDomain) -> Option<Arc<ExternalRecordSnapshot>> {
    self
      .snapshots
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(domain)
      .cloned()
  }

  fn store_snapshot(&self, snapshot: Arc<ExternalRecordSnapshot>) {
    let mut snapshots = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
    let newer = snapshots
      .get(&snapshot.domain)
      .is_none_or(|current| current.fetched_at <= snapshot.fetched_at);
    if newer {
      snapshots.insert(snapshot.domain.clone(), snapshot);
    }
  }

  /// Drop the cached snapshot for `domain`, e.g. after a write to it.
  pub fn invalidate(&self, domain: &KeyDomain) {
    self
      .snapshots
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(domain);
  }

  /// A snapshot for `domain` and whether it is stale.
  ///
  /// A fresh cached copy is used unless `force` is set. When a refresh fails
  /// without `force`, an expired cached copy is returned flagged stale.
  async fn snapshot(
    &self,
    domain: &KeyDomain,
    force: bool,
  ) -> Result<(Arc<ExternalRecordSnapshot>, bool), String> {
    let cached = self.cached(domain);
    if !force
      && let Some(snapshot) = &cached
      && !snapshot.is_stale(Utc::now(), self.config.snapshot_max_age())
    {
      return Ok((Arc::clone(snapshot), false));
    }

    match self.store.fetch_keys(domain).await {
      Ok(fresh) => {
        tracing::debug!(
          form = %domain.form,
          keys = fresh.entries.len(),
          "key snapshot refreshed"
        );
        let fresh = Arc::new(fresh);
        self.store_snapshot(Arc::clone(&fresh));
        Ok((fresh, false))
      }
      Err(e) => {
        tracing::warn!(form = %domain.form, error = %e, "key snapshot refresh failed");
        match cached {
          Some(snapshot) if !force => Ok((snapshot, true)),
          _ => Err(e.to_string()),
        }
      }
    }
  }
}
