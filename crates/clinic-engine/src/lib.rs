//! Async orchestration for the clinic record engine.
//!
//! Wires the pure rules in `clinic-core` to a [`RecordStore`], a
//! [`SequenceGenerator`] and a [`NotificationSink`]: debounced uniqueness
//! checks, cached section state, and the draft submit lifecycle.
//!
//! [`RecordStore`]: clinic_core::store::RecordStore
//! [`SequenceGenerator`]: clinic_core::store::SequenceGenerator
//! [`NotificationSink`]: clinic_core::store::NotificationSink

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod notify;
pub mod section;
pub mod uniqueness;

#[cfg(test)]
mod testing;

pub use config::{EngineConfig, UnknownPolicy};
pub use error::{Error, Result};
pub use lifecycle::RecordLifecycleManager;
pub use section::{RestoredSection, SectionKey, SectionStateCache};
pub use uniqueness::{KeyCheck, UniquenessValidator};
