//! A [`NotificationSink`] that forwards notices to `tracing`.

use clinic_core::store::{Notice, NoticeLevel, NotificationSink};

/// Logs every notice. Useful when no UI is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
  fn notify(&self, notice: Notice) {
    let field = notice.field.as_deref().unwrap_or("-");
    match notice.level {
      NoticeLevel::Success | NoticeLevel::Info => {
        tracing::info!(field, "{}", notice.message)
      }
      NoticeLevel::Error => tracing::warn!(field, "{}", notice.message),
    }
  }
}
