//! Observer hook for newly discovered groups.
//!
//! The sync engine announces creations through this trait; delivery
//! (mail, chat, whatever) belongs to whoever implements it.

use crate::db::GroupRecord;

pub trait Notifier: Send + Sync {
  /// A group appeared in the directory that we had never seen before.
  fn group_created(&self, group: &GroupRecord);
}

/// Default notifier: a structured log line.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn group_created(&self, group: &GroupRecord) {
    tracing::info!(group = %group.describe(), "New mailing list created");
  }
}
