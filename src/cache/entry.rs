//! Cache entry type shared by the in-memory map and the backing store.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A single cached value.
///
/// Entries are created unpopulated on first lookup of a key and mutated
/// in place when a refresh completes. They are never deleted one at a
/// time, only wholesale via `purge`.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: String,
  pub value: Value,
  /// When the value stops being fresh. `None` means the entry has never
  /// been populated.
  pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
  /// A new, unpopulated entry for `key`.
  pub fn new(key: &str) -> Self {
    Self {
      key: key.to_string(),
      value: Value::Null,
      expires_at: None,
    }
  }

  /// An entry is populated once any refresh has succeeded, even if the
  /// value has since gone stale.
  pub fn populated(&self) -> bool {
    self.expires_at.is_some()
  }

  /// An entry is active while its expiry is still in the future.
  pub fn active(&self) -> bool {
    match self.expires_at {
      Some(expires_at) => Utc::now() < expires_at,
      None => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_lifecycle_predicates() {
    let mut entry = CacheEntry::new("k");
    assert!(!entry.populated());
    assert!(!entry.active());

    entry.expires_at = Some(Utc::now() + Duration::hours(1));
    assert!(entry.populated());
    assert!(entry.active());

    entry.expires_at = Some(Utc::now() - Duration::seconds(1));
    assert!(entry.populated());
    assert!(!entry.active());
  }
}
