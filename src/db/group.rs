//! Group records and the heuristics attached to them.

use serde_json::{Map, Value};

use crate::directory::GroupInfo;

/// Locally persisted view of a remote group.
///
/// Groups are never hard-deleted: when one disappears from the upstream
/// listing it keeps its row with the `deleted` tombstone set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
  pub email: String,
  pub description: String,
  pub direct_members_count: String,
  /// Coarse grouping bucket, guessed from the address
  pub category: String,
  pub deleted: bool,
}

impl GroupRecord {
  /// Build a record from a directory listing entry.
  pub fn from_listing(info: &GroupInfo) -> Self {
    let mut record = Self {
      email: info.email.clone(),
      description: info.description.clone(),
      direct_members_count: info.direct_members_count.clone(),
      category: String::new(),
      deleted: false,
    };
    record.category = record.derive_category();
    record
  }

  /// Heuristic category: the first segment of the address.
  fn derive_category(&self) -> String {
    self
      .email
      .split(['@', '-'])
      .next()
      .unwrap_or_default()
      .to_string()
  }

  /// Human-readable one-liner for logs and notifications.
  pub fn describe(&self) -> String {
    if self.description.is_empty() {
      self.email.clone()
    } else {
      format!("{}: {}", self.email, self.description)
    }
  }

  /// Optional JSON tag on the last line of the description. Group
  /// owners use it to set per-group flags like `display`.
  pub fn config_tag(&self) -> Map<String, Value> {
    let last = self.description.lines().last().unwrap_or("");
    match serde_json::from_str::<Value>(last) {
      Ok(Value::Object(map)) => map,
      Ok(_) => {
        tracing::debug!(group_email = %self.email, last_line = last, "Ignoring non-object JSON tag");
        Map::new()
      }
      Err(_) => Map::new(),
    }
  }

  /// Hidden groups are excluded from new-group notifications.
  pub fn hidden(&self) -> bool {
    let display_restricted = match self.config_tag().get("display") {
      None | Some(Value::Null) => false,
      Some(Value::Bool(b)) => *b,
      Some(_) => true,
    };

    display_restricted
      || self.email.starts_with("acl-")
      || self.email.starts_with("private-")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(email: &str, description: &str) -> GroupRecord {
    GroupRecord::from_listing(&GroupInfo {
      email: email.to_string(),
      description: description.to_string(),
      direct_members_count: "3".to_string(),
    })
  }

  #[test]
  fn test_category_heuristic() {
    assert_eq!(record("eng@example.com", "").category, "eng");
    assert_eq!(record("eng-archive@example.com", "").category, "eng");
    assert_eq!(record("all@example.com", "").category, "all");
  }

  #[test]
  fn test_hidden_prefixes() {
    assert!(record("acl-deploy@example.com", "").hidden());
    assert!(record("private-managers@example.com", "").hidden());
    assert!(!record("eng@example.com", "").hidden());
  }

  #[test]
  fn test_hidden_via_config_tag() {
    assert!(record("eng@example.com", "Engineering\n{\"display\": true}").hidden());
    assert!(!record("eng@example.com", "Engineering\n{\"display\": false}").hidden());
  }

  #[test]
  fn test_invalid_config_tag_ignored() {
    let rec = record("eng@example.com", "Engineering\nnot json at all");
    assert!(rec.config_tag().is_empty());
    assert!(!rec.hidden());

    // Valid JSON but not an object is also ignored
    let rec = record("eng@example.com", "Engineering\n[1, 2, 3]");
    assert!(rec.config_tag().is_empty());
  }

  #[test]
  fn test_describe() {
    assert_eq!(
      record("eng@example.com", "Engineering").describe(),
      "eng@example.com: Engineering"
    );
    assert_eq!(record("eng@example.com", "").describe(), "eng@example.com");
  }
}
