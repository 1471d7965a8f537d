use serde::{Deserialize, Serialize};

/// Group descriptor as returned by the directory API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
  pub email: String,
  #[serde(default)]
  pub description: String,
  #[serde(default, rename = "directMembersCount")]
  pub direct_members_count: String,
}

/// One page of a group listing.
#[derive(Debug, Deserialize)]
pub(crate) struct GroupsPage {
  /// Missing entirely on pages with no results
  #[serde(default)]
  pub groups: Vec<GroupInfo>,
  #[serde(rename = "nextPageToken")]
  pub next_page_token: Option<String>,
}
