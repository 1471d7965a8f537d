//! Transitive mailing-list membership resolution.
//!
//! Walks the nested-group graph breadth-first from a user's direct
//! memberships, so "user is in eng, eng is in all-staff" surfaces
//! all-staff too. Every hop beyond the first goes through the
//! single-flight cache: many users share the same upstream groups.

use color_eyre::Result;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::cache::{CacheStore, SingleFlightCache};
use crate::directory::{DirectoryClient, GroupInfo};

/// How an address ended up subscribed to a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
  /// The user is a direct member.
  Direct,
  /// Discovered through membership in this intermediate group.
  Via(String),
}

/// Group address mapped to the nearest intermediate it was discovered
/// through. A spanning tree of the membership graph, not all paths.
pub type MembershipMap = HashMap<String, Membership>;

/// Cache key for a group's own parent-membership list.
pub fn membership_key(email: &str) -> String {
  format!("memberships:{}", email)
}

/// Cache-backed lookup of the groups that directly contain `email`.
///
/// Failures and misses come back as an empty list, never an error, so
/// graph walks always complete.
pub async fn cached_membership_list<S: CacheStore + 'static>(
  cache: &SingleFlightCache<S>,
  client: &Arc<dyn DirectoryClient>,
  email: &str,
) -> Vec<GroupInfo> {
  let key = membership_key(email);
  let fetch_client = Arc::clone(client);
  let fetch_email = email.to_string();

  let result = cache
    .lookup(&key, move || async move {
      let groups = fetch_client.list_memberships(&fetch_email).await?;
      Ok(serde_json::to_value(&groups)?)
    })
    .await;

  match result {
    // An undecodable cached value also degrades to empty
    Ok(value) => serde_json::from_value(value).unwrap_or_default(),
    Err(e) => {
      tracing::warn!(email = %email, error = %e, "Membership lookup failed; treating as empty");
      Vec::new()
    }
  }
}

/// Computes the full set of groups an address belongs to, directly or
/// through nested membership.
pub struct MembershipResolver<S: CacheStore> {
  client: Arc<dyn DirectoryClient>,
  cache: SingleFlightCache<S>,
}

impl<S: CacheStore + 'static> MembershipResolver<S> {
  pub fn new(client: Arc<dyn DirectoryClient>, cache: SingleFlightCache<S>) -> Self {
    Self { client, cache }
  }

  /// BFS over the "address is member of group" relation.
  ///
  /// Visited addresses are never re-enqueued, so cyclic membership
  /// graphs terminate after each node is seen once. The recorded parent
  /// for an address is whichever predecessor reached it first.
  pub async fn resolve(&self, user_email: &str) -> Result<MembershipMap> {
    tracing::info!(user = %user_email, "Resolving transitive group memberships");

    let mut subscriptions = MembershipMap::new();
    let mut queue = VecDeque::new();

    // Direct memberships come straight from the client; this call is
    // per-user and not worth caching.
    for group in self.client.list_memberships(user_email).await? {
      if subscriptions.contains_key(&group.email) {
        continue;
      }
      subscriptions.insert(group.email.clone(), Membership::Direct);
      queue.push_back(group.email);
    }

    while let Some(email) = queue.pop_front() {
      let parents = cached_membership_list(&self.cache, &self.client, &email).await;
      for parent in parents {
        if subscriptions.contains_key(&parent.email) {
          continue;
        }
        subscriptions.insert(parent.email.clone(), Membership::Via(email.clone()));
        queue.push_back(parent.email);
      }
    }

    tracing::debug!(user = %user_email, groups = subscriptions.len(), "Resolution complete");
    Ok(subscriptions)
  }
}
