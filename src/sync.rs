//! Full-directory sync against the external API.
//!
//! Mirrors the remote group listing into the local database
//! (create/update/tombstone) and then fans out across the worker pool
//! to warm the membership cache for every live group.

use color_eyre::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::{CacheStore, SingleFlightCache};
use crate::db::{Database, GroupRecord};
use crate::directory::DirectoryClient;
use crate::notify::Notifier;
use crate::pool::{self, WorkerPool};
use crate::resolver::{cached_membership_list, membership_key};

pub struct GroupSyncEngine<S: CacheStore> {
  client: Arc<dyn DirectoryClient>,
  cache: SingleFlightCache<S>,
  db: Arc<Database>,
  /// Fan-out pool. Must be distinct from the cache's refresh pool: a
  /// fan-out task blocks on its lookup, and the refresh completing that
  /// lookup needs a free slot of its own.
  pool: WorkerPool,
  domain: String,
  notifier: Arc<dyn Notifier>,
}

impl<S: CacheStore + 'static> GroupSyncEngine<S> {
  pub fn new(
    client: Arc<dyn DirectoryClient>,
    cache: SingleFlightCache<S>,
    db: Arc<Database>,
    pool: WorkerPool,
    domain: String,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      client,
      cache,
      db,
      pool,
      domain,
      notifier,
    }
  }

  /// Diff the local directory against the remote listing, then warm the
  /// membership cache for every live group. Not done until the whole
  /// directory's cache is warm.
  pub async fn full_refresh(&self) -> Result<()> {
    tracing::info!("Doing a full refresh of all groups");

    let initialized = self.db.initialized()?;
    let listing = self.client.list_groups(&self.domain).await?;

    let mut live = HashSet::new();
    for info in &listing {
      // The API hands back remotely deleted groups as <name>-deleted-<id>@
      if info.email.contains("-deleted") {
        continue;
      }

      let mut record = GroupRecord::from_listing(info);
      match self.db.get_group(&record.email)? {
        None => {
          tracing::info!(group_email = %record.email, "Creating a new group");
          // Don't notify about display-restricted lists, or during the
          // very first slurp of the directory
          if initialized && !record.hidden() {
            self.notifier.group_created(&record);
          }
          self.db.upsert_group(&record)?;
        }
        Some(existing) => {
          // A category assigned earlier sticks
          if !existing.category.is_empty() {
            record.category = existing.category.clone();
          }
          if existing != record {
            tracing::info!(group_email = %record.email, "Updating existing group");
            self.db.upsert_group(&record)?;
          }
        }
      }
      live.insert(record.email);
    }

    // Garbage-collect any groups that don't exist anymore
    for group in self.db.live_groups()? {
      if !live.contains(&group.email) {
        tracing::info!(group_email = %group.email, "Tombstoning group");
        self.db.mark_deleted(&group.email)?;
      }
    }

    self.warm_membership_cache().await?;

    if !initialized {
      self.db.mark_initialized()?;
    }

    Ok(())
  }

  /// Fan out one cache-backed membership lookup per live group and
  /// block until every submitted task completes.
  ///
  /// Individual lookup failures leave that one entry stale or empty;
  /// they never abort the sibling tasks.
  pub async fn warm_membership_cache(&self) -> Result<()> {
    let groups = self.db.live_groups()?;
    let total = groups.len();

    let mut handles = Vec::with_capacity(total);
    for group in groups {
      let cache = self.cache.clone();
      let client = Arc::clone(&self.client);
      handles.push(self.pool.spawn(async move {
        // Lookup failures are logged and isolated inside
        cached_membership_list(&cache, &client, &group.email).await;
        group.email
      }));
    }

    let mut warmed = 0usize;
    for result in pool::join_all(handles).await {
      match result {
        Ok(email) if self.cache.populated(&membership_key(&email)) => warmed += 1,
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Membership warm task failed"),
      }
    }
    tracing::debug!(warmed, total, "Membership cache warm complete");

    Ok(())
  }

  /// Kick off a full refresh without waiting for it. Used by the
  /// periodic sync loop and right after credentials first show up.
  pub fn background_refresh(&self) {
    let engine = self.clone();
    tokio::spawn(async move {
      if let Err(e) = engine.full_refresh().await {
        tracing::error!(error = %e, "Background group refresh failed");
      }
    });
  }
}

impl<S: CacheStore> Clone for GroupSyncEngine<S> {
  fn clone(&self) -> Self {
    Self {
      client: Arc::clone(&self.client),
      cache: self.cache.clone(),
      db: Arc::clone(&self.db),
      pool: self.pool.clone(),
      domain: self.domain.clone(),
      notifier: Arc::clone(&self.notifier),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStore;
  use crate::config::CacheConfig;
  use crate::directory::{DirectoryError, GroupInfo};
  use async_trait::async_trait;
  use std::sync::Mutex;

  struct FakeDirectory {
    listing: Mutex<Vec<GroupInfo>>,
    fail_memberships_for: Option<String>,
  }

  impl FakeDirectory {
    fn new(emails: &[&str]) -> Self {
      Self {
        listing: Mutex::new(emails.iter().map(|e| group(e)).collect()),
        fail_memberships_for: None,
      }
    }

    fn set_listing(&self, emails: &[&str]) {
      *self.listing.lock().unwrap() = emails.iter().map(|e| group(e)).collect();
    }
  }

  fn group(email: &str) -> GroupInfo {
    GroupInfo {
      email: email.to_string(),
      description: String::new(),
      direct_members_count: "1".to_string(),
    }
  }

  #[async_trait]
  impl DirectoryClient for FakeDirectory {
    async fn list_groups(&self, _domain: &str) -> Result<Vec<GroupInfo>, DirectoryError> {
      Ok(self.listing.lock().unwrap().clone())
    }

    async fn list_memberships(&self, email: &str) -> Result<Vec<GroupInfo>, DirectoryError> {
      if self.fail_memberships_for.as_deref() == Some(email) {
        return Err(DirectoryError::Other("boom".to_string()));
      }
      Ok(Vec::new())
    }
  }

  #[derive(Default)]
  struct RecordingNotifier {
    created: Mutex<Vec<String>>,
  }

  impl Notifier for RecordingNotifier {
    fn group_created(&self, group: &GroupRecord) {
      self.created.lock().unwrap().push(group.email.clone());
    }
  }

  struct Fixture {
    engine: GroupSyncEngine<MemoryStore>,
    directory: Arc<FakeDirectory>,
    db: Arc<Database>,
    notifier: Arc<RecordingNotifier>,
  }

  fn fixture(directory: FakeDirectory) -> Fixture {
    fixture_with_pool_size(directory, CacheConfig::default().pool_size)
  }

  fn fixture_with_pool_size(directory: FakeDirectory, pool_size: usize) -> Fixture {
    let config = CacheConfig {
      pool_size,
      ..CacheConfig::default()
    };
    let cache =
      SingleFlightCache::new(MemoryStore::new(), WorkerPool::new(config.pool_size), &config)
        .unwrap();
    let pool = WorkerPool::new(config.pool_size);
    let directory = Arc::new(directory);
    let db = Arc::new(Database::open_in_memory().unwrap());
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = GroupSyncEngine::new(
      Arc::clone(&directory) as Arc<dyn DirectoryClient>,
      cache,
      Arc::clone(&db),
      pool,
      "example.com".to_string(),
      Arc::clone(&notifier) as Arc<dyn Notifier>,
    );

    Fixture {
      engine,
      directory,
      db,
      notifier,
    }
  }

  #[tokio::test]
  async fn test_refresh_creates_then_tombstones() {
    let f = fixture(FakeDirectory::new(&["a@example.com", "b@example.com"]));

    f.engine.full_refresh().await.unwrap();
    assert_eq!(f.db.live_groups().unwrap().len(), 2);
    assert!(f.db.initialized().unwrap());

    // b disappears upstream: tombstoned, not removed
    f.directory.set_listing(&["a@example.com"]);
    f.engine.full_refresh().await.unwrap();

    let live = f.db.live_groups().unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].email, "a@example.com");
    assert!(f.db.get_group("b@example.com").unwrap().unwrap().deleted);
  }

  #[tokio::test]
  async fn test_skips_remotely_deleted_groups() {
    let f = fixture(FakeDirectory::new(&[
      "eng@example.com",
      "old-deleted-4301b@example.com",
    ]));

    f.engine.full_refresh().await.unwrap();

    let live = f.db.live_groups().unwrap();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].email, "eng@example.com");
  }

  #[tokio::test]
  async fn test_fanout_barrier_warms_every_group() {
    let f = fixture(FakeDirectory::new(&[
      "a@example.com",
      "b@example.com",
      "c@example.com",
    ]));

    f.engine.full_refresh().await.unwrap();

    // The refresh is not "done" until every live group's membership
    // entry is populated
    for email in ["a@example.com", "b@example.com", "c@example.com"] {
      assert!(f.engine.cache.populated(&membership_key(email)));
    }
  }

  #[tokio::test]
  async fn test_fanout_larger_than_pool_completes() {
    // More groups than worker slots: the barrier must still complete
    let f = fixture_with_pool_size(
      FakeDirectory::new(&["a@example.com", "b@example.com", "c@example.com"]),
      1,
    );

    f.engine.full_refresh().await.unwrap();

    for email in ["a@example.com", "b@example.com", "c@example.com"] {
      assert!(f.engine.cache.populated(&membership_key(email)));
    }
  }

  #[tokio::test]
  async fn test_fanout_failure_is_isolated() {
    let mut directory = FakeDirectory::new(&["a@example.com", "b@example.com"]);
    directory.fail_memberships_for = Some("b@example.com".to_string());
    let f = fixture(directory);

    // One group's lookup failing must not fail the refresh
    f.engine.full_refresh().await.unwrap();

    assert!(f.engine.cache.populated(&membership_key("a@example.com")));
    assert!(!f.engine.cache.populated(&membership_key("b@example.com")));
  }

  #[tokio::test]
  async fn test_notifications_for_new_visible_groups_only() {
    let f = fixture(FakeDirectory::new(&["a@example.com"]));

    // First-ever sync: no notifications, even for brand new groups
    f.engine.full_refresh().await.unwrap();
    assert!(f.notifier.created.lock().unwrap().is_empty());

    // Later sync: new visible group notifies, hidden one doesn't
    f.directory
      .set_listing(&["a@example.com", "new@example.com", "acl-deploy@example.com"]);
    f.engine.full_refresh().await.unwrap();

    let created = f.notifier.created.lock().unwrap();
    assert_eq!(*created, vec!["new@example.com".to_string()]);
  }
}
