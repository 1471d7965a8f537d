//! Single-flight cache layer.
//!
//! Guarantees at most one in-flight refresh per key: the first lookup
//! that finds a key missing or expired submits a refresh task to the
//! worker pool, and everyone else piggybacks on that task's result.
//! Callers holding a stale value can take it immediately instead of
//! waiting, depending on the process-wide `allow_stale` switch.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

use crate::config::CacheConfig;
use crate::pool::WorkerPool;

use super::entry::CacheEntry;
use super::storage::CacheStore;

/// Result delivered to waiters. Errors travel as strings because one
/// failure gets broadcast to every waiter registered for the key.
type RefreshResult = std::result::Result<Value, String>;

/// One side of a pending lookup.
pub enum ReadHandle {
  /// A usable value was already in the cache.
  Ready(Value),
  /// Waiting on the in-flight refresh for this key.
  Wait(oneshot::Receiver<RefreshResult>),
}

impl ReadHandle {
  /// Resolve the handle to a value, blocking on the refresh if needed.
  pub async fn value(self) -> Result<Value> {
    match self {
      ReadHandle::Ready(value) => Ok(value),
      ReadHandle::Wait(rx) => match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(eyre!("Cache refresh failed: {}", e)),
        Err(_) => Err(eyre!("Cache refresh dropped without completing")),
      },
    }
  }
}

/// The pair of handles produced by a lookup.
pub struct Lookup {
  /// Resolves as soon as any usable value exists, even a stale one.
  pub optimistic: ReadHandle,
  /// Resolves only once the triggered refresh completes.
  pub complete: ReadHandle,
}

struct CacheState {
  entries: HashMap<String, CacheEntry>,
  /// Waiters for the next completed refresh, per key. A key is present
  /// here exactly while a refresh for it is in flight.
  pending: HashMap<String, Vec<oneshot::Sender<RefreshResult>>>,
}

struct Inner<S> {
  state: Mutex<CacheState>,
  store: S,
  pool: WorkerPool,
  allow_stale: bool,
  ttl: Duration,
  jitter: Duration,
}

/// Single-flight, stale-tolerant cache over a durable backing store.
pub struct SingleFlightCache<S: CacheStore> {
  inner: Arc<Inner<S>>,
}

impl<S: CacheStore + 'static> SingleFlightCache<S> {
  /// Create the cache and warm it from the backing store.
  pub fn new(store: S, pool: WorkerPool, config: &CacheConfig) -> Result<Self> {
    let mut entries = HashMap::new();
    for entry in store.load_all()? {
      entries.insert(entry.key.clone(), entry);
    }
    tracing::info!(entries = entries.len(), "Warmed cache from store");

    Ok(Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState {
          entries,
          pending: HashMap::new(),
        }),
        store,
        pool,
        allow_stale: config.allow_stale,
        ttl: Duration::seconds(config.ttl_secs as i64),
        jitter: Duration::seconds(config.jitter_secs as i64),
      }),
    })
  }

  /// Look up `key`, refreshing through `fetch` if the entry is missing
  /// or expired.
  ///
  /// With `allow_stale` configured this resolves as soon as any value
  /// exists for the key; otherwise it waits for the refresh to finish.
  pub async fn lookup<F, Fut>(&self, key: &str, fetch: F) -> Result<Value>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let handles = self.begin_lookup(key, fetch)?;
    if self.inner.allow_stale {
      handles.optimistic.value().await
    } else {
      handles.complete.value().await
    }
  }

  /// Register a lookup and return both read handles.
  ///
  /// All map bookkeeping happens under the cache mutex; the fetch
  /// itself never runs while the lock is held.
  pub fn begin_lookup<F, Fut>(&self, key: &str, fetch: F) -> Result<Lookup>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let first;
    let lookup;
    {
      let mut state = self
        .inner
        .state
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;

      let entry = state
        .entries
        .entry(key.to_string())
        .or_insert_with(|| CacheEntry::new(key));

      // Still active: both handles resolve right away, no refresh.
      if entry.active() {
        let value = entry.value.clone();
        return Ok(Lookup {
          optimistic: ReadHandle::Ready(value.clone()),
          complete: ReadHandle::Ready(value),
        });
      }

      let stale = entry.populated().then(|| entry.value.clone());

      let (complete_tx, complete_rx) = oneshot::channel();
      let waiters = state.pending.entry(key.to_string()).or_default();
      first = waiters.is_empty();

      let optimistic = match stale {
        // Old value to hand back optimistically while the refresh runs
        Some(value) => {
          waiters.push(complete_tx);
          ReadHandle::Ready(value)
        }
        // Nothing cached yet; the optimistic read waits too
        None => {
          let (optimistic_tx, optimistic_rx) = oneshot::channel();
          waiters.push(optimistic_tx);
          waiters.push(complete_tx);
          ReadHandle::Wait(optimistic_rx)
        }
      };

      lookup = Lookup {
        optimistic,
        complete: ReadHandle::Wait(complete_rx),
      };
    }

    // First registration for this key triggers the one refresh; later
    // arrivals piggyback and never invoke their fetch.
    if first {
      let cache = self.clone();
      let key = key.to_string();
      let fut = fetch();
      self.inner.pool.spawn(async move {
        cache.run_refresh(key, fut).await;
      });
    }

    Ok(lookup)
  }

  /// Execute one refresh for `key` and notify every registered waiter.
  async fn run_refresh<Fut>(self, key: String, fetch: Fut)
  where
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    tracing::info!(key = %key, "Refreshing cache entry");

    let outcome: RefreshResult = match fetch.await {
      Ok(value) => Ok(value),
      Err(e) => {
        tracing::warn!(key = %key, error = %e, "Cache refresh failed");
        Err(format!("{:#}", e))
      }
    };

    let mut state = match self.inner.state.lock() {
      Ok(state) => state,
      Err(e) => {
        tracing::error!(key = %key, error = %e, "Cache lock poisoned; dropping refresh result");
        return;
      }
    };

    if let Ok(value) = &outcome {
      // A purge may have emptied the map while we were fetching;
      // writing the result back in is benign.
      let entry = state
        .entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(&key));
      entry.value = value.clone();
      entry.expires_at = Some(self.jittered_expiry());

      if let Err(e) = self.inner.store.put(entry) {
        tracing::warn!(key = %key, error = %e, "Failed to persist cache entry");
      }
    }
    // On failure the entry keeps its previous value and expiry, so the
    // next lookup can still serve it stale.

    // Drain waiters in the same critical section as the entry mutation
    // so nobody registered before completion observes a later refresh.
    if let Some(waiters) = state.pending.remove(&key) {
      for waiter in waiters {
        let _ = waiter.send(outcome.clone());
      }
    }
  }

  /// Expiry for a freshly refreshed entry: TTL plus random jitter, so a
  /// burst of refreshes doesn't produce a synchronized mass expiry.
  fn jittered_expiry(&self) -> DateTime<Utc> {
    let jitter_ms = self.inner.jitter.num_milliseconds();
    let jitter = if jitter_ms > 0 {
      Duration::milliseconds(rand::thread_rng().gen_range(0..jitter_ms))
    } else {
      Duration::zero()
    };
    Utc::now() + self.inner.ttl + jitter
  }

  /// Whether `key` currently holds a populated entry.
  pub fn populated(&self, key: &str) -> bool {
    self
      .inner
      .state
      .lock()
      .map(|state| state.entries.get(key).is_some_and(|e| e.populated()))
      .unwrap_or(false)
  }

  /// Discard the whole in-memory map and truncate the backing store.
  ///
  /// In-flight refreshes are left alone; they will write their result
  /// into the now-empty map and still notify their waiters.
  pub fn purge(&self) -> Result<()> {
    tracing::info!("Purging entire cache");

    let mut state = self
      .inner
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    state.entries.clear();
    self.inner.store.drop_all()?;

    Ok(())
  }
}

impl<S: CacheStore> Clone for SingleFlightCache<S> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}
