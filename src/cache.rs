//! In-process key/value store with optional per-entry expiry.
//!
//! Entries written with a zero TTL never expire. Expired entries are evicted
//! lazily on read and proactively by a periodic sweep.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::cron_jobs::CronTrigger;
use crate::models::{ExecutionEvent, Task};
use crate::scheduler::TaskTrigger;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Key prefixes partitioning the shared cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
  Task,
  Event,
  Cron,
}

impl Namespace {
  pub fn prefix(self) -> &'static str {
    match self {
      Namespace::Task => "task.",
      Namespace::Event => "event.",
      Namespace::Cron => "cron.",
    }
  }

  pub fn key(self, id: impl Display) -> String {
    format!("{}{}", self.prefix(), id)
  }
}

/// Values held in the engine's shared cache.
#[derive(Clone)]
pub enum CacheValue {
  PendingTask(Box<Task>),
  TaskTrigger(Arc<TaskTrigger>),
  CronTrigger(Arc<CronTrigger>),
  Event(Arc<ExecutionEvent>),
}

pub type SharedCache = Arc<TtlCache<CacheValue>>;

struct Item<V> {
  value: V,
  expires_at: Option<Instant>,
}

impl<V> Item<V> {
  fn is_expired(&self, now: Instant) -> bool {
    self.expires_at.is_some_and(|at| now >= at)
  }
}

pub struct TtlCache<V> {
  items: Mutex<HashMap<String, Item<V>>>,
  sweep_interval: Duration,
}

impl<V: Clone + Send + 'static> TtlCache<V> {
  pub fn new(sweep_interval: Duration) -> Self {
    Self {
      items: Mutex::new(HashMap::new()),
      sweep_interval,
    }
  }

  /// Stores `value`; a zero `ttl` keeps it until deleted.
  pub async fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
    let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
    self.items.lock().await.insert(key.into(), Item { value, expires_at });
  }

  pub async fn get(&self, key: &str) -> Option<V> {
    let mut items = self.items.lock().await;
    match items.get(key) {
      Some(item) if !item.is_expired(Instant::now()) => Some(item.value.clone()),
      Some(_) => {
        items.remove(key);
        None
      }
      None => None,
    }
  }

  pub async fn has(&self, key: &str) -> bool {
    let mut items = self.items.lock().await;
    match items.get(key) {
      Some(item) if !item.is_expired(Instant::now()) => true,
      Some(_) => {
        items.remove(key);
        false
      }
      None => false,
    }
  }

  pub async fn delete(&self, key: &str) {
    self.items.lock().await.remove(key);
  }

  /// Removes and returns a live entry in one step.
  pub async fn take(&self, key: &str) -> Option<V> {
    let item = self.items.lock().await.remove(key)?;
    (!item.is_expired(Instant::now())).then_some(item.value)
  }

  pub async fn len(&self) -> usize {
    self.items.lock().await.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.items.lock().await.is_empty()
  }

  pub async fn purge_expired(&self) -> usize {
    let now = Instant::now();
    let mut items = self.items.lock().await;
    let before = items.len();
    items.retain(|_, item| !item.is_expired(now));
    before - items.len()
  }

  /// Starts the periodic sweep. The task ends once the cache is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
    let cache: Weak<Self> = Arc::downgrade(self);
    let period = self.sweep_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(cache) = cache.upgrade() else { break };
        let evicted = cache.purge_expired().await;
        if evicted > 0 {
          debug!(evicted, "Cache sweep evicted expired entries");
        }
      }
    })
  }
}

impl<V: Clone + Send + 'static> Default for TtlCache<V> {
  fn default() -> Self {
    Self::new(DEFAULT_SWEEP_INTERVAL)
  }
}
