//! Time-driven trigger dispatcher.
//!
//! A single dispatcher task sleeps until the earliest registered fire time,
//! spawns every due job, and reschedules it from its cron expression.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub type EntryId = u64;
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Parses a seconds-resolution, six-field cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, String> {
  let fields = expr.split_whitespace().count();
  if fields != 6 {
    return Err(format!(
      "schedule `{expr}` is not a valid six-field cron expression (found {fields} fields)"
    ));
  }
  let mut parts: Vec<&str> = expr.split_whitespace().collect();
  let weekdays = normalize_weekdays(parts[5]);
  parts[5] = &weekdays;
  Schedule::from_str(&parts.join(" ")).map_err(|e| format!("schedule `{expr}` is invalid: {e}"))
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrites numeric weekdays (0-6, Sunday = 0, 7 also Sunday) as names, since
/// `cron` counts Sunday as 1.
fn normalize_weekdays(field: &str) -> String {
  field.split(',').map(normalize_weekday_item).collect::<Vec<_>>().join(",")
}

fn normalize_weekday_item(item: &str) -> String {
  let (range, step) = match item.split_once('/') {
    Some((range, step)) => (range, Some(step)),
    None => (item, None),
  };
  let mut out = match range.split_once('-') {
    Some((start, "7")) => {
      let start = weekday_name(start);
      if step.is_none() && start != "SUN" {
        format!("{start}-SAT,SUN")
      } else {
        format!("{start}-SAT")
      }
    }
    Some((start, end)) => format!("{}-{}", weekday_name(start), weekday_name(end)),
    None => weekday_name(range),
  };
  if let Some(step) = step {
    out.push('/');
    out.push_str(step);
  }
  out
}

fn weekday_name(token: &str) -> String {
  match token.parse::<usize>() {
    Ok(n) if n <= 7 => WEEKDAYS[n % 7].to_string(),
    _ => token.to_string(),
  }
}

#[derive(Debug, PartialEq, Eq)]
struct Pending {
  at: DateTime<Utc>,
  id: EntryId,
}

impl PartialOrd for Pending {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Pending {
  fn cmp(&self, other: &Self) -> Ordering {
    other.at.cmp(&self.at).then_with(|| other.id.cmp(&self.id))
  }
}

/// Handle on a registered trigger. The suspended flag is read once per fire,
/// so suspending takes effect without touching the dispatcher.
#[derive(Debug)]
pub struct Registration {
  entry: EntryId,
  suspended: Arc<AtomicBool>,
}

impl Registration {
  pub fn entry(&self) -> EntryId {
    self.entry
  }

  pub fn is_suspended(&self) -> bool {
    self.suspended.load(AtomicOrdering::SeqCst)
  }

  pub fn suspend(&self) {
    self.suspended.store(true, AtomicOrdering::SeqCst);
  }

  /// Suspends the trigger and drops it from the dispatcher.
  pub async fn retire(&self, registry: &CronRegistry) {
    self.suspend();
    registry.remove(self.entry).await;
  }
}

struct Entry {
  schedule: Schedule,
  job: Job,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<EntryId, Entry>,
  queue: BinaryHeap<Pending>,
}

pub struct CronRegistry {
  inner: Mutex<Inner>,
  wake: Notify,
  next_id: AtomicU64,
}

impl CronRegistry {
  pub fn new() -> Self {
    Self {
      inner: Mutex::new(Inner::default()),
      wake: Notify::new(),
      next_id: AtomicU64::new(1),
    }
  }

  pub async fn add(&self, schedule: Schedule, job: Job) -> EntryId {
    let id = self.next_id.fetch_add(1, AtomicOrdering::SeqCst);
    let mut inner = self.inner.lock().await;
    match schedule.upcoming(Utc).next() {
      Some(at) => inner.queue.push(Pending { at, id }),
      None => warn!(entry = id, "Schedule has no upcoming fire time"),
    }
    inner.entries.insert(id, Entry { schedule, job });
    drop(inner);
    self.wake.notify_one();
    id
  }

  /// Registers `job` behind a suspended flag checked at fire time.
  pub async fn register<F, Fut>(&self, schedule: Schedule, job: F) -> Registration
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let suspended = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&suspended);
    let job = Arc::new(job);
    let entry = self
      .add(
        schedule,
        Arc::new(move || {
          let flag = Arc::clone(&flag);
          let job = Arc::clone(&job);
          async move {
            if flag.load(AtomicOrdering::SeqCst) {
              return;
            }
            job().await
          }
          .boxed()
        }),
      )
      .await;
    Registration { entry, suspended }
  }

  /// Fires an entry immediately, outside its schedule.
  pub async fn run_now(&self, id: EntryId) -> bool {
    let job = self.inner.lock().await.entries.get(&id).map(|e| Arc::clone(&e.job));
    match job {
      Some(job) => {
        tokio::spawn(job());
        true
      }
      None => false,
    }
  }

  pub async fn remove(&self, id: EntryId) -> bool {
    let removed = self.inner.lock().await.entries.remove(&id).is_some();
    if removed {
      self.wake.notify_one();
    }
    removed
  }

  pub async fn len(&self) -> usize {
    self.inner.lock().await.entries.len()
  }

  pub async fn is_empty(&self) -> bool {
    self.len().await == 0
  }

  /// Runs the dispatcher loop until the returned handle is aborted.
  pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
    let registry = Arc::clone(self);
    tokio::spawn(async move {
      loop {
        match registry.next_fire().await {
          None => registry.wake.notified().await,
          Some(at) => {
            let wait = (at - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
              _ = tokio::time::sleep(wait) => registry.fire_due().await,
              _ = registry.wake.notified() => {}
            }
          }
        }
      }
    })
  }

  async fn next_fire(&self) -> Option<DateTime<Utc>> {
    let mut inner = self.inner.lock().await;
    loop {
      let top = inner.queue.peek()?;
      if inner.entries.contains_key(&top.id) {
        return Some(top.at);
      }
      inner.queue.pop();
    }
  }

  async fn fire_due(&self) {
    let now = Utc::now();
    let mut guard = self.inner.lock().await;
    let Inner { entries, queue } = &mut *guard;
    while queue.peek().is_some_and(|p| p.at <= now) {
      let Some(Pending { id, .. }) = queue.pop() else { break };
      let Some(entry) = entries.get(&id) else { continue };
      debug!(entry = id, "Cron entry fired");
      tokio::spawn((entry.job)());
      if let Some(at) = entry.schedule.after(&now).next() {
        queue.push(Pending { at, id });
      }
    }
  }
}

impl Default for CronRegistry {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;
  use std::time::Duration;

  fn counting_job(counter: Arc<AtomicUsize>) -> Job {
    Arc::new(move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, AtomicOrdering::SeqCst);
      }
      .boxed()
    })
  }

  #[test]
  fn accepts_six_fields_only() {
    assert!(parse_schedule("0 */5 * * * *").is_ok());
    assert!(parse_schedule("*/5 * * * *").is_err());
    assert!(parse_schedule("0 0 0 * * * 2030").is_err());
    assert!(parse_schedule("a b c d e f").is_err());
    assert!(parse_schedule("").is_err());
  }

  fn fire_days(expr: &str, count: usize) -> Vec<chrono::Weekday> {
    use chrono::{Datelike, TimeZone};
    let monday = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    parse_schedule(expr)
      .unwrap()
      .after(&monday)
      .take(count)
      .map(|at| at.weekday())
      .collect()
  }

  #[test]
  fn weekdays_count_from_sunday_zero() {
    use chrono::Weekday::*;
    assert_eq!(fire_days("0 0 12 * * 1-5", 7), vec![Mon, Tue, Wed, Thu, Fri, Mon, Tue]);
    assert_eq!(fire_days("0 0 12 * * 1", 2), vec![Mon, Mon]);
    assert_eq!(fire_days("0 0 3 * * 0", 2), vec![Sun, Sun]);
    assert_eq!(fire_days("0 0 3 * * 7", 1), vec![Sun]);
    assert_eq!(fire_days("0 0 3 * * 0,6", 3), vec![Sat, Sun, Sat]);
    assert_eq!(fire_days("0 0 3 * * 5-7", 4), vec![Fri, Sat, Sun, Fri]);
    assert_eq!(fire_days("0 0 3 * * MON-FRI", 1), vec![Mon]);
  }

  #[test]
  fn pending_orders_earliest_first() {
    let now = Utc::now();
    let mut heap = BinaryHeap::new();
    heap.push(Pending { at: now + chrono::Duration::seconds(5), id: 1 });
    heap.push(Pending { at: now, id: 2 });
    heap.push(Pending { at: now + chrono::Duration::seconds(1), id: 3 });
    assert_eq!(heap.pop().map(|p| p.id), Some(2));
    assert_eq!(heap.pop().map(|p| p.id), Some(3));
  }

  #[tokio::test]
  async fn fires_every_second_until_removed() {
    let registry = Arc::new(CronRegistry::new());
    let dispatcher = registry.start();
    let fired = Arc::new(AtomicUsize::new(0));
    let id = registry
      .add(parse_schedule("* * * * * *").unwrap(), counting_job(Arc::clone(&fired)))
      .await;
    tokio::time::sleep(Duration::from_millis(2300)).await;
    assert!(fired.load(AtomicOrdering::SeqCst) >= 1);

    assert!(registry.remove(id).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let after_removal = fired.load(AtomicOrdering::SeqCst);
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(fired.load(AtomicOrdering::SeqCst), after_removal);
    assert!(registry.is_empty().await);
    dispatcher.abort();
  }

  #[tokio::test]
  async fn suspended_registration_skips_fires() {
    let registry = CronRegistry::new();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&fired);
    let registration = registry
      .register(parse_schedule("0 0 0 1 1 *").unwrap(), move || {
        let counter = Arc::clone(&counter);
        async move {
          counter.fetch_add(1, AtomicOrdering::SeqCst);
        }
      })
      .await;

    assert!(registry.run_now(registration.entry()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);

    registration.suspend();
    assert!(registry.run_now(registration.entry()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(AtomicOrdering::SeqCst), 1);

    registration.retire(&registry).await;
    assert!(!registry.run_now(registration.entry()).await);
    assert!(registry.is_empty().await);
  }
}
