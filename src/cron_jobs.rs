//! Standalone recurring jobs: HTTP probes and local commands run in-process.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheValue, Namespace, SharedCache};
use crate::cron_registry::{CronRegistry, Registration, parse_schedule};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::models::{CronJob, CronKind, CronStatus};
use crate::store::{Entity, IndexField, Store};

/// Performs one attempt of a cron job's action.
#[async_trait]
pub trait JobRunner: Send + Sync {
  async fn attempt(&self, job: &CronJob) -> Result<String, String>;
}

/// Runs HTTP probes with `reqwest` and commands as local child processes.
pub struct ProcessRunner {
  client: reqwest::Client,
}

impl ProcessRunner {
  pub fn new() -> Self {
    Self {
      client: reqwest::Client::new(),
    }
  }
}

impl Default for ProcessRunner {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl JobRunner for ProcessRunner {
  async fn attempt(&self, job: &CronJob) -> Result<String, String> {
    match job.kind {
      CronKind::Http => {
        let resp = self.client.get(&job.url).send().await.map_err(|e| e.to_string())?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| e.to_string())?;
        Ok(format!("Status code: {}, len(response): {}", status, body.len()))
      }
      CronKind::Shell => {
        let Some((program, args)) = job.cmd.split_first() else {
          return Err("cron command is empty".into());
        };
        let output = tokio::process::Command::new(program)
          .args(args)
          .output()
          .await
          .map_err(|e| format!("{program}: {e}"))?;
        if !output.status.success() {
          let stderr = String::from_utf8_lossy(&output.stderr);
          return Err(format!("{program}: {}: {}", output.status, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
      }
    }
  }
}

/// Runs `job` up to its attempt count, stopping at the first success.
pub async fn run_job(job: &mut CronJob, runner: &dyn JobRunner) {
  job.running = true;
  for attempt in 1..=job.attempts() {
    match runner.attempt(job).await {
      Ok(output) => {
        job.record_success(output);
        break;
      }
      Err(e) => {
        debug!(cron = %job.name, attempt, error = %e, "Cron attempt failed");
        job.record_failure(e);
      }
    }
  }
  job.running = false;
  job.updated = Utc::now();
}

struct LiveJob {
  job: Mutex<CronJob>,
  running: AtomicBool,
  retired: AtomicBool,
}

impl LiveJob {
  async fn fire(&self, crons: &dyn Store<CronJob>, runner: &dyn JobRunner) {
    if self.running.swap(true, Ordering::SeqCst) {
      let name = self.job.lock().await.name.clone();
      warn!(cron = %name, "Previous run still in progress, skipping");
      return;
    }
    let mut job = {
      let mut live = self.job.lock().await;
      live.running = true;
      live.clone()
    };
    run_job(&mut job, runner).await;
    match &job.last_error {
      Some(e) => error!(cron = %job.name, error = %e, failures = job.failures, "Cron run failed"),
      None => info!(cron = %job.name, output = job.last_output.as_deref().unwrap_or_default(), "Cron run finished"),
    }
    *self.job.lock().await = job.clone();

    if !self.retired.load(Ordering::SeqCst) {
      if let Err(e) = crons.update(job.id, &job).await {
        error!(cron = %job.name, error = %e, "Failed to persist cron run");
      }
    }
    self.running.store(false, Ordering::SeqCst);
  }
}

/// Live cron registration together with the job's in-memory state.
pub struct CronTrigger {
  registration: Registration,
  live: Arc<LiveJob>,
}

impl CronTrigger {
  pub fn registration(&self) -> &Registration {
    &self.registration
  }

  pub async fn snapshot(&self) -> CronJob {
    self.live.job.lock().await.clone()
  }

  async fn retire(&self, registry: &CronRegistry) {
    self.live.retired.store(true, Ordering::SeqCst);
    self.registration.retire(registry).await;
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModifyCron {
  #[serde(default)]
  pub spec: Option<String>,
  #[serde(default)]
  pub suspended: bool,
}

pub struct CronEngine {
  crons: Arc<dyn Store<CronJob>>,
  cache: SharedCache,
  registry: Arc<CronRegistry>,
  runner: Arc<dyn JobRunner>,
  registering: Mutex<()>,
}

impl CronEngine {
  pub fn new(
    crons: Arc<dyn Store<CronJob>>,
    cache: SharedCache,
    registry: Arc<CronRegistry>,
    runner: Arc<dyn JobRunner>,
  ) -> Self {
    Self {
      crons,
      cache,
      registry,
      runner,
      registering: Mutex::new(()),
    }
  }

  pub async fn rehydrate(&self) -> EngineResult<()> {
    let jobs = self.crons.list_all().await?;
    let total = jobs.len();
    for job in jobs {
      let name = job.name.clone();
      if let Err(e) = self.register(job).await {
        warn!(cron = %name, error = %e, "Skipping stored cron with unusable schedule");
      }
    }
    info!(total, "Crons restored from store");
    Ok(())
  }

  pub async fn submit_cron(&self, mut job: CronJob) -> EngineResult<u64> {
    validate(&job)?;
    let held = self.registering.lock().await;
    match self.crons.list_by_field(IndexField::Name, &job.name).await {
      Ok(_) => return Err(EngineError::Conflict(format!("cron `{}`", job.name))),
      Err(StoreError::Empty(_)) => {}
      Err(e) => return Err(e.into()),
    }
    let now = Utc::now();
    job.created = now;
    job.updated = now;
    job.running = false;
    let id = self.crons.put(&mut job).await?;
    info!(cron = %job.name, id, spec = %job.spec, "Cron accepted");
    self.install(job, &held).await?;
    Ok(id)
  }

  /// Changes the schedule and suspended flag. Returns `false` when nothing
  /// changed.
  pub async fn suspend_or_resume_cron(&self, id: u64, req: ModifyCron) -> EngineResult<bool> {
    let spec = req.spec.filter(|s| !s.is_empty());
    if let Some(spec) = &spec {
      parse_schedule(spec).map_err(EngineError::Validation)?;
    }
    let mut job = self.get_cron(id).await?;
    let new_spec = spec.unwrap_or_else(|| job.spec.clone());
    if new_spec == job.spec && req.suspended == job.suspended {
      return Ok(false);
    }
    job.spec = new_spec;
    job.suspended = req.suspended;
    job.updated = Utc::now();
    self.crons.update(job.id, &job).await?;
    info!(cron = %job.name, spec = %job.spec, suspended = job.suspended, "Cron modified");
    self.register(job).await?;
    Ok(true)
  }

  pub async fn delete_cron(&self, id: u64) -> EngineResult<()> {
    let mut job = self.get_cron(id).await?;
    self.crons.delete(id).await?;
    job.suspended = true;
    info!(cron = %job.name, id, "Cron deleted");
    self.register(job).await
  }

  pub async fn get_cron(&self, id: u64) -> EngineResult<CronJob> {
    match self.crons.get(id).await {
      Ok(job) => Ok(job),
      Err(StoreError::NotFound) => Err(EngineError::NotFound("cron")),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn list_crons(&self) -> EngineResult<Vec<CronJob>> {
    let jobs = self.crons.list_all().await?;
    if jobs.is_empty() {
      return Err(StoreError::Empty(CronJob::BUCKET).into());
    }
    Ok(jobs)
  }

  /// Live view of a registered cron, transient diagnostics included.
  pub async fn cron_status(&self, name: &str) -> EngineResult<CronStatus> {
    match self.trigger(name).await {
      Some(trigger) => Ok(trigger.snapshot().await.into()),
      None => Err(EngineError::NotFound("cron")),
    }
  }

  pub async fn trigger(&self, name: &str) -> Option<Arc<CronTrigger>> {
    match self.cache.get(&Namespace::Cron.key(name)).await {
      Some(CacheValue::CronTrigger(trigger)) => Some(trigger),
      _ => None,
    }
  }

  /// Retires any live trigger for the job's name, then registers `job`
  /// unless it is suspended.
  async fn register(&self, job: CronJob) -> EngineResult<()> {
    let held = self.registering.lock().await;
    self.install(job, &held).await
  }

  /// Swaps in the live trigger for `job`. Callers hold `registering`.
  async fn install(&self, job: CronJob, _held: &MutexGuard<'_, ()>) -> EngineResult<()> {
    let schedule = parse_schedule(&job.spec).map_err(EngineError::Validation)?;
    let key = Namespace::Cron.key(&job.name);

    if let Some(CacheValue::CronTrigger(previous)) = self.cache.get(&key).await {
      previous.retire(&self.registry).await;
      self.cache.delete(&key).await;
      info!(cron = %job.name, "Retired previous trigger");
    }
    if job.suspended {
      return Ok(());
    }

    let name = job.name.clone();
    let live = Arc::new(LiveJob {
      job: Mutex::new(job),
      running: AtomicBool::new(false),
      retired: AtomicBool::new(false),
    });
    let fired = Arc::clone(&live);
    let crons = Arc::clone(&self.crons);
    let runner = Arc::clone(&self.runner);
    let registration = self
      .registry
      .register(schedule, move || {
        let live = Arc::clone(&fired);
        let crons = Arc::clone(&crons);
        let runner = Arc::clone(&runner);
        async move { live.fire(crons.as_ref(), runner.as_ref()).await }
      })
      .await;
    info!(cron = %name, entry = registration.entry(), "Cron scheduled");
    let trigger = CronTrigger { registration, live };
    self
      .cache
      .set(key, CacheValue::CronTrigger(Arc::new(trigger)), Duration::ZERO)
      .await;
    Ok(())
  }
}

fn validate(job: &CronJob) -> EngineResult<()> {
  if job.name.trim().is_empty() {
    return Err(EngineError::Validation("cron name must not be empty".into()));
  }
  parse_schedule(&job.spec).map_err(EngineError::Validation)?;
  match job.kind {
    CronKind::Http if job.url.is_empty() => Err(EngineError::Validation("http cron requires a url".into())),
    CronKind::Shell if job.cmd.is_empty() => Err(EngineError::Validation("shell cron requires a command".into())),
    _ => Ok(()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TtlCache;
  use crate::store::MemoryStore;
  use serde_json::json;
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex as StdMutex;

  /// Replays scripted attempt outcomes in order, then succeeds.
  #[derive(Default)]
  struct ScriptedRunner {
    outcomes: StdMutex<VecDeque<Result<String, String>>>,
    calls: AtomicUsize,
  }

  impl ScriptedRunner {
    fn new(outcomes: Vec<Result<&str, &str>>) -> Self {
      Self {
        outcomes: StdMutex::new(
          outcomes
            .into_iter()
            .map(|o| o.map(String::from).map_err(String::from))
            .collect(),
        ),
        calls: AtomicUsize::new(0),
      }
    }
  }

  #[async_trait]
  impl JobRunner for ScriptedRunner {
    async fn attempt(&self, _job: &CronJob) -> Result<String, String> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| Ok("ok".into()))
    }
  }

  fn job(name: &str, times: u32) -> CronJob {
    serde_json::from_value(json!({
      "name": name,
      "type": "cmd",
      "cmd": ["true"],
      "spec": "0 0 4 * * *",
      "times": times
    }))
    .unwrap()
  }

  fn engine(runner: Arc<dyn JobRunner>) -> (Arc<MemoryStore<CronJob>>, Arc<CronRegistry>, CronEngine) {
    let crons = Arc::new(MemoryStore::<CronJob>::new());
    let registry = Arc::new(CronRegistry::new());
    let engine = CronEngine::new(
      crons.clone(),
      Arc::new(TtlCache::default()),
      Arc::clone(&registry),
      runner,
    );
    (crons, registry, engine)
  }

  #[tokio::test]
  async fn third_attempt_success_clears_errors() {
    let runner = ScriptedRunner::new(vec![Err("first"), Err("second"), Ok("third")]);
    let mut j = job("probe", 3);
    run_job(&mut j, &runner).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
    assert_eq!(j.last_error, None);
    assert_eq!(j.last_output.as_deref(), Some("third"));
    assert_eq!(j.failures, 0);
    assert!(!j.running);
  }

  #[tokio::test]
  async fn exhausted_attempts_keep_last_error() {
    let runner = ScriptedRunner::new(vec![Err("first"), Err("second")]);
    let mut j = job("probe", 2);
    run_job(&mut j, &runner).await;
    assert_eq!(j.last_error.as_deref(), Some("second"));
    assert_eq!(j.failures, 2);
  }

  #[tokio::test]
  async fn zero_times_still_attempts_once() {
    let runner = ScriptedRunner::new(vec![Err("only")]);
    let mut j = job("probe", 0);
    run_job(&mut j, &runner).await;
    assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    assert_eq!(j.last_error.as_deref(), Some("only"));
  }

  #[tokio::test]
  async fn duplicate_name_conflicts() {
    let (crons, registry, engine) = engine(Arc::new(ScriptedRunner::default()));
    engine.submit_cron(job("backup", 1)).await.unwrap();
    let err = engine.submit_cron(job("backup", 1)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(_)));
    assert_eq!(crons.list_all().await.unwrap().len(), 1);
    assert_eq!(registry.len().await, 1);
  }

  /// Yields before every name lookup so concurrent submissions interleave.
  struct YieldingStore(MemoryStore<CronJob>);

  #[async_trait]
  impl Store<CronJob> for YieldingStore {
    async fn get(&self, id: u64) -> Result<CronJob, StoreError> {
      self.0.get(id).await
    }

    async fn put(&self, record: &mut CronJob) -> Result<u64, StoreError> {
      self.0.put(record).await
    }

    async fn update(&self, id: u64, record: &CronJob) -> Result<(), StoreError> {
      self.0.update(id, record).await
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
      self.0.delete(id).await
    }

    async fn list_by_field(&self, field: IndexField, value: &str) -> Result<Vec<CronJob>, StoreError> {
      tokio::task::yield_now().await;
      self.0.list_by_field(field, value).await
    }

    async fn list_all(&self) -> Result<Vec<CronJob>, StoreError> {
      self.0.list_all().await
    }
  }

  #[tokio::test]
  async fn concurrent_duplicate_submissions_persist_once() {
    let crons = Arc::new(YieldingStore(MemoryStore::new()));
    let engine = CronEngine::new(
      crons.clone(),
      Arc::new(TtlCache::default()),
      Arc::new(CronRegistry::new()),
      Arc::new(ScriptedRunner::default()),
    );
    let (first, second) = tokio::join!(
      engine.submit_cron(job("backup", 1)),
      engine.submit_cron(job("backup", 1))
    );
    let conflicts = [&first, &second]
      .iter()
      .filter(|r| matches!(r, Err(EngineError::Conflict(_))))
      .count();
    assert_eq!(conflicts, 1);
    assert!(first.is_ok() || second.is_ok());
    assert_eq!(crons.list_all().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn invalid_jobs_are_rejected() {
    let (crons, _, engine) = engine(Arc::new(ScriptedRunner::default()));
    let mut bad_spec = job("a", 1);
    bad_spec.spec = "* * * * *".into();
    assert!(matches!(engine.submit_cron(bad_spec).await, Err(EngineError::Validation(_))));
    let mut no_cmd = job("b", 1);
    no_cmd.cmd.clear();
    assert!(matches!(engine.submit_cron(no_cmd).await, Err(EngineError::Validation(_))));
    assert!(crons.list_all().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn fire_persists_and_exposes_diagnostics() {
    let runner = Arc::new(ScriptedRunner::new(vec![Err("down")]));
    let (crons, registry, engine) = engine(runner);
    let id = engine.submit_cron(job("probe", 1)).await.unwrap();

    let trigger = engine.trigger("probe").await.unwrap();
    assert!(registry.run_now(trigger.registration().entry()).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let status = engine.cron_status("probe").await.unwrap();
    assert_eq!(status.last_error.as_deref(), Some("down"));
    assert_eq!(status.consecutive_failures, 1);
    let stored = crons.get(id).await.unwrap();
    assert!(stored.last_error.is_none());
    assert!(stored.updated >= stored.created);
  }

  #[tokio::test]
  async fn modify_and_delete_retire_the_trigger() {
    let (crons, registry, engine) = engine(Arc::new(ScriptedRunner::default()));
    let id = engine.submit_cron(job("report", 1)).await.unwrap();
    let first = engine.trigger("report").await.unwrap();

    let changed = engine
      .suspend_or_resume_cron(id, ModifyCron { spec: Some("0 30 4 * * *".into()), suspended: false })
      .await
      .unwrap();
    assert!(changed);
    assert!(first.registration().is_suspended());
    assert_eq!(registry.len().await, 1);
    assert_eq!(engine.cron_status("report").await.unwrap().job.spec, "0 30 4 * * *");

    let same = engine
      .suspend_or_resume_cron(id, ModifyCron { spec: None, suspended: false })
      .await
      .unwrap();
    assert!(!same);

    engine.delete_cron(id).await.unwrap();
    assert!(registry.is_empty().await);
    assert!(crons.list_all().await.unwrap().is_empty());
    assert!(matches!(engine.get_cron(id).await, Err(EngineError::NotFound("cron"))));
    assert!(matches!(engine.list_crons().await, Err(EngineError::Empty(_))));
  }

  #[tokio::test]
  async fn rehydrate_skips_suspended_jobs() {
    let (crons, registry, engine) = engine(Arc::new(ScriptedRunner::default()));
    crons.put(&mut job("live", 1)).await.unwrap();
    let mut paused = job("paused", 1);
    paused.suspended = true;
    crons.put(&mut paused).await.unwrap();

    engine.rehydrate().await.unwrap();
    assert_eq!(registry.len().await, 1);
    assert!(engine.trigger("live").await.is_some());
    assert!(engine.trigger("paused").await.is_none());
  }

  #[tokio::test]
  async fn shell_runner_reports_exit_status() {
    let runner = ProcessRunner::new();
    let mut ok = job("echo", 1);
    ok.cmd = vec!["echo".into(), "hello".into()];
    assert_eq!(runner.attempt(&ok).await.unwrap().trim(), "hello");

    let mut failing = job("false", 1);
    failing.cmd = vec!["false".into()];
    assert!(runner.attempt(&failing).await.is_err());
  }

  #[tokio::test]
  async fn http_runner_reports_status_and_length() {
    use warp::Filter;
    let route = warp::path("health").map(|| "pong");
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    let server = tokio::spawn(server);

    let mut probe = job("probe", 1);
    probe.kind = CronKind::Http;
    probe.url = format!("http://{addr}/health");
    let output = ProcessRunner::new().attempt(&probe).await.unwrap();
    assert_eq!(output, "Status code: 200, len(response): 4");
    server.abort();
  }
}
