//! Approval, cron and immediate lifecycle of tasks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheValue, Namespace, SharedCache};
use crate::cron_registry::{CronRegistry, Registration, parse_schedule};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::models::{ExecutionEvent, Task};
use crate::module::ModuleRegistry;
use crate::pipeline::ExecutionQueue;
use crate::store::{Entity, Store};

/// Live cron registration of a scheduled task.
pub struct TaskTrigger {
  registration: Registration,
  task: Task,
}

impl TaskTrigger {
  pub fn registration(&self) -> &Registration {
    &self.registration
  }

  pub fn task(&self) -> &Task {
    &self.task
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitTask {
  pub name: String,
  pub module: String,
  #[serde(default)]
  pub data: serde_json::Value,
  #[serde(default)]
  pub pre_script: Option<String>,
  #[serde(default)]
  pub post_script: Option<String>,
  #[serde(default)]
  pub spec: String,
  #[serde(default)]
  pub comment: String,
  #[serde(default)]
  pub required_approval: bool,
  #[serde(default)]
  pub hosts: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModifyTask {
  #[serde(default)]
  pub spec: Option<String>,
  #[serde(default)]
  pub suspended: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
  #[serde(default)]
  pub required_approval: bool,
  #[serde(default)]
  pub unfinished: bool,
  #[serde(default)]
  pub scheduled: bool,
  #[serde(default)]
  pub owner_id: Option<u64>,
}

impl TaskFilter {
  fn matches(&self, task: &Task) -> bool {
    (!self.required_approval || task.required_approval)
      && (!self.unfinished || !task.is_finished())
      && (!self.scheduled || task.is_scheduled())
      && self.owner_id.is_none_or(|owner| task.owner_id == owner)
  }
}

/// Where an accepted task went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "uuid", rename_all = "snake_case")]
pub enum Submission {
  AwaitingApproval(Uuid),
  Scheduled(Uuid),
  Queued(Uuid),
}

impl Submission {
  pub fn uuid(&self) -> Uuid {
    match *self {
      Submission::AwaitingApproval(uuid) | Submission::Scheduled(uuid) | Submission::Queued(uuid) => uuid,
    }
  }
}

fn validate_spec(spec: &str) -> EngineResult<()> {
  if spec.is_empty() {
    return Ok(());
  }
  parse_schedule(spec).map(drop).map_err(EngineError::Validation)
}

pub struct TaskScheduler {
  tasks: Arc<dyn Store<Task>>,
  cache: SharedCache,
  registry: Arc<CronRegistry>,
  queue: ExecutionQueue,
  modules: Arc<ModuleRegistry>,
  registering: Mutex<()>,
}

impl TaskScheduler {
  pub fn new(
    tasks: Arc<dyn Store<Task>>,
    cache: SharedCache,
    registry: Arc<CronRegistry>,
    queue: ExecutionQueue,
    modules: Arc<ModuleRegistry>,
  ) -> Self {
    Self {
      tasks,
      cache,
      registry,
      queue,
      modules,
      registering: Mutex::new(()),
    }
  }

  /// Restores approval-pending tasks into the cache and re-registers every
  /// live scheduled task.
  pub async fn rehydrate(&self) -> EngineResult<()> {
    let tasks = self.tasks.list_all().await?;
    let (mut staged, mut registered) = (0, 0);
    for task in tasks {
      if task.required_approval && !task.is_finished() {
        self.stage(task).await;
        staged += 1;
      } else if task.is_scheduled() && !task.suspended {
        let name = task.name.clone();
        match self.register(task).await {
          Ok(()) => registered += 1,
          Err(e) => warn!(task = %name, error = %e, "Skipping stored task with unusable schedule"),
        }
      }
    }
    info!(staged, registered, "Tasks restored from store");
    Ok(())
  }

  pub async fn submit(&self, req: SubmitTask, owner_id: u64) -> EngineResult<Submission> {
    validate_spec(&req.spec)?;
    let command = self.modules.build(&req.module, req.data)?;
    let now = Utc::now();
    let mut task = Task {
      id: 0,
      name: format!("{}{}", req.name, now.format(".%Y-%m-%d|%H:%M:%S")),
      uuid: Uuid::new_v4(),
      owner_id,
      pre_script: req.pre_script,
      command,
      post_script: req.post_script,
      created: now,
      done: None,
      spec: req.spec,
      comment: req.comment,
      required_approval: req.required_approval,
      suspended: false,
      hosts: req.hosts,
    };
    self.tasks.put(&mut task).await?;
    info!(task = %task.name, uuid = %task.uuid, owner_id, "Task accepted");

    if task.required_approval {
      let uuid = task.uuid;
      self.stage(task).await;
      return Ok(Submission::AwaitingApproval(uuid));
    }
    self.dispatch(task).await
  }

  /// Releases an approval-gated task. A second activation finds nothing.
  pub async fn activate(&self, uuid: Uuid) -> EngineResult<Submission> {
    let Some(CacheValue::PendingTask(task)) = self.cache.take(&Namespace::Task.key(uuid)).await else {
      return Err(EngineError::NotFound("task"));
    };
    info!(task = %task.name, %uuid, "Task activated");
    self.dispatch(*task).await
  }

  /// Replaces any live trigger for the task's name with one for `task`.
  /// A suspended task only retires the old trigger.
  pub async fn register(&self, task: Task) -> EngineResult<()> {
    let schedule = parse_schedule(&task.spec).map_err(EngineError::Validation)?;
    let key = Namespace::Task.key(&task.name);
    let _guard = self.registering.lock().await;

    if let Some(CacheValue::TaskTrigger(previous)) = self.cache.get(&key).await {
      previous.registration.retire(&self.registry).await;
      self.cache.delete(&key).await;
      info!(task = %task.name, "Retired previous trigger");
    }
    if task.suspended {
      info!(task = %task.name, "Task suspended, not registering");
      return Ok(());
    }

    let queue = self.queue.clone();
    let fired = task.clone();
    let registration = self
      .registry
      .register(schedule, move || {
        let queue = queue.clone();
        let task = fired.clone();
        async move {
          let name = task.name.clone();
          if let Err(e) = queue.push(task).await {
            error!(task = %name, error = %e, "Scheduled task could not be enqueued");
          }
        }
      })
      .await;
    info!(task = %task.name, spec = %task.spec, entry = registration.entry(), "Task scheduled");
    let trigger = TaskTrigger { registration, task };
    self
      .cache
      .set(key, CacheValue::TaskTrigger(Arc::new(trigger)), Duration::ZERO)
      .await;
    Ok(())
  }

  /// Updates the schedule and suspended flag. Returns `false` when nothing
  /// changed.
  pub async fn modify_task(&self, id: u64, req: ModifyTask) -> EngineResult<bool> {
    let spec = req.spec.filter(|s| !s.is_empty());
    if let Some(spec) = &spec {
      validate_spec(spec)?;
    }
    let mut task = self.get_task(id).await?;
    let new_spec = spec.unwrap_or_else(|| task.spec.clone());
    if new_spec == task.spec && req.suspended == task.suspended {
      return Ok(false);
    }
    task.spec = new_spec;
    task.suspended = req.suspended;
    self.tasks.update(task.id, &task).await?;
    info!(task = %task.name, spec = %task.spec, suspended = task.suspended, "Task modified");

    let pending = Namespace::Task.key(task.uuid);
    if self.cache.has(&pending).await {
      // still awaiting approval: refresh the staged copy only
      self.stage(task).await;
    } else if task.is_scheduled() {
      self.register(task).await?;
    }
    Ok(true)
  }

  pub async fn get_task(&self, id: u64) -> EngineResult<Task> {
    match self.tasks.get(id).await {
      Ok(task) => Ok(task),
      Err(StoreError::NotFound) => Err(EngineError::NotFound("task")),
      Err(e) => Err(e.into()),
    }
  }

  pub async fn list_tasks(&self, filter: &TaskFilter) -> EngineResult<Vec<Task>> {
    let tasks: Vec<Task> = self
      .tasks
      .list_all()
      .await?
      .into_iter()
      .filter(|t| filter.matches(t))
      .collect();
    if tasks.is_empty() {
      return Err(StoreError::Empty(Task::BUCKET).into());
    }
    Ok(tasks)
  }

  pub async fn get_event(&self, uuid: Uuid) -> EngineResult<Arc<ExecutionEvent>> {
    match self.cache.get(&Namespace::Event.key(uuid)).await {
      Some(CacheValue::Event(event)) => Ok(event),
      _ => Err(EngineError::NotFound("event")),
    }
  }

  pub async fn trigger(&self, name: &str) -> Option<Arc<TaskTrigger>> {
    match self.cache.get(&Namespace::Task.key(name)).await {
      Some(CacheValue::TaskTrigger(trigger)) => Some(trigger),
      _ => None,
    }
  }

  async fn stage(&self, task: Task) {
    let key = Namespace::Task.key(task.uuid);
    self.cache.set(key, CacheValue::PendingTask(Box::new(task)), Duration::ZERO).await;
  }

  async fn dispatch(&self, task: Task) -> EngineResult<Submission> {
    let uuid = task.uuid;
    if task.is_scheduled() {
      self.register(task).await?;
      Ok(Submission::Scheduled(uuid))
    } else {
      self.queue.push(task).await?;
      Ok(Submission::Queued(uuid))
    }
  }
}
