//! Single-worker execution pipeline.
//!
//! Tasks are drained from a bounded queue in arrival order and fanned out to
//! their hosts one at a time. A full queue blocks producers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::cache::{CacheValue, Namespace, SharedCache};
use crate::error::{EngineError, StoreError};
use crate::models::{ExecutionEvent, Host, HostOutcome, Stage, Task};
use crate::ssh::{ClientOptions, Connector, RemoteClient};
use crate::store::{Store, host_by_name};

/// Producer side of the execution queue.
#[derive(Clone)]
pub struct ExecutionQueue {
  tx: mpsc::Sender<Task>,
}

impl ExecutionQueue {
  /// Enqueues `task`, waiting while the queue is full.
  pub async fn push(&self, task: Task) -> Result<(), EngineError> {
    self.tx.send(task).await.map_err(|_| EngineError::QueueClosed)
  }
}

pub fn execution_queue(capacity: usize) -> (ExecutionQueue, mpsc::Receiver<Task>) {
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (ExecutionQueue { tx }, rx)
}

pub struct ExecutionPipeline {
  tasks: Arc<dyn Store<Task>>,
  hosts: Arc<dyn Store<Host>>,
  cache: SharedCache,
  connector: Arc<dyn Connector>,
  options: ClientOptions,
}

impl ExecutionPipeline {
  pub fn new(
    tasks: Arc<dyn Store<Task>>,
    hosts: Arc<dyn Store<Host>>,
    cache: SharedCache,
    connector: Arc<dyn Connector>,
    options: ClientOptions,
  ) -> Self {
    Self {
      tasks,
      hosts,
      cache,
      connector,
      options,
    }
  }

  pub fn spawn(self, mut incoming: mpsc::Receiver<Task>) -> JoinHandle<()> {
    tokio::spawn(async move {
      while let Some(task) = incoming.recv().await {
        self.execute(task).await;
      }
      info!("Execution queue closed, worker exiting");
    })
  }

  /// Runs `task` on every target host, persists completion and publishes the
  /// resulting event under the task's UUID.
  pub async fn execute(&self, task: Task) -> ExecutionEvent {
    info!(task = %task.name, uuid = %task.uuid, hosts = task.hosts.len(), "Starting task");
    let stages = task.stages();
    let mut result = BTreeMap::new();
    for name in &task.hosts {
      let outcome = self.run_on_host(name, &stages).await;
      if !outcome.is_success() {
        warn!(task = %task.name, host = %name, outcome = %outcome, "Host did not complete");
      }
      result.insert(name.clone(), outcome);
    }

    let done = Utc::now();
    self.mark_done(&task, done).await;

    let event = ExecutionEvent {
      task_id: task.id,
      task_uuid: task.uuid,
      task_name: task.name.clone(),
      done,
      result,
    };
    self
      .cache
      .set(
        Namespace::Event.key(task.uuid),
        CacheValue::Event(Arc::new(event.clone())),
        Duration::ZERO,
      )
      .await;
    info!(task = %task.name, uuid = %task.uuid, "Task finished");
    event
  }

  async fn run_on_host(&self, name: &str, stages: &[Stage]) -> HostOutcome {
    let host = match host_by_name(self.hosts.as_ref(), name).await {
      Ok(host) => host,
      Err(StoreError::NotFound) => return HostOutcome::NotFound,
      Err(e) => {
        error!(host = %name, error = %e, "Host lookup failed");
        return HostOutcome::Failed {
          error: format!("host lookup failed: {e}"),
        };
      }
    };
    if !host.is_active {
      return HostOutcome::Inactive;
    }

    let mut client = RemoteClient::new(host, Arc::clone(&self.connector), self.options);
    let outcome = match client.connect().await {
      Ok(()) => HostOutcome::Finished(client.run(stages).await),
      Err(e) => HostOutcome::Failed { error: e.to_string() },
    };
    client.cleanup().await;
    outcome
  }

  // Re-reads the record so only `done` is written back.
  async fn mark_done(&self, task: &Task, done: chrono::DateTime<Utc>) {
    let mut stored = match self.tasks.get(task.id).await {
      Ok(stored) => stored,
      Err(StoreError::NotFound) => {
        warn!(task = %task.name, id = task.id, "Task record vanished before completion");
        return;
      }
      Err(e) => {
        error!(task = %task.name, error = %e, "Failed to load task for completion");
        return;
      }
    };
    stored.done = Some(done);
    if let Err(e) = self.tasks.update(stored.id, &stored).await {
      error!(task = %task.name, error = %e, "Failed to persist task completion");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::TtlCache;
  use crate::ssh::testing::{FakeConnector, Reply, host};
  use crate::store::MemoryStore;
  use uuid::Uuid;

  fn task(hosts: &[&str]) -> Task {
    Task {
      id: 0,
      name: "uptime.2024-01-01|00:00:00".into(),
      uuid: Uuid::new_v4(),
      owner_id: 1,
      pre_script: None,
      command: vec![Stage::new("Command", "uptime")],
      post_script: None,
      created: Utc::now(),
      done: None,
      spec: String::new(),
      comment: String::new(),
      required_approval: false,
      suspended: false,
      hosts: hosts.iter().map(|h| h.to_string()).collect(),
    }
  }

  struct Fixture {
    tasks: Arc<MemoryStore<Task>>,
    cache: SharedCache,
    pipeline: ExecutionPipeline,
  }

  async fn fixture(connector: FakeConnector) -> Fixture {
    let tasks = Arc::new(MemoryStore::<Task>::new());
    let hosts = Arc::new(MemoryStore::<Host>::new());
    hosts.put(&mut host("active")).await.unwrap();
    let mut inactive = host("inactive");
    inactive.is_active = false;
    hosts.put(&mut inactive).await.unwrap();
    hosts.put(&mut host("unreachable")).await.unwrap();

    let cache: SharedCache = Arc::new(TtlCache::default());
    let options = ClientOptions {
      connect_retries: 1,
      ..ClientOptions::default()
    };
    let pipeline = ExecutionPipeline::new(
      tasks.clone(),
      hosts,
      Arc::clone(&cache),
      Arc::new(connector),
      options,
    );
    Fixture { tasks, cache, pipeline }
  }

  #[tokio::test]
  async fn inactive_host_is_skipped_and_others_run() {
    let f = fixture(FakeConnector::new().reply("uptime", Reply::ok("up"))).await;
    let mut t = task(&["inactive", "active"]);
    f.tasks.put(&mut t).await.unwrap();

    let event = f.pipeline.execute(t.clone()).await;
    assert!(matches!(event.result["inactive"], HostOutcome::Inactive));
    assert!(event.result["active"].is_success());
    assert_eq!(event.result["active"].to_string(), "Stage: complete, all stdout: up");
    assert!(f.tasks.get(t.id).await.unwrap().done.is_some());
  }

  #[tokio::test]
  async fn host_failures_do_not_abort_fan_out() {
    let f = fixture(FakeConnector::new().unreachable("unreachable")).await;
    let mut t = task(&["ghost", "unreachable", "active"]);
    f.tasks.put(&mut t).await.unwrap();

    let event = f.pipeline.execute(t).await;
    assert!(matches!(event.result["ghost"], HostOutcome::NotFound));
    assert_eq!(event.result["ghost"].to_string(), "Host not found");
    assert!(matches!(&event.result["unreachable"], HostOutcome::Failed { error } if error.contains("refused")));
    assert!(event.result["active"].is_success());
  }

  #[tokio::test]
  async fn event_is_published_under_task_uuid() {
    let f = fixture(FakeConnector::new()).await;
    let mut t = task(&["active"]);
    f.tasks.put(&mut t).await.unwrap();
    f.pipeline.execute(t.clone()).await;

    match f.cache.get(&Namespace::Event.key(t.uuid)).await {
      Some(CacheValue::Event(event)) => assert_eq!(event.task_id, t.id),
      _ => panic!("event missing from cache"),
    }
  }

  #[tokio::test]
  async fn worker_drains_in_arrival_order() {
    let connector = FakeConnector::new();
    let f = fixture(connector).await;
    let (queue, rx) = execution_queue(4);
    let mut uuids = vec![];
    for _ in 0..3 {
      let mut t = task(&["active"]);
      f.tasks.put(&mut t).await.unwrap();
      uuids.push(t.uuid);
      queue.push(t).await.unwrap();
    }
    drop(queue);
    let cache = Arc::clone(&f.cache);
    f.pipeline.spawn(rx).await.unwrap();

    let mut done = vec![];
    for uuid in &uuids {
      match cache.get(&Namespace::Event.key(uuid)).await {
        Some(CacheValue::Event(event)) => done.push(event.done),
        _ => panic!("missing event"),
      }
    }
    assert!(done.windows(2).all(|w| w[0] <= w[1]));
  }

  #[tokio::test(start_paused = true)]
  async fn full_queue_blocks_producer() {
    let (queue, _rx) = execution_queue(1);
    queue.push(task(&[])).await.unwrap();
    let blocked = tokio::time::timeout(Duration::from_secs(1), queue.push(task(&[]))).await;
    assert!(blocked.is_err());
  }

  #[tokio::test]
  async fn closed_queue_reports_error() {
    let (queue, rx) = execution_queue(1);
    drop(rx);
    assert!(matches!(queue.push(task(&[])).await, Err(EngineError::QueueClosed)));
  }
}
