//! Wires the cache, dispatcher, pipelines and schedulers into one instance.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::cache::{SharedCache, TtlCache};
use crate::config::Config;
use crate::cron_jobs::{CronEngine, JobRunner, ProcessRunner};
use crate::cron_registry::CronRegistry;
use crate::delivery::{DeliveryPipeline, Sender, SenderFactory, SmtpSender, SmtpSenderFactory};
use crate::error::EngineResult;
use crate::models::{CronJob, Host, OutboundMessage, Task};
use crate::module::ModuleRegistry;
use crate::pipeline::{ExecutionPipeline, execution_queue};
use crate::scheduler::TaskScheduler;
use crate::ssh::{Connector, SshConnector};
use crate::store::{MemoryStore, Store};

/// External collaborators the engine is built on.
pub struct Collaborators {
  pub tasks: Arc<dyn Store<Task>>,
  pub crons: Arc<dyn Store<CronJob>>,
  pub hosts: Arc<dyn Store<Host>>,
  pub messages: Arc<dyn Store<OutboundMessage>>,
  pub connector: Arc<dyn Connector>,
  pub runner: Arc<dyn JobRunner>,
  pub default_sender: Arc<dyn Sender>,
  pub sender_factory: Arc<dyn SenderFactory>,
  pub modules: ModuleRegistry,
}

impl Collaborators {
  /// Process-local stores with the real SSH, process and SMTP backends.
  pub fn in_memory(config: &Config) -> Self {
    Self {
      tasks: Arc::new(MemoryStore::new()),
      crons: Arc::new(MemoryStore::new()),
      hosts: Arc::new(MemoryStore::new()),
      messages: Arc::new(MemoryStore::new()),
      connector: Arc::new(SshConnector::new()),
      runner: Arc::new(ProcessRunner::new()),
      default_sender: Arc::new(SmtpSender::new(&config.smtp)),
      sender_factory: Arc::new(SmtpSenderFactory),
      modules: ModuleRegistry::with_builtins(),
    }
  }
}

pub struct Engine {
  cache: SharedCache,
  registry: Arc<CronRegistry>,
  tasks: TaskScheduler,
  crons: CronEngine,
  mailer: DeliveryPipeline,
  workers: Vec<JoinHandle<()>>,
}

impl Engine {
  pub async fn start(config: &Config, c: Collaborators) -> EngineResult<Self> {
    let cache: SharedCache = Arc::new(TtlCache::new(config.cache_sweep));
    let sweeper = cache.spawn_sweeper();

    let registry = Arc::new(CronRegistry::new());
    let dispatcher = registry.start();

    let (queue, incoming) = execution_queue(config.queue_size);
    let executor = ExecutionPipeline::new(
      Arc::clone(&c.tasks),
      c.hosts,
      Arc::clone(&cache),
      c.connector,
      config.ssh,
    )
    .spawn(incoming);

    let tasks = TaskScheduler::new(
      c.tasks,
      Arc::clone(&cache),
      Arc::clone(&registry),
      queue,
      Arc::new(c.modules),
    );
    let crons = CronEngine::new(c.crons, Arc::clone(&cache), Arc::clone(&registry), c.runner);
    let mailer = DeliveryPipeline::start(c.messages, c.default_sender, c.sender_factory, config.delivery_options());

    let engine = Self {
      cache,
      registry,
      tasks,
      crons,
      mailer,
      workers: vec![sweeper, dispatcher, executor],
    };
    engine.tasks.rehydrate().await?;
    engine.crons.rehydrate().await?;
    info!(queue_size = config.queue_size, "Engine started");
    Ok(engine)
  }

  pub fn tasks(&self) -> &TaskScheduler {
    &self.tasks
  }

  pub fn crons(&self) -> &CronEngine {
    &self.crons
  }

  pub fn mailer(&self) -> &DeliveryPipeline {
    &self.mailer
  }

  pub fn cache(&self) -> &SharedCache {
    &self.cache
  }

  pub fn registry(&self) -> &Arc<CronRegistry> {
    &self.registry
  }

  /// Stops the background workers. Remote commands already running are only
  /// bounded by their stage timeout.
  pub fn shutdown(&self) {
    for worker in &self.workers {
      worker.abort();
    }
    self.mailer.shutdown();
    info!("Engine stopped");
  }
}
