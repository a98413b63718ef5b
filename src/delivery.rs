//! Outbound mail delivery with bounded parallelism.
//!
//! Messages pass through an intake queue, get their sender resolved, and are
//! then handed to concurrently running delivery tasks capped by a semaphore.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult, StoreError};
use crate::models::{OutboundMessage, SenderConfig};
use crate::store::{IndexField, Store};

#[derive(Debug, Error)]
pub enum DeliveryError {
  #[error("no recipients")]
  NoRecipients,

  #[error("invalid address: {0}")]
  Address(#[from] lettre::address::AddressError),

  #[error("message build failed: {0}")]
  Build(String),

  #[error("smtp error: {0}")]
  Transport(#[from] lettre::transport::smtp::Error),
}

#[async_trait]
pub trait Sender: Send + Sync {
  async fn send(&self, subject: &str, content: &str, tos: &[String]) -> Result<(), DeliveryError>;
}

/// Builds senders for messages that carry their own relay settings.
pub trait SenderFactory: Send + Sync {
  fn sender(&self, config: &SenderConfig) -> Arc<dyn Sender>;
}

pub struct SmtpSender {
  transport: AsyncSmtpTransport<Tokio1Executor>,
  from_address: String,
  from_alias: String,
}

impl SmtpSender {
  pub fn new(config: &SenderConfig) -> Self {
    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host).port(config.port);
    if !config.username.is_empty() {
      builder = builder.credentials(Credentials::new(config.username.clone(), config.password.clone()));
    }
    Self {
      transport: builder.build(),
      from_address: config.username.clone(),
      from_alias: config.from_alias.clone(),
    }
  }

  fn message(&self, subject: &str, content: &str, tos: &[String]) -> Result<Message, DeliveryError> {
    if tos.is_empty() {
      return Err(DeliveryError::NoRecipients);
    }
    let alias = (!self.from_alias.is_empty()).then(|| self.from_alias.clone());
    let mut builder = Message::builder()
      .from(Mailbox::new(alias, self.from_address.parse()?))
      .subject(subject)
      .header(ContentType::TEXT_HTML);
    for to in tos {
      builder = builder.to(to.parse()?);
    }
    builder
      .body(content.to_string())
      .map_err(|e| DeliveryError::Build(e.to_string()))
  }
}

#[async_trait]
impl Sender for SmtpSender {
  async fn send(&self, subject: &str, content: &str, tos: &[String]) -> Result<(), DeliveryError> {
    let message = self.message(subject, content, tos)?;
    self.transport.send(message).await?;
    Ok(())
  }
}

pub struct SmtpSenderFactory;

impl SenderFactory for SmtpSenderFactory {
  fn sender(&self, config: &SenderConfig) -> Arc<dyn Sender> {
    Arc::new(SmtpSender::new(config))
  }
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryOptions {
  pub max_retry: u32,
  pub concurrency: usize,
  pub queue_size: usize,
}

impl Default for DeliveryOptions {
  fn default() -> Self {
    Self {
      max_retry: 3,
      concurrency: 128,
      queue_size: 256,
    }
  }
}

struct Prepared {
  message: OutboundMessage,
  sender: Arc<dyn Sender>,
}

pub struct DeliveryPipeline {
  intake: mpsc::Sender<OutboundMessage>,
  messages: Arc<dyn Store<OutboundMessage>>,
  workers: Vec<JoinHandle<()>>,
}

impl DeliveryPipeline {
  pub fn start(
    messages: Arc<dyn Store<OutboundMessage>>,
    default_sender: Arc<dyn Sender>,
    factory: Arc<dyn SenderFactory>,
    options: DeliveryOptions,
  ) -> Self {
    let (intake, incoming) = mpsc::channel(options.queue_size.max(1));
    let (ready, processing) = mpsc::channel(options.queue_size.max(1));
    let pickup = tokio::spawn(pickup(incoming, ready, default_sender, factory));
    let sending = tokio::spawn(send_queue(processing, Arc::clone(&messages), options));
    Self {
      intake,
      messages,
      workers: vec![pickup, sending],
    }
  }

  /// Accepts a message for delivery and returns its tracking UUID.
  pub async fn submit_message(&self, mut message: OutboundMessage, from_user_id: u64) -> EngineResult<Uuid> {
    if message.recipients().is_empty() {
      return Err(EngineError::Validation("message has no recipients".into()));
    }
    if message.uuid.is_nil() {
      message.uuid = Uuid::new_v4();
    }
    message.from_user_id = from_user_id;
    message.created = Utc::now();
    message.done = None;
    message.error = None;
    let uuid = message.uuid;
    self.intake.send(message).await.map_err(|_| EngineError::QueueClosed)?;
    Ok(uuid)
  }

  /// Delivery record, present once the delivery attempt has finished.
  pub async fn message(&self, uuid: Uuid) -> EngineResult<OutboundMessage> {
    match self.messages.list_by_field(IndexField::Uuid, &uuid.to_string()).await {
      Ok(found) => found.into_iter().next().ok_or(EngineError::NotFound("message")),
      Err(StoreError::Empty(_)) => Err(EngineError::NotFound("message")),
      Err(e) => Err(e.into()),
    }
  }

  pub fn shutdown(&self) {
    for worker in &self.workers {
      worker.abort();
    }
  }
}

async fn pickup(
  mut incoming: mpsc::Receiver<OutboundMessage>,
  ready: mpsc::Sender<Prepared>,
  default_sender: Arc<dyn Sender>,
  factory: Arc<dyn SenderFactory>,
) {
  while let Some(mut message) = incoming.recv().await {
    let sender = match message.sender.take() {
      Some(config) => factory.sender(&config),
      None => Arc::clone(&default_sender),
    };
    if ready.send(Prepared { message, sender }).await.is_err() {
      break;
    }
  }
}

async fn send_queue(
  mut processing: mpsc::Receiver<Prepared>,
  messages: Arc<dyn Store<OutboundMessage>>,
  options: DeliveryOptions,
) {
  let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
  while let Some(prepared) = processing.recv().await {
    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
      break;
    };
    let messages = Arc::clone(&messages);
    tokio::spawn(async move {
      deliver(prepared, messages.as_ref(), options.max_retry).await;
      drop(permit);
    });
  }
}

async fn deliver(prepared: Prepared, messages: &dyn Store<OutboundMessage>, max_retry: u32) {
  let Prepared { mut message, sender } = prepared;
  let tos = message.recipients();
  let mut last_error = None;
  for attempt in 1..=max_retry.max(1) {
    match sender.send(&message.subject, &message.content, &tos).await {
      Ok(()) => {
        last_error = None;
        break;
      }
      Err(e) => {
        warn!(uuid = %message.uuid, attempt, error = %e, "Delivery attempt failed");
        last_error = Some(e.to_string());
      }
    }
  }
  match last_error {
    None => {
      message.done = Some(Utc::now());
      info!(uuid = %message.uuid, recipients = tos.len(), "Message delivered");
    }
    Some(e) => {
      error!(uuid = %message.uuid, error = %e, "Message delivery failed");
      message.error = Some(e);
    }
  }
  if let Err(e) = messages.put(&mut message).await {
    error!(uuid = %message.uuid, error = %e, "Failed to persist delivery record");
  }
}
