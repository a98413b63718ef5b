use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Fields a record can be looked up by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexField {
  Name,
  Uuid,
  Hostname,
}

impl IndexField {
  /// Key of the field in the serialized record.
  pub fn json_key(self) -> &'static str {
    match self {
      IndexField::Name => "name",
      IndexField::Uuid => "uuid",
      IndexField::Hostname => "hostname",
    }
  }
}

pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
  const BUCKET: &'static str;

  fn id(&self) -> u64;
  fn set_id(&mut self, id: u64);
  fn indexed(&self, field: IndexField) -> Option<String>;
}

#[async_trait]
pub trait Store<E: Entity>: Send + Sync {
  async fn get(&self, id: u64) -> Result<E, StoreError>;
  /// Assigns the next identifier to `record` and stores it.
  async fn put(&self, record: &mut E) -> Result<u64, StoreError>;
  async fn update(&self, id: u64, record: &E) -> Result<(), StoreError>;
  async fn delete(&self, id: u64) -> Result<(), StoreError>;
  async fn list_by_field(&self, field: IndexField, value: &str) -> Result<Vec<E>, StoreError>;
  async fn list_all(&self) -> Result<Vec<E>, StoreError>;
}

/// Resolves a host record by hostname.
pub async fn host_by_name(
  hosts: &dyn Store<crate::models::Host>,
  name: &str,
) -> Result<crate::models::Host, StoreError> {
  match hosts.list_by_field(IndexField::Hostname, name).await {
    Ok(found) => found.into_iter().next().ok_or(StoreError::NotFound),
    Err(StoreError::Empty(_)) => Err(StoreError::NotFound),
    Err(e) => Err(e),
  }
}

pub struct MemoryStore<E> {
  records: RwLock<BTreeMap<u64, E>>,
  sequence: AtomicU64,
}

impl<E> MemoryStore<E> {
  pub fn new() -> Self {
    Self {
      records: RwLock::new(BTreeMap::new()),
      sequence: AtomicU64::new(0),
    }
  }
}

impl<E> Default for MemoryStore<E> {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl<E: Entity> Store<E> for MemoryStore<E> {
  async fn get(&self, id: u64) -> Result<E, StoreError> {
    self.records.read().await.get(&id).cloned().ok_or(StoreError::NotFound)
  }

  async fn put(&self, record: &mut E) -> Result<u64, StoreError> {
    let id = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
    record.set_id(id);
    self.records.write().await.insert(id, record.clone());
    Ok(id)
  }

  async fn update(&self, id: u64, record: &E) -> Result<(), StoreError> {
    self.records.write().await.insert(id, record.clone());
    Ok(())
  }

  async fn delete(&self, id: u64) -> Result<(), StoreError> {
    self.records.write().await.remove(&id);
    Ok(())
  }

  async fn list_by_field(&self, field: IndexField, value: &str) -> Result<Vec<E>, StoreError> {
    let found: Vec<E> = self
      .records
      .read()
      .await
      .values()
      .filter(|r| r.indexed(field).as_deref() == Some(value))
      .cloned()
      .collect();
    if found.is_empty() {
      return Err(StoreError::Empty(E::BUCKET));
    }
    Ok(found)
  }

  async fn list_all(&self) -> Result<Vec<E>, StoreError> {
    Ok(self.records.read().await.values().cloned().collect())
  }
}
