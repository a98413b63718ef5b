use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("object not found")]
  NotFound,

  #[error("not any {0} yet")]
  Empty(&'static str),

  #[error("serialization failed: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),
}

/// Outcomes the engine reports back to the request layer.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("{0}")]
  Validation(String),

  #[error("{0} not found")]
  NotFound(&'static str),

  #[error("{0}")]
  Empty(String),

  #[error("{0} already exists")]
  Conflict(String),

  #[error("persistence failure: {0}")]
  Persistence(StoreError),

  #[error("execution queue closed")]
  QueueClosed,
}

impl From<StoreError> for EngineError {
  fn from(err: StoreError) -> Self {
    match err {
      StoreError::Empty(what) => EngineError::Empty(format!("not any {what} yet")),
      other => EngineError::Persistence(other),
    }
  }
}

impl From<crate::module::ModuleError> for EngineError {
  fn from(err: crate::module::ModuleError) -> Self {
    EngineError::Validation(err.to_string())
  }
}

pub type EngineResult<T> = Result<T, EngineError>;
