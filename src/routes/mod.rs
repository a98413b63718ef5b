use std::convert::Infallible;
use std::sync::Arc;

use serde::Serialize;
use tracing::error;
use warp::Filter;
use warp::http::StatusCode;

use crate::engine::Engine;
use crate::error::EngineError;

pub mod crons;
pub mod mailer;
pub mod sse;
pub mod tasks;

#[derive(Serialize)]
pub struct MsgResponse {
  pub msg: String,
}

impl MsgResponse {
  pub fn new(msg: impl Into<String>) -> Self {
    Self { msg: msg.into() }
  }
}

#[derive(Debug)]
pub struct ApiError(pub EngineError);
impl warp::reject::Reject for ApiError {}

pub fn reject(err: EngineError) -> warp::Rejection {
  warp::reject::custom(ApiError(err))
}

pub fn routes(engine: Arc<Engine>) -> impl Filter<Extract = impl warp::Reply, Error = Infallible> + Clone {
  tasks::task_routes(engine.clone())
    .or(sse::event_stream_route(engine.clone()))
    .or(crons::cron_routes(engine.clone()))
    .or(mailer::mailer_routes(engine))
    .recover(handle_rejection)
}

fn with_engine(engine: Arc<Engine>) -> impl Filter<Extract = (Arc<Engine>,), Error = Infallible> + Clone {
  warp::any().map(move || engine.clone())
}

/// Caller identity set by the auth layer in front of the service.
fn caller() -> impl Filter<Extract = (u64,), Error = warp::Rejection> + Clone {
  warp::header::optional::<u64>("x-user-id").map(|id: Option<u64>| id.unwrap_or_default())
}

fn status_of(err: &EngineError) -> StatusCode {
  match err {
    EngineError::Validation(_) => StatusCode::BAD_REQUEST,
    EngineError::NotFound(_) | EngineError::Empty(_) => StatusCode::NOT_FOUND,
    EngineError::Conflict(_) => StatusCode::CONFLICT,
    EngineError::Persistence(_) | EngineError::QueueClosed => StatusCode::INTERNAL_SERVER_ERROR,
  }
}

#[derive(Serialize)]
struct ErrorResponse {
  error: String,
}

async fn handle_rejection(err: warp::Rejection) -> Result<impl warp::Reply, Infallible> {
  let (code, message) = if let Some(ApiError(e)) = err.find::<ApiError>() {
    let code = status_of(e);
    if code == StatusCode::INTERNAL_SERVER_ERROR {
      error!(error = %e, "Request failed");
    }
    (code, e.to_string())
  } else if err.is_not_found() {
    (StatusCode::NOT_FOUND, "route not found".to_string())
  } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidHeader>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
    (StatusCode::BAD_REQUEST, e.to_string())
  } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
    (StatusCode::METHOD_NOT_ALLOWED, "method not allowed".to_string())
  } else {
    error!(rejection = ?err, "Unhandled rejection");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
  };
  Ok(warp::reply::with_status(warp::reply::json(&ErrorResponse { error: message }), code))
}
