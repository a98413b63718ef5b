use std::sync::Arc;

use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{MsgResponse, caller, reject, with_engine};
use crate::engine::Engine;
use crate::models::OutboundMessage;

pub fn mailer_routes(engine: Arc<Engine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let submit = warp::path!("mailer")
    .and(warp::put())
    .and(caller())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_submit_message);

  let detail = warp::path!("mailer" / Uuid)
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_get_message);

  submit.or(detail)
}

async fn handle_submit_message(
  from_user_id: u64,
  message: OutboundMessage,
  engine: Arc<Engine>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let uuid = engine.mailer().submit_message(message, from_user_id).await.map_err(reject)?;
  Ok(warp::reply::with_status(
    warp::reply::json(&MsgResponse::new(format!("Check `/mailer/{uuid}` for detail later"))),
    StatusCode::CREATED,
  ))
}

async fn handle_get_message(uuid: Uuid, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let message = engine.mailer().message(uuid).await.map_err(reject)?;
  Ok(warp::reply::json(&message))
}
