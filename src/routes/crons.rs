use std::sync::Arc;

use warp::Filter;
use warp::http::StatusCode;

use super::{MsgResponse, reject, with_engine};
use crate::cron_jobs::ModifyCron;
use crate::engine::Engine;
use crate::models::CronJob;

pub fn cron_routes(engine: Arc<Engine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let submit = warp::path!("crons")
    .and(warp::put())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_submit_cron);

  let list = warp::path!("crons")
    .and(warp::get())
    .and(with_engine(engine.clone()))
    .and_then(handle_list_crons);

  let detail = warp::path!("crons" / "detail" / u64)
    .and(warp::get())
    .and(with_engine(engine.clone()))
    .and_then(handle_get_cron);

  let modify = warp::path!("crons" / "detail" / u64)
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_modify_cron);

  let delete = warp::path!("crons" / "detail" / u64)
    .and(warp::delete())
    .and(with_engine(engine.clone()))
    .and_then(handle_delete_cron);

  let status = warp::path!("crons" / "status" / String)
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_cron_status);

  submit.or(list).or(detail).or(modify).or(delete).or(status)
}

async fn handle_submit_cron(job: CronJob, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  engine.crons().submit_cron(job).await.map_err(reject)?;
  Ok(warp::reply::with_status(
    warp::reply::json(&MsgResponse::new("Put cron success")),
    StatusCode::CREATED,
  ))
}

async fn handle_list_crons(engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let jobs = engine.crons().list_crons().await.map_err(reject)?;
  Ok(warp::reply::json(&jobs))
}

async fn handle_get_cron(id: u64, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let job = engine.crons().get_cron(id).await.map_err(reject)?;
  Ok(warp::reply::json(&job))
}

async fn handle_modify_cron(id: u64, req: ModifyCron, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let updated = engine.crons().suspend_or_resume_cron(id, req).await.map_err(reject)?;
  let msg = if updated { "Update cron success" } else { "No fields updated" };
  Ok(warp::reply::json(&MsgResponse::new(msg)))
}

async fn handle_delete_cron(id: u64, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  engine.crons().delete_cron(id).await.map_err(reject)?;
  Ok(warp::reply::json(&MsgResponse::new("Delete cron success")))
}

async fn handle_cron_status(name: String, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let status = engine.crons().cron_status(&name).await.map_err(reject)?;
  Ok(warp::reply::json(&status))
}
