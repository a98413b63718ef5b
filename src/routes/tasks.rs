use std::sync::Arc;

use tracing::info;
use uuid::Uuid;
use warp::Filter;
use warp::http::StatusCode;

use super::{MsgResponse, caller, reject, with_engine};
use crate::engine::Engine;
use crate::scheduler::{ModifyTask, SubmitTask, Submission, TaskFilter};

pub fn task_routes(engine: Arc<Engine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  let submit = warp::path!("tasks")
    .and(warp::put())
    .and(caller())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_submit_task);

  let list = warp::path!("tasks")
    .and(warp::get())
    .and(warp::query::<TaskFilter>())
    .and(with_engine(engine.clone()))
    .and_then(handle_list_tasks);

  let detail = warp::path!("tasks" / "detail" / u64)
    .and(warp::get())
    .and(with_engine(engine.clone()))
    .and_then(handle_get_task);

  let modify = warp::path!("tasks" / "detail" / u64)
    .and(warp::post())
    .and(warp::body::json())
    .and(with_engine(engine.clone()))
    .and_then(handle_modify_task);

  let activate = warp::path!("tasks" / "active" / Uuid)
    .and(warp::post())
    .and(with_engine(engine.clone()))
    .and_then(handle_activate_task);

  let event = warp::path!("tasks" / "events" / Uuid)
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_get_event);

  submit.or(list).or(detail).or(modify).or(activate).or(event)
}

fn accepted(submission: Submission) -> MsgResponse {
  match submission {
    Submission::AwaitingApproval(uuid) => {
      MsgResponse::new(format!("Task required approval, check /tasks/active/{uuid}"))
    }
    Submission::Scheduled(uuid) | Submission::Queued(uuid) => {
      MsgResponse::new(format!("Task will execute very soon, check /tasks/events/{uuid} for detail later"))
    }
  }
}

async fn handle_submit_task(
  owner_id: u64,
  req: SubmitTask,
  engine: Arc<Engine>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let submission = engine.tasks().submit(req, owner_id).await.map_err(reject)?;
  info!(uuid = %submission.uuid(), owner_id, "Task submitted over http");
  Ok(warp::reply::with_status(warp::reply::json(&accepted(submission)), StatusCode::CREATED))
}

async fn handle_list_tasks(filter: TaskFilter, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let tasks = engine.tasks().list_tasks(&filter).await.map_err(reject)?;
  Ok(warp::reply::json(&tasks))
}

async fn handle_get_task(id: u64, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let task = engine.tasks().get_task(id).await.map_err(reject)?;
  Ok(warp::reply::json(&task))
}

async fn handle_modify_task(
  id: u64,
  req: ModifyTask,
  engine: Arc<Engine>,
) -> Result<impl warp::Reply, warp::Rejection> {
  let updated = engine.tasks().modify_task(id, req).await.map_err(reject)?;
  let msg = if updated { "Update task success" } else { "No fields updated" };
  Ok(warp::reply::json(&MsgResponse::new(msg)))
}

async fn handle_activate_task(uuid: Uuid, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let submission = engine.tasks().activate(uuid).await.map_err(reject)?;
  Ok(warp::reply::json(&accepted(submission)))
}

async fn handle_get_event(uuid: Uuid, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let event = engine.tasks().get_event(uuid).await.map_err(reject)?;
  Ok(warp::reply::json(&*event))
}
