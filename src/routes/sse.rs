use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::error;
use uuid::Uuid;
use warp::Filter;

use super::with_engine;
use crate::engine::Engine;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Streams the execution event once the task has finished.
pub fn event_stream_route(engine: Arc<Engine>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / "events" / Uuid / "stream")
    .and(warp::get())
    .and(with_engine(engine))
    .and_then(handle_event_stream)
}

async fn handle_event_stream(uuid: Uuid, engine: Arc<Engine>) -> Result<impl warp::Reply, warp::Rejection> {
  let interval = IntervalStream::new(tokio::time::interval(POLL_INTERVAL));
  let stream = interval
    .then(move |_| {
      let engine = engine.clone();
      async move {
        let event = engine.tasks().get_event(uuid).await.ok()?;
        match warp::sse::Event::default().event("finished").json_data(&*event) {
          Ok(sse) => Some(Ok::<_, Infallible>(sse)),
          Err(e) => {
            error!(%uuid, error = %e, "Failed to encode execution event");
            None
          }
        }
      }
    })
    .filter_map(|x| x)
    .take(1);

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
