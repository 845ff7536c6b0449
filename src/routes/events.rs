use actix_web::{http::header, web, HttpResponse, Result};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::broadcast::{self, QueueSnapshot};
use crate::state::AppState;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/businesses/{id}/events").route(web::get().to(stream_snapshots)),
    );
}

/// SSE stream of queue snapshots for one business. Connecting subscribes the
/// observer; dropping the connection unsubscribes it. The first event is the
/// current snapshot so new observers never start blank.
async fn stream_snapshots(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse> {
    let business_id = path.into_inner();

    let initial = broadcast::build_snapshot(&state.db, &business_id)
        .await
        .map_err(actix_web::Error::from)?;
    let rx = state.fanout.subscribe(&business_id);

    let live = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(snapshot) => Some(Ok::<web::Bytes, actix_web::Error>(snapshot_to_bytes(&snapshot))),
        // A lagged observer just skips ahead to the next snapshot.
        Err(_) => None,
    });
    let stream = tokio_stream::once(Ok::<web::Bytes, actix_web::Error>(snapshot_to_bytes(
        &initial,
    )))
    .chain(live);

    Ok(HttpResponse::Ok()
        .insert_header((header::CONTENT_TYPE, "text/event-stream"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .streaming(stream))
}

fn snapshot_to_bytes(snapshot: &QueueSnapshot) -> web::Bytes {
    let payload = serde_json::to_string(snapshot).unwrap_or_else(|_| "{}".to_string());
    web::Bytes::from(format!("event: queue\ndata: {}\n\n", payload))
}
