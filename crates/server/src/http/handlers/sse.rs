use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use domain::SessionSignal;
use futures::stream::Stream;
use serde::Deserialize;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use super::{discussion_id, viewer_id, ApiError};
use crate::state::AppState;

/// `EventSource` cannot set headers, so the viewer may come as a query param.
#[derive(Deserialize)]
pub struct SseQuery {
    pub viewer: Option<String>,
}

fn event_name(signal: &SessionSignal) -> &'static str {
    match signal {
        SessionSignal::TreeChanged { .. } => "tree_changed",
        SessionSignal::PhaseChanged { .. } => "phase_changed",
        SessionSignal::MutationFailed { .. } => "mutation_failed",
        SessionSignal::FetchFailed { .. } => "fetch_failed",
    }
}

pub async fn sse_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let viewer = match query.viewer.filter(|v| !v.trim().is_empty()) {
        Some(v) => v,
        None => viewer_id(&headers)?,
    };
    let discussion = discussion_id(raw_id)?;
    let session = state.sessions.get_or_open(&viewer, &discussion).await;
    let rx = session.subscribe();

    tracing::info!("SSE Connected: viewer={} discussion={}", viewer, discussion);

    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(signal) => Some(
            Event::default()
                .event(event_name(&signal))
                .json_data(&signal)
                .map_err(|e| {
                    tracing::error!("SSE serialization error: {}", e);
                    axum::Error::new(e)
                }),
        ),
        Err(_lagged) => {
            tracing::warn!("SSE Client lagged for {}/{}", viewer, discussion);
            None
        }
    });

    // End the stream with the session so graceful shutdown is not held up.
    let stream = futures::StreamExt::take_until(stream, async move { session.closed().await });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(15))))
}
