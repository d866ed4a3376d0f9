//! Server-Sent Events stream of one job's progress.
//!
//! Keepalives come from the streaming adapter, so the axum `KeepAlive` layer
//! is not used here.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::HeaderMap,
    response::{
        IntoResponse, Response,
        sse::{Event as SseEvent, Sse},
    },
};
use serde_json::json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use reelforge_events::EventId;
use reelforge_observability::stream_span;
use reelforge_streaming::Frame;

use crate::app::dto::EventsQuery;
use crate::app::errors;
use crate::app::services::AppServices;

pub const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// GET /jobs/:id/events
///
/// Replays retained events after the client's cursor, then streams live
/// events until the job reaches a terminal state. The cursor comes from the
/// `Last-Event-ID` header or, failing that, the `lastEventId` query parameter.
pub async fn stream_events(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    let job_id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    if let Err(err) = services.machine.get(job_id) {
        return errors::state_error_to_response(err);
    }

    let raw_cursor = cursor_param(&headers, query);
    let cursor = raw_cursor.as_deref().and_then(parse_cursor);

    let client = CancellationToken::new();
    let opened = stream_span(&job_id, raw_cursor.as_deref())
        .in_scope(|| services.streams.open(job_id, cursor, client.clone()));
    let frames = match opened {
        Ok(frames) => frames,
        Err(err) => return errors::stream_error_to_response(err),
    };

    // Ends the connection as soon as the response body is dropped.
    let disconnect = client.drop_guard();
    let events = frames.map(move |frame| {
        let _ = &disconnect;
        Ok::<_, Infallible>(to_sse_event(&frame))
    });

    Sse::new(events).into_response()
}

/// Header wins over the query parameter; blank values count as absent.
fn cursor_param(headers: &HeaderMap, query: EventsQuery) -> Option<String> {
    headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            query
                .last_event_id
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        })
}

/// An unparsable cursor replays the full history rather than failing.
fn parse_cursor(raw: &str) -> Option<EventId> {
    match raw.parse() {
        Ok(id) => Some(id),
        Err(err) => {
            debug!(cursor = raw, error = %err, "ignoring malformed cursor");
            None
        }
    }
}

fn to_sse_event(frame: &Frame) -> SseEvent {
    if let Some(comment) = frame.comment() {
        return SseEvent::default().comment(comment);
    }

    let mut event = SseEvent::default();
    if let Some(id) = frame.event_id() {
        event = event.id(id.to_string());
    }
    if let Some(name) = frame.event_name() {
        event = event.event(name);
    }
    match frame.data() {
        Ok(Some(data)) => event.data(data),
        Ok(None) => event,
        Err(err) => {
            warn!(error = %err, "dropping unserializable frame");
            SseEvent::default()
                .event("error")
                .data(json!({ "error": "frame serialization failed" }).to_string())
        }
    }
}
