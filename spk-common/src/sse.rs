//! Server-Sent Events (SSE) utilities
//!
//! Every ProgressEvent goes out as one `event: <type>` + `data: <json>` frame.
//! Keepalives are SSE comment frames (`: keepalive`), which carry no `data:` line and
//! therefore never reach a client's JSON parser.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;
use tracing::{debug, warn};

use crate::events::ProgressEvent;

/// Comment text used for keepalive frames
pub const KEEPALIVE_TEXT: &str = "keepalive";

/// Convert a ProgressEvent into an SSE frame
pub fn to_sse_event(event: &ProgressEvent) -> Result<Event, serde_json::Error> {
    let json = serde_json::to_string(event)?;
    Ok(Event::default().event(event.event_type.as_str()).data(json))
}

/// Keepalive configuration shared by all SPK streams
pub fn keep_alive(interval: Duration) -> KeepAlive {
    KeepAlive::new().interval(interval).text(KEEPALIVE_TEXT)
}

/// Wrap a stream of ProgressEvents as an SSE response
///
/// Events that fail to serialize are logged and skipped. The response ends when the
/// source stream ends.
pub fn progress_sse<S>(
    events: S,
    keepalive_interval: Duration,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = ProgressEvent> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut events = Box::pin(events);
        while let Some(event) = events.next().await {
            match to_sse_event(&event) {
                Ok(frame) => {
                    debug!(
                        session_id = %event.session_id,
                        event_type = %event.event_type,
                        "SSE: Sending event"
                    );
                    yield Ok(frame);
                }
                Err(e) => {
                    warn!("SSE: Failed to serialize event {}: {}", event.event_type, e);
                }
            }
        }
    };

    Sse::new(stream).keep_alive(keep_alive(keepalive_interval))
}
