// ABOUTME: Server-Sent Events endpoint streaming live case logs
// ABOUTME: Replays the retained backlog on attach, then follows new records

use crate::handlers::LogEvent;
use crate::AppState;
use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Live log tail for one case: the retained backlog first, then every record
/// as it is appended. Consumers that fall behind the broadcast buffer get a
/// `lagged` event instead of silently missing lines.
pub async fn stream_case_logs(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (backlog, mut live) = state.engine.logs().subscribe(&id).await;
    debug!(
        "Log stream attached for case {} ({} backlog lines)",
        id,
        backlog.len()
    );

    let stream = async_stream::stream! {
        for record in backlog {
            if let Some(event) = to_event(LogEvent::from(record)) {
                yield Ok(event);
            }
        }

        loop {
            match live.recv().await {
                Ok(record) => {
                    if let Some(event) = to_event(LogEvent::from(record)) {
                        yield Ok(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Log stream for {} lagged by {} records", id, skipped);
                    yield Ok(Event::default().event("lagged").data(skipped.to_string()));
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_event(event: LogEvent) -> Option<Event> {
    match Event::default().json_data(&event) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Failed to encode log event: {}", e);
            None
        }
    }
}
