//! WebSocket and server-sent-event routes.
//!
//! Each connection gets its own [`EventStream`]. Lookups happen before the
//! upgrade so an unknown id is a plain 404 rather than a socket that closes
//! straight away.

use std::convert::Infallible;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::Response;
use futures_util::stream::{self, Stream};
use futures_util::{SinkExt, StreamExt};
use protocol::StreamEvent;

use super::{ApiError, AppState};
use crate::stream::EventStream;

/// `GET /session/:id/stream`
pub async fn session_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let session = state.sessions.resolve(&id)?;
    let events = state.streamer.session(session);
    Ok(ws.on_upgrade(move |socket| pump(socket, events)))
}

/// `GET /job/:id/stream`
pub async fn job_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let job = state.jobs.get(&id)?;
    let events = state.streamer.job(job);
    Ok(ws.on_upgrade(move |socket| pump(socket, events)))
}

/// `GET /job/:id/events`
pub async fn job_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let job = state.jobs.get(&id)?;
    let events = state.streamer.job(job);

    let stream = stream::unfold(events, |mut events| async move {
        let event = events.next().await?;
        Some((Ok::<_, Infallible>(sse_event(&event)), events))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    let name = match event {
        StreamEvent::Output { .. } => "output",
        StreamEvent::Lagged { .. } => "lagged",
        StreamEvent::Ended { .. } => "ended",
    };
    match event.to_json() {
        Ok(data) => Event::default().event(name).data(data),
        Err(e) => Event::default().event("error").data(e.to_string()),
    }
}

/// Forwards events as JSON text frames until the stream ends or the client
/// goes away. Dropping `events` detaches from the session or job.
async fn pump(socket: WebSocket, mut events: EventStream) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let end = event.is_end();
                let text = match event.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("Failed to encode stream event: {}", e);
                        continue;
                    }
                };
                if sender.send(Message::Text(text)).await.is_err() || end {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    events.cancel();
    let _ = sender.send(Message::Close(None)).await;
    tracing::debug!("Stream socket closed");
}
