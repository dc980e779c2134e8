//! SSE stream adapter.
//!
//! Drives a streaming HTTP response from a hub subscription. The `start`
//! frame goes out first (the subscription was opened before the subprocess
//! spawned, so nothing can precede it), each downstream event becomes one
//! `event:`/`data:` record, and a `heartbeat` frame keeps proxies alive
//! through quiet periods. The stream ends after the terminal `done` event;
//! a consumer disconnect just drops the subscription without cancelling the
//! reply.

use std::convert::Infallible;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::stream::Stream;
use serde_json::json;
use studio_core::events::ReplyEvent;
use studio_runtime::Subscription;
use tracing::debug;

enum SseState {
    Start {
        conversation_id: String,
        reply_id: String,
        subscription: Subscription,
        heartbeat: Duration,
    },
    Streaming {
        subscription: Subscription,
        heartbeat: Duration,
    },
    Ended,
}

/// Turn one reply event into an SSE frame.
fn frame(event: &ReplyEvent) -> Event {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(event.event_type()).data(data)
}

/// Build the frame stream for one reply.
pub fn reply_stream(
    conversation_id: String,
    reply_id: String,
    subscription: Subscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let initial = SseState::Start {
        conversation_id,
        reply_id,
        subscription,
        heartbeat,
    };

    futures::stream::unfold(initial, |state| async move {
        match state {
            SseState::Start {
                conversation_id,
                reply_id,
                subscription,
                heartbeat,
            } => {
                let start = Event::default().event("start").data(
                    json!({
                        "type": "start",
                        "conversation_id": conversation_id,
                        "reply_id": reply_id,
                    })
                    .to_string(),
                );
                Some((
                    Ok(start),
                    SseState::Streaming {
                        subscription,
                        heartbeat,
                    },
                ))
            }
            SseState::Streaming {
                mut subscription,
                heartbeat,
            } => match tokio::time::timeout(heartbeat, subscription.recv()).await {
                Ok(Some(event)) => {
                    let next = if event.is_terminal() {
                        SseState::Ended
                    } else {
                        SseState::Streaming {
                            subscription,
                            heartbeat,
                        }
                    };
                    Some((Ok(frame(&event)), next))
                }
                // Subscription ended without a terminal event (detached for
                // backpressure, or the channel was pruned): end of stream.
                Ok(None) => {
                    debug!("subscription ended without terminal event");
                    None
                }
                Err(_elapsed) => Some((
                    Ok(frame(&ReplyEvent::Heartbeat)),
                    SseState::Streaming {
                        subscription,
                        heartbeat,
                    },
                )),
            },
            SseState::Ended => None,
        }
    })
}

/// Full SSE response for one reply, with proxy-buffering disabled.
pub fn reply_sse_response(
    conversation_id: String,
    reply_id: String,
    subscription: Subscription,
    heartbeat: Duration,
) -> Response {
    let stream = reply_stream(conversation_id, reply_id, subscription, heartbeat);
    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    let _ = headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let _ = headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}
