/// Server-sent events stream for live updates
///
/// Frames: one `connected` event, then a `completion` event per processed
/// upload of the session, and a final `closed` event when the hub ends the
/// connection. Comment frames are sent while idle so a dead client surfaces
/// as a write error, which drops the subscription.
use crate::error::{AppError, Result};
use crate::hub::Subscription;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const KEEPALIVE_FRAME: &[u8] = b": keep-alive\n\n";

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub session: Option<String>,
}

pub fn sse_frame<T: Serialize>(event: &str, data: &T) -> Bytes {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Bytes::from(format!("event: {event}\ndata: {json}\n\n"))
}

async fn next_frame(
    subscription: Option<Subscription>,
    keepalive: Duration,
) -> Option<(std::result::Result<Bytes, actix_web::Error>, Option<Subscription>)> {
    let subscription = subscription?;

    match tokio::time::timeout(keepalive, subscription.next()).await {
        Ok(Some(payload)) => {
            let frame = sse_frame("completion", payload.as_ref());
            Some((Ok(frame), Some(subscription)))
        }
        Ok(None) => {
            let reason = subscription
                .close_reason()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "draining".to_string());
            let frame = sse_frame("closed", &serde_json::json!({ "reason": reason }));
            // Dropping the subscription here releases it from the hub
            Some((Ok(frame), None))
        }
        Err(_) => Some((Ok(Bytes::from_static(KEEPALIVE_FRAME)), Some(subscription))),
    }
}

pub async fn events(
    state: web::Data<AppState>,
    query: web::Query<EventsQuery>,
) -> Result<HttpResponse> {
    let token = query
        .session
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("session query parameter is required".to_string()))?;

    let subscription = state.hub.subscribe(token)?;
    let keepalive = state.hub.config().keepalive_interval;

    let connected = sse_frame(
        "connected",
        &serde_json::json!({
            "session": subscription.session_token(),
            "connectionId": subscription.id().to_string(),
        }),
    );

    let body = stream::once(async move { Ok::<_, actix_web::Error>(connected) }).chain(
        stream::unfold(Some(subscription), move |subscription| {
            next_frame(subscription, keepalive)
        }),
    );

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .insert_header(("X-Accel-Buffering", "no"))
        .streaming(body))
}
