/// SNS HTTP subscription endpoint for processed-image notifications
use crate::error::{AppError, Result};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use event_schema::{CompletionEvent, SnsHttpMessage};
use tracing::{debug, info, warn};

pub async fn sns_processed(state: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse> {
    if body.is_empty() {
        return Err(AppError::BadRequest("empty SNS body".to_string()));
    }
    let text = std::str::from_utf8(&body)
        .map_err(|_| AppError::BadRequest("SNS body is not UTF-8".to_string()))?;

    let message = SnsHttpMessage::parse(text).map_err(|e| {
        warn!(error = %e, "Received non-JSON SNS payload");
        AppError::BadRequest(e.to_string())
    })?;

    match message {
        SnsHttpMessage::SubscriptionConfirmation {
            topic_arn: Some(topic_arn),
            token: Some(token),
            ..
        } => {
            info!(topic_arn = %topic_arn, "Confirming SNS subscription");
            state.confirmer.confirm(&topic_arn, &token).await?;
        }
        SnsHttpMessage::SubscriptionConfirmation { .. } => {
            warn!("Subscription confirmation without topic or token");
        }
        SnsHttpMessage::Notification {
            message_id,
            message,
        } => {
            let event = CompletionEvent::from_json(&message).map_err(|e| {
                warn!(message_id = ?message_id, error = %e, "Invalid SNS message body");
                AppError::BadRequest(format!("message is not a completion event: {e}"))
            })?;

            debug!(
                message_id = ?message_id,
                object_key = %event.object_key,
                "Completion notification received"
            );
            state.events.submit(event);
        }
        SnsHttpMessage::UnsubscribeConfirmation { topic_arn } => {
            warn!(topic_arn = ?topic_arn, "Live-update endpoint was unsubscribed");
        }
        SnsHttpMessage::Unknown => {
            warn!("Unhandled SNS message type");
        }
    }

    Ok(HttpResponse::Ok().finish())
}
