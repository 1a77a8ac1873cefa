//! Envelope submission endpoint.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};

use super::error_status;
use crate::error::Rejection;
use crate::gateway::DeliveryOutcome;
use crate::web::router::AppState;

/// Submit one envelope. The body is read as raw bytes; input that is not
/// JSON, or not even UTF-8, is still recorded in the audit log.
pub async fn submit_envelope(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, HeaderMap, Json<DeliveryOutcome>), StatusCode> {
    let outcome = state
        .gateway
        .submit_bytes(&body)
        .await
        .map_err(error_status)?;

    let mut headers = HeaderMap::new();
    let status = match outcome.rejection() {
        None => StatusCode::ACCEPTED,
        Some(rejection) => {
            if let Some(secs) = rejection.retry_after_secs() {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            }
            rejection_status(rejection)
        }
    };
    Ok((status, headers, Json(outcome)))
}

fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::MalformedEnvelope { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Rejection::DuplicateMessageId { .. } => StatusCode::CONFLICT,
        Rejection::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        Rejection::SafetyRejected { .. } | Rejection::ApprovalDenied { .. } => {
            StatusCode::FORBIDDEN
        }
        Rejection::DeliveryTargetUnknown { .. } => StatusCode::NOT_FOUND,
    }
}
