//! Human approval endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::error_status;
use crate::gateway::{DeliveryOutcome, PendingEnvelope};
use crate::web::router::AppState;

/// Approve or deny request body.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    #[serde(alias = "approver_id")]
    pub approver_id: String,
    pub notes: Option<String>,
}

/// Envelopes waiting for a human.
pub async fn list_pending(State(state): State<AppState>) -> Json<Vec<PendingEnvelope>> {
    Json(state.gateway.pending())
}

pub async fn approve_envelope(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(decision): Json<DecisionRequest>,
) -> Result<Json<DeliveryOutcome>, StatusCode> {
    if decision.approver_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let outcome = state
        .gateway
        .approve(&message_id, &decision.approver_id, decision.notes)
        .map_err(error_status)?;
    Ok(Json(outcome))
}

pub async fn deny_envelope(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(decision): Json<DecisionRequest>,
) -> Result<Json<DeliveryOutcome>, StatusCode> {
    if decision.approver_id.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let outcome = state
        .gateway
        .deny(&message_id, &decision.approver_id, decision.notes)
        .map_err(error_status)?;
    Ok(Json(outcome))
}
