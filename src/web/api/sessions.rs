//! API endpoints for agent sessions and their mailboxes.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::error_status;
use crate::gateway::{MailboxStats, Registration};
use crate::protocol::{AgentIdentity, Envelope, BROADCAST_MARKER};
use crate::web::router::AppState;

const DEFAULT_BATCH: usize = 10;
const MAX_BATCH: usize = 100;
const MAX_WAIT_MS: u64 = 30_000;

#[derive(Serialize)]
pub struct RegisterResponse {
    pub registration: Registration,
    pub created: bool,
}

#[derive(Deserialize)]
pub struct InboxQuery {
    pub limit: Option<usize>,
    /// Long-poll for the first message up to this many milliseconds.
    pub wait_ms: Option<u64>,
}

#[derive(Deserialize)]
pub struct UnregisterQuery {
    /// Also drop the session's mailbox.
    #[serde(default)]
    pub purge: bool,
}

#[derive(Serialize)]
pub struct ReconnectResponse {
    pub requeued: usize,
}

/// List registered sessions.
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<Registration>> {
    Json(state.gateway.sessions().list())
}

/// Register (or refresh) a session.
pub async fn register_session(
    State(state): State<AppState>,
    Json(identity): Json<AgentIdentity>,
) -> Result<(StatusCode, Json<RegisterResponse>), StatusCode> {
    let blank = |s: &str| s.trim().is_empty();
    if blank(&identity.model_identity)
        || blank(&identity.instance_id)
        || blank(&identity.session_id)
        || identity.instance_id == BROADCAST_MARKER
    {
        return Err(StatusCode::BAD_REQUEST);
    }

    let instance_id = identity.instance_id.clone();
    let created = state.gateway.register(identity);
    let registration = state
        .gateway
        .sessions()
        .get(&instance_id)
        .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(RegisterResponse {
            registration,
            created,
        }),
    ))
}

/// Remove a session from routing.
pub async fn unregister_session(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<UnregisterQuery>,
) -> StatusCode {
    if !state.gateway.unregister(&instance_id) {
        return StatusCode::NOT_FOUND;
    }
    if query.purge {
        state.mailbox.remove(&instance_id);
    }
    StatusCode::NO_CONTENT
}

/// Hand out the next batch of messages. Each must be acked.
pub async fn fetch_inbox(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<InboxQuery>,
) -> Result<Json<Vec<Envelope>>, StatusCode> {
    require_session(&state, &instance_id)?;
    let limit = query.limit.unwrap_or(DEFAULT_BATCH).clamp(1, MAX_BATCH);

    let mut batch = Vec::new();
    if let Some(wait_ms) = query.wait_ms {
        let wait = Duration::from_millis(wait_ms.min(MAX_WAIT_MS));
        if let Some(first) = state
            .mailbox
            .recv(&instance_id, wait)
            .await
            .map_err(error_status)?
        {
            batch.push(first);
        }
    }
    while batch.len() < limit {
        match state.mailbox.take(&instance_id).map_err(error_status)? {
            Some(envelope) => batch.push(envelope),
            None => break,
        }
    }

    Ok(Json(batch))
}

pub async fn mailbox_stats(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<MailboxStats>, StatusCode> {
    require_session(&state, &instance_id)?;
    let stats = state.mailbox.stats(&instance_id).map_err(error_status)?;
    Ok(Json(stats))
}

/// Acknowledge a handed-out message.
pub async fn ack_message(
    State(state): State<AppState>,
    Path((instance_id, message_id)): Path<(String, String)>,
) -> Result<StatusCode, StatusCode> {
    require_session(&state, &instance_id)?;
    if state
        .mailbox
        .ack(&instance_id, &message_id)
        .map_err(error_status)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// Requeue every unacknowledged message for redelivery.
pub async fn reconnect_session(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<ReconnectResponse>, StatusCode> {
    require_session(&state, &instance_id)?;
    let requeued = state
        .mailbox
        .reconnect(&instance_id)
        .map_err(error_status)?;
    Ok(Json(ReconnectResponse { requeued }))
}

fn require_session(state: &AppState, instance_id: &str) -> Result<(), StatusCode> {
    if state.gateway.sessions().contains(instance_id) {
        Ok(())
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
