//! Read-only audit log endpoint.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error_status;
use crate::audit::{AuditFilter, AuditRecord, Disposition};
use crate::web::router::AppState;

const DEFAULT_LIMIT: usize = 100;
const MAX_LIMIT: usize = 1000;

/// Audit query parameters.
#[derive(Deserialize)]
pub struct AuditParams {
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(alias = "messageId")]
    pub message_id: Option<String>,
    pub disposition: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct AuditPage {
    /// Log head the page was read against.
    pub head: u64,
    pub records: Vec<AuditRecord>,
}

pub async fn query_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<AuditPage>, StatusCode> {
    let disposition = params
        .disposition
        .as_deref()
        .map(str::parse::<Disposition>)
        .transpose()
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let filter = AuditFilter {
        session_id: params.session_id,
        message_id: params.message_id,
        disposition,
        since: params.since,
        until: params.until,
    };
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

    let query = state.gateway.audit().query(filter).map_err(error_status)?;
    let records = query
        .iter()
        .take(limit)
        .collect::<crate::error::Result<Vec<_>>>()
        .map_err(error_status)?;

    Ok(Json(AuditPage {
        head: query.snapshot_head(),
        records,
    }))
}
