//! API endpoints module.

pub mod approvals;
pub mod audit;
pub mod envelopes;
pub mod sessions;

pub use approvals::{approve_envelope, deny_envelope, list_pending};
pub use audit::query_audit;
pub use envelopes::submit_envelope;
pub use sessions::{
    ack_message, fetch_inbox, list_sessions, mailbox_stats, reconnect_session, register_session,
    unregister_session,
};

use axum::http::StatusCode;

use crate::error::Error;

/// Map an infrastructure error to a response status.
pub(crate) fn error_status(e: Error) -> StatusCode {
    match e {
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Conflict(_) => StatusCode::CONFLICT,
        e => {
            tracing::error!("request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
