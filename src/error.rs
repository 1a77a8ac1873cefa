//! Error types for the IACP gateway.
//!
//! `Error` covers infrastructure failures. `Rejection` is the business-level
//! taxonomy a submission can end in; it is returned to callers inside a
//! `DeliveryOutcome`, never raised as an `Err`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

/// Why a submitted envelope was not delivered.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    #[error("Malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("Duplicate message id: {message_id}")]
    DuplicateMessageId { message_id: String },

    #[error("Rate limited: session {session_id} exceeded {max_messages} messages per {window_secs}s")]
    RateLimited {
        session_id: String,
        max_messages: u32,
        window_secs: u64,
        /// Seconds until the session's oldest admission leaves the window.
        retry_after_secs: u64,
    },

    #[error("Safety rejected: {reason}")]
    SafetyRejected {
        harmful_content: bool,
        coordination_risk: bool,
        deception_detected: bool,
        reason: String,
    },

    #[error("Approval denied by {approver_id}")]
    ApprovalDenied {
        approver_id: String,
        notes: Option<String>,
    },

    #[error("Delivery target unknown: {instance_id}")]
    DeliveryTargetUnknown { instance_id: String },
}

impl Rejection {
    /// When resubmitting the same envelope may succeed, how long to wait first.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Rejection::RateLimited {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }
}
