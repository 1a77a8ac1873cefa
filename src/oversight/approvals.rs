//! Human approval channels.
//!
//! The gateway notifies a channel whenever an envelope is held for approval.
//! A channel either resolves the request itself or defers to an explicit
//! `Gateway::approve` / `Gateway::deny` call (e.g. from the web UI).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::Envelope;

/// Outcome of a human review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve {
        approver_id: String,
        notes: Option<String>,
    },
    Deny {
        approver_id: String,
        notes: Option<String>,
    },
}

impl ApprovalDecision {
    pub fn approve(approver_id: impl Into<String>) -> Self {
        ApprovalDecision::Approve {
            approver_id: approver_id.into(),
            notes: None,
        }
    }

    pub fn deny(approver_id: impl Into<String>) -> Self {
        ApprovalDecision::Deny {
            approver_id: approver_id.into(),
            notes: None,
        }
    }
}

/// Channel to whoever reviews held envelopes.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    /// Ask for a decision. `None` means the decision will arrive out of band.
    async fn request_approval(&self, envelope: &Envelope) -> Result<Option<ApprovalDecision>>;
}

/// Leaves every request to explicit approve/deny calls.
#[derive(Debug, Default, Clone)]
pub struct ManualApprovals;

#[async_trait]
impl ApprovalChannel for ManualApprovals {
    async fn request_approval(&self, envelope: &Envelope) -> Result<Option<ApprovalDecision>> {
        tracing::info!(
            message_id = %envelope.message_id,
            message_type = %envelope.message_type,
            "awaiting human approval"
        );
        Ok(None)
    }
}

/// Answers every request with the same decision.
#[derive(Debug, Clone)]
pub struct StaticApprovals {
    decision: ApprovalDecision,
}

impl StaticApprovals {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl ApprovalChannel for StaticApprovals {
    async fn request_approval(&self, _envelope: &Envelope) -> Result<Option<ApprovalDecision>> {
        Ok(Some(self.decision.clone()))
    }
}
