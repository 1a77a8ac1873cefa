//! Oversight gate: decides which envelopes need a human before delivery.
//!
//! Proposals and broadcasts always need explicit approval. Other message
//! types are auto-approved when the safety gate passed cleanly and
//! `auto_approve` is on.

pub mod approvals;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::OversightConfig;
use crate::protocol::{Envelope, MessageType, OversightRecord};
use crate::safety::SafetyResult;

pub use approvals::{ApprovalChannel, ApprovalDecision, ManualApprovals, StaticApprovals};

/// Approver id recorded for auto-approved envelopes.
pub const AUTO_APPROVER: &str = "gateway:auto";

/// An approval granted by a human reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub approver_id: String,
    pub notes: Option<String>,
    pub approved_at: DateTime<Utc>,
}

impl Approval {
    pub fn new(approver_id: impl Into<String>, notes: Option<String>) -> Self {
        Self {
            approver_id: approver_id.into(),
            notes,
            approved_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversightDecision {
    /// No human needed.
    AutoApproved,
    /// A human approved.
    Approved,
    /// Waiting for a human.
    Pending,
    /// A human refused.
    Denied,
}

/// Verdict of the oversight gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OversightResult {
    pub required: bool,
    pub decision: OversightDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl OversightResult {
    pub fn approved(approval: &Approval) -> Self {
        Self {
            required: true,
            decision: OversightDecision::Approved,
            approver_id: Some(approval.approver_id.clone()),
            notes: approval.notes.clone(),
        }
    }

    pub fn denied(approver_id: impl Into<String>, notes: Option<String>) -> Self {
        Self {
            required: true,
            decision: OversightDecision::Denied,
            approver_id: Some(approver_id.into()),
            notes,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(
            self.decision,
            OversightDecision::AutoApproved | OversightDecision::Approved
        )
    }

    pub fn record(&self) -> OversightRecord {
        OversightRecord {
            approved: self.is_approved(),
            approver_id: self.approver_id.clone(),
            notes: self.notes.clone(),
        }
    }
}

/// Applies the oversight policy.
#[derive(Debug, Clone, Default)]
pub struct OversightGate {
    config: OversightConfig,
}

impl OversightGate {
    pub fn new(config: OversightConfig) -> Self {
        Self { config }
    }

    /// Whether a human must approve before delivery.
    pub fn requires_approval(
        &self,
        message_type: MessageType,
        broadcast: bool,
        safety: &SafetyResult,
    ) -> bool {
        message_type == MessageType::Proposal
            || broadcast
            || self.config.require_approval_for.contains(&message_type)
            || !self.config.auto_approve
            || !safety.passed()
    }

    /// Evaluate an envelope. `granted` is an approval recorded by the gateway
    /// for this message id, if any.
    pub fn check_approval(
        &self,
        envelope: &Envelope,
        safety: &SafetyResult,
        granted: Option<&Approval>,
    ) -> OversightResult {
        let required = self.requires_approval(envelope.message_type, envelope.is_broadcast(), safety);

        if !required {
            return OversightResult {
                required,
                decision: OversightDecision::AutoApproved,
                approver_id: Some(AUTO_APPROVER.to_string()),
                notes: None,
            };
        }

        if let Some(approval) = granted {
            return OversightResult::approved(approval);
        }

        if self.config.trust_sender_approval && envelope.oversight.approved {
            return OversightResult {
                required,
                decision: OversightDecision::Approved,
                approver_id: Some(
                    envelope
                        .oversight
                        .approver_id
                        .clone()
                        .unwrap_or_else(|| format!("sender:{}", envelope.sender.instance_id)),
                ),
                notes: envelope.oversight.notes.clone(),
            };
        }

        OversightResult {
            required,
            decision: OversightDecision::Pending,
            approver_id: None,
            notes: None,
        }
    }
}
