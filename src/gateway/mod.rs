//! The gateway: single entry point for every envelope.
//!
//! `submit` validates, rate-limits, claims the message id, runs the safety
//! gate and then the oversight gate, and appends exactly one audit record.
//! Delivered envelopes are fanned out to recipients on background tasks, so
//! `submit` returns as soon as the disposition is durable.
//!
//! Envelopes held for approval stay in memory until `approve` or `deny`
//! settles them; `recover_pending` rebuilds that set from the audit log.

pub mod mailbox;
pub mod sessions;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::audit::{AuditEntry, AuditLog, Disposition, GateResults, IdClaim, IdReservation};
use crate::config::{DeliveryConfig, Settings};
use crate::error::{Error, Rejection, Result};
use crate::oversight::{
    Approval, ApprovalChannel, ApprovalDecision, ManualApprovals, OversightDecision,
    OversightGate, OversightResult,
};
use crate::protocol::{AgentIdentity, Envelope, Target};
use crate::ratelimit::RateLimiter;
use crate::safety::{SafetyGate, SafetyResult};

pub use mailbox::{MailboxStats, MailboxStore, SessionMailbox, Transport};
pub use sessions::{Registration, SessionRegistry};

/// What happened to a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered {
        message_id: String,
        sequence: u64,
        /// Instance ids the envelope is being fanned out to.
        recipients: Vec<String>,
    },
    /// Held until a human approves or denies it.
    PendingApproval { message_id: String, sequence: u64 },
    Rejected {
        message_id: Option<String>,
        sequence: u64,
        rejection: Rejection,
    },
}

impl DeliveryOutcome {
    /// Sequence number of the audit record this outcome produced.
    pub fn sequence(&self) -> u64 {
        match self {
            DeliveryOutcome::Delivered { sequence, .. }
            | DeliveryOutcome::PendingApproval { sequence, .. }
            | DeliveryOutcome::Rejected { sequence, .. } => *sequence,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered { .. })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, DeliveryOutcome::PendingApproval { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            DeliveryOutcome::Rejected { rejection, .. } => Some(rejection),
            _ => None,
        }
    }
}

/// An envelope waiting for a human decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEnvelope {
    pub envelope: Envelope,
    pub safety: SafetyResult,
    /// Sequence of the `pending_approval` record.
    pub sequence: u64,
    pub held_at: DateTime<Utc>,
}

struct Inner {
    protocol_version: String,
    audit: Arc<AuditLog>,
    limiter: RateLimiter,
    safety: SafetyGate,
    oversight: OversightGate,
    approvals: Arc<dyn ApprovalChannel>,
    transport: Arc<dyn Transport>,
    sessions: SessionRegistry,
    pending: Mutex<HashMap<String, PendingEnvelope>>,
    delivery: DeliveryConfig,
}

/// Shared handle to a gateway. Cloning is cheap.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<Inner>,
}

pub struct GatewayBuilder {
    settings: Settings,
    audit: Option<Arc<AuditLog>>,
    safety: Option<SafetyGate>,
    approvals: Option<Arc<dyn ApprovalChannel>>,
    transport: Option<Arc<dyn Transport>>,
}

impl GatewayBuilder {
    /// Use this audit log instead of opening the configured SQLite file.
    pub fn audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn safety(mut self, safety: SafetyGate) -> Self {
        self.safety = Some(safety);
        self
    }

    pub fn approvals(mut self, approvals: Arc<dyn ApprovalChannel>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<Gateway> {
        let settings = self.settings;
        let audit = match self.audit {
            Some(audit) => audit,
            None => Arc::new(AuditLog::open(settings.audit.resolve_path()?)?),
        };
        let safety = match self.safety {
            Some(safety) => safety,
            None => SafetyGate::from_config(&settings.safety)?,
        };
        let approvals: Arc<dyn ApprovalChannel> = match self.approvals {
            Some(approvals) => approvals,
            None => Arc::new(ManualApprovals),
        };
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MailboxStore::from_config(&settings.mailbox)?),
        };

        tracing::info!(
            protocol_version = %settings.gateway.protocol_version,
            safety_policy = safety.policy_version(),
            max_messages = settings.rate_limit.max_messages,
            window_secs = settings.rate_limit.window_secs,
            "gateway ready"
        );
        Ok(Gateway {
            inner: Arc::new(Inner {
                protocol_version: settings.gateway.protocol_version.clone(),
                audit,
                limiter: RateLimiter::from_config(&settings.rate_limit),
                safety,
                oversight: OversightGate::new(settings.oversight.clone()),
                approvals,
                transport,
                sessions: SessionRegistry::new(),
                pending: Mutex::new(HashMap::new()),
                delivery: settings.delivery.clone(),
            }),
        })
    }
}

impl Gateway {
    pub fn builder(settings: Settings) -> GatewayBuilder {
        GatewayBuilder {
            settings,
            audit: None,
            safety: None,
            approvals: None,
            transport: None,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.inner.audit
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    /// Register a session so it can be addressed. Returns true if new.
    pub fn register(&self, identity: AgentIdentity) -> bool {
        let instance_id = identity.instance_id.clone();
        let session_id = identity.session_id.clone();
        let new = self.inner.sessions.register(identity);
        tracing::info!(%instance_id, %session_id, new, "session registered");
        new
    }

    pub fn unregister(&self, instance_id: &str) -> bool {
        let removed = self.inner.sessions.unregister(instance_id).is_some();
        if removed {
            tracing::info!(instance_id, "session unregistered");
        }
        removed
    }

    /// Submit a raw request body. Input that is not UTF-8 is still audited.
    pub async fn submit_bytes(&self, raw: &[u8]) -> Result<DeliveryOutcome> {
        match std::str::from_utf8(raw) {
            Ok(text) => self.submit_json(text).await,
            Err(e) => {
                let reason = format!("body is not valid UTF-8: {}", e);
                let entry = AuditEntry::malformed(&String::from_utf8_lossy(raw), reason.clone());
                self.reject(entry, Rejection::MalformedEnvelope { reason })
            }
        }
    }

    /// Submit raw wire JSON. Unparseable input is still audited.
    pub async fn submit_json(&self, raw: &str) -> Result<DeliveryOutcome> {
        match serde_json::from_str::<Envelope>(raw) {
            Ok(envelope) => self.submit(envelope).await,
            Err(e) => {
                let rejection = Rejection::MalformedEnvelope {
                    reason: e.to_string(),
                };
                self.reject(AuditEntry::malformed(raw, e.to_string()), rejection)
            }
        }
    }

    /// Run an envelope through every gate and record its disposition.
    ///
    /// Returns `Err` only when the audit record could not be written.
    pub async fn submit(&self, envelope: Envelope) -> Result<DeliveryOutcome> {
        let inner = &self.inner;

        if let Err(rejection) = envelope
            .validate()
            .and_then(|()| self.check_version(&envelope))
        {
            let entry = AuditEntry::for_envelope(&envelope, Disposition::RejectedMalformed);
            return self.reject(entry, rejection);
        }

        let session_id = &envelope.sender.session_id;
        if !inner.limiter.allow(session_id) {
            let retry_after_secs = inner
                .limiter
                .retry_after_at(session_id, Utc::now())
                .map(|wait| (wait.num_milliseconds().max(0) as u64).div_ceil(1000))
                .unwrap_or_else(|| inner.limiter.window_secs());
            let rejection = Rejection::RateLimited {
                session_id: session_id.clone(),
                max_messages: inner.limiter.max_messages(),
                window_secs: inner.limiter.window_secs(),
                retry_after_secs,
            };
            let entry = AuditEntry::for_envelope(&envelope, Disposition::RejectedRateLimit);
            return self.reject(entry, rejection);
        }

        let reservation = match inner
            .audit
            .claim(&envelope.message_id, &envelope.sender.instance_id)?
        {
            IdClaim::Fresh(reservation) | IdClaim::Resubmission(reservation) => reservation,
            IdClaim::Duplicate => {
                let rejection = Rejection::DuplicateMessageId {
                    message_id: envelope.message_id.clone(),
                };
                let entry = AuditEntry::for_envelope(&envelope, Disposition::RejectedDuplicate);
                return self.reject(entry, rejection);
            }
        };

        let safety = inner.safety.evaluate(&envelope).await;
        if let Some(rejection) = safety.rejection() {
            let gates = GateResults {
                safety: Some(safety),
                ..Default::default()
            };
            let entry =
                AuditEntry::for_envelope(&envelope, Disposition::RejectedSafety).with_gates(gates);
            return self.reject(entry, rejection);
        }

        let oversight = inner.oversight.check_approval(&envelope, &safety, None);
        if oversight.decision == OversightDecision::Pending {
            // Nobody should be asked to approve a message that cannot be delivered.
            if let Err(rejection) = self.resolve_recipients(&envelope) {
                return self.reject_unknown_target(&envelope, safety, oversight, rejection);
            }
            return self.hold(envelope, safety, oversight, reservation);
        }
        self.complete(envelope, safety, oversight, reservation)
    }

    /// Approve a held envelope and deliver it. Needs a Tokio runtime.
    pub fn approve(
        &self,
        message_id: &str,
        approver_id: &str,
        notes: Option<String>,
    ) -> Result<DeliveryOutcome> {
        let (reservation, held) = self.checkout_pending(message_id)?;
        let approval = Approval::new(approver_id, notes);
        let oversight =
            self.inner
                .oversight
                .check_approval(&held.envelope, &held.safety, Some(&approval));
        tracing::info!(message_id, approver_id, "approval granted");
        self.complete(held.envelope, held.safety, oversight, reservation)
    }

    /// Refuse a held envelope. It is never delivered.
    pub fn deny(
        &self,
        message_id: &str,
        approver_id: &str,
        notes: Option<String>,
    ) -> Result<DeliveryOutcome> {
        let (_reservation, held) = self.checkout_pending(message_id)?;
        let gates = GateResults {
            safety: Some(held.safety),
            oversight: Some(OversightResult::denied(approver_id, notes.clone())),
            recipients: Vec::new(),
        };
        let rejection = Rejection::ApprovalDenied {
            approver_id: approver_id.to_string(),
            notes,
        };
        let entry =
            AuditEntry::for_envelope(&held.envelope, Disposition::RejectedOversight).with_gates(gates);
        self.reject(entry, rejection)
    }

    /// Envelopes awaiting a decision, oldest first.
    pub fn pending(&self) -> Vec<PendingEnvelope> {
        let mut pending: Vec<_> = self.lock_pending().values().cloned().collect();
        pending.sort_by_key(|p| p.sequence);
        pending
    }

    /// Reload held envelopes from the audit log, e.g. after a restart.
    pub fn recover_pending(&self) -> Result<usize> {
        let mut recovered = 0;
        for (record, envelope) in self.inner.audit.pending_envelopes()? {
            let Some(safety) = record.entry.gates.safety.clone() else {
                tracing::warn!(message_id = %envelope.message_id, "pending record has no safety verdict, skipping");
                continue;
            };
            let mut pending = self.lock_pending();
            if pending.contains_key(&envelope.message_id) {
                continue;
            }
            pending.insert(
                envelope.message_id.clone(),
                PendingEnvelope {
                    envelope,
                    safety,
                    sequence: record.sequence,
                    held_at: record.recorded_at,
                },
            );
            recovered += 1;
        }
        if recovered > 0 {
            tracing::info!(recovered, "recovered envelopes pending approval");
        }
        Ok(recovered)
    }

    fn check_version(&self, envelope: &Envelope) -> std::result::Result<(), Rejection> {
        let major = |v: &str| v.split('.').next().unwrap_or_default().to_string();
        if major(&envelope.protocol_version) == major(&self.inner.protocol_version) {
            return Ok(());
        }
        Err(Rejection::MalformedEnvelope {
            reason: format!(
                "unsupported protocolVersion '{}' (gateway speaks {})",
                envelope.protocol_version, self.inner.protocol_version
            ),
        })
    }

    fn hold(
        &self,
        envelope: Envelope,
        safety: SafetyResult,
        oversight: OversightResult,
        reservation: IdReservation<'_>,
    ) -> Result<DeliveryOutcome> {
        let gates = GateResults {
            safety: Some(safety.clone()),
            oversight: Some(oversight),
            recipients: Vec::new(),
        };
        let entry = AuditEntry::for_envelope(&envelope, Disposition::PendingApproval)
            .with_reason("awaiting human approval")
            .with_gates(gates);
        let record = self.inner.audit.append(entry)?;

        let message_id = envelope.message_id.clone();
        self.lock_pending().insert(
            message_id.clone(),
            PendingEnvelope {
                envelope: envelope.clone(),
                safety,
                sequence: record.sequence,
                held_at: record.recorded_at,
            },
        );
        drop(reservation);

        tracing::info!(%message_id, sequence = record.sequence, "held for approval");
        self.request_approval(envelope);
        Ok(DeliveryOutcome::PendingApproval {
            message_id,
            sequence: record.sequence,
        })
    }

    /// Resolve recipients, record delivery and start the fan-out.
    fn complete(
        &self,
        envelope: Envelope,
        safety: SafetyResult,
        oversight: OversightResult,
        _reservation: IdReservation<'_>,
    ) -> Result<DeliveryOutcome> {
        // The target may have unregistered while the envelope was held.
        let recipients = match self.resolve_recipients(&envelope) {
            Ok(recipients) => recipients,
            Err(rejection) => {
                return self.reject_unknown_target(&envelope, safety, oversight, rejection);
            }
        };

        let stamped = envelope.stamped(safety.record(), oversight.record());
        let gates = GateResults {
            safety: Some(safety),
            oversight: Some(oversight),
            recipients: recipients.clone(),
        };
        let record = self
            .inner
            .audit
            .append(AuditEntry::for_envelope(&stamped, Disposition::Delivered).with_gates(gates))?;
        self.lock_pending().remove(&stamped.message_id);

        tracing::info!(
            message_id = %stamped.message_id,
            sequence = record.sequence,
            recipients = recipients.len(),
            "delivered"
        );
        let message_id = stamped.message_id.clone();
        self.fan_out(stamped, &recipients);
        Ok(DeliveryOutcome::Delivered {
            message_id,
            sequence: record.sequence,
            recipients,
        })
    }

    fn reject(&self, entry: AuditEntry, rejection: Rejection) -> Result<DeliveryOutcome> {
        let record = self
            .inner
            .audit
            .append(entry.with_reason(rejection.to_string()))?;
        let message_id = record.entry.message_id.clone();

        if record.disposition().claims_message_id() {
            if let Some(id) = &message_id {
                self.lock_pending().remove(id);
            }
        }

        tracing::warn!(
            message_id = message_id.as_deref().unwrap_or("-"),
            disposition = %record.disposition(),
            "{}",
            rejection
        );
        Ok(DeliveryOutcome::Rejected {
            message_id,
            sequence: record.sequence,
            rejection,
        })
    }

    fn reject_unknown_target(
        &self,
        envelope: &Envelope,
        safety: SafetyResult,
        oversight: OversightResult,
        rejection: Rejection,
    ) -> Result<DeliveryOutcome> {
        let gates = GateResults {
            safety: Some(safety),
            oversight: Some(oversight),
            recipients: Vec::new(),
        };
        let entry =
            AuditEntry::for_envelope(envelope, Disposition::RejectedUnknownTarget).with_gates(gates);
        self.reject(entry, rejection)
    }

    fn resolve_recipients(&self, envelope: &Envelope) -> std::result::Result<Vec<String>, Rejection> {
        match &envelope.recipient.target {
            Target::Instance(instance_id) if self.inner.sessions.contains(instance_id) => {
                Ok(vec![instance_id.clone()])
            }
            Target::Instance(instance_id) => Err(Rejection::DeliveryTargetUnknown {
                instance_id: instance_id.clone(),
            }),
            Target::Broadcast => Ok(self
                .inner
                .sessions
                .broadcast_targets(&envelope.sender.instance_id)),
        }
    }

    /// Hold on to the id and the held envelope while a decision is applied.
    fn checkout_pending(&self, message_id: &str) -> Result<(IdReservation<'_>, PendingEnvelope)> {
        let reservation = self
            .inner
            .audit
            .reserve(message_id)
            .ok_or_else(|| Error::Conflict(format!("message {} is being processed", message_id)))?;
        let held = self.lock_pending().get(message_id).cloned().ok_or_else(|| {
            Error::NotFound(format!("no envelope pending approval with id {}", message_id))
        })?;
        Ok((reservation, held))
    }

    fn request_approval(&self, envelope: Envelope) {
        let gateway = self.clone();
        tokio::spawn(async move {
            let message_id = envelope.message_id.clone();
            let decision = match gateway.inner.approvals.request_approval(&envelope).await {
                Ok(Some(decision)) => decision,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(%message_id, "approval channel failed: {}", e);
                    return;
                }
            };
            let applied = match decision {
                ApprovalDecision::Approve { approver_id, notes } => {
                    gateway.approve(&message_id, &approver_id, notes)
                }
                ApprovalDecision::Deny { approver_id, notes } => {
                    gateway.deny(&message_id, &approver_id, notes)
                }
            };
            if let Err(e) = applied {
                tracing::warn!(%message_id, "could not apply approval decision: {}", e);
            }
        });
    }

    fn fan_out(&self, envelope: Envelope, recipients: &[String]) {
        for instance_id in recipients {
            let transport = Arc::clone(&self.inner.transport);
            let policy = self.inner.delivery.clone();
            let envelope = envelope.clone();
            let instance_id = instance_id.clone();
            tokio::spawn(async move {
                deliver_with_retry(transport.as_ref(), &instance_id, &envelope, &policy).await;
            });
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingEnvelope>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deliver to one recipient, retrying with exponential backoff.
async fn deliver_with_retry(
    transport: &dyn Transport,
    instance_id: &str,
    envelope: &Envelope,
    policy: &DeliveryConfig,
) -> bool {
    let mut backoff = Duration::from_millis(policy.backoff_ms);
    for attempt in 1..=policy.max_attempts {
        match transport.deliver(instance_id, envelope).await {
            Ok(()) => {
                tracing::debug!(instance_id, message_id = %envelope.message_id, attempt, "handed to transport");
                return true;
            }
            Err(e) if attempt < policy.max_attempts => {
                tracing::warn!(
                    instance_id,
                    message_id = %envelope.message_id,
                    attempt,
                    "delivery failed, retrying: {}",
                    e
                );
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(e) => {
                tracing::error!(
                    instance_id,
                    message_id = %envelope.message_id,
                    attempts = attempt,
                    "delivery abandoned: {}",
                    e
                );
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditFilter;
    use crate::oversight::StaticApprovals;
    use crate::protocol::{EnvelopeBuilder, MessageType, Recipient};
    use crate::safety::{Classification, Classifier};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    const WAIT: Duration = Duration::from_secs(2);

    fn claude() -> AgentIdentity {
        AgentIdentity::new("claude-sonnet-4", "claude-1", "s1")
    }

    fn gateway_with(
        settings: Settings,
        approvals: Arc<dyn ApprovalChannel>,
    ) -> (Gateway, Arc<MailboxStore>) {
        let mailbox = Arc::new(MailboxStore::new());
        let gateway = Gateway::builder(settings)
            .audit(Arc::new(AuditLog::in_memory()))
            .approvals(approvals)
            .transport(mailbox.clone())
            .build()
            .unwrap();
        gateway.register(claude());
        gateway.register(AgentIdentity::new("gpt-4", "gpt4-1", "s1"));
        gateway.register(AgentIdentity::new("gemini-pro", "gemini-1", "s1"));
        (gateway, mailbox)
    }

    fn gateway() -> (Gateway, Arc<MailboxStore>) {
        gateway_with(Settings::default(), Arc::new(ManualApprovals))
    }

    fn to_gpt4(id: &str, message_type: MessageType, text: &str) -> Envelope {
        EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "gpt4-1", "s1"))
            .message_type(message_type)
            .text(text)
            .message_id(id)
            .build()
            .unwrap()
    }

    fn dispositions(gateway: &Gateway) -> Vec<Disposition> {
        gateway
            .audit()
            .query(AuditFilter::default())
            .unwrap()
            .iter()
            .map(|r| r.unwrap().disposition())
            .collect()
    }

    #[tokio::test]
    async fn test_clean_query_is_auto_approved_and_delivered() {
        let (gateway, mailbox) = gateway();
        let outcome = gateway
            .submit(to_gpt4("m1", MessageType::Query, "What is 2+2?"))
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DeliveryOutcome::Delivered {
                message_id: "m1".to_string(),
                sequence: 1,
                recipients: vec!["gpt4-1".to_string()],
            }
        );

        let received = mailbox.recv("gpt4-1", WAIT).await.unwrap().unwrap();
        assert_eq!(received.message_id, "m1");
        assert!(received.oversight.approved);
        assert_eq!(
            received.oversight.approver_id.as_deref(),
            Some(crate::oversight::AUTO_APPROVER)
        );
        assert!(received.safety.is_clean());
        assert_eq!(dispositions(&gateway), vec![Disposition::Delivered]);
    }

    #[tokio::test]
    async fn test_proposal_waits_for_approval_then_delivers() {
        let (gateway, mailbox) = gateway();
        let outcome = gateway
            .submit(to_gpt4("p1", MessageType::Proposal, "I take backend, you take frontend?"))
            .await
            .unwrap();
        assert!(outcome.is_pending());
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());
        assert_eq!(gateway.pending().len(), 1);

        let approved = gateway.approve("p1", "alice", Some("fine".to_string())).unwrap();
        assert!(approved.is_delivered());
        assert!(gateway.pending().is_empty());

        let received = mailbox.recv("gpt4-1", WAIT).await.unwrap().unwrap();
        assert_eq!(received.oversight.approver_id.as_deref(), Some("alice"));
        assert_eq!(
            dispositions(&gateway),
            vec![Disposition::PendingApproval, Disposition::Delivered]
        );
    }

    #[tokio::test]
    async fn test_sender_approval_is_not_trusted_by_default() {
        let (gateway, _mailbox) = gateway();
        let proposal = EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "gpt4-1", "s1"))
            .message_type(MessageType::Proposal)
            .text("Let's split the work")
            .approved_by("myself")
            .build()
            .unwrap();
        assert!(gateway.submit(proposal).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_resubmission_with_trusted_approval() {
        let mut settings = Settings::default();
        settings.oversight.trust_sender_approval = true;
        let (gateway, mailbox) = gateway_with(settings, Arc::new(ManualApprovals));

        let held = to_gpt4("p2", MessageType::Proposal, "Shall we pair on the parser?");
        assert!(gateway.submit(held).await.unwrap().is_pending());

        let resubmitted = EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "gpt4-1", "s1"))
            .message_type(MessageType::Proposal)
            .text("Shall we pair on the parser?")
            .message_id("p2")
            .approved_by("alice")
            .build()
            .unwrap();
        assert!(gateway.submit(resubmitted).await.unwrap().is_delivered());
        assert!(gateway.pending().is_empty());
        assert!(mailbox.recv("gpt4-1", WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_deny_is_final() {
        let (gateway, mailbox) = gateway();
        gateway
            .submit(to_gpt4("p3", MessageType::Proposal, "Merge our outputs"))
            .await
            .unwrap();

        let denied = gateway.deny("p3", "bob", None).unwrap();
        assert!(matches!(
            denied.rejection(),
            Some(Rejection::ApprovalDenied { approver_id, .. }) if approver_id == "bob"
        ));
        assert!(gateway.pending().is_empty());
        assert!(matches!(
            gateway.approve("p3", "alice", None),
            Err(Error::NotFound(_))
        ));
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());
        assert_eq!(
            dispositions(&gateway),
            vec![Disposition::PendingApproval, Disposition::RejectedOversight]
        );
    }

    #[tokio::test]
    async fn test_approval_channel_resolves_automatically() {
        let (gateway, mailbox) = gateway_with(
            Settings::default(),
            Arc::new(StaticApprovals::new(ApprovalDecision::approve("reviewer"))),
        );
        let outcome = gateway
            .submit(to_gpt4("p4", MessageType::Proposal, "Adopt the shared schema?"))
            .await
            .unwrap();
        assert!(outcome.is_pending());

        let received = mailbox.recv("gpt4-1", WAIT).await.unwrap().unwrap();
        assert_eq!(received.oversight.approver_id.as_deref(), Some("reviewer"));
        let latest = gateway.audit().latest_for("p4").unwrap().unwrap();
        assert_eq!(latest.disposition(), Disposition::Delivered);
    }

    #[tokio::test]
    async fn test_duplicate_message_id() {
        let (gateway, _mailbox) = gateway();
        let envelope = to_gpt4("dup", MessageType::Observation, "tests pass");
        assert!(gateway.submit(envelope.clone()).await.unwrap().is_delivered());

        let second = gateway.submit(envelope).await.unwrap();
        assert!(matches!(
            second.rejection(),
            Some(Rejection::DuplicateMessageId { .. })
        ));
        assert_eq!(
            dispositions(&gateway),
            vec![Disposition::Delivered, Disposition::RejectedDuplicate]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicates_deliver_once() {
        let (gateway, _mailbox) = gateway();
        let envelope = to_gpt4("race", MessageType::Query, "who wins?");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gateway = gateway.clone();
                let envelope = envelope.clone();
                tokio::spawn(async move { gateway.submit(envelope).await.unwrap() })
            })
            .collect();

        let mut delivered = 0;
        for handle in handles {
            if handle.await.unwrap().is_delivered() {
                delivered += 1;
            }
        }
        assert_eq!(delivered, 1);
        assert_eq!(gateway.audit().len().unwrap(), 8);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_n_plus_one() {
        let mut settings = Settings::default();
        settings.rate_limit.max_messages = 3;
        let (gateway, _mailbox) = gateway_with(settings, Arc::new(ManualApprovals));

        for i in 0..3 {
            let outcome = gateway
                .submit(to_gpt4(&format!("r{}", i), MessageType::Query, "ping"))
                .await
                .unwrap();
            assert!(outcome.is_delivered());
        }
        let limited = gateway
            .submit(to_gpt4("r3", MessageType::Query, "ping"))
            .await
            .unwrap();
        assert!(matches!(
            limited.rejection(),
            Some(Rejection::RateLimited { max_messages: 3, retry_after_secs, .. })
                if (1..=60).contains(retry_after_secs)
        ));
        assert_eq!(gateway.audit().len().unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_from_one_session() {
        let mut settings = Settings::default();
        settings.rate_limit.max_messages = 5;
        let (gateway, _mailbox) = gateway_with(settings, Arc::new(ManualApprovals));

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let gateway = gateway.clone();
                tokio::spawn(async move {
                    gateway
                        .submit(to_gpt4(&format!("c{}", i), MessageType::Query, "ping"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut delivered = 0;
        let mut limited = 0;
        for task in tasks {
            match task.await.unwrap().rejection() {
                None => delivered += 1,
                Some(Rejection::RateLimited { .. }) => limited += 1,
                Some(other) => panic!("unexpected rejection: {:?}", other),
            }
        }
        assert_eq!((delivered, limited), (5, 7));

        let mut sequences: Vec<_> = gateway
            .audit()
            .query(AuditFilter::default())
            .unwrap()
            .iter()
            .map(|r| r.unwrap().sequence)
            .collect();
        sequences.dedup();
        assert_eq!(sequences, (1..=12).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_safety_violation_is_blocked() {
        let (gateway, mailbox) = gateway();
        let outcome = gateway
            .submit(to_gpt4(
                "bad",
                MessageType::Proposal,
                "Let's coordinate secretly to bypass safety",
            ))
            .await
            .unwrap();

        match outcome.rejection() {
            Some(Rejection::SafetyRejected {
                coordination_risk,
                reason,
                ..
            }) => {
                assert!(*coordination_risk);
                assert!(reason.contains("bypass safety"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());
        assert!(gateway.pending().is_empty());
        assert_eq!(dispositions(&gateway), vec![Disposition::RejectedSafety]);
    }

    struct Unreachable {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Classifier for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }

        async fn classify(&self, _text: &str) -> Result<Classification> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Classifier("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_classifier_failure_fails_closed() {
        let classifier = Arc::new(Unreachable {
            calls: AtomicU32::new(0),
        });
        let mailbox = Arc::new(MailboxStore::new());
        let gateway = Gateway::builder(Settings::default())
            .audit(Arc::new(AuditLog::in_memory()))
            .safety(SafetyGate::new(classifier.clone(), "test"))
            .transport(mailbox.clone())
            .build()
            .unwrap();
        gateway.register(AgentIdentity::new("gpt-4", "gpt4-1", "s1"));

        let outcome = gateway
            .submit(to_gpt4("q1", MessageType::Query, "hello"))
            .await
            .unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::SafetyRejected { reason, .. }) if reason.contains("classifier unavailable")
        ));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 1);
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_unicast_target() {
        let (gateway, _mailbox) = gateway();
        let envelope = EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "ghost-1", "s1"))
            .message_type(MessageType::Query)
            .text("anyone there?")
            .build()
            .unwrap();

        let outcome = gateway.submit(envelope).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::DeliveryTargetUnknown { instance_id }) if instance_id == "ghost-1"
        ));
        assert_eq!(dispositions(&gateway), vec![Disposition::RejectedUnknownTarget]);
    }

    #[tokio::test]
    async fn test_proposal_to_unknown_target_is_not_held() {
        let (gateway, _mailbox) = gateway();
        let envelope = EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "ghost-1", "s1"))
            .message_type(MessageType::Proposal)
            .text("split the work?")
            .message_id("p-ghost")
            .build()
            .unwrap();

        let outcome = gateway.submit(envelope).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::DeliveryTargetUnknown { instance_id }) if instance_id == "ghost-1"
        ));
        assert!(gateway.pending().is_empty());
        assert_eq!(dispositions(&gateway), vec![Disposition::RejectedUnknownTarget]);
    }

    #[tokio::test]
    async fn test_approving_after_target_unregistered() {
        let (gateway, mailbox) = gateway();
        let outcome = gateway
            .submit(to_gpt4("p7", MessageType::Proposal, "pair on the parser?"))
            .await
            .unwrap();
        assert!(outcome.is_pending());
        assert!(gateway.unregister("gpt4-1"));

        let approved = gateway.approve("p7", "alice", None).unwrap();
        assert!(matches!(
            approved.rejection(),
            Some(Rejection::DeliveryTargetUnknown { instance_id }) if instance_id == "gpt4-1"
        ));
        assert!(gateway.pending().is_empty());
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());
        assert_eq!(
            dispositions(&gateway),
            vec![Disposition::PendingApproval, Disposition::RejectedUnknownTarget]
        );

        // The id is taken for good.
        assert!(matches!(
            gateway.approve("p7", "alice", None),
            Err(Error::NotFound(_))
        ));
        let again = gateway
            .submit(to_gpt4("p7", MessageType::Proposal, "pair on the parser?"))
            .await
            .unwrap();
        assert!(matches!(
            again.rejection(),
            Some(Rejection::DuplicateMessageId { .. })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_ping_needs_approval_then_fans_out() {
        let (gateway, mailbox) = gateway();
        let ping = EnvelopeBuilder::from(claude())
            .broadcast()
            .message_type(MessageType::Query)
            .text("ping")
            .message_id("b1")
            .build()
            .unwrap();

        assert!(gateway.submit(ping).await.unwrap().is_pending());
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());

        let outcome = gateway.approve("b1", "alice", None).unwrap();
        match &outcome {
            DeliveryOutcome::Delivered { recipients, .. } => {
                assert_eq!(recipients, &vec!["gemini-1".to_string(), "gpt4-1".to_string()]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        for instance in ["gpt4-1", "gemini-1"] {
            let received = mailbox.recv(instance, WAIT).await.unwrap().unwrap();
            assert_eq!(received.message_id, "b1");
        }
        assert!(mailbox.pending("claude-1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_confidence_is_malformed() {
        let (gateway, mailbox) = gateway();
        let mut envelope = to_gpt4("c1", MessageType::Query, "probably");
        envelope.content.metadata.confidence = Some(1.5);
        let raw = serde_json::to_string(&envelope).unwrap();

        let outcome = gateway.submit_json(&raw).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::MalformedEnvelope { .. })
        ));
        assert_eq!(gateway.audit().len().unwrap(), 1);
        assert!(mailbox.pending("gpt4-1").unwrap().is_empty());

        let record = gateway.audit().latest_for("c1").unwrap().unwrap();
        assert_eq!(record.disposition(), Disposition::RejectedMalformed);
    }

    #[tokio::test]
    async fn test_unparseable_json_is_audited() {
        let (gateway, _mailbox) = gateway();
        let outcome = gateway.submit_json("{not json").await.unwrap();
        assert!(matches!(
            outcome,
            DeliveryOutcome::Rejected { message_id: None, .. }
        ));
        assert_eq!(dispositions(&gateway), vec![Disposition::RejectedMalformed]);
    }

    #[tokio::test]
    async fn test_non_utf8_input_is_audited() {
        let (gateway, _mailbox) = gateway();
        let outcome = gateway.submit_bytes(&[0xff, 0xfe, b'{']).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::MalformedEnvelope { reason }) if reason.contains("UTF-8")
        ));
        assert_eq!(dispositions(&gateway), vec![Disposition::RejectedMalformed]);
    }

    #[tokio::test]
    async fn test_unsupported_major_version() {
        let (gateway, _mailbox) = gateway();
        let envelope = EnvelopeBuilder::from(claude())
            .to(Recipient::instance("gpt-4", "gpt4-1", "s1"))
            .message_type(MessageType::Query)
            .text("hi")
            .protocol_version("2.0")
            .build()
            .unwrap();
        let outcome = gateway.submit(envelope).await.unwrap();
        assert!(matches!(
            outcome.rejection(),
            Some(Rejection::MalformedEnvelope { reason }) if reason.contains("2.0")
        ));
    }

    #[tokio::test]
    async fn test_recover_pending_after_restart() {
        let audit = Arc::new(AuditLog::in_memory());
        let first = Gateway::builder(Settings::default())
            .audit(audit.clone())
            .transport(Arc::new(MailboxStore::new()))
            .build()
            .unwrap();
        first.register(AgentIdentity::new("gpt-4", "gpt4-1", "s1"));
        first
            .submit(to_gpt4("p5", MessageType::Proposal, "Share a cache?"))
            .await
            .unwrap();
        drop(first);

        let mailbox = Arc::new(MailboxStore::new());
        let second = Gateway::builder(Settings::default())
            .audit(audit)
            .transport(mailbox.clone())
            .build()
            .unwrap();
        second.register(AgentIdentity::new("gpt-4", "gpt4-1", "s1"));
        assert_eq!(second.recover_pending().unwrap(), 1);
        assert_eq!(second.recover_pending().unwrap(), 0);

        assert!(second.approve("p5", "alice", None).unwrap().is_delivered());
        assert!(mailbox.recv("gpt4-1", WAIT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_mailbox_defers_delivery_until_drained() {
        let mut settings = Settings::default();
        settings.delivery = DeliveryConfig {
            max_attempts: 10,
            backoff_ms: 5,
        };
        let mailbox = Arc::new(MailboxStore::new().with_max_size(2));
        let gateway = Gateway::builder(settings)
            .audit(Arc::new(AuditLog::in_memory()))
            .transport(mailbox.clone())
            .build()
            .unwrap();
        gateway.register(AgentIdentity::new("gpt-4", "gpt4-1", "s1"));

        for id in ["m1", "m2", "m3"] {
            let outcome = gateway
                .submit(to_gpt4(id, MessageType::Query, "ping"))
                .await
                .unwrap();
            assert!(outcome.is_delivered());
        }

        let mut received = Vec::new();
        while received.len() < 3 {
            let envelope = mailbox
                .recv("gpt4-1", WAIT)
                .await
                .unwrap()
                .expect("every delivered envelope reaches the inbox");
            mailbox.ack("gpt4-1", &envelope.message_id).unwrap();
            received.push(envelope.message_id);
        }
        received.sort();
        assert_eq!(received, vec!["m1", "m2", "m3"]);
        assert!(mailbox.stats("gpt4-1").unwrap().total_refused >= 1);
    }

    struct Flaky {
        failures_left: AtomicU32,
        inner: MailboxStore,
    }

    #[async_trait]
    impl Transport for Flaky {
        async fn deliver(&self, instance_id: &str, envelope: &Envelope) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::Transport("connection reset".to_string()));
            }
            self.inner.deliver(instance_id, envelope).await
        }
    }

    #[tokio::test]
    async fn test_delivery_retries_transient_failures() {
        let transport = Flaky {
            failures_left: AtomicU32::new(2),
            inner: MailboxStore::new(),
        };
        let policy = DeliveryConfig {
            max_attempts: 3,
            backoff_ms: 1,
        };
        let envelope = to_gpt4("t1", MessageType::Observation, "retry me");

        assert!(deliver_with_retry(&transport, "gpt4-1", &envelope, &policy).await);
        assert_eq!(transport.inner.pending("gpt4-1").unwrap().len(), 1);

        transport.failures_left.store(5, Ordering::SeqCst);
        let other = to_gpt4("t2", MessageType::Observation, "give up");
        assert!(!deliver_with_retry(&transport, "gpt4-1", &other, &policy).await);
    }
}
