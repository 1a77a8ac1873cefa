//! Append-only audit log.
//!
//! Every submission, accepted or rejected, produces exactly one record.
//! Records are never updated or deleted. The log is also the authority for
//! message-id uniqueness: an id is claimed by the first record whose
//! disposition settles it (see [`Disposition::claims_message_id`]).

pub mod memory;
pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{Error, Result};
use crate::oversight::OversightResult;
use crate::protocol::{Envelope, MessageType};
use crate::safety::SafetyResult;

pub use memory::MemoryAuditStore;
pub use sqlite::SqliteAuditStore;

/// Records fetched per page by [`AuditIter`].
const PAGE_SIZE: usize = 256;

/// Terminal outcome of a submission or approval event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Delivered,
    PendingApproval,
    RejectedMalformed,
    RejectedDuplicate,
    RejectedRateLimit,
    RejectedSafety,
    RejectedOversight,
    RejectedUnknownTarget,
}

impl Disposition {
    pub const ALL: [Disposition; 8] = [
        Disposition::Delivered,
        Disposition::PendingApproval,
        Disposition::RejectedMalformed,
        Disposition::RejectedDuplicate,
        Disposition::RejectedRateLimit,
        Disposition::RejectedSafety,
        Disposition::RejectedOversight,
        Disposition::RejectedUnknownTarget,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Delivered => "delivered",
            Disposition::PendingApproval => "pending_approval",
            Disposition::RejectedMalformed => "rejected_malformed",
            Disposition::RejectedDuplicate => "rejected_duplicate",
            Disposition::RejectedRateLimit => "rejected_rate_limit",
            Disposition::RejectedSafety => "rejected_safety",
            Disposition::RejectedOversight => "rejected_oversight",
            Disposition::RejectedUnknownTarget => "rejected_unknown_target",
        }
    }

    /// Whether a record with this disposition permanently takes its message id.
    pub fn claims_message_id(&self) -> bool {
        matches!(
            self,
            Disposition::Delivered
                | Disposition::RejectedSafety
                | Disposition::RejectedOversight
                | Disposition::RejectedUnknownTarget
        )
    }

    /// Whether a record with this disposition says anything about id ownership.
    fn tracks_message_id(&self) -> bool {
        self.claims_message_id() || *self == Disposition::PendingApproval
    }
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Disposition {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Disposition::ALL
            .iter()
            .copied()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| format!("Unknown disposition: {}", s))
    }
}

/// Gate outputs attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety: Option<SafetyResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oversight: Option<OversightResult>,
    /// Instance ids the envelope was routed to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
}

/// A record before the log assigns its sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub message_id: Option<String>,
    pub session_id: Option<String>,
    pub sender_instance: Option<String>,
    pub message_type: Option<MessageType>,
    pub disposition: Disposition,
    pub reason: Option<String>,
    pub gates: GateResults,
    /// Submitted envelope, or the raw input when it could not be parsed.
    pub payload: serde_json::Value,
}

impl AuditEntry {
    pub fn for_envelope(envelope: &Envelope, disposition: Disposition) -> Self {
        Self {
            message_id: Some(envelope.message_id.clone()),
            session_id: Some(envelope.sender.session_id.clone()),
            sender_instance: Some(envelope.sender.instance_id.clone()),
            message_type: Some(envelope.message_type),
            disposition,
            reason: None,
            gates: GateResults::default(),
            payload: serde_json::to_value(envelope).unwrap_or(serde_json::Value::Null),
        }
    }

    /// Entry for input that never became a valid envelope.
    ///
    /// Identifying fields are picked out of the raw JSON on a best-effort basis
    /// so the record still shows up in per-session queries.
    pub fn malformed(raw: &str, reason: impl Into<String>) -> Self {
        let payload = serde_json::from_str::<serde_json::Value>(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        let sender = payload.get("sender").or_else(|| payload.get("from"));
        let field = |value: Option<&serde_json::Value>, names: &[&str]| -> Option<String> {
            let value = value?;
            names
                .iter()
                .find_map(|n| value.get(*n).and_then(|v| v.as_str()))
                .map(str::to_string)
        };

        Self {
            message_id: field(Some(&payload), &["messageId", "message_id"]),
            session_id: field(sender, &["sessionId", "session_id"]),
            sender_instance: field(sender, &["instanceId", "instance_id"]),
            message_type: field(Some(&payload), &["messageType", "message_type"])
                .and_then(|t| t.parse().ok()),
            disposition: Disposition::RejectedMalformed,
            reason: Some(reason.into()),
            gates: GateResults::default(),
            payload,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_gates(mut self, gates: GateResults) -> Self {
        self.gates = gates;
        self
    }
}

/// A persisted audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the log; strictly increasing, starting at 1.
    pub sequence: u64,
    pub entry_id: String,
    pub recorded_at: DateTime<Utc>,
    #[serde(flatten)]
    pub entry: AuditEntry,
}

impl AuditRecord {
    fn new(sequence: u64, entry: AuditEntry) -> Self {
        Self {
            sequence,
            entry_id: ulid::Ulid::new().to_string(),
            recorded_at: now_millis(),
            entry,
        }
    }

    pub fn disposition(&self) -> Disposition {
        self.entry.disposition
    }

    /// Recover the submitted envelope, if the payload was one.
    pub fn envelope(&self) -> Option<Envelope> {
        serde_json::from_value(self.entry.payload.clone()).ok()
    }
}

/// Current time truncated to the millisecond precision the stores persist.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

/// Read-side selection criteria. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub session_id: Option<String>,
    pub message_id: Option<String>,
    pub disposition: Option<Disposition>,
    /// Inclusive lower bound on `recorded_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `recorded_at`.
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Default::default()
        }
    }

    pub fn disposition(disposition: Disposition) -> Self {
        Self {
            disposition: Some(disposition),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &AuditRecord) -> bool {
        let entry = &record.entry;
        self.session_id
            .as_ref()
            .map_or(true, |s| entry.session_id.as_ref() == Some(s))
            && self
                .message_id
                .as_ref()
                .map_or(true, |m| entry.message_id.as_ref() == Some(m))
            && self.disposition.map_or(true, |d| entry.disposition == d)
            && self.since.map_or(true, |t| record.recorded_at >= t)
            && self.until.map_or(true, |t| record.recorded_at < t)
    }
}

/// Storage backend for the audit log.
///
/// Implementations must serialize `insert` and make the record durable
/// before returning it.
pub trait AuditStore: Send + Sync {
    fn insert(&self, entry: AuditEntry) -> Result<AuditRecord>;

    /// Highest sequence number, 0 when empty.
    fn head(&self) -> Result<u64>;

    fn count(&self) -> Result<u64>;

    /// Matching records with `after < sequence <= upto`, ascending, at most `limit`.
    fn page(&self, filter: &AuditFilter, after: u64, upto: u64, limit: usize)
        -> Result<Vec<AuditRecord>>;

    /// All records carrying a message id, ascending.
    fn records_for(&self, message_id: &str) -> Result<Vec<AuditRecord>>;
}

/// Outcome of claiming a message id for a submission.
#[derive(Debug)]
pub enum IdClaim<'a> {
    /// Never seen before.
    Fresh(IdReservation<'a>),
    /// Resubmission of an envelope still waiting for approval.
    Resubmission(IdReservation<'a>),
    /// Already claimed, or claimed by a different sender.
    Duplicate,
}

/// Exclusive hold on a message id while its submission is evaluated.
/// Released when dropped.
#[derive(Debug)]
pub struct IdReservation<'a> {
    log: &'a AuditLog,
    message_id: String,
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        self.log
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.message_id);
    }
}

/// The gateway's audit log: a store plus the message-id uniqueness index.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    in_flight: Mutex<HashSet<String>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Volatile log, for tests and demos.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryAuditStore::new()))
    }

    /// SQLite-backed log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Arc::new(SqliteAuditStore::open(path)?)))
    }

    /// Durably append one record.
    pub fn append(&self, entry: AuditEntry) -> Result<AuditRecord> {
        let record = self.store.insert(entry)?;
        tracing::debug!(
            sequence = record.sequence,
            message_id = record.entry.message_id.as_deref().unwrap_or("-"),
            disposition = %record.entry.disposition,
            "audit record appended"
        );
        Ok(record)
    }

    /// Claim `message_id` for a submission from `sender_instance`.
    pub fn claim(&self, message_id: &str, sender_instance: &str) -> Result<IdClaim<'_>> {
        let Some(reservation) = self.reserve(message_id) else {
            return Ok(IdClaim::Duplicate);
        };

        let latest = self
            .store
            .records_for(message_id)?
            .into_iter()
            .rev()
            .find(|r| r.entry.disposition.tracks_message_id());

        Ok(match latest {
            None => IdClaim::Fresh(reservation),
            Some(r)
                if r.entry.disposition == Disposition::PendingApproval
                    && r.entry.sender_instance.as_deref() == Some(sender_instance) =>
            {
                IdClaim::Resubmission(reservation)
            }
            Some(_) => IdClaim::Duplicate,
        })
    }

    /// Hold `message_id` without consulting the log. `None` if already held.
    pub fn reserve(&self, message_id: &str) -> Option<IdReservation<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(message_id.to_string()) {
            return None;
        }
        Some(IdReservation {
            log: self,
            message_id: message_id.to_string(),
        })
    }

    /// Most recent record for a message id.
    pub fn latest_for(&self, message_id: &str) -> Result<Option<AuditRecord>> {
        Ok(self.store.records_for(message_id)?.pop())
    }

    pub fn len(&self) -> Result<u64> {
        self.store.count()
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Snapshot query: records appended after this call are never returned.
    pub fn query(&self, filter: AuditFilter) -> Result<AuditQuery> {
        Ok(AuditQuery {
            store: Arc::clone(&self.store),
            filter,
            upto: self.store.head()?,
            page_size: PAGE_SIZE,
        })
    }

    /// Envelopes whose latest tracked record is still `pending_approval`.
    pub fn pending_envelopes(&self) -> Result<Vec<(AuditRecord, Envelope)>> {
        let mut pending = Vec::new();
        let mut seen = HashSet::new();
        for record in self
            .query(AuditFilter::disposition(Disposition::PendingApproval))?
            .collect_all()?
            .into_iter()
            .rev()
        {
            let Some(message_id) = record.entry.message_id.clone() else {
                continue;
            };
            if !seen.insert(message_id.clone()) {
                continue;
            }
            let still_pending = self
                .store
                .records_for(&message_id)?
                .into_iter()
                .rev()
                .find(|r| r.entry.disposition.tracks_message_id())
                .is_some_and(|r| r.sequence == record.sequence);
            if still_pending {
                if let Some(envelope) = record.envelope() {
                    pending.push((record, envelope));
                }
            }
        }
        pending.sort_by_key(|(record, _)| record.sequence);
        Ok(pending)
    }
}

/// A pinned, restartable view of the log.
#[derive(Clone)]
pub struct AuditQuery {
    store: Arc<dyn AuditStore>,
    filter: AuditFilter,
    upto: u64,
    page_size: usize,
}

impl AuditQuery {
    /// Sequence number the snapshot was taken at.
    pub fn snapshot_head(&self) -> u64 {
        self.upto
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start a fresh lazy pass over the snapshot.
    pub fn iter(&self) -> AuditIter {
        AuditIter {
            store: Arc::clone(&self.store),
            filter: self.filter.clone(),
            upto: self.upto,
            after: 0,
            page_size: self.page_size,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn collect_all(&self) -> Result<Vec<AuditRecord>> {
        self.iter().collect()
    }
}

/// Lazy page-by-page iterator over an [`AuditQuery`].
pub struct AuditIter {
    store: Arc<dyn AuditStore>,
    filter: AuditFilter,
    upto: u64,
    after: u64,
    page_size: usize,
    buffer: VecDeque<AuditRecord>,
    exhausted: bool,
}

impl Iterator for AuditIter {
    type Item = Result<AuditRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self
                .store
                .page(&self.filter, self.after, self.upto, self.page_size)
            {
                Ok(page) => {
                    if page.len() < self.page_size {
                        self.exhausted = true;
                    }
                    if let Some(last) = page.last() {
                        self.after = last.sequence;
                    }
                    self.buffer.extend(page);
                }
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

pub(crate) fn corrupt(what: &str, e: impl fmt::Display) -> Error {
    Error::Audit(format!("corrupt {}: {}", what, e))
}
