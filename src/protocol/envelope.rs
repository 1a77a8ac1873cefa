//! Message envelopes: the unit of inter-agent communication.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    AgentIdentity, Content, MessageType, Metadata, OversightRecord, Recipient, SafetyRecord,
    BROADCAST_MARKER,
};
use crate::error::Rejection;

/// Protocol version stamped on envelopes created by this crate.
pub const PROTOCOL_VERSION: &str = "0.1";

/// Structured message exchanged between agent instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(alias = "protocol_version")]
    pub protocol_version: String,
    /// Creation time; informative only, not unique.
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Globally unique, immutable once assigned.
    #[serde(alias = "message_id")]
    pub message_id: String,
    #[serde(alias = "from")]
    pub sender: AgentIdentity,
    #[serde(alias = "to")]
    pub recipient: Recipient,
    #[serde(alias = "message_type")]
    pub message_type: MessageType,
    pub content: Content,
    #[serde(default, alias = "human_oversight")]
    pub oversight: OversightRecord,
    #[serde(default, alias = "safety_checks")]
    pub safety: SafetyRecord,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current time.
    pub fn new(
        sender: AgentIdentity,
        recipient: Recipient,
        message_type: MessageType,
        content: Content,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
            message_id: generate_id(),
            sender,
            recipient,
            message_type,
            content,
            oversight: OversightRecord::default(),
            safety: SafetyRecord::default(),
        }
    }

    /// Parse and validate a wire envelope.
    pub fn from_json(raw: &str) -> Result<Self, Rejection> {
        let envelope: Envelope = serde_json::from_str(raw).map_err(|e| malformed(e.to_string()))?;
        envelope.validate()?;
        Ok(envelope)
    }

    /// Check structural well-formedness.
    pub fn validate(&self) -> Result<(), Rejection> {
        if !is_valid_version(&self.protocol_version) {
            return Err(malformed(format!(
                "protocolVersion '{}' is not a semantic version",
                self.protocol_version
            )));
        }

        if self.message_id.trim().is_empty() {
            return Err(malformed("messageId is empty"));
        }
        if self.message_id.chars().any(char::is_whitespace) {
            return Err(malformed("messageId contains whitespace"));
        }

        require("sender.modelIdentity", &self.sender.model_identity)?;
        require("sender.instanceId", &self.sender.instance_id)?;
        require("sender.sessionId", &self.sender.session_id)?;
        if self.sender.instance_id == BROADCAST_MARKER {
            return Err(malformed("sender.instanceId cannot be the broadcast marker"));
        }

        require("recipient.sessionId", &self.recipient.session_id)?;
        if let Some(instance_id) = self.recipient.target.instance_id() {
            require("recipient.instanceId", instance_id)?;
            require("recipient.modelIdentity", &self.recipient.model_identity)?;
        }

        require("content.text", &self.content.text)?;

        if let Some(confidence) = self.content.metadata.confidence {
            if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
                return Err(malformed(format!(
                    "content.metadata.confidence {} is outside [0.0, 1.0]",
                    confidence
                )));
            }
        }

        Ok(())
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_broadcast()
    }

    /// Copy carrying gate results. Content is never touched.
    pub fn stamped(&self, safety: SafetyRecord, oversight: OversightRecord) -> Self {
        Self {
            safety,
            oversight,
            ..self.clone()
        }
    }

    /// Create a response addressed back to this envelope's sender.
    pub fn create_response(&self, from: AgentIdentity, text: impl Into<String>) -> Self {
        let mut metadata = Metadata {
            context: self.content.metadata.context.clone(),
            ..Default::default()
        };
        metadata.extra.insert(
            "inReplyTo".to_string(),
            serde_json::Value::String(self.message_id.clone()),
        );

        Envelope::new(
            from,
            Recipient::from(&self.sender),
            MessageType::Response,
            Content {
                text: text.into(),
                metadata,
            },
        )
    }
}

/// Builder for creating envelopes with fluent API.
pub struct EnvelopeBuilder {
    sender: AgentIdentity,
    recipient: Option<Recipient>,
    message_type: Option<MessageType>,
    text: Option<String>,
    metadata: Metadata,
    message_id: Option<String>,
    protocol_version: String,
    oversight: OversightRecord,
}

impl EnvelopeBuilder {
    /// Start building an envelope from an agent instance.
    pub fn from(sender: AgentIdentity) -> Self {
        Self {
            sender,
            recipient: None,
            message_type: None,
            text: None,
            metadata: Metadata::default(),
            message_id: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
            oversight: OversightRecord::default(),
        }
    }

    /// Address a single instance.
    pub fn to(mut self, recipient: Recipient) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Address every other registered session.
    pub fn broadcast(mut self) -> Self {
        self.recipient = Some(Recipient::broadcast(self.sender.session_id.clone()));
        self
    }

    pub fn message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.metadata.context = Some(context.into());
        self
    }

    pub fn intent(mut self, intent: impl Into<String>) -> Self {
        self.metadata.intent = Some(intent.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.metadata.confidence = Some(confidence);
        self
    }

    /// Use a caller-chosen id instead of a fresh UUID.
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Attach a sender-side approval record.
    pub fn approved_by(mut self, approver_id: impl Into<String>) -> Self {
        self.oversight = OversightRecord {
            approved: true,
            approver_id: Some(approver_id.into()),
            notes: None,
        };
        self
    }

    /// Build and validate the envelope.
    pub fn build(self) -> Result<Envelope, Rejection> {
        let recipient = self.recipient.ok_or_else(|| malformed("recipient is required"))?;
        let message_type = self
            .message_type
            .ok_or_else(|| malformed("messageType is required"))?;
        let text = self.text.ok_or_else(|| malformed("content.text is required"))?;

        let envelope = Envelope {
            protocol_version: self.protocol_version,
            timestamp: Utc::now(),
            message_id: self.message_id.unwrap_or_else(generate_id),
            sender: self.sender,
            recipient,
            message_type,
            content: Content {
                text,
                metadata: self.metadata,
            },
            oversight: self.oversight,
            safety: SafetyRecord::default(),
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn malformed(reason: impl Into<String>) -> Rejection {
    Rejection::MalformedEnvelope {
        reason: reason.into(),
    }
}

fn require(field: &str, value: &str) -> Result<(), Rejection> {
    if value.trim().is_empty() {
        Err(malformed(format!("{} is required", field)))
    } else {
        Ok(())
    }
}

/// Accepts `MAJOR`, `MAJOR.MINOR` or `MAJOR.MINOR.PATCH` with an optional pre-release suffix.
fn is_valid_version(version: &str) -> bool {
    let core = version.split_once('-').map_or(version, |(core, _)| core);
    let parts: Vec<&str> = core.split('.').collect();
    (1..=3).contains(&parts.len())
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// Timestamps are written as RFC 3339; offset-less input is read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&ts.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Utc.from_utc_datetime(&naive))
            .map_err(|e| de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
    }
}
