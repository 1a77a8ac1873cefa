//! Wire types for the Inter-AI Communication Protocol.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recipient instance id that addresses every registered session but the sender.
pub const BROADCAST_MARKER: &str = "*";

/// Alternate spelling of the broadcast marker accepted on input.
const BROADCAST_ALIAS: &str = "broadcast";

/// Message type classification. The set is closed: unknown values are rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Question addressed to another agent
    Query,
    /// Answer to a query
    Response,
    /// Unsolicited observation or report
    Observation,
    /// Proposed joint action; always needs human approval
    Proposal,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Query => "query",
            MessageType::Response => "response",
            MessageType::Observation => "observation",
            MessageType::Proposal => "proposal",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(MessageType::Query),
            "response" => Ok(MessageType::Response),
            "observation" => Ok(MessageType::Observation),
            "proposal" => Ok(MessageType::Proposal),
            _ => Err(format!("Unknown message type: {}", s)),
        }
    }
}

/// Identity of a running agent instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AgentIdentity {
    /// Model family, e.g. "claude-sonnet-4.5"
    #[serde(alias = "model")]
    pub model_identity: String,
    /// Unique per running instance
    #[serde(alias = "instance_id")]
    pub instance_id: String,
    /// Conversation scope
    #[serde(alias = "session_id")]
    pub session_id: String,
}

impl AgentIdentity {
    pub fn new(
        model_identity: impl Into<String>,
        instance_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            model_identity: model_identity.into(),
            instance_id: instance_id.into(),
            session_id: session_id.into(),
        }
    }
}

/// Addressed instance: one registered instance or a broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Target {
    Instance(String),
    Broadcast,
}

impl Target {
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Target::Broadcast)
    }

    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Target::Instance(id) => Some(id),
            Target::Broadcast => None,
        }
    }
}

impl From<String> for Target {
    fn from(value: String) -> Self {
        if value == BROADCAST_MARKER || value.eq_ignore_ascii_case(BROADCAST_ALIAS) {
            Target::Broadcast
        } else {
            Target::Instance(value)
        }
    }
}

impl From<Target> for String {
    fn from(value: Target) -> Self {
        match value {
            Target::Instance(id) => id,
            Target::Broadcast => BROADCAST_MARKER.to_string(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Instance(id) => f.write_str(id),
            Target::Broadcast => f.write_str(BROADCAST_MARKER),
        }
    }
}

/// Recipient address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Recipient {
    #[serde(default, alias = "model")]
    pub model_identity: String,
    #[serde(rename = "instanceId", alias = "instance_id")]
    pub target: Target,
    #[serde(alias = "session_id")]
    pub session_id: String,
}

impl Recipient {
    /// Address a single instance.
    pub fn instance(
        model_identity: impl Into<String>,
        instance_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            model_identity: model_identity.into(),
            target: Target::from(instance_id.into()),
            session_id: session_id.into(),
        }
    }

    /// Address every registered session except the sender.
    pub fn broadcast(session_id: impl Into<String>) -> Self {
        Self {
            model_identity: String::new(),
            target: Target::Broadcast,
            session_id: session_id.into(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target.is_broadcast()
    }
}

impl From<&AgentIdentity> for Recipient {
    fn from(identity: &AgentIdentity) -> Self {
        Recipient::instance(
            identity.model_identity.clone(),
            identity.instance_id.clone(),
            identity.session_id.clone(),
        )
    }
}

/// Free-form metadata carried next to the message text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Sender's confidence, within [0.0, 1.0]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Keys outside the schema are preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Content {
    pub text: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Content {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            metadata: Metadata::default(),
        }
    }
}

/// Human oversight record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OversightRecord {
    #[serde(default)]
    pub approved: bool,
    #[serde(default, alias = "approver_id", skip_serializing_if = "Option::is_none")]
    pub approver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Safety flags. All false until the safety gate has evaluated the envelope.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRecord {
    #[serde(default, alias = "harmful_content")]
    pub harmful_content: bool,
    #[serde(default, alias = "coordination_risk")]
    pub coordination_risk: bool,
    #[serde(default, alias = "deception_detected")]
    pub deception_detected: bool,
}

impl SafetyRecord {
    pub fn is_clean(&self) -> bool {
        !(self.harmful_content || self.coordination_risk || self.deception_detected)
    }
}
