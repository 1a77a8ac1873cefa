//! Safety gate: automated policy checks run before any human sees a message.
//!
//! Three independent checks (harmful content, coordination risk, deception)
//! are delegated to a pluggable [`Classifier`]. The gate never mutates the
//! envelope; its verdict is recorded in the audit log and stamped on the
//! delivered copy.

pub mod classifier;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::SafetyConfig;
use crate::error::{Rejection, Result};
use crate::protocol::{Envelope, SafetyRecord};

pub use classifier::{Classification, Classifier, HttpClassifier, KeywordClassifier};

/// Verdict of the safety gate for one envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetyResult {
    pub harmful_content: bool,
    pub coordination_risk: bool,
    pub deception_detected: bool,
    pub policy_version: String,
    pub classifier: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matched: Vec<String>,
    /// Classifier failure, when the check could not run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SafetyResult {
    /// No flag raised and the classifier answered.
    pub fn passed(&self) -> bool {
        self.record().is_clean() && self.error.is_none()
    }

    pub fn record(&self) -> SafetyRecord {
        SafetyRecord {
            harmful_content: self.harmful_content,
            coordination_risk: self.coordination_risk,
            deception_detected: self.deception_detected,
        }
    }

    /// Human-readable rejection reason, recorded verbatim in the audit log.
    pub fn reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(format!("classifier unavailable: {}", error));
        }

        let mut flags = Vec::new();
        if self.harmful_content {
            flags.push("harmful_content");
        }
        if self.coordination_risk {
            flags.push("coordination_risk");
        }
        if self.deception_detected {
            flags.push("deception_detected");
        }
        if flags.is_empty() {
            return None;
        }

        let mut reason = flags.join(", ");
        if !self.matched.is_empty() {
            reason.push_str(&format!(" (matched: {})", self.matched.join(", ")));
        }
        Some(reason)
    }

    pub fn rejection(&self) -> Option<Rejection> {
        self.reason().map(|reason| Rejection::SafetyRejected {
            harmful_content: self.harmful_content,
            coordination_risk: self.coordination_risk,
            deception_detected: self.deception_detected,
            reason,
        })
    }
}

/// Evaluates envelopes against the configured classifier.
#[derive(Clone)]
pub struct SafetyGate {
    classifier: Arc<dyn Classifier>,
    policy_version: String,
    fail_closed: bool,
}

impl SafetyGate {
    pub fn new(classifier: Arc<dyn Classifier>, policy_version: impl Into<String>) -> Self {
        Self {
            classifier,
            policy_version: policy_version.into(),
            fail_closed: true,
        }
    }

    /// Let messages through when the classifier is unreachable.
    pub fn fail_open(mut self) -> Self {
        self.fail_closed = false;
        self
    }

    /// Build the gate described by the safety settings.
    pub fn from_config(config: &SafetyConfig) -> Result<Self> {
        let classifier: Arc<dyn Classifier> = match &config.classifier_url {
            Some(url) => Arc::new(HttpClassifier::new(url.clone())?),
            None => Arc::new(KeywordClassifier::from_config(config)?),
        };

        let gate = Self::new(classifier, config.policy_version.clone());
        Ok(if config.fail_closed { gate } else { gate.fail_open() })
    }

    pub fn policy_version(&self) -> &str {
        &self.policy_version
    }

    /// Run all three checks. Pure with respect to the envelope.
    pub async fn evaluate(&self, envelope: &Envelope) -> SafetyResult {
        let text = classified_text(envelope);

        match self.classifier.classify(&text).await {
            Ok(verdict) => {
                tracing::debug!(
                    message_id = %envelope.message_id,
                    harmful = verdict.harmful,
                    coordination_risk = verdict.coordination_risk,
                    deceptive = verdict.deceptive,
                    "safety verdict"
                );
                SafetyResult {
                    harmful_content: verdict.harmful,
                    coordination_risk: verdict.coordination_risk,
                    deception_detected: verdict.deceptive,
                    policy_version: self.policy_version.clone(),
                    classifier: self.classifier.name().to_string(),
                    matched: verdict.matched,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!(message_id = %envelope.message_id, "classifier failed: {}", e);
                SafetyResult {
                    harmful_content: false,
                    coordination_risk: false,
                    deception_detected: false,
                    policy_version: self.policy_version.clone(),
                    classifier: self.classifier.name().to_string(),
                    matched: Vec::new(),
                    error: self.fail_closed.then(|| e.to_string()),
                }
            }
        }
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new(
            Arc::new(KeywordClassifier::default()),
            SafetyConfig::default().policy_version,
        )
    }
}

/// Message text plus the metadata fields a sender could hide instructions in.
fn classified_text(envelope: &Envelope) -> String {
    let metadata = &envelope.content.metadata;
    let mut text = envelope.content.text.clone();
    for extra in [&metadata.context, &metadata.intent].into_iter().flatten() {
        text.push('\n');
        text.push_str(extra);
    }
    text
}
