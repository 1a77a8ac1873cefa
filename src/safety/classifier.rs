//! Content classifiers feeding the safety gate.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::SafetyConfig;
use crate::error::{Error, Result};

/// Verdict for a piece of text.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    #[serde(default)]
    pub harmful: bool,
    #[serde(default)]
    pub coordination_risk: bool,
    #[serde(default)]
    pub deceptive: bool,
    /// Terms or labels that triggered a flag.
    #[serde(default)]
    pub matched: Vec<String>,
}

/// Content classification capability.
///
/// Implementations must be deterministic for a given text and policy.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classifier name, recorded with every verdict.
    fn name(&self) -> &str;

    async fn classify(&self, text: &str) -> Result<Classification>;
}

/// Case-insensitive substring matching against three keyword lists.
pub struct KeywordClassifier {
    harmful: Option<Regex>,
    coordination: Option<Regex>,
    deception: Option<Regex>,
}

impl KeywordClassifier {
    pub fn new(harmful: &[String], coordination: &[String], deception: &[String]) -> Result<Self> {
        Ok(Self {
            harmful: compile(harmful)?,
            coordination: compile(coordination)?,
            deception: compile(deception)?,
        })
    }

    pub fn from_config(config: &SafetyConfig) -> Result<Self> {
        Self::new(
            &config.harmful_keywords,
            &config.coordination_keywords,
            &config.deception_keywords,
        )
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let config = SafetyConfig::default();
        Self {
            harmful: compile(&config.harmful_keywords).ok().flatten(),
            coordination: compile(&config.coordination_keywords).ok().flatten(),
            deception: compile(&config.deception_keywords).ok().flatten(),
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn classify(&self, text: &str) -> Result<Classification> {
        let mut matched = Vec::new();
        let harmful = scan(self.harmful.as_ref(), text, &mut matched);
        let coordination_risk = scan(self.coordination.as_ref(), text, &mut matched);
        let deceptive = scan(self.deception.as_ref(), text, &mut matched);

        Ok(Classification {
            harmful,
            coordination_risk,
            deceptive,
            matched,
        })
    }
}

fn compile(keywords: &[String]) -> Result<Option<Regex>> {
    let alternatives: Vec<String> = keywords
        .iter()
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .map(regex::escape)
        .collect();

    if alternatives.is_empty() {
        return Ok(None);
    }

    Regex::new(&format!("(?i)(?:{})", alternatives.join("|")))
        .map(Some)
        .map_err(|e| Error::Config(format!("invalid safety keyword: {}", e)))
}

fn scan(pattern: Option<&Regex>, text: &str, matched: &mut Vec<String>) -> bool {
    let Some(re) = pattern else {
        return false;
    };

    let mut hit = false;
    for m in re.find_iter(text) {
        hit = true;
        let term = m.as_str().to_lowercase();
        if !matched.contains(&term) {
            matched.push(term);
        }
    }
    hit
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    text: &'a str,
}

/// Remote classification service: POST `{"text": ...}`, expects a `Classification`.
pub struct HttpClassifier {
    client: Client,
    url: String,
}

impl HttpClassifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Classifier(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    fn name(&self) -> &str {
        "http"
    }

    async fn classify(&self, text: &str) -> Result<Classification> {
        let response = self
            .client
            .post(&self.url)
            .json(&ClassifyRequest { text })
            .send()
            .await
            .map_err(|e| Error::Classifier(format!("{}: {}", self.url, e)))?;

        if !response.status().is_success() {
            return Err(Error::Classifier(format!(
                "{} returned {}",
                self.url,
                response.status()
            )));
        }

        response
            .json::<Classification>()
            .await
            .map_err(|e| Error::Classifier(format!("invalid verdict from {}: {}", self.url, e)))
    }
}
